//! HTTP transport. Routing is left to the embedded `axum` router.

use super::{bind_tcp, tls, ListenerHandle};
use crate::error::ServerError;
use crate::network::{resolve, Network};
use crate::server::Server;
use axum::Router;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub(crate) async fn serve(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    let router = server.take_http_router().unwrap_or_default();
    let socket_addr = resolve(addr, Network::Http).await?;
    let listener = bind_tcp(socket_addr, Network::Http)?;
    serve_router(server, router, listener, CancellationToken::new()).await
}

/// Serves `router` on an already bound listener, over TLS when configured.
pub(crate) async fn serve_router(
    server: &Server,
    router: Router,
    listener: std::net::TcpListener,
    token: CancellationToken,
) -> Result<ListenerHandle, ServerError> {
    let local_addr = listener.local_addr()?;
    let tls = match &server.settings().tls {
        Some(settings) => Some(tls::axum_config(settings).await?),
        None => None,
    };
    let handle = axum_server::Handle::new();
    let app = router.into_make_service_with_connect_info::<SocketAddr>();

    let srv = server.clone();
    let serve_handle = handle.clone();
    let task = tokio::spawn(async move {
        let served = match tls {
            Some(config) => {
                axum_server::from_tcp_rustls(listener, config)
                    .handle(serve_handle)
                    .serve(app)
                    .await
            }
            None => axum_server::from_tcp(listener).handle(serve_handle).serve(app).await,
        };
        if let Err(e) = served {
            error!(network = %srv.network(), error = %e, "Failed to serve http");
            srv.listener_failed(e.into()).await;
        }
    });

    Ok(ListenerHandle::new(Some(local_addr), token, Some(handle), task))
}
