//! RPC transport.
//!
//! The server binds the listener and owns its lifetime; the protocol itself
//! is provided by an [`RpcService`], typically a thin adapter over an RPC
//! framework's server.

use super::{bind_tcp, ListenerHandle};
use crate::error::ServerError;
use crate::network::{resolve, Network};
use crate::server::Server;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A service served on the `rpc` network.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Serves connections from `listener` until `shutdown` is cancelled,
    /// then finishes in-flight calls and returns.
    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError>;
}

pub(crate) async fn serve(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    let service = server.rpc_service()?;
    let socket_addr = resolve(addr, Network::Rpc).await?;
    let listener = TcpListener::from_std(bind_tcp(socket_addr, Network::Tcp)?)?;
    let local_addr = listener.local_addr()?;
    let token = CancellationToken::new();

    let srv = server.clone();
    let shutdown = token.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = service.serve(listener, shutdown).await {
            error!(error = %e, "rpc service failed");
            srv.listener_failed(e).await;
        }
    });
    Ok(ListenerHandle::new(Some(local_addr), token, None, task))
}
