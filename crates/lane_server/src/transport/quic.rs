//! Reliable-UDP transport over QUIC.
//!
//! Each QUIC connection carries one bidirectional stream opened by the
//! client; packets on it are length-delimited frames, as on TCP.

use super::stream::{read_frames, write_frames};
use super::{tls, ListenerHandle};
use crate::connection::{Conn, Writer};
use crate::error::ServerError;
use crate::network::{resolve, Network};
use crate::server::Server;
use quinn::{Endpoint, Incoming, VarInt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn serve(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    let socket_addr = resolve(addr, Network::Quic).await?;
    let config = tls::quic_server_config(server.settings().tls.as_ref())?;
    let endpoint = Endpoint::server(config, socket_addr)
        .map_err(|e| ServerError::Network(format!("bind {socket_addr} failed: {e}")))?;
    let local_addr = endpoint.local_addr()?;
    let token = CancellationToken::new();
    let task = tokio::spawn(accept_loop(server.clone(), endpoint, token.clone()));
    Ok(ListenerHandle::new(Some(local_addr), token, None, task))
}

async fn accept_loop(server: Server, endpoint: Endpoint, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => {
                    tokio::spawn(session(server.clone(), incoming, token.clone()));
                }
                None => break,
            }
        }
    }
    endpoint.close(VarInt::from_u32(0), b"shutdown");
    debug!("quic accept loop exited");
}

async fn session(server: Server, incoming: Incoming, listener: CancellationToken) {
    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(e) => {
            debug!(error = %e, "quic handshake failed");
            return;
        }
    };
    let remote = connection.remote_address();
    let (send, recv) = match connection.accept_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            debug!(peer = %remote, error = %e, "quic connection closed before opening a stream");
            return;
        }
    };

    let (tx, rx) = mpsc::channel(server.settings().write_queue_depth);
    let conn = Conn::new(remote.to_string(), Network::Quic, Some(remote), Writer::Channel(tx));
    server.connection_opened(&conn);

    tokio::spawn(write_frames(
        FramedWrite::new(send, LengthDelimitedCodec::new()),
        rx,
        conn.token().clone(),
    ));
    read_frames(
        server,
        conn,
        FramedRead::new(recv, LengthDelimitedCodec::new()),
        listener,
    )
    .await;
    connection.close(VarInt::from_u32(0), b"closed");
}
