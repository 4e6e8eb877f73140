//! Stream transports: TCP and Unix-domain sockets.
//!
//! Packets are length-delimited frames (4-byte big-endian length prefix).

use super::{bind_tcp, ListenerHandle};
use crate::connection::{Conn, Writer};
use crate::error::ServerError;
use crate::network::resolve;
use crate::server::Server;
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub(crate) async fn serve_tcp(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    let network = server.network();
    let socket_addr = resolve(addr, network).await?;
    let listener = TcpListener::from_std(bind_tcp(socket_addr, network)?)?;
    let local_addr = listener.local_addr()?;
    let token = CancellationToken::new();
    let task = tokio::spawn(accept_tcp(server.clone(), listener, token.clone()));
    Ok(ListenerHandle::new(Some(local_addr), token, None, task))
}

async fn accept_tcp(server: Server, listener: TcpListener, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    spawn_session(&server, stream, peer.to_string(), Some(peer), &token);
                }
                Err(e) if is_transient_accept_error(e.kind()) => {
                    warn!(error = %e, "accept failed, continuing");
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    server.listener_failed(e.into()).await;
                    break;
                }
            }
        }
    }
    debug!("tcp accept loop exited");
}

fn is_transient_accept_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

#[cfg(unix)]
pub(crate) async fn serve_unix(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    use std::os::unix::fs::FileTypeExt;
    use tokio::net::UnixListener;

    if let Ok(meta) = std::fs::symlink_metadata(addr) {
        if meta.file_type().is_socket() {
            std::fs::remove_file(addr)?;
        }
    }
    let listener = UnixListener::bind(addr).map_err(|e| ServerError::Network(format!("bind {addr} failed: {e}")))?;
    let token = CancellationToken::new();
    let path = addr.to_string();
    let srv = server.clone();
    let accept_token = token.clone();
    let task = tokio::spawn(async move {
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                _ = accept_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let id = format!("{path}#{seq}");
                        seq += 1;
                        spawn_session(&srv, stream, id, None, &accept_token);
                    }
                    Err(e) if is_transient_accept_error(e.kind()) => {
                        warn!(error = %e, "accept failed, continuing");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        srv.listener_failed(e.into()).await;
                        break;
                    }
                }
            }
        }
        std::fs::remove_file(&path).ok();
        debug!("unix accept loop exited");
    });
    Ok(ListenerHandle::new(None, token, None, task))
}

#[cfg(not(unix))]
pub(crate) async fn serve_unix(_server: &Server, _addr: &str) -> Result<ListenerHandle, ServerError> {
    Err(ServerError::UnsupportedNetwork("unix".into()))
}

/// Wraps an accepted stream in a connection and spawns its reader and writer.
fn spawn_session<S>(
    server: &Server,
    stream: S,
    id: String,
    remote: Option<SocketAddr>,
    listener: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(server.settings().write_queue_depth);
    let conn = Conn::new(id, server.network(), remote, Writer::Channel(tx));
    server.connection_opened(&conn);

    tokio::spawn(write_frames(
        FramedWrite::new(write_half, LengthDelimitedCodec::new()),
        rx,
        conn.token().clone(),
    ));
    tokio::spawn(read_frames(
        server.clone(),
        conn,
        FramedRead::new(read_half, LengthDelimitedCodec::new()),
        listener.clone(),
    ));
}

/// Drains a connection's outbound queue into `sink` until the connection is
/// closed. Packets queued before the close are still flushed.
pub(crate) async fn write_frames<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) where
    W: Sink<Bytes> + Unpin,
    W::Error: Display,
{
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(packet) => {
                    if let Err(e) = sink.send(packet).await {
                        debug!(error = %e, "write failed");
                        token.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = token.cancelled() => break,
        }
    }
    sink.close().await.ok();
}

/// Pushes every inbound frame into the pipeline until the session ends, then
/// reports the connection as closed.
pub(crate) async fn read_frames<R>(
    server: Server,
    conn: Arc<Conn>,
    mut frames: FramedRead<R, LengthDelimitedCodec>,
    listener: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = conn.token().cancelled() => break None,
            _ = listener.cancelled() => break None,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = server.push_packet(&conn, frame.freeze(), None).await {
                        break Some(e);
                    }
                }
                Some(Err(e)) => break Some(ServerError::from(e)),
                None => break None,
            }
        }
    };
    server.connection_closed(&conn, reason);
}
