//! Datagram transport (UDP).
//!
//! There is no handshake: the first datagram from a peer address opens a
//! connection for it, and every datagram is one packet. Writes go straight
//! back to the peer on the listener's socket. A peer that stays silent for
//! the configured idle timeout is closed and forgotten; its next datagram
//! opens a fresh connection.

use super::{bind_udp, ListenerHandle};
use crate::connection::{Conn, Writer};
use crate::error::ServerError;
use crate::network::resolve;
use crate::server::Server;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const MAX_DATAGRAM_SIZE: usize = 65_536;

/// A peer's connection and the time its last datagram arrived.
struct Peer {
    conn: Arc<Conn>,
    last_seen: Mutex<Instant>,
}

impl Peer {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type Peers = Arc<DashMap<SocketAddr, Arc<Peer>>>;

pub(crate) async fn serve(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    let network = server.network();
    let socket_addr = resolve(addr, network).await?;
    let socket = Arc::new(UdpSocket::from_std(bind_udp(socket_addr, network)?)?);
    let local_addr = socket.local_addr()?;
    let token = CancellationToken::new();
    let task = tokio::spawn(receive_loop(server.clone(), socket, token.clone()));
    Ok(ListenerHandle::new(Some(local_addr), token, None, task))
}

async fn receive_loop(server: Server, socket: Arc<UdpSocket>, token: CancellationToken) {
    let peers: Peers = Arc::new(DashMap::new());
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    let conn = peer_conn(&server, &socket, &peers, peer);
                    let packet = Bytes::copy_from_slice(&buf[..len]);
                    if let Err(e) = server.push_packet(&conn, packet, None).await {
                        debug!(error = %e, "datagram dropped");
                        if matches!(e, ServerError::PipelineClosed) {
                            break;
                        }
                    }
                }
                // ICMP unreachable replies surface as read errors on some platforms.
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                    debug!(error = %e, "ignoring datagram socket error");
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive datagram");
                    server.listener_failed(e.into()).await;
                    break;
                }
            }
        }
    }

    let open: Vec<Arc<Peer>> = peers.iter().map(|entry| entry.value().clone()).collect();
    peers.clear();
    for peer in open {
        server.connection_closed(&peer.conn, None);
    }
    debug!("datagram receive loop exited");
}

/// Returns the live connection for `peer`, opening one on first contact.
fn peer_conn(server: &Server, socket: &Arc<UdpSocket>, peers: &Peers, peer: SocketAddr) -> Arc<Conn> {
    if let Some(known) = peers.get(&peer) {
        if !known.conn.is_closed() {
            known.touch();
            return known.conn.clone();
        }
    }

    let conn = Conn::new(
        peer.to_string(),
        server.network(),
        Some(peer),
        Writer::Datagram {
            socket: socket.clone(),
            peer,
        },
    );
    let entry = Arc::new(Peer {
        conn: conn.clone(),
        last_seen: Mutex::new(Instant::now()),
    });
    peers.insert(peer, entry.clone());
    server.connection_opened(&conn);

    tokio::spawn(watch_peer(
        server.clone(),
        peers.clone(),
        peer,
        entry,
        server.settings().datagram_idle_timeout,
    ));

    conn
}

/// Forgets `peer` once its connection is closed or has been idle for `idle`.
async fn watch_peer(server: Server, peers: Peers, addr: SocketAddr, peer: Arc<Peer>, idle: Duration) {
    let reason = loop {
        let deadline = peer.last_seen() + idle;
        tokio::select! {
            _ = peer.conn.token().cancelled() => break None,
            _ = sleep_until(deadline) => {
                if peer.last_seen() + idle <= Instant::now() {
                    break Some(ServerError::Network(format!("datagram peer idle for {idle:?}")));
                }
            }
        }
    };

    peers.remove_if(&addr, |_, current| Arc::ptr_eq(current, &peer));
    if reason.is_some() && !server.settings().prod {
        debug!(peer = %addr, "datagram peer expired");
    }
    server.connection_closed(&peer.conn, reason);
}
