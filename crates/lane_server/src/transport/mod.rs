//! Transport listeners.
//!
//! Every listener does the same job for its network: accept, wrap the
//! session in a [`Conn`](crate::Conn), fire the opened hook, and feed every
//! inbound packet into the pipeline until the session ends. Listener-level
//! failures after start-up are routed into shutdown through
//! `Server::listener_failed`.

pub(crate) mod datagram;
pub(crate) mod http;
pub(crate) mod quic;
pub mod rpc;
pub(crate) mod stream;
pub(crate) mod tls;
pub mod websocket;

use crate::error::ServerError;
use crate::network::{proto_addr, AddressFamily, Network};
use crate::server::Server;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Control handle of a running listener.
pub(crate) struct ListenerHandle {
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
    http: Option<axum_server::Handle>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(
        local_addr: Option<SocketAddr>,
        token: CancellationToken,
        http: Option<axum_server::Handle>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_addr,
            token,
            http,
            task,
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting, ends the listener's sessions and waits for the
    /// listener task. With a deadline the task is aborted once it expires.
    pub(crate) async fn stop(self, deadline: Option<Duration>) -> Result<(), ServerError> {
        self.token.cancel();
        if let Some(handle) = &self.http {
            handle.graceful_shutdown(deadline);
        }

        let abort = self.task.abort_handle();
        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, self.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(ServerError::Network(format!(
                        "listener did not stop within {deadline:?}"
                    )));
                }
            },
            None => self.task.await,
        };
        joined.map_err(|e| ServerError::Internal(format!("listener task failed: {e}")))
    }
}

/// Starts the listener matching the server's network.
pub(crate) async fn start(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    let network = server.network();
    let handle = match network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => stream::serve_tcp(server, addr).await?,
        Network::Unix => stream::serve_unix(server, addr).await?,
        Network::Udp | Network::Udp4 | Network::Udp6 => datagram::serve(server, addr).await?,
        Network::Quic => quic::serve(server, addr).await?,
        Network::Websocket => websocket::serve(server, addr).await?,
        Network::Http => http::serve(server, addr).await?,
        Network::Rpc => rpc::serve(server, addr).await?,
    };
    if !server.is_prod() {
        info!(
            local_addr = ?handle.local_addr(),
            "✅ Listener bound on {}",
            proto_addr(network, addr)
        );
    }
    Ok(handle)
}

fn new_socket(addr: SocketAddr, network: Network, kind: Type, protocol: Protocol) -> Result<Socket, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), kind, Some(protocol))
        .map_err(|e| ServerError::Network(format!("socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();
    if addr.is_ipv6() {
        socket
            .set_only_v6(network.family() == AddressFamily::V6)
            .map_err(|e| ServerError::Network(format!("setting IPV6_V6ONLY failed: {e}")))?;
    }
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Network(format!("bind {addr} failed: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::Network(format!("setting non-blocking mode failed: {e}")))?;
    Ok(socket)
}

/// Binds a listening TCP socket. IPv6 wildcard binds accept IPv4 too unless
/// the network is IPv6-only.
pub(crate) fn bind_tcp(addr: SocketAddr, network: Network) -> Result<std::net::TcpListener, ServerError> {
    let socket = new_socket(addr, network, Type::STREAM, Protocol::TCP)?;
    socket
        .listen(1024)
        .map_err(|e| ServerError::Network(format!("listen on {addr} failed: {e}")))?;
    Ok(socket.into())
}

pub(crate) fn bind_udp(addr: SocketAddr, network: Network) -> Result<std::net::UdpSocket, ServerError> {
    Ok(new_socket(addr, network, Type::DGRAM, Protocol::UDP)?.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_tcp_reports_address_in_use() {
        let first = bind_tcp("127.0.0.1:0".parse().unwrap(), Network::Tcp4).unwrap();
        let taken = first.local_addr().unwrap();
        let err = bind_tcp(taken, Network::Tcp4).unwrap_err();
        assert!(matches!(err, ServerError::Network(message) if message.contains("bind")));
    }

    #[test]
    fn test_bind_udp_ephemeral() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap(), Network::Udp4).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_waits_for_listener_task() {
        let token = CancellationToken::new();
        let watched = token.clone();
        let task = tokio::spawn(async move { watched.cancelled().await });
        let handle = ListenerHandle::new(None, token, None, task);
        handle.stop(Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_deadline_expires() {
        let task = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(30)).await });
        let handle = ListenerHandle::new(None, CancellationToken::new(), None, task);
        let err = handle.stop(Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, ServerError::Network(_)));
    }
}
