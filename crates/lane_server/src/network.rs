//! Network kinds and listen address handling.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// The transport a server listens on.
///
/// Stream and datagram kinds come in dual-stack, IPv4-only and IPv6-only
/// flavours. `Quic` is the reliable-UDP transport. `Http` and `Rpc` bypass
/// the shard pipeline entirely and are served by their own stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    Udp,
    Udp4,
    Udp6,
    Quic,
    Websocket,
    Http,
    Rpc,
}

/// Address family constraint derived from a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressFamily {
    Dual,
    V4,
    V6,
}

impl Network {
    pub const ALL: [Network; 11] = [
        Network::Tcp,
        Network::Tcp4,
        Network::Tcp6,
        Network::Unix,
        Network::Udp,
        Network::Udp4,
        Network::Udp6,
        Network::Quic,
        Network::Websocket,
        Network::Http,
        Network::Rpc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Quic => "quic",
            Network::Websocket => "websocket",
            Network::Http => "http",
            Network::Rpc => "rpc",
        }
    }

    /// Whether inbound traffic flows through the pool and shard queues.
    pub fn uses_pipeline(&self) -> bool {
        !matches!(self, Network::Http | Network::Rpc)
    }

    /// Whether TLS material configured on the server applies to this network.
    pub fn supports_tls(&self) -> bool {
        matches!(self, Network::Http | Network::Websocket | Network::Quic)
    }

    pub(crate) fn family(&self) -> AddressFamily {
        match self {
            Network::Tcp4 | Network::Udp4 => AddressFamily::V4,
            Network::Tcp6 | Network::Udp6 => AddressFamily::V6,
            _ => AddressFamily::Dual,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::ALL
            .iter()
            .copied()
            .find(|network| network.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ServerError::UnsupportedNetwork(s.to_string()))
    }
}

/// Builds the canonical `<kind>://<address>` form used in logs.
pub fn proto_addr(network: Network, addr: &str) -> String {
    format!("{network}://{addr}")
}

/// Splits a WebSocket listen address into `host:port` and the URL path.
///
/// `":8888/ws"` becomes `(":8888", "/ws")`; an address without a path
/// serves on `/`.
pub fn split_websocket_addr(addr: &str) -> (String, String) {
    match addr.find('/') {
        Some(index) => (addr[..index].to_string(), addr[index..].to_string()),
        None => (addr.to_string(), "/".to_string()),
    }
}

/// Expands a host-less `":port"` address to the wildcard host of the family.
pub(crate) fn expand_wildcard(addr: &str, family: AddressFamily) -> String {
    if !addr.starts_with(':') {
        return addr.to_string();
    }
    match family {
        AddressFamily::V4 => format!("0.0.0.0{addr}"),
        AddressFamily::V6 | AddressFamily::Dual => format!("[::]{addr}"),
    }
}

/// Resolves a listen address, honouring the network's address family.
pub(crate) async fn resolve(addr: &str, network: Network) -> Result<SocketAddr, ServerError> {
    let family = network.family();
    let expanded = expand_wildcard(addr, family);
    let candidates = tokio::net::lookup_host(expanded)
        .await
        .map_err(|e| ServerError::InvalidAddress {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;

    candidates
        .into_iter()
        .find(|candidate| match family {
            AddressFamily::V4 => candidate.is_ipv4(),
            AddressFamily::V6 => candidate.is_ipv6(),
            AddressFamily::Dual => true,
        })
        .ok_or_else(|| ServerError::InvalidAddress {
            address: addr.to_string(),
            reason: format!("no address matching network {network}"),
        })
}
