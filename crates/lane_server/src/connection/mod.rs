//! Transport-agnostic connection handle.
//!
//! A [`Conn`] wraps exactly one transport session. Writes are handed off
//! without awaiting: stream, QUIC and WebSocket sessions own a writer task fed
//! through a bounded channel, datagram sessions send straight on the shared
//! socket. A write that finds the channel full is dropped and reported as
//! [`ServerError::WriteQueueFull`], so a peer that stops reading cannot grow
//! the server's memory. Once [`Conn::close`] has run the writer is gone and
//! every write fails with [`ServerError::ConnectionClosed`].

use crate::error::ServerError;
use crate::network::Network;
use bytes::Bytes;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Value stored in a connection's attribute bag.
pub type ConnData = Arc<dyn Any + Send + Sync>;

/// The send primitive of a connection.
pub(crate) enum Writer {
    /// Frames consumed by a per-connection writer task.
    Channel(mpsc::Sender<Bytes>),
    /// Datagrams sent directly to the peer on the listener's socket.
    Datagram {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

pub struct Conn {
    id: String,
    network: Network,
    remote_addr: Option<SocketAddr>,
    writer: Mutex<Option<Writer>>,
    data: DashMap<String, ConnData>,
    token: CancellationToken,
    closed_reported: AtomicBool,
}

impl Conn {
    pub(crate) fn new(
        id: impl Into<String>,
        network: Network,
        remote_addr: Option<SocketAddr>,
        writer: Writer,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            network,
            remote_addr,
            writer: Mutex::new(Some(writer)),
            data: DashMap::new(),
            token: CancellationToken::new(),
            closed_reported: AtomicBool::new(false),
        })
    }

    /// Transport-derived identity, usually the peer address.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Sends one packet to the peer.
    ///
    /// Stream and QUIC packets are length-prefixed by the writer task;
    /// WebSocket packets go out as one frame of the configured write type.
    pub fn write(&self, packet: &[u8]) -> Result<(), ServerError> {
        self.write_bytes(Bytes::copy_from_slice(packet))
    }

    /// Like [`write`](Self::write) without copying an owned buffer.
    pub fn write_bytes(&self, packet: Bytes) -> Result<(), ServerError> {
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match writer.as_ref() {
            None => Err(ServerError::ConnectionClosed(self.id.clone())),
            Some(Writer::Channel(tx)) => tx.try_send(packet).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ServerError::WriteQueueFull(self.id.clone()),
                mpsc::error::TrySendError::Closed(_) => ServerError::ConnectionClosed(self.id.clone()),
            }),
            Some(Writer::Datagram { socket, peer }) => {
                socket.try_send_to(&packet, *peer)?;
                Ok(())
            }
        }
    }

    /// Drops the writer and stops the connection's tasks. Safe to call twice.
    pub fn close(&self) {
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn set_data(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.data.insert(key.into(), Arc::new(value));
    }

    pub fn get_data(&self, key: &str) -> Option<ConnData> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Typed read of an attribute; `None` when missing or of another type.
    pub fn get_data_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get_data(key)?.downcast::<T>().ok()
    }

    pub fn remove_data(&self, key: &str) -> Option<ConnData> {
        self.data.remove(key).map(|(_, value)| value)
    }

    /// Clears every attribute.
    pub fn release_data(&self) {
        self.data.clear();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true only for the first caller; guards the closed hook.
    pub(crate) fn claim_close_report(&self) -> bool {
        !self.closed_reported.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("closed", &self.is_closed())
            .finish()
    }
}
