//! Error types for the dispatch engine.
//!
//! A single [`ServerError`] covers configuration mistakes, transport faults,
//! pipeline failures and cross-link failures. It is `Clone` so that an error
//! can be carried inside an `Error` message envelope and handed to several
//! hooks.

use crate::message::MessageType;
use crate::network::Network;
use crate::transport::websocket::WebsocketMessageType;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the server core.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// The network kind is not one the server can run.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// `run` was called on a server that is not in the unstarted state.
    #[error("server cannot be started from the {0} state")]
    NotRunnable(&'static str),

    /// A pipeline network was started without any packet handler attached.
    #[error("no packet handler registered for network {0}")]
    NoPacketHandler(Network),

    /// A WebSocket frame type outside the known set was configured.
    #[error("unknown websocket message type: {0}")]
    WebsocketMessageTypeException(u8),

    /// A WebSocket frame type restriction was applied to another network.
    #[error("websocket message types can only be restricted on the websocket network, not {0}")]
    NotWebsocketUseMessageType(Network),

    /// An inbound WebSocket frame type is not in the allow-list.
    #[error("illegal websocket message type: {0}")]
    WebsocketIllegalMessageType(WebsocketMessageType),

    /// An HTTP-only accessor was used on another network.
    #[error("only supported when the network is http")]
    NetworkOnlySupportHttp,

    /// An RPC-only accessor was used on another network.
    #[error("only supported when the network is rpc")]
    NetworkOnlySupportRpc,

    /// A cross-link operation was requested but no cross is configured.
    #[error("cross-server links are not configured")]
    NoSupportCross,

    /// The requested cross-link name is not registered.
    #[error("unregistered cross name: {0}")]
    UnregisteredCrossName(String),

    /// The ticker was requested but none is attached.
    #[error("ticker is not configured")]
    NoSupportTicker,

    /// The listen address could not be understood.
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Listener-level failure such as a bind or serve error.
    #[error("network error: {0}")]
    Network(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// TLS material could not be loaded or applied.
    #[error("tls error: {0}")]
    Tls(String),

    /// Write attempted on a connection that has been closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    /// The connection's outbound queue is full; the packet was dropped.
    #[error("write queue of connection {0} is full")]
    WriteQueueFull(String),

    /// The message pipeline is not initialized or has been shut down.
    #[error("message pipeline is not running")]
    PipelineClosed,

    /// A non-blocking push found the destination shard saturated.
    #[error("shard {0} queue is full")]
    QueueFull(usize),

    /// A message's attributes do not match the contract of its kind.
    #[error("malformed {kind} message: {reason}")]
    MessageDecode { kind: MessageType, reason: String },

    /// Failure reported by a cross-link collaborator.
    #[error("cross error: {0}")]
    Cross(String),

    /// Catch-all for internal failures.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(Arc::new(err))
    }
}

impl ServerError {
    pub(crate) fn decode(kind: MessageType, reason: impl Into<String>) -> Self {
        ServerError::MessageDecode {
            kind,
            reason: reason.into(),
        }
    }
}
