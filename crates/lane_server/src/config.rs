//! Server configuration types and defaults.
//!
//! [`ServerConfig`] is plain data so it can be embedded in a TOML file by the
//! hosting binary. Out-of-range values never fail construction: they are
//! corrected to their defaults with a warning, and the corrected view is
//! produced by [`ServerConfig::resolve`].

use crate::message::pool::DEFAULT_POOL_SIZE;
use crate::network::Network;
use crate::error::ServerError;
use crate::transport::websocket::WebsocketMessageType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default depth of every shard queue.
pub const DEFAULT_SHARD_CAPACITY: usize = 4096 * 1000;

/// Default dispatch duration above which the low-latency hook fires.
pub const DEFAULT_LOW_LATENCY_THRESHOLD_MS: u64 = 100;

/// Default number of outbound packets a connection may have queued.
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 1024;

/// Default silence after which a datagram peer is considered gone.
pub const DEFAULT_DATAGRAM_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Construction options for a [`Server`](crate::Server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of shards, each drained by one dispatch loop.
    pub core: usize,

    /// Capacity of the message envelope pool.
    pub message_buffer_size: usize,

    /// Depth of each shard queue before producers are held back.
    pub shard_capacity: usize,

    /// Dispatch duration that counts as slow, in milliseconds.
    pub low_latency_threshold_ms: u64,

    /// Outbound packets a connection may have queued before writes fail.
    pub write_queue_depth: usize,

    /// Milliseconds without a datagram after which a UDP peer is closed.
    pub datagram_idle_timeout_ms: u64,

    /// Certificate and key used by HTTP, WebSocket and QUIC listeners.
    pub tls: Option<TlsSettings>,

    /// Frame type codes accepted from WebSocket clients. Empty accepts all.
    pub websocket_message_types: Vec<u8>,

    /// Frame type code used for outbound WebSocket writes.
    pub websocket_write_message_type: u8,

    /// Attaches a ticker when present.
    pub ticker: Option<TickerSettings>,

    /// Production mode: quieter logs and no startup banner.
    pub prod: bool,

    /// Set when several servers are driven by an outer coordinator; `run`
    /// returns as soon as the server is started.
    pub multiple: bool,
}

/// TLS certificate and private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerSettings {
    /// Run timer callbacks on the ticker's own task instead of a shard.
    pub autonomous: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            core: 1,
            message_buffer_size: DEFAULT_POOL_SIZE,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
            low_latency_threshold_ms: DEFAULT_LOW_LATENCY_THRESHOLD_MS,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            datagram_idle_timeout_ms: DEFAULT_DATAGRAM_IDLE_TIMEOUT_MS,
            tls: None,
            websocket_message_types: Vec::new(),
            websocket_write_message_type: WebsocketMessageType::Binary.code(),
            ticker: None,
            prod: false,
            multiple: false,
        }
    }
}

/// Validated configuration as used by the running server.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub core: usize,
    pub pool_size: usize,
    pub shard_capacity: usize,
    pub low_latency_threshold: Duration,
    pub write_queue_depth: usize,
    pub datagram_idle_timeout: Duration,
    pub tls: Option<TlsSettings>,
    /// `None` accepts every frame type.
    pub websocket_allow: Option<HashSet<WebsocketMessageType>>,
    pub websocket_write_type: WebsocketMessageType,
    pub ticker: Option<TickerSettings>,
    pub prod: bool,
    pub multiple: bool,
}

impl ServerConfig {
    pub fn with_core(mut self, core: usize) -> Self {
        self.core = core;
        self
    }

    pub fn with_message_buffer_size(mut self, size: usize) -> Self {
        self.message_buffer_size = size;
        self
    }

    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }

    pub fn with_datagram_idle_timeout(mut self, timeout: Duration) -> Self {
        self.datagram_idle_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsSettings {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        });
        self
    }

    pub fn with_websocket_message_types(mut self, types: &[WebsocketMessageType]) -> Self {
        self.websocket_message_types = types.iter().map(|t| t.code()).collect();
        self
    }

    pub fn with_ticker(mut self, autonomous: bool) -> Self {
        self.ticker = Some(TickerSettings { autonomous });
        self
    }

    pub fn with_prod(mut self) -> Self {
        self.prod = true;
        self
    }

    pub fn with_multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    /// Corrects out-of-range values for `network`, warning about each one.
    pub(crate) fn resolve(&self, network: Network) -> Settings {
        let core = if self.core < 1 {
            warn!(
                count = self.core,
                "wrong core count configuration, corrected to 1, running in single-core mode"
            );
            1
        } else {
            self.core
        };

        let pool_size = if self.message_buffer_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.message_buffer_size
        };

        let shard_capacity = if self.shard_capacity == 0 {
            DEFAULT_SHARD_CAPACITY
        } else {
            self.shard_capacity
        };

        let write_queue_depth = if self.write_queue_depth == 0 {
            DEFAULT_WRITE_QUEUE_DEPTH
        } else {
            self.write_queue_depth
        };

        let datagram_idle_timeout_ms = if self.datagram_idle_timeout_ms == 0 {
            DEFAULT_DATAGRAM_IDLE_TIMEOUT_MS
        } else {
            self.datagram_idle_timeout_ms
        };

        let tls = match (&self.tls, network.supports_tls()) {
            (Some(tls), true) => Some(tls.clone()),
            (Some(_), false) => {
                warn!(%network, "tls settings ignored for this network");
                None
            }
            (None, _) => None,
        };

        let websocket_allow = if self.websocket_message_types.is_empty() {
            None
        } else if network != Network::Websocket {
            warn!(
                error = %ServerError::NotWebsocketUseMessageType(network),
                "websocket message type restriction ignored"
            );
            None
        } else {
            let allowed: HashSet<_> = self
                .websocket_message_types
                .iter()
                .filter_map(|code| match WebsocketMessageType::try_from(*code) {
                    Ok(kind) => Some(kind),
                    Err(err) => {
                        warn!(code, error = %err, "websocket message type rejected");
                        None
                    }
                })
                .collect();
            Some(allowed)
        };

        let websocket_write_type =
            match WebsocketMessageType::try_from(self.websocket_write_message_type) {
                Ok(kind) => kind,
                Err(err) => {
                    warn!(
                        code = self.websocket_write_message_type,
                        error = %err,
                        "websocket write message type rejected, using binary"
                    );
                    WebsocketMessageType::Binary
                }
            };

        Settings {
            core,
            pool_size,
            shard_capacity,
            low_latency_threshold: Duration::from_millis(self.low_latency_threshold_ms),
            write_queue_depth,
            datagram_idle_timeout: Duration::from_millis(datagram_idle_timeout_ms),
            tls,
            websocket_allow,
            websocket_write_type,
            ticker: self.ticker,
            prod: self.prod,
            multiple: self.multiple,
        }
    }
}
