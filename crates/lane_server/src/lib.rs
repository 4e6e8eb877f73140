//! # Lane Server - Sharded Dispatch Core for Game Backends
//!
//! A transport-agnostic network server core. It accepts connections over
//! TCP, Unix-domain sockets, UDP, QUIC, WebSocket, HTTP or an RPC service,
//! normalizes all inbound activity into one message pipeline, and spreads
//! that pipeline over a configurable number of shards.
//!
//! ## Architecture Overview
//!
//! * **Connection** ([`Conn`]) - one handle per transport session with
//!   write, close and a per-connection attribute store
//! * **Message pool** ([`message::Pool`]) - recycled envelopes carrying a
//!   [`MessageType`] and its attributes
//! * **Shards** - bounded ordered queues, each drained by exactly one
//!   dispatch loop on its own thread
//! * **Events** ([`Events`]) - hooks embedding code registers against
//! * **Lifecycle** ([`Server::run`], [`Server::shutdown`]) - start-up and
//!   ordered release of every subsystem under a deadline
//!
//! ### Message Flow
//!
//! 1. A listener accepts a session and wraps it in a [`Conn`]
//! 2. Every inbound packet is stamped onto a pooled envelope
//! 3. The envelope is queued on the shard its connection hashes to
//! 4. The shard's dispatch loop fires the packet hook, then recycles the envelope
//!
//! Packets of one connection are always handled in order by one shard.
//! Hooks on different shards run in parallel.
//!
//! ```rust,ignore
//! use lane_server::{Network, ServerBuilder, ServerConfig};
//!
//! let server = ServerBuilder::new(Network::Tcp)
//!     .config(ServerConfig::default().with_core(4))
//!     .build()
//!     .await?;
//! server.events().on_connection_receive_packet(|_, conn, packet| {
//!     let _ = conn.write(packet);
//! });
//! server.run(":9000").await?;
//! ```
//!
//! ## Fault Isolation
//!
//! A panicking hook never takes its dispatch loop down: the fault is
//! logged, forwarded to the message-error hook when the panic payload is a
//! [`ServerError`], and the shard carries on with the next envelope.
//!
//! ## Shutdown
//!
//! [`Server::shutdown`] releases the ticker and cross links, stops the
//! listener within [`SHUTDOWN_DEADLINE`], closes the shard queues (loops
//! drain what is queued and exit), closes the pool, and stops HTTP and RPC
//! servers. Process signals are left to the embedding binary.

pub mod config;
pub mod connection;
pub mod cross;
pub mod error;
pub mod event;
pub mod message;
pub mod network;
pub mod server;
pub mod ticker;
pub mod transport;

pub use config::{ServerConfig, TickerSettings, TlsSettings};
pub use connection::Conn;
pub use cross::{Cross, CrossPusher};
pub use error::ServerError;
pub use event::Events;
pub use message::{Message, MessageAttr, MessageErrorAction, MessageType};
pub use network::Network;
pub use server::{Server, ServerBuilder, ServerState, SHUTDOWN_DEADLINE};
pub use ticker::Ticker;
pub use transport::rpc::RpcService;
pub use transport::websocket::WebsocketMessageType;

pub use async_trait::async_trait;
pub use axum;
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
