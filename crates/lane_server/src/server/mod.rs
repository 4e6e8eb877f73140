//! Server lifecycle and message dispatch.

mod core;
mod dispatch;

pub use self::core::{Server, ServerBuilder, ServerState, SHUTDOWN_DEADLINE};
pub(crate) use self::core::WeakServer;
