//! Cross-server links.
//!
//! A [`Cross`] relays opaque packets between cooperating servers, usually
//! over a message broker. Outbound packets go through
//! [`Server::push_cross_message`]; inbound packets are handed to the
//! [`CrossPusher`] received in [`Cross::init`] and surface on the
//! receive-cross-packet hook from a dispatch loop.

use crate::error::ServerError;
use crate::message::{MessageAttr, MessageType};
use crate::server::{Server, WeakServer};
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait Cross: Send + Sync {
    /// Called once while the server is being built.
    async fn init(&self, server: &Server, pusher: CrossPusher) -> Result<(), ServerError>;

    /// Sends `packet` to the server identified by `server_id`.
    async fn push_message(&self, server_id: i64, packet: Bytes) -> Result<(), ServerError>;

    /// Called once during shutdown.
    async fn release(&self);
}

/// Feeds packets received by a cross link into the server pipeline.
#[derive(Clone)]
pub struct CrossPusher {
    server: WeakServer,
}

impl CrossPusher {
    pub(crate) fn new(server: WeakServer) -> Self {
        Self { server }
    }

    fn server(&self) -> Result<Server, ServerError> {
        self.server.upgrade().ok_or(ServerError::PipelineClosed)
    }

    /// Enqueues a packet that arrived from `server_id`.
    pub async fn push(&self, server_id: i64, packet: Bytes) -> Result<(), ServerError> {
        self.server()?
            .push_message(MessageType::Cross, cross_attrs(server_id, packet))
            .await
    }

    /// Non-waiting variant of [`push`](Self::push).
    pub fn try_push(&self, server_id: i64, packet: Bytes) -> Result<(), ServerError> {
        self.server()?
            .try_push_message(MessageType::Cross, cross_attrs(server_id, packet))
    }
}

fn cross_attrs(server_id: i64, packet: Bytes) -> Vec<MessageAttr> {
    vec![MessageAttr::ServerId(server_id), MessageAttr::Bytes(packet)]
}
