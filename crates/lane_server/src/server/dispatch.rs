//! Shard scheduler and dispatch loops.
//!
//! The pipeline owns the envelope pool and one bounded queue per shard. Each
//! queue is drained by a dedicated OS thread so that hooks are free to block
//! without stalling the async runtime that drives the listeners. Envelopes
//! with a partition key (a packet's connection id, or an explicit key) are
//! hashed to a fixed shard, which keeps per-key ordering; everything else
//! lands on shard 0.

use super::core::Server;
use crate::config::Settings;
use crate::error::ServerError;
use crate::message::{Message, MessageAttr, MessageErrorAction, MessageType, Pool};
use crate::network::Network;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

type Envelope = Box<Message>;

pub(crate) struct Pipeline {
    pool: Pool<Envelope>,
    shards: RwLock<Vec<mpsc::Sender<Envelope>>>,
    low_latency_threshold: Duration,
    runtime: Handle,
}

impl Pipeline {
    /// Creates the pool and shard queues and spawns one dispatch thread per
    /// shard. `active` tracks how many dispatch loops are still running.
    pub(crate) fn start(
        server: &Server,
        settings: &Settings,
        active: Arc<AtomicUsize>,
    ) -> Result<Arc<Self>, ServerError> {
        let runtime = Handle::try_current()
            .map_err(|e| ServerError::Internal(format!("no tokio runtime: {e}")))?;

        let mut senders = Vec::with_capacity(settings.core);
        let mut receivers = Vec::with_capacity(settings.core);
        for _ in 0..settings.core {
            let (tx, rx) = mpsc::channel(settings.shard_capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        let pipeline = Arc::new(Self {
            pool: Pool::new(
                settings.pool_size,
                || Box::new(Message::default()),
                |msg: &mut Envelope| msg.reset(),
            ),
            shards: RwLock::new(senders),
            low_latency_threshold: settings.low_latency_threshold,
            runtime,
        });

        for (shard, mut rx) in receivers.into_iter().enumerate() {
            let server = server.clone();
            let shard_pipeline = pipeline.clone();
            let shard_active = active.clone();
            active.fetch_add(1, Ordering::SeqCst);
            let spawned = std::thread::Builder::new()
                .name(format!("lane-shard-{shard}"))
                .spawn(move || {
                    debug!(shard, "dispatch loop started");
                    while let Some(msg) = rx.blocking_recv() {
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| shard_pipeline.dispatch(&server, msg)));
                        if let Err(payload) = outcome {
                            error!(
                                shard,
                                fault = %panic_message(payload.as_ref()),
                                "dispatch loop recovered from a fault outside the handler boundary"
                            );
                        }
                    }
                    shard_active.fetch_sub(1, Ordering::SeqCst);
                    debug!(shard, "dispatch loop exited");
                });
            if let Err(e) = spawned {
                active.fetch_sub(1, Ordering::SeqCst);
                pipeline.close();
                return Err(e.into());
            }
        }

        Ok(pipeline)
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Takes an envelope from the pool and stamps it. Error envelopes get the
    /// enqueue-time backtrace appended.
    fn acquire(&self, kind: MessageType, attrs: Vec<MessageAttr>) -> Envelope {
        let mut msg = self.pool.get();
        msg.stamp(kind, attrs);
        if kind == MessageType::Error {
            msg.push_attr(MessageAttr::Stack(Backtrace::force_capture().to_string()));
        }
        msg
    }

    fn route(&self, key: Option<&str>) -> Result<(usize, mpsc::Sender<Envelope>), ServerError> {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        if shards.is_empty() {
            return Err(ServerError::PipelineClosed);
        }
        let index = key.map_or(0, |key| shard_index(key, shards.len()));
        Ok((index, shards[index].clone()))
    }

    /// Enqueues a message, waiting while the destination shard is full.
    pub(crate) async fn push(
        &self,
        key: Option<&str>,
        kind: MessageType,
        attrs: Vec<MessageAttr>,
    ) -> Result<(), ServerError> {
        let msg = self.acquire(kind, attrs);
        let routed = match key {
            Some(key) => self.route(Some(key)),
            None => self.route(msg.partition_key()),
        };
        let (_, sender) = match routed {
            Ok(routed) => routed,
            Err(err) => {
                self.pool.release(msg);
                return Err(err);
            }
        };
        if let Err(mpsc::error::SendError(msg)) = sender.send(msg).await {
            self.pool.release(msg);
            return Err(ServerError::PipelineClosed);
        }
        Ok(())
    }

    /// Enqueues a message without waiting; fails if the shard is full.
    pub(crate) fn try_push(
        &self,
        key: Option<&str>,
        kind: MessageType,
        attrs: Vec<MessageAttr>,
    ) -> Result<(), ServerError> {
        let msg = self.acquire(kind, attrs);
        let routed = match key {
            Some(key) => self.route(Some(key)),
            None => self.route(msg.partition_key()),
        };
        let (index, sender) = match routed {
            Ok(routed) => routed,
            Err(err) => {
                self.pool.release(msg);
                return Err(err);
            }
        };
        match sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                self.pool.release(msg);
                Err(ServerError::QueueFull(index))
            }
            Err(TrySendError::Closed(msg)) => {
                self.pool.release(msg);
                Err(ServerError::PipelineClosed)
            }
        }
    }

    /// Closes every shard queue and the pool. Dispatch loops exit once they
    /// have drained what was already queued.
    pub(crate) fn close(&self) {
        self.shards.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.pool.close();
    }

    fn dispatch(&self, server: &Server, msg: Envelope) {
        let present = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.resolve(server, &msg)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(kind = %msg.kind(), attrs = ?msg.attrs(), error = %err, "message dispatch failed");
                server.events().message_error_event(server, &msg, &err);
            }
            Err(payload) => {
                error!(
                    kind = %msg.kind(),
                    attrs = ?msg.attrs(),
                    fault = %panic_message(payload.as_ref()),
                    "message handler panicked"
                );
                if let Some(err) = payload.downcast_ref::<ServerError>() {
                    server.events().message_error_event(server, &msg, err);
                }
            }
        }

        let cost = present.elapsed();
        if cost > self.low_latency_threshold {
            warn!(kind = %msg.kind(), cost = ?cost, attrs = ?msg.attrs(), "message dispatch exceeded latency threshold");
            server.events().message_low_latency_event(server, &msg, cost);
        }

        if !server.is_shutdown() {
            self.pool.release(msg);
        }
    }

    fn resolve(&self, server: &Server, msg: &Message) -> Result<(), ServerError> {
        match msg.kind() {
            MessageType::Packet => {
                if server.network() == Network::Websocket {
                    let (conn, packet, kind) = msg.deconstruct_websocket_packet()?;
                    server
                        .events()
                        .connection_receive_websocket_packet_event(server, &conn, &packet, kind);
                } else {
                    let (conn, packet) = msg.deconstruct_packet()?;
                    server.events().connection_receive_packet_event(server, &conn, &packet);
                }
            }
            MessageType::Error => {
                let (err, action, stack) = msg.deconstruct_error()?;
                match action {
                    MessageErrorAction::None => {
                        error!(error = %err, stack = %stack, "error message received");
                    }
                    MessageErrorAction::Shutdown => {
                        let server = server.clone();
                        self.runtime.spawn(async move {
                            server.shutdown(Some(err), Some(stack)).await;
                        });
                    }
                }
            }
            MessageType::Cross => {
                let (server_id, packet) = msg.deconstruct_cross()?;
                server.events().receive_cross_packet_event(server, server_id, &packet);
            }
            MessageType::Ticker => {
                let caller = msg.deconstruct_ticker()?;
                caller();
            }
            MessageType::None => {
                warn!(kind = %msg.kind(), "unsupported message type dropped");
            }
        }
        Ok(())
    }
}

/// Maps a partition key to a shard deterministically.
pub(crate) fn shard_index(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Extracts a readable description from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<ServerError>() {
        err.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}
