//! Event hooks exposed to the code embedding a [`Server`].
//!
//! Every hook is a list of synchronous callbacks invoked in registration
//! order. Emitting takes a snapshot of the list first, so a callback may
//! register further callbacks without deadlocking; those only see later
//! events.
//!
//! ```rust,ignore
//! server.events().on_connection_receive_packet(|_srv, conn, packet| {
//!     let _ = conn.write(packet);
//! });
//! ```

use crate::connection::Conn;
use crate::error::ServerError;
use crate::message::Message;
use crate::server::Server;
use crate::transport::websocket::WebsocketMessageType;
use bytes::Bytes;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub type ServerHandler = dyn Fn(&Server) + Send + Sync;
pub type ConnectionOpenedHandler = dyn Fn(&Server, &Arc<Conn>) + Send + Sync;
pub type ConnectionClosedHandler = dyn Fn(&Server, &Arc<Conn>, Option<&ServerError>) + Send + Sync;
pub type PacketHandler = dyn Fn(&Server, &Arc<Conn>, &Bytes) + Send + Sync;
pub type WebsocketPacketHandler =
    dyn Fn(&Server, &Arc<Conn>, &Bytes, WebsocketMessageType) + Send + Sync;
pub type CrossPacketHandler = dyn Fn(&Server, i64, &Bytes) + Send + Sync;
pub type MessageErrorHandler = dyn Fn(&Server, &Message, &ServerError) + Send + Sync;
pub type MessageLowLatencyHandler = dyn Fn(&Server, &Message, Duration) + Send + Sync;

/// Ordered list of callbacks for one hook.
struct Hook<F: ?Sized> {
    handlers: RwLock<Vec<Arc<F>>>,
}

impl<F: ?Sized> Hook<F> {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, handler: Arc<F>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    fn snapshot(&self) -> Vec<Arc<F>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_empty(&self) -> bool {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

/// The set of hooks owned by one server.
pub struct Events {
    start_before: Hook<ServerHandler>,
    start_finish: Hook<ServerHandler>,
    stop: Hook<ServerHandler>,
    connection_opened: Hook<ConnectionOpenedHandler>,
    connection_closed: Hook<ConnectionClosedHandler>,
    connection_receive_packet: Hook<PacketHandler>,
    connection_receive_websocket_packet: Hook<WebsocketPacketHandler>,
    receive_cross_packet: Hook<CrossPacketHandler>,
    message_error: Hook<MessageErrorHandler>,
    message_low_latency: Hook<MessageLowLatencyHandler>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    pub fn new() -> Self {
        Self {
            start_before: Hook::new(),
            start_finish: Hook::new(),
            stop: Hook::new(),
            connection_opened: Hook::new(),
            connection_closed: Hook::new(),
            connection_receive_packet: Hook::new(),
            connection_receive_websocket_packet: Hook::new(),
            receive_cross_packet: Hook::new(),
            message_error: Hook::new(),
            message_low_latency: Hook::new(),
        }
    }

    /// Runs after the listener is bound and before dispatch loops report ready.
    pub fn on_start_before(&self, handler: impl Fn(&Server) + Send + Sync + 'static) {
        self.start_before.add(Arc::new(handler));
    }

    /// Runs once the server is fully started.
    pub fn on_start_finish(&self, handler: impl Fn(&Server) + Send + Sync + 'static) {
        self.start_finish.add(Arc::new(handler));
    }

    /// Runs once shutdown has released every subsystem.
    pub fn on_stop(&self, handler: impl Fn(&Server) + Send + Sync + 'static) {
        self.stop.add(Arc::new(handler));
    }

    pub fn on_connection_opened(
        &self,
        handler: impl Fn(&Server, &Arc<Conn>) + Send + Sync + 'static,
    ) {
        self.connection_opened.add(Arc::new(handler));
    }

    /// Fires exactly once per connection. The error is the read fault that
    /// ended the connection, if any.
    pub fn on_connection_closed(
        &self,
        handler: impl Fn(&Server, &Arc<Conn>, Option<&ServerError>) + Send + Sync + 'static,
    ) {
        self.connection_closed.add(Arc::new(handler));
    }

    /// Packets from every pipeline network except WebSocket.
    pub fn on_connection_receive_packet(
        &self,
        handler: impl Fn(&Server, &Arc<Conn>, &Bytes) + Send + Sync + 'static,
    ) {
        self.connection_receive_packet.add(Arc::new(handler));
    }

    /// WebSocket packets along with the frame type they arrived as.
    pub fn on_connection_receive_websocket_packet(
        &self,
        handler: impl Fn(&Server, &Arc<Conn>, &Bytes, WebsocketMessageType) + Send + Sync + 'static,
    ) {
        self.connection_receive_websocket_packet.add(Arc::new(handler));
    }

    pub fn on_receive_cross_packet(
        &self,
        handler: impl Fn(&Server, i64, &Bytes) + Send + Sync + 'static,
    ) {
        self.receive_cross_packet.add(Arc::new(handler));
    }

    /// Faults raised while dispatching a message.
    pub fn on_message_error(
        &self,
        handler: impl Fn(&Server, &Message, &ServerError) + Send + Sync + 'static,
    ) {
        self.message_error.add(Arc::new(handler));
    }

    /// Dispatches that took longer than the configured threshold.
    pub fn on_message_low_latency(
        &self,
        handler: impl Fn(&Server, &Message, Duration) + Send + Sync + 'static,
    ) {
        self.message_low_latency.add(Arc::new(handler));
    }

    pub(crate) fn has_packet_handler(&self) -> bool {
        !self.connection_receive_packet.is_empty()
    }

    pub(crate) fn has_websocket_packet_handler(&self) -> bool {
        !self.connection_receive_websocket_packet.is_empty()
    }

    pub(crate) fn start_before_event(&self, srv: &Server) {
        for handler in self.start_before.snapshot() {
            handler(srv);
        }
    }

    pub(crate) fn start_finish_event(&self, srv: &Server) {
        for handler in self.start_finish.snapshot() {
            handler(srv);
        }
    }

    pub(crate) fn stop_event(&self, srv: &Server) {
        for handler in self.stop.snapshot() {
            handler(srv);
        }
    }

    pub(crate) fn connection_opened_event(&self, srv: &Server, conn: &Arc<Conn>) {
        for handler in self.connection_opened.snapshot() {
            handler(srv, conn);
        }
    }

    pub(crate) fn connection_closed_event(
        &self,
        srv: &Server,
        conn: &Arc<Conn>,
        err: Option<&ServerError>,
    ) {
        for handler in self.connection_closed.snapshot() {
            handler(srv, conn, err);
        }
    }

    pub(crate) fn connection_receive_packet_event(&self, srv: &Server, conn: &Arc<Conn>, packet: &Bytes) {
        for handler in self.connection_receive_packet.snapshot() {
            handler(srv, conn, packet);
        }
    }

    pub(crate) fn connection_receive_websocket_packet_event(
        &self,
        srv: &Server,
        conn: &Arc<Conn>,
        packet: &Bytes,
        kind: WebsocketMessageType,
    ) {
        for handler in self.connection_receive_websocket_packet.snapshot() {
            handler(srv, conn, packet, kind);
        }
    }

    pub(crate) fn receive_cross_packet_event(&self, srv: &Server, server_id: i64, packet: &Bytes) {
        for handler in self.receive_cross_packet.snapshot() {
            handler(srv, server_id, packet);
        }
    }

    pub(crate) fn message_error_event(&self, srv: &Server, msg: &Message, err: &ServerError) {
        for handler in self.message_error.snapshot() {
            handler(srv, msg, err);
        }
    }

    pub(crate) fn message_low_latency_event(&self, srv: &Server, msg: &Message, cost: Duration) {
        for handler in self.message_low_latency.snapshot() {
            handler(srv, msg, cost);
        }
    }
}
