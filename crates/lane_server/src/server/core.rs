//! Core server implementation.
//!
//! This module contains the [`Server`] handle, its [`ServerBuilder`], and the
//! lifecycle controller that drives start-up and shutdown of every owned
//! subsystem: the envelope pool and shard queues, the transport listener,
//! the ticker, and cross-server links.

use super::dispatch::Pipeline;
use crate::config::{ServerConfig, Settings};
use crate::connection::Conn;
use crate::cross::{Cross, CrossPusher};
use crate::error::ServerError;
use crate::event::Events;
use crate::message::{MessageAttr, MessageErrorAction, MessageType};
use crate::network::{proto_addr, Network};
use crate::ticker::Ticker;
use crate::transport::{self, rpc::RpcService, websocket::WebsocketMessageType, ListenerHandle};
use axum::Router;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Deadline for stopping the pipeline listener and the HTTP server.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);

/// Lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Running,
    ShuttingDown,
    Stopped,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Unstarted => "unstarted",
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting down",
            ServerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct Inner {
    network: Network,
    settings: Settings,
    events: Events,
    state: watch::Sender<ServerState>,
    shutdown: AtomicBool,
    listen: RwLock<String>,
    local_addr: RwLock<Option<SocketAddr>>,
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    dispatch_loops: Arc<AtomicUsize>,
    listener: Mutex<Option<ListenerHandle>>,
    http: Mutex<Option<ListenerHandle>>,
    rpc: Mutex<Option<ListenerHandle>>,
    http_router: Mutex<Option<Router>>,
    rpc_service: Option<Arc<dyn RpcService>>,
    ticker: Option<Ticker>,
    crosses: HashMap<String, Arc<dyn Cross>>,
    id: Option<i64>,
    exit_error: Mutex<Option<ServerError>>,
}

/// A network server driving one listener and its shard pipeline.
///
/// `Server` is a cheap handle; clones share the same engine. Construct one
/// with [`ServerBuilder`], attach hooks through [`Server::events`], then call
/// [`Server::run`].
///
/// # Examples
///
/// ```rust,ignore
/// let server = ServerBuilder::new(Network::Tcp)
///     .config(ServerConfig::default().with_core(4))
///     .build()
///     .await?;
/// server.events().on_connection_receive_packet(|_, conn, packet| {
///     let _ = conn.write(packet);
/// });
/// server.run(":9000").await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

/// Non-owning reference to a server, held by subsystems the server owns.
#[derive(Clone)]
pub(crate) struct WeakServer(Weak<Inner>);

impl WeakServer {
    pub(crate) fn upgrade(&self) -> Option<Server> {
        self.0.upgrade().map(|inner| Server { inner })
    }
}

type RouteFn = Box<dyn FnOnce(Router) -> Router + Send>;

/// Builder applying a [`ServerConfig`] and the non-data attachments.
pub struct ServerBuilder {
    network: Network,
    config: ServerConfig,
    crosses: Vec<(String, i64, Arc<dyn Cross>)>,
    rpc_service: Option<Arc<dyn RpcService>>,
    routes: Vec<RouteFn>,
    misuse: Option<ServerError>,
}

impl ServerBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            config: ServerConfig::default(),
            crosses: Vec::new(),
            rpc_service: None,
            routes: Vec::new(),
            misuse: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a cross-server link under `name`. The server's id is the
    /// `server_id` of the last registered link.
    pub fn cross(mut self, name: impl Into<String>, server_id: i64, cross: impl Cross + 'static) -> Self {
        self.crosses.push((name.into(), server_id, Arc::new(cross)));
        self
    }

    /// Attaches the service served by the `rpc` network.
    pub fn rpc_service(mut self, service: impl RpcService + 'static) -> Self {
        if self.network != Network::Rpc {
            self.misuse.get_or_insert(ServerError::NetworkOnlySupportRpc);
            return self;
        }
        self.rpc_service = Some(Arc::new(service));
        self
    }

    /// Adds routes to the router served by the `http` network.
    pub fn http_routes(mut self, routes: impl FnOnce(Router) -> Router + Send + 'static) -> Self {
        if self.network != Network::Http {
            self.misuse.get_or_insert(ServerError::NetworkOnlySupportHttp);
            return self;
        }
        self.routes.push(Box::new(routes));
        self
    }

    /// Builds the server and initializes every cross-server link once.
    pub async fn build(self) -> Result<Server, ServerError> {
        if let Some(err) = self.misuse {
            return Err(err);
        }

        let network = self.network;
        let settings = self.config.resolve(network);
        let runtime = Handle::try_current()
            .map_err(|e| ServerError::Internal(format!("no tokio runtime: {e}")))?;

        let http_router = (network == Network::Http).then(|| {
            self.routes
                .into_iter()
                .fold(Router::new(), |router, routes| routes(router))
        });
        let id = self.crosses.last().map(|(_, server_id, _)| *server_id);
        let crosses: HashMap<_, _> = self
            .crosses
            .iter()
            .map(|(name, _, cross)| (name.clone(), cross.clone()))
            .collect();
        let ticker_settings = settings.ticker;
        let (state, _) = watch::channel(ServerState::Unstarted);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            network,
            settings,
            events: Events::new(),
            state,
            shutdown: AtomicBool::new(false),
            listen: RwLock::new(String::new()),
            local_addr: RwLock::new(None),
            pipeline: RwLock::new(None),
            dispatch_loops: Arc::new(AtomicUsize::new(0)),
            listener: Mutex::new(None),
            http: Mutex::new(None),
            rpc: Mutex::new(None),
            http_router: Mutex::new(http_router),
            rpc_service: self.rpc_service,
            ticker: ticker_settings
                .map(|t| Ticker::new(t.autonomous, WeakServer(weak.clone()), runtime.clone())),
            crosses,
            id,
            exit_error: Mutex::new(None),
        });
        let server = Server { inner };

        for (name, server_id, cross) in &self.crosses {
            if let Err(err) = cross.init(&server, CrossPusher::new(server.downgrade())).await {
                error!(cross = %name, server_id, error = %err, "❌ Cross link failed to initialize");
                return Err(err);
            }
            debug!(cross = %name, server_id, "cross link initialized");
        }

        Ok(server)
    }
}

impl Server {
    pub(crate) fn downgrade(&self) -> WeakServer {
        WeakServer(Arc::downgrade(&self.inner))
    }

    pub fn network(&self) -> Network {
        self.inner.network
    }

    pub fn events(&self) -> &Events {
        &self.inner.events
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    pub fn is_prod(&self) -> bool {
        self.inner.settings.prod
    }

    pub fn is_dev(&self) -> bool {
        !self.inner.settings.prod
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// The address passed to [`run`](Self::run).
    pub fn listen_addr(&self) -> String {
        self.inner.listen.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The address the listener actually bound, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Server id given with the cross-server links.
    pub fn id(&self) -> Result<i64, ServerError> {
        self.inner.id.ok_or(ServerError::NoSupportCross)
    }

    pub fn ticker(&self) -> Result<&Ticker, ServerError> {
        self.inner.ticker.as_ref().ok_or(ServerError::NoSupportTicker)
    }

    pub fn rpc_service(&self) -> Result<Arc<dyn RpcService>, ServerError> {
        self.inner
            .rpc_service
            .clone()
            .ok_or(ServerError::NetworkOnlySupportRpc)
    }

    /// Registers more routes on the HTTP router. Only valid before `run`.
    pub fn http_routes(&self, routes: impl FnOnce(Router) -> Router) -> Result<(), ServerError> {
        let mut slot = self.inner.http_router.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(router) => {
                *slot = Some(routes(router));
                Ok(())
            }
            None if self.inner.network == Network::Http => {
                Err(ServerError::NotRunnable(self.state().as_str()))
            }
            None => Err(ServerError::NetworkOnlySupportHttp),
        }
    }

    /// Number of dispatch loops that have not yet exited.
    pub fn active_dispatch_loops(&self) -> usize {
        self.inner.dispatch_loops.load(Ordering::SeqCst)
    }

    /// Number of shard queues, zero when the pipeline is not running.
    pub fn shard_count(&self) -> usize {
        self.pipeline().map(|p| p.shard_count()).unwrap_or(0)
    }

    fn pipeline(&self) -> Result<Arc<Pipeline>, ServerError> {
        self.inner
            .pipeline
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ServerError::PipelineClosed)
    }

    /// Enqueues a message, waiting while the destination shard is full.
    ///
    /// The attributes must follow the shape of `kind`; see
    /// [`message`](crate::message). `Error` messages get the current
    /// backtrace appended.
    pub async fn push_message(&self, kind: MessageType, attrs: Vec<MessageAttr>) -> Result<(), ServerError> {
        self.pipeline()?.push(None, kind, attrs).await
    }

    /// Like [`push_message`](Self::push_message), routed by `key` so that
    /// every message with the same key is handled in order on one shard.
    pub async fn push_message_to(
        &self,
        key: &str,
        kind: MessageType,
        attrs: Vec<MessageAttr>,
    ) -> Result<(), ServerError> {
        self.pipeline()?.push(Some(key), kind, attrs).await
    }

    /// Non-waiting push for synchronous callers, such as hooks.
    pub fn try_push_message(&self, kind: MessageType, attrs: Vec<MessageAttr>) -> Result<(), ServerError> {
        self.pipeline()?.try_push(None, kind, attrs)
    }

    pub fn try_push_message_to(
        &self,
        key: &str,
        kind: MessageType,
        attrs: Vec<MessageAttr>,
    ) -> Result<(), ServerError> {
        self.pipeline()?.try_push(Some(key), kind, attrs)
    }

    /// Sends a packet to `server_id` through the cross link named `cross_name`.
    pub async fn push_cross_message(
        &self,
        cross_name: &str,
        server_id: i64,
        packet: Bytes,
    ) -> Result<(), ServerError> {
        if self.inner.crosses.is_empty() {
            return Err(ServerError::NoSupportCross);
        }
        let cross = self
            .inner
            .crosses
            .get(cross_name)
            .ok_or_else(|| ServerError::UnregisteredCrossName(cross_name.to_string()))?;
        cross.push_message(server_id, packet).await
    }

    /// Starts the server on `addr` and waits until it has stopped.
    ///
    /// `addr` may omit the host (`":9000"`) to listen on every interface;
    /// WebSocket addresses may carry a path (`":9000/ws"`). In `multiple`
    /// mode this returns as soon as the server is started.
    ///
    /// # Errors
    ///
    /// * [`ServerError::NotRunnable`] if the server was already started.
    /// * [`ServerError::NoPacketHandler`] if a pipeline network has no
    ///   packet hook of the matching flavour.
    /// * Bind and TLS failures from the listener.
    /// * The error that triggered an abnormal shutdown.
    pub async fn run(&self, addr: &str) -> Result<(), ServerError> {
        let network = self.inner.network;
        let current = self.state();
        if current != ServerState::Unstarted {
            return Err(ServerError::NotRunnable(current.as_str()));
        }
        self.check_hooks()?;
        if network == Network::Rpc && self.inner.rpc_service.is_none() {
            return Err(ServerError::Network("the rpc network requires an rpc service".into()));
        }

        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == ServerState::Unstarted {
                *state = ServerState::Running;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ServerError::NotRunnable(self.state().as_str()));
        }
        *self.inner.listen.write().unwrap_or_else(|e| e.into_inner()) = addr.to_string();

        match self.start(addr).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(%network, listen = %addr, "shutdown requested while starting");
                return self.wait_stopped().await;
            }
            Err(err) => {
                error!(%network, listen = %addr, error = %err, "❌ Server failed to start");
                self.shutdown(Some(err.clone()), None).await;
                self.inner.exit_error.lock().unwrap_or_else(|e| e.into_inner()).take();
                return Err(err);
            }
        }

        self.inner.events.start_before_event(self);
        if !self.inner.settings.multiple && !self.inner.settings.prod {
            info!("====================================================================");
            info!(
                %network,
                listen = %addr,
                local_addr = ?self.local_addr(),
                shards = self.shard_count(),
                "🚀 Server running on {}",
                proto_addr(network, addr)
            );
            info!("====================================================================");
        }
        self.inner.events.start_finish_event(self);

        if self.inner.settings.multiple {
            return Ok(());
        }
        self.wait_stopped().await
    }

    async fn wait_stopped(&self) -> Result<(), ServerError> {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
        match self.inner.exit_error.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_hooks(&self) -> Result<(), ServerError> {
        let network = self.inner.network;
        let events = &self.inner.events;
        let ok = match network {
            Network::Http | Network::Rpc => true,
            Network::Websocket => events.has_websocket_packet_handler(),
            _ => events.has_packet_handler(),
        };
        if ok {
            Ok(())
        } else {
            Err(ServerError::NoPacketHandler(network))
        }
    }

    /// Brings up the pipeline and the listener. Returns `Ok(false)` when a
    /// concurrent shutdown began meanwhile; whatever was started is then
    /// released here, since shutdown may already have passed the slots.
    async fn start(&self, addr: &str) -> Result<bool, ServerError> {
        let network = self.inner.network;
        if network.uses_pipeline() {
            let pipeline = Pipeline::start(self, &self.inner.settings, self.inner.dispatch_loops.clone())?;
            *self.inner.pipeline.write().unwrap_or_else(|e| e.into_inner()) = Some(pipeline);
        }

        let started = transport::start(self, addr).await.map(|handle| {
            *self.inner.local_addr.write().unwrap_or_else(|e| e.into_inner()) = handle.local_addr();
            let slot = match network {
                Network::Http => &self.inner.http,
                Network::Rpc => &self.inner.rpc,
                _ => &self.inner.listener,
            };
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        });

        // Slots are written before the flag is read and shutdown sets the
        // flag before taking them, so every handle is stopped by one side.
        if self.is_shutdown() {
            self.release_started().await;
            return started.map(|()| false);
        }
        started.map(|()| true)
    }

    /// Stops whatever `start` left in the slots after shutdown took its share.
    async fn release_started(&self) {
        let network = self.inner.network;
        let pipeline = self.inner.pipeline.write().unwrap_or_else(|e| e.into_inner()).take();
        let handles = [
            self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()).take(),
            self.inner.rpc.lock().unwrap_or_else(|e| e.into_inner()).take(),
            self.inner.http.lock().unwrap_or_else(|e| e.into_inner()).take(),
        ];
        for handle in handles.into_iter().flatten() {
            if let Err(e) = handle.stop(Some(SHUTDOWN_DEADLINE)).await {
                error!(%network, error = %e, "listener stop failed");
            }
        }
        if let Some(pipeline) = pipeline {
            pipeline.close();
        }
    }

    /// Stops the server and releases every subsystem.
    ///
    /// Only the first call performs the release sequence; later and
    /// concurrent callers wait until it has completed. When `err` is given
    /// the shutdown is logged as abnormal and `run` returns that error.
    pub async fn shutdown(&self, err: Option<ServerError>, stack: Option<String>) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            let mut state = self.inner.state.subscribe();
            let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
            return;
        }
        self.inner.state.send_replace(ServerState::ShuttingDown);
        let network = self.inner.network;
        let listen = self.listen_addr();

        if let Some(ticker) = &self.inner.ticker {
            ticker.release();
        }
        for (name, cross) in &self.inner.crosses {
            cross.release().await;
            debug!(cross = %name, "cross link released");
        }

        let pipeline = self.inner.pipeline.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pipeline) = pipeline {
            let listener = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(listener) = listener {
                if let Err(e) = listener.stop(Some(SHUTDOWN_DEADLINE)).await {
                    error!(%network, listen = %listen, error = %e, "listener stop failed");
                }
            }
            pipeline.close();
        }

        let rpc = self.inner.rpc.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(rpc) = rpc {
            if let Err(e) = rpc.stop(None).await {
                error!(%network, listen = %listen, error = %e, "rpc server stop failed");
            }
        }

        let http = self.inner.http.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(http) = http {
            if let Err(e) = http.stop(Some(SHUTDOWN_DEADLINE)).await {
                error!(%network, listen = %listen, error = %e, "http server stop failed");
            }
        }

        match err {
            Some(err) => {
                error!(
                    %network,
                    listen = %listen,
                    action = "shutdown",
                    state = "exception",
                    error = %err,
                    stack = stack.as_deref().unwrap_or_default(),
                    "🛑 Server shut down"
                );
                *self.inner.exit_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
            }
            None => {
                info!(%network, listen = %listen, action = "shutdown", state = "normal", "🛑 Server shut down");
            }
        }

        self.inner.state.send_replace(ServerState::Stopped);
        self.inner.events.stop_event(self);
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn take_http_router(&self) -> Option<Router> {
        self.inner.http_router.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Enqueues an inbound packet. Failures only happen while shutting down.
    pub(crate) async fn push_packet(
        &self,
        conn: &Arc<Conn>,
        packet: Bytes,
        websocket_type: Option<WebsocketMessageType>,
    ) -> Result<(), ServerError> {
        let mut attrs = vec![MessageAttr::Conn(conn.clone()), MessageAttr::Bytes(packet)];
        if let Some(kind) = websocket_type {
            attrs.push(MessageAttr::WebsocketType(kind));
        }
        self.push_message(MessageType::Packet, attrs).await
    }

    pub(crate) fn connection_opened(&self, conn: &Arc<Conn>) {
        if !self.inner.settings.prod {
            debug!(network = %conn.network(), conn = %conn.id(), "connection opened");
        }
        self.inner.events.connection_opened_event(self, conn);
    }

    /// Tears a connection down and fires the closed hook, once per connection.
    pub(crate) fn connection_closed(&self, conn: &Arc<Conn>, err: Option<ServerError>) {
        if !conn.claim_close_report() {
            return;
        }
        conn.close();
        if !self.inner.settings.prod {
            match &err {
                Some(err) => debug!(network = %conn.network(), conn = %conn.id(), error = %err, "connection closed"),
                None => debug!(network = %conn.network(), conn = %conn.id(), "connection closed"),
            }
        }
        self.inner.events.connection_closed_event(self, conn, err.as_ref());
    }

    /// Routes a listener-level failure into shutdown.
    ///
    /// Pipeline networks go through an `Error` message so that shutdown is
    /// entered from a dispatch loop; HTTP and RPC shut down directly.
    pub(crate) async fn listener_failed(&self, err: ServerError) {
        if self.is_shutdown() {
            return;
        }
        if self.inner.network.uses_pipeline() {
            let attrs = vec![MessageAttr::Error(err.clone()), MessageAttr::Action(MessageErrorAction::Shutdown)];
            match self.push_message(MessageType::Error, attrs).await {
                Ok(()) => return,
                Err(push_err) => warn!(error = %push_err, "could not enqueue listener failure"),
            }
        }
        let server = self.clone();
        tokio::spawn(async move {
            server.shutdown(Some(err), None).await;
        });
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("network", &self.inner.network)
            .field("state", &self.state())
            .field("listen", &self.listen_addr())
            .finish()
    }
}
