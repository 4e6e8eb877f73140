//! WebSocket transport.
//!
//! The listen address may carry a URL path (`":9000/ws"`); upgrades are
//! accepted on that path only. A connection's id is the `X-Real-IP` header
//! when present, otherwise the peer IP. Query parameters of the upgrade
//! request are copied into the connection's attributes as `Vec<String>`.

use super::http::serve_router;
use super::{bind_tcp, ListenerHandle};
use crate::connection::{Conn, Writer};
use crate::error::ServerError;
use crate::network::{resolve, split_websocket_addr, Network};
use crate::server::Server;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Idle time after which a silent WebSocket connection is dropped.
pub const READ_DEADLINE: Duration = Duration::from_secs(30);

/// WebSocket frame types, numbered by their RFC 6455 opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebsocketMessageType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl WebsocketMessageType {
    pub fn code(&self) -> u8 {
        match self {
            WebsocketMessageType::Text => 1,
            WebsocketMessageType::Binary => 2,
            WebsocketMessageType::Close => 8,
            WebsocketMessageType::Ping => 9,
            WebsocketMessageType::Pong => 10,
        }
    }
}

impl TryFrom<u8> for WebsocketMessageType {
    type Error = ServerError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(WebsocketMessageType::Text),
            2 => Ok(WebsocketMessageType::Binary),
            8 => Ok(WebsocketMessageType::Close),
            9 => Ok(WebsocketMessageType::Ping),
            10 => Ok(WebsocketMessageType::Pong),
            other => Err(ServerError::WebsocketMessageTypeException(other)),
        }
    }
}

impl fmt::Display for WebsocketMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WebsocketMessageType::Text => "text",
            WebsocketMessageType::Binary => "binary",
            WebsocketMessageType::Close => "close",
            WebsocketMessageType::Ping => "ping",
            WebsocketMessageType::Pong => "pong",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
struct UpgradeState {
    server: Server,
    token: CancellationToken,
}

pub(crate) async fn serve(server: &Server, addr: &str) -> Result<ListenerHandle, ServerError> {
    let (host, path) = split_websocket_addr(addr);
    let socket_addr = resolve(&host, Network::Websocket).await?;
    let listener = bind_tcp(socket_addr, Network::Websocket)?;
    let token = CancellationToken::new();
    let state = UpgradeState {
        server: server.clone(),
        token: token.clone(),
    };
    let router = Router::new().route(&path, get(upgrade)).with_state(state);
    serve_router(server, router, listener, token).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    State(state): State<UpgradeState>,
) -> Response {
    let id = headers
        .get("X-Real-IP")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());
    ws.on_upgrade(move |socket| session(state, socket, id, peer, query))
}

async fn session(
    state: UpgradeState,
    socket: WebSocket,
    id: String,
    peer: SocketAddr,
    query: Vec<(String, String)>,
) {
    let server = state.server;
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(server.settings().write_queue_depth);
    let conn = Conn::new(id, Network::Websocket, Some(peer), Writer::Channel(tx));

    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in query {
        params.entry(key).or_default().push(value);
    }
    for (key, values) in params {
        conn.set_data(key, values);
    }
    server.connection_opened(&conn);

    let write_type = server.settings().websocket_write_type;
    tokio::spawn(write_loop(sink, rx, conn.token().clone(), write_type));
    let reason = read_loop(&server, &conn, stream, &state.token).await;
    server.connection_closed(&conn, reason);
}

async fn read_loop(
    server: &Server,
    conn: &Arc<Conn>,
    mut stream: SplitStream<WebSocket>,
    listener: &CancellationToken,
) -> Option<ServerError> {
    let allowed = server.settings().websocket_allow.clone();
    loop {
        let next = tokio::select! {
            _ = conn.token().cancelled() => return None,
            _ = listener.cancelled() => return None,
            next = tokio::time::timeout(READ_DEADLINE, stream.next()) => next,
        };
        let message = match next {
            Err(_) => return Some(ServerError::Network("websocket read deadline exceeded".into())),
            Ok(None) => return None,
            Ok(Some(Err(e))) => return Some(ServerError::Network(e.to_string())),
            Ok(Some(Ok(message))) => message,
        };

        let (kind, packet) = inbound(message);
        if let Some(allowed) = &allowed {
            if !allowed.contains(&kind) {
                return Some(ServerError::WebsocketIllegalMessageType(kind));
            }
        }
        if let Err(e) = server.push_packet(conn, packet, Some(kind)).await {
            return Some(e);
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    kind: WebsocketMessageType,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(packet) => {
                    if let Err(e) = sink.send(outbound(kind, packet)).await {
                        debug!(error = %e, "websocket write failed");
                        token.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = token.cancelled() => break,
        }
    }
    sink.close().await.ok();
}

/// Splits a received frame into its type and raw payload. Close frames
/// carry the status code (big-endian) followed by the reason.
fn inbound(message: Message) -> (WebsocketMessageType, Bytes) {
    match message {
        Message::Text(text) => (
            WebsocketMessageType::Text,
            Bytes::copy_from_slice(text.as_str().as_bytes()),
        ),
        Message::Binary(data) => (WebsocketMessageType::Binary, data),
        Message::Ping(data) => (WebsocketMessageType::Ping, data),
        Message::Pong(data) => (WebsocketMessageType::Pong, data),
        Message::Close(frame) => (WebsocketMessageType::Close, close_payload(frame)),
    }
}

fn close_payload(frame: Option<CloseFrame>) -> Bytes {
    match frame {
        Some(frame) => {
            let reason = frame.reason.as_str().as_bytes();
            let mut buf = BytesMut::with_capacity(2 + reason.len());
            buf.put_u16(frame.code);
            buf.put_slice(reason);
            buf.freeze()
        }
        None => Bytes::new(),
    }
}

fn outbound(kind: WebsocketMessageType, packet: Bytes) -> Message {
    match kind {
        WebsocketMessageType::Text => Message::Text(String::from_utf8_lossy(&packet).into_owned().into()),
        WebsocketMessageType::Binary => Message::Binary(packet),
        WebsocketMessageType::Ping => Message::Ping(packet),
        WebsocketMessageType::Pong => Message::Pong(packet),
        WebsocketMessageType::Close => Message::Close(None),
    }
}
