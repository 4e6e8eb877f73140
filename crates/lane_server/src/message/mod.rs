//! Message envelopes flowing through the shard pipeline.
//!
//! Every unit of work is a [`Message`]: a [`MessageType`] discriminant plus a
//! list of [`MessageAttr`] values whose shape is fixed per kind:
//!
//! | Kind     | Attributes                                        |
//! |----------|---------------------------------------------------|
//! | `Packet` | connection, bytes, optional websocket frame type  |
//! | `Error`  | error, action, stack                              |
//! | `Cross`  | remote server id, bytes                           |
//! | `Ticker` | caller                                            |
//!
//! The `deconstruct_*` methods decode those shapes and fail with
//! [`ServerError::MessageDecode`] on a mismatch.

pub mod pool;

pub use pool::Pool;

use crate::connection::Conn;
use crate::error::ServerError;
use crate::transport::websocket::WebsocketMessageType;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Callback carried by a `Ticker` message.
pub type TickerCaller = Arc<dyn Fn() + Send + Sync>;

/// Discriminant of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    /// A released envelope; never dispatched on purpose.
    #[default]
    None,
    Packet,
    Error,
    Cross,
    Ticker,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::None => "None",
            MessageType::Packet => "Packet",
            MessageType::Error => "Error",
            MessageType::Cross => "Cross",
            MessageType::Ticker => "Ticker",
        };
        f.write_str(name)
    }
}

/// What the dispatch loop should do with an `Error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageErrorAction {
    /// Log the error and carry on.
    None,
    /// Shut the server down with the error.
    Shutdown,
}

impl fmt::Display for MessageErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageErrorAction::None => f.write_str("none"),
            MessageErrorAction::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// A single untyped attribute of a message.
#[derive(Clone)]
pub enum MessageAttr {
    Conn(Arc<Conn>),
    Bytes(Bytes),
    WebsocketType(WebsocketMessageType),
    Error(ServerError),
    Action(MessageErrorAction),
    Stack(String),
    ServerId(i64),
    Caller(TickerCaller),
}

impl fmt::Debug for MessageAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageAttr::Conn(conn) => write!(f, "Conn({})", conn.id()),
            MessageAttr::Bytes(bytes) => write!(f, "Bytes(len={})", bytes.len()),
            MessageAttr::WebsocketType(kind) => write!(f, "WebsocketType({kind})"),
            MessageAttr::Error(err) => write!(f, "Error({err})"),
            MessageAttr::Action(action) => write!(f, "Action({action})"),
            MessageAttr::Stack(stack) => write!(f, "Stack(len={})", stack.len()),
            MessageAttr::ServerId(id) => write!(f, "ServerId({id})"),
            MessageAttr::Caller(_) => f.write_str("Caller"),
        }
    }
}

impl From<Arc<Conn>> for MessageAttr {
    fn from(conn: Arc<Conn>) -> Self {
        MessageAttr::Conn(conn)
    }
}

impl From<Bytes> for MessageAttr {
    fn from(bytes: Bytes) -> Self {
        MessageAttr::Bytes(bytes)
    }
}

impl From<Vec<u8>> for MessageAttr {
    fn from(bytes: Vec<u8>) -> Self {
        MessageAttr::Bytes(Bytes::from(bytes))
    }
}

impl From<WebsocketMessageType> for MessageAttr {
    fn from(kind: WebsocketMessageType) -> Self {
        MessageAttr::WebsocketType(kind)
    }
}

impl From<ServerError> for MessageAttr {
    fn from(err: ServerError) -> Self {
        MessageAttr::Error(err)
    }
}

impl From<MessageErrorAction> for MessageAttr {
    fn from(action: MessageErrorAction) -> Self {
        MessageAttr::Action(action)
    }
}

impl From<i64> for MessageAttr {
    fn from(id: i64) -> Self {
        MessageAttr::ServerId(id)
    }
}

/// A pooled unit of dispatchable work.
#[derive(Debug, Default)]
pub struct Message {
    kind: MessageType,
    attrs: Vec<MessageAttr>,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn attrs(&self) -> &[MessageAttr] {
        &self.attrs
    }

    pub(crate) fn stamp(&mut self, kind: MessageType, attrs: impl IntoIterator<Item = MessageAttr>) {
        self.kind = kind;
        self.attrs.clear();
        self.attrs.extend(attrs);
    }

    pub(crate) fn push_attr(&mut self, attr: MessageAttr) {
        self.attrs.push(attr);
    }

    /// Clears kind and attributes while keeping the attribute buffer.
    pub(crate) fn reset(&mut self) {
        self.kind = MessageType::None;
        self.attrs.clear();
    }

    /// Connection identity used to pin packets of one connection to one shard.
    pub fn partition_key(&self) -> Option<&str> {
        match (self.kind, self.attrs.first()) {
            (MessageType::Packet, Some(MessageAttr::Conn(conn))) => Some(conn.id()),
            _ => None,
        }
    }

    pub fn deconstruct_packet(&self) -> Result<(Arc<Conn>, Bytes), ServerError> {
        match self.attrs.as_slice() {
            [MessageAttr::Conn(conn), MessageAttr::Bytes(packet)]
            | [MessageAttr::Conn(conn), MessageAttr::Bytes(packet), MessageAttr::WebsocketType(_)] => {
                Ok((conn.clone(), packet.clone()))
            }
            _ => Err(ServerError::decode(
                MessageType::Packet,
                "expected [connection, bytes]",
            )),
        }
    }

    pub fn deconstruct_websocket_packet(
        &self,
    ) -> Result<(Arc<Conn>, Bytes, WebsocketMessageType), ServerError> {
        match self.attrs.as_slice() {
            [MessageAttr::Conn(conn), MessageAttr::Bytes(packet), MessageAttr::WebsocketType(kind)] => {
                Ok((conn.clone(), packet.clone(), *kind))
            }
            _ => Err(ServerError::decode(
                MessageType::Packet,
                "expected [connection, bytes, websocket message type]",
            )),
        }
    }

    pub fn deconstruct_error(&self) -> Result<(ServerError, MessageErrorAction, String), ServerError> {
        match self.attrs.as_slice() {
            [MessageAttr::Error(err), MessageAttr::Action(action), MessageAttr::Stack(stack)] => {
                Ok((err.clone(), *action, stack.clone()))
            }
            _ => Err(ServerError::decode(
                MessageType::Error,
                "expected [error, action, stack]",
            )),
        }
    }

    pub fn deconstruct_cross(&self) -> Result<(i64, Bytes), ServerError> {
        match self.attrs.as_slice() {
            [MessageAttr::ServerId(server_id), MessageAttr::Bytes(packet)] => {
                Ok((*server_id, packet.clone()))
            }
            _ => Err(ServerError::decode(
                MessageType::Cross,
                "expected [server id, bytes]",
            )),
        }
    }

    pub fn deconstruct_ticker(&self) -> Result<TickerCaller, ServerError> {
        match self.attrs.as_slice() {
            [MessageAttr::Caller(caller)] => Ok(caller.clone()),
            _ => Err(ServerError::decode(MessageType::Ticker, "expected [caller]")),
        }
    }
}
