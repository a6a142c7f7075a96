//! Messaging session abstraction.
//!
//! A [`SessionConnector`] opens a fresh [`Connection`] to the messaging
//! network: a handle for sending plus one stream carrying inbound messages
//! and connection-lifecycle events. The [`SessionAdapter`] owns reconnects
//! and the outbox; nothing else touches the live handle.

pub mod adapter;
pub mod cli;
pub mod memory;
pub mod telegram;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;

pub use adapter::{ConnectionState, Delivery, ReconnectPolicy, SessionAdapter, SessionState};
pub use cli::CliConnector;
pub use memory::{MemoryConnector, MemoryController, SentMessage};
pub use telegram::TelegramConnector;

/// How the text of an inbound message was carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Plain text message.
    Text,
    /// Caption attached to media.
    Caption,
}

/// A message received from the network.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Who wrote it.
    pub sender: String,
    /// Where replies go (chat, group or direct conversation).
    pub conversation: String,
    pub text: String,
    pub message_type: MessageType,
    /// Sent by the bot's own account.
    pub from_self: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        sender: impl Into<String>,
        conversation: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            conversation: conversation.into(),
            text: text.into(),
            message_type: MessageType::Text,
            from_self: false,
            received_at: Utc::now(),
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn from_self(mut self, from_self: bool) -> Self {
        self.from_self = from_self;
        self
    }
}

/// What can be sent to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingContent {
    Text(String),
    Document {
        bytes: Vec<u8>,
        mime_type: String,
        filename: String,
    },
}

impl OutgoingContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Text(text) => format!("text ({} chars)", text.chars().count()),
            Self::Document {
                bytes, filename, ..
            } => format!("document {filename} ({} bytes)", bytes.len()),
        }
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The account was logged out; pairing is required before reconnecting.
    LoggedOut,
    /// Anything else; the adapter reconnects.
    Transient(String),
}

/// Connection lifecycle as reported by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opening,
    Open,
    Closed(CloseReason),
}

/// Everything a live connection emits.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Inbound(InboundMessage),
    Lifecycle(ConnectionEvent),
}

/// Ordered stream of session events.
pub type EventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

/// Live handle for sending on one connection.
#[async_trait]
pub trait MessagingSession: Send + Sync {
    fn name(&self) -> &str;

    /// Send `content` to `target`.
    ///
    /// `ChannelError::Disconnected` signals that the same send may succeed
    /// after a reconnect.
    async fn send(&self, target: &str, content: &OutgoingContent) -> Result<(), ChannelError>;

    /// Release the connection.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// An opened connection.
pub struct Connection {
    pub session: Arc<dyn MessagingSession>,
    pub events: EventStream,
}

/// Opens connections to the messaging network.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Open a fresh connection. `ChannelError::LoggedOut` is terminal.
    async fn connect(&self) -> Result<Connection, ChannelError>;
}
