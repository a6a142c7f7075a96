//! CLI session — stdin/stdout REPL for local testing.
//!
//! Every line typed is an inbound message from the configured local
//! sender. End of input logs the session out, which stops the bot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ChannelError;
use crate::session::{
    CloseReason, Connection, ConnectionEvent, InboundMessage, MessagingSession, OutgoingContent,
    SessionConnector, SessionEvent,
};

const NAME: &str = "cli";

/// Sender id given to lines typed on the terminal.
pub const CLI_SENDER: &str = "local-user";

/// Conversation id replies are addressed to.
pub const CLI_CONVERSATION: &str = "cli";

/// Reads stdin once; stdin cannot be reopened after end of input.
pub struct CliConnector {
    started: AtomicBool,
}

impl CliConnector {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
        }
    }
}

impl Default for CliConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionConnector for CliConnector {
    fn name(&self) -> &str {
        NAME
    }

    async fn connect(&self) -> Result<Connection, ChannelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::LoggedOut { name: NAME.into() });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Open));

        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(msg) = line_to_message(&line) else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(SessionEvent::Inbound(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Closed(
                            CloseReason::LoggedOut,
                        )));
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Closed(
                            CloseReason::LoggedOut,
                        )));
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            session: Arc::new(CliSession),
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }
}

fn line_to_message(line: &str) -> Option<InboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(InboundMessage::new(CLI_SENDER, CLI_CONVERSATION, line))
}

/// Renders outgoing content on stdout.
struct CliSession;

fn render(target: &str, content: &OutgoingContent) -> String {
    match content {
        OutgoingContent::Text(text) => format!("[{target}] {text}"),
        OutgoingContent::Document {
            bytes,
            mime_type,
            filename,
        } => format!(
            "[{target}] 📎 {filename} ({} bytes, {mime_type})",
            bytes.len()
        ),
    }
}

#[async_trait]
impl MessagingSession for CliSession {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, target: &str, content: &OutgoingContent) -> Result<(), ChannelError> {
        println!("\n{}\n", render(target, content));
        eprint!("> ");
        Ok(())
    }
}
