//! In-process loopback session for tests and dry runs.
//!
//! [`MemoryConnector`] plays the network; [`MemoryController`] is the test's
//! hand on it: inject inbound messages, drop or restore the link, log the
//! account out and inspect everything that was sent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ChannelError;
use crate::session::{
    CloseReason, Connection, ConnectionEvent, InboundMessage, MessagingSession, OutgoingContent,
    SessionConnector, SessionEvent,
};

const NAME: &str = "memory";

/// One message the session accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub target: String,
    pub content: OutgoingContent,
}

impl SentMessage {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            OutgoingContent::Text(text) => Some(text),
            OutgoingContent::Document { .. } => None,
        }
    }

    pub fn document_name(&self) -> Option<&str> {
        match &self.content {
            OutgoingContent::Document { filename, .. } => Some(filename),
            OutgoingContent::Text(_) => None,
        }
    }
}

struct Network {
    online: AtomicBool,
    revoked: AtomicBool,
    generation: AtomicU64,
    connects: AtomicUsize,
    failing_sends: AtomicUsize,
    live: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    rejected: Mutex<HashSet<String>>,
    sent: Mutex<Vec<SentMessage>>,
    sent_count: watch::Sender<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Network {
    fn emit(&self, event: SessionEvent) -> bool {
        lock(&self.live)
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

/// Connector side of the loopback network.
pub struct MemoryConnector {
    network: Arc<Network>,
}

impl MemoryConnector {
    /// A connected pair, initially online.
    pub fn new() -> (Self, MemoryController) {
        let (sent_count, _) = watch::channel(0);
        let network = Arc::new(Network {
            online: AtomicBool::new(true),
            revoked: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            connects: AtomicUsize::new(0),
            failing_sends: AtomicUsize::new(0),
            live: Mutex::new(None),
            rejected: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            sent_count,
        });
        (
            Self {
                network: Arc::clone(&network),
            },
            MemoryController { network },
        )
    }
}

#[async_trait]
impl SessionConnector for MemoryConnector {
    fn name(&self) -> &str {
        NAME
    }

    async fn connect(&self) -> Result<Connection, ChannelError> {
        let network = &self.network;
        network.connects.fetch_add(1, Ordering::SeqCst);

        if network.revoked.load(Ordering::SeqCst) {
            return Err(ChannelError::LoggedOut {
                name: NAME.to_string(),
            });
        }
        if !network.online.load(Ordering::SeqCst) {
            return Err(ChannelError::StartupFailed {
                name: NAME.to_string(),
                reason: "network unreachable".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Opening));
        let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Open));
        *lock(&network.live) = Some(tx);
        let generation = network.generation.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Connection {
            session: Arc::new(MemorySession {
                network: Arc::clone(network),
                generation,
            }),
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }
}

struct MemorySession {
    network: Arc<Network>,
    generation: u64,
}

#[async_trait]
impl MessagingSession for MemorySession {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, target: &str, content: &OutgoingContent) -> Result<(), ChannelError> {
        let network = &self.network;
        if !network.online.load(Ordering::SeqCst)
            || network.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(ChannelError::Disconnected {
                name: NAME.to_string(),
                reason: "connection is gone".to_string(),
            });
        }
        if network
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::Disconnected {
                name: NAME.to_string(),
                reason: "injected send failure".to_string(),
            });
        }
        if lock(&network.rejected).contains(target) {
            return Err(ChannelError::SendFailed {
                name: NAME.to_string(),
                reason: format!("target {target} rejected the message"),
            });
        }

        lock(&network.sent).push(SentMessage {
            target: target.to_string(),
            content: content.clone(),
        });
        network.sent_count.send_modify(|n| *n += 1);
        Ok(())
    }
}

/// Test handle on the loopback network.
#[derive(Clone)]
pub struct MemoryController {
    network: Arc<Network>,
}

impl MemoryController {
    /// Deliver an inbound message on the live connection.
    pub fn inject(&self, message: InboundMessage) -> bool {
        self.network.emit(SessionEvent::Inbound(message))
    }

    /// Shorthand for a plain text message from `sender` in `conversation`.
    pub fn say(&self, sender: &str, conversation: &str, text: &str) -> bool {
        self.inject(InboundMessage::new(sender, conversation, text))
    }

    /// Drop the link. Connection attempts fail until [`go_online`](Self::go_online).
    pub fn go_offline(&self) {
        self.network.online.store(false, Ordering::SeqCst);
        self.network
            .emit(SessionEvent::Lifecycle(ConnectionEvent::Closed(
                CloseReason::Transient("connection lost".to_string()),
            )));
        lock(&self.network.live).take();
    }

    pub fn go_online(&self) {
        self.network.online.store(true, Ordering::SeqCst);
    }

    /// Log the account out, closing any live connection.
    pub fn log_out(&self) {
        self.network.revoked.store(true, Ordering::SeqCst);
        self.network
            .emit(SessionEvent::Lifecycle(ConnectionEvent::Closed(
                CloseReason::LoggedOut,
            )));
        lock(&self.network.live).take();
    }

    /// The next `n` sends fail with a transient error.
    pub fn fail_next_sends(&self, n: usize) {
        self.network.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Sends to `target` fail permanently.
    pub fn reject_target(&self, target: &str) {
        lock(&self.network.rejected).insert(target.to_string());
    }

    pub fn connects(&self) -> usize {
        self.network.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.network.sent).clone()
    }

    /// Text bodies sent to `target`, in order.
    pub fn texts_to(&self, target: &str) -> Vec<String> {
        lock(&self.network.sent)
            .iter()
            .filter(|m| m.target == target)
            .filter_map(|m| m.text().map(str::to_string))
            .collect()
    }

    /// Wait until at least `count` messages were sent, or `timeout` passes.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<SentMessage> {
        let mut rx = self.network.sent_count.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await;
        self.sent()
    }
}
