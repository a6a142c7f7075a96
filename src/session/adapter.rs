//! Session adapter: keeps one connection alive and owns the outbox.
//!
//! Inbound messages come out of [`SessionAdapter::start`] as a stream.
//! Outbound content goes through [`SessionAdapter::send`] into a FIFO
//! outbox drained by a single task, so a status queued while the
//! connection is down is delivered after the next `Open` instead of
//! being dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ChannelError;
use crate::session::{
    CloseReason, Connection, ConnectionEvent, InboundMessage, MessagingSession, OutgoingContent,
    SessionConnector, SessionEvent,
};

const INBOUND_BUFFER: usize = 256;

/// Consecutive transient failures tolerated on one connection before a
/// send is reported as failed.
const MAX_SEND_FAILURES: u32 = 5;

/// Where the adapter's connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    /// Terminal: the account must be paired again.
    LoggedOut,
    /// Terminal: the adapter was shut down.
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::LoggedOut | Self::Stopped)
    }
}

/// Published connection state. The live handle is only present while open.
#[derive(Clone)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub session: Option<Arc<dyn MessagingSession>>,
    /// Number of connections that reached `Open`.
    pub generation: u64,
    /// Number of non-terminal closes followed by a reconnect attempt.
    pub reconnects: u64,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            connection: ConnectionState::Connecting,
            session: None,
            generation: 0,
            reconnects: 0,
        }
    }
}

/// Backoff between connection attempts and pause between send retries.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each backoff step.
    pub jitter: Duration,
    pub retry_pause: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
            retry_pause: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Exponential delay for the given attempt, capped at `max_delay`, plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Resolves once a queued send was delivered or definitively failed.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), ChannelError>>,
}

impl Delivery {
    fn resolved(result: Result<(), ChannelError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    pub async fn wait(self) -> Result<(), ChannelError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(ChannelError::SendFailed {
                name: "outbox".to_string(),
                reason: "outbox stopped before delivery".to_string(),
            })
        })
    }
}

struct Outgoing {
    target: String,
    content: OutgoingContent,
    reply: oneshot::Sender<Result<(), ChannelError>>,
}

/// Owns the connection loop and the outbox for one connector.
pub struct SessionAdapter {
    connector: Arc<dyn SessionConnector>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<SessionState>>,
    stop: watch::Sender<bool>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
}

impl SessionAdapter {
    pub fn new(connector: Arc<dyn SessionConnector>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SessionState::initial());
        let (stop, _) = watch::channel(false);
        let (outbox, pending) = mpsc::unbounded_channel();
        Self {
            connector,
            policy,
            state: Arc::new(state),
            stop,
            outbox,
            pending: Mutex::new(Some(pending)),
        }
    }

    pub fn name(&self) -> &str {
        self.connector.name()
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().connection
    }

    pub fn reconnects(&self) -> u64 {
        self.state.borrow().reconnects
    }

    /// Spawn the connection loop and the outbox task.
    ///
    /// The returned stream ends when the session logs out or the adapter
    /// is shut down.
    pub async fn start(&self) -> Result<ReceiverStream<InboundMessage>, ChannelError> {
        let outbox = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: self.name().to_string(),
                reason: "session adapter already started".to_string(),
            })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        tokio::spawn(run_outbox(
            self.name().to_string(),
            outbox,
            self.state.subscribe(),
            self.policy.retry_pause,
        ));
        tokio::spawn(run_connection(
            Arc::clone(&self.connector),
            self.policy.clone(),
            Arc::clone(&self.state),
            inbound_tx,
            self.stop.subscribe(),
        ));

        tracing::info!(session = self.name(), "Session adapter started");
        Ok(ReceiverStream::new(inbound_rx))
    }

    /// Queue `content` for `target`. Order of calls is order of delivery.
    pub fn send(&self, target: impl Into<String>, content: OutgoingContent) -> Delivery {
        if self.connection_state() == ConnectionState::LoggedOut {
            return Delivery::resolved(Err(ChannelError::LoggedOut {
                name: self.name().to_string(),
            }));
        }

        let (reply, rx) = oneshot::channel();
        let item = Outgoing {
            target: target.into(),
            content,
            reply,
        };
        if let Err(mpsc::error::SendError(item)) = self.outbox.send(item) {
            let _ = item.reply.send(Err(ChannelError::SendFailed {
                name: self.name().to_string(),
                reason: "outbox closed".to_string(),
            }));
        }
        Delivery { rx }
    }

    /// Stop reconnecting and close the current connection.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

fn publish(state: &watch::Sender<SessionState>, connection: ConnectionState) {
    state.send_modify(|s| {
        s.connection = connection;
        if connection != ConnectionState::Open {
            s.session = None;
        }
    });
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

enum DriveOutcome {
    Closed(CloseReason),
    Finished,
}

async fn run_connection(
    connector: Arc<dyn SessionConnector>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<SessionState>>,
    inbound: mpsc::Sender<InboundMessage>,
    mut stop: watch::Receiver<bool>,
) {
    let name = connector.name().to_string();
    let mut attempt: u32 = 0;

    loop {
        publish(&state, ConnectionState::Connecting);
        tracing::debug!(session = %name, attempt, "Connecting");

        let connected = tokio::select! {
            result = connector.connect() => result,
            _ = stopped(&mut stop) => {
                publish(&state, ConnectionState::Stopped);
                return;
            }
        };

        match connected {
            Ok(connection) => {
                let (outcome, opened) =
                    drive(&name, connection, &state, &inbound, &mut stop).await;
                if opened {
                    attempt = 0;
                }
                match outcome {
                    DriveOutcome::Closed(CloseReason::LoggedOut) => {
                        publish(&state, ConnectionState::LoggedOut);
                        tracing::error!(
                            session = %name,
                            "Session logged out; pair the account again to resume"
                        );
                        return;
                    }
                    DriveOutcome::Closed(CloseReason::Transient(reason)) => {
                        state.send_modify(|s| s.reconnects += 1);
                        tracing::warn!(session = %name, reason = %reason, "Connection closed, reconnecting");
                    }
                    DriveOutcome::Finished => {
                        publish(&state, ConnectionState::Stopped);
                        tracing::info!(session = %name, "Session adapter stopped");
                        return;
                    }
                }
            }
            Err(ChannelError::LoggedOut { .. }) => {
                publish(&state, ConnectionState::LoggedOut);
                tracing::error!(session = %name, "Session rejected as logged out; not reconnecting");
                return;
            }
            Err(e) => {
                publish(&state, ConnectionState::Closed);
                tracing::warn!(session = %name, error = %e, "Connection attempt failed");
            }
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(session = %name, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(&mut stop) => {
                publish(&state, ConnectionState::Stopped);
                return;
            }
        }
    }
}

/// Pump one connection's events until it closes. Returns whether it opened.
async fn drive(
    name: &str,
    connection: Connection,
    state: &watch::Sender<SessionState>,
    inbound: &mpsc::Sender<InboundMessage>,
    stop: &mut watch::Receiver<bool>,
) -> (DriveOutcome, bool) {
    let Connection {
        session,
        mut events,
    } = connection;
    let mut opened = false;

    let outcome = loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = stopped(stop) => break DriveOutcome::Finished,
        };

        match event {
            Some(SessionEvent::Lifecycle(ConnectionEvent::Opening)) => {
                publish(state, ConnectionState::Connecting);
            }
            Some(SessionEvent::Lifecycle(ConnectionEvent::Open)) => {
                opened = true;
                state.send_modify(|s| {
                    s.connection = ConnectionState::Open;
                    s.session = Some(Arc::clone(&session));
                    s.generation += 1;
                });
                tracing::info!(session = %name, "Connection open");
            }
            Some(SessionEvent::Lifecycle(ConnectionEvent::Closed(reason))) => {
                break DriveOutcome::Closed(reason);
            }
            Some(SessionEvent::Inbound(message)) => {
                if inbound.send(message).await.is_err() {
                    tracing::debug!(session = %name, "Inbound consumer gone");
                    break DriveOutcome::Finished;
                }
            }
            None => {
                break DriveOutcome::Closed(CloseReason::Transient(
                    "event stream ended".to_string(),
                ));
            }
        }
    };

    publish(state, ConnectionState::Closed);
    if let Err(e) = session.shutdown().await {
        tracing::debug!(session = %name, error = %e, "Error closing connection");
    }
    (outcome, opened)
}

async fn run_outbox(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut state: watch::Receiver<SessionState>,
    retry_pause: Duration,
) {
    while let Some(item) = rx.recv().await {
        let result = deliver(&name, &mut state, &item.target, &item.content, retry_pause).await;
        match &result {
            Ok(()) => tracing::debug!(
                session = %name,
                target = %item.target,
                content = %item.content.describe(),
                "Delivered"
            ),
            Err(e) => tracing::warn!(
                session = %name,
                target = %item.target,
                content = %item.content.describe(),
                error = %e,
                "Delivery failed"
            ),
        }
        let _ = item.reply.send(result);
    }
}

async fn deliver(
    name: &str,
    state: &mut watch::Receiver<SessionState>,
    target: &str,
    content: &OutgoingContent,
    retry_pause: Duration,
) -> Result<(), ChannelError> {
    let mut failures = 0u32;
    let mut failed_on = None;

    loop {
        let (session, generation) = wait_until_open(name, state).await?;
        if failed_on.is_some_and(|g| g != generation) {
            failures = 0;
        }

        match session.send(target, content).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                failures += 1;
                failed_on = Some(generation);
                if failures >= MAX_SEND_FAILURES {
                    return Err(e);
                }
                tracing::warn!(
                    session = %name,
                    target = %target,
                    error = %e,
                    failures,
                    "Send failed, will retry"
                );
                let _ = tokio::time::timeout(
                    retry_pause * failures,
                    state.wait_for(|s| {
                        s.generation != generation || s.connection != ConnectionState::Open
                    }),
                )
                .await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn wait_until_open(
    name: &str,
    state: &mut watch::Receiver<SessionState>,
) -> Result<(Arc<dyn MessagingSession>, u64), ChannelError> {
    let current = state
        .wait_for(|s| s.connection == ConnectionState::Open || s.connection.is_terminal())
        .await
        .map_err(|_| ChannelError::Disconnected {
            name: name.to_string(),
            reason: "session adapter dropped".to_string(),
        })?;

    match (current.connection, &current.session) {
        (ConnectionState::Open, Some(session)) => Ok((Arc::clone(session), current.generation)),
        (ConnectionState::LoggedOut, _) => Err(ChannelError::LoggedOut {
            name: name.to_string(),
        }),
        _ => Err(ChannelError::SendFailed {
            name: name.to_string(),
            reason: "session stopped".to_string(),
        }),
    }
}
