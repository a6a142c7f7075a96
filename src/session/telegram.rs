//! Telegram session — long-polls the Bot API for updates.
//!
//! Each connection verifies the token with `getMe`, then a poll task feeds
//! `getUpdates` results into the event stream. The update offset lives in
//! the connector so a reconnect never replays messages already handled.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ChannelError;
use crate::session::{
    CloseReason, Connection, ConnectionEvent, InboundMessage, MessageType, MessagingSession,
    OutgoingContent, SessionConnector, SessionEvent,
};

const NAME: &str = "telegram";

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Consecutive poll failures before the connection is reported closed.
const MAX_POLL_FAILURES: u32 = 3;

const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Per-request bound for sendMessage; the outbox waits on every send.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request bound for sendDocument uploads.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

struct BotApi {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl BotApi {
    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }
}

/// Connects to the Telegram Bot API.
pub struct TelegramConnector {
    api: Arc<BotApi>,
    offset: Arc<AtomicI64>,
    poll_timeout_secs: u64,
    send_timeout: Duration,
    upload_timeout: Duration,
}

impl TelegramConnector {
    pub fn new(bot_token: SecretString, api_base: impl Into<String>) -> Self {
        Self {
            api: Arc::new(BotApi {
                bot_token,
                api_base: api_base.into(),
                client: reqwest::Client::new(),
            }),
            offset: Arc::new(AtomicI64::new(0)),
            poll_timeout_secs: POLL_TIMEOUT_SECS,
            send_timeout: SEND_TIMEOUT,
            upload_timeout: UPLOAD_TIMEOUT,
        }
    }

    /// Override the getUpdates long-poll timeout.
    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    /// Override the sendMessage and sendDocument request timeouts.
    pub fn with_send_timeout(mut self, send: Duration, upload: Duration) -> Self {
        self.send_timeout = send;
        self.upload_timeout = upload;
        self
    }

    /// Fetch the bot's own user id, validating the token.
    async fn get_me(&self) -> Result<i64, ChannelError> {
        let resp = self
            .api
            .client
            .get(self.api.api_url("getMe"))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: NAME.into(),
                reason: e.to_string(),
            })?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                return Err(ChannelError::LoggedOut { name: NAME.into() });
            }
            status if !status.is_success() => {
                return Err(ChannelError::StartupFailed {
                    name: NAME.into(),
                    reason: format!("getMe returned {status}"),
                });
            }
            _ => {}
        }

        let data: Value = resp.json().await.map_err(|e| ChannelError::StartupFailed {
            name: NAME.into(),
            reason: format!("getMe returned invalid JSON: {e}"),
        })?;
        data.get("result")
            .and_then(|r| r.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::StartupFailed {
                name: NAME.into(),
                reason: "getMe response has no bot id".into(),
            })
    }
}

#[async_trait]
impl SessionConnector for TelegramConnector {
    fn name(&self) -> &str {
        NAME
    }

    async fn connect(&self) -> Result<Connection, ChannelError> {
        let bot_id = self.get_me().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Open));

        tokio::spawn(poll_updates(
            Arc::clone(&self.api),
            Arc::clone(&self.offset),
            self.poll_timeout_secs,
            bot_id,
            tx,
        ));

        Ok(Connection {
            session: Arc::new(TelegramSession {
                api: Arc::clone(&self.api),
                send_timeout: self.send_timeout,
                upload_timeout: self.upload_timeout,
            }),
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }
}

async fn poll_updates(
    api: Arc<BotApi>,
    offset: Arc<AtomicI64>,
    poll_timeout_secs: u64,
    bot_id: i64,
    tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut failures = 0u32;
    tracing::info!(bot_id, "Telegram session listening for messages");

    loop {
        if tx.is_closed() {
            return;
        }

        let body = serde_json::json!({
            "offset": offset.load(Ordering::SeqCst),
            "timeout": poll_timeout_secs,
            "allowed_updates": ["message"]
        });
        let result = api
            .client
            .post(api.api_url("getUpdates"))
            .timeout(Duration::from_secs(poll_timeout_secs + 10))
            .json(&body)
            .send()
            .await;

        let outcome: Result<Value, String> = match result {
            Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Closed(
                    CloseReason::LoggedOut,
                )));
                return;
            }
            Ok(resp) if !resp.status().is_success() => {
                Err(format!("getUpdates returned {}", resp.status()))
            }
            Ok(resp) => resp
                .json()
                .await
                .map_err(|e| format!("getUpdates returned invalid JSON: {e}")),
            Err(e) => Err(e.to_string()),
        };

        let data = match outcome {
            Ok(data) => {
                failures = 0;
                data
            }
            Err(reason) => {
                failures += 1;
                tracing::warn!(failures, "Telegram poll error: {reason}");
                if failures >= MAX_POLL_FAILURES {
                    let _ = tx.send(SessionEvent::Lifecycle(ConnectionEvent::Closed(
                        CloseReason::Transient(reason),
                    )));
                    return;
                }
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };

        let Some(updates) = data.get("result").and_then(Value::as_array) else {
            continue;
        };
        for update in updates {
            if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                offset.fetch_max(uid + 1, Ordering::SeqCst);
            }
            let Some(message) = parse_update(update, bot_id) else {
                continue;
            };
            if tx.send(SessionEvent::Inbound(message)).is_err() {
                tracing::info!("Telegram listener channel closed");
                return;
            }
        }
    }
}

/// Turn one update into an inbound message. Updates without text or a
/// caption yield `None`.
fn parse_update(update: &Value, bot_id: i64) -> Option<InboundMessage> {
    let message = update.get("message")?;

    let (text, message_type) = match message.get("text").and_then(Value::as_str) {
        Some(text) => (text, MessageType::Text),
        None => (
            message.get("caption").and_then(Value::as_str)?,
            MessageType::Caption,
        ),
    };

    let sender_id = message
        .get("from")
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64);
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;

    let sender = sender_id.map(|id| id.to_string()).unwrap_or_default();
    Some(
        InboundMessage::new(sender, chat_id.to_string(), text)
            .with_type(message_type)
            .from_self(sender_id == Some(bot_id)),
    )
}

struct TelegramSession {
    api: Arc<BotApi>,
    send_timeout: Duration,
    upload_timeout: Duration,
}

impl TelegramSession {
    /// Send a text message, split to fit Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            let resp = self
                .api
                .client
                .post(self.api.api_url("sendMessage"))
                .timeout(self.send_timeout)
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;
            check_response("sendMessage", resp).await?;
        }
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: &str,
        bytes: &[u8],
        mime_type: &str,
        filename: &str,
    ) -> Result<(), ChannelError> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| ChannelError::InvalidMessage(format!("bad mime type {mime_type}: {e}")))?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);

        let resp = self
            .api
            .client
            .post(self.api.api_url("sendDocument"))
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        check_response("sendDocument", resp).await?;

        tracing::info!(chat_id, filename, "Telegram document sent");
        Ok(())
    }
}

#[async_trait]
impl MessagingSession for TelegramSession {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, target: &str, content: &OutgoingContent) -> Result<(), ChannelError> {
        match content {
            OutgoingContent::Text(text) => self.send_message(target, text).await,
            OutgoingContent::Document {
                bytes,
                mime_type,
                filename,
            } => self.send_document(target, bytes, mime_type, filename).await,
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram connection closed");
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> ChannelError {
    ChannelError::Disconnected {
        name: NAME.into(),
        reason: e.to_string(),
    }
}

/// Map a Bot API response status onto the channel error taxonomy.
async fn check_response(method: &str, resp: reqwest::Response) -> Result<(), ChannelError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(method, status, &body))
}

fn classify_status(method: &str, status: StatusCode, body: &str) -> ChannelError {
    match status {
        StatusCode::UNAUTHORIZED => ChannelError::LoggedOut { name: NAME.into() },
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited { name: NAME.into() },
        s if s.is_server_error() => ChannelError::Disconnected {
            name: NAME.into(),
            reason: format!("{method} returned {s}"),
        },
        s => ChannelError::SendFailed {
            name: NAME.into(),
            reason: format!("{method} returned {s}: {body}"),
        },
    }
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use axum::extract::State;
    use axum::http::{HeaderMap, header};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::StreamExt;
    use tokio::net::TcpListener;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct FakeBotApi {
        reject_token: bool,
        stall_sends: bool,
        polls: AtomicUsize,
        texts: Mutex<Vec<Value>>,
        uploads: Mutex<Vec<String>>,
    }

    async fn get_me(State(api): State<Arc<FakeBotApi>>) -> impl IntoResponse {
        if api.reject_token {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"ok": false, "error_code": 401})),
            );
        }
        (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "result": {"id": 42, "is_bot": true}})),
        )
    }

    async fn get_updates(State(api): State<Arc<FakeBotApi>>) -> Json<Value> {
        if api.polls.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Json(serde_json::json!({"ok": true, "result": []}));
        }
        Json(serde_json::json!({
            "ok": true,
            "result": [
                {"update_id": 10, "message": {
                    "from": {"id": 7}, "chat": {"id": -100},
                    "text": "download [ {\"url\": \"http://x/a\", \"filename\": \"a\"} ]"
                }},
                {"update_id": 11, "message": {
                    "from": {"id": 42}, "chat": {"id": -100}, "text": "⬇️ Downloading a..."
                }},
                {"update_id": 12, "message": {
                    "from": {"id": 7}, "chat": {"id": -100}, "photo": []
                }},
                {"update_id": 13, "message": {
                    "from": {"id": 7}, "chat": {"id": 7}, "caption": "hello"
                }}
            ]
        }))
    }

    async fn send_message(
        State(api): State<Arc<FakeBotApi>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        if api.stall_sends {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        api.texts.lock().unwrap().push(body);
        Json(serde_json::json!({"ok": true, "result": {}}))
    }

    async fn send_document(
        State(api): State<Arc<FakeBotApi>>,
        headers: HeaderMap,
    ) -> Json<Value> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        api.uploads.lock().unwrap().push(content_type);
        Json(serde_json::json!({"ok": true, "result": {}}))
    }

    async fn start_server(api: Arc<FakeBotApi>) -> SocketAddr {
        let app = Router::new()
            .route("/botTEST/getMe", get(get_me))
            .route("/botTEST/getUpdates", post(get_updates))
            .route("/botTEST/sendMessage", post(send_message))
            .route("/botTEST/sendDocument", post(send_document))
            .with_state(api);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn connector(addr: SocketAddr) -> TelegramConnector {
        TelegramConnector::new(SecretString::from("TEST"), format!("http://{addr}"))
            .with_poll_timeout(1)
    }

    #[test]
    fn telegram_api_url() {
        let connector = TelegramConnector::new(
            SecretString::from("123:ABC"),
            "https://api.telegram.org",
        );
        assert_eq!(
            connector.api.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
        assert_eq!(connector.name(), "telegram");
    }

    #[test]
    fn parse_update_reads_text_and_caption() {
        let update = serde_json::json!({"update_id": 1, "message": {
            "from": {"id": 7}, "chat": {"id": 99}, "text": "hi"
        }});
        let msg = parse_update(&update, 42).unwrap();
        assert_eq!(msg.sender, "7");
        assert_eq!(msg.conversation, "99");
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.message_type, MessageType::Text);
        assert!(!msg.from_self);

        let update = serde_json::json!({"update_id": 2, "message": {
            "from": {"id": 42}, "chat": {"id": 99}, "caption": "look"
        }});
        let msg = parse_update(&update, 42).unwrap();
        assert_eq!(msg.message_type, MessageType::Caption);
        assert!(msg.from_self);
    }

    #[test]
    fn parse_update_skips_non_text() {
        let update = serde_json::json!({"update_id": 3, "message": {
            "from": {"id": 7}, "chat": {"id": 99}, "sticker": {}
        }});
        assert!(parse_update(&update, 42).is_none());
        assert!(parse_update(&serde_json::json!({"update_id": 4}), 42).is_none());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status("sendMessage", StatusCode::UNAUTHORIZED, ""),
            ChannelError::LoggedOut { .. }
        ));
        assert!(classify_status("sendMessage", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status("sendMessage", StatusCode::BAD_GATEWAY, "").is_transient());
        let err = classify_status("sendMessage", StatusCode::BAD_REQUEST, "chat not found");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("chat not found"));
    }

    #[tokio::test]
    async fn connect_streams_open_then_messages() {
        let api = Arc::new(FakeBotApi::default());
        let addr = start_server(Arc::clone(&api)).await;
        let connector = connector(addr);

        let mut connection = connector.connect().await.unwrap();
        let first = tokio::time::timeout(TEST_TIMEOUT, connection.events.next())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(SessionEvent::Lifecycle(ConnectionEvent::Open))
        ));

        let mut inbound = Vec::new();
        while inbound.len() < 3 {
            match tokio::time::timeout(TEST_TIMEOUT, connection.events.next())
                .await
                .unwrap()
            {
                Some(SessionEvent::Inbound(msg)) => inbound.push(msg),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        assert_eq!(inbound[0].sender, "7");
        assert_eq!(inbound[0].conversation, "-100");
        assert!(inbound[0].text.starts_with("download"));
        assert!(inbound[1].from_self);
        assert_eq!(inbound[2].message_type, MessageType::Caption);
        assert_eq!(connector.offset.load(Ordering::SeqCst), 14);
    }

    #[tokio::test]
    async fn rejected_token_is_logged_out() {
        let api = Arc::new(FakeBotApi {
            reject_token: true,
            ..Default::default()
        });
        let addr = start_server(api).await;

        let err = connector(addr).connect().await.err().unwrap();
        assert!(matches!(err, ChannelError::LoggedOut { .. }));
    }

    #[tokio::test]
    async fn unreachable_api_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connector(addr).connect().await.err().unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn sends_text_and_documents() {
        let api = Arc::new(FakeBotApi::default());
        let addr = start_server(Arc::clone(&api)).await;
        let connection = connector(addr).connect().await.unwrap();

        connection
            .session
            .send("-100", &OutgoingContent::text("✅ done"))
            .await
            .unwrap();
        connection
            .session
            .send(
                "-100",
                &OutgoingContent::Document {
                    bytes: b"payload".to_vec(),
                    mime_type: "video/mp4".into(),
                    filename: "a.mp4".into(),
                },
            )
            .await
            .unwrap();

        let texts = api.texts.lock().unwrap().clone();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0]["chat_id"], "-100");
        assert_eq!(texts[0]["text"], "✅ done");

        let uploads = api.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].starts_with("multipart/form-data"));
    }

    #[tokio::test]
    async fn long_text_is_sent_in_chunks() {
        let api = Arc::new(FakeBotApi::default());
        let addr = start_server(Arc::clone(&api)).await;
        let connection = connector(addr).connect().await.unwrap();

        let text = format!("{}\n{}", "a".repeat(3000), "b".repeat(3000));
        connection
            .session
            .send("1", &OutgoingContent::text(text))
            .await
            .unwrap();
        assert_eq!(api.texts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stalled_send_times_out_as_transient() {
        let api = Arc::new(FakeBotApi {
            stall_sends: true,
            ..Default::default()
        });
        let addr = start_server(Arc::clone(&api)).await;
        let connection = connector(addr)
            .with_send_timeout(Duration::from_millis(200), Duration::from_millis(200))
            .connect()
            .await
            .unwrap();

        let err = tokio::time::timeout(
            TEST_TIMEOUT,
            connection.session.send("1", &OutgoingContent::text("hi")),
        )
        .await
        .expect("send should give up before the test timeout")
        .unwrap_err();

        assert!(matches!(err, ChannelError::Disconnected { .. }), "got {err:?}");
        assert!(err.is_transient());
        assert!(api.texts.lock().unwrap().is_empty());
    }

    // ── Message splitting tests ─────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(3000);
        let chunks = split_message(&msg, 4095);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4094);
        assert_eq!(chunks.concat(), msg);
    }
}
