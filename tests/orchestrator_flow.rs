//! End-to-end command flows through the orchestrator, using the in-memory
//! session and a scripted fetcher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use courier::config::{AllowList, BotConfig};
use courier::error::{ChannelError, Error, FetchError};
use courier::fetch::{FetchTarget, Fetcher, FetcherSet, Progress};
use courier::jobs::JobTracker;
use courier::orchestrator::Orchestrator;
use courier::session::{
    ConnectionState, InboundMessage, MemoryConnector, MemoryController, OutgoingContent,
    ReconnectPolicy, SessionAdapter,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(150);

/// Writes a small payload; sources containing `fail` error out, sources
/// containing `slow` wait for the gate to open first.
struct ScriptedFetcher {
    gate: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, target: FetchTarget<'_>, progress: &Progress) -> Result<(), FetchError> {
        if target.source_ref.contains("slow") {
            let mut open = self.gate.subscribe();
            let _ = open.wait_for(|open| *open).await;
        }
        if target.source_ref.contains("fail") {
            return Err(FetchError::Transport("connection reset".to_string()));
        }
        tokio::fs::write(target.destination, format!("payload:{}", target.source_ref)).await?;
        progress.report(1.0);
        Ok(())
    }
}

struct Harness {
    controller: MemoryController,
    session: Arc<SessionAdapter>,
    tracker: Arc<JobTracker>,
    gate: Arc<watch::Sender<bool>>,
    dir: tempfile::TempDir,
    run: JoinHandle<Result<(), Error>>,
}

impl Harness {
    async fn start(configure: impl FnOnce(&mut BotConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BotConfig {
            allow_list: AllowList::new(["alice"]),
            download_dir: dir.path().join("downloads"),
            ..BotConfig::default()
        };
        configure(&mut config);

        let (gate, _) = watch::channel(false);
        let gate = Arc::new(gate);
        let fetcher: Arc<dyn Fetcher> = Arc::new(ScriptedFetcher {
            gate: Arc::clone(&gate),
        });
        let tracker = JobTracker::new(
            FetcherSet::new(Arc::clone(&fetcher), fetcher),
            config.max_concurrent_fetches,
        );

        let (connector, controller) = MemoryConnector::new();
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: Duration::ZERO,
            retry_pause: Duration::from_millis(10),
        };
        let session = Arc::new(SessionAdapter::new(Arc::new(connector), policy));

        let orchestrator = Orchestrator::new(config, Arc::clone(&tracker), Arc::clone(&session));
        let run = tokio::spawn(async move { orchestrator.run().await });

        let harness = Self {
            controller,
            session,
            tracker,
            gate,
            dir,
            run,
        };
        harness.wait_for_state(ConnectionState::Open).await;
        harness
    }

    async fn wait_for_state(&self, wanted: ConnectionState) {
        let mut state = self.session.state();
        tokio::time::timeout(TEST_TIMEOUT, state.wait_for(|s| s.connection == wanted))
            .await
            .expect("timed out waiting for connection state")
            .unwrap();
    }

    fn downloads(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }

    fn say(&self, sender: &str, text: &str) {
        assert!(self.controller.say(sender, "chat-1", text));
    }

    fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    async fn sent(&self, count: usize) -> Vec<courier::session::SentMessage> {
        let sent = self.controller.wait_for_sent(count, TEST_TIMEOUT).await;
        assert!(
            sent.len() >= count,
            "expected {count} messages, got {}: {sent:#?}",
            sent.len()
        );
        sent
    }

    /// Assert nothing beyond `count` messages is sent for a while.
    async fn settles_at(&self, count: usize) {
        tokio::time::sleep(QUIET_PERIOD).await;
        assert_eq!(self.controller.sent().len(), count, "{:#?}", self.controller.sent());
    }
}

fn command(items: &[(&str, &str)]) -> String {
    let entries: Vec<String> = items
        .iter()
        .map(|(url, filename)| format!(r#"{{ "url": "{url}", "filename": "{filename}" }}"#))
        .collect();
    format!("download [{}]", entries.join(", "))
}

async fn wait_until_gone(path: &Path) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("file was never removed");
}

#[tokio::test]
async fn single_download_reports_then_sends_document() {
    let h = Harness::start(|_| {}).await;
    h.say("alice", &command(&[("https://x/a.mp4", "a.mp4")]));

    let sent = h.sent(3).await;
    assert_eq!(sent[0].text(), Some("⬇️ Downloading a.mp4..."));
    assert_eq!(sent[1].text(), Some("✅ Download complete. Sending a.mp4..."));
    assert_eq!(sent[2].target, "chat-1");
    match &sent[2].content {
        OutgoingContent::Document {
            bytes,
            mime_type,
            filename,
        } => {
            assert_eq!(filename, "a.mp4");
            assert_eq!(mime_type, "video/mp4");
            assert_eq!(bytes, b"payload:https://x/a.mp4");
        }
        other => panic!("expected document, got {other:?}"),
    }
    h.settles_at(3).await;

    assert!(h.downloads().join("a.mp4").is_file());
    assert_eq!(h.tracker.active_count().await, 0);
}

#[tokio::test]
async fn failed_download_reports_reason() {
    let h = Harness::start(|_| {}).await;
    h.say("alice", &command(&[("https://x/fail.mp4", "a.mp4")]));

    let sent = h.sent(2).await;
    assert_eq!(sent[0].text(), Some("⬇️ Downloading a.mp4..."));
    assert_eq!(
        sent[1].text(),
        Some("❌ Failed to download https://x/fail.mp4. Error: transport error: connection reset")
    );
    h.settles_at(2).await;
    assert!(!h.downloads().join("a.mp4").exists());
}

#[tokio::test]
async fn malformed_payload_gets_exactly_one_usage_reply() {
    let h = Harness::start(|_| {}).await;
    h.say("alice", "download notjson");

    let sent = h.sent(1).await;
    let reply = sent[0].text().unwrap();
    assert!(reply.contains(r#"download [ { "url": "...", "filename": "..." } ]"#));
    h.settles_at(1).await;
    assert_eq!(h.tracker.active_count().await, 0);
    assert!(!h.downloads().exists());
}

#[tokio::test]
async fn missing_field_gets_usage_reply() {
    let h = Harness::start(|_| {}).await;
    h.say("alice", r#"download [ { "url": "https://x/a" } ]"#);

    let sent = h.sent(1).await;
    assert!(sent[0].text().unwrap().contains("missing url or filename"));
    h.settles_at(1).await;
}

#[tokio::test]
async fn batch_with_one_failure_settles_independently() {
    let h = Harness::start(|_| {}).await;
    h.say(
        "alice",
        &command(&[
            ("https://x/one", "one.bin"),
            ("https://x/fail", "two.bin"),
            ("https://x/three", "three.bin"),
        ]),
    );

    // 3 started, 2 × (complete + document), 1 failure, 1 summary
    let sent = h.sent(9).await;
    let texts = h.controller.texts_to("chat-1");
    assert_eq!(
        &texts[..3],
        &[
            "⬇️ Downloading one.bin...",
            "⬇️ Downloading two.bin...",
            "⬇️ Downloading three.bin...",
        ]
    );
    assert!(texts.contains(&"❌ Failed to download https://x/fail. Error: transport error: connection reset".to_string()));
    assert_eq!(texts.last().unwrap(), "📦 Batch finished: 2 succeeded, 1 failed");

    let mut documents: Vec<&str> = sent.iter().filter_map(|m| m.document_name()).collect();
    documents.sort_unstable();
    assert_eq!(documents, vec!["one.bin", "three.bin"]);
    h.settles_at(9).await;
}

#[tokio::test]
async fn duplicate_destination_is_rejected_while_first_runs() {
    let h = Harness::start(|_| {}).await;
    h.say(
        "alice",
        &command(&[("https://x/slow", "same.bin"), ("https://x/other", "same.bin")]),
    );

    let sent = h.sent(3).await;
    assert_eq!(sent[0].text(), Some("⬇️ Downloading same.bin..."));
    assert_eq!(sent[1].text(), Some("⬇️ Downloading same.bin..."));
    let rejection = sent[2].text().unwrap();
    assert!(rejection.starts_with("❌ Failed to download https://x/other."));
    assert!(rejection.contains("already in progress"));

    h.open_gate();
    let sent = h.sent(6).await;
    assert_eq!(sent[3].text(), Some("✅ Download complete. Sending same.bin..."));
    assert_eq!(sent[4].document_name(), Some("same.bin"));
    assert_eq!(sent[5].text(), Some("📦 Batch finished: 1 succeeded, 1 failed"));

    let body = std::fs::read_to_string(h.downloads().join("same.bin")).unwrap();
    assert_eq!(body, "payload:https://x/slow");
}

#[tokio::test]
async fn reconnect_mid_fetch_delivers_status_after_open() {
    let h = Harness::start(|_| {}).await;
    h.say("alice", &command(&[("https://x/slow.iso", "big.iso")]));
    h.sent(1).await;

    h.controller.go_offline();
    h.wait_for_state(ConnectionState::Closed).await;

    h.open_gate();
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !h.downloads().join("big.iso").exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    h.settles_at(1).await;

    h.controller.go_online();
    let sent = h.sent(3).await;
    assert_eq!(sent[1].text(), Some("✅ Download complete. Sending big.iso..."));
    assert_eq!(sent[2].document_name(), Some("big.iso"));
    assert!(h.session.reconnects() >= 1);
}

#[tokio::test]
async fn unauthorized_sender_is_ignored_by_default() {
    let h = Harness::start(|_| {}).await;
    h.say("mallory", &command(&[("https://x/a", "a.bin")]));
    h.settles_at(0).await;
    assert!(!h.downloads().exists());
}

#[tokio::test]
async fn unauthorized_sender_can_be_answered() {
    let h = Harness::start(|c| c.reply_unauthorized = true).await;
    h.say("mallory", "download notjson");

    let sent = h.sent(1).await;
    assert!(sent[0].text().unwrap().starts_with("⛔"));
    h.settles_at(1).await;
}

#[tokio::test]
async fn chatter_and_own_messages_are_ignored() {
    let h = Harness::start(|_| {}).await;
    h.say("alice", "hello there, please download this later");
    h.say("alice", "   ");
    assert!(h.controller.inject(
        InboundMessage::new("alice", "chat-1", command(&[("https://x/a", "a.bin")])).from_self(true)
    ));
    h.settles_at(0).await;
}

#[tokio::test]
async fn relay_targets_receive_the_file_and_it_can_be_removed() {
    let h = Harness::start(|c| {
        c.relay_targets = vec!["archive".into(), "ops".into()];
        c.delete_after_relay = true;
    })
    .await;
    h.say("alice", &command(&[("https://x/report.pdf", "report.pdf")]));

    let sent = h.sent(4).await;
    assert_eq!(sent[1].text(), Some("✅ Download complete. Sending report.pdf..."));
    assert_eq!(sent[2].target, "archive");
    assert_eq!(sent[3].target, "ops");
    assert_eq!(sent[3].document_name(), Some("report.pdf"));
    assert!(h.controller.sent().iter().all(|m| m.target != "chat-1" || m.document_name().is_none()));

    wait_until_gone(&h.downloads().join("report.pdf")).await;
}

#[tokio::test]
async fn failed_relay_keeps_the_file() {
    let h = Harness::start(|c| {
        c.relay_targets = vec!["archive".into()];
        c.delete_after_relay = true;
    })
    .await;
    h.controller.reject_target("archive");
    h.say("alice", &command(&[("https://x/keep.zip", "keep.zip")]));

    let sent = h.sent(2).await;
    assert_eq!(sent[1].text(), Some("✅ Download complete. Sending keep.zip..."));
    h.settles_at(2).await;
    assert!(h.downloads().join("keep.zip").is_file());
}

#[tokio::test]
async fn logout_ends_the_run_loop() {
    let h = Harness::start(|_| {}).await;
    h.controller.log_out();

    let result = tokio::time::timeout(TEST_TIMEOUT, h.run).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(Error::Channel(ChannelError::LoggedOut { .. }))
    ));
}
