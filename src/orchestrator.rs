//! Orchestrator — the control loop binding session, parser and jobs.
//!
//! The inbound loop only parses and submits; every fetch command gets its
//! own batch task that waits for the jobs and reports each one as it
//! settles. A slow transfer therefore never blocks the next message.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::command::{Command, CommandParser, FetchItem, FetchKind, FetchRequest, InvalidReason, usage};
use crate::config::BotConfig;
use crate::error::{ChannelError, Error, FetchError, RelayError};
use crate::jobs::{JobHandle, JobSpec, JobTracker};
use crate::session::{ConnectionState, InboundMessage, OutgoingContent, SessionAdapter};

/// Outcome counts for one fetch command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub fn downloading_notice(filename: &str) -> String {
    format!("⬇️ Downloading {filename}...")
}

pub fn completed_notice(filename: &str) -> String {
    format!("✅ Download complete. Sending {filename}...")
}

pub fn failed_notice(source_ref: &str, reason: &str) -> String {
    format!("❌ Failed to download {source_ref}. Error: {reason}")
}

pub fn batch_summary(report: &BatchReport) -> String {
    format!(
        "📦 Batch finished: {} succeeded, {} failed",
        report.succeeded, report.failed
    )
}

/// Corrective reply for a refused command.
pub fn invalid_reply(keyword: &str, reason: InvalidReason, detail: &str) -> String {
    match reason {
        InvalidReason::Unauthorized => "⛔ You are not allowed to request downloads.".to_string(),
        InvalidReason::MalformedPayload => {
            format!("❌ Invalid JSON format. Example:\n{}", usage(keyword))
        }
        InvalidReason::MissingField | InvalidReason::UnsafeFilename => {
            format!("❌ Invalid format: {detail}. Example:\n{}", usage(keyword))
        }
    }
}

/// MIME type guessed from the file extension.
pub fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

/// What a batch task needs; cheap to clone into spawned tasks.
#[derive(Clone)]
struct Reporter {
    session: Arc<SessionAdapter>,
    tracker: Arc<JobTracker>,
    delete_after_relay: bool,
}

struct Submitted {
    item: FetchItem,
    handle: JobHandle,
}

pub struct Orchestrator {
    config: Arc<BotConfig>,
    parser: CommandParser,
    reporter: Reporter,
}

impl Orchestrator {
    pub fn new(config: BotConfig, tracker: Arc<JobTracker>, session: Arc<SessionAdapter>) -> Self {
        let parser = CommandParser::new(config.allow_list.clone(), config.keywords.clone());
        let reporter = Reporter {
            session,
            tracker,
            delete_after_relay: config.delete_after_relay,
        };
        Self {
            config: Arc::new(config),
            parser,
            reporter,
        }
    }

    /// Run until Ctrl-C, the end of the inbound stream, or a logout.
    ///
    /// A logout is returned as `ChannelError::LoggedOut`.
    pub async fn run(&self) -> Result<(), Error> {
        let session = &self.reporter.session;
        let mut inbound = session.start().await?;

        loop {
            let message = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down...");
                    session.shutdown();
                    return Ok(());
                }
                msg = inbound.next() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };

            if let Err(e) = self.handle_message(&message).await {
                tracing::error!(
                    sender = %message.sender,
                    conversation = %message.conversation,
                    "Error handling message: {}",
                    e
                );
                let _ = session.send(&message.conversation, OutgoingContent::text(format!("❌ {e}")));
            }
        }

        if session.connection_state() == ConnectionState::LoggedOut {
            return Err(ChannelError::LoggedOut {
                name: session.name().to_string(),
            }
            .into());
        }
        tracing::info!("Inbound stream ended, shutting down...");
        Ok(())
    }

    /// Handle one inbound message. Fetch commands return their batch task.
    pub async fn handle_message(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<JoinHandle<BatchReport>>, Error> {
        if message.from_self {
            tracing::trace!(conversation = %message.conversation, "Ignoring own message");
            return Ok(None);
        }
        if message.text.trim().is_empty() {
            return Ok(None);
        }

        match self
            .parser
            .parse(&message.sender, &message.conversation, &message.text)
        {
            Command::Echo { sender, text } => {
                tracing::debug!(sender = %sender, text = %text, "Ignoring non-command message");
                Ok(None)
            }
            Command::Invalid {
                sender,
                conversation,
                keyword,
                reason,
                detail,
            } => {
                self.reject(&sender, &conversation, &keyword, reason, &detail);
                Ok(None)
            }
            Command::FetchHttp(request) => self.dispatch(request, FetchKind::Http).await.map(Some),
            Command::FetchTorrent(request) => {
                self.dispatch(request, FetchKind::Torrent).await.map(Some)
            }
        }
    }

    fn reject(
        &self,
        sender: &str,
        conversation: &str,
        keyword: &str,
        reason: InvalidReason,
        detail: &str,
    ) {
        if reason == InvalidReason::Unauthorized {
            tracing::warn!(sender, keyword, "Unauthorized command attempt");
            if !self.config.reply_unauthorized {
                return;
            }
        } else {
            tracing::info!(sender, keyword, %reason, detail, "Rejected command");
        }
        let _ = self.reporter.session.send(
            conversation,
            OutgoingContent::text(invalid_reply(keyword, reason, detail)),
        );
    }

    async fn dispatch(
        &self,
        request: FetchRequest,
        kind: FetchKind,
    ) -> Result<JoinHandle<BatchReport>, Error> {
        let download_dir = &self.config.download_dir;
        tokio::fs::create_dir_all(download_dir)
            .await
            .map_err(FetchError::from)?;

        let conversation = request.conversation;
        let relay_targets = self.config.relay_targets_for(&conversation);
        tracing::info!(
            sender = %request.sender,
            conversation = %conversation,
            %kind,
            items = request.items.len(),
            "Dispatching fetch command"
        );

        let session = &self.reporter.session;
        let mut submitted = Vec::with_capacity(request.items.len());
        let mut rejected = 0;

        for item in request.items {
            let _ = session.send(&conversation, OutgoingContent::text(downloading_notice(&item.filename)));

            let spec = JobSpec {
                source_ref: item.source_ref.clone(),
                destination: download_dir.join(&item.filename),
                kind,
                file_index: item.file_index,
                requester: conversation.clone(),
                relay_targets: relay_targets.clone(),
            };
            match self.reporter.tracker.submit(spec).await {
                Ok(handle) => submitted.push(Submitted { item, handle }),
                Err(e) => {
                    rejected += 1;
                    let _ = session.send(
                        &conversation,
                        OutgoingContent::text(failed_notice(&item.source_ref, &e.to_string())),
                    );
                }
            }
        }

        let reporter = self.reporter.clone();
        Ok(tokio::spawn(async move {
            reporter
                .run_batch(conversation, relay_targets, submitted, rejected)
                .await
        }))
    }
}

impl Reporter {
    async fn run_batch(
        self,
        conversation: String,
        relay_targets: Vec<String>,
        submitted: Vec<Submitted>,
        rejected: usize,
    ) -> BatchReport {
        let settled = join_all(
            submitted
                .into_iter()
                .map(|s| self.settle(&conversation, &relay_targets, s)),
        )
        .await;

        let succeeded = settled.iter().filter(|ok| **ok).count();
        let report = BatchReport {
            succeeded,
            failed: settled.len() - succeeded + rejected,
        };

        if report.total() > 1 {
            let _ = self
                .session
                .send(&conversation, OutgoingContent::text(batch_summary(&report)));
        }
        tracing::info!(
            conversation = %conversation,
            succeeded = report.succeeded,
            failed = report.failed,
            "Batch finished"
        );
        report
    }

    /// Wait for one job, report it, relay its file. Returns whether it succeeded.
    async fn settle(&self, conversation: &str, relay_targets: &[String], submitted: Submitted) -> bool {
        let Submitted { item, handle } = submitted;
        let id = handle.id();
        let outcome = handle.wait().await;

        if let Some(job) = self.tracker.snapshot(id).await {
            tracing::debug!(
                job_id = %id,
                state = %job.state,
                elapsed_ms = job.elapsed().map(|d| d.as_millis() as u64),
                "Job settled"
            );
        }

        let succeeded = match outcome {
            Ok(path) => {
                let _ = self
                    .session
                    .send(conversation, OutgoingContent::text(completed_notice(&item.filename)));
                self.relay(&path, relay_targets).await;
                true
            }
            Err(e) => {
                let _ = self.session.send(
                    conversation,
                    OutgoingContent::text(failed_notice(&item.source_ref, &e.to_string())),
                );
                false
            }
        };

        if let Err(e) = self.tracker.release(id).await {
            tracing::warn!(job_id = %id, error = %e, "Could not release job");
        }
        succeeded
    }

    /// Send the finished file to every relay target. Failures are logged
    /// and never undo the job's success.
    async fn relay(&self, path: &Path, targets: &[String]) {
        let errors = match self.relay_to(path, targets).await {
            Ok(errors) => errors,
            Err(e) => vec![e],
        };
        for e in &errors {
            tracing::error!(path = %path.display(), error = %e, "Relay failed");
        }

        if errors.is_empty() && self.delete_after_relay {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::info!(path = %path.display(), "Removed relayed file"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove relayed file"),
            }
        }
    }

    async fn relay_to(&self, path: &Path, targets: &[String]) -> Result<Vec<RelayError>, RelayError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| RelayError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = mime_for(path);

        let deliveries: Vec<_> = targets
            .iter()
            .map(|target| {
                let delivery = self.session.send(
                    target,
                    OutgoingContent::Document {
                        bytes: bytes.clone(),
                        mime_type: mime_type.clone(),
                        filename: filename.clone(),
                    },
                );
                (target, delivery)
            })
            .collect();

        let mut errors = Vec::new();
        for (target, delivery) in deliveries {
            match delivery.wait().await {
                Ok(()) => tracing::info!(target = %target, filename = %filename, "File relayed"),
                Err(source) => errors.push(RelayError::Delivery {
                    target: target.clone(),
                    source,
                }),
            }
        }
        Ok(errors)
    }
}
