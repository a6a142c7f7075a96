//! Job state machine.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::command::FetchKind;

/// State of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for a fetch slot.
    Queued,
    /// Fetcher is working on it.
    Running,
    /// File is complete at the destination.
    Succeeded,
    /// Fetcher gave up; carries the sender-readable reason.
    Failed(String),
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: &JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Failed(_)) | (Running, Succeeded) | (Running, Failed(_))
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }

    /// Check if the job still occupies its destination path.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    pub timestamp: DateTime<Utc>,
}

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub source_ref: String,
    pub destination: PathBuf,
    pub kind: FetchKind,
    /// Designated file inside a torrent.
    pub file_index: Option<usize>,
    /// Conversation to notify.
    pub requester: String,
    /// Destinations receiving the completed file, in order.
    pub relay_targets: Vec<String>,
}

/// One unit of acquisition work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub source_ref: String,
    pub destination: PathBuf,
    pub kind: FetchKind,
    pub file_index: Option<usize>,
    pub state: JobState,
    pub requester: String,
    pub relay_targets: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let mut relay_targets: Vec<String> = Vec::with_capacity(spec.relay_targets.len());
        for target in spec.relay_targets {
            if !relay_targets.contains(&target) {
                relay_targets.push(target);
            }
        }

        Self {
            id: Uuid::new_v4(),
            source_ref: spec.source_ref,
            destination: spec.destination,
            kind: spec.kind,
            file_index: spec.file_index,
            state: JobState::Queued,
            requester: spec.requester,
            relay_targets,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(&new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state.clone(),
            to: new_state.clone(),
            timestamp: now,
        });

        match new_state {
            JobState::Running => self.started_at = Some(now),
            JobState::Succeeded | JobState::Failed(_) => self.finished_at = Some(now),
            JobState::Queued => {}
        }
        self.state = new_state;

        Ok(())
    }

    /// Time spent running, if it has started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start).to_std().unwrap_or_default()
        })
    }

    /// Destination file name, for messages.
    pub fn display_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.destination.display().to_string())
    }
}
