//! Job tracker — owns every job's lifecycle and runs its fetch.
//!
//! Jobs run on their own tokio tasks. The only shared resource is the
//! destination namespace: a path with a Queued/Running job cannot be
//! submitted again until that job is terminal.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{RwLock, Semaphore, oneshot, watch};
use uuid::Uuid;

use crate::error::{FetchError, JobError};
use crate::fetch::{FetchTarget, FetcherSet, Progress};
use crate::jobs::state::{Job, JobSpec, JobState};

/// Caller's side of a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    destination: PathBuf,
    result: oneshot::Receiver<Result<PathBuf, FetchError>>,
    progress: watch::Receiver<f64>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Fraction complete, monotonically non-decreasing.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    /// Wait for the terminal state. `Ok` carries the completed file.
    pub async fn wait(self) -> Result<PathBuf, FetchError> {
        self.result.await.unwrap_or_else(|_| {
            Err(FetchError::Transport(
                "job ended without reporting a result".to_string(),
            ))
        })
    }
}

/// Tracks acquisition jobs from submission until they are released.
pub struct JobTracker {
    jobs: RwLock<HashMap<Uuid, Job>>,
    fetchers: FetcherSet,
    slots: Arc<Semaphore>,
}

impl JobTracker {
    /// Create a tracker running at most `max_concurrent` fetches at once.
    pub fn new(fetchers: FetcherSet, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            fetchers,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    /// Accept a job and start it. Fails if its destination is already taken.
    pub async fn submit(self: &Arc<Self>, mut spec: JobSpec) -> Result<JobHandle, JobError> {
        spec.destination = normalize_lexical(&spec.destination);

        let mut jobs = self.jobs.write().await;
        if jobs
            .values()
            .any(|j| j.state.is_active() && j.destination == spec.destination)
        {
            tracing::warn!(
                destination = %spec.destination.display(),
                "Rejected job: destination already in progress"
            );
            return Err(JobError::DuplicateDestination {
                path: spec.destination,
            });
        }

        let job = Job::new(spec);
        let id = job.id;
        let destination = job.destination.clone();
        tracing::info!(
            job_id = %id,
            kind = %job.kind,
            source = %job.source_ref,
            destination = %destination.display(),
            "Job queued"
        );
        jobs.insert(id, job);
        drop(jobs);

        let (result_tx, result_rx) = oneshot::channel();
        let (progress, progress_rx) = Progress::channel();
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tracker.run(id, progress).await;
            let _ = result_tx.send(outcome);
        });

        Ok(JobHandle {
            id,
            destination,
            result: result_rx,
            progress: progress_rx,
        })
    }

    /// Current state of a job, if still tracked.
    pub async fn status(&self, id: Uuid) -> Option<JobState> {
        self.jobs.read().await.get(&id).map(|j| j.state.clone())
    }

    /// Full copy of a job, if still tracked.
    pub async fn snapshot(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Number of Queued/Running jobs.
    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.state.is_active())
            .count()
    }

    /// Evict a terminal job whose result has been delivered.
    pub async fn release(&self, id: Uuid) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get(&id).ok_or(JobError::NotFound { id })?;
        if job.state.is_active() {
            return Err(JobError::InvalidTransition {
                id,
                state: job.state.to_string(),
                target: "released".to_string(),
            });
        }
        jobs.remove(&id).ok_or(JobError::NotFound { id })
    }

    async fn transition(&self, id: Uuid, state: JobState) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        job.transition_to(state.clone())
            .map_err(|_| JobError::InvalidTransition {
                id,
                state: job.state.to_string(),
                target: state.to_string(),
            })?;
        Ok(job.clone())
    }

    async fn run(&self, id: Uuid, progress: Progress) -> Result<PathBuf, FetchError> {
        let outcome = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(_permit) => self.execute(id, &progress).await,
            Err(_) => Err(FetchError::Transport("job tracker is shutting down".to_string())),
        };

        let terminal = match &outcome {
            Ok(_) => JobState::Succeeded,
            Err(e) => JobState::Failed(e.to_string()),
        };
        match self.transition(id, terminal).await {
            Ok(job) => match &job.state {
                JobState::Failed(reason) => tracing::warn!(
                    job_id = %id,
                    source = %job.source_ref,
                    elapsed_ms = job.elapsed().map(|d| d.as_millis() as u64),
                    "Job failed: {reason}"
                ),
                _ => tracing::info!(
                    job_id = %id,
                    destination = %job.destination.display(),
                    elapsed_ms = job.elapsed().map(|d| d.as_millis() as u64),
                    "Job succeeded"
                ),
            },
            Err(e) => tracing::error!(job_id = %id, "Could not record job outcome: {e}"),
        }
        outcome
    }

    async fn execute(&self, id: Uuid, progress: &Progress) -> Result<PathBuf, FetchError> {
        let job = self
            .transition(id, JobState::Running)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        tracing::debug!(job_id = %id, "Job running");

        if let Some(parent) = job.destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let fetcher = self.fetchers.get(job.kind);
        let target = FetchTarget {
            job_id: id,
            source_ref: &job.source_ref,
            destination: &job.destination,
            file_index: job.file_index,
        };

        let fetched = AssertUnwindSafe(fetcher.fetch(target, progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Transport(format!(
                    "{} fetcher panicked",
                    fetcher.name()
                )))
            });
        fetched?;

        match tokio::fs::metadata(&job.destination).await {
            Ok(meta) if meta.is_file() => Ok(job.destination),
            Ok(_) => Err(FetchError::Storage(format!(
                "{} is not a regular file",
                job.destination.display()
            ))),
            Err(e) => Err(FetchError::Storage(format!(
                "{} missing after fetch: {e}",
                job.destination.display()
            ))),
        }
    }
}

/// Drop `.` components and fold `..` lexically so equal paths compare equal.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}
