//! Fetcher strategies — retrieve one resource into a local file.
//!
//! - `http` — streaming GET into a temporary sibling, renamed on completion
//! - `torrent` — magnet validation and swarm download behind [`SwarmClient`]
//! - `rqbit` — librqbit-backed [`SwarmClient`] (feature `rqbit`)

pub mod http;
#[cfg(feature = "rqbit")]
pub mod rqbit;
pub mod torrent;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::command::FetchKind;
use crate::error::FetchError;

pub use http::HttpFetcher;
pub use torrent::{
    MagnetLink, SwarmClient, SwarmFile, SwarmSession, TorrentFetcher, UnavailableSwarm,
};

/// Everything a fetcher needs to know about one job.
#[derive(Debug, Clone, Copy)]
pub struct FetchTarget<'a> {
    pub job_id: Uuid,
    pub source_ref: &'a str,
    pub destination: &'a Path,
    pub file_index: Option<usize>,
}

/// Fraction-complete reporter. Never moves backwards.
#[derive(Debug, Clone)]
pub struct Progress {
    tx: Arc<watch::Sender<f64>>,
}

impl Progress {
    pub fn channel() -> (Self, watch::Receiver<f64>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Record a new fraction in `[0, 1]`; smaller values than the last one are ignored.
    pub fn report(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> f64 {
        *self.tx.borrow()
    }
}

/// Strategy retrieving bytes from a source identifier into a local file.
///
/// On `Ok(())` the destination holds the complete file. On error nothing
/// partial is left at the destination.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, target: FetchTarget<'_>, progress: &Progress) -> Result<(), FetchError>;
}

/// The fetcher per command kind.
#[derive(Clone)]
pub struct FetcherSet {
    http: Arc<dyn Fetcher>,
    torrent: Arc<dyn Fetcher>,
}

impl FetcherSet {
    pub fn new(http: Arc<dyn Fetcher>, torrent: Arc<dyn Fetcher>) -> Self {
        Self { http, torrent }
    }

    pub fn get(&self, kind: FetchKind) -> &Arc<dyn Fetcher> {
        match kind {
            FetchKind::Http => &self.http,
            FetchKind::Torrent => &self.torrent,
        }
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let (progress, rx) = Progress::channel();
        progress.report(0.5);
        progress.report(0.25);
        assert_eq!(*rx.borrow(), 0.5);

        progress.report(2.0);
        assert_eq!(progress.current(), 1.0);

        progress.report(f64::NAN);
        assert_eq!(progress.current(), 1.0);
    }

    #[test]
    fn progress_works_without_receivers() {
        let (progress, rx) = Progress::channel();
        drop(rx);
        progress.report(0.3);
        assert_eq!(progress.current(), 0.3);
    }

    #[tokio::test]
    async fn remove_if_exists_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        remove_if_exists(&path).await.unwrap();

        tokio::fs::write(&path, b"x").await.unwrap();
        remove_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }
}
