//! Swarm/torrent fetcher.
//!
//! The peer-swarm client itself sits behind [`SwarmClient`]; this module owns
//! magnet validation, choosing the designated file, moving it into place and
//! making sure every joined swarm session is closed again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::fetch::{FetchTarget, Fetcher, Progress, remove_if_exists};

/// 40 hex characters or 32 base32 characters.
static INFO_HASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9a-fA-F]{40}|[A-Za-z2-7]{32})$").expect("static regex is valid")
});

/// A validated `magnet:?xt=urn:btih:...` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    uri: String,
    info_hash: String,
    display_name: Option<String>,
}

impl MagnetLink {
    pub fn parse(source: &str) -> Result<Self, FetchError> {
        let source = source.trim();
        let invalid = |why: &str| FetchError::InvalidReference(format!("{why}: {source}"));

        let url = reqwest::Url::parse(source).map_err(|_| invalid("not a URI"))?;
        if url.scheme() != "magnet" {
            return Err(invalid("not a magnet link"));
        }

        let mut info_hash = None;
        let mut display_name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        if INFO_HASH.is_match(hash) {
                            info_hash = Some(hash.to_ascii_lowercase());
                        }
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| invalid("missing or malformed urn:btih info hash"))?;
        Ok(Self {
            uri: source.to_string(),
            info_hash,
            display_name,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// Lower-cased info hash as given in the link.
    pub fn info_hash(&self) -> &str {
        &self.info_hash
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

/// One entry of a torrent's file set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmFile {
    pub index: usize,
    /// Path inside the torrent.
    pub path: PathBuf,
    pub length: u64,
}

/// Peer-swarm client.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Join the swarm for `magnet`, resolving its metadata. Payload goes under `staging`.
    async fn join(
        &self,
        magnet: &MagnetLink,
        staging: &Path,
    ) -> Result<Box<dyn SwarmSession>, FetchError>;
}

/// A joined swarm. Must be closed with [`SwarmSession::close`].
#[async_trait]
pub trait SwarmSession: Send {
    fn files(&self) -> &[SwarmFile];

    /// Download only file `index`; resolves to its completed path on disk.
    async fn download(&mut self, index: usize, progress: &Progress) -> Result<PathBuf, FetchError>;

    /// Leave the swarm and release its resources.
    async fn close(self: Box<Self>);
}

/// Stand-in client for builds without a swarm backend; every join fails.
pub struct UnavailableSwarm;

#[async_trait]
impl SwarmClient for UnavailableSwarm {
    async fn join(
        &self,
        _magnet: &MagnetLink,
        _staging: &Path,
    ) -> Result<Box<dyn SwarmSession>, FetchError> {
        Err(FetchError::Transport(
            "torrent support is not compiled in (build with --features rqbit)".to_string(),
        ))
    }
}

/// Fetches the designated file of a magnet link through a [`SwarmClient`].
///
/// Jobs for the same info hash take turns: a swarm backend manages one
/// torrent per hash, so two jobs picking different files of it would
/// share (and tear down) each other's download.
pub struct TorrentFetcher {
    client: Arc<dyn SwarmClient>,
    staging_root: PathBuf,
    timeout: Option<Duration>,
    turns: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TorrentFetcher {
    pub fn new(client: Arc<dyn SwarmClient>, staging_root: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            client,
            staging_root,
            timeout,
            turns: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until no other job holds the swarm for `info_hash`.
    async fn swarm_turn(&self, info_hash: &str) -> OwnedMutexGuard<()> {
        let turn = {
            let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
            turns.retain(|_, turn| Arc::strong_count(turn) > 1);
            Arc::clone(turns.entry(info_hash.to_string()).or_default())
        };
        turn.lock_owned().await
    }

    async fn acquire(
        &self,
        magnet: &MagnetLink,
        target: FetchTarget<'_>,
        staging: &Path,
        progress: &Progress,
    ) -> Result<(), FetchError> {
        let _turn = self.swarm_turn(magnet.info_hash()).await;
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut session = self
            .within(deadline, self.client.join(magnet, staging))
            .await??;

        let outcome = self
            .within(
                deadline,
                download_designated(session.as_mut(), target, progress),
            )
            .await
            .and_then(|r| r);

        session.close().await;
        tracing::debug!(job_id = %target.job_id, info_hash = magnet.info_hash(), "Swarm session closed");
        outcome
    }

    async fn within<F: std::future::Future>(
        &self,
        deadline: Option<Instant>,
        fut: F,
    ) -> Result<F::Output, FetchError> {
        match (deadline, self.timeout) {
            (Some(deadline), Some(timeout)) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| FetchError::Timeout(timeout)),
            _ => Ok(fut.await),
        }
    }
}

#[async_trait]
impl Fetcher for TorrentFetcher {
    fn name(&self) -> &str {
        "torrent"
    }

    async fn fetch(&self, target: FetchTarget<'_>, progress: &Progress) -> Result<(), FetchError> {
        let magnet = MagnetLink::parse(target.source_ref)?;
        let staging = self.staging_root.join(target.job_id.to_string());
        tokio::fs::create_dir_all(&staging).await?;

        tracing::info!(
            job_id = %target.job_id,
            info_hash = magnet.info_hash(),
            name = magnet.display_name().unwrap_or("-"),
            "Joining swarm"
        );

        let outcome = self.acquire(&magnet, target, &staging, progress).await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(path = %staging.display(), "Failed to remove swarm staging dir: {e}");
        }
        outcome
    }
}

async fn download_designated(
    session: &mut dyn SwarmSession,
    target: FetchTarget<'_>,
    progress: &Progress,
) -> Result<(), FetchError> {
    let files = session.files();
    let index = designated_file(files, target.file_index)?;

    let completed = session.download(index, progress).await?;
    move_into_place(&completed, target.destination).await?;
    progress.report(1.0);
    Ok(())
}

/// The requested index, or the largest file when none was given.
fn designated_file(files: &[SwarmFile], requested: Option<usize>) -> Result<usize, FetchError> {
    if files.is_empty() {
        return Err(FetchError::EmptyTorrent);
    }
    match requested {
        Some(index) if files.iter().any(|f| f.index == index) => Ok(index),
        Some(index) => Err(FetchError::FileNotInTorrent {
            index,
            count: files.len(),
        }),
        None => Ok(files
            .iter()
            .max_by(|a, b| a.length.cmp(&b.length).then(b.index.cmp(&a.index)))
            .map(|f| f.index)
            .unwrap_or(0)),
    }
}

/// Rename, falling back to copy + remove across filesystems.
async fn move_into_place(from: &Path, to: &Path) -> Result<(), FetchError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    if let Err(e) = tokio::fs::copy(from, to).await {
        let _ = remove_if_exists(to).await;
        return Err(FetchError::Storage(format!(
            "moving {} to {}: {e}",
            from.display(),
            to.display()
        )));
    }
    remove_if_exists(from).await?;
    Ok(())
}
