//! librqbit-backed swarm client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session};

use crate::error::FetchError;
use crate::fetch::torrent::{MagnetLink, SwarmClient, SwarmFile, SwarmSession};
use crate::fetch::Progress;

const PROGRESS_POLL: Duration = Duration::from_secs(1);

fn transport(e: anyhow::Error) -> FetchError {
    FetchError::Transport(format!("{e:#}"))
}

/// One librqbit session shared by every torrent job.
pub struct RqbitSwarm {
    session: Arc<Session>,
}

impl RqbitSwarm {
    pub async fn new(default_output: PathBuf) -> anyhow::Result<Self> {
        let session = Session::new(default_output).await?;
        Ok(Self { session })
    }
}

#[async_trait]
impl SwarmClient for RqbitSwarm {
    async fn join(
        &self,
        magnet: &MagnetLink,
        staging: &Path,
    ) -> Result<Box<dyn SwarmSession>, FetchError> {
        let response = self
            .session
            .add_torrent(
                AddTorrent::from_url(magnet.as_str()),
                Some(AddTorrentOptions {
                    list_only: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(transport)?;

        let AddTorrentResponse::ListOnly(listing) = response else {
            return Err(FetchError::Transport(
                "swarm did not return a file listing".to_string(),
            ));
        };

        let files = match &listing.info.files {
            Some(files) => files
                .iter()
                .enumerate()
                .map(|(index, file)| SwarmFile {
                    index,
                    path: file
                        .path
                        .iter()
                        .map(|part| String::from_utf8_lossy(part.as_ref()).into_owned())
                        .collect(),
                    length: file.length,
                })
                .collect(),
            None => vec![SwarmFile {
                index: 0,
                path: listing
                    .info
                    .name
                    .as_ref()
                    .map(|name| String::from_utf8_lossy(name.as_ref()).into_owned())
                    .unwrap_or_else(|| magnet.info_hash().to_string())
                    .into(),
                length: listing.info.length.unwrap_or(0),
            }],
        };

        Ok(Box::new(RqbitTorrent {
            session: Arc::clone(&self.session),
            magnet: magnet.as_str().to_string(),
            staging: staging.to_path_buf(),
            files,
            added: None,
        }))
    }
}

struct RqbitTorrent {
    session: Arc<Session>,
    magnet: String,
    staging: PathBuf,
    files: Vec<SwarmFile>,
    /// Set only when this job added the torrent; only then is it removed on close.
    added: Option<usize>,
}

#[async_trait]
impl SwarmSession for RqbitTorrent {
    fn files(&self) -> &[SwarmFile] {
        &self.files
    }

    async fn download(&mut self, index: usize, progress: &Progress) -> Result<PathBuf, FetchError> {
        let response = self
            .session
            .add_torrent(
                AddTorrent::from_url(self.magnet.as_str()),
                Some(AddTorrentOptions {
                    only_files: Some(vec![index]),
                    output_folder: Some(self.staging.to_string_lossy().into_owned()),
                    overwrite: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(transport)?;

        // Same-hash jobs run one at a time; an already managed torrent has
        // another file selection and output folder. Neither reuse nor remove it.
        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, _) => {
                return Err(FetchError::Transport(format!(
                    "torrent is already active in the swarm session (id {id})"
                )));
            }
            AddTorrentResponse::ListOnly(_) => {
                return Err(FetchError::Transport(
                    "swarm returned a listing instead of a download".to_string(),
                ));
            }
        };
        self.added = Some(id);

        let poll = async {
            loop {
                let stats = handle.stats();
                if stats.total_bytes > 0 {
                    progress.report(stats.progress_bytes as f64 / stats.total_bytes as f64);
                }
                tokio::time::sleep(PROGRESS_POLL).await;
            }
        };

        tokio::select! {
            done = handle.wait_until_completed() => done.map_err(transport)?,
            _ = poll => {}
        }

        let relative = self
            .files
            .iter()
            .find(|f| f.index == index)
            .map(|f| f.path.clone())
            .ok_or(FetchError::FileNotInTorrent {
                index,
                count: self.files.len(),
            })?;
        Ok(self.staging.join(relative))
    }

    async fn close(self: Box<Self>) {
        if let Some(id) = self.added {
            if let Err(e) = self.session.delete(id.into(), false).await {
                tracing::warn!(torrent_id = id, "Failed to remove torrent from swarm session: {e:#}");
            }
        }
    }
}
