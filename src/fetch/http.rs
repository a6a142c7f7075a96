//! Streaming HTTP fetcher.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::FetchError;
use crate::fetch::{FetchTarget, Fetcher, Progress, remove_if_exists};

/// Upper bound for establishing the connection, within the total timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads a URL with a bounded total-operation timeout.
///
/// The body is streamed into `.<name>.<job id>.part` next to the
/// destination and renamed over it once fully written and synced.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(describe(&e))
        }
    }

    async fn stream_to(
        &self,
        url: reqwest::Url,
        partial: &Path,
        progress: &Progress,
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?
            .error_for_status()
            .map_err(|e| self.classify(e))?;

        let total = response.content_length().filter(|len| *len > 0);
        let mut file = tokio::fs::File::create(partial).await?;
        let mut written: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.classify(e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                progress.report(written as f64 / total as f64);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, target: FetchTarget<'_>, progress: &Progress) -> Result<(), FetchError> {
        let url = parse_http_url(target.source_ref)?;
        let partial = partial_path(target.destination, target.job_id);

        let outcome = match self.stream_to(url, &partial, progress).await {
            Ok(bytes) => tokio::fs::rename(&partial, target.destination)
                .await
                .map(|()| bytes)
                .map_err(FetchError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(bytes) => {
                progress.report(1.0);
                tracing::debug!(
                    job_id = %target.job_id,
                    bytes,
                    destination = %target.destination.display(),
                    "HTTP fetch complete"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&partial).await {
                    tracing::warn!(
                        path = %partial.display(),
                        "Failed to remove partial download: {cleanup}"
                    );
                }
                Err(e)
            }
        }
    }
}

fn parse_http_url(source: &str) -> Result<reqwest::Url, FetchError> {
    let url = reqwest::Url::parse(source.trim())
        .map_err(|e| FetchError::InvalidReference(format!("{source}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidReference(format!(
            "unsupported scheme '{other}' in {source}"
        ))),
    }
}

/// `dir/name.ext` → `dir/.name.ext.<job id>.part`
///
/// The job id keeps the scratch file from landing on another job's
/// destination, e.g. one named `.name.ext.part`.
fn partial_path(destination: &Path, job_id: Uuid) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    destination.with_file_name(format!(".{name}.{job_id}.part"))
}

/// Error text including its source chain, so "error decoding response body"
/// carries the underlying cause.
fn describe(e: &reqwest::Error) -> String {
    let mut text = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
