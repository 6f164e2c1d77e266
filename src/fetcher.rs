//! # Artifact Fetcher
//!
//! Downloads a generated image to its target path. The body is streamed into
//! a temporary file next to the target and only renamed into place once the
//! whole body arrived, so a failed transfer never leaves a truncated file at
//! the target.

use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::illustration_errors::FetchError;

/// Transport seam for downloading candidate images
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// GET `url` and persist the body at `target`, returning the byte count
    async fn fetch_to_file(&self, url: &str, target: &Path) -> Result<u64, FetchError>;
}

/// Streaming downloader built on reqwest
pub struct ReqwestFetcher {
    client: Client,
    timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn map_transport(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout.as_secs())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch_to_file(&self, url: &str, target: &Path) -> Result<u64, FetchError> {
        debug!(url = %url, target = %target.display(), "Starting download");

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staging = NamedTempFile::new_in(dir).map_err(|e| FetchError::Io(e.to_string()))?;
        let mut file = staging
            .as_file()
            .try_clone()
            .map(tokio::fs::File::from_std)
            .map_err(|e| FetchError::Io(e.to_string()))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_transport(e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Io(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| FetchError::Io(e.to_string()))?;
        drop(file);

        staging
            .persist(target)
            .map_err(|e| FetchError::Io(e.error.to_string()))?;

        info!(url = %url, target = %target.display(), bytes = written, "Download saved");
        Ok(written)
    }
}
