use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;

/// Record of a fetched artifact. Plain data; it travels between chain
/// steps and is dropped once the parsed report is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub url: String,
    pub file_path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
}

/// Streams a URL to disk with redirect-follow and a total timeout. The
/// instance endpoint answers with a 302 before the artifact, so redirects
/// are part of the happy path.
pub struct Downloader {
    http: Client,
    timeout: Duration,
}

impl Downloader {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, DownloadError> {
        let http = Client::builder()
            .user_agent(user_agent.to_string())
            .redirect(Policy::limited(10))
            .timeout(timeout)
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        Ok(Downloader { http, timeout })
    }

    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        // An artifact already on disk is reused rather than refetched;
        // at-most-once semantics per report live in the orchestrator.
        if let Ok(meta) = tokio::fs::metadata(destination).await {
            if meta.len() > 0 {
                debug!("reusing existing artifact at {:?}", destination);
                return self.outcome_from_existing(url, destination, meta.len()).await;
            }
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!("downloading {} -> {:?}", url, destination);
        let response = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::Timeout(self.timeout)
            } else {
                DownloadError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    DownloadError::Timeout(self.timeout)
                } else {
                    DownloadError::Network(e.to_string())
                }
            })?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let sha256 = hex_digest(hasher);
        info!("downloaded {} bytes from {} ({})", bytes, url, sha256);

        Ok(DownloadOutcome {
            url: url.to_string(),
            file_path: destination.to_path_buf(),
            bytes,
            sha256,
            fetched_at: Utc::now(),
        })
    }

    async fn outcome_from_existing(
        &self,
        url: &str,
        destination: &Path,
        bytes: u64,
    ) -> Result<DownloadOutcome, DownloadError> {
        let content = tokio::fs::read(destination).await?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Ok(DownloadOutcome {
            url: url.to_string(),
            file_path: destination.to_path_buf(),
            bytes,
            sha256: hex_digest(hasher),
            fetched_at: Utc::now(),
        })
    }
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_existing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("19052421.xbrl");
        tokio::fs::write(&dest, b"<xbrl/>").await.unwrap();

        let downloader = Downloader::new("test-agent", Duration::from_secs(5)).unwrap();
        let outcome = downloader
            .download("http://127.0.0.1:1/never-hit", &dest)
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 7);
        assert_eq!(outcome.sha256.len(), 64);
        assert_eq!(outcome.file_path, dest);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.xbrl");
        let downloader = Downloader::new("test-agent", Duration::from_secs(2)).unwrap();
        let err = downloader
            .download("http://127.0.0.1:1/nothing", &dest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Network(_) | DownloadError::Timeout(_)
        ));
    }
}
