use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::error::PipelineError;

const USER_AGENT: &str = concat!("sifter-digest/", env!("CARGO_PKG_VERSION"));

const BACKOFF_DELAYS: [u64; 3] = [1, 2, 4];
const MAX_ATTEMPTS: usize = 3;

/// Streaming episode downloader with bounded retries.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    /// `timeout` bounds the wall clock of a single download attempt.
    pub fn new(timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Download `url` to `dest` with streamed writes; returns the byte count.
    ///
    /// Up to 3 attempts with 1s/2s backoff. A partial file from a failed
    /// attempt is removed before retrying.
    pub async fn download_to_file(&self, url: &str, dest: &Path) -> Result<u64, PipelineError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.try_download(url, dest).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    let _ = tokio::fs::remove_file(dest).await;
                    if attempt < MAX_ATTEMPTS - 1 {
                        let delay = BACKOFF_DELAYS[attempt];
                        log::warn!(
                            "Download attempt {} failed, retrying in {}s: {}",
                            attempt + 1,
                            delay,
                            e
                        );
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PipelineError::Transport("download failed".into())))
    }

    async fn try_download(&self, url: &str, dest: &Path) -> Result<u64, PipelineError> {
        log::info!("Downloading {} to {:?}", url, dest);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::HttpStatus {
                status: response.status().as_u16(),
                body: format!("download of {url} failed"),
            });
        }

        let content_length = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = content_length {
            if downloaded != expected {
                return Err(PipelineError::Transport(format!(
                    "download incomplete: got {downloaded} bytes, expected {expected}"
                )));
            }
        }

        log::info!("Download complete: {} bytes", downloaded);
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_identifies_the_service() {
        assert!(USER_AGENT.starts_with("sifter-digest/"));
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_retries() {
        let downloader = Downloader::new(Duration::from_secs(2)).unwrap();
        let temp = tempfile::TempDir::new().unwrap();
        let dest = temp.path().join("out.mp3");

        let result = downloader
            // Reserved TEST-NET address: connection refused or timeout
            .download_to_file("http://192.0.2.1:9/audio.mp3", &dest)
            .await;
        assert!(result.is_err());
        assert!(!dest.exists());
    }
}
