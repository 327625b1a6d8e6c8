//! Resumable, hash-verified firmware downloads.
//!
//! A download is re-entrant at the file level: a complete, digest-matching
//! file on disk short-circuits the fetch entirely, a same-named file with
//! the wrong digest is treated as corrupted and replaced. Partial files are
//! removed on every error path so a rerun always starts from a clean slate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::catalog::Firmware;
use crate::checksum::sha1_file;
use crate::error::{PipelineError, PipelineResult};
use crate::progress::ProgressReporter;

/// A streaming HTTP response at the fetcher seam.
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Status reason phrase.
    pub reason: String,
    /// Declared Content-Length, when the server sent one.
    pub content_length: Option<u64>,
    /// Response body as a chunk stream. Chunk errors carry the
    /// network-level diagnostic.
    pub body: BoxStream<'static, Result<Bytes, String>>,
}

/// Network client used to fetch firmware images.
///
/// Abstracted so tests can serve canned byte streams and fault-inject
/// mid-stream failures.
#[async_trait]
pub trait FirmwareFetcher: Send + Sync {
    /// Issue a GET for the given URL.
    ///
    /// Connection-level failures (refused, DNS, timeout before headers)
    /// surface as [`PipelineError::Network`]; a non-200 status is returned
    /// as a normal [`FetchResponse`] for the caller to inspect.
    async fn fetch(&self, url: &str) -> PipelineResult<FetchResponse>;
}

/// Fetcher backed by `reqwest`.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Create a fetcher with the given whole-request timeout.
    ///
    /// Firmware images are multi-gigabyte, so callers should pass a
    /// generous timeout (the default configuration uses 1000 seconds).
    pub fn new(timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Network {
                url: String::new(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl FirmwareFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> PipelineResult<FetchResponse> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|e| PipelineError::Network {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        let status = response.status();
        Ok(FetchResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            content_length: response.content_length(),
            body: response.bytes_stream().map(|r| r.map_err(|e| e.to_string())).boxed(),
        })
    }
}

/// Download one firmware image into `dest_dir` and verify its digest.
///
/// Returns the path of the verified local file. Already-verified files are
/// returned without touching the network; corrupted files are deleted and
/// re-fetched. On any failure a partially written file is removed
/// best-effort before the error is returned.
pub async fn download_firmware(
    firmware: &Firmware,
    dest_dir: &Path,
    fetcher: &dyn FirmwareFetcher,
    reporter: &dyn ProgressReporter,
) -> PipelineResult<PathBuf> {
    let file_path = dest_dir.join(firmware.archive_name());

    if tokio::fs::try_exists(&file_path)
        .await
        .map_err(|e| PipelineError::io(&file_path, e))?
    {
        if sha1_file(&file_path).await? == firmware.sha1sum {
            info!(path = %file_path.display(), "firmware already downloaded and verified");
            return Ok(file_path);
        }

        info!(path = %file_path.display(), "detected a corrupted file, redownloading");
        tokio::fs::remove_file(&file_path)
            .await
            .map_err(|e| PipelineError::io(&file_path, e))?;
    }

    match stream_to_file(firmware, &file_path, fetcher, reporter).await {
        Ok(()) => {}
        Err(e) => {
            remove_best_effort(&file_path).await;
            return Err(e);
        }
    }

    let actual = sha1_file(&file_path).await?;
    if actual != firmware.sha1sum {
        // A fully written but mismatched file must not survive, or the next
        // run would have to rediscover the corruption itself.
        remove_best_effort(&file_path).await;
        return Err(PipelineError::HashMismatch {
            path: file_path,
            expected: firmware.sha1sum.clone(),
            actual,
        });
    }

    Ok(file_path)
}

/// Issue the GET and stream the body to disk, reporting byte progress.
async fn stream_to_file(
    firmware: &Firmware,
    file_path: &Path,
    fetcher: &dyn FirmwareFetcher,
    reporter: &dyn ProgressReporter,
) -> PipelineResult<()> {
    let mut response = fetcher.fetch(&firmware.url).await?;

    if response.status != 200 {
        return Err(PipelineError::Fetch {
            url: firmware.url.clone(),
            status: response.status,
            reason: response.reason,
        });
    }

    let total = response.content_length;
    let mut file = tokio::fs::File::create(file_path)
        .await
        .map_err(|e| PipelineError::io(file_path, e))?;

    let mut downloaded: u64 = 0;
    while let Some(chunk) = response.body.next().await {
        let chunk = chunk.map_err(|reason| PipelineError::Network {
            url: firmware.url.clone(),
            reason,
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|e| PipelineError::io(file_path, e))?;

        downloaded += chunk.len() as u64;
        reporter.bytes_progress(&firmware.identifier, &firmware.version, downloaded, total);
    }

    file.flush()
        .await
        .map_err(|e| PipelineError::io(file_path, e))?;

    if let Some(expected) = total {
        if downloaded != expected {
            warn!(
                path = %file_path.display(),
                downloaded,
                expected,
                "download ended short of declared Content-Length"
            );
        }
    }

    Ok(())
}

async fn remove_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to clean up partial download");
        }
    }
}
