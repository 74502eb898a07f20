//! Download manager
//!
//! Streams an archive from the artifact source into the component's
//! GUID-rooted tree: write to a temp file in bounded memory, fsync, verify
//! size and checksum, atomically rename into place, then copy into the
//! per-build history folder. Partial files never survive a failure.

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::coordinate::BuildCoordinate;
use crate::error::DownloadError;
use crate::jfrog::ArtifactSource;
use crate::layout::ComponentLayout;

/// Upper bound on buffered bytes between the socket and the disk.
const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// The current archive (`s/<name>.zip`), overwritten per build.
    pub archive_path: PathBuf,
    /// The retained copy for this build under `s/history/`.
    pub history_copy: PathBuf,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the written bytes.
    pub checksum: String,
}

struct Streamed {
    size: u64,
    checksum: String,
    expected_len: Option<u64>,
    upstream_checksum: Option<String>,
}

/// Streams archives to disk. Per-tuple serialization and the global
/// concurrency cap are the scheduler's responsibility.
pub struct DownloadManager {
    source: Arc<dyn ArtifactSource>,
}

impl DownloadManager {
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self { source }
    }

    /// Download one build into the layout. On any failure the temp file is
    /// removed; the previous current archive is only replaced after the new
    /// bytes are verified and fsynced.
    pub async fn download(
        &self,
        layout: &ComponentLayout,
        url: &Url,
        coord: &BuildCoordinate,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError> {
        layout.ensure()?;
        let final_path = layout.current_archive();
        let temp_path = partial_path(&final_path);

        let streamed =
            match tokio::time::timeout(timeout, self.stream_to(url, &temp_path, cancel)).await {
                Err(_) => {
                    remove_quietly(&temp_path).await;
                    return Err(DownloadError::Timeout {
                        seconds: timeout.as_secs(),
                    });
                }
                Ok(Err(err)) => {
                    remove_quietly(&temp_path).await;
                    return Err(err);
                }
                Ok(Ok(streamed)) => streamed,
            };

        if let Some(expected) = streamed.expected_len {
            if expected != streamed.size {
                remove_quietly(&temp_path).await;
                return Err(DownloadError::SizeMismatch {
                    expected,
                    actual: streamed.size,
                });
            }
        }
        if let Some(expected) = &streamed.upstream_checksum {
            if *expected != streamed.checksum {
                remove_quietly(&temp_path).await;
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: streamed.checksum,
                });
            }
        } else {
            debug!(url = %url, "no upstream checksum header, skipping verification");
        }

        tokio::fs::rename(&temp_path, &final_path).await?;

        let history_copy = layout.history_archive(coord);
        if let Some(parent) = history_copy.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&final_path, &history_copy).await?;

        Ok(DownloadOutcome {
            archive_path: final_path,
            history_copy,
            file_size: streamed.size,
            checksum: streamed.checksum,
        })
    }

    async fn stream_to(
        &self,
        url: &Url,
        temp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Streamed, DownloadError> {
        let crate::jfrog::ArtifactPayload {
            content_length,
            checksum_sha256,
            mut stream,
        } = self
            .source
            .fetch(url)
            .await
            .map_err(DownloadError::from_source)?;

        let file = tokio::fs::File::create(temp_path).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                None => break,
                Some(Ok(bytes)) => {
                    hasher.update(&bytes);
                    size += bytes.len() as u64;
                    writer.write_all(&bytes).await?;
                }
                Some(Err(err)) => return Err(DownloadError::from_source(err)),
            }
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;

        Ok(Streamed {
            size,
            checksum: hex_digest(&hasher.finalize()),
            expected_len: content_length,
            upstream_checksum: checksum_sha256,
        })
    }
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn remove_quietly(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}
