//! Extraction manager
//!
//! Unpacks a downloaded archive into its per-build extraction directory.
//! Entries are written into a sibling temp directory first and the whole
//! tree is renamed into place, so a failed or cancelled extraction never
//! leaves a partially materialized target. Entries that resolve outside the
//! extraction root are rejected outright.
//!
//! The zip reader is synchronous, so the entry loop runs on the blocking
//! pool and checks the cancellation token between entries.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use zip::result::ZipError;

use crate::error::ExtractError;

/// Unpacks archives. Stateless; per-tuple serialization is the scheduler's.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionManager;

impl ExtractionManager {
    pub fn new() -> Self {
        Self
    }

    /// Extract `archive` into `target`, replacing any previous tree at that
    /// path. Returns the target path on success.
    pub async fn extract(
        &self,
        archive: &Path,
        target: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ExtractError> {
        let temp = partial_dir(target)?;
        // A stale temp tree from a crashed run is dead weight; start clean.
        let _ = tokio::fs::remove_dir_all(&temp).await;

        let child = cancel.child_token();
        let archive_path = archive.to_path_buf();
        let temp_path = temp.clone();
        let worker_cancel = child.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            extract_entries(&archive_path, &temp_path, &worker_cancel)
        });

        let result = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(join_err) => Err(ExtractError::Io(std::io::Error::other(join_err))),
            },
            _ = tokio::time::sleep(timeout) => {
                child.cancel();
                let _ = handle.await;
                let _ = tokio::fs::remove_dir_all(&temp).await;
                return Err(ExtractError::Timeout {
                    seconds: timeout.as_secs(),
                });
            }
        };

        if let Err(err) = result {
            let _ = tokio::fs::remove_dir_all(&temp).await;
            return Err(err);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_dir_all(target).await;
        tokio::fs::rename(&temp, target).await?;
        Ok(target.to_path_buf())
    }
}

fn partial_dir(target: &Path) -> Result<PathBuf, ExtractError> {
    let name = target
        .file_name()
        .ok_or_else(|| ExtractError::Io(std::io::Error::other("extraction target has no name")))?;
    let mut partial = name.to_os_string();
    partial.push(".partial");
    Ok(target.with_file_name(partial))
}

fn extract_entries(
    archive_path: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<(), ExtractError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(map_zip_error)?;
    std::fs::create_dir_all(dest)?;

    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        let mut entry = archive.by_index(index).map_err(map_zip_error)?;
        // Absolute paths and `..` traversal resolve outside the root and
        // are rejected before anything is written.
        let Some(relative) = entry.enclosed_name() else {
            return Err(ExtractError::UnsafeEntry {
                entry: entry.name().to_string(),
            });
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(())
}

fn map_zip_error(err: ZipError) -> ExtractError {
    match err {
        ZipError::Io(io) => ExtractError::Io(io),
        other => ExtractError::CorruptArchive(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    async fn extract_to(
        dir: &Path,
        entries: &[(&str, &[u8])],
    ) -> Result<PathBuf, ExtractError> {
        let archive = dir.join("Svc.zip");
        write_zip(&archive, entries);
        let target = dir.join("a").join("20250102.1").join("Svc");
        ExtractionManager::new()
            .extract(
                &archive,
                &target,
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn extracts_nested_entries_preserving_paths() {
        let dir = tempfile::tempdir().unwrap();
        let target = extract_to(
            dir.path(),
            &[
                ("bin/app.exe", b"binary".as_slice()),
                ("conf/app.toml", b"[cfg]".as_slice()),
                ("readme.txt", b"hello".as_slice()),
            ],
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(target.join("bin/app.exe")).unwrap(), b"binary");
        assert_eq!(std::fs::read(target.join("readme.txt")).unwrap(), b"hello");
        // No partial tree left behind.
        assert!(!target.with_file_name("Svc.partial").exists());
    }

    #[tokio::test]
    async fn traversal_entries_are_rejected_without_writing_outside() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_to(
            dir.path(),
            &[
                ("ok.txt", b"fine".as_slice()),
                ("../../escape.txt", b"evil".as_slice()),
            ],
        )
        .await;
        assert!(matches!(result, Err(ExtractError::UnsafeEntry { entry }) if entry.contains("escape")));
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
        // The target was never materialized.
        assert!(!dir.path().join("a").join("20250102.1").join("Svc").exists());
    }

    #[tokio::test]
    async fn garbage_bytes_are_a_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("Svc.zip");
        std::fs::write(&archive, b"this is not a zip file").unwrap();
        let target = dir.path().join("out");
        let result = ExtractionManager::new()
            .extract(
                &archive,
                &target,
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ExtractError::CorruptArchive(_))));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn cancelled_extraction_reports_cancelled_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("Svc.zip");
        write_zip(&archive, &[("a.txt", b"a".as_slice())]);
        let target = dir.path().join("out");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ExtractionManager::new()
            .extract(&archive, &target, Duration::from_secs(10), &cancel)
            .await;
        assert!(matches!(result, Err(ExtractError::Cancelled)));
        assert!(!target.exists());
        assert!(!dir.path().join("out.partial").exists());
    }

    #[tokio::test]
    async fn re_extraction_replaces_the_previous_tree() {
        let dir = tempfile::tempdir().unwrap();
        let target = extract_to(dir.path(), &[("old.txt", b"old".as_slice())])
            .await
            .unwrap();
        assert!(target.join("old.txt").exists());

        let archive = dir.path().join("Svc.zip");
        write_zip(&archive, &[("new.txt", b"new".as_slice())]);
        ExtractionManager::new()
            .extract(
                &archive,
                &target,
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(target.join("new.txt").exists());
        assert!(!target.join("old.txt").exists());
    }
}
