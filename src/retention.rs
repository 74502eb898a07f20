//! Retention manager
//!
//! Keeps the newest `MaxBuildsToKeep` non-deleted history entries per tuple.
//! Older entries are tombstoned in one short transaction, then their
//! extraction directories and archive copies are removed from disk outside
//! the transaction. Already-missing paths are fine; per-path failures are
//! logged and counted but never abort the rest of the prune.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::activity::ActivityLog;
use crate::clock::Clock;
use crate::error::{StoreError, WincoreError};
use crate::settings::Settings;
use crate::store::Store;
use crate::types::{LogLevel, Operation, TupleKey};

/// Result of one prune pass over a tuple.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneReport {
    /// History entries tombstoned this pass.
    pub pruned: usize,
    /// Paths that could not be removed from disk.
    pub failures: usize,
}

/// Aggregate counts for one `cleanup` pass over every tuple.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub tuples: usize,
    pub pruned: usize,
    pub failures: usize,
    pub purged_log_rows: usize,
}

pub struct RetentionManager {
    store: Arc<Store>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Prune a tuple down to its retention window.
    pub async fn prune(
        &self,
        key: TupleKey,
        keep: u32,
        activity: &ActivityLog,
        now: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        let entries = self.store.active_history(key)?;
        if entries.len() <= keep as usize {
            return Ok(PruneReport::default());
        }

        let victims = &entries[keep as usize..];
        let ids: Vec<i64> = victims.iter().map(|e| e.id).collect();
        self.store.mark_history_deleted(&ids, now)?;

        let paths: Vec<(Option<PathBuf>, PathBuf)> = victims
            .iter()
            .map(|e| {
                (
                    e.extraction_path.as_ref().map(PathBuf::from),
                    PathBuf::from(&e.download_path),
                )
            })
            .collect();
        let failures = tokio::task::spawn_blocking(move || remove_build_files(paths))
            .await
            .unwrap_or_else(|join_err| {
                vec![(
                    PathBuf::from("<prune worker>"),
                    std::io::Error::other(join_err).to_string(),
                )]
            });

        for (path, error) in &failures {
            activity
                .entry(LogLevel::Warning)
                .op(Operation::Cleanup)
                .tuple(key)
                .emit(format!("failed to remove {}: {error}", path.display()));
        }
        debug!(
            component_id = key.component_id,
            branch_id = key.branch_id,
            pruned = victims.len(),
            failures = failures.len(),
            "pruned history"
        );

        Ok(PruneReport {
            pruned: victims.len(),
            failures: failures.len(),
        })
    }

    /// Prune every active tuple to the retention window and trim the
    /// activity log to its retention days. This is the `cleanup` command.
    pub async fn cleanup_all(
        &self,
        settings: &Settings,
        activity: &ActivityLog,
        clock: &dyn Clock,
    ) -> Result<CleanupReport, WincoreError> {
        let default_interval = settings.default_polling_frequency()?;
        let tuples = self.store.active_configs(default_interval)?;
        let keep = settings.max_builds_to_keep()?;
        let mut report = CleanupReport {
            tuples: tuples.len(),
            ..Default::default()
        };
        for tuple in &tuples {
            let prune = self
                .prune(tuple.key(), keep, activity, clock.now())
                .await?;
            report.pruned += prune.pruned;
            report.failures += prune.failures;
        }

        let retention_days = settings.log_retention_days()?;
        let cutoff = clock.now() - chrono::Duration::days(i64::from(retention_days));
        report.purged_log_rows = self.store.purge_activity_log(cutoff)?;

        activity
            .entry(LogLevel::Info)
            .op(Operation::Cleanup)
            .emit(format!(
                "cleanup pass: {} tuples, {} builds pruned, {} failures, {} log rows purged",
                report.tuples, report.pruned, report.failures, report.purged_log_rows
            ));
        Ok(report)
    }
}

/// Remove the extraction tree, then the archive. Returns per-path failures;
/// a path that is already gone is not a failure.
fn remove_build_files(paths: Vec<(Option<PathBuf>, PathBuf)>) -> Vec<(PathBuf, String)> {
    let mut failures = Vec::new();
    for (extraction, archive) in paths {
        if let Some(dir) = extraction {
            if let Err(err) = remove_dir_if_present(&dir) {
                failures.push((dir, err.to_string()));
            }
        }
        if let Err(err) = remove_file_if_present(&archive) {
            failures.push((archive, err.to_string()));
        }
    }
    failures
}

fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn remove_file_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::BuildCoordinate;
    use crate::store::NewHistoryEntry;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// Seed one history entry with real files on disk.
    fn seed_build(store: &Store, key: TupleKey, root: &Path, date: &str, seq: u32) {
        let coord = BuildCoordinate::parse(date, seq).unwrap();
        let archive_dir = root.join("s").join("history").join(coord.dir_name());
        std::fs::create_dir_all(&archive_dir).unwrap();
        let archive = archive_dir.join("Svc.zip");
        std::fs::write(&archive, b"zip").unwrap();

        let extraction = root.join("a").join(coord.dir_name()).join("Svc");
        std::fs::create_dir_all(&extraction).unwrap();
        std::fs::write(extraction.join("f.txt"), b"x").unwrap();

        store
            .append_history(&NewHistoryEntry {
                key,
                coordinate: coord,
                artifact_url: format!("http://u/{coord}"),
                download_path: archive.to_string_lossy().into_owned(),
                extraction_path: extraction.to_string_lossy().into_owned(),
                file_size: 3,
                checksum: None,
                downloaded_at: now(),
                extracted_at: now(),
            })
            .unwrap();
    }

    fn setup() -> (Arc<Store>, TupleKey, ActivityLog) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cid = store.insert_component("g", "Svc", "acme", None).unwrap();
        let bid = store.insert_branch(cid, "main").unwrap();
        store.upsert_polling_config(cid, Some(60)).unwrap();
        let key = TupleKey {
            component_id: cid,
            branch_id: bid,
        };
        let activity = ActivityLog::new(Arc::clone(&store));
        (store, key, activity)
    }

    #[tokio::test]
    async fn keeps_the_newest_n_and_removes_the_rest_from_disk() {
        let (store, key, activity) = setup();
        let dir = tempfile::tempdir().unwrap();
        for seq in 1..=6 {
            seed_build(&store, key, dir.path(), "20250102", seq);
        }

        let manager = RetentionManager::new(Arc::clone(&store));
        let report = manager.prune(key, 3, &activity, now()).await.unwrap();
        assert_eq!(report.pruned, 3);
        assert_eq!(report.failures, 0);

        let active = store.active_history(key).unwrap();
        assert_eq!(active.len(), 3);
        let kept: Vec<u32> = active.iter().map(|e| e.coordinate.seq()).collect();
        assert_eq!(kept, vec![6, 5, 4]);

        // Disk agrees: kept builds exist, pruned builds are gone.
        for seq in 1..=3 {
            assert!(!dir.path().join("a").join(format!("20250102.{seq}")).exists());
            assert!(
                !dir.path()
                    .join("s/history")
                    .join(format!("20250102.{seq}"))
                    .join("Svc.zip")
                    .exists()
            );
        }
        for entry in &active {
            assert!(Path::new(&entry.download_path).exists());
            assert!(Path::new(entry.extraction_path.as_deref().unwrap()).exists());
        }
    }

    #[tokio::test]
    async fn second_prune_is_a_no_op() {
        let (store, key, activity) = setup();
        let dir = tempfile::tempdir().unwrap();
        for seq in 1..=4 {
            seed_build(&store, key, dir.path(), "20250102", seq);
        }
        let manager = RetentionManager::new(Arc::clone(&store));
        let first = manager.prune(key, 2, &activity, now()).await.unwrap();
        assert_eq!(first.pruned, 2);
        let second = manager.prune(key, 2, &activity, now()).await.unwrap();
        assert_eq!(second.pruned, 0);
        assert_eq!(second.failures, 0);
    }

    #[tokio::test]
    async fn missing_paths_are_tolerated() {
        let (store, key, activity) = setup();
        let dir = tempfile::tempdir().unwrap();
        for seq in 1..=3 {
            seed_build(&store, key, dir.path(), "20250102", seq);
        }
        // Someone already deleted the oldest build's files by hand.
        std::fs::remove_dir_all(dir.path().join("a").join("20250102.1")).unwrap();
        std::fs::remove_file(
            dir.path()
                .join("s/history")
                .join("20250102.1")
                .join("Svc.zip"),
        )
        .unwrap();

        let manager = RetentionManager::new(Arc::clone(&store));
        let report = manager.prune(key, 1, &activity, now()).await.unwrap();
        assert_eq!(report.pruned, 2);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn window_of_one_keeps_exactly_one_build() {
        let (store, key, activity) = setup();
        let dir = tempfile::tempdir().unwrap();
        seed_build(&store, key, dir.path(), "20250101", 5);
        seed_build(&store, key, dir.path(), "20250102", 1);
        let manager = RetentionManager::new(Arc::clone(&store));
        manager.prune(key, 1, &activity, now()).await.unwrap();
        let active = store.active_history(key).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(
            active[0].coordinate,
            BuildCoordinate::parse("20250102", 1).unwrap()
        );
    }
}
