//! Relational store for catalog, tracking, history and the activity log
//!
//! The engine depends only on the verbs exposed here; all SQL lives in this
//! module so a different dialect swaps one file. Catalog tables
//! (`components`, `component_branches`, `polling_config`, `system_config`)
//! are owned by an external system and consumed read-only; the insert
//! helpers at the bottom exist for seeding and tests.
//!
//! Every statement is prepared, every write is a short-lived transaction,
//! and no transaction ever spans network or filesystem I/O.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::coordinate::BuildCoordinate;
use crate::error::StoreError;
use crate::types::{
    ActivityRecord, Branch, BuildTracking, Component, HistoryEntry, LogLevel, Operation, PollTuple,
    PollingConfig, StepStatus, TupleKey,
};

/// Minimum polling interval; catalog rows below this are clamped up.
const MIN_POLL_INTERVAL_SECONDS: u64 = 30;

/// Statement timeout for contended connections, matching the fixed DB
/// deadline of the concurrency model.
const BUSY_TIMEOUT_MS: u64 = 10_000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS components (
    id            INTEGER PRIMARY KEY,
    guid          TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    project_key   TEXT NOT NULL,
    url_pattern   TEXT,
    enabled       INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS component_branches (
    id            INTEGER PRIMARY KEY,
    component_id  INTEGER NOT NULL REFERENCES components(id),
    name          TEXT NOT NULL,
    enabled       INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS polling_config (
    component_id               INTEGER PRIMARY KEY REFERENCES components(id),
    enabled                    INTEGER NOT NULL DEFAULT 1,
    interval_seconds           INTEGER,
    retry_attempts             INTEGER,
    download_timeout_seconds   INTEGER,
    extraction_timeout_seconds INTEGER
);

CREATE TABLE IF NOT EXISTS system_config (
    key          TEXT PRIMARY KEY,
    value        TEXT NOT NULL,
    is_enabled   INTEGER NOT NULL DEFAULT 1,
    is_encrypted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS build_tracking (
    component_id      INTEGER NOT NULL,
    branch_id         INTEGER NOT NULL,
    build_date        TEXT NOT NULL,
    sequence          INTEGER NOT NULL,
    artifact_url      TEXT NOT NULL,
    last_check_at     TEXT NOT NULL,
    last_download_at  TEXT,
    download_status   TEXT NOT NULL,
    extraction_status TEXT NOT NULL,
    download_path     TEXT,
    extraction_path   TEXT,
    file_size         INTEGER,
    checksum          TEXT,
    error_message     TEXT,
    PRIMARY KEY (component_id, branch_id)
);

CREATE TABLE IF NOT EXISTS build_history (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    component_id    INTEGER NOT NULL,
    branch_id       INTEGER NOT NULL,
    build_date      TEXT NOT NULL,
    sequence        INTEGER NOT NULL,
    artifact_url    TEXT NOT NULL,
    download_path   TEXT NOT NULL,
    extraction_path TEXT,
    file_size       INTEGER NOT NULL,
    checksum        TEXT,
    downloaded_at   TEXT NOT NULL,
    extracted_at    TEXT,
    deleted         INTEGER NOT NULL DEFAULT 0,
    deleted_at      TEXT
);

CREATE INDEX IF NOT EXISTS idx_history_tuple
    ON build_history (component_id, branch_id, deleted);

CREATE TABLE IF NOT EXISTS activity_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    ts           TEXT NOT NULL,
    level        TEXT NOT NULL,
    operation    TEXT,
    component_id INTEGER,
    branch_id    INTEGER,
    build_date   TEXT,
    sequence     INTEGER,
    duration_ms  INTEGER,
    message      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activity_ts ON activity_log (ts);
"#;

/// Fields for a new history row, appended once a build is fully
/// downloaded and extracted.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub key: TupleKey,
    pub coordinate: BuildCoordinate,
    pub artifact_url: String,
    pub download_path: String,
    pub extraction_path: String,
    pub file_size: u64,
    pub checksum: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    pub extracted_at: DateTime<Utc>,
}

/// SQLite-backed store. `Clone`-free; share via `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS as i64)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Cheap connectivity check used by the `test` command.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// All enabled system configuration rows as a key/value map.
    pub fn config_map(&self) -> Result<HashMap<String, String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM system_config WHERE is_enabled = 1")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (key, value): (String, String) = row?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Enabled `(component, branch, polling config)` tuples, the scheduler's
    /// work list. A row without its own interval falls back to the
    /// system-wide default; intervals below the minimum are clamped up.
    pub fn active_configs(&self, default_interval_seconds: u64) -> Result<Vec<PollTuple>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.guid, c.name, c.project_key, c.url_pattern,
                    b.id, b.name,
                    p.interval_seconds, p.retry_attempts,
                    p.download_timeout_seconds, p.extraction_timeout_seconds
             FROM components c
             JOIN component_branches b ON b.component_id = c.id
             JOIN polling_config p ON p.component_id = c.id
             WHERE c.enabled = 1 AND b.enabled = 1 AND p.enabled = 1
             ORDER BY c.id, b.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let component = Component {
                id: row.get(0)?,
                guid: row.get(1)?,
                name: row.get(2)?,
                project_key: row.get(3)?,
                url_pattern: row.get(4)?,
            };
            let branch = Branch {
                id: row.get(5)?,
                component_id: component.id,
                name: row.get(6)?,
            };
            let interval = row
                .get::<_, Option<i64>>(7)?
                .map(|v| v.max(0) as u64)
                .unwrap_or(default_interval_seconds);
            let polling = PollingConfig {
                interval_seconds: interval.max(MIN_POLL_INTERVAL_SECONDS),
                retry_attempts: row.get::<_, Option<i64>>(8)?.map(|v| v.max(0) as u32),
                download_timeout_seconds: row.get::<_, Option<i64>>(9)?.map(|v| v.max(0) as u64),
                extraction_timeout_seconds: row
                    .get::<_, Option<i64>>(10)?
                    .map(|v| v.max(0) as u64),
            };
            Ok(PollTuple {
                component,
                branch,
                polling,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// The tracking row for a tuple, if discovery has ever succeeded.
    pub fn tracking(&self, key: TupleKey) -> Result<Option<BuildTracking>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT build_date, sequence, artifact_url, last_check_at, last_download_at,
                    download_status, extraction_status, download_path, extraction_path,
                    file_size, checksum, error_message
             FROM build_tracking WHERE component_id = ?1 AND branch_id = ?2",
        )?;
        stmt.query_row(params![key.component_id, key.branch_id], |row| {
            let date: String = row.get(0)?;
            let seq: u32 = row.get(1)?;
            let download_status: String = row.get(5)?;
            let extraction_status: String = row.get(6)?;
            Ok(BuildTracking {
                component_id: key.component_id,
                branch_id: key.branch_id,
                coordinate: parse_coordinate(&date, seq)?,
                artifact_url: row.get(2)?,
                last_check_at: parse_ts(&row.get::<_, String>(3)?)?,
                last_download_at: parse_opt_ts(row.get::<_, Option<String>>(4)?)?,
                download_status: parse_status(&download_status)?,
                extraction_status: parse_status(&extraction_status)?,
                download_path: row.get(7)?,
                extraction_path: row.get(8)?,
                file_size: row.get::<_, Option<i64>>(9)?.map(|v| v.max(0) as u64),
                checksum: row.get(10)?,
                error_message: row.get(11)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// Record a newly discovered build and put the tuple into the
    /// downloading state. The guard clause keeps the tracked coordinate
    /// monotonic even if callers race.
    pub fn begin_download(
        &self,
        key: TupleKey,
        coord: &BuildCoordinate,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO build_tracking
                 (component_id, branch_id, build_date, sequence, artifact_url, last_check_at,
                  download_status, extraction_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'downloading', 'pending')
             ON CONFLICT(component_id, branch_id) DO UPDATE SET
                 build_date = excluded.build_date,
                 sequence = excluded.sequence,
                 artifact_url = excluded.artifact_url,
                 last_check_at = excluded.last_check_at,
                 download_status = 'downloading',
                 extraction_status = 'pending',
                 download_path = NULL,
                 extraction_path = NULL,
                 file_size = NULL,
                 checksum = NULL,
                 error_message = NULL
             WHERE (excluded.build_date, excluded.sequence)
                   >= (build_tracking.build_date, build_tracking.sequence)",
            params![
                key.component_id,
                key.branch_id,
                coord.date_str(),
                coord.seq(),
                url,
                fmt_ts(now)
            ],
        )?;
        Ok(())
    }

    /// Stamp `last_check_at` when a probe found nothing new.
    pub fn touch_checked(&self, key: TupleKey, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE build_tracking SET last_check_at = ?3
             WHERE component_id = ?1 AND branch_id = ?2",
            params![key.component_id, key.branch_id, fmt_ts(now)],
        )?;
        Ok(())
    }

    /// Record a probe failure without disturbing the step statuses.
    pub fn record_probe_error(
        &self,
        key: TupleKey,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE build_tracking SET error_message = ?3, last_check_at = ?4
             WHERE component_id = ?1 AND branch_id = ?2",
            params![key.component_id, key.branch_id, message, fmt_ts(now)],
        )?;
        Ok(())
    }

    /// Mark the download step completed with its artifacts.
    pub fn complete_download(
        &self,
        key: TupleKey,
        download_path: &str,
        file_size: u64,
        checksum: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE build_tracking SET
                 download_status = 'completed', download_path = ?3, file_size = ?4,
                 checksum = ?5, last_download_at = ?6, error_message = NULL
             WHERE component_id = ?1 AND branch_id = ?2",
            params![
                key.component_id,
                key.branch_id,
                download_path,
                file_size as i64,
                checksum,
                fmt_ts(now)
            ],
        )?;
        Ok(())
    }

    /// Mark the download step failed.
    pub fn fail_download(
        &self,
        key: TupleKey,
        message: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE build_tracking SET download_status = 'failed', error_message = ?3
             WHERE component_id = ?1 AND branch_id = ?2",
            params![key.component_id, key.branch_id, message],
        )?;
        Ok(())
    }

    /// Mark the extraction step completed.
    pub fn complete_extraction(
        &self,
        key: TupleKey,
        extraction_path: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE build_tracking SET
                 extraction_status = 'completed', extraction_path = ?3, error_message = NULL
             WHERE component_id = ?1 AND branch_id = ?2",
            params![key.component_id, key.branch_id, extraction_path],
        )?;
        Ok(())
    }

    /// Mark the extraction step failed. The download status is untouched.
    pub fn fail_extraction(
        &self,
        key: TupleKey,
        message: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE build_tracking SET extraction_status = 'failed', error_message = ?3
             WHERE component_id = ?1 AND branch_id = ?2",
            params![key.component_id, key.branch_id, message],
        )?;
        Ok(())
    }

    /// Append a history row for a fully materialized build.
    pub fn append_history(&self, entry: &NewHistoryEntry) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO build_history
                 (component_id, branch_id, build_date, sequence, artifact_url,
                  download_path, extraction_path, file_size, checksum,
                  downloaded_at, extracted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.key.component_id,
                entry.key.branch_id,
                entry.coordinate.date_str(),
                entry.coordinate.seq(),
                entry.artifact_url,
                entry.download_path,
                entry.extraction_path,
                entry.file_size as i64,
                entry.checksum,
                fmt_ts(entry.downloaded_at),
                fmt_ts(entry.extracted_at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Non-deleted history for a tuple, newest coordinate first.
    pub fn active_history(&self, key: TupleKey) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, build_date, sequence, artifact_url, download_path, extraction_path,
                    file_size, checksum, downloaded_at, extracted_at
             FROM build_history
             WHERE component_id = ?1 AND branch_id = ?2 AND deleted = 0
             ORDER BY build_date DESC, sequence DESC",
        )?;
        let rows = stmt.query_map(params![key.component_id, key.branch_id], |row| {
            let date: String = row.get(1)?;
            let seq: u32 = row.get(2)?;
            Ok(HistoryEntry {
                id: row.get(0)?,
                component_id: key.component_id,
                branch_id: key.branch_id,
                coordinate: parse_coordinate(&date, seq)?,
                artifact_url: row.get(3)?,
                download_path: row.get(4)?,
                extraction_path: row.get(5)?,
                file_size: row.get::<_, i64>(6)?.max(0) as u64,
                checksum: row.get(7)?,
                downloaded_at: parse_ts(&row.get::<_, String>(8)?)?,
                extracted_at: parse_opt_ts(row.get::<_, Option<String>>(9)?)?,
                deleted: false,
                deleted_at: None,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Tombstone history rows in one transaction. Rows already deleted stay
    /// deleted; the flag never flips back.
    pub fn mark_history_deleted(
        &self,
        ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE build_history SET deleted = 1, deleted_at = ?2
                 WHERE id = ?1 AND deleted = 0",
            )?;
            for id in ids {
                stmt.execute(params![id, fmt_ts(now)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Append one activity log row.
    pub fn append_log(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO activity_log
                 (ts, level, operation, component_id, branch_id, build_date, sequence,
                  duration_ms, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                fmt_ts(record.ts),
                record.level.as_str(),
                record.operation.map(Operation::as_str),
                record.component_id,
                record.branch_id,
                record.coordinate.as_ref().map(|c| c.date_str()),
                record.coordinate.as_ref().map(|c| c.seq()),
                record.duration_ms.map(|d| d as i64),
                record.message
            ],
        )?;
        Ok(())
    }

    /// Most recent activity rows, newest first. For inspection and tests;
    /// the engine itself only appends.
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts, level, operation, component_id, branch_id, build_date, sequence,
                    duration_ms, message
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let level: String = row.get(1)?;
            let operation: Option<String> = row.get(2)?;
            let date: Option<String> = row.get(5)?;
            let seq: Option<u32> = row.get(6)?;
            let coordinate = match (date, seq) {
                (Some(date), Some(seq)) => Some(parse_coordinate(&date, seq)?),
                _ => None,
            };
            Ok(ActivityRecord {
                ts: parse_ts(&row.get::<_, String>(0)?)?,
                level: parse_level(&level)?,
                operation: operation.as_deref().and_then(parse_operation),
                component_id: row.get(3)?,
                branch_id: row.get(4)?,
                coordinate,
                duration_ms: row.get::<_, Option<i64>>(7)?.map(|d| d.max(0) as u64),
                message: row.get(8)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Delete activity rows older than the cutoff; returns the count.
    pub fn purge_activity_log(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM activity_log WHERE ts < ?1",
            params![fmt_ts(cutoff)],
        )?;
        Ok(n)
    }

    // --- catalog seeding -------------------------------------------------
    //
    // Catalog rows normally arrive from the external catalog; these helpers
    // exist for bootstrap tooling and tests.

    pub fn insert_component(
        &self,
        guid: &str,
        name: &str,
        project_key: &str,
        url_pattern: Option<&str>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO components (guid, name, project_key, url_pattern) VALUES (?1, ?2, ?3, ?4)",
            params![guid, name, project_key, url_pattern],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_branch(&self, component_id: i64, name: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO component_branches (component_id, name) VALUES (?1, ?2)",
            params![component_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn upsert_polling_config(
        &self,
        component_id: i64,
        interval_seconds: Option<u64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO polling_config (component_id, interval_seconds) VALUES (?1, ?2)
             ON CONFLICT(component_id) DO UPDATE SET interval_seconds = excluded.interval_seconds",
            params![component_id, interval_seconds.map(|v| v as i64)],
        )?;
        Ok(())
    }

    pub fn set_system_config(
        &self,
        key: &str,
        value: &str,
        is_encrypted: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO system_config (key, value, is_encrypted) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            is_encrypted = excluded.is_encrypted",
            params![key, value, is_encrypted as i64],
        )?;
        Ok(())
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_status(s: &str) -> rusqlite::Result<StepStatus> {
    StepStatus::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            Box::new(std::io::Error::other(format!("unknown step status '{s}'"))),
        )
    })
}

fn parse_level(s: &str) -> rusqlite::Result<LogLevel> {
    match s {
        "DEBUG" => Ok(LogLevel::Debug),
        "INFO" => Ok(LogLevel::Info),
        "WARNING" => Ok(LogLevel::Warning),
        "ERROR" => Ok(LogLevel::Error),
        "CRITICAL" => Ok(LogLevel::Critical),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            Box::new(std::io::Error::other(format!("unknown log level '{other}'"))),
        )),
    }
}

fn parse_operation(s: &str) -> Option<Operation> {
    match s {
        "poll" => Some(Operation::Poll),
        "download" => Some(Operation::Download),
        "extraction" => Some(Operation::Extraction),
        "cleanup" => Some(Operation::Cleanup),
        _ => None,
    }
}

fn parse_coordinate(date: &str, seq: u32) -> rusqlite::Result<BuildCoordinate> {
    BuildCoordinate::parse(date, seq)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

/// Convenience constructor for log rows.
pub fn activity(
    ts: DateTime<Utc>,
    level: LogLevel,
    operation: Option<Operation>,
    message: impl Into<String>,
) -> ActivityRecord {
    ActivityRecord {
        ts,
        level,
        operation,
        component_id: None,
        branch_id: None,
        coordinate: None,
        duration_ms: None,
        message: message.into(),
    }
}
