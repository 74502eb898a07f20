//! Structured activity log
//!
//! Every meaningful step of the engine appends one row: level, optional
//! operation tag, optional tuple and coordinate, optional duration, message.
//! Rows go to the relational log table and, when configured, to a
//! line-oriented JSON sink suitable for log forwarding (one object per
//! line). Appends never fail the pipeline; a sink error is reported through
//! `tracing` and swallowed.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::coordinate::BuildCoordinate;
use crate::store::Store;
use crate::types::{ActivityRecord, LogLevel, Operation, TupleKey};

/// Append-only writer for activity records.
pub struct ActivityLog {
    store: Arc<Store>,
    json_sink: Option<Mutex<File>>,
}

impl ActivityLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            json_sink: None,
        }
    }

    /// Additionally append one JSON object per record to `path`.
    pub fn with_json_sink(store: Arc<Store>, path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            store,
            json_sink: Some(Mutex::new(file)),
        })
    }

    /// Start building a record at the given level.
    pub fn entry(&self, level: LogLevel) -> EntryBuilder<'_> {
        EntryBuilder {
            log: self,
            record: ActivityRecord {
                ts: Utc::now(),
                level,
                operation: None,
                component_id: None,
                branch_id: None,
                coordinate: None,
                duration_ms: None,
                message: String::new(),
            },
        }
    }

    /// Append a fully built record to every sink.
    pub fn record(&self, record: ActivityRecord) {
        mirror_to_tracing(&record);
        if let Err(err) = self.store.append_log(&record) {
            warn!(error = %err, "failed to append activity log row");
        }
        if let Some(sink) = &self.json_sink {
            let line = json_line(&record);
            match sink.lock() {
                Ok(mut file) => {
                    if let Err(err) = writeln!(file, "{line}") {
                        warn!(error = %err, "failed to write activity JSON line");
                    }
                }
                Err(_) => warn!("activity JSON sink poisoned"),
            }
        }
    }
}

/// Builder for one activity record.
pub struct EntryBuilder<'a> {
    log: &'a ActivityLog,
    record: ActivityRecord,
}

impl EntryBuilder<'_> {
    pub fn ts(mut self, ts: DateTime<Utc>) -> Self {
        self.record.ts = ts;
        self
    }

    pub fn op(mut self, operation: Operation) -> Self {
        self.record.operation = Some(operation);
        self
    }

    pub fn tuple(mut self, key: TupleKey) -> Self {
        self.record.component_id = Some(key.component_id);
        self.record.branch_id = Some(key.branch_id);
        self
    }

    pub fn coordinate(mut self, coord: &BuildCoordinate) -> Self {
        self.record.coordinate = Some(*coord);
        self
    }

    pub fn duration(mut self, elapsed: Duration) -> Self {
        self.record.duration_ms = Some(elapsed.as_millis() as u64);
        self
    }

    /// Set the message and append the record.
    pub fn emit(mut self, message: impl Into<String>) {
        self.record.message = message.into();
        self.log.record(self.record);
    }
}

fn json_line(record: &ActivityRecord) -> String {
    json!({
        "ts": record.ts.to_rfc3339(),
        "level": record.level.as_str(),
        "op": record.operation.map(Operation::as_str),
        "component": record.component_id,
        "branch": record.branch_id,
        "build": record.coordinate.map(|c| c.to_string()),
        "dur_ms": record.duration_ms,
        "msg": record.message,
    })
    .to_string()
}

fn mirror_to_tracing(record: &ActivityRecord) {
    let op = record.operation.map(Operation::as_str).unwrap_or("-");
    match record.level {
        LogLevel::Debug => tracing::debug!(op, msg = %record.message),
        LogLevel::Info => tracing::info!(op, msg = %record.message),
        LogLevel::Warning => tracing::warn!(op, msg = %record.message),
        LogLevel::Error | LogLevel::Critical => tracing::error!(op, msg = %record.message),
    }
}
