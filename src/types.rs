//! Core entity types shared across the engine
//!
//! Catalog rows (components, branches, polling config) are owned by an
//! external system and read-only here; tracking and history rows are owned
//! by this engine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::coordinate::BuildCoordinate;

/// A component as published in the catalog.
///
/// The GUID is immutable and scopes the on-disk tree for the component;
/// `project_key` is the Artifactory project short key used in artifact URLs.
#[derive(Debug, Clone, Serialize)]
pub struct Component {
    pub id: i64,
    pub guid: String,
    pub name: String,
    pub project_key: String,
    /// Optional per-component URL path pattern overriding the default
    /// template. Placeholders: `{branch}`, `{date}`, `{buildNumber}`,
    /// `{componentName}`.
    pub url_pattern: Option<String>,
}

/// A branch of a component. Names are free-form and may contain `/`.
#[derive(Debug, Clone, Serialize)]
pub struct Branch {
    pub id: i64,
    pub component_id: i64,
    pub name: String,
}

/// Per-component polling configuration from the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct PollingConfig {
    /// Seconds between polls for this component; clamped to >= 30 on read.
    pub interval_seconds: u64,
    /// Overrides the global retry budget when set.
    pub retry_attempts: Option<u32>,
    /// Overrides the global download timeout when set.
    pub download_timeout_seconds: Option<u64>,
    /// Overrides the global extraction timeout when set.
    pub extraction_timeout_seconds: Option<u64>,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// The unit of scheduling and retention: one `(component, branch)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TupleKey {
    pub component_id: i64,
    pub branch_id: i64,
}

/// One schedulable tuple with its catalog context.
#[derive(Debug, Clone, Serialize)]
pub struct PollTuple {
    pub component: Component,
    pub branch: Branch,
    pub polling: PollingConfig,
}

impl PollTuple {
    pub fn key(&self) -> TupleKey {
        TupleKey {
            component_id: self.component.id,
            branch_id: self.branch.id,
        }
    }
}

/// Status of the download or extraction step for a tracked build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Downloading => "downloading",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "downloading" => Some(StepStatus::Downloading),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// Latest-known-build record for a tuple. At most one row per tuple; the
/// coordinate never decreases once written.
#[derive(Debug, Clone, Serialize)]
pub struct BuildTracking {
    pub component_id: i64,
    pub branch_id: i64,
    pub coordinate: BuildCoordinate,
    pub artifact_url: String,
    pub last_check_at: DateTime<Utc>,
    pub last_download_at: Option<DateTime<Utc>>,
    pub download_status: StepStatus,
    pub extraction_status: StepStatus,
    pub download_path: Option<String>,
    pub extraction_path: Option<String>,
    pub file_size: Option<u64>,
    pub checksum: Option<String>,
    pub error_message: Option<String>,
}

/// Append-only record of a build that reached the downloaded state.
/// Retention flips `deleted` exactly once; rows are never removed.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub component_id: i64,
    pub branch_id: i64,
    pub coordinate: BuildCoordinate,
    pub artifact_url: String,
    pub download_path: String,
    pub extraction_path: Option<String>,
    pub file_size: u64,
    pub checksum: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Severity of an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// Operation tag attached to activity log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Poll,
    Download,
    Extraction,
    Cleanup,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Poll => "poll",
            Operation::Download => "download",
            Operation::Extraction => "extraction",
            Operation::Cleanup => "cleanup",
        }
    }
}

/// One structured activity log row. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub operation: Option<Operation>,
    pub component_id: Option<i64>,
    pub branch_id: Option<i64>,
    pub coordinate: Option<BuildCoordinate>,
    pub duration_ms: Option<u64>,
    pub message: String,
}
