//! Error taxonomy for the polling engine
//!
//! Every external call returns a tagged error from one of these enums; the
//! scheduler maps them onto tracking status and activity log entries, and
//! the CLI maps them onto exit codes. Nothing is swallowed.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the artifact source (probe / fetch).
///
/// `NotFound` is a normal discovery signal, not a fault. `Unauthorized` is
/// never retried. `Transient` is retried within the configured budget.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("artifact not found")]
    NotFound,

    #[error("artifact repository rejected credentials: {0}")]
    Unauthorized(String),

    #[error("transient artifact repository error: {0}")]
    Transient(String),

    #[error("artifact repository error: {0}")]
    Fatal(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Errors producing an artifact URL from a component's pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlTemplateError {
    #[error("unknown placeholder '{{{placeholder}}}' in URL pattern for component '{component}'")]
    UnknownPlaceholder {
        placeholder: String,
        component: String,
    },

    #[error("invalid base URL '{0}'")]
    InvalidBase(String),
}

/// Errors from the download manager.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The artifact vanished between probe and download.
    #[error("disappeared")]
    Disappeared,

    #[error("artifact repository rejected credentials: {0}")]
    Unauthorized(String),

    #[error("size mismatch: expected {expected} bytes, wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: upstream {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("network error during download: {0}")]
    Network(String),

    #[error("download timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the extraction manager.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// An archive entry resolves outside the extraction root.
    #[error("unsafe archive entry '{entry}'")]
    UnsafeEntry { entry: String },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("extraction timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors during discovery: either the repository failed or the component's
/// URL pattern is unusable.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Template(#[from] UrlTemplateError),
}

/// Errors from the tracking store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store connection poisoned")]
    Poisoned,

    #[error("malformed row: {0}")]
    InvalidRow(String),
}

/// Errors from the configuration provider.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required configuration key '{0}'")]
    MissingKey(String),

    #[error("invalid value '{value}' for configuration key '{key}'")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error type for the engine.
#[derive(Debug, Error)]
pub enum WincoreError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    UrlTemplate(#[from] UrlTemplateError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Map a source failure into the download vocabulary. A missing artifact
    /// at this stage means it disappeared after the probe saw it.
    pub fn from_source(err: SourceError) -> Self {
        match err {
            SourceError::NotFound => DownloadError::Disappeared,
            SourceError::Unauthorized(msg) => DownloadError::Unauthorized(msg),
            SourceError::Transient(msg) | SourceError::Fatal(msg) => DownloadError::Network(msg),
            SourceError::Cancelled => DownloadError::Cancelled,
        }
    }
}
