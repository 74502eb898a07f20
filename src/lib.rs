//! wincore - artifact polling engine
//!
//! Watches an Artifactory instance for newly published build numbers across
//! every enabled `(component, branch)` tuple, and for each new build
//! downloads the archive into a canonical GUID-rooted on-disk tree,
//! extracts it, records history, and prunes old builds to a bounded
//! retention window. Catalog, tracking state, history and a structured
//! activity log live in a relational store.

pub mod activity;
pub mod cli;
pub mod clock;
pub mod coordinate;
pub mod download;
pub mod error;
pub mod exit_codes;
pub mod extract;
pub mod jfrog;
pub mod layout;
pub mod logging;
pub mod retention;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod types;

// Core types used by external consumers and the integration tests.
pub use coordinate::BuildCoordinate;
pub use error::{
    DownloadError, ExtractError, SettingsError, SourceError, StoreError, WincoreError,
};
pub use exit_codes::ExitCode;
pub use types::{PollTuple, StepStatus, TupleKey};
