//! CLI argument definitions and parsing structures
//!
//! The command surface is deliberately thin: each subcommand maps onto one
//! engine operation, and the exit codes are part of the external contract.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// wincore - artifact polling engine
#[derive(Parser)]
#[command(name = "wincore")]
#[command(about = "Watches an artifact repository for new builds, downloads, extracts and prunes them")]
#[command(long_about = r#"
wincore polls an Artifactory instance for newly published build numbers
across every enabled (component, branch) tuple in the catalog. Each new
build is downloaded into the component's GUID-rooted tree, extracted,
recorded in history, and old builds are pruned to the retention window.

EXAMPLES:
  # Verify database and repository connectivity
  wincore test

  # Show the effective configuration (secrets redacted)
  wincore config

  # Show every active tuple with its tracked build
  wincore status --json

  # Run exactly one polling cycle
  wincore poll

  # Poll continuously until SIGINT/SIGTERM
  wincore start

  # Prune all tuples to the retention window
  wincore cleanup

CONFIGURATION:
  Configuration lives in the system_config table of the engine database.
  Environment variables override individual keys when set:
  WINCORE_BASE_DRIVE, WINCORE_JFROG_URL, WINCORE_JFROG_USER,
  WINCORE_JFROG_PASS, WINCORE_MAX_CONCURRENCY. The database path itself
  comes from --db or WINCORE_DB (default: wincore.db).
"#)]
#[command(version)]
pub struct Cli {
    /// Path to the engine database (overrides WINCORE_DB)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Append every activity record as a JSON line to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub json_log: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Verify database reachability and artifact repository credentials
    ///
    /// Exit codes: 0 on success, 2 when the database is unreachable,
    /// 3 when the repository rejects the credentials, 4 when the
    /// repository cannot be reached at all.
    Test,

    /// Print every recognized configuration key with its effective value
    ///
    /// The service password is always redacted.
    Config,

    /// Show each active tuple with its tracked build and step statuses
    Status {
        /// Emit machine-readable JSON instead of the human listing
        #[arg(long)]
        json: bool,
    },

    /// Run one polling cycle over all currently eligible tuples
    ///
    /// Exits 0 when no tuple failed, 1 otherwise.
    Poll,

    /// Poll continuously until SIGINT/SIGTERM
    Start,

    /// Prune every tuple to the retention window and trim the activity log
    ///
    /// Exits 0 on success, 1 when some files could not be removed.
    Cleanup,
}
