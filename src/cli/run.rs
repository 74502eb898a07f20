//! CLI entry point and dispatch
//!
//! `run()` parses arguments, initializes tracing, opens the store, builds
//! the tokio runtime and dispatches to command handlers. Handlers print
//! their own output and return the exit code; `main` only maps it onto the
//! process exit.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use super::args::{Cli, Commands};
use super::commands;
use crate::activity::ActivityLog;
use crate::exit_codes::ExitCode;
use crate::logging;
use crate::settings::Settings;
use crate::store::Store;

/// Shared context every command handler receives.
pub struct CommandContext {
    pub store: Arc<Store>,
    pub settings: Arc<Settings>,
    pub activity: Arc<ActivityLog>,
}

/// Main CLI execution function. Handles all output; returns the exit code
/// on failure.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();

    // A second init (e.g. under tests) is harmless.
    let _ = logging::init_tracing(cli.verbose);

    let db_path = cli
        .db
        .clone()
        .or_else(|| std::env::var_os("WINCORE_DB").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("wincore.db"));

    let store = match Store::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("✗ cannot open database {}: {err}", db_path.display());
            return Err(ExitCode::DB_UNAVAILABLE);
        }
    };
    let settings = Arc::new(Settings::new(Arc::clone(&store)));

    let activity = match &cli.json_log {
        Some(path) => match ActivityLog::with_json_sink(Arc::clone(&store), path) {
            Ok(activity) => Arc::new(activity),
            Err(err) => {
                eprintln!("✗ cannot open JSON log {}: {err}", path.display());
                return Err(ExitCode::INTERNAL);
            }
        },
        None => Arc::new(ActivityLog::new(Arc::clone(&store))),
    };

    let ctx = CommandContext {
        store,
        settings,
        activity,
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("✗ failed to create async runtime: {err}");
            return Err(ExitCode::INTERNAL);
        }
    };

    let code = rt.block_on(async {
        match cli.command {
            Commands::Test => commands::test::execute(&ctx).await,
            Commands::Config => commands::config::execute(&ctx),
            Commands::Status { json } => commands::status::execute(&ctx, json),
            Commands::Poll => commands::poll::execute(&ctx).await,
            Commands::Start => commands::start::execute(&ctx).await,
            Commands::Cleanup => commands::cleanup::execute(&ctx).await,
        }
    });

    if code.is_success() { Ok(()) } else { Err(code) }
}
