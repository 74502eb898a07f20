//! `cleanup` command: retention pass over every tuple.

use std::sync::Arc;

use crate::clock::SystemClock;
use crate::cli::run::CommandContext;
use crate::exit_codes::ExitCode;
use crate::retention::RetentionManager;

pub async fn execute(ctx: &CommandContext) -> ExitCode {
    let retention = RetentionManager::new(Arc::clone(&ctx.store));
    match retention
        .cleanup_all(&ctx.settings, &ctx.activity, &SystemClock)
        .await
    {
        Ok(report) => {
            println!(
                "{} tuples, {} builds pruned, {} failures, {} log rows purged",
                report.tuples, report.pruned, report.failures, report.purged_log_rows
            );
            if report.failures > 0 {
                ExitCode::PARTIAL_FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("✗ cleanup aborted: {err}");
            ExitCode::DB_UNAVAILABLE
        }
    }
}
