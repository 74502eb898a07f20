//! `poll` command: one polling cycle over all eligible tuples.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cli::commands::build_engine;
use crate::cli::run::CommandContext;
use crate::exit_codes::ExitCode;
use crate::scheduler::Scheduler;

pub async fn execute(ctx: &CommandContext) -> ExitCode {
    let engine = match build_engine(ctx) {
        Ok(engine) => engine,
        Err(message) => {
            eprintln!("✗ {message}");
            return ExitCode::DB_UNAVAILABLE;
        }
    };
    let scheduler = match Scheduler::new(engine) {
        Ok(scheduler) => Arc::new(scheduler),
        Err(err) => {
            eprintln!("✗ configuration error: {err}");
            return ExitCode::DB_UNAVAILABLE;
        }
    };

    match scheduler.run_cycle(&CancellationToken::new()).await {
        Ok(report) => {
            println!(
                "probed {}, new builds {}, downloaded {}, extracted {}, failed {}, pruned {}",
                report.probed,
                report.new_builds,
                report.downloaded,
                report.extracted,
                report.failed,
                report.pruned
            );
            if report.failed > 0 {
                ExitCode::PARTIAL_FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("✗ polling cycle aborted: {err}");
            ExitCode::DB_UNAVAILABLE
        }
    }
}
