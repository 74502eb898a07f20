//! `start` command: continuous polling until SIGINT/SIGTERM.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::commands::build_engine;
use crate::cli::run::CommandContext;
use crate::exit_codes::ExitCode;
use crate::scheduler::Scheduler;

pub async fn execute(ctx: &CommandContext) -> ExitCode {
    // Refuse to start without credentials; a pool of workers that can only
    // fail auth helps nobody.
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

    let stop = CancellationToken::new();
    spawn_signal_listener(stop.clone());

    match scheduler.run(&stop).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("✗ scheduler fault: {err}");
            ExitCode::INTERNAL
        }
    }
}

fn spawn_signal_listener(stop: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        stop.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
