//! Tracing initialization for the CLI
//!
//! Process diagnostics go through `tracing`; the structured activity log
//! (persisted per operation) lives in [`crate::activity`].

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. `RUST_LOG` wins when set; otherwise
/// `--verbose` selects debug-level output for this crate.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("wincore=debug,info")
            } else {
                EnvFilter::try_new("wincore=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Diagnostics go to stderr so stdout stays machine-readable for
    // commands like `status --json`.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init()?;

    Ok(())
}
