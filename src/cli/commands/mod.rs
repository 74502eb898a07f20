//! Command handlers, one module per subcommand.
//!
//! Handlers print their own output and return the exit code; the contract
//! lives in [`crate::exit_codes`].

pub mod cleanup;
pub mod config;
pub mod poll;
pub mod start;
pub mod status;

use std::sync::Arc;
use url::Url;

use crate::cli::run::CommandContext;
use crate::error::SettingsError;
use crate::jfrog::JfrogClient;

/// Build the authenticated repository client from configuration. Missing
/// credentials or a malformed base URL are startup configuration errors.
pub(crate) fn build_client(ctx: &CommandContext) -> Result<JfrogClient, String> {
    let raw_url = ctx
        .settings
        .jfrog_base_url()
        .map_err(settings_error_message)?;
    let base = Url::parse(&raw_url)
        .map_err(|_| format!("configuration error: invalid JFrogBaseURL '{raw_url}'"))?;
    let (user, pass) = ctx
        .settings
        .jfrog_credentials()
        .map_err(settings_error_message)?;
    JfrogClient::new(base, user, pass).map_err(|err| format!("cannot build HTTP client: {err}"))
}

/// Assemble the full engine (store + settings + repository client).
pub(crate) fn build_engine(
    ctx: &CommandContext,
) -> Result<Arc<crate::scheduler::Engine>, String> {
    let client = build_client(ctx)?;
    Ok(Arc::new(crate::scheduler::Engine::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.settings),
        Arc::new(client),
        Arc::new(crate::clock::SystemClock),
        Arc::clone(&ctx.activity),
    )))
}

fn settings_error_message(err: SettingsError) -> String {
    format!("configuration error: {err}")
}
