//! `config` command: print recognized configuration keys.
//!
//! The service password is redacted here and must never be printed or
//! logged anywhere else either.

use crate::cli::run::CommandContext;
use crate::exit_codes::ExitCode;

pub fn execute(ctx: &CommandContext) -> ExitCode {
    match ctx.settings.redacted_entries() {
        Ok(entries) => {
            for (key, value) in entries {
                println!("{key} = {value}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("✗ cannot read configuration: {err}");
            ExitCode::DB_UNAVAILABLE
        }
    }
}
