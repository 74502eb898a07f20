//! `status` command: one line per active tuple with its tracked build.

use serde::Serialize;

use crate::cli::run::CommandContext;
use crate::exit_codes::ExitCode;
use crate::types::BuildTracking;

#[derive(Serialize)]
struct StatusRow {
    component: String,
    branch: String,
    tracking: Option<BuildTracking>,
}

pub fn execute(ctx: &CommandContext, json: bool) -> ExitCode {
    let default_interval = match ctx.settings.default_polling_frequency() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("✗ configuration error: {err}");
            return ExitCode::DB_UNAVAILABLE;
        }
    };
    let tuples = match ctx.store.active_configs(default_interval) {
        Ok(tuples) => tuples,
        Err(err) => {
            eprintln!("✗ cannot read catalog: {err}");
            return ExitCode::DB_UNAVAILABLE;
        }
    };

    let mut rows = Vec::with_capacity(tuples.len());
    for tuple in &tuples {
        match ctx.store.tracking(tuple.key()) {
            Ok(tracking) => rows.push(StatusRow {
                component: tuple.component.name.clone(),
                branch: tuple.branch.name.clone(),
                tracking,
            }),
            Err(err) => {
                eprintln!("✗ cannot read tracking: {err}");
                return ExitCode::DB_UNAVAILABLE;
            }
        }
    }

    if json {
        match serde_json::to_string_pretty(&rows) {
            Ok(out) => println!("{out}"),
            Err(err) => {
                eprintln!("✗ cannot serialize status: {err}");
                return ExitCode::INTERNAL;
            }
        }
        return ExitCode::SUCCESS;
    }

    if rows.is_empty() {
        println!("no active tuples");
        return ExitCode::SUCCESS;
    }
    for row in &rows {
        match &row.tracking {
            Some(t) => println!(
                "{}/{}  latest {}  download {}  extraction {}  checked {}",
                row.component,
                row.branch,
                t.coordinate,
                t.download_status.as_str(),
                t.extraction_status.as_str(),
                t.last_check_at.to_rfc3339(),
            ),
            None => println!("{}/{}  never polled", row.component, row.branch),
        }
    }
    ExitCode::SUCCESS
}
