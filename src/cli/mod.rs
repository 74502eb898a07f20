//! Command-line interface: argument definitions, dispatch, and handlers.

pub mod args;
pub mod commands;
pub mod run;

pub use run::run;
