//! wincore CLI binary
//!
//! Minimal entrypoint: all logic lives in the library, and cli::run()
//! handles all output including errors. main only maps the exit code.

fn main() {
    if let Err(code) = wincore::cli::run() {
        std::process::exit(code.as_i32());
    }
}
