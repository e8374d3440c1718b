//! tilesim CLI
//!
//! # Commands
//!
//! - `run` - Run tiled attention over a data directory and grade the results
//! - `demo` - Walk through a two-key attention example
//! - `info` - Show version and default configuration

use std::process::ExitCode;

use clap::Parser;
use tilesim::cli::{entrypoint, Cli};

fn main() -> ExitCode {
    tilesim::telemetry::init_tracing();
    let cli = Cli::parse();

    match entrypoint(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}
