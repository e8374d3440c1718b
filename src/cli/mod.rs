//! Command-line front end
//!
//! Argument definitions live here; [`handlers`] holds the command bodies so
//! they can be exercised without a process boundary.

#![allow(clippy::missing_errors_doc)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;
use crate::harness::{QueryLayout, DEFAULT_TILE_WIDTH, DEFAULT_TOLERANCE};

pub mod handlers;

/// Tiled attention on a simulated two-tier GPU memory
#[derive(Debug, Parser)]
#[command(name = "tilesim")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run attention over a data directory and grade it against `ans.txt`
    ///
    /// Examples:
    ///   tilesim run --data-dir ./data
    ///   tilesim run --data-dir ./data --layout fixed:4 --stable
    Run {
        /// Directory holding keys.txt, values.txt, queries.txt and ans.txt
        #[arg(short, long, value_name = "DIR")]
        data_dir: PathBuf,

        /// Floats per key/value/query row
        #[arg(short, long, default_value_t = DEFAULT_TILE_WIDTH)]
        width: usize,

        /// Query grouping: `prefix` or `fixed:N`
        #[arg(short, long, default_value_t = QueryLayout::Prefix)]
        layout: QueryLayout,

        /// Maximum absolute error per element
        #[arg(short, long, default_value_t = DEFAULT_TOLERANCE)]
        tolerance: f32,

        /// Engine configuration (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Multiply scores by this factor before the softmax
        #[arg(long)]
        scale: Option<f32>,

        /// Subtract each row's maximum before exponentiating
        #[arg(long)]
        stable: bool,

        /// Log every executed operation
        #[arg(short, long)]
        verbose: bool,
    },
    /// Two-key attention on a 2x3 query, printing every intermediate
    Demo {
        /// Log every executed operation
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show version and default configuration
    Info,
}

/// Dispatch a parsed command line; returns whether every graded tile passed
pub fn entrypoint(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Run {
            data_dir,
            width,
            layout,
            tolerance,
            config,
            scale,
            stable,
            verbose,
        } => {
            let report = handlers::handle_run(&handlers::RunConfig {
                data_dir,
                width,
                layout,
                tolerance,
                config,
                scale,
                stable,
                verbose,
            })?;
            print!("{report}");
            println!();
            Ok(report.all_passed())
        },
        Commands::Demo { verbose } => {
            handlers::handle_demo(verbose)?;
            Ok(true)
        },
        Commands::Info => {
            handlers::handle_info()?;
            Ok(true)
        },
    }
}
