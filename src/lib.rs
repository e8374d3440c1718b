//! # tilesim
//!
//! Deferred-execution matrix engine over a simulated two-tier GPU memory
//! hierarchy, and a tiled attention pipeline built on top of it.
//!
//! ## Model
//!
//! - **Tiers**: every matrix resides in device memory (`GpuHbm`) or on-chip
//!   memory (`SharedMemory`). Compute operations read and write on-chip.
//! - **Deferred execution**: engine calls enqueue work and return output
//!   handles immediately; [`Engine::run`] drains the queue in FIFO order.
//! - **Handles**: [`MatrixId`] values index an arena owned by the engine.
//!   [`MemoryAllocator`] mints them and keeps a diagnostic name per handle.
//!
//! ## Example
//!
//! ```rust
//! use tilesim::{Engine, MemoryAllocator, Position};
//!
//! let mut engine = Engine::new();
//! let mut alloc = MemoryAllocator::new();
//!
//! let row = engine.create_matrix(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
//! let total = alloc.allocate(&mut engine, "total").unwrap();
//!
//! engine.move_to_shared_memory(row).unwrap();
//! engine.sum(row, total).unwrap();
//! engine.run(false, &alloc).unwrap();
//!
//! let m = engine.matrix(total).unwrap();
//! assert_eq!(m.data(), &[6.0]);
//! assert_eq!(m.position(), Position::SharedMemory);
//! ```
//!
//! Attention over key/value tiles is in [`attention`]; the data loader and
//! answer checker used by the `tilesim` binary are in [`harness`].

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // counters -> f64 cycle tally
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)] // GpuHbm, SharedMemory
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // exact comparisons in tests

pub mod allocator;
pub mod attention;
/// Command-line front end (extracted for testability)
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod harness;
pub mod matrix;
pub mod telemetry;

pub use allocator::MemoryAllocator;
pub use attention::{AttentionOptions, QuerySource};
pub use config::{CostModel, EngineConfig};
pub use engine::{Axis, Engine, Op, RunReport, RunStats, SlotState};
pub use error::{Result, SimError};
pub use matrix::{Matrix, MatrixId, Position};
