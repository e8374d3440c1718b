//! Data loading and answer checking around [`crate::attention`]

pub mod loader;
mod rater;

pub use loader::{load_values, split_tiles, DataSet, DEFAULT_TILE_WIDTH};
pub use rater::{QueryLayout, Rater, RaterReport, TileOutcome, DEFAULT_TOLERANCE};
