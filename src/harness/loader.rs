//! Whitespace-delimited float data files
//!
//! A data directory holds four files, each a flat stream of floats split by
//! any whitespace:
//!
//! | File          | Contents                                   |
//! |---------------|--------------------------------------------|
//! | `keys.txt`    | key tiles, one row of `width` floats each  |
//! | `values.txt`  | value tiles, same layout as keys           |
//! | `queries.txt` | query rows, `width` floats each            |
//! | `ans.txt`     | reference results, concatenated per tile   |

use std::fs;
use std::path::Path;

use crate::error::{Result, SimError};

/// Row width of the reference data set
pub const DEFAULT_TILE_WIDTH: usize = 512;

/// Parse every whitespace-separated token of `text` as `f32`
///
/// # Errors
///
/// Returns `ParseError` naming the first token that is not a float.
pub fn parse_values(text: &str) -> Result<Vec<f32>> {
    text.split_whitespace()
        .enumerate()
        .map(|(i, token)| {
            token.parse::<f32>().map_err(|e| SimError::ParseError {
                reason: format!("token {i} ('{token}'): {e}"),
            })
        })
        .collect()
}

/// Read and parse a whitespace-delimited float file
///
/// # Errors
///
/// Returns `IoError` if the file cannot be read and `ParseError` on bad tokens.
pub fn load_values(path: impl AsRef<Path>) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| SimError::IoError {
        message: format!("{}: {e}", path.display()),
    })?;
    parse_values(&text).map_err(|e| match e {
        SimError::ParseError { reason } => SimError::ParseError {
            reason: format!("{}: {reason}", path.display()),
        },
        other => other,
    })
}

/// Split a flat stream into rows of `width` floats
///
/// # Errors
///
/// Returns `InvalidShape` when `width` is zero or does not divide the stream.
pub fn split_tiles(values: &[f32], width: usize) -> Result<Vec<Vec<f32>>> {
    check_width(values.len(), width)?;
    Ok(values.chunks_exact(width).map(<[f32]>::to_vec).collect())
}

fn check_width(len: usize, width: usize) -> Result<()> {
    if width == 0 {
        return Err(SimError::InvalidShape {
            reason: "tile width must be positive".to_string(),
        });
    }
    if len % width != 0 {
        return Err(SimError::InvalidShape {
            reason: format!("{len} values do not split into rows of {width}"),
        });
    }
    Ok(())
}

/// Keys, values, queries and reference answers of one attention workload
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    width: usize,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    queries: Vec<f32>,
    answers: Vec<f32>,
}

impl DataSet {
    /// Validate and assemble a data set from flat streams
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if a stream does not split into rows of `width`,
    /// and `TileCountMismatch` if key and value row counts differ.
    pub fn new(
        width: usize,
        keys: Vec<f32>,
        values: Vec<f32>,
        queries: Vec<f32>,
        answers: Vec<f32>,
    ) -> Result<Self> {
        let keys = split_tiles(&keys, width)?;
        let values = split_tiles(&values, width)?;
        check_width(queries.len(), width)?;
        if keys.len() != values.len() {
            return Err(SimError::TileCountMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        Ok(Self {
            width,
            keys,
            values,
            queries,
            answers,
        })
    }

    /// Load `keys.txt`, `values.txt`, `queries.txt` and `ans.txt` from `dir`
    ///
    /// # Errors
    ///
    /// Propagates I/O, parse and shape errors.
    pub fn load(dir: impl AsRef<Path>, width: usize) -> Result<Self> {
        let dir = dir.as_ref();
        Self::new(
            width,
            load_values(dir.join("keys.txt"))?,
            load_values(dir.join("values.txt"))?,
            load_values(dir.join("queries.txt"))?,
            load_values(dir.join("ans.txt"))?,
        )
    }

    /// Row width
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of key (and value) tiles
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of query rows
    #[must_use]
    pub fn query_rows(&self) -> usize {
        self.queries.len() / self.width
    }

    /// Key tiles as rows of `width`
    pub fn key_tiles(&self) -> impl Iterator<Item = &[f32]> {
        self.keys.iter().map(Vec::as_slice)
    }

    /// Value tiles as rows of `width`
    pub fn value_tiles(&self) -> impl Iterator<Item = &[f32]> {
        self.values.iter().map(Vec::as_slice)
    }

    /// Query rows, row-major
    #[must_use]
    pub fn queries(&self) -> &[f32] {
        &self.queries
    }

    /// Reference answers, concatenated in tile order
    #[must_use]
    pub fn answers(&self) -> &[f32] {
        &self.answers
    }
}
