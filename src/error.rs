//! Error types for tilesim
//!
//! Every contract violation the engine detects, whether at enqueue time or
//! while draining the queue, is reported as a [`SimError`]. Nothing in the
//! library aborts the process.

use thiserror::Error;

use crate::matrix::{MatrixId, Position};

/// Result type alias for tilesim operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Error type for all tilesim operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    /// Operand dimensions violate the operation's contract
    #[error("{op}: shape mismatch, left={left:?} right={right:?}")]
    ShapeMismatch {
        /// Operation name
        op: &'static str,
        /// (rows, cols) of the left operand
        left: (usize, usize),
        /// (rows, cols) of the right operand
        right: (usize, usize),
    },

    /// Row or column index beyond bounds
    #[error("{op}: index {index} out of range (bound {bound})")]
    IndexOutOfRange {
        /// Operation name
        op: &'static str,
        /// Requested index
        index: usize,
        /// Exclusive upper bound
        bound: usize,
    },

    /// Data length does not match the declared shape
    #[error("Data size {data_size} does not match shape {rows}x{cols} (expected {expected})")]
    DataShapeMismatch {
        /// Length of the supplied buffer
        data_size: usize,
        /// Declared rows
        rows: usize,
        /// Declared columns
        cols: usize,
        /// rows * cols
        expected: usize,
    },

    /// Shape is structurally invalid
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description
        reason: String,
    },

    /// Operand is not in the tier the operation requires
    #[error("{op}: {id} resides in {actual}, expected {expected}")]
    TierMismatch {
        /// Operation name
        op: &'static str,
        /// Offending handle
        id: MatrixId,
        /// Required tier
        expected: Position,
        /// Tier the matrix actually resides in
        actual: Position,
    },

    /// Handle was never minted by this engine
    #[error("Unknown matrix handle {0}")]
    UnknownHandle(MatrixId),

    /// Input has neither been produced nor declared as the output of a queued operation
    #[error("{op}: input {id} has no producer")]
    UnproducedInput {
        /// Operation name
        op: &'static str,
        /// Input handle
        id: MatrixId,
    },

    /// Output handle already has a producer (handles are write-once)
    #[error("{op}: output {id} was already produced")]
    OutputAlreadyProduced {
        /// Operation name
        op: &'static str,
        /// Output handle
        id: MatrixId,
    },

    /// Matrix has not been materialized yet
    #[error("Matrix {0} is not materialized; call run() first")]
    NotMaterialized(MatrixId),

    /// Handle was released and its storage reclaimed
    #[error("Matrix {0} was released")]
    ReleasedHandle(MatrixId),

    /// Handle is still referenced by a queued operation
    #[error("Matrix {0} is referenced by a queued operation")]
    HandleInUse(MatrixId),

    /// A name is already registered with the allocator
    #[error("Name '{name}' is already bound to {existing}")]
    DuplicateName {
        /// Name requested
        name: String,
        /// Handle already holding the name
        existing: MatrixId,
    },

    /// Concat axis other than 0 (rows) or 1 (columns)
    #[error("Invalid concat axis {0}")]
    InvalidAxis(usize),

    /// Key and value tile counts differ
    #[error("Tile count mismatch: {keys} keys, {values} values")]
    TileCountMismatch {
        /// Number of key tiles
        keys: usize,
        /// Number of value tiles
        values: usize,
    },

    /// Computation received an empty input
    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {message}")]
    IoError {
        /// Error message
        message: String,
    },

    /// Malformed data file or configuration document
    #[error("Parse error: {reason}")]
    ParseError {
        /// Description
        reason: String,
    },
}

impl From<std::io::Error> for SimError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError {
            reason: err.to_string(),
        }
    }
}

impl SimError {
    /// Whether this error is a shape or index contract violation
    ///
    /// These are the failures a malformed tiling schedule produces when a
    /// batch executes.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. } | Self::IndexOutOfRange { .. } | Self::TierMismatch { .. }
        )
    }
}
