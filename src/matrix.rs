//! Matrix storage and handles
//!
//! A [`Matrix`] is a rectangular row-major `f32` buffer tagged with the memory
//! tier it currently resides in. Matrices live in the engine's arena and are
//! referred to by [`MatrixId`] handles.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// Memory tier a matrix resides in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Position {
    /// Large, slow device memory (GPU HBM)
    #[default]
    GpuHbm,
    /// Small, fast on-chip shared memory
    SharedMemory,
}

impl Position {
    /// Whether this is the on-chip tier
    #[must_use]
    pub fn is_on_chip(self) -> bool {
        self == Self::SharedMemory
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::GpuHbm => write!(f, "GpuHbm"),
            Position::SharedMemory => write!(f, "SharedMemory"),
        }
    }
}

/// Opaque handle to a matrix slot in an engine's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatrixId(pub(crate) usize);

impl MatrixId {
    /// Arena index behind this handle
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Row-major matrix tagged with its memory tier
///
/// # Examples
///
/// ```
/// use tilesim::{Matrix, Position};
///
/// let m = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
/// assert_eq!(m.shape(), (2, 2));
/// assert_eq!(m.position(), Position::GpuHbm);
/// assert_eq!(m.row(1), Some(&[3.0, 4.0][..]));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
    position: Position,
}

impl Matrix {
    /// Create a matrix from row-major data in the given tier
    ///
    /// # Errors
    ///
    /// Returns `Err` if either dimension is zero or `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>, position: Position) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(SimError::InvalidShape {
                reason: format!("dimensions cannot be zero ({rows}x{cols})"),
            });
        }

        let expected = rows * cols;
        if data.len() != expected {
            return Err(SimError::DataShapeMismatch {
                data_size: data.len(),
                rows,
                cols,
                expected,
            });
        }

        Ok(Self {
            rows,
            cols,
            data,
            position,
        })
    }

    /// Create a device-resident matrix
    ///
    /// # Errors
    ///
    /// Same as [`Matrix::new`].
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        Self::new(rows, cols, data, Position::GpuHbm)
    }

    /// Constructor for engine kernels, which produce consistent shapes by construction
    pub(crate) fn from_parts(rows: usize, cols: usize, data: Vec<f32>, position: Position) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self {
            rows,
            cols,
            data,
            position,
        }
    }

    /// Number of rows
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// (rows, cols)
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Tier the matrix currently resides in
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    /// Row-major contents
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false for a constructed matrix; provided for API symmetry
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow row `r`, or `None` when out of range
    #[must_use]
    pub fn row(&self, r: usize) -> Option<&[f32]> {
        if r >= self.rows {
            return None;
        }
        let start = r * self.cols;
        Some(&self.data[start..start + self.cols])
    }

    pub(crate) fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    /// Replace shape and buffer in place (used by transpose)
    pub(crate) fn reshape_in_place(&mut self, rows: usize, cols: usize, data: Vec<f32>) {
        debug_assert_eq!(data.len(), rows * cols);
        self.rows = rows;
        self.cols = cols;
        self.data = data;
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Matrix({}x{}, {})", self.rows, self.cols, self.position)?;
        for r in 0..self.rows {
            let start = r * self.cols;
            write!(f, "[")?;
            for (i, val) in self.data[start..start + self.cols].iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{val}")?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}
