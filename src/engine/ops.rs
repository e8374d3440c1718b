//! Queued operation records

use std::fmt;

use crate::error::{Result, SimError};
use crate::matrix::{MatrixId, Position};

/// Concatenation axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Stack rows (axis 0); column counts must match
    Rows,
    /// Stack columns (axis 1); row counts must match
    Columns,
}

impl TryFrom<usize> for Axis {
    type Error = SimError;

    fn try_from(axis: usize) -> Result<Self> {
        match axis {
            0 => Ok(Self::Rows),
            1 => Ok(Self::Columns),
            other => Err(SimError::InvalidAxis(other)),
        }
    }
}

/// One deferred engine operation
///
/// Fresh outputs are write-once; `Transpose` and the two tier moves act on
/// their target in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Concatenate two matrices along `axis`, output tagged `tier`
    Concat {
        /// First operand
        lhs: MatrixId,
        /// Second operand
        rhs: MatrixId,
        /// Output handle
        out: MatrixId,
        /// Concatenation axis
        axis: Axis,
        /// Tier of operands and output
        tier: Position,
    },
    /// Transpose in place where the data lives
    Transpose {
        /// Matrix to transpose
        target: MatrixId,
        /// Tier the matrix must reside in
        tier: Position,
    },
    /// Matrix product
    MatMul {
        /// Left operand (m x k)
        lhs: MatrixId,
        /// Right operand (k x n)
        rhs: MatrixId,
        /// Output handle (m x n)
        out: MatrixId,
    },
    /// Elementwise sum, or broadcast of a 1x1 right operand
    MatAdd {
        /// Left operand
        lhs: MatrixId,
        /// Right operand
        rhs: MatrixId,
        /// Output handle
        out: MatrixId,
    },
    /// Elementwise difference, or broadcast of a 1x1 right operand
    MatSub {
        /// Left operand
        lhs: MatrixId,
        /// Right operand
        rhs: MatrixId,
        /// Output handle
        out: MatrixId,
    },
    /// Elementwise quotient, or division by a 1x1 denominator
    MatDiv {
        /// Numerator
        numer: MatrixId,
        /// Denominator
        denom: MatrixId,
        /// Output handle
        out: MatrixId,
    },
    /// Multiply every element by a scalar
    MatMulNum {
        /// Operand
        input: MatrixId,
        /// Scalar factor
        scalar: f32,
        /// Output handle
        out: MatrixId,
    },
    /// Elementwise exponential
    MatExp {
        /// Operand
        input: MatrixId,
        /// Output handle
        out: MatrixId,
    },
    /// Sum of all elements as a 1x1 matrix
    Sum {
        /// Operand
        input: MatrixId,
        /// Output handle
        out: MatrixId,
    },
    /// Maximum element as a 1x1 matrix
    Max {
        /// Operand
        input: MatrixId,
        /// Output handle
        out: MatrixId,
    },
    /// Extract one row as a 1 x cols matrix
    GetRow {
        /// Source matrix
        input: MatrixId,
        /// Row index
        row: usize,
        /// Output handle
        out: MatrixId,
        /// Tier of source and output
        tier: Position,
    },
    /// Extract one column as a rows x 1 matrix
    GetColumn {
        /// Source matrix
        input: MatrixId,
        /// Column index
        col: usize,
        /// Output handle
        out: MatrixId,
        /// Tier of source and output
        tier: Position,
    },
    /// Duplicate a matrix
    Copy {
        /// Source
        src: MatrixId,
        /// Destination handle
        dst: MatrixId,
        /// Tier of source and destination
        tier: Position,
    },
    /// Move a matrix into shared memory in place
    MoveToSharedMemory {
        /// Matrix to move
        target: MatrixId,
    },
    /// Move a matrix into GPU HBM in place
    MoveToGpuHbm {
        /// Matrix to move
        target: MatrixId,
    },
}

impl Op {
    /// Operation name used in errors and logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Op::Concat { .. } => "Concat",
            Op::Transpose { .. } => "Transpose",
            Op::MatMul { .. } => "MatMul",
            Op::MatAdd { .. } => "MatAdd",
            Op::MatSub { .. } => "MatSub",
            Op::MatDiv { .. } => "MatDiv",
            Op::MatMulNum { .. } => "MatMulNum",
            Op::MatExp { .. } => "MatExp",
            Op::Sum { .. } => "Sum",
            Op::Max { .. } => "Max",
            Op::GetRow { .. } => "GetRow",
            Op::GetColumn { .. } => "GetColumn",
            Op::Copy { .. } => "Copy",
            Op::MoveToSharedMemory { .. } => "MoveMatrixToSharedMem",
            Op::MoveToGpuHbm { .. } => "MoveMatrixToGpuHbm",
        }
    }

    /// Handles read by this operation, in-place targets included
    #[must_use]
    pub fn inputs(&self) -> Vec<MatrixId> {
        match *self {
            Op::Concat { lhs, rhs, .. }
            | Op::MatMul { lhs, rhs, .. }
            | Op::MatAdd { lhs, rhs, .. }
            | Op::MatSub { lhs, rhs, .. } => vec![lhs, rhs],
            Op::MatDiv { numer, denom, .. } => vec![numer, denom],
            Op::MatMulNum { input, .. }
            | Op::MatExp { input, .. }
            | Op::Sum { input, .. }
            | Op::Max { input, .. }
            | Op::GetRow { input, .. }
            | Op::GetColumn { input, .. } => vec![input],
            Op::Copy { src, .. } => vec![src],
            Op::Transpose { target, .. }
            | Op::MoveToSharedMemory { target }
            | Op::MoveToGpuHbm { target } => vec![target],
        }
    }

    /// Fresh output produced by this operation; `None` for in-place operations
    #[must_use]
    pub fn output(&self) -> Option<MatrixId> {
        if self.is_in_place() {
            None
        } else {
            Some(self.result())
        }
    }

    /// Whether the operation rewrites its target instead of producing a fresh output
    #[must_use]
    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            Op::Transpose { .. } | Op::MoveToSharedMemory { .. } | Op::MoveToGpuHbm { .. }
        )
    }

    /// Handle returned to the caller at enqueue time
    #[must_use]
    pub fn result(&self) -> MatrixId {
        match *self {
            Op::Concat { out, .. }
            | Op::MatMul { out, .. }
            | Op::MatAdd { out, .. }
            | Op::MatSub { out, .. }
            | Op::MatDiv { out, .. }
            | Op::MatMulNum { out, .. }
            | Op::MatExp { out, .. }
            | Op::Sum { out, .. }
            | Op::Max { out, .. }
            | Op::GetRow { out, .. }
            | Op::GetColumn { out, .. } => out,
            Op::Copy { dst, .. } => dst,
            Op::Transpose { target, .. }
            | Op::MoveToSharedMemory { target }
            | Op::MoveToGpuHbm { target } => target,
        }
    }

    /// Whether the operation refers to `id` at all
    #[must_use]
    pub fn references(&self, id: MatrixId) -> bool {
        self.output() == Some(id) || self.inputs().contains(&id)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.inputs().iter().map(ToString::to_string).collect();
        write!(f, "{}({})", self.name(), inputs.join(", "))?;
        if let Some(out) = self.output() {
            write!(f, " -> {out}")?;
        }
        Ok(())
    }
}
