//! Reference kernels executed by the engine
//!
//! Plain row-major loops over `f32`. Every kernel checks its shape contract
//! and reports violations instead of panicking.

use crate::error::{Result, SimError};
use crate::matrix::Matrix;

use super::ops::Axis;

/// Shape and buffer produced by a kernel, before it is placed in a tier
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Produced {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Produced {
    fn scalar(value: f32) -> Self {
        Self {
            rows: 1,
            cols: 1,
            data: vec![value],
        }
    }
}

pub(crate) fn concat(op: &'static str, lhs: &Matrix, rhs: &Matrix, axis: Axis) -> Result<Produced> {
    match axis {
        Axis::Rows => {
            if lhs.cols() != rhs.cols() {
                return Err(SimError::ShapeMismatch {
                    op,
                    left: lhs.shape(),
                    right: rhs.shape(),
                });
            }
            let mut data = Vec::with_capacity(lhs.len() + rhs.len());
            data.extend_from_slice(lhs.data());
            data.extend_from_slice(rhs.data());
            Ok(Produced {
                rows: lhs.rows() + rhs.rows(),
                cols: lhs.cols(),
                data,
            })
        },
        Axis::Columns => {
            if lhs.rows() != rhs.rows() {
                return Err(SimError::ShapeMismatch {
                    op,
                    left: lhs.shape(),
                    right: rhs.shape(),
                });
            }
            let cols = lhs.cols() + rhs.cols();
            let mut data = Vec::with_capacity(lhs.rows() * cols);
            for r in 0..lhs.rows() {
                data.extend_from_slice(&lhs.data()[r * lhs.cols()..(r + 1) * lhs.cols()]);
                data.extend_from_slice(&rhs.data()[r * rhs.cols()..(r + 1) * rhs.cols()]);
            }
            Ok(Produced {
                rows: lhs.rows(),
                cols,
                data,
            })
        },
    }
}

/// Transpose a row-major `rows x cols` buffer into `cols x rows`
pub(crate) fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

/// C = A @ B
#[allow(clippy::many_single_char_names)]
pub(crate) fn matmul(op: &'static str, a: &Matrix, b: &Matrix) -> Result<Produced> {
    if a.cols() != b.rows() {
        return Err(SimError::ShapeMismatch {
            op,
            left: a.shape(),
            right: b.shape(),
        });
    }

    let (m, k, n) = (a.rows(), a.cols(), b.cols());
    let lhs = a.data();
    let rhs = b.data();
    let mut data = vec![0.0f32; m * n];

    // i-k-j order keeps the inner loop on contiguous rows of B and C
    for i in 0..m {
        let out_row = &mut data[i * n..(i + 1) * n];
        for p in 0..k {
            let scale = lhs[i * k + p];
            let b_row = &rhs[p * n..(p + 1) * n];
            for (acc, &bv) in out_row.iter_mut().zip(b_row) {
                *acc += scale * bv;
            }
        }
    }

    Ok(Produced {
        rows: m,
        cols: n,
        data,
    })
}

/// Elementwise binary kernel; a 1x1 right operand is broadcast
pub(crate) fn zip_broadcast(
    op: &'static str,
    lhs: &Matrix,
    rhs: &Matrix,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Produced> {
    let data = if lhs.shape() == rhs.shape() {
        lhs.data()
            .iter()
            .zip(rhs.data())
            .map(|(&x, &y)| f(x, y))
            .collect()
    } else if rhs.shape() == (1, 1) {
        let y = rhs.data()[0];
        lhs.data().iter().map(|&x| f(x, y)).collect()
    } else {
        return Err(SimError::ShapeMismatch {
            op,
            left: lhs.shape(),
            right: rhs.shape(),
        });
    };

    Ok(Produced {
        rows: lhs.rows(),
        cols: lhs.cols(),
        data,
    })
}

pub(crate) fn map(input: &Matrix, f: impl Fn(f32) -> f32) -> Produced {
    Produced {
        rows: input.rows(),
        cols: input.cols(),
        data: input.data().iter().map(|&x| f(x)).collect(),
    }
}

pub(crate) fn duplicate(input: &Matrix) -> Produced {
    Produced {
        rows: input.rows(),
        cols: input.cols(),
        data: input.data().to_vec(),
    }
}

pub(crate) fn sum(input: &Matrix) -> Produced {
    Produced::scalar(input.data().iter().sum())
}

pub(crate) fn max(input: &Matrix) -> Produced {
    Produced::scalar(input.data().iter().copied().fold(f32::NEG_INFINITY, f32::max))
}

pub(crate) fn get_row(op: &'static str, input: &Matrix, row: usize) -> Result<Produced> {
    let data = input.row(row).ok_or(SimError::IndexOutOfRange {
        op,
        index: row,
        bound: input.rows(),
    })?;
    Ok(Produced {
        rows: 1,
        cols: input.cols(),
        data: data.to_vec(),
    })
}

pub(crate) fn get_column(op: &'static str, input: &Matrix, col: usize) -> Result<Produced> {
    if col >= input.cols() {
        return Err(SimError::IndexOutOfRange {
            op,
            index: col,
            bound: input.cols(),
        });
    }
    let data = input
        .data()
        .iter()
        .skip(col)
        .step_by(input.cols())
        .copied()
        .collect();
    Ok(Produced {
        rows: input.rows(),
        cols: 1,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(rows: usize, cols: usize, data: &[f32]) -> Matrix {
        Matrix::from_vec(rows, cols, data.to_vec()).unwrap()
    }

    #[test]
    fn test_concat_rows() {
        let out = concat("Concat", &m(1, 2, &[1.0, 2.0]), &m(1, 2, &[3.0, 4.0]), Axis::Rows).unwrap();
        assert_eq!((out.rows, out.cols), (2, 2));
        assert_eq!(out.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_concat_columns() {
        let a = m(2, 1, &[1.0, 2.0]);
        let b = m(2, 2, &[3.0, 4.0, 5.0, 6.0]);
        let out = concat("Concat", &a, &b, Axis::Columns).unwrap();
        assert_eq!((out.rows, out.cols), (2, 3));
        assert_eq!(out.data, vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_concat_rows_column_mismatch() {
        let err = concat("Concat", &m(1, 2, &[1.0, 2.0]), &m(1, 3, &[0.0; 3]), Axis::Rows).unwrap_err();
        assert!(matches!(err, SimError::ShapeMismatch { op: "Concat", .. }));
    }

    #[test]
    fn test_transpose_2x3() {
        let out = transpose(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_matmul_identity() {
        let a = m(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let id = m(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let out = matmul("MatMul", &a, &id).unwrap();
        assert_eq!(out.data, a.data());
    }

    #[test]
    fn test_matmul_rectangular() {
        // (1x3) @ (3x2)
        let a = m(1, 3, &[1.0, 2.0, 3.0]);
        let b = m(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let out = matmul("MatMul", &a, &b).unwrap();
        assert_eq!((out.rows, out.cols), (1, 2));
        assert_eq!(out.data, vec![4.0, 5.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let err = matmul("MatMul", &m(2, 3, &[0.0; 6]), &m(2, 3, &[0.0; 6])).unwrap_err();
        assert_eq!(
            err,
            SimError::ShapeMismatch {
                op: "MatMul",
                left: (2, 3),
                right: (2, 3)
            }
        );
    }

    #[test]
    fn test_div_broadcast_scalar() {
        let out = zip_broadcast("MatDiv", &m(1, 2, &[2.0, 6.0]), &m(1, 1, &[2.0]), |x, y| x / y).unwrap();
        assert_eq!(out.data, vec![1.0, 3.0]);
    }

    #[test]
    fn test_zip_shape_mismatch() {
        let err = zip_broadcast("MatAdd", &m(1, 2, &[0.0; 2]), &m(2, 1, &[0.0; 2]), |x, y| x + y)
            .unwrap_err();
        assert!(matches!(err, SimError::ShapeMismatch { op: "MatAdd", .. }));
    }

    #[test]
    fn test_reductions() {
        let a = m(2, 2, &[1.0, -2.0, 3.0, 0.5]);
        assert_eq!(sum(&a).data, vec![2.5]);
        assert_eq!(max(&a).data, vec![3.0]);
        assert_eq!((sum(&a).rows, sum(&a).cols), (1, 1));
    }

    #[test]
    fn test_get_row_and_column() {
        let a = m(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(get_row("GetRow", &a, 1).unwrap().data, vec![4.0, 5.0, 6.0]);
        assert_eq!(get_column("GetColumn", &a, 2).unwrap().data, vec![3.0, 6.0]);
        assert!(matches!(
            get_row("GetRow", &a, 2).unwrap_err(),
            SimError::IndexOutOfRange { index: 2, bound: 2, .. }
        ));
        assert!(matches!(
            get_column("GetColumn", &a, 3).unwrap_err(),
            SimError::IndexOutOfRange { index: 3, bound: 3, .. }
        ));
    }
}
