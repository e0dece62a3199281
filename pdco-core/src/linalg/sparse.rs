//! Sparse matrix types and operations.
//!
//! Everything is stored in CSC (Compressed Sparse Column) format, which is
//! what the sparse LDL backend consumes. Symmetric matrices are stored with
//! both triangles present.

use nalgebra::DMatrix;
use sprs::{CsMat, TriMat};

/// Sparse matrix in CSC format (general, not necessarily symmetric).
pub type SparseCsc = CsMat<f64>;

/// Triplet format sparse matrix builder.
pub type SparseTriMat = TriMat<f64>;

/// Build a sparse CSC matrix from triplets (row, col, value).
///
/// Duplicate entries are summed.
pub fn from_triplets<I>(nrows: usize, ncols: usize, triplets: I) -> SparseCsc
where
    I: IntoIterator<Item = (usize, usize, f64)>,
{
    let mut tri = TriMat::new((nrows, ncols));
    for (i, j, v) in triplets {
        tri.add_triplet(i, j, v);
    }
    tri.to_csc()
}

/// Create a diagonal matrix in CSC format.
pub fn diagonal(diag: &[f64]) -> SparseCsc {
    let n = diag.len();
    let triplets = diag.iter().enumerate().map(|(i, &v)| (i, i, v));
    from_triplets(n, n, triplets)
}

/// Create an identity matrix in CSC format.
pub fn identity(n: usize) -> SparseCsc {
    diagonal(&vec![1.0; n])
}

/// Sparse matrix-vector product: y = alpha * A * x + beta * y
pub fn spmv(a: &SparseCsc, x: &[f64], y: &mut [f64], alpha: f64, beta: f64) {
    assert_eq!(a.cols(), x.len());
    assert_eq!(a.rows(), y.len());

    if beta == 0.0 {
        y.fill(0.0);
    } else if beta != 1.0 {
        for yi in y.iter_mut() {
            *yi *= beta;
        }
    }

    if alpha != 0.0 {
        for (val, (row, col)) in a.iter() {
            y[row] += alpha * (*val) * x[col];
        }
    }
}

/// Transpose-vector product: y = alpha * A^T * x + beta * y
pub fn spmv_transpose(a: &SparseCsc, x: &[f64], y: &mut [f64], alpha: f64, beta: f64) {
    assert_eq!(a.rows(), x.len());
    assert_eq!(a.cols(), y.len());

    if beta == 0.0 {
        y.fill(0.0);
    } else if beta != 1.0 {
        for yi in y.iter_mut() {
            *yi *= beta;
        }
    }

    if alpha != 0.0 {
        for (val, (row, col)) in a.iter() {
            y[col] += alpha * (*val) * x[row];
        }
    }
}

/// Diagonal of a square sparse matrix (missing entries are zero).
pub fn diag_of(a: &SparseCsc) -> Vec<f64> {
    let n = a.rows().min(a.cols());
    let mut d = vec![0.0; n];
    for (val, (row, col)) in a.iter() {
        if row == col {
            d[row] += *val;
        }
    }
    d
}

/// True when every stored off-diagonal entry is exactly zero.
pub fn is_diagonal(a: &SparseCsc) -> bool {
    a.iter().all(|(val, (row, col))| row == col || *val == 0.0)
}

/// Frobenius norm of the stored entries.
pub fn frobenius_norm(a: &SparseCsc) -> f64 {
    a.data().iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Densify a sparse matrix.
pub fn to_dense(a: &SparseCsc) -> DMatrix<f64> {
    let mut d = DMatrix::zeros(a.rows(), a.cols());
    for (val, (row, col)) in a.iter() {
        d[(row, col)] += *val;
    }
    d
}

/// Transpose into a fresh CSC matrix.
pub fn transpose(a: &SparseCsc) -> SparseCsc {
    let mut tri = TriMat::new((a.cols(), a.rows()));
    for (val, (row, col)) in a.iter() {
        tri.add_triplet(col, row, *val);
    }
    tri.to_csc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_triplets() {
        let triplets = vec![(0, 0, 1.0), (1, 1, 2.0), (0, 1, 3.0)];
        let mat = from_triplets(2, 2, triplets);

        assert_eq!(mat.rows(), 2);
        assert_eq!(mat.cols(), 2);
        assert_eq!(mat.nnz(), 3);
    }

    #[test]
    fn test_spmv_and_transpose() {
        // [[1, 2], [3, 4], [0, 5]]
        let triplets = vec![(0, 0, 1.0), (0, 1, 2.0), (1, 0, 3.0), (1, 1, 4.0), (2, 1, 5.0)];
        let mat = from_triplets(3, 2, triplets);

        let x = vec![1.0, 2.0];
        let mut y = vec![0.0; 3];
        spmv(&mat, &x, &mut y, 1.0, 0.0);
        assert!((y[0] - 5.0).abs() < 1e-12);
        assert!((y[1] - 11.0).abs() < 1e-12);
        assert!((y[2] - 10.0).abs() < 1e-12);

        let u = vec![1.0, 1.0, 1.0];
        let mut v = vec![0.0; 2];
        spmv_transpose(&mat, &u, &mut v, 1.0, 0.0);
        assert!((v[0] - 4.0).abs() < 1e-12);
        assert!((v[1] - 11.0).abs() < 1e-12);

        let t = transpose(&mat);
        assert_eq!((t.rows(), t.cols()), (2, 3));
        assert_eq!(to_dense(&t), to_dense(&mat).transpose());
    }

    #[test]
    fn test_diag_helpers() {
        let d = diagonal(&[1.0, 2.0, 3.0]);
        assert!(is_diagonal(&d));
        assert_eq!(diag_of(&d), vec![1.0, 2.0, 3.0]);
        assert!((frobenius_norm(&d) - 14f64.sqrt()).abs() < 1e-12);

        let full = from_triplets(2, 2, vec![(0, 0, 1.0), (0, 1, 0.5), (1, 0, 0.5)]);
        assert!(!is_diagonal(&full));
        assert_eq!(identity(4).nnz(), 4);
    }
}
