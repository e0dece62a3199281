//! Linear operators.
//!
//! The Krylov engine only ever sees a `LinearOperator`: something that can
//! compute `y = K x` (and, for rectangular least-squares use, `x = K^T y`).
//! The structured Newton systems are exposed through `SqdBlocks`, which
//! keeps the (1,1), (2,1) and (2,2) blocks separate so the Schur-complement
//! reductions can reach into them.

use super::sparse::{self, SparseCsc, SparseTriMat};

/// Matrix-free linear map.
pub trait LinearOperator {
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;

    /// y = K x (y is overwritten)
    fn apply(&self, x: &[f64], y: &mut [f64]);

    /// x = K^T y (x is overwritten). Symmetric operators keep the default.
    fn apply_transpose(&self, y: &[f64], x: &mut [f64]) {
        self.apply(y, x);
    }
}

impl LinearOperator for SparseCsc {
    fn nrows(&self) -> usize {
        self.rows()
    }

    fn ncols(&self) -> usize {
        self.cols()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        sparse::spmv(self, x, y, 1.0, 0.0);
    }

    fn apply_transpose(&self, y: &[f64], x: &mut [f64]) {
        sparse::spmv_transpose(self, y, x, 1.0, 0.0);
    }
}

/// Blocks of a symmetric quasi-definite Newton matrix
///
/// ```text
///     K = [ -H   A^T  ]
///         [  A   D2^2 ]
/// ```
///
/// `h` is n x n with both triangles stored, `a` is m x n. Rows and columns
/// of fixed variables are expected to be already decoupled: identity in `h`,
/// zero columns in `a`.
#[derive(Debug, Clone)]
pub struct SqdBlocks {
    pub h: SparseCsc,
    pub a: SparseCsc,
    pub d2sq: Vec<f64>,
}

impl SqdBlocks {
    pub fn new(h: SparseCsc, a: SparseCsc, d2sq: Vec<f64>) -> Self {
        debug_assert_eq!(h.rows(), h.cols());
        debug_assert_eq!(a.cols(), h.rows());
        debug_assert_eq!(a.rows(), d2sq.len());
        Self { h, a, d2sq }
    }

    pub fn n(&self) -> usize {
        self.h.rows()
    }

    pub fn m(&self) -> usize {
        self.a.rows()
    }

    pub fn dim(&self) -> usize {
        self.n() + self.m()
    }

    pub fn h_diag(&self) -> Vec<f64> {
        sparse::diag_of(&self.h)
    }

    /// Assemble the full (n+m) x (n+m) matrix in CSC form.
    ///
    /// With `negated` the result is `-K = [H, -A^T; -A, -D2^2]`.
    pub fn assemble(&self, negated: bool) -> SparseCsc {
        let n = self.n();
        let m = self.m();
        let s = if negated { -1.0 } else { 1.0 };
        let mut tri = SparseTriMat::new((n + m, n + m));
        for (&v, (i, j)) in self.h.iter() {
            tri.add_triplet(i, j, -s * v);
        }
        for (&v, (i, j)) in self.a.iter() {
            if v != 0.0 {
                tri.add_triplet(n + i, j, s * v);
                tri.add_triplet(j, n + i, s * v);
            }
        }
        for (i, &d) in self.d2sq.iter().enumerate() {
            tri.add_triplet(n + i, n + i, s * d);
        }
        tri.to_csc()
    }

    /// Assemble with `diag(h)` in place of the (1,1) block.
    pub fn assemble_diagonal_h(&self, negated: bool) -> SparseCsc {
        let diag_only = SqdBlocks {
            h: sparse::diagonal(&self.h_diag()),
            a: self.a.clone(),
            d2sq: self.d2sq.clone(),
        };
        diag_only.assemble(negated)
    }

    /// y = K x, or y = -K x when `negated`.
    pub fn apply_signed(&self, x: &[f64], y: &mut [f64], negated: bool) {
        let n = self.n();
        let s = if negated { -1.0 } else { 1.0 };
        let (xx, xy) = x.split_at(n);
        let (yx, yy) = y.split_at_mut(n);

        // top: -H x_x + A^T x_y
        sparse::spmv(&self.h, xx, yx, -s, 0.0);
        sparse::spmv_transpose(&self.a, xy, yx, s, 1.0);

        // bottom: A x_x + D2^2 x_y
        sparse::spmv(&self.a, xx, yy, s, 0.0);
        for ((yi, xi), d) in yy.iter_mut().zip(xy).zip(&self.d2sq) {
            *yi += s * d * xi;
        }
    }

    /// Sparse `D2^2 + A diag(hinv) A^T`.
    pub fn schur_with_diagonal(&self, hinv: &[f64]) -> SparseCsc {
        let m = self.m();
        let mut tri = SparseTriMat::new((m, m));
        for (i, &d) in self.d2sq.iter().enumerate() {
            tri.add_triplet(i, i, d);
        }
        // Column j of A contributes hinv_j a_j a_j^T.
        for (j, col) in self.a.outer_iterator().enumerate() {
            let hj = hinv[j];
            if hj == 0.0 {
                continue;
            }
            for (i1, &v1) in col.iter() {
                for (i2, &v2) in col.iter() {
                    tri.add_triplet(i1, i2, hj * v1 * v2);
                }
            }
        }
        tri.to_csc()
    }
}

/// The SQD matrix as a matrix-free operator (optionally negated).
pub struct SqdOperator<'a> {
    pub blocks: &'a SqdBlocks,
    pub negated: bool,
}

impl LinearOperator for SqdOperator<'_> {
    fn nrows(&self) -> usize {
        self.blocks.dim()
    }

    fn ncols(&self) -> usize {
        self.blocks.dim()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        self.blocks.apply_signed(x, y, self.negated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_blocks() -> SqdBlocks {
        let h = sparse::from_triplets(2, 2, vec![(0, 0, 2.0), (0, 1, 0.5), (1, 0, 0.5), (1, 1, 3.0)]);
        let a = sparse::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, -1.0)]);
        SqdBlocks::new(h, a, vec![0.25])
    }

    #[test]
    fn test_operator_matches_assembled_matrix() {
        let blocks = small_blocks();
        let x = vec![1.0, -2.0, 0.5];
        for &negated in &[false, true] {
            let k = blocks.assemble(negated);
            let mut y_mat = vec![0.0; 3];
            k.apply(&x, &mut y_mat);

            let op = SqdOperator { blocks: &blocks, negated };
            let mut y_op = vec![0.0; 3];
            op.apply(&x, &mut y_op);
            for i in 0..3 {
                assert!((y_mat[i] - y_op[i]).abs() < 1e-12);
            }
        }

        // -K top row: [2, 0.5, -1]
        let neg = sparse::to_dense(&blocks.assemble(true));
        assert_eq!(neg[(0, 0)], 2.0);
        assert_eq!(neg[(0, 2)], -1.0);
        assert_eq!(neg[(2, 2)], -0.25);
    }

    #[test]
    fn test_schur_with_diagonal() {
        let blocks = small_blocks();
        // 0.25 + 1*0.5 + 1*0.25
        let s = blocks.schur_with_diagonal(&[0.5, 0.25]);
        let d = sparse::to_dense(&s);
        assert!((d[(0, 0)] - 1.0).abs() < 1e-12);
    }
}
