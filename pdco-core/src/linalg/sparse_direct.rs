//! Sparse LU and QR backends on `faer`.
//!
//! Both keep the symbolic factorization (fill-reducing column ordering and
//! elimination structure) from the first call and reuse it while the
//! sparsity pattern stays the same, like [`super::ldl::LdlSolver`].

use faer::linalg::solvers::{SolveCore, SolveLstsqCore};
use faer::sparse::linalg::solvers::{Lu, Qr, SymbolicLu, SymbolicQr};
use faer::sparse::{SparseColMat, SymbolicSparseColMat};
use faer::{Conj, Mat};

use super::sparse::SparseCsc;

/// Copy a CSC matrix (sorted row indices) into faer storage.
fn to_faer(mat: &SparseCsc) -> SparseColMat<usize, f64> {
    let symbolic = SymbolicSparseColMat::new_checked(
        mat.rows(),
        mat.cols(),
        mat.indptr().raw_storage().to_vec(),
        None,
        mat.indices().to_vec(),
    );
    SparseColMat::new(symbolic, mat.data().to_vec())
}

fn column(b: &[f64]) -> Mat<f64> {
    Mat::from_fn(b.len(), 1, |i, _| b[i])
}

type Pattern = (usize, Vec<usize>, Vec<usize>);

fn pattern_of(mat: &SparseCsc) -> Pattern {
    (mat.rows(), mat.indptr().raw_storage().to_vec(), mat.indices().to_vec())
}

/// Sparse LU with partial pivoting for square unsymmetric matrices.
#[derive(Default)]
pub struct SparseLu {
    symbolic: Option<(Pattern, SymbolicLu<usize>)>,
    factorizations: u64,
}

impl std::fmt::Debug for SparseLu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseLu")
            .field("analysed", &self.symbolic.is_some())
            .field("factorizations", &self.factorizations)
            .finish()
    }
}

impl SparseLu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factorizations(&self) -> u64 {
        self.factorizations
    }

    /// Factor `k` and solve `k x = b`. A structurally singular matrix or a
    /// non-finite solution is an error.
    pub fn solve(&mut self, k: &SparseCsc, b: &[f64]) -> Result<Vec<f64>, String> {
        if k.rows() != k.cols() || k.rows() != b.len() {
            return Err(format!("dimension mismatch: {}x{} with rhs {}", k.rows(), k.cols(), b.len()));
        }
        let mat = to_faer(k);
        let pattern = pattern_of(k);
        if self.symbolic.as_ref().map_or(true, |(p, _)| *p != pattern) {
            let symbolic = SymbolicLu::try_new(mat.as_ref().symbolic()).map_err(|e| format!("{:?}", e))?;
            self.symbolic = Some((pattern, symbolic));
        }
        let Some((_, symbolic)) = self.symbolic.as_ref() else {
            return Err("no symbolic factorization".to_string());
        };
        let lu = Lu::try_new_with_symbolic(symbolic.clone(), mat.as_ref()).map_err(|e| format!("{:?}", e))?;
        self.factorizations += 1;

        let mut rhs = column(b);
        lu.solve_in_place_with_conj(Conj::No, rhs.as_mut());
        let x: Vec<f64> = (0..b.len()).map(|i| rhs[(i, 0)]).collect();
        if x.iter().all(|v| v.is_finite()) {
            Ok(x)
        } else {
            Err("matrix is numerically singular".to_string())
        }
    }
}

/// Sparse Householder QR for least-squares problems min ‖M u − t‖₂ with
/// M tall and of full column rank.
#[derive(Default)]
pub struct SparseQr {
    symbolic: Option<(Pattern, SymbolicQr<usize>)>,
    factorizations: u64,
}

impl std::fmt::Debug for SparseQr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseQr")
            .field("analysed", &self.symbolic.is_some())
            .field("factorizations", &self.factorizations)
            .finish()
    }
}

impl SparseQr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factorizations(&self) -> u64 {
        self.factorizations
    }

    pub fn solve_least_squares(&mut self, m: &SparseCsc, t: &[f64]) -> Result<Vec<f64>, String> {
        if m.rows() < m.cols() || m.rows() != t.len() {
            return Err(format!("least-squares shape {}x{} with rhs {}", m.rows(), m.cols(), t.len()));
        }
        let mat = to_faer(m);
        let pattern = pattern_of(m);
        if self.symbolic.as_ref().map_or(true, |(p, _)| *p != pattern) {
            let symbolic = SymbolicQr::try_new(mat.as_ref().symbolic()).map_err(|e| format!("{:?}", e))?;
            self.symbolic = Some((pattern, symbolic));
        }
        let Some((_, symbolic)) = self.symbolic.as_ref() else {
            return Err("no symbolic factorization".to_string());
        };
        let qr = Qr::try_new_with_symbolic(symbolic.clone(), mat.as_ref()).map_err(|e| format!("{:?}", e))?;
        self.factorizations += 1;

        // The solution overwrites the leading ncols rows.
        let mut rhs = column(t);
        qr.solve_lstsq_in_place_with_conj(Conj::No, rhs.as_mut());
        let u: Vec<f64> = (0..m.cols()).map(|i| rhs[(i, 0)]).collect();
        if u.iter().all(|v| v.is_finite()) {
            Ok(u)
        } else {
            Err("least-squares matrix is rank deficient".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse;

    #[test]
    fn test_lu_unsymmetric_and_refactor() {
        // [[0, 2, 0], [1, 0, 3], [0, 4, 5]]
        let trip = vec![(0, 1, 2.0), (1, 0, 1.0), (1, 2, 3.0), (2, 1, 4.0), (2, 2, 5.0)];
        let k = sparse::from_triplets(3, 3, trip.clone());
        let x_true = [1.0, -2.0, 0.5];
        let mut b = vec![0.0; 3];
        sparse::spmv(&k, &x_true, &mut b, 1.0, 0.0);

        let mut lu = SparseLu::new();
        let x = lu.solve(&k, &b).unwrap();
        for i in 0..3 {
            assert!((x[i] - x_true[i]).abs() < 1e-12);
        }

        let k2 = sparse::from_triplets(3, 3, trip.iter().map(|&(i, j, v)| (i, j, 3.0 * v)));
        let x2 = lu.solve(&k2, &b).unwrap();
        for i in 0..3 {
            assert!((x2[i] - x_true[i] / 3.0).abs() < 1e-12);
        }
        assert_eq!(lu.factorizations(), 2);
    }

    #[test]
    fn test_lu_one_by_one_and_singular() {
        let mut lu = SparseLu::new();
        assert_eq!(lu.solve(&sparse::from_triplets(1, 1, vec![(0, 0, 4.0)]), &[2.0]).unwrap(), vec![0.5]);

        let singular = sparse::from_triplets(2, 2, vec![(0, 0, 1.0), (1, 0, 1.0), (0, 1, 1.0), (1, 1, 1.0)]);
        assert!(SparseLu::new().solve(&singular, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_qr_least_squares() {
        // Fit u0 + u1 t to (0, 1), (1, 2), (2, 2)
        let m = sparse::from_triplets(
            3,
            2,
            vec![(0, 0, 1.0), (1, 0, 1.0), (2, 0, 1.0), (1, 1, 1.0), (2, 1, 2.0)],
        );
        let mut qr = SparseQr::new();
        let u = qr.solve_least_squares(&m, &[1.0, 2.0, 2.0]).unwrap();
        // normal equations [[3, 3], [3, 5]] u = [5, 6]
        assert!((u[0] - 7.0 / 6.0).abs() < 1e-12);
        assert!((u[1] - 0.5).abs() < 1e-12);
        assert!(qr.solve_least_squares(&m, &[1.0, 2.0]).is_err());
    }
}
