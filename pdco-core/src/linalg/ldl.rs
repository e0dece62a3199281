//! Sparse LDL^T factorization wrapper.
//!
//! Thin layer over `sprs_ldl` that keeps the symbolic analysis (the
//! reverse Cuthill-McKee bandwidth-reducing permutation and elimination
//! tree) alive across numeric refactorizations. Newton systems keep the
//! same sparsity pattern for the whole solve, so the symbolic work is done
//! once and every later call only updates values.
//!
//! `sprs_ldl` needs at least two rows; 0x0 and 1x1 matrices are factored
//! here as a single scalar pivot.
//!
//! Two pivot policies are supported:
//! - `PivotPolicy::PositiveDefinite`: every pivot must be strictly positive
//!   (Cholesky use); anything else is reported as `NotPositiveDefinite`.
//! - `PivotPolicy::QuasiDefinite`: pivots may have either sign, but must be
//!   bounded away from zero.

use sprs::errors::LinalgError;
use sprs::{FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};
use thiserror::Error;

use super::sparse::SparseCsc;

/// LDL solver errors
#[derive(Error, Debug, Clone)]
pub enum LdlError {
    /// A pivot was not strictly positive under the positive-definite policy
    #[error("Matrix not positive definite: pivot {index} = {pivot:.3e}")]
    NotPositiveDefinite {
        /// Pivot position (in the permuted ordering)
        index: usize,
        /// Pivot value
        pivot: f64,
    },

    /// A pivot vanished
    #[error("Zero pivot at position {index}")]
    ZeroPivot {
        /// Pivot position (in the permuted ordering)
        index: usize,
    },

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },

    /// Solve called before a successful factorization
    #[error("No factorization available")]
    NotFactored,

    /// Any other backend failure
    #[error("LDL backend failure: {0}")]
    Backend(String),
}

/// How pivots are validated after numeric factorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotPolicy {
    /// All pivots must be > 0 (matrix assumed SPD)
    PositiveDefinite,
    /// Pivots of either sign, magnitude above the zero-pivot threshold
    QuasiDefinite,
}

/// Minimum pivot magnitude accepted under `PivotPolicy::QuasiDefinite`.
const ZERO_PIVOT_TOL: f64 = 1e-300;

/// Numeric factor of the last successful `factor` call.
enum Factor {
    /// `sprs_ldl` factor; its symbolic part is reused by `update`
    Sparse(LdlNumeric<f64, usize>),
    /// Pivots of a matrix with at most one row
    Scalar(Vec<f64>),
}

impl Factor {
    fn d(&self) -> &[f64] {
        match self {
            Factor::Sparse(numeric) => numeric.d(),
            Factor::Scalar(d) => d,
        }
    }
}

/// Sparse LDL^T solver with cached symbolic factorization.
pub struct LdlSolver {
    /// Matrix dimension
    n: usize,

    /// Pivot validation policy
    policy: PivotPolicy,

    /// Current factorization
    factor: Option<Factor>,

    /// Column pointers and row indices the symbolic analysis was done for
    pattern: Option<(Vec<usize>, Vec<usize>)>,

    /// Number of numeric factorizations performed
    factorizations: u64,
}

impl std::fmt::Debug for LdlSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdlSolver")
            .field("n", &self.n)
            .field("policy", &self.policy)
            .field("factored", &self.factor.is_some())
            .field("factorizations", &self.factorizations)
            .finish()
    }
}

impl LdlSolver {
    /// Create a new LDL solver for an `n x n` symmetric matrix.
    pub fn new(n: usize, policy: PivotPolicy) -> Self {
        Self {
            n,
            policy,
            factor: None,
            pattern: None,
            factorizations: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn factorizations(&self) -> u64 {
        self.factorizations
    }

    /// Numeric factorization of `mat` (full symmetric storage, CSC).
    ///
    /// The first call performs the symbolic analysis; later calls with the
    /// same sparsity pattern only refactor numerically. A changed pattern
    /// triggers a fresh analysis.
    pub fn factor(&mut self, mat: &SparseCsc) -> Result<(), LdlError> {
        if mat.rows() != self.n || mat.cols() != self.n {
            return Err(LdlError::DimensionMismatch {
                expected: self.n,
                actual: mat.rows(),
            });
        }

        if self.n <= 1 {
            let d = (0..self.n)
                .map(|_| mat.iter().map(|(&v, _)| v).sum::<f64>())
                .collect();
            self.factor = Some(Factor::Scalar(d));
            self.pattern = None;
            self.factorizations += 1;
            return self.check_pivots();
        }

        let indptr = mat.indptr().raw_storage().to_vec();
        let same_pattern = self
            .pattern
            .as_ref()
            .is_some_and(|(p, i)| *p == indptr && i.as_slice() == mat.indices());
        if !same_pattern {
            self.factor = None;
            self.pattern = Some((indptr, mat.indices().to_vec()));
        }

        let result = match self.factor.as_mut() {
            Some(Factor::Sparse(numeric)) => numeric.update(mat.view()),
            _ => Ldl::new()
                .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
                .check_symmetry(SymmetryCheck::DontCheckSymmetry)
                .numeric(mat.view())
                .map(|numeric| {
                    self.factor = Some(Factor::Sparse(numeric));
                }),
        };

        if let Err(e) = result {
            // A failed update leaves the factor in an undefined state.
            self.factor = None;
            return Err(match e {
                LinalgError::SingularMatrix(info) => match self.policy {
                    PivotPolicy::PositiveDefinite => LdlError::NotPositiveDefinite {
                        index: info.index,
                        pivot: 0.0,
                    },
                    PivotPolicy::QuasiDefinite => LdlError::ZeroPivot { index: info.index },
                },
                other => LdlError::Backend(other.to_string()),
            });
        }
        self.factorizations += 1;

        self.check_pivots()
    }

    fn check_pivots(&mut self) -> Result<(), LdlError> {
        let Some(factor) = self.factor.as_ref() else {
            return Err(LdlError::NotFactored);
        };
        let mut failure = None;
        for (index, &pivot) in factor.d().iter().enumerate() {
            let bad = match self.policy {
                PivotPolicy::PositiveDefinite => !(pivot > 0.0) || !pivot.is_finite(),
                PivotPolicy::QuasiDefinite => !(pivot.abs() > ZERO_PIVOT_TOL) || !pivot.is_finite(),
            };
            if bad {
                failure = Some(match self.policy {
                    PivotPolicy::PositiveDefinite => LdlError::NotPositiveDefinite { index, pivot },
                    PivotPolicy::QuasiDefinite => LdlError::ZeroPivot { index },
                });
                break;
            }
        }
        match failure {
            Some(err) => {
                self.factor = None;
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Solve `K x = b` with the current factorization.
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, LdlError> {
        if b.len() != self.n {
            return Err(LdlError::DimensionMismatch {
                expected: self.n,
                actual: b.len(),
            });
        }
        match self.factor.as_ref().ok_or(LdlError::NotFactored)? {
            Factor::Sparse(numeric) => Ok(numeric.solve(b)),
            Factor::Scalar(d) => Ok(b.iter().zip(d).map(|(bi, di)| bi / di).collect()),
        }
    }

    /// Pivots D of the most recent factorization.
    pub fn d_values(&self) -> Option<&[f64]> {
        self.factor.as_ref().map(Factor::d)
    }

    /// Inertia (positive, negative) of the most recent factorization.
    pub fn inertia(&self) -> Option<(usize, usize)> {
        self.d_values().map(|d| {
            let pos = d.iter().filter(|&&v| v > 0.0).count();
            (pos, d.len() - pos)
        })
    }
}
