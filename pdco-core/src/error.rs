//! Error types for the barrier solver.

use thiserror::Error;

use crate::linalg::ldl::LdlError;

/// Errors that can occur while setting up or running a solve.
///
/// `InvalidProblem` and `Configuration` are raised before the first
/// iteration and returned as `Err` from [`crate::solve`]. The numeric
/// variants stop the outer loop and are reported through
/// [`crate::SolveResult::failure`] together with the iterate reached.
#[derive(Error, Debug, Clone)]
pub enum SolverError {
    /// Problem data failed validation
    #[error("Invalid problem: {0}")]
    InvalidProblem(String),

    /// Unsupported selector or incompatible settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A factorization that assumed positive definiteness failed
    #[error("Indefinite system at iteration {iter}: {detail}")]
    IndefiniteSystem {
        /// Outer iteration index
        iter: usize,
        /// What failed
        detail: String,
    },

    /// A linear solve produced NaN or Inf
    #[error("Non-finite search direction at iteration {iter} (Pinf={pinf:.2e}, Dinf={dinf:.2e})")]
    NonFiniteSolution {
        /// Outer iteration index
        iter: usize,
        /// Primal infeasibility before the solve
        pinf: f64,
        /// Dual infeasibility before the solve
        dinf: f64,
    },

    /// Backtracking reached its attempt cap too many times in a row
    #[error("Linesearch failed at iteration {iter} after {backtracks} backtracks")]
    LinesearchExhausted {
        /// Outer iteration index
        iter: usize,
        /// Trial points evaluated in the last attempt
        backtracks: usize,
    },

    /// Every entry of a preconditioner fallback chain failed to build
    #[error("Preconditioner {kind} could not be built: {detail}")]
    PreconditionerBuild {
        /// Preconditioner name
        kind: &'static str,
        /// Failure reason
        detail: String,
    },

    /// Sparse LDL failure that is not an indefiniteness report
    #[error(transparent)]
    Factorization(#[from] LdlError),
}

impl SolverError {
    /// Attach the outer iteration index to an error raised below the controller.
    pub fn at_iter(self, iter: usize) -> Self {
        match self {
            SolverError::IndefiniteSystem { detail, .. } => SolverError::IndefiniteSystem { iter, detail },
            SolverError::NonFiniteSolution { pinf, dinf, .. } => SolverError::NonFiniteSolution { iter, pinf, dinf },
            SolverError::LinesearchExhausted { backtracks, .. } => {
                SolverError::LinesearchExhausted { iter, backtracks }
            }
            other => other,
        }
    }

    /// True for errors detected before the first iteration.
    pub fn is_setup_error(&self) -> bool {
        matches!(self, SolverError::InvalidProblem(_) | SolverError::Configuration(_))
    }
}

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;
