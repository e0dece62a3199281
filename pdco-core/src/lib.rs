//! PDCO: a primal-dual barrier method for convex, linearly constrained problems
//!
//! ```text
//! minimize    φ(x) + ½‖D1 x‖² + ½‖r‖²
//! subject to  A x + D2 r = b
//!             bl ≤ x ≤ bu
//! ```
//!
//! φ is any smooth convex function that can report its value, gradient and
//! Hessian (diagonal or sparse). A may be an explicit sparse matrix or a
//! matrix-free callback. The regularization D1, D2 keeps the Newton systems
//! quasi-definite.
//!
//! # Algorithm
//!
//! Each outer iteration solves one Newton system for (Δx, Δy) and recovers the
//! bound multipliers from it. The Newton system can be solved by
//!
//! - **Reduced forms**: sparse Cholesky or QR on the normal equations, LSMR on
//!   the least-squares form, or a Krylov method on the normal operator
//! - **Full augmented forms**: sparse LU, dense backslash, sparse LDLᵀ on the
//!   symmetric quasi-definite (SQD) matrix, or a preconditioned Krylov method
//!   (MINRES, SYMMLQ, GMRES, CG, PCG on the dual Schur complement, projected
//!   CG, BiCGSTAB, TFQMR)
//!
//! Steps are damped by a fraction-to-boundary ratio test and accepted by
//! backtracking on the norm of all residuals.
//!
//! # Example
//!
//! ```ignore
//! use pdco_core::{solve, ConstraintOperator, LinearObjective, ProblemData, SolverSettings};
//! use pdco_core::linalg::sparse;
//!
//! // min x0 + 2 x1 s.t. x0 + x1 = 1, 0 ≤ x ≤ 10
//! let prob = ProblemData::new(
//!     LinearObjective::new(vec![1.0, 2.0]),
//!     ConstraintOperator::Explicit(sparse::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)])),
//!     vec![1.0],
//!     vec![0.0, 0.0],
//!     vec![10.0, 10.0],
//! );
//!
//! let result = solve(&prob, &SolverSettings::default())?;
//! println!("{} obj={} x={:?}", result.status, result.obj_val, result.x);
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod bounds;
pub mod error;
pub mod ipm;
pub mod krylov;
pub mod linalg;
pub mod newton;
pub mod objective;
pub mod precond;
pub mod problem;
pub mod scaling;

pub use bounds::BoundPartition;
pub use error::{SolverError, SolverResult};
pub use ipm::diagnostics::{DiagnosticEvent, DiagnosticsLog, IterationRecord};
pub use ipm::perf::PerfTimers;
pub use krylov::{KrylovMethod, KrylovStatus};
pub use newton::SolveFamily;
pub use objective::{Curvature, Evaluation, LinearObjective, Objective, QuadraticObjective};
pub use precond::PreconditionerKind;
pub use problem::{
    ApplyMode, ConstraintOperator, ProblemData, Regularization, SolveInfo, SolveResult, SolveStatus,
    SolverSettings,
};

/// Main solve entry point.
///
/// Returns `Err` for invalid problem data or settings. Numeric trouble during
/// the iteration is reported through [`SolveResult::status`] and
/// [`SolveResult::failure`] together with the last accepted iterate.
pub fn solve(problem: &ProblemData, settings: &SolverSettings) -> SolverResult<SolveResult> {
    ipm::solve_pdco(problem, settings)
}
