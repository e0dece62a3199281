//! Problem data structures, settings and results.
//!
//! The solver works with
//!
//! ```text
//! minimize    φ(x) + ½‖D1 x‖² + ½‖r‖²
//! subject to  A x + D2 r = b
//!             bl ≤ x ≤ bu
//! ```
//!
//! where φ is a smooth convex function supplied through [`Objective`], and A
//! is either an explicit sparse matrix or a matrix-free callback.

use std::fmt;
use std::time::Duration;

use crate::error::{SolverError, SolverResult};
use crate::ipm::diagnostics::DiagnosticsLog;
use crate::ipm::perf::PerfTimers;
use crate::krylov::KrylovMethod;
use crate::linalg::operator::LinearOperator;
use crate::linalg::sparse::{self, SparseCsc, SparseTriMat};
use crate::linalg::vector;
use crate::newton::SolveFamily;
use crate::objective::Objective;
use crate::precond::PreconditionerKind;

/// Which product a matrix-free constraint callback must compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// v has length n, return A v (length m)
    Forward,
    /// v has length m, return Aᵀ v (length n)
    Transpose,
}

/// Matrix-free constraint callback: (mode, m, n, v) → A v or Aᵀ v.
pub type ConstraintCallback = Box<dyn Fn(ApplyMode, usize, usize, &[f64]) -> Vec<f64>>;

/// The constraint matrix A (m x n).
pub enum ConstraintOperator {
    Explicit(SparseCsc),
    Implicit {
        m: usize,
        n: usize,
        apply: ConstraintCallback,
    },
}

impl fmt::Debug for ConstraintOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintOperator::Explicit(a) => f
                .debug_struct("Explicit")
                .field("shape", &(a.rows(), a.cols()))
                .field("nnz", &a.nnz())
                .finish(),
            ConstraintOperator::Implicit { m, n, .. } => {
                f.debug_struct("Implicit").field("shape", &(m, n)).finish()
            }
        }
    }
}

impl ConstraintOperator {
    pub fn rows(&self) -> usize {
        match self {
            ConstraintOperator::Explicit(a) => a.rows(),
            ConstraintOperator::Implicit { m, .. } => *m,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            ConstraintOperator::Explicit(a) => a.cols(),
            ConstraintOperator::Implicit { n, .. } => *n,
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, ConstraintOperator::Explicit(_))
    }

    /// Materialize A as a sparse matrix.
    ///
    /// An implicit operator is probed one column at a time (n forward
    /// products); exact zeros are dropped.
    pub fn to_explicit(&self) -> SparseCsc {
        match self {
            ConstraintOperator::Explicit(a) => a.clone(),
            ConstraintOperator::Implicit { m, n, apply } => {
                let (m, n) = (*m, *n);
                let mut tri = SparseTriMat::new((m, n));
                let mut e = vec![0.0; n];
                for j in 0..n {
                    e[j] = 1.0;
                    let col = apply(ApplyMode::Forward, m, n, &e);
                    for (i, &v) in col.iter().enumerate() {
                        if v != 0.0 {
                            tri.add_triplet(i, j, v);
                        }
                    }
                    e[j] = 0.0;
                }
                tri.to_csc()
            }
        }
    }

    /// Estimate ‖A‖₂ by power iteration on AᵀA.
    pub fn norm2_estimate(&self, iters: usize) -> f64 {
        let n = self.cols();
        if n == 0 || self.rows() == 0 {
            return 0.0;
        }
        let mut v = vec![1.0 / (n as f64).sqrt(); n];
        let mut av = vec![0.0; self.rows()];
        let mut atav = vec![0.0; n];
        let mut sigma_sq = 0.0;
        for _ in 0..iters.max(1) {
            self.apply(&v, &mut av);
            self.apply_transpose(&av, &mut atav);
            let nrm = vector::norm2(&atav);
            if nrm == 0.0 || !nrm.is_finite() {
                break;
            }
            sigma_sq = nrm;
            for (vi, wi) in v.iter_mut().zip(&atav) {
                *vi = wi / nrm;
            }
        }
        sigma_sq.sqrt()
    }
}

impl LinearOperator for ConstraintOperator {
    fn nrows(&self) -> usize {
        self.rows()
    }

    fn ncols(&self) -> usize {
        self.cols()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        match self {
            ConstraintOperator::Explicit(a) => sparse::spmv(a, x, y, 1.0, 0.0),
            ConstraintOperator::Implicit { m, n, apply } => {
                y.copy_from_slice(&apply(ApplyMode::Forward, *m, *n, x));
            }
        }
    }

    fn apply_transpose(&self, y: &[f64], x: &mut [f64]) {
        match self {
            ConstraintOperator::Explicit(a) => sparse::spmv_transpose(a, y, x, 1.0, 0.0),
            ConstraintOperator::Implicit { m, n, apply } => {
                x.copy_from_slice(&apply(ApplyMode::Transpose, *m, *n, y));
            }
        }
    }
}

/// Regularization weights D1 or D2.
#[derive(Debug, Clone, PartialEq)]
pub enum Regularization {
    /// Same weight on every component
    Scalar(f64),
    /// One weight per component
    Vector(Vec<f64>),
}

impl Regularization {
    /// Broadcast to a vector of length `len`.
    pub fn expand(&self, len: usize) -> Vec<f64> {
        match self {
            Regularization::Scalar(v) => vec![*v; len],
            Regularization::Vector(v) => v.clone(),
        }
    }

    fn check(&self, name: &str, len: usize) -> Result<(), String> {
        match self {
            Regularization::Scalar(v) => {
                if !(*v > 0.0 && v.is_finite()) {
                    return Err(format!("{} must be positive and finite, got {}", name, v));
                }
            }
            Regularization::Vector(v) => {
                if v.len() != len {
                    return Err(format!("{} has length {}, expected {}", name, v.len(), len));
                }
                if let Some((i, bad)) = v.iter().enumerate().find(|(_, x)| !(**x > 0.0 && x.is_finite())) {
                    return Err(format!("{}[{}] = {} must be positive and finite", name, i, bad));
                }
            }
        }
        Ok(())
    }
}

/// Optimization problem.
///
/// # Dimensions
///
/// - `n`: number of primal variables (columns of A, length of bl/bu)
/// - `m`: number of constraints (rows of A, length of b)
pub struct ProblemData {
    /// Smooth convex objective φ
    pub objective: Box<dyn Objective>,

    /// Constraint operator A (m × n)
    pub a: ConstraintOperator,

    /// Constraint right-hand side b (length m)
    pub b: Vec<f64>,

    /// Lower bounds (length n, -inf allowed)
    pub bl: Vec<f64>,

    /// Upper bounds (length n, +inf allowed)
    pub bu: Vec<f64>,

    /// Primal regularization D1 (length n or scalar)
    pub d1: Regularization,

    /// Dual regularization D2 (length m or scalar)
    pub d2: Regularization,

    /// Initial primal point (zeros if absent)
    pub x0: Option<Vec<f64>>,

    /// Initial dual point (zeros if absent)
    pub y0: Option<Vec<f64>>,

    /// Initial reduced costs, z = z1 - z2 (ones if absent)
    pub z0: Option<Vec<f64>>,

    /// Typical magnitude of x
    pub x_size: f64,

    /// Typical magnitude of y and z
    pub z_size: f64,
}

impl fmt::Debug for ProblemData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProblemData")
            .field("a", &self.a)
            .field("b", &self.b)
            .field("bl", &self.bl)
            .field("bu", &self.bu)
            .field("d1", &self.d1)
            .field("d2", &self.d2)
            .field("x_size", &self.x_size)
            .field("z_size", &self.z_size)
            .finish_non_exhaustive()
    }
}

impl ProblemData {
    /// Problem with default regularization (1e-4), no starting point and
    /// unit size estimates.
    pub fn new(
        objective: impl Objective + 'static,
        a: ConstraintOperator,
        b: Vec<f64>,
        bl: Vec<f64>,
        bu: Vec<f64>,
    ) -> Self {
        Self {
            objective: Box::new(objective),
            a,
            b,
            bl,
            bu,
            d1: Regularization::Scalar(1e-4),
            d2: Regularization::Scalar(1e-4),
            x0: None,
            y0: None,
            z0: None,
            x_size: 1.0,
            z_size: 1.0,
        }
    }

    pub fn with_regularization(mut self, d1: Regularization, d2: Regularization) -> Self {
        self.d1 = d1;
        self.d2 = d2;
        self
    }

    pub fn with_start(mut self, x0: Vec<f64>, y0: Vec<f64>, z0: Vec<f64>) -> Self {
        self.x0 = Some(x0);
        self.y0 = Some(y0);
        self.z0 = Some(z0);
        self
    }

    pub fn with_sizes(mut self, x_size: f64, z_size: f64) -> Self {
        self.x_size = x_size;
        self.z_size = z_size;
        self
    }

    /// Get the number of primal variables (n)
    pub fn num_vars(&self) -> usize {
        self.bl.len()
    }

    /// Get the number of constraints (m)
    pub fn num_constraints(&self) -> usize {
        self.b.len()
    }

    /// Validate dimensions, bounds and regularization.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.num_vars();
        let m = self.num_constraints();

        if self.bu.len() != n {
            return Err(format!("bu has length {}, expected {}", self.bu.len(), n));
        }
        if self.a.rows() != m {
            return Err(format!("A has {} rows, expected {}", self.a.rows(), m));
        }
        if self.a.cols() != n {
            return Err(format!("A has {} cols, expected {}", self.a.cols(), n));
        }

        for j in 0..n {
            let (l, u) = (self.bl[j], self.bu[j]);
            if l.is_nan() || u.is_nan() {
                return Err(format!("Variable {} has a NaN bound", j));
            }
            if l > u {
                return Err(format!(
                    "Variable {} has lower bound {} > upper bound {}",
                    j, l, u
                ));
            }
        }
        if let Some(i) = self.b.iter().position(|v| !v.is_finite()) {
            return Err(format!("b[{}] is not finite", i));
        }

        self.d1.check("d1", n)?;
        self.d2.check("d2", m)?;

        for (name, v, len) in [("x0", &self.x0, n), ("y0", &self.y0, m), ("z0", &self.z0, n)] {
            if let Some(v) = v {
                if v.len() != len {
                    return Err(format!("{} has length {}, expected {}", name, v.len(), len));
                }
                if !vector::all_finite(v) {
                    return Err(format!("{} has non-finite entries", name));
                }
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

/// Solver settings and parameters.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Maximum number of outer iterations
    pub max_iter: usize,

    /// Primal and dual infeasibility tolerance
    pub feas_tol: f64,

    /// Complementarity tolerance (on max x·z)
    pub opt_tol: f64,

    /// Fraction of the distance to the boundary taken by a step
    pub step_tol: f64,

    /// Use the same step length for primal and dual variables
    pub step_same: bool,

    /// Minimum initial slack
    pub x0_min: f64,

    /// Minimum initial multiplier
    pub z0_min: f64,

    /// Initial barrier parameter (0 = average complementarity)
    pub mu0: f64,

    /// Enable merit-function backtracking
    pub backtrack: bool,

    /// Maximum trial points per linesearch
    pub max_backtracks: usize,

    /// Consecutive linesearch failures tolerated before abort
    pub max_linesearch_failures: usize,

    /// Newton system family
    pub family: SolveFamily,

    /// Inner iteration cap multiplier (cap = mult × system size)
    pub inner_itn_mult: usize,

    /// Largest inner solve tolerance
    pub inner_tol_ceiling: f64,

    /// Smallest inner solve tolerance
    pub inner_tol_floor: f64,

    /// Krylov method used by `SolveFamily::SqdKrylov`
    pub krylov_method: KrylovMethod,

    /// Preconditioner used by `SolveFamily::SqdKrylov`
    pub preconditioner: PreconditionerKind,

    /// GMRES restart length
    pub gmres_restart: usize,

    /// Diagonal preconditioning for the iterative diagonal-family solvers
    pub diag_precond: bool,

    /// Tie the inner tolerance to μ and the size of (x, y)
    pub inexact_auto_scale: bool,

    /// Compare each inexact direction with a direct solve
    pub exact_error_check: bool,

    /// Bound magnitude treated as infinite
    pub bound_inf: f64,

    /// Centrality ratio above which μ is not reduced
    pub big_center: f64,

    /// Step length below which the solve stops
    pub min_step: f64,

    /// Minimum iterations before convergence may be declared
    pub min_iter: usize,

    /// Time limit in milliseconds (None = no limit)
    pub time_limit_ms: Option<u64>,

    /// Enable verbose logging
    pub verbose: bool,

    /// Seed for the perturbed direct solve
    pub seed: u64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        // Environment overrides, PDCO_MAX_ITER=200 etc.
        let max_iter = env_parse::<usize>("PDCO_MAX_ITER").unwrap_or(50);
        let inner_itn_mult = env_parse::<usize>("PDCO_INNER_ITN_MULT").unwrap_or(10);
        let step_tol = env_parse::<f64>("PDCO_STEP_TOL").unwrap_or(0.99);

        Self {
            max_iter,
            feas_tol: 1e-6,
            opt_tol: 1e-6,
            step_tol,
            step_same: false,
            x0_min: 1.0,
            z0_min: 1.0,
            mu0: 0.0,
            backtrack: true,
            max_backtracks: 10,
            max_linesearch_failures: 1,
            family: SolveFamily::Cholesky,
            inner_itn_mult,
            inner_tol_ceiling: 1e-8,
            inner_tol_floor: 1e-15,
            krylov_method: KrylovMethod::Minres,
            preconditioner: PreconditionerKind::DiagonalJacobiSchur,
            gmres_restart: 20,
            diag_precond: true,
            inexact_auto_scale: false,
            exact_error_check: false,
            bound_inf: 9.9e19,
            big_center: 1e3,
            min_step: 1e-10,
            min_iter: 1,
            time_limit_ms: None,
            verbose: false,
            seed: 42,
        }
    }
}

impl SolverSettings {
    /// Reject settings the iteration cannot run with.
    pub fn validate(&self) -> SolverResult<()> {
        let bad = |msg: String| Err(SolverError::Configuration(msg));
        if !(self.step_tol > 0.0 && self.step_tol < 1.0) {
            return bad(format!("step_tol must lie in (0, 1), got {}", self.step_tol));
        }
        if !(self.feas_tol > 0.0) || !(self.opt_tol > 0.0) {
            return bad("feas_tol and opt_tol must be positive".to_string());
        }
        if !(self.x0_min > 0.0) || !(self.z0_min > 0.0) {
            return bad("x0_min and z0_min must be positive".to_string());
        }
        if self.mu0 < 0.0 || !self.mu0.is_finite() {
            return bad(format!("mu0 must be finite and non-negative, got {}", self.mu0));
        }
        if !(self.inner_tol_floor > 0.0 && self.inner_tol_floor <= self.inner_tol_ceiling) {
            return bad(format!(
                "inner tolerance range [{:e}, {:e}] is empty",
                self.inner_tol_floor, self.inner_tol_ceiling
            ));
        }
        if self.inner_itn_mult == 0 {
            return bad("inner_itn_mult must be at least 1".to_string());
        }
        if self.gmres_restart == 0 {
            return bad("gmres_restart must be at least 1".to_string());
        }
        if self.max_backtracks == 0 {
            return bad("max_backtracks must be at least 1".to_string());
        }
        if !(self.bound_inf > 0.0) {
            return bad("bound_inf must be positive".to_string());
        }
        Ok(())
    }
}

/// Solution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Feasibility and complementarity tolerances met
    Solved,

    /// Maximum iterations reached
    IterationLimit,

    /// Too many consecutive linesearch failures
    LinesearchFailed,

    /// Step length fell below `min_step`
    StepTooSmall,

    /// A factorization assuming positive definiteness failed
    IndefiniteSystem,

    /// Non-finite direction or iterate
    NumericalError,

    /// Time limit reached
    TimeLimit,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Solved => write!(f, "Solved"),
            SolveStatus::IterationLimit => write!(f, "Iteration Limit"),
            SolveStatus::LinesearchFailed => write!(f, "Linesearch Failed"),
            SolveStatus::StepTooSmall => write!(f, "Step Too Small"),
            SolveStatus::IndefiniteSystem => write!(f, "Indefinite System"),
            SolveStatus::NumericalError => write!(f, "Numerical Error"),
            SolveStatus::TimeLimit => write!(f, "Time Limit"),
        }
    }
}

/// Solve result with solution and diagnostics (unscaled).
#[derive(Debug, Clone)]
pub struct SolveResult {
    /// Solution status
    pub status: SolveStatus,

    /// Fatal error that ended the solve, if any
    pub failure: Option<SolverError>,

    /// Primal solution x (length n)
    pub x: Vec<f64>,

    /// Dual solution y (length m)
    pub y: Vec<f64>,

    /// Reduced costs z = z1 - z2 (length n)
    pub z: Vec<f64>,

    /// Lower-bound multipliers (length n, zero off `low`)
    pub z1: Vec<f64>,

    /// Upper-bound multipliers (length n, zero off `upp`)
    pub z2: Vec<f64>,

    /// φ(x) + ½‖D1 x‖² + ½‖D2 y‖²
    pub obj_val: f64,

    /// Detailed solve information
    pub info: SolveInfo,

    /// Per-iteration records and events
    pub diagnostics: DiagnosticsLog,
}

/// Detailed solve information.
#[derive(Debug, Clone, Default)]
pub struct SolveInfo {
    /// Outer iterations completed
    pub iters: usize,

    /// Inner iterations summed over the solve
    pub inner_iters_total: usize,

    /// Inner iterations per outer iteration
    pub inner_iters: Vec<usize>,

    /// Total solve time
    pub solve_time: Duration,

    /// Time per phase
    pub timers: PerfTimers,

    /// Final primal infeasibility (scaled)
    pub pinf: f64,

    /// Final dual infeasibility (scaled)
    pub dinf: f64,

    /// Final max complementarity product (scaled)
    pub cinf0: f64,

    /// Final barrier parameter
    pub mu: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::LinearObjective;

    fn tiny_problem() -> ProblemData {
        let a = sparse::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
        ProblemData::new(
            LinearObjective::new(vec![1.0, 2.0]),
            ConstraintOperator::Explicit(a),
            vec![1.0],
            vec![0.0, 0.0],
            vec![f64::INFINITY, 3.0],
        )
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(tiny_problem().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_crossed_bounds() {
        let mut prob = tiny_problem();
        prob.bl[1] = 4.0;
        let err = prob.validate().unwrap_err();
        assert!(err.contains("lower bound"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_bad_regularization() {
        let prob = tiny_problem().with_regularization(Regularization::Scalar(0.0), Regularization::Scalar(1.0));
        assert!(prob.validate().is_err());

        let prob = tiny_problem()
            .with_regularization(Regularization::Scalar(1.0), Regularization::Vector(vec![1.0, 1.0]));
        assert!(prob.validate().unwrap_err().contains("d2"));
    }

    #[test]
    fn test_implicit_operator_probe() {
        let dense = [[1.0, 0.0, 2.0], [0.0, -3.0, 0.0]];
        let op = ConstraintOperator::Implicit {
            m: 2,
            n: 3,
            apply: Box::new(move |mode, m, n, v| match mode {
                ApplyMode::Forward => (0..m).map(|i| (0..n).map(|j| dense[i][j] * v[j]).sum()).collect(),
                ApplyMode::Transpose => (0..n).map(|j| (0..m).map(|i| dense[i][j] * v[i]).sum()).collect(),
            }),
        };
        let a = op.to_explicit();
        assert_eq!(a.nnz(), 3);
        let d = sparse::to_dense(&a);
        assert_eq!(d[(0, 2)], 2.0);
        assert_eq!(d[(1, 1)], -3.0);

        let mut y = vec![0.0; 2];
        op.apply(&[1.0, 1.0, 1.0], &mut y);
        assert_eq!(y, vec![3.0, -3.0]);

        // ‖A‖₂ = 3 (second row dominates: singular values 3 and √5)
        assert!((op.norm2_estimate(50) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_settings_validate() {
        assert!(SolverSettings::default().validate().is_ok());
        let s = SolverSettings {
            step_tol: 1.0,
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(SolverError::Configuration(_))));
    }
}
