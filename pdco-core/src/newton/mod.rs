//! Newton-system dispatcher.
//!
//! Each barrier iteration needs (Δx, Δy) from
//!
//! ```text
//!     H Δx − Aᵀ Δy = w
//!     A Δx + D2² Δy = r1
//! ```
//!
//! with H = ∇²φ + D1² + Z1/X1 + Z2/X2. The [`SolveFamily`] decides how:
//! the diagonal family eliminates Δx and works on the normal equations (or
//! their least-squares form), the SQD family keeps both blocks and solves
//! the symmetric quasi-definite matrix directly or with a Krylov method.
//!
//! Orderings, symbolic factorizations and the materialized constraint
//! matrix are computed on first use and kept for the rest of the solve.

mod augmented;
mod reduced;

pub use reduced::{LeastSquaresOperator, NormalOperator};

use std::fmt;

use log::debug;

use crate::bounds::BoundPartition;
use crate::error::{SolverError, SolverResult};
use crate::krylov::{KrylovMethod, KrylovStatus};
use crate::linalg::ldl::LdlSolver;
use crate::linalg::sparse_direct::{SparseLu, SparseQr};
use crate::linalg::sparse::{self, SparseCsc};
use crate::linalg::vector;
use crate::objective::Curvature;
use crate::precond::{FallbackNote, PreconditionerKind};
use crate::problem::{ConstraintOperator, SolverSettings};

/// How the Newton system is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolveFamily {
    /// Sparse LDLᵀ of the normal equations
    Cholesky,
    /// Sparse QR of the least-squares form
    Qr,
    /// LSMR on the least-squares form
    Lsmr,
    /// MINRES on the normal equations
    Minres,
    /// CG on the normal equations
    Pcg,
    /// Sparse LU of the SQD matrix
    SqdLu,
    /// Sparse LDLᵀ of the SQD matrix
    SqdLdl,
    /// Dense general solve of the SQD matrix
    SqdBackslash,
    /// Dense general solve with one perturbed retry
    SqdBackslashPerturbed,
    /// Krylov method on the SQD matrix
    SqdKrylov,
}

impl SolveFamily {
    /// Integer selector (1-5 and 21-25).
    pub fn from_code(code: u32) -> SolverResult<Self> {
        Ok(match code {
            1 => SolveFamily::Cholesky,
            2 => SolveFamily::Qr,
            3 => SolveFamily::Lsmr,
            4 => SolveFamily::Minres,
            5 => SolveFamily::Pcg,
            21 => SolveFamily::SqdLu,
            22 => SolveFamily::SqdLdl,
            23 => SolveFamily::SqdBackslash,
            24 => SolveFamily::SqdBackslashPerturbed,
            25 => SolveFamily::SqdKrylov,
            _ => {
                return Err(SolverError::Configuration(format!(
                    "unknown solve family code {} (expected 1-5 or 21-25)",
                    code
                )))
            }
        })
    }

    pub fn code(self) -> u32 {
        match self {
            SolveFamily::Cholesky => 1,
            SolveFamily::Qr => 2,
            SolveFamily::Lsmr => 3,
            SolveFamily::Minres => 4,
            SolveFamily::Pcg => 5,
            SolveFamily::SqdLu => 21,
            SolveFamily::SqdLdl => 22,
            SolveFamily::SqdBackslash => 23,
            SolveFamily::SqdBackslashPerturbed => 24,
            SolveFamily::SqdKrylov => 25,
        }
    }

    /// Requires a diagonal curvature.
    pub fn is_diagonal_family(self) -> bool {
        self.code() < 20
    }

    /// Solves inexactly, to the controller's inner tolerance.
    pub fn is_iterative(self) -> bool {
        matches!(
            self,
            SolveFamily::Lsmr | SolveFamily::Minres | SolveFamily::Pcg | SolveFamily::SqdKrylov
        )
    }
}

impl fmt::Display for SolveFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveFamily::Cholesky => "Cholesky",
            SolveFamily::Qr => "QR",
            SolveFamily::Lsmr => "LSMR",
            SolveFamily::Minres => "MINRES",
            SolveFamily::Pcg => "PCG",
            SolveFamily::SqdLu => "SQD-LU",
            SolveFamily::SqdLdl => "SQD-LDL",
            SolveFamily::SqdBackslash => "SQD-backslash",
            SolveFamily::SqdBackslashPerturbed => "SQD-backslash-perturbed",
            SolveFamily::SqdKrylov => "SQD-Krylov",
        };
        write!(f, "{}", name)
    }
}

/// One Newton system, borrowed from the controller.
pub struct NewtonSystem<'a> {
    /// Outer iteration index, for error reports
    pub iter: usize,
    pub a: &'a ConstraintOperator,
    /// ∇²φ at the current iterate
    pub curvature: &'a Curvature,
    /// D1² + Z1/X1 + Z2/X2, zero on fixed variables
    pub h_barrier: &'a [f64],
    pub bounds: &'a BoundPartition,
    pub d2sq: &'a [f64],
    pub w: &'a [f64],
    pub r1: &'a [f64],
    /// Relative tolerance for iterative families
    pub inner_tol: f64,
    /// Residual norms before the solve, for error reports
    pub pinf: f64,
    pub dinf: f64,
}

impl NewtonSystem<'_> {
    pub fn n(&self) -> usize {
        self.w.len()
    }

    pub fn m(&self) -> usize {
        self.r1.len()
    }
}

/// Summary of an inexact inner solve.
#[derive(Debug, Clone)]
pub struct InnerSolve {
    pub method: &'static str,
    pub preconditioner: &'static str,
    pub tol: f64,
    pub max_iter: usize,
    pub iters: usize,
    pub rel_resid: f64,
    pub status: KrylovStatus,
}

/// Non-fatal things that happened while computing a direction.
#[derive(Debug, Clone, PartialEq)]
pub enum NewtonNote {
    PreconditionerFallback(FallbackNote),
    /// The SQD matrix was perturbed on its diagonal by about `magnitude`
    Perturbed { magnitude: f64 },
    /// The direct reference solve for the exact-error check failed
    ExactErrorUnavailable(String),
}

/// Search direction for (x, y).
#[derive(Debug, Clone)]
pub struct Direction {
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
    pub inner: Option<InnerSolve>,
    /// ‖(Δx, Δy) − exact‖ / ‖exact‖ when the check is enabled
    pub exact_error: Option<f64>,
    pub notes: Vec<NewtonNote>,
}

impl Direction {
    fn direct(dx: Vec<f64>, dy: Vec<f64>) -> Self {
        Self {
            dx,
            dy,
            inner: None,
            exact_error: None,
            notes: Vec::new(),
        }
    }
}

/// Dispatcher with its caches.
#[derive(Debug)]
pub struct NewtonSolver {
    family: SolveFamily,
    method: KrylovMethod,
    pc_kind: PreconditionerKind,
    inner_itn_mult: usize,
    gmres_restart: usize,
    diag_precond: bool,
    exact_error_check: bool,
    seed: u64,

    /// A with fixed columns removed
    a_explicit: Option<SparseCsc>,
    normal_ldl: Option<LdlSolver>,
    sqd_ldl: Option<LdlSolver>,
    exact_ldl: Option<LdlSolver>,
    /// Sparse QR of the least-squares matrix
    qr: SparseQr,
    /// Sparse LU of the SQD matrix
    sqd_lu: SparseLu,
}

impl NewtonSolver {
    pub fn new(settings: &SolverSettings) -> Self {
        Self {
            family: settings.family,
            method: settings.krylov_method,
            pc_kind: settings.preconditioner,
            inner_itn_mult: settings.inner_itn_mult.max(1),
            gmres_restart: settings.gmres_restart,
            diag_precond: settings.diag_precond,
            exact_error_check: settings.exact_error_check,
            seed: settings.seed,
            a_explicit: None,
            normal_ldl: None,
            sqd_ldl: None,
            exact_ldl: None,
            qr: SparseQr::new(),
            sqd_lu: SparseLu::new(),
        }
    }

    pub fn family(&self) -> SolveFamily {
        self.family
    }

    /// Compute (Δx, Δy). Δx is zero on fixed variables.
    pub fn solve(&mut self, sys: &NewtonSystem) -> SolverResult<Direction> {
        if self.family.is_diagonal_family() && !sys.curvature.is_diagonal() {
            return Err(SolverError::Configuration(format!(
                "solve family {} needs a diagonal curvature",
                self.family
            )));
        }

        let mut dir = match self.family {
            SolveFamily::Cholesky => self.solve_cholesky(sys),
            SolveFamily::Qr => self.solve_qr(sys),
            SolveFamily::Lsmr => self.solve_lsmr(sys),
            SolveFamily::Minres => self.solve_normal_krylov(sys, KrylovMethod::Minres),
            SolveFamily::Pcg => self.solve_normal_krylov(sys, KrylovMethod::Pcg),
            SolveFamily::SqdLu
            | SolveFamily::SqdLdl
            | SolveFamily::SqdBackslash
            | SolveFamily::SqdBackslashPerturbed
            | SolveFamily::SqdKrylov => self.solve_sqd(sys),
        }
        .map_err(|e| e.at_iter(sys.iter))?;

        for &j in &sys.bounds.fixed {
            dir.dx[j] = 0.0;
        }
        if !vector::all_finite(&dir.dx) || !vector::all_finite(&dir.dy) {
            return Err(SolverError::NonFiniteSolution {
                iter: sys.iter,
                pinf: sys.pinf,
                dinf: sys.dinf,
            });
        }

        if self.exact_error_check && self.family.is_iterative() {
            match self.exact_error(sys, &dir) {
                Ok(err) => {
                    debug!("iteration {}: inner solve error vs direct {:.3e}", sys.iter, err);
                    dir.exact_error = Some(err);
                }
                Err(e) => dir.notes.push(NewtonNote::ExactErrorUnavailable(e.to_string())),
            }
        }
        Ok(dir)
    }

    /// Inner iteration cap for a system of dimension `dim`.
    fn max_inner(&self, dim: usize) -> usize {
        (self.inner_itn_mult * dim).max(1)
    }

    /// Relative error of `dir` against a sparse LDLᵀ solve of the SQD system.
    fn exact_error(&mut self, sys: &NewtonSystem, dir: &Direction) -> SolverResult<f64> {
        let a = explicit_a(&mut self.a_explicit, sys);
        let blocks = augmented::sqd_blocks(sys, a);
        let rhs = augmented::sqd_rhs(sys);
        let k = blocks.assemble(false);
        let ldl = self
            .exact_ldl
            .get_or_insert_with(|| LdlSolver::new(k.rows(), crate::linalg::ldl::PivotPolicy::QuasiDefinite));
        ldl.factor(&k)?;
        let exact = ldl.solve(&rhs)?;

        let n = sys.n();
        let mut diff2 = 0.0;
        for (i, e) in exact.iter().enumerate() {
            let got = if i < n { dir.dx[i] } else { dir.dy[i - n] };
            diff2 += (got - e) * (got - e);
        }
        let norm = vector::norm2(&exact);
        Ok(if norm > 0.0 { diff2.sqrt() / norm } else { diff2.sqrt() })
    }
}

/// A with fixed columns removed, built on first use.
fn explicit_a<'c>(cache: &'c mut Option<SparseCsc>, sys: &NewtonSystem) -> &'c SparseCsc {
    cache.get_or_insert_with(|| {
        let full = sys.a.to_explicit();
        let is_fixed = &sys.bounds.is_fixed;
        sparse::from_triplets(
            full.rows(),
            full.cols(),
            full.iter().filter(|(_, (_, j))| !is_fixed[*j]).map(|(&v, (i, j))| (i, j, v)),
        )
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn settings(family: SolveFamily) -> SolverSettings {
        SolverSettings {
            family,
            ..SolverSettings::default()
        }
    }

    #[test]
    fn test_family_codes() {
        for code in [1, 2, 3, 4, 5, 21, 22, 23, 24, 25] {
            assert_eq!(SolveFamily::from_code(code).unwrap().code(), code);
        }
        assert!(SolveFamily::from_code(6).is_err());
        assert!(SolveFamily::from_code(26).is_err());
        assert!(SolveFamily::Qr.is_diagonal_family());
        assert!(!SolveFamily::SqdLdl.is_diagonal_family());
        assert!(SolveFamily::SqdKrylov.is_iterative());
    }

    #[test]
    fn test_every_family_solves_the_newton_system() {
        let fx = Fixture::small(Curvature::Diagonal(vec![0.5, 0.0, 1.0, 0.0]));
        let families = [
            SolveFamily::Cholesky,
            SolveFamily::Qr,
            SolveFamily::Lsmr,
            SolveFamily::Minres,
            SolveFamily::Pcg,
            SolveFamily::SqdLu,
            SolveFamily::SqdLdl,
            SolveFamily::SqdBackslash,
            SolveFamily::SqdBackslashPerturbed,
            SolveFamily::SqdKrylov,
        ];
        for family in families {
            let mut solver = NewtonSolver::new(&settings(family));
            let dir = solver.solve(&fx.system(1e-12)).unwrap();
            assert_eq!(dir.dx[3], 0.0, "{}", family);
            let res = block_residual(&fx, &dir);
            assert!(res < 1e-6, "{}: residual {:e}", family, res);
            assert_eq!(dir.inner.is_some(), family.is_iterative(), "{}", family);
        }
    }

    #[test]
    fn test_sqd_family_accepts_sparse_curvature() {
        let h = sparse::from_triplets(4, 4, vec![(0, 0, 1.0), (1, 1, 1.0), (0, 1, 0.25), (1, 0, 0.25)]);
        let fx = Fixture::small(Curvature::Sparse(h));
        for family in [SolveFamily::SqdLdl, SolveFamily::SqdLu, SolveFamily::SqdKrylov] {
            let mut solver = NewtonSolver::new(&settings(family));
            let dir = solver.solve(&fx.system(1e-12)).unwrap();
            assert!(block_residual(&fx, &dir) < 1e-6, "{}", family);
        }
    }

    #[test]
    fn test_diagonal_family_rejects_sparse_curvature() {
        let h = sparse::from_triplets(4, 4, vec![(0, 1, 0.25), (1, 0, 0.25)]);
        let fx = Fixture::small(Curvature::Sparse(h));
        let mut solver = NewtonSolver::new(&settings(SolveFamily::Cholesky));
        assert!(matches!(solver.solve(&fx.system(1e-8)), Err(SolverError::Configuration(_))));
    }

    #[test]
    fn test_cholesky_reports_indefinite_with_iteration() {
        let mut fx = Fixture::small(Curvature::zeros(4));
        fx.h_barrier[2] = 0.0;
        let mut solver = NewtonSolver::new(&settings(SolveFamily::Cholesky));
        match solver.solve(&fx.system(1e-8)) {
            Err(SolverError::IndefiniteSystem { iter, .. }) => assert_eq!(iter, 3),
            other => panic!("expected IndefiniteSystem, got {:?}", other.map(|d| d.dx)),
        }
    }

    #[test]
    fn test_factorizations_are_reused() {
        let fx = Fixture::small(Curvature::zeros(4));
        let mut solver = NewtonSolver::new(&settings(SolveFamily::Cholesky));
        solver.solve(&fx.system(1e-8)).unwrap();
        solver.solve(&fx.system(1e-8)).unwrap();
        assert_eq!(solver.normal_ldl.as_ref().map(|f| f.factorizations()), Some(2));
        assert!(solver.a_explicit.is_some());
    }

    #[test]
    fn test_exact_error_check() {
        let fx = Fixture::small(Curvature::zeros(4));
        let mut s = settings(SolveFamily::Minres);
        s.exact_error_check = true;
        let mut solver = NewtonSolver::new(&s);
        let dir = solver.solve(&fx.system(1e-12)).unwrap();
        let err = dir.exact_error.unwrap();
        assert!(err < 1e-6, "{:e}", err);
    }
}
