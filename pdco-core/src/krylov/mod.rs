//! Krylov subspace solvers.
//!
//! Every method works against the same contract: a [`LinearOperator`] that
//! can only be applied, a [`PrecondApply`] that approximates its inverse, a
//! relative tolerance and an iteration cap. The outcome always reports the
//! true residual ‖b − Kx‖ recomputed at exit, whatever the method tracked
//! internally.
//!
//! The Newton-system specific entry point is [`solve_sqd`], which routes a
//! symmetric quasi-definite system to the method's native formulation
//! (negated operator, dual Schur complement or primal Schur complement).

pub mod bicgstab;
pub mod cg;
pub mod gmres;
pub mod lsmr;
pub mod minres;
pub mod schur;
pub mod symmlq;
pub mod tfqmr;

use std::fmt;

use crate::error::{SolverError, SolverResult};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector;

pub use schur::{solve_sqd, sqd_relative_residual, SqdSolution};

/// Iterative method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KrylovMethod {
    /// Paige-Saunders MINRES with the recurrence residual estimate
    Minres,
    /// SYMMLQ
    Symmlq,
    /// MINRES with relative-residual stopping and a recomputed true residual
    MinresReference,
    /// MINRES with true-residual confirmation and stagnation detection
    MinresVendor,
    /// Restarted GMRES(k)
    Gmres,
    /// Direct quasi-GMRES with a truncated orthogonalization window
    Dqgmres,
    /// Preconditioned CG on the dual Schur complement
    Pcg,
    /// BiCGStab
    Bicgstab,
    /// Transpose-free QMR
    Tfqmr,
    /// CG on an explicitly formed dual Schur complement
    SchurCg,
    /// CG on the primal Schur complement with a constraint preconditioner
    ProjectedCg,
}

impl KrylovMethod {
    pub const ALL: [KrylovMethod; 11] = [
        KrylovMethod::Minres,
        KrylovMethod::Symmlq,
        KrylovMethod::MinresReference,
        KrylovMethod::MinresVendor,
        KrylovMethod::Gmres,
        KrylovMethod::Dqgmres,
        KrylovMethod::Pcg,
        KrylovMethod::Bicgstab,
        KrylovMethod::Tfqmr,
        KrylovMethod::SchurCg,
        KrylovMethod::ProjectedCg,
    ];

    /// Integer selector (1-11).
    pub fn from_code(code: u32) -> SolverResult<Self> {
        match code {
            1..=11 => Ok(Self::ALL[code as usize - 1]),
            _ => Err(SolverError::Configuration(format!(
                "unknown Krylov method code {} (expected 1-11)",
                code
            ))),
        }
    }

    pub fn code(self) -> u32 {
        Self::ALL.iter().position(|&m| m == self).map_or(0, |p| p as u32 + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            KrylovMethod::Minres => "MINRES",
            KrylovMethod::Symmlq => "SYMMLQ",
            KrylovMethod::MinresReference => "MINRES-ref",
            KrylovMethod::MinresVendor => "MINRES-vendor",
            KrylovMethod::Gmres => "GMRES",
            KrylovMethod::Dqgmres => "DQGMRES",
            KrylovMethod::Pcg => "PCG",
            KrylovMethod::Bicgstab => "BiCGStab",
            KrylovMethod::Tfqmr => "TFQMR",
            KrylovMethod::SchurCg => "Schur-CG",
            KrylovMethod::ProjectedCg => "Projected-CG",
        }
    }

    /// True for methods that run on the negated full SQD operator.
    pub fn uses_negated_sqd(self) -> bool {
        !matches!(
            self,
            KrylovMethod::Pcg | KrylovMethod::SchurCg | KrylovMethod::ProjectedCg
        )
    }
}

impl fmt::Display for KrylovMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How an inner solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrylovStatus {
    /// Requested tolerance met
    Converged,
    /// Stagnation or accuracy floor reached before the tolerance
    ToleranceLimit,
    /// Iteration cap reached
    IterationLimit,
    /// Recurrence broke down (zero or negative curvature, zero inner product)
    Breakdown,
    /// NaN or Inf in the iterate
    NonFinite,
}

impl KrylovStatus {
    pub fn is_converged(self) -> bool {
        self == KrylovStatus::Converged
    }
}

impl fmt::Display for KrylovStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KrylovStatus::Converged => write!(f, "converged"),
            KrylovStatus::ToleranceLimit => write!(f, "tolerance limit"),
            KrylovStatus::IterationLimit => write!(f, "iteration limit"),
            KrylovStatus::Breakdown => write!(f, "breakdown"),
            KrylovStatus::NonFinite => write!(f, "non-finite"),
        }
    }
}

/// Stopping controls shared by all methods.
#[derive(Debug, Clone, Copy)]
pub struct KrylovOptions {
    /// Relative residual target
    pub tol: f64,
    /// Iteration cap
    pub max_iter: usize,
    /// Restart length (GMRES) or window (DQGMRES)
    pub restart: usize,
}

impl Default for KrylovOptions {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            max_iter: 1000,
            restart: 20,
        }
    }
}

/// Result of one inner solve.
#[derive(Debug, Clone)]
pub struct KrylovOutcome {
    pub x: Vec<f64>,
    pub iters: usize,
    /// True residual ‖b − Kx‖ at exit
    pub resid_norm: f64,
    /// resid_norm / ‖b‖
    pub rel_resid: f64,
    pub status: KrylovStatus,
    /// Residual estimate tracked by the method, one entry per iteration
    pub history: Vec<f64>,
}

/// What a method hands back before the true residual is computed.
#[derive(Debug)]
pub(crate) struct Iterate {
    pub x: Vec<f64>,
    pub iters: usize,
    pub status: KrylovStatus,
    pub history: Vec<f64>,
}

/// Preconditioner application z ≈ K⁻¹ r.
pub trait PrecondApply {
    fn apply(&self, r: &[f64], z: &mut [f64]);
}

/// z = r
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPrecond;

impl PrecondApply for IdentityPrecond {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        z.copy_from_slice(r);
    }
}

/// z = r ./ |d|, unit weight where d vanishes.
#[derive(Debug, Clone)]
pub struct JacobiPrecond {
    inv_diag: Vec<f64>,
}

impl JacobiPrecond {
    pub fn new(diag: &[f64]) -> Self {
        let inv_diag = diag
            .iter()
            .map(|&d| {
                let a = d.abs();
                if a > 0.0 && a.is_finite() {
                    1.0 / a
                } else {
                    1.0
                }
            })
            .collect();
        Self { inv_diag }
    }
}

impl PrecondApply for JacobiPrecond {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        for ((zi, ri), di) in z.iter_mut().zip(r).zip(&self.inv_diag) {
            *zi = ri * di;
        }
    }
}

/// Run `method` on K x = b.
///
/// `SchurCg` and `ProjectedCg` describe how a Newton system is reduced
/// before CG runs; on a plain operator they are plain preconditioned CG.
pub fn solve(
    method: KrylovMethod,
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
) -> KrylovOutcome {
    let n = op.ncols();
    let bnorm = vector::norm2(b);
    if bnorm == 0.0 {
        return KrylovOutcome {
            x: vec![0.0; n],
            iters: 0,
            resid_norm: 0.0,
            rel_resid: 0.0,
            status: KrylovStatus::Converged,
            history: Vec::new(),
        };
    }

    let it = match method {
        KrylovMethod::Minres => minres::minres(op, b, pc, opts, minres::StopPolicy::PaigeSaunders),
        KrylovMethod::MinresReference => minres::minres(op, b, pc, opts, minres::StopPolicy::Reference),
        KrylovMethod::MinresVendor => minres::minres(op, b, pc, opts, minres::StopPolicy::Vendor),
        KrylovMethod::Symmlq => symmlq::symmlq(op, b, pc, opts),
        KrylovMethod::Gmres => gmres::gmres(op, b, pc, opts),
        KrylovMethod::Dqgmres => gmres::dqgmres(op, b, pc, opts),
        KrylovMethod::Pcg | KrylovMethod::SchurCg | KrylovMethod::ProjectedCg => cg::pcg(op, b, pc, opts),
        KrylovMethod::Bicgstab => bicgstab::bicgstab(op, b, pc, opts),
        KrylovMethod::Tfqmr => tfqmr::tfqmr(op, b, pc, opts),
    };

    finish(op, b, bnorm, it)
}

/// Attach the true residual to an iterate.
pub(crate) fn finish(op: &dyn LinearOperator, b: &[f64], bnorm: f64, it: Iterate) -> KrylovOutcome {
    if !vector::all_finite(&it.x) {
        return KrylovOutcome {
            x: it.x,
            iters: it.iters,
            resid_norm: f64::NAN,
            rel_resid: f64::NAN,
            status: KrylovStatus::NonFinite,
            history: it.history,
        };
    }
    let resid_norm = residual_norm(op, &it.x, b);
    let status = if resid_norm.is_finite() { it.status } else { KrylovStatus::NonFinite };
    KrylovOutcome {
        rel_resid: resid_norm / bnorm,
        resid_norm,
        x: it.x,
        iters: it.iters,
        status,
        history: it.history,
    }
}

/// ‖b − Kx‖₂
pub fn residual_norm(op: &dyn LinearOperator, x: &[f64], b: &[f64]) -> f64 {
    let mut r = vec![0.0; b.len()];
    op.apply(x, &mut r);
    for (ri, bi) in r.iter_mut().zip(b) {
        *ri = bi - *ri;
    }
    vector::norm2(&r)
}


#[cfg(test)]
mod tests {
    use super::test_systems::*;
    use super::*;

    #[test]
    fn test_method_codes() {
        for code in 1..=11 {
            let m = KrylovMethod::from_code(code).unwrap();
            assert_eq!(m.code(), code);
        }
        assert!(KrylovMethod::from_code(0).is_err());
        assert!(KrylovMethod::from_code(12).is_err());
        assert!(KrylovMethod::Minres.uses_negated_sqd());
        assert!(!KrylovMethod::ProjectedCg.uses_negated_sqd());
    }

    #[test]
    fn test_zero_rhs_short_circuits() {
        let k = laplacian(4);
        let out = solve(KrylovMethod::Gmres, &k, &[0.0; 4], &IdentityPrecond, &KrylovOptions::default());
        assert_eq!(out.iters, 0);
        assert!(out.status.is_converged());
        assert_eq!(out.x, vec![0.0; 4]);
    }

    #[test]
    fn test_all_methods_on_spd() {
        let k = laplacian(12);
        let b = rhs(12);
        let opts = KrylovOptions {
            tol: 1e-10,
            max_iter: 200,
            restart: 20,
        };
        for &method in KrylovMethod::ALL.iter() {
            let out = solve(method, &k, &b, &IdentityPrecond, &opts);
            assert!(
                out.rel_resid < 1e-7,
                "{} rel_resid {:e} status {}",
                method,
                out.rel_resid,
                out.status
            );
        }
    }

    #[test]
    fn test_indefinite_methods_on_saddle() {
        let k = saddle();
        let b = rhs(5);
        let opts = KrylovOptions {
            tol: 1e-10,
            max_iter: 100,
            restart: 10,
        };
        // BiCGStab and TFQMR are not expected to be robust on symmetric indefinite systems.
        let methods = [
            KrylovMethod::Minres,
            KrylovMethod::Symmlq,
            KrylovMethod::MinresReference,
            KrylovMethod::MinresVendor,
            KrylovMethod::Gmres,
            KrylovMethod::Dqgmres,
        ];
        for method in methods {
            let out = solve(method, &k, &b, &IdentityPrecond, &opts);
            assert!(
                out.rel_resid < 1e-7,
                "{} rel_resid {:e} status {}",
                method,
                out.rel_resid,
                out.status
            );
        }
    }

    #[test]
    fn test_nonsymmetric_methods() {
        let k = convection(15);
        let b = rhs(15);
        let opts = KrylovOptions {
            tol: 1e-10,
            max_iter: 200,
            restart: 30,
        };
        let jacobi = JacobiPrecond::new(&[4.0; 15]);
        for method in [KrylovMethod::Gmres, KrylovMethod::Dqgmres, KrylovMethod::Bicgstab, KrylovMethod::Tfqmr] {
            let out = solve(method, &k, &b, &jacobi, &opts);
            assert!(out.rel_resid < 1e-7, "{} rel_resid {:e}", method, out.rel_resid);
        }
    }
}
