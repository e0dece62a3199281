//! MINRES for symmetric (possibly indefinite) systems.
//!
//! Preconditioned Lanczos with a QR factorization of the tridiagonal,
//! updated by Givens rotations (Paige & Saunders, 1975). The preconditioner
//! must be symmetric positive definite.
//!
//! The recurrence is shared by three stopping policies:
//! - `PaigeSaunders`: the classical tests on ‖r‖/(‖A‖‖x‖), ‖Ar‖/(‖A‖‖r‖)
//!   and the condition estimate, all from recurrence quantities.
//! - `Reference`: stop when the estimated relative residual ‖r‖/‖b‖ drops
//!   below tol.
//! - `Vendor`: the estimate only nominates convergence; it is confirmed on
//!   the true residual, and the iteration gives up once the update has been
//!   negligible for several consecutive steps.

use super::{Iterate, KrylovOptions, KrylovStatus, PrecondApply};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{axpy, dot, norm2};

/// Stopping rules layered on the MINRES recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    PaigeSaunders,
    Reference,
    Vendor,
}

/// Consecutive negligible updates before the vendor policy stops.
const MAX_STAG_STEPS: usize = 3;

pub(crate) fn minres(
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
    policy: StopPolicy,
) -> Iterate {
    let n = b.len();
    let eps = f64::EPSILON;
    let tol = opts.tol;
    let mut x = vec![0.0; n];
    let mut history = Vec::new();

    let mut r1 = b.to_vec();
    let mut y = vec![0.0; n];
    pc.apply(&r1, &mut y);
    let beta1_sq = dot(&r1, &y);
    if beta1_sq < 0.0 || !beta1_sq.is_finite() {
        // Preconditioner is not positive definite.
        return Iterate { x, iters: 0, status: KrylovStatus::Breakdown, history };
    }
    if beta1_sq == 0.0 {
        return Iterate { x, iters: 0, status: KrylovStatus::Converged, history };
    }
    let beta1 = beta1_sq.sqrt();
    let bnorm = norm2(b);

    let mut r2 = r1.clone();
    let mut v = vec![0.0; n];
    let mut w = vec![0.0; n];
    let mut w1 = vec![0.0; n];
    let mut w2 = vec![0.0; n];

    let mut oldb = 0.0;
    let mut beta = beta1;
    let mut dbar = 0.0;
    let mut epsln = 0.0;
    let mut phibar = beta1;
    let mut tnorm2 = 0.0;
    let mut gmax: f64 = 0.0;
    let mut gmin = f64::MAX;
    let mut cs = -1.0;
    let mut sn = 0.0;
    let mut stag_steps = 0;

    let mut status = KrylovStatus::IterationLimit;
    let mut iters = 0;

    for itn in 1..=opts.max_iter {
        iters = itn;

        // Lanczos step
        let s = 1.0 / beta;
        for (vi, yi) in v.iter_mut().zip(&y) {
            *vi = s * yi;
        }
        op.apply(&v, &mut y);
        if itn >= 2 {
            axpy(-beta / oldb, &r1, &mut y);
        }
        let alfa = dot(&v, &y);
        axpy(-alfa / beta, &r2, &mut y);
        std::mem::swap(&mut r1, &mut r2);
        r2.copy_from_slice(&y);
        pc.apply(&r2, &mut y);
        oldb = beta;
        let beta_sq = dot(&r2, &y);
        if beta_sq < 0.0 || !beta_sq.is_finite() {
            status = KrylovStatus::Breakdown;
            break;
        }
        beta = beta_sq.sqrt();
        tnorm2 += alfa * alfa + oldb * oldb + beta * beta;

        // Previous rotation, then a new one to annihilate beta
        let oldeps = epsln;
        let delta = cs * dbar + sn * alfa;
        let gbar = sn * dbar - cs * alfa;
        epsln = sn * beta;
        dbar = -cs * beta;
        let root = gbar.hypot(dbar);

        let gamma = gbar.hypot(beta).max(eps);
        cs = gbar / gamma;
        sn = beta / gamma;
        let phi = cs * phibar;
        phibar *= sn;

        // Update x
        let denom = 1.0 / gamma;
        std::mem::swap(&mut w1, &mut w2);
        std::mem::swap(&mut w2, &mut w);
        for i in 0..n {
            w[i] = (v[i] - oldeps * w1[i] - delta * w2[i]) * denom;
        }
        axpy(phi, &w, &mut x);

        gmax = gmax.max(gamma);
        gmin = gmin.min(gamma);

        let anorm = tnorm2.sqrt();
        let ynorm = norm2(&x);
        let rnorm = phibar;
        let rel_est = rnorm / beta1;
        history.push(rel_est);

        // Lanczos vector vanished: Krylov space is invariant.
        let exhausted = beta <= eps * anorm;

        match policy {
            StopPolicy::PaigeSaunders => {
                let test1 = rnorm / (anorm * ynorm).max(f64::MIN_POSITIVE);
                let test2 = root / anorm.max(f64::MIN_POSITIVE);
                let acond = gmax / gmin;
                let epsx = anorm * ynorm * eps;
                if test1 <= tol || rnorm == 0.0 {
                    status = KrylovStatus::Converged;
                    break;
                }
                if test2 <= tol || acond >= 0.1 / eps || epsx >= beta1 {
                    status = KrylovStatus::ToleranceLimit;
                    break;
                }
            }
            StopPolicy::Reference => {
                if rel_est <= tol {
                    status = KrylovStatus::Converged;
                    break;
                }
            }
            StopPolicy::Vendor => {
                if norm2(&w) * phi.abs() <= eps * ynorm {
                    stag_steps += 1;
                } else {
                    stag_steps = 0;
                }
                if rel_est <= tol {
                    let true_rel = super::residual_norm(op, &x, b) / bnorm;
                    if true_rel <= tol {
                        status = KrylovStatus::Converged;
                        break;
                    }
                }
                if stag_steps >= MAX_STAG_STEPS {
                    status = KrylovStatus::ToleranceLimit;
                    break;
                }
            }
        }

        if exhausted {
            status = if rel_est <= tol.max(eps.sqrt()) {
                KrylovStatus::Converged
            } else {
                KrylovStatus::ToleranceLimit
            };
            break;
        }
    }

    Iterate { x, iters, status, history }
}

#[cfg(test)]
mod tests {
    use super::super::test_systems::*;
    use super::super::{finish, IdentityPrecond, JacobiPrecond};
    use super::*;

    fn opts(tol: f64, max_iter: usize) -> KrylovOptions {
        KrylovOptions { tol, max_iter, restart: 0 }
    }

    #[test]
    fn test_minres_indefinite_all_policies() {
        let k = saddle();
        let b = rhs(5);
        for policy in [StopPolicy::PaigeSaunders, StopPolicy::Reference, StopPolicy::Vendor] {
            let it = minres(&k, &b, &IdentityPrecond, &opts(1e-12, 50), policy);
            let out = finish(&k, &b, norm2(&b), it);
            assert!(out.rel_resid < 1e-9, "{:?}: {:e}", policy, out.rel_resid);
            assert!(out.iters <= 6, "{:?}: {} iterations", policy, out.iters);
        }
    }

    #[test]
    fn test_minres_preconditioned_spd() {
        let k = laplacian(20);
        let b = rhs(20);
        let pc = JacobiPrecond::new(&[2.0; 20]);
        let it = minres(&k, &b, &pc, &opts(1e-10, 100), StopPolicy::Reference);
        let out = finish(&k, &b, norm2(&b), it);
        assert_eq!(out.status, KrylovStatus::Converged);
        assert!(out.rel_resid < 1e-8);
        // Residual estimates never increase for MINRES.
        for pair in out.history.windows(2) {
            assert!(pair[1] <= pair[0] * (1.0 + 1e-12));
        }
    }

    #[test]
    fn test_minres_iteration_limit() {
        let k = laplacian(50);
        let b = rhs(50);
        let it = minres(&k, &b, &IdentityPrecond, &opts(1e-14, 3), StopPolicy::Reference);
        assert_eq!(it.status, KrylovStatus::IterationLimit);
        assert_eq!(it.iters, 3);
    }
}
