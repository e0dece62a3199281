//! SYMMLQ for symmetric (possibly indefinite) systems.
//!
//! Lanczos with an LQ factorization of the tridiagonal T_k. The iterate is
//! kept at the LQ point x^L_k = W_k z_k; at exit it moves to the CG point
//! when that point's residual is smaller. Preconditioner must be SPD.

use super::{Iterate, KrylovOptions, KrylovStatus, PrecondApply};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{axpy, dot};

pub(crate) fn symmlq(
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
) -> Iterate {
    let n = b.len();
    let eps = f64::EPSILON;
    let mut x = vec![0.0; n];
    let mut history = Vec::new();

    // First Lanczos vector
    let mut r1 = b.to_vec();
    let mut y = vec![0.0; n];
    pc.apply(&r1, &mut y);
    let beta1_sq = dot(&r1, &y);
    if beta1_sq < 0.0 || !beta1_sq.is_finite() {
        return Iterate { x, iters: 0, status: KrylovStatus::Breakdown, history };
    }
    if beta1_sq == 0.0 {
        return Iterate { x, iters: 0, status: KrylovStatus::Converged, history };
    }
    let beta1 = beta1_sq.sqrt();

    let mut v: Vec<f64> = y.iter().map(|yi| yi / beta1).collect();
    op.apply(&v, &mut y);
    let alfa = dot(&v, &y);
    axpy(-alfa / beta1, &r1, &mut y);
    let mut r2 = y.clone();
    pc.apply(&r2, &mut y);
    let mut oldb = beta1;
    let beta_sq = dot(&r2, &y);
    if beta_sq < 0.0 || !beta_sq.is_finite() {
        return Iterate { x, iters: 1, status: KrylovStatus::Breakdown, history };
    }
    let mut beta = beta_sq.sqrt();

    // w̄_1 = v_1; LQ state
    let mut w = v.clone();
    let mut gbar = alfa;
    let mut dbar = beta;
    let mut rhs1 = beta1;
    let mut rhs2 = 0.0;
    let mut snprod = 1.0;
    let mut tnorm2 = alfa * alfa + beta * beta;

    let mut status = KrylovStatus::IterationLimit;
    let mut iters = 0;

    loop {
        iters += 1;
        let anorm = tnorm2.sqrt();
        let diag = if gbar == 0.0 { eps * anorm } else { gbar };

        // Residual of the CG point x^C_k = x^L_k + (rhs1/γ̄) w̄
        let cgnorm = snprod * beta1 * beta / diag.abs();
        let lqnorm = rhs1.hypot(rhs2);
        let rel = cgnorm / beta1;
        history.push(rel);

        if rel <= opts.tol {
            status = KrylovStatus::Converged;
        } else if beta <= eps * anorm {
            // Invariant subspace: CG point is exact up to rounding.
            status = if rel <= eps.sqrt() {
                KrylovStatus::Converged
            } else {
                KrylovStatus::ToleranceLimit
            };
        } else if diag.abs() <= eps * anorm && iters > 1 && cgnorm > lqnorm {
            status = KrylovStatus::Breakdown;
        } else if iters >= opts.max_iter {
            status = KrylovStatus::IterationLimit;
        } else {
            // Next Lanczos vector
            let s = 1.0 / beta;
            for (vi, yi) in v.iter_mut().zip(&y) {
                *vi = s * yi;
            }
            op.apply(&v, &mut y);
            axpy(-beta / oldb, &r1, &mut y);
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

            // Rotation on columns k, k+1 annihilating β_{k+1} in row k
            let gamma = gbar.hypot(oldb);
            let cs = gbar / gamma;
            let sn = oldb / gamma;
            let delta = cs * dbar + sn * alfa;
            gbar = sn * dbar - cs * alfa;
            let epsln = sn * beta;
            dbar = -cs * beta;

            // x^L += z_k w_k with w_k = cs w̄ + sn v_{k+1}
            let z = rhs1 / gamma;
            for i in 0..n {
                let wk = cs * w[i] + sn * v[i];
                x[i] += z * wk;
                w[i] = sn * w[i] - cs * v[i];
            }

            snprod *= sn;
            rhs1 = rhs2 - delta * z;
            rhs2 = -epsln * z;
            continue;
        }

        // Move to the CG point if it is better.
        if cgnorm <= lqnorm && diag != 0.0 {
            let zbar = rhs1 / diag;
            axpy(zbar, &w, &mut x);
        }
        break;
    }

    Iterate { x, iters, status, history }
}

#[cfg(test)]
mod tests {
    use super::super::test_systems::*;
    use super::super::{finish, IdentityPrecond};
    use super::*;
    use crate::linalg::vector::norm2;

    #[test]
    fn test_symmlq_spd_and_indefinite() {
        let opts = KrylovOptions { tol: 1e-12, max_iter: 100, restart: 0 };

        let k = laplacian(10);
        let b = rhs(10);
        let out = finish(&k, &b, norm2(&b), symmlq(&k, &b, &IdentityPrecond, &opts));
        assert!(out.rel_resid < 1e-9, "laplacian: {:e}", out.rel_resid);

        let k = saddle();
        let b = rhs(5);
        let out = finish(&k, &b, norm2(&b), symmlq(&k, &b, &IdentityPrecond, &opts));
        assert!(out.rel_resid < 1e-9, "saddle: {:e}", out.rel_resid);
    }

    #[test]
    fn test_symmlq_one_dimensional() {
        // K = [4]: T_1 is exact after one step.
        let k = crate::linalg::sparse::diagonal(&[4.0]);
        let b = vec![2.0];
        let opts = KrylovOptions::default();
        let out = finish(&k, &b, 2.0, symmlq(&k, &b, &IdentityPrecond, &opts));
        assert!((out.x[0] - 0.5).abs() < 1e-14);
        assert!(out.status.is_converged());
    }
}
