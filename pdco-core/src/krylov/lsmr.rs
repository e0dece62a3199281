//! LSMR for least-squares problems min ‖M u − t‖₂ (Fong & Saunders, 2011).
//!
//! Golub-Kahan bidiagonalization of M; MINRES applied to the normal
//! equations in exact arithmetic, so ‖Mᵀr‖ decreases monotonically. Only
//! products with M and Mᵀ are needed. No damping term: the regularization
//! the Newton layer needs is already a block of M.

use super::{KrylovOptions, KrylovOutcome, KrylovStatus};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{norm2, scale};

/// Condition-number limit (test3 ≤ 1/CONLIM stops the iteration).
const CONLIM: f64 = 1e8;

/// Solve min ‖M u − t‖ with atol = btol = `opts.tol`.
///
/// `resid_norm` in the outcome is the estimated ‖Mᵀ(t − Mu)‖, and
/// `rel_resid` is it divided by ‖M‖‖r‖ (the least-squares optimality test).
pub fn lsmr(op: &dyn LinearOperator, t: &[f64], opts: &KrylovOptions) -> KrylovOutcome {
    let m = op.nrows();
    let n = op.ncols();
    let atol = opts.tol;
    let btol = opts.tol;
    let ctol = 1.0 / CONLIM;
    let mut history = Vec::new();

    let mut x = vec![0.0; n];
    let mut u = t.to_vec();
    let normb = norm2(&u);
    let mut beta = normb;
    if beta > 0.0 {
        scale(1.0 / beta, &mut u);
    }
    let mut v = vec![0.0; n];
    op.apply_transpose(&u, &mut v);
    let mut alpha = norm2(&v);
    if alpha > 0.0 {
        scale(1.0 / alpha, &mut v);
    }

    if alpha * beta == 0.0 {
        return KrylovOutcome {
            x,
            iters: 0,
            resid_norm: 0.0,
            rel_resid: 0.0,
            status: KrylovStatus::Converged,
            history,
        };
    }

    // Rotation state
    let mut zetabar = alpha * beta;
    let mut alphabar = alpha;
    let mut rho = 1.0;
    let mut rhobar = 1.0;
    let mut cbar = 1.0;
    let mut sbar = 0.0;

    let mut h = v.clone();
    let mut hbar = vec![0.0; n];

    // ‖r‖ estimation state
    let mut betadd = beta;
    let mut betad = 0.0;
    let mut rhodold: f64 = 1.0;
    let mut tautildeold = 0.0;
    let mut thetatilde = 0.0;
    let mut zeta = 0.0;

    let mut norm_a2 = alpha * alpha;
    let mut maxrbar: f64 = 0.0;
    let mut minrbar: f64 = 1e100;

    let mut mu_vec = vec![0.0; m];
    let mut nu_vec = vec![0.0; n];

    let mut status = KrylovStatus::IterationLimit;
    let mut iters = 0;
    let mut normar = alpha * beta;
    let mut rel = 1.0;

    while iters < opts.max_iter {
        iters += 1;

        // Bidiagonalization: β u = M v − α u, α v = Mᵀu − β v
        op.apply(&v, &mut mu_vec);
        for (ui, mi) in u.iter_mut().zip(&mu_vec) {
            *ui = mi - alpha * *ui;
        }
        beta = norm2(&u);
        if beta > 0.0 {
            scale(1.0 / beta, &mut u);
            op.apply_transpose(&u, &mut nu_vec);
            for (vi, ni) in v.iter_mut().zip(&nu_vec) {
                *vi = ni - beta * *vi;
            }
            alpha = norm2(&v);
            if alpha > 0.0 {
                scale(1.0 / alpha, &mut v);
            }
        }

        // Rotation P_k
        let rhoold = rho;
        rho = alphabar.hypot(beta);
        let c = alphabar / rho;
        let s = beta / rho;
        let thetanew = s * alpha;
        alphabar = c * alpha;

        // Rotation Pbar_k
        let rhobarold = rhobar;
        let zetaold = zeta;
        let thetabar = sbar * rho;
        let rhotemp = cbar * rho;
        rhobar = (cbar * rho).hypot(thetanew);
        cbar = cbar * rho / rhobar;
        sbar = thetanew / rhobar;
        zeta = cbar * zetabar;
        zetabar *= -sbar;

        // Update h, hbar, x
        let hbar_coef = thetabar * rho / (rhoold * rhobarold);
        for i in 0..n {
            hbar[i] = h[i] - hbar_coef * hbar[i];
        }
        let x_coef = zeta / (rho * rhobar);
        for i in 0..n {
            x[i] += x_coef * hbar[i];
        }
        let h_coef = thetanew / rho;
        for i in 0..n {
            h[i] = v[i] - h_coef * h[i];
        }

        // Estimate ‖r‖
        let betaacute = betadd;
        let betahat = c * betaacute;
        betadd = -s * betaacute;

        let thetatildeold = thetatilde;
        let rhotildeold = rhodold.hypot(thetabar);
        let ctildeold = rhodold / rhotildeold;
        let stildeold = thetabar / rhotildeold;
        thetatilde = stildeold * rhobar;
        rhodold = ctildeold * rhobar;
        betad = -stildeold * betad + ctildeold * betahat;

        tautildeold = (zetaold - thetatildeold * tautildeold) / rhotildeold;
        let taud = (zeta - thetatilde * tautildeold) / rhodold;
        let normr = ((betad - taud).powi(2) + betadd * betadd).sqrt();

        // Estimate ‖M‖ and cond(M)
        norm_a2 += beta * beta;
        let norm_a = norm_a2.sqrt();
        norm_a2 += alpha * alpha;

        maxrbar = maxrbar.max(rhobarold);
        if iters > 1 {
            minrbar = minrbar.min(rhobarold);
        }
        let cond_a = maxrbar.max(rhotemp) / minrbar.min(rhotemp);

        normar = zetabar.abs();
        let normx = norm2(&x);

        let test1 = normr / normb;
        let test2 = if norm_a * normr > 0.0 { normar / (norm_a * normr) } else { 0.0 };
        let test3 = 1.0 / cond_a;
        let rtol = btol + atol * norm_a * normx / normb;
        rel = test2;
        history.push(test1);

        if test1 <= rtol || test2 <= atol {
            status = KrylovStatus::Converged;
            break;
        }
        if test3 <= ctol {
            status = KrylovStatus::ToleranceLimit;
            break;
        }
        if !x_coef.is_finite() {
            status = KrylovStatus::NonFinite;
            break;
        }
    }

    KrylovOutcome {
        x,
        iters,
        resid_norm: normar,
        rel_resid: rel,
        status,
        history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse;

    #[test]
    fn test_lsmr_overdetermined() {
        // min ‖M u − t‖, M = [1 0; 0 1; 1 1], t = [1, 2, 4]
        // normal equations [2 1; 1 2] u = [5, 6] → u = [4/3, 7/3]
        let mmat = sparse::from_triplets(3, 2, vec![(0, 0, 1.0), (1, 1, 1.0), (2, 0, 1.0), (2, 1, 1.0)]);
        let opts = KrylovOptions { tol: 1e-12, max_iter: 20, restart: 0 };
        let out = lsmr(&mmat, &[1.0, 2.0, 4.0], &opts);
        assert_eq!(out.status, KrylovStatus::Converged);
        assert!((out.x[0] - 4.0 / 3.0).abs() < 1e-9);
        assert!((out.x[1] - 7.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_lsmr_square_consistent() {
        let mmat = sparse::from_triplets(2, 2, vec![(0, 0, 3.0), (1, 0, 1.0), (1, 1, 2.0)]);
        let opts = KrylovOptions { tol: 1e-12, max_iter: 20, restart: 0 };
        let out = lsmr(&mmat, &[3.0, 3.0], &opts);
        assert!((out.x[0] - 1.0).abs() < 1e-9);
        assert!((out.x[1] - 1.0).abs() < 1e-9);
    }
}
