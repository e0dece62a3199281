//! Preconditioned Conjugate Gradient.
//!
//! For symmetric positive definite K and SPD preconditioner M:
//!
//! ```text
//! r = b, z = M⁻¹r, p = z
//! loop:
//!     α = (r·z) / (p·Kp)
//!     x += α p,  r −= α Kp
//!     z = M⁻¹r
//!     β = (r·z)_new / (r·z)_old
//!     p = z + β p
//! ```
//!
//! Non-positive curvature pᵀKp or a non-positive rᵀz reports `Breakdown`.

use super::{Iterate, KrylovOptions, KrylovStatus, PrecondApply};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{axpy, dot, norm2};

pub(crate) fn pcg(
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
) -> Iterate {
    let n = b.len();
    let bnorm = norm2(b);
    let target = opts.tol * bnorm;
    let mut x = vec![0.0; n];
    let mut history = Vec::new();

    let mut r = b.to_vec();
    let mut z = vec![0.0; n];
    pc.apply(&r, &mut z);
    let mut rz = dot(&r, &z);
    if rz < 0.0 || !rz.is_finite() {
        return Iterate { x, iters: 0, status: KrylovStatus::Breakdown, history };
    }
    let mut p = z.clone();
    let mut kp = vec![0.0; n];

    let mut status = KrylovStatus::IterationLimit;
    let mut iters = 0;

    while iters < opts.max_iter {
        iters += 1;
        op.apply(&p, &mut kp);
        let pkp = dot(&p, &kp);
        if !(pkp > 0.0) {
            status = KrylovStatus::Breakdown;
            break;
        }
        let alpha = rz / pkp;
        axpy(alpha, &p, &mut x);
        axpy(-alpha, &kp, &mut r);

        let rnorm = norm2(&r);
        history.push(rnorm / bnorm);
        if rnorm <= target {
            status = KrylovStatus::Converged;
            break;
        }

        pc.apply(&r, &mut z);
        let rz_new = dot(&r, &z);
        if !(rz_new > 0.0) {
            status = if rz_new == 0.0 {
                KrylovStatus::ToleranceLimit
            } else {
                KrylovStatus::Breakdown
            };
            break;
        }
        let beta = rz_new / rz;
        rz = rz_new;
        for (pi, zi) in p.iter_mut().zip(&z) {
            *pi = zi + beta * *pi;
        }
    }

    Iterate { x, iters, status, history }
}

#[cfg(test)]
mod tests {
    use super::super::test_systems::*;
    use super::super::{finish, IdentityPrecond, JacobiPrecond};
    use super::*;

    #[test]
    fn test_pcg_laplacian() {
        let k = laplacian(25);
        let b = rhs(25);
        let opts = KrylovOptions { tol: 1e-10, max_iter: 100, restart: 0 };
        let out = finish(&k, &b, norm2(&b), pcg(&k, &b, &JacobiPrecond::new(&[2.0; 25]), &opts));
        assert_eq!(out.status, KrylovStatus::Converged);
        assert!(out.rel_resid < 1e-9);
        assert!(out.iters <= 25);
    }

    #[test]
    fn test_pcg_detects_indefinite() {
        let k = saddle();
        let b = vec![0.0, 0.0, 0.0, 1.0, 1.0];
        let opts = KrylovOptions::default();
        let it = pcg(&k, &b, &IdentityPrecond, &opts);
        assert_eq!(it.status, KrylovStatus::Breakdown);
    }
}
