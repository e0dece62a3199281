//! BiCGStab (van der Vorst), right-preconditioned.

use super::{Iterate, KrylovOptions, KrylovStatus, PrecondApply};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{axpy, dot, norm2};

pub(crate) fn bicgstab(
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
) -> Iterate {
    let n = b.len();
    let bnorm = norm2(b);
    let target = opts.tol * bnorm;
    let tiny = f64::MIN_POSITIVE.sqrt();

    let mut x = vec![0.0; n];
    let mut history = Vec::new();
    let mut r = b.to_vec();
    let r_hat = b.to_vec();
    let mut p = vec![0.0; n];
    let mut v = vec![0.0; n];
    let mut p_hat = vec![0.0; n];
    let mut s_hat = vec![0.0; n];
    let mut t = vec![0.0; n];

    let (mut rho, mut alpha, mut omega) = (1.0, 1.0, 1.0);
    let mut status = KrylovStatus::IterationLimit;
    let mut iters = 0;

    while iters < opts.max_iter {
        iters += 1;
        let rho_new = dot(&r_hat, &r);
        if rho_new.abs() < tiny {
            status = KrylovStatus::Breakdown;
            break;
        }
        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;
        for i in 0..n {
            p[i] = r[i] + beta * (p[i] - omega * v[i]);
        }

        pc.apply(&p, &mut p_hat);
        op.apply(&p_hat, &mut v);
        let rv = dot(&r_hat, &v);
        if rv.abs() < tiny {
            status = KrylovStatus::Breakdown;
            break;
        }
        alpha = rho / rv;

        // s = r − α v, kept in r
        axpy(-alpha, &v, &mut r);
        axpy(alpha, &p_hat, &mut x);
        let snorm = norm2(&r);
        if snorm <= target {
            history.push(snorm / bnorm);
            status = KrylovStatus::Converged;
            break;
        }

        pc.apply(&r, &mut s_hat);
        op.apply(&s_hat, &mut t);
        let tt = dot(&t, &t);
        if tt == 0.0 {
            status = KrylovStatus::Breakdown;
            break;
        }
        omega = dot(&t, &r) / tt;
        axpy(omega, &s_hat, &mut x);
        axpy(-omega, &t, &mut r);

        let rnorm = norm2(&r);
        history.push(rnorm / bnorm);
        if rnorm <= target {
            status = KrylovStatus::Converged;
            break;
        }
        if omega == 0.0 {
            status = KrylovStatus::Breakdown;
            break;
        }
    }

    Iterate { x, iters, status, history }
}
