//! Transpose-free QMR (Freund, 1993), right-preconditioned.
//!
//! Runs on K M⁻¹ and maps back through M⁻¹ at exit. Each CGS step is split
//! into two half-steps with a quasi-minimal residual smoothing; the
//! convergence test uses the bound ‖r‖ ≤ τ·√(j+1).

use super::{Iterate, KrylovOptions, KrylovStatus, PrecondApply};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{axpy, dot, norm2};

pub(crate) fn tfqmr(
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
) -> Iterate {
    let n = b.len();
    let bnorm = norm2(b);
    let target = opts.tol * bnorm;
    let tiny = f64::MIN_POSITIVE.sqrt();
    let mut history = Vec::new();

    // y = K M⁻¹ v
    let mut scratch = vec![0.0; n];
    let mut apply_km = |v: &[f64], y: &mut [f64]| {
        pc.apply(v, &mut scratch);
        op.apply(&scratch, y);
    };

    let mut u_sol = vec![0.0; n];
    let mut w = b.to_vec();
    let r_star = b.to_vec();
    let mut u1 = b.to_vec();
    let mut u2 = vec![0.0; n];
    let mut ku1 = vec![0.0; n];
    apply_km(&u1, &mut ku1);
    let mut v = ku1.clone();
    let mut ku2 = vec![0.0; n];
    let mut d = vec![0.0; n];

    let mut tau = bnorm;
    let mut theta = 0.0;
    let mut eta = 0.0;
    let mut rho = dot(&r_star, b);

    let mut status = KrylovStatus::IterationLimit;
    let mut half_steps = 0usize;
    let mut iters = 0;

    'outer: while iters < opts.max_iter {
        iters += 1;
        let sigma = dot(&r_star, &v);
        if sigma.abs() < tiny {
            status = KrylovStatus::Breakdown;
            break;
        }
        let alpha = rho / sigma;
        for i in 0..n {
            u2[i] = u1[i] - alpha * v[i];
        }
        apply_km(&u2, &mut ku2);

        for half in 0..2 {
            half_steps += 1;
            let (u, ku) = if half == 0 { (&u1, &ku1) } else { (&u2, &ku2) };
            axpy(-alpha, ku, &mut w);
            let coef = theta * theta * eta / alpha;
            for i in 0..n {
                d[i] = u[i] + coef * d[i];
            }
            theta = norm2(&w) / tau;
            let c = 1.0 / (1.0 + theta * theta).sqrt();
            tau *= theta * c;
            eta = c * c * alpha;
            axpy(eta, &d, &mut u_sol);

            let bound = tau * ((half_steps + 1) as f64).sqrt();
            history.push(bound / bnorm);
            if bound <= target {
                status = KrylovStatus::Converged;
                break 'outer;
            }
        }

        let rho_new = dot(&r_star, &w);
        if rho_new.abs() < tiny {
            status = if tau <= f64::EPSILON.sqrt() * bnorm {
                KrylovStatus::ToleranceLimit
            } else {
                KrylovStatus::Breakdown
            };
            break;
        }
        let beta = rho_new / rho;
        rho = rho_new;
        for i in 0..n {
            u1[i] = w[i] + beta * u2[i];
        }
        apply_km(&u1, &mut ku1);
        for i in 0..n {
            v[i] = ku1[i] + beta * (ku2[i] + beta * v[i]);
        }
    }

    let mut x = vec![0.0; n];
    pc.apply(&u_sol, &mut x);
    Iterate { x, iters, status, history }
}
