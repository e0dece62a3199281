//! GMRES variants, right-preconditioned.
//!
//! `gmres`: restarted GMRES(k) with modified Gram-Schmidt Arnoldi and
//! Givens rotations on the Hessenberg matrix.
//!
//! `dqgmres`: direct quasi-GMRES (Saad & Wu). Each new Arnoldi vector is
//! orthogonalized against the previous `k` only, and the solution is
//! updated progressively, so memory stays O(k·n) without restarts.

use std::collections::VecDeque;

use super::{Iterate, KrylovOptions, KrylovStatus, PrecondApply};
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{axpy, dot, norm2};

/// Givens rotation (c, s) with c·a + s·b = r, −s·a + c·b = 0.
#[inline]
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

#[inline]
fn rotate(c: f64, s: f64, a: &mut f64, b: &mut f64) {
    let t = c * *a + s * *b;
    *b = -s * *a + c * *b;
    *a = t;
}

pub(crate) fn gmres(
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
) -> Iterate {
    let n = b.len();
    let k = opts.restart.max(1).min(n.max(1));
    let bnorm = norm2(b);
    let target = opts.tol * bnorm;

    let mut x = vec![0.0; n];
    let mut history = Vec::new();
    let mut iters = 0;
    let mut r = b.to_vec();
    let mut tmp = vec![0.0; n];

    loop {
        let beta = norm2(&r);
        if beta <= target {
            return Iterate { x, iters, status: KrylovStatus::Converged, history };
        }
        if iters >= opts.max_iter {
            return Iterate { x, iters, status: KrylovStatus::IterationLimit, history };
        }

        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(k + 1);
        basis.push(r.iter().map(|ri| ri / beta).collect());
        // Column-major Hessenberg, column j has j+2 entries
        let mut hess: Vec<Vec<f64>> = Vec::with_capacity(k);
        let mut rots: Vec<(f64, f64)> = Vec::with_capacity(k);
        let mut g = vec![0.0; k + 1];
        g[0] = beta;

        let mut lucky = false;
        let mut j = 0;
        while j < k && iters < opts.max_iter {
            iters += 1;
            pc.apply(&basis[j], &mut tmp);
            let mut wv = vec![0.0; n];
            op.apply(&tmp, &mut wv);

            let mut h = vec![0.0; j + 2];
            for (i, vi) in basis.iter().enumerate() {
                h[i] = dot(&wv, vi);
                axpy(-h[i], vi, &mut wv);
            }
            let hnext = norm2(&wv);
            h[j + 1] = hnext;

            for (i, &(c, s)) in rots.iter().enumerate() {
                let (hi, rest) = h.split_at_mut(i + 1);
                rotate(c, s, &mut hi[i], &mut rest[0]);
            }
            let (c, s) = givens(h[j], h[j + 1]);
            {
                let (hj, rest) = h.split_at_mut(j + 1);
                rotate(c, s, &mut hj[j], &mut rest[0]);
            }
            rots.push((c, s));
            let (gj, rest) = g.split_at_mut(j + 1);
            rotate(c, s, &mut gj[j], &mut rest[0]);
            hess.push(h);

            let res = g[j + 1].abs();
            history.push(res / bnorm);
            j += 1;

            if hnext <= f64::EPSILON * bnorm {
                lucky = true;
                break;
            }
            if res <= target {
                break;
            }
            basis.push(wv.iter().map(|wi| wi / hnext).collect());
        }

        // Back substitution on the j x j triangle
        let mut yv = vec![0.0; j];
        for i in (0..j).rev() {
            let mut acc = g[i];
            for l in (i + 1)..j {
                acc -= hess[l][i] * yv[l];
            }
            let diag = hess[i][i];
            if diag == 0.0 {
                return Iterate { x, iters, status: KrylovStatus::Breakdown, history };
            }
            yv[i] = acc / diag;
        }

        // x += M⁻¹ V y
        let mut update = vec![0.0; n];
        for (i, yi) in yv.iter().enumerate() {
            axpy(*yi, &basis[i], &mut update);
        }
        pc.apply(&update, &mut tmp);
        axpy(1.0, &tmp, &mut x);

        // Fresh residual for the restart
        op.apply(&x, &mut tmp);
        for i in 0..n {
            r[i] = b[i] - tmp[i];
        }

        if lucky {
            let status = if norm2(&r) <= target.max(f64::EPSILON.sqrt() * bnorm) {
                KrylovStatus::Converged
            } else {
                KrylovStatus::Breakdown
            };
            return Iterate { x, iters, status, history };
        }
    }
}

pub(crate) fn dqgmres(
    op: &dyn LinearOperator,
    b: &[f64],
    pc: &dyn PrecondApply,
    opts: &KrylovOptions,
) -> Iterate {
    let n = b.len();
    let k = opts.restart.max(1);
    let bnorm = norm2(b);
    let target = opts.tol * bnorm;

    let mut x = vec![0.0; n];
    let mut history = Vec::new();

    // Sliding windows over the last k vectors / rotations / directions
    let mut vs: VecDeque<Vec<f64>> = VecDeque::with_capacity(k);
    let mut ps: VecDeque<Vec<f64>> = VecDeque::with_capacity(k);
    let mut rots: VecDeque<(f64, f64)> = VecDeque::with_capacity(k);

    vs.push_back(b.iter().map(|bi| bi / bnorm).collect());
    let mut gamma = bnorm;
    let mut z = vec![0.0; n];
    let mut wv = vec![0.0; n];

    let mut status = KrylovStatus::IterationLimit;
    let mut iters = 0;

    while iters < opts.max_iter {
        iters += 1;
        let vm = match vs.back() {
            Some(v) => v.clone(),
            None => break,
        };
        pc.apply(&vm, &mut z);
        op.apply(&z, &mut wv);

        // Incomplete orthogonalization: h[i] pairs with vs[i]
        let mut h: Vec<f64> = Vec::with_capacity(vs.len() + 1);
        for vi in vs.iter() {
            let hi = dot(&wv, vi);
            axpy(-hi, vi, &mut wv);
            h.push(hi);
        }
        let hnext = norm2(&wv);

        // Column entries: rows (m-len+1 ..= m) in h, row m+1 in hnext.
        // Prepend a zero for the row touched by the oldest stored rotation.
        let len = h.len();
        let mut col = vec![0.0; len + 1];
        col[1..].copy_from_slice(&h);
        // rots[i] acts on rows (m - rots.len() + i, +1); col[0] is row m - len.
        let offset = len + 1 - rots.len() - 1;
        for (i, &(c, s)) in rots.iter().enumerate() {
            let (lo, hi) = col.split_at_mut(offset + i + 1);
            rotate(c, s, &mut lo[offset + i], &mut hi[0]);
        }
        let diag = col[len];
        let (c, s) = givens(diag, hnext);
        let hmm = c * diag + s * hnext;
        let gamma_m = c * gamma;
        gamma *= -s;

        if hmm == 0.0 {
            status = KrylovStatus::Breakdown;
            break;
        }

        // p_m = (z_m − Σ h_{i,m} p_i) / h_mm over the stored directions
        let mut p = z.clone();
        let np = ps.len();
        for (i, pi) in ps.iter().enumerate() {
            // ps[i] is direction m - np + i, matching col[len - np + i]
            let coef = col[len - np + i];
            axpy(-coef, pi, &mut p);
        }
        for pi in p.iter_mut() {
            *pi /= hmm;
        }
        axpy(gamma_m, &p, &mut x);

        if ps.len() == k {
            ps.pop_front();
        }
        ps.push_back(p);
        if rots.len() == k {
            rots.pop_front();
        }
        rots.push_back((c, s));

        let res_est = gamma.abs();
        history.push(res_est / bnorm);
        if res_est <= target {
            status = KrylovStatus::Converged;
            break;
        }
        if hnext <= f64::EPSILON * bnorm {
            // Exact solution in the current space
            status = KrylovStatus::Converged;
            break;
        }
        if vs.len() == k {
            vs.pop_front();
        }
        vs.push_back(wv.iter().map(|wi| wi / hnext).collect());
    }

    Iterate { x, iters, status, history }
}
