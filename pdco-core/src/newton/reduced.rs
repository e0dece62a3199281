//! Diagonal-curvature family: eliminate Δx = H⁻¹(w + Aᵀ Δy) and solve
//!
//! ```text
//!     (A H⁻¹ Aᵀ + D2²) Δy = r1 − A H⁻¹ w
//! ```
//!
//! directly (sparse LDLᵀ), or in least-squares form
//!
//! ```text
//!     min ‖ [H^{-½} Aᵀ] Δy − [−H^{-½} w ] ‖
//!         ‖ [   D2   ]      [ D2⁻¹ r1  ] ‖
//! ```
//!
//! by sparse QR or LSMR, or with MINRES/CG on the normal operator.

use log::debug;

use super::{explicit_a, Direction, InnerSolve, NewtonSolver, NewtonSystem};
use crate::error::{SolverError, SolverResult};
use crate::krylov::{self, lsmr::lsmr, IdentityPrecond, JacobiPrecond, KrylovMethod, KrylovOptions, PrecondApply};
use crate::linalg::ldl::{LdlSolver, PivotPolicy};
use crate::linalg::operator::{LinearOperator, SqdBlocks};
use crate::linalg::sparse::{self, SparseCsc};
use crate::problem::ConstraintOperator;

/// diag(H)⁻¹, zero on fixed variables.
fn inverse_h(sys: &NewtonSystem) -> SolverResult<Vec<f64>> {
    let curv = sys.curvature.diagonal();
    let mut hinv = vec![0.0; sys.n()];
    for j in 0..sys.n() {
        if sys.bounds.is_fixed[j] {
            continue;
        }
        let h = curv[j] + sys.h_barrier[j];
        if !(h > 0.0) || !h.is_finite() {
            return Err(SolverError::IndefiniteSystem {
                iter: sys.iter,
                detail: format!("H[{}] = {:.3e} is not positive", j, h),
            });
        }
        hinv[j] = 1.0 / h;
    }
    Ok(hinv)
}

/// r1 − A H⁻¹ w
fn normal_rhs(sys: &NewtonSystem, hinv: &[f64]) -> Vec<f64> {
    let hw: Vec<f64> = sys.w.iter().zip(hinv).map(|(w, h)| w * h).collect();
    let mut ahw = vec![0.0; sys.m()];
    sys.a.apply(&hw, &mut ahw);
    sys.r1.iter().zip(&ahw).map(|(r, v)| r - v).collect()
}

/// Δx = H⁻¹(w + Aᵀ Δy)
fn recover_dx(sys: &NewtonSystem, hinv: &[f64], dy: &[f64]) -> Vec<f64> {
    let mut atdy = vec![0.0; sys.n()];
    if sys.m() > 0 {
        sys.a.apply_transpose(dy, &mut atdy);
    }
    sys.w
        .iter()
        .zip(&atdy)
        .zip(hinv)
        .map(|((w, t), h)| h * (w + t))
        .collect()
}

/// diag(A H⁻¹ Aᵀ + D2²)
fn normal_diagonal(a: &SparseCsc, hinv: &[f64], d2sq: &[f64]) -> Vec<f64> {
    let mut d = d2sq.to_vec();
    for (&v, (i, j)) in a.iter() {
        d[i] += v * v * hinv[j];
    }
    d
}

/// S = A H⁻¹ Aᵀ + D2² applied matrix-free.
pub struct NormalOperator<'a> {
    pub a: &'a ConstraintOperator,
    pub hinv: &'a [f64],
    pub d2sq: &'a [f64],
}

impl LinearOperator for NormalOperator<'_> {
    fn nrows(&self) -> usize {
        self.d2sq.len()
    }

    fn ncols(&self) -> usize {
        self.d2sq.len()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let mut t = vec![0.0; self.hinv.len()];
        self.a.apply_transpose(x, &mut t);
        for (ti, hi) in t.iter_mut().zip(self.hinv) {
            *ti *= hi;
        }
        self.a.apply(&t, y);
        for ((yi, xi), d) in y.iter_mut().zip(x).zip(self.d2sq) {
            *yi += d * xi;
        }
    }
}

/// M = [H^{-½} Aᵀ; D2] C, (n+m) x m, with optional column scaling C.
pub struct LeastSquaresOperator<'a> {
    pub a: &'a ConstraintOperator,
    /// H^{-½}, zero on fixed variables
    pub hhalf: Vec<f64>,
    /// D2
    pub d2: Vec<f64>,
    pub colscale: Option<Vec<f64>>,
}

impl LeastSquaresOperator<'_> {
    fn scaled(&self, v: &[f64]) -> Vec<f64> {
        match &self.colscale {
            Some(c) => v.iter().zip(c).map(|(a, b)| a * b).collect(),
            None => v.to_vec(),
        }
    }
}

impl LinearOperator for LeastSquaresOperator<'_> {
    fn nrows(&self) -> usize {
        self.hhalf.len() + self.d2.len()
    }

    fn ncols(&self) -> usize {
        self.d2.len()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let n = self.hhalf.len();
        let v = self.scaled(x);
        let (top, bottom) = y.split_at_mut(n);
        self.a.apply_transpose(&v, top);
        for (t, h) in top.iter_mut().zip(&self.hhalf) {
            *t *= h;
        }
        for ((b, vi), d) in bottom.iter_mut().zip(&v).zip(&self.d2) {
            *b = d * vi;
        }
    }

    fn apply_transpose(&self, y: &[f64], x: &mut [f64]) {
        let n = self.hhalf.len();
        let (top, bottom) = y.split_at(n);
        let ht: Vec<f64> = top.iter().zip(&self.hhalf).map(|(a, b)| a * b).collect();
        self.a.apply(&ht, x);
        for ((xi, bi), d) in x.iter_mut().zip(bottom).zip(&self.d2) {
            *xi += d * bi;
        }
        if let Some(c) = &self.colscale {
            for (xi, ci) in x.iter_mut().zip(c) {
                *xi *= ci;
            }
        }
    }
}

impl NewtonSolver {
    pub(super) fn solve_cholesky(&mut self, sys: &NewtonSystem) -> SolverResult<Direction> {
        let hinv = inverse_h(sys)?;
        if sys.m() == 0 {
            return Ok(Direction::direct(recover_dx(sys, &hinv, &[]), Vec::new()));
        }
        let a = explicit_a(&mut self.a_explicit, sys);
        let blocks = SqdBlocks::new(sparse::identity(sys.n()), a.clone(), sys.d2sq.to_vec());
        let s = blocks.schur_with_diagonal(&hinv);

        let ldl = self
            .normal_ldl
            .get_or_insert_with(|| LdlSolver::new(sys.m(), PivotPolicy::PositiveDefinite));
        ldl.factor(&s).map_err(|e| SolverError::IndefiniteSystem {
            iter: sys.iter,
            detail: format!("normal equations: {}", e),
        })?;
        let dy = ldl.solve(&normal_rhs(sys, &hinv))?;
        let dx = recover_dx(sys, &hinv, &dy);
        Ok(Direction::direct(dx, dy))
    }

    pub(super) fn solve_qr(&mut self, sys: &NewtonSystem) -> SolverResult<Direction> {
        let hinv = inverse_h(sys)?;
        let (n, m) = (sys.n(), sys.m());
        if m == 0 {
            return Ok(Direction::direct(recover_dx(sys, &hinv, &[]), Vec::new()));
        }
        let a = explicit_a(&mut self.a_explicit, sys);

        // M = [H^{-½} Aᵀ; D2], column i holds row i of A
        let hhalf: Vec<f64> = hinv.iter().map(|h| h.sqrt()).collect();
        let d2: Vec<f64> = sys.d2sq.iter().map(|d| d.sqrt()).collect();
        let mat = sparse::from_triplets(
            n + m,
            m,
            a.iter()
                .map(|(&v, (i, j))| (j, i, hhalf[j] * v))
                .chain(d2.iter().enumerate().map(|(i, &d)| (n + i, i, d))),
        );
        let mut t = vec![0.0; n + m];
        for j in 0..n {
            t[j] = -hhalf[j] * sys.w[j];
        }
        for i in 0..m {
            t[n + i] = sys.r1[i] / d2[i];
        }

        let dy = self
            .qr
            .solve_least_squares(&mat, &t)
            .map_err(|e| SolverError::IndefiniteSystem {
                iter: sys.iter,
                detail: format!("sparse QR: {}", e),
            })?;
        let dx = recover_dx(sys, &hinv, &dy);
        Ok(Direction::direct(dx, dy))
    }

    pub(super) fn solve_lsmr(&mut self, sys: &NewtonSystem) -> SolverResult<Direction> {
        let hinv = inverse_h(sys)?;
        let (n, m) = (sys.n(), sys.m());
        if m == 0 {
            return Ok(Direction::direct(recover_dx(sys, &hinv, &[]), Vec::new()));
        }
        let colscale = if self.diag_precond {
            let a = explicit_a(&mut self.a_explicit, sys);
            let d = normal_diagonal(a, &hinv, sys.d2sq);
            Some(d.iter().map(|v| if *v > 0.0 { 1.0 / v.sqrt() } else { 1.0 }).collect::<Vec<f64>>())
        } else {
            None
        };
        let op = LeastSquaresOperator {
            a: sys.a,
            hhalf: hinv.iter().map(|h| h.sqrt()).collect(),
            d2: sys.d2sq.iter().map(|d| d.sqrt()).collect(),
            colscale,
        };
        let mut t = vec![0.0; n + m];
        for j in 0..n {
            t[j] = -op.hhalf[j] * sys.w[j];
        }
        for i in 0..m {
            t[n + i] = sys.r1[i] / op.d2[i];
        }

        let opts = KrylovOptions {
            tol: sys.inner_tol,
            max_iter: self.max_inner(n.min(m)),
            restart: 0,
        };
        let out = lsmr(&op, &t, &opts);
        debug!("LSMR: {} in {} iterations", out.status, out.iters);
        let dy = op.scaled(&out.x);
        let dx = recover_dx(sys, &hinv, &dy);
        let mut dir = Direction::direct(dx, dy);
        dir.inner = Some(InnerSolve {
            method: "LSMR",
            preconditioner: if op.colscale.is_some() { "column-scaling" } else { "identity" },
            tol: opts.tol,
            max_iter: opts.max_iter,
            iters: out.iters,
            rel_resid: out.rel_resid,
            status: out.status,
        });
        Ok(dir)
    }

    pub(super) fn solve_normal_krylov(&mut self, sys: &NewtonSystem, method: KrylovMethod) -> SolverResult<Direction> {
        let hinv = inverse_h(sys)?;
        let m = sys.m();
        if m == 0 {
            return Ok(Direction::direct(recover_dx(sys, &hinv, &[]), Vec::new()));
        }
        let pc: Box<dyn PrecondApply> = if self.diag_precond {
            let a = explicit_a(&mut self.a_explicit, sys);
            Box::new(JacobiPrecond::new(&normal_diagonal(a, &hinv, sys.d2sq)))
        } else {
            Box::new(IdentityPrecond)
        };
        let op = NormalOperator {
            a: sys.a,
            hinv: &hinv,
            d2sq: sys.d2sq,
        };
        let opts = KrylovOptions {
            tol: sys.inner_tol,
            max_iter: self.max_inner(m),
            restart: self.gmres_restart,
        };
        let out = krylov::solve(method, &op, &normal_rhs(sys, &hinv), pc.as_ref(), &opts);
        debug!("{} on normal equations: {} in {} iterations", method, out.status, out.iters);

        let dx = recover_dx(sys, &hinv, &out.x);
        let mut dir = Direction::direct(dx, out.x);
        dir.inner = Some(InnerSolve {
            method: method.name(),
            preconditioner: if self.diag_precond { "jacobi" } else { "identity" },
            tol: opts.tol,
            max_iter: opts.max_iter,
            iters: out.iters,
            rel_resid: out.rel_resid,
            status: out.status,
        });
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::objective::Curvature;

    #[test]
    fn test_least_squares_operator_adjoint() {
        let fx = Fixture::small(Curvature::zeros(4));
        let op = LeastSquaresOperator {
            a: &fx.a,
            hhalf: vec![1.0, 0.5, 2.0, 0.0],
            d2: vec![0.1, 0.2],
            colscale: Some(vec![2.0, 0.5]),
        };
        let x = vec![1.0, -2.0];
        let y = vec![0.5, 1.0, -1.0, 3.0, 2.0, -0.5];
        let mut mx = vec![0.0; 6];
        op.apply(&x, &mut mx);
        let mut mty = vec![0.0; 2];
        op.apply_transpose(&y, &mut mty);
        let lhs: f64 = mx.iter().zip(&y).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(&mty).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-12);
    }

    #[test]
    fn test_normal_operator_is_mtm() {
        let fx = Fixture::small(Curvature::zeros(4));
        let hinv = vec![0.25, 1.0, 4.0, 0.0];
        let ls = LeastSquaresOperator {
            a: &fx.a,
            hhalf: hinv.iter().map(|h: &f64| h.sqrt()).collect(),
            d2: fx.d2sq.iter().map(|d| d.sqrt()).collect(),
            colscale: None,
        };
        let normal = NormalOperator {
            a: &fx.a,
            hinv: &hinv,
            d2sq: &fx.d2sq,
        };
        let x = vec![0.7, -1.3];
        let mut mx = vec![0.0; 6];
        ls.apply(&x, &mut mx);
        let mut mtmx = vec![0.0; 2];
        ls.apply_transpose(&mx, &mut mtmx);
        let mut sx = vec![0.0; 2];
        normal.apply(&x, &mut sx);
        for i in 0..2 {
            assert!((mtmx[i] - sx[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_unconstrained_step_is_newton_step() {
        let mut fx = Fixture::small(Curvature::Diagonal(vec![1.0; 4]));
        fx.a = ConstraintOperator::Explicit(sparse::from_triplets(0, 4, Vec::<(usize, usize, f64)>::new()));
        fx.d2sq.clear();
        fx.r1.clear();
        let mut solver = NewtonSolver::new(&crate::problem::SolverSettings::default());
        let dir = solver.solve(&fx.system(1e-8)).unwrap();
        assert!(dir.dy.is_empty());
        assert!((dir.dx[0] - 1.0 / 2.5).abs() < 1e-14);
        assert_eq!(dir.dx[3], 0.0);
    }
}
