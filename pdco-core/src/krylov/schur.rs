//! Krylov solves of the SQD Newton system
//!
//! ```text
//!     [ -H   Aᵀ  ] [dx]   [f]
//!     [  A  D2²  ] [dy] = [g]
//! ```
//!
//! Most methods run on the negated matrix, which is what the block
//! preconditioners approximate. The CG-based methods need an SPD system and
//! reduce first:
//!
//! - `Pcg`: dual Schur complement S dy = g + A H⁻¹ f with S = A H⁻¹ Aᵀ + D2²
//!   applied matrix-free; preconditioner chain IC(S̃) → Jacobi(S̃) → identity
//!   where S̃ uses diag(H).
//! - `SchurCg`: the same system with S formed explicitly and preconditioned
//!   by its own IC(0).
//! - `ProjectedCg`: dy eliminated through the second block row, leaving
//!   (H + Aᵀ D2⁻² A) dx = Aᵀ D2⁻² g − f, preconditioned by the constraint
//!   preconditioner.

use log::debug;

use super::{solve, IdentityPrecond, JacobiPrecond, KrylovMethod, KrylovOptions, KrylovOutcome, PrecondApply};
use crate::error::{SolverError, SolverResult};
use crate::linalg::ldl::{LdlSolver, PivotPolicy};
use crate::linalg::operator::{LinearOperator, SqdBlocks, SqdOperator};
use crate::linalg::sparse::{self, SparseCsc, SparseTriMat};
use crate::linalg::vector;
use crate::precond::{self, FallbackNote, IncompleteCholesky, Preconditioner, PreconditionerKind};

/// Direction returned by a Krylov solve of the SQD system.
#[derive(Debug, Clone)]
pub struct SqdSolution {
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
    /// Outcome of the system the method actually iterated on
    pub outcome: KrylovOutcome,
    /// Preconditioner that produced `outcome`
    pub preconditioner: &'static str,
    /// Preconditioners skipped on the way
    pub notes: Vec<FallbackNote>,
}

/// Solve K [dx; dy] = rhs with `method`, K unnegated.
pub fn solve_sqd(
    method: KrylovMethod,
    blocks: &SqdBlocks,
    rhs: &[f64],
    pc_kind: PreconditionerKind,
    opts: &KrylovOptions,
) -> SolverResult<SqdSolution> {
    if rhs.len() != blocks.dim() {
        return Err(SolverError::Configuration(format!(
            "SQD right-hand side has length {}, system dimension is {}",
            rhs.len(),
            blocks.dim()
        )));
    }
    let (f, g) = rhs.split_at(blocks.n());
    match method {
        KrylovMethod::Pcg => dual_schur_pcg(blocks, f, g, opts),
        KrylovMethod::SchurCg => explicit_schur_cg(blocks, f, g, opts),
        KrylovMethod::ProjectedCg => projected_cg(blocks, f, g, opts),
        _ => negated_sqd(method, blocks, rhs, pc_kind, opts),
    }
}

fn needs_spd_preconditioner(method: KrylovMethod) -> bool {
    matches!(
        method,
        KrylovMethod::Minres | KrylovMethod::MinresReference | KrylovMethod::MinresVendor | KrylovMethod::Symmlq
    )
}

fn negated_sqd(
    method: KrylovMethod,
    blocks: &SqdBlocks,
    rhs: &[f64],
    pc_kind: PreconditionerKind,
    opts: &KrylovOptions,
) -> SolverResult<SqdSolution> {
    let mut notes = Vec::new();
    let mut kind = pc_kind;
    if needs_spd_preconditioner(method) && !kind.is_spd() {
        notes.push(FallbackNote {
            from: kind.name(),
            to: PreconditionerKind::DiagonalJacobiSchur.name(),
            reason: format!("{} requires a symmetric positive definite preconditioner", method),
        });
        kind = PreconditionerKind::DiagonalJacobiSchur;
    }
    let (pc, fallback) = precond::build_with_fallback(kind, blocks);
    notes.extend(fallback);

    let op = SqdOperator { blocks, negated: true };
    let neg_rhs: Vec<f64> = rhs.iter().map(|v| -v).collect();
    let outcome = solve(method, &op, &neg_rhs, &pc, opts);

    let n = blocks.n();
    let mut dx = outcome.x.clone();
    let dy = dx.split_off(n);
    Ok(SqdSolution {
        dx,
        dy,
        outcome,
        preconditioner: pc.name(),
        notes,
    })
}

/// H⁻¹ application for the Schur reductions.
enum HInverse {
    Diagonal(Vec<f64>),
    Factor(LdlSolver),
}

impl HInverse {
    fn new(h: &SparseCsc) -> SolverResult<Self> {
        if sparse::is_diagonal(h) {
            let d = sparse::diag_of(h);
            if let Some(j) = d.iter().position(|&v| !(v > 0.0) || !v.is_finite()) {
                return Err(SolverError::IndefiniteSystem {
                    iter: 0,
                    detail: format!("H[{}] = {:.3e} in dual Schur reduction", j, d[j]),
                });
            }
            return Ok(HInverse::Diagonal(d.iter().map(|v| 1.0 / v).collect()));
        }
        let mut f = LdlSolver::new(h.rows(), PivotPolicy::PositiveDefinite);
        f.factor(h).map_err(|e| SolverError::IndefiniteSystem {
            iter: 0,
            detail: format!("H in dual Schur reduction: {}", e),
        })?;
        Ok(HInverse::Factor(f))
    }

    fn solve(&self, r: &[f64]) -> Vec<f64> {
        match self {
            HInverse::Diagonal(inv) => r.iter().zip(inv).map(|(a, b)| a * b).collect(),
            HInverse::Factor(f) => f.solve(r).unwrap_or_else(|_| vec![f64::NAN; r.len()]),
        }
    }
}

/// S = A H⁻¹ Aᵀ + D2², matrix-free.
struct DualSchurOperator<'a> {
    blocks: &'a SqdBlocks,
    hinv: &'a HInverse,
}

impl LinearOperator for DualSchurOperator<'_> {
    fn nrows(&self) -> usize {
        self.blocks.m()
    }

    fn ncols(&self) -> usize {
        self.blocks.m()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let mut t = vec![0.0; self.blocks.n()];
        sparse::spmv_transpose(&self.blocks.a, x, &mut t, 1.0, 0.0);
        let u = self.hinv.solve(&t);
        sparse::spmv(&self.blocks.a, &u, y, 1.0, 0.0);
        for ((yi, xi), d) in y.iter_mut().zip(x).zip(&self.blocks.d2sq) {
            *yi += d * xi;
        }
    }
}

/// g + A H⁻¹ f
fn dual_rhs(blocks: &SqdBlocks, hinv: &HInverse, f: &[f64], g: &[f64]) -> Vec<f64> {
    let u = hinv.solve(f);
    let mut r = g.to_vec();
    sparse::spmv(&blocks.a, &u, &mut r, 1.0, 1.0);
    r
}

/// dx = H⁻¹(Aᵀ dy − f)
fn recover_dx(blocks: &SqdBlocks, hinv: &HInverse, f: &[f64], dy: &[f64]) -> Vec<f64> {
    let mut t: Vec<f64> = f.iter().map(|v| -v).collect();
    sparse::spmv_transpose(&blocks.a, dy, &mut t, 1.0, 1.0);
    hinv.solve(&t)
}

/// Smaller relative residual wins; NaN never does.
fn better(candidate: &KrylovOutcome, best: &KrylovOutcome) -> bool {
    candidate.rel_resid.is_finite() && !(candidate.rel_resid >= best.rel_resid)
}

const PCG_CHAIN: [&str; 3] = ["incomplete-cholesky", "jacobi", "identity"];

fn dual_schur_pcg(blocks: &SqdBlocks, f: &[f64], g: &[f64], opts: &KrylovOptions) -> SolverResult<SqdSolution> {
    let hinv = HInverse::new(&blocks.h)?;
    let op = DualSchurOperator { blocks, hinv: &hinv };
    let rhs = dual_rhs(blocks, &hinv, f, g);

    let hdiag_inv: Vec<f64> = blocks.h_diag().iter().map(|v| 1.0 / v).collect();
    let s_tilde = blocks.schur_with_diagonal(&hdiag_inv);

    let mut notes = Vec::new();
    let mut best: Option<(KrylovOutcome, &'static str)> = None;
    for (pos, &name) in PCG_CHAIN.iter().enumerate() {
        let pc: Box<dyn PrecondApply> = match pos {
            0 => match IncompleteCholesky::factor(&s_tilde) {
                Ok(ic) => Box::new(ic),
                Err(e) => {
                    notes.push(FallbackNote {
                        from: name,
                        to: PCG_CHAIN[pos + 1],
                        reason: e,
                    });
                    continue;
                }
            },
            1 => Box::new(JacobiPrecond::new(&sparse::diag_of(&s_tilde))),
            _ => Box::new(IdentityPrecond),
        };

        let out = solve(KrylovMethod::Pcg, &op, &rhs, pc.as_ref(), opts);
        debug!(
            "dual Schur PCG with {}: {} in {} iterations (rel. residual {:.2e})",
            name, out.status, out.iters, out.rel_resid
        );
        let converged = out.status.is_converged();
        if !converged {
            if let Some(&next) = PCG_CHAIN.get(pos + 1) {
                notes.push(FallbackNote {
                    from: name,
                    to: next,
                    reason: format!("{} after {} iterations", out.status, out.iters),
                });
            }
        }
        let replace = best.as_ref().map_or(true, |(b, _)| converged || better(&out, b));
        if replace {
            best = Some((out, name));
        }
        if converged {
            break;
        }
    }

    let (outcome, name) = best.ok_or_else(|| SolverError::PreconditionerBuild {
        kind: "dual-schur-chain",
        detail: "no preconditioner could be built".to_string(),
    })?;
    let dx = recover_dx(blocks, &hinv, f, &outcome.x);
    Ok(SqdSolution {
        dx,
        dy: outcome.x.clone(),
        outcome,
        preconditioner: name,
        notes,
    })
}

/// S = A H⁻¹ Aᵀ + D2² as a sparse matrix.
fn explicit_schur(blocks: &SqdBlocks, hinv: &HInverse) -> SparseCsc {
    if let HInverse::Diagonal(inv) = hinv {
        return blocks.schur_with_diagonal(inv);
    }
    // One H solve per column of Aᵀ
    let m = blocks.m();
    let n = blocks.n();
    let mut tri = SparseTriMat::new((m, m));
    let mut e = vec![0.0; m];
    let mut t = vec![0.0; n];
    let mut col = vec![0.0; m];
    for j in 0..m {
        e[j] = 1.0;
        sparse::spmv_transpose(&blocks.a, &e, &mut t, 1.0, 0.0);
        e[j] = 0.0;
        let u = hinv.solve(&t);
        sparse::spmv(&blocks.a, &u, &mut col, 1.0, 0.0);
        col[j] += blocks.d2sq[j];
        for (i, &v) in col.iter().enumerate() {
            if v != 0.0 {
                tri.add_triplet(i, j, v);
            }
        }
    }
    tri.to_csc()
}

fn explicit_schur_cg(blocks: &SqdBlocks, f: &[f64], g: &[f64], opts: &KrylovOptions) -> SolverResult<SqdSolution> {
    let hinv = HInverse::new(&blocks.h)?;
    let s = explicit_schur(blocks, &hinv);
    let rhs = dual_rhs(blocks, &hinv, f, g);

    let mut notes = Vec::new();
    let (pc, name): (Box<dyn PrecondApply>, &'static str) = match IncompleteCholesky::factor(&s) {
        Ok(ic) => (Box::new(ic), "incomplete-cholesky"),
        Err(e) => {
            notes.push(FallbackNote {
                from: "incomplete-cholesky",
                to: "jacobi",
                reason: e,
            });
            (Box::new(JacobiPrecond::new(&sparse::diag_of(&s))), "jacobi")
        }
    };

    let outcome = solve(KrylovMethod::SchurCg, &s, &rhs, pc.as_ref(), opts);
    let dx = recover_dx(blocks, &hinv, f, &outcome.x);
    Ok(SqdSolution {
        dx,
        dy: outcome.x.clone(),
        outcome,
        preconditioner: name,
        notes,
    })
}

/// P = H + Aᵀ D2⁻² A, matrix-free.
struct PrimalSchurOperator<'a> {
    blocks: &'a SqdBlocks,
    d2inv: Vec<f64>,
}

impl LinearOperator for PrimalSchurOperator<'_> {
    fn nrows(&self) -> usize {
        self.blocks.n()
    }

    fn ncols(&self) -> usize {
        self.blocks.n()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let mut ax = vec![0.0; self.blocks.m()];
        sparse::spmv(&self.blocks.a, x, &mut ax, 1.0, 0.0);
        for (v, d) in ax.iter_mut().zip(&self.d2inv) {
            *v *= d;
        }
        sparse::spmv(&self.blocks.h, x, y, 1.0, 0.0);
        sparse::spmv_transpose(&self.blocks.a, &ax, y, 1.0, 1.0);
    }
}

/// x-part of the constraint preconditioner applied to [r; 0].
struct ProjectedConstraint {
    inner: Preconditioner,
    n: usize,
    m: usize,
}

impl PrecondApply for ProjectedConstraint {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        let mut full_r = r.to_vec();
        full_r.resize(self.n + self.m, 0.0);
        let mut full_z = vec![0.0; self.n + self.m];
        self.inner.apply(&full_r, &mut full_z);
        z.copy_from_slice(&full_z[..self.n]);
    }
}

fn projected_cg(blocks: &SqdBlocks, f: &[f64], g: &[f64], opts: &KrylovOptions) -> SolverResult<SqdSolution> {
    let n = blocks.n();
    let m = blocks.m();
    if let Some(i) = blocks.d2sq.iter().position(|&d| !(d > 0.0)) {
        return Err(SolverError::Configuration(format!(
            "projected CG needs D2 > 0 (D2²[{}] = {:.3e})",
            i, blocks.d2sq[i]
        )));
    }
    let d2inv: Vec<f64> = blocks.d2sq.iter().map(|d| 1.0 / d).collect();

    // Aᵀ D2⁻² g − f
    let scaled_g: Vec<f64> = g.iter().zip(&d2inv).map(|(a, b)| a * b).collect();
    let mut rhs: Vec<f64> = f.iter().map(|v| -v).collect();
    sparse::spmv_transpose(&blocks.a, &scaled_g, &mut rhs, 1.0, 1.0);

    let mut notes = Vec::new();
    let (pc, name): (Box<dyn PrecondApply>, &'static str) = match precond::build(PreconditionerKind::Constraint, blocks)
    {
        Ok(inner) => (Box::new(ProjectedConstraint { inner, n, m }), PreconditionerKind::Constraint.name()),
        Err(e) => {
            notes.push(FallbackNote {
                from: PreconditionerKind::Constraint.name(),
                to: "jacobi",
                reason: e.to_string(),
            });
            let mut d = blocks.h_diag();
            for (&v, (i, j)) in blocks.a.iter() {
                d[j] += v * v * d2inv[i];
            }
            (Box::new(JacobiPrecond::new(&d)), "jacobi")
        }
    };

    let op = PrimalSchurOperator { blocks, d2inv };
    let outcome = solve(KrylovMethod::ProjectedCg, &op, &rhs, pc.as_ref(), opts);

    // dy = D2⁻²(g − A dx)
    let mut dy = g.to_vec();
    sparse::spmv(&blocks.a, &outcome.x, &mut dy, -1.0, 1.0);
    for (v, d) in dy.iter_mut().zip(&op.d2inv) {
        *v *= d;
    }
    Ok(SqdSolution {
        dx: outcome.x.clone(),
        dy,
        outcome,
        preconditioner: name,
        notes,
    })
}

/// ‖rhs − K [dx; dy]‖ / ‖rhs‖ for the unnegated system.
pub fn sqd_relative_residual(blocks: &SqdBlocks, sol: &SqdSolution, rhs: &[f64]) -> f64 {
    let mut z = sol.dx.clone();
    z.extend_from_slice(&sol.dy);
    let op = SqdOperator { blocks, negated: false };
    let bnorm = vector::norm2(rhs);
    if bnorm == 0.0 {
        return 0.0;
    }
    super::residual_norm(&op, &z, rhs) / bnorm
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn blocks(diagonal_h: bool) -> SqdBlocks {
        let h = if diagonal_h {
            sparse::diagonal(&[4.0, 2.0, 3.0, 1.5])
        } else {
            sparse::from_triplets(
                4,
                4,
                vec![(0, 0, 4.0), (1, 1, 2.0), (2, 2, 3.0), (3, 3, 1.5), (0, 1, 0.5), (1, 0, 0.5), (2, 3, -0.25), (3, 2, -0.25)],
            )
        };
        let a = sparse::from_triplets(2, 4, vec![(0, 0, 1.0), (0, 1, 1.0), (0, 3, 0.5), (1, 1, -1.0), (1, 2, 2.0)]);
        SqdBlocks::new(h, a, vec![0.1, 0.2])
    }

    fn direct(blocks: &SqdBlocks, rhs: &[f64]) -> Vec<f64> {
        let k = sparse::to_dense(&blocks.assemble(false));
        k.lu().solve(&DVector::from_column_slice(rhs)).unwrap().iter().copied().collect()
    }

    fn check(method: KrylovMethod, kind: PreconditionerKind, diagonal_h: bool) {
        let b = blocks(diagonal_h);
        let rhs = vec![1.0, -0.5, 2.0, 0.25, 1.5, -1.0];
        let opts = KrylovOptions { tol: 1e-12, max_iter: 200, restart: 10 };
        let sol = solve_sqd(method, &b, &rhs, kind, &opts).unwrap();
        let exact = direct(&b, &rhs);
        let got: Vec<f64> = sol.dx.iter().chain(&sol.dy).copied().collect();
        for i in 0..exact.len() {
            assert!(
                (got[i] - exact[i]).abs() < 1e-7 * (1.0 + exact[i].abs()),
                "{} / {} (diag H: {}): component {} is {} vs {}",
                method,
                kind,
                diagonal_h,
                i,
                got[i],
                exact[i]
            );
        }
        assert!(sqd_relative_residual(&b, &sol, &rhs) < 1e-8);
    }

    #[test]
    fn test_symmetric_methods_match_direct_solve() {
        let methods = [
            KrylovMethod::Minres,
            KrylovMethod::Symmlq,
            KrylovMethod::MinresReference,
            KrylovMethod::MinresVendor,
            KrylovMethod::Gmres,
            KrylovMethod::Dqgmres,
        ];
        for diagonal_h in [true, false] {
            for method in methods {
                check(method, PreconditionerKind::DiagonalJacobiSchur, diagonal_h);
            }
        }
    }

    #[test]
    fn test_schur_reductions_match_direct_solve() {
        for diagonal_h in [true, false] {
            for method in [KrylovMethod::Pcg, KrylovMethod::SchurCg, KrylovMethod::ProjectedCg] {
                check(method, PreconditionerKind::DiagonalJacobiSchur, diagonal_h);
            }
        }
    }

    #[test]
    fn test_nonsymmetric_methods_with_ilu() {
        for method in [KrylovMethod::Bicgstab, KrylovMethod::Tfqmr, KrylovMethod::Gmres] {
            check(method, PreconditionerKind::IncompleteLu, false);
        }
    }

    #[test]
    fn test_every_spd_preconditioner_with_minres() {
        for &kind in PreconditionerKind::ALL.iter().filter(|k| k.is_spd()) {
            check(KrylovMethod::Minres, kind, false);
        }
    }

    #[test]
    fn test_minres_replaces_nonsymmetric_preconditioner() {
        let b = blocks(true);
        let rhs = vec![1.0; 6];
        let sol = solve_sqd(KrylovMethod::Minres, &b, &rhs, PreconditionerKind::IncompleteLu, &KrylovOptions::default())
            .unwrap();
        assert_eq!(sol.notes.len(), 1);
        assert_eq!(sol.notes[0].from, "incomplete-lu");
        assert_eq!(sol.preconditioner, "diagonal-jacobi-schur");
    }

    #[test]
    fn test_dual_schur_rejects_nonpositive_h() {
        let h = sparse::diagonal(&[1.0, 0.0]);
        let a = sparse::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
        let b = SqdBlocks::new(h, a, vec![1.0]);
        let err = solve_sqd(KrylovMethod::Pcg, &b, &[1.0, 1.0, 1.0], PreconditionerKind::DiagonalJacobiSchur, &KrylovOptions::default())
            .unwrap_err();
        assert!(matches!(err, SolverError::IndefiniteSystem { .. }));
    }

    #[test]
    fn test_rhs_length_checked() {
        let b = blocks(true);
        assert!(solve_sqd(KrylovMethod::Minres, &b, &[1.0; 3], PreconditionerKind::DiagonalJacobiSchur, &KrylovOptions::default()).is_err());
    }
}
