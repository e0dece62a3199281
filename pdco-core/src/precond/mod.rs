//! Preconditioner factory for the negated SQD Newton matrix
//!
//! ```text
//!     -K = [  H   -Aᵀ   ]
//!          [ -A   -D2²  ]
//! ```
//!
//! Seven constructions, selected by [`PreconditionerKind`]. Block-diagonal
//! variants (everything except `IncompleteLu` and `Constraint`) are SPD and
//! can be paired with MINRES/SYMMLQ; the other two are indefinite or
//! nonsymmetric and are meant for GMRES, DQGMRES, BiCGStab and TFQMR.

pub mod incomplete;

use std::fmt;

use log::debug;

use crate::error::{SolverError, SolverResult};
use crate::krylov::{IdentityPrecond, PrecondApply};
use crate::linalg::ldl::{LdlSolver, PivotPolicy};
use crate::linalg::operator::SqdBlocks;
use crate::linalg::sparse::{self, SparseCsc, SparseTriMat};

pub use incomplete::{IncompleteCholesky, IncompleteLu};

/// Drop tolerance of the threshold ILU.
const ILU_DROPTOL: f64 = 1e-4;

/// Preconditioner selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreconditionerKind {
    AugmentedLagrangian,
    IncompleteCholesky,
    IncompleteLu,
    Constraint,
    DiagonalSchur,
    DiagonalIncompleteSchur,
    DiagonalJacobiSchur,
}

impl PreconditionerKind {
    pub const ALL: [PreconditionerKind; 7] = [
        PreconditionerKind::AugmentedLagrangian,
        PreconditionerKind::IncompleteCholesky,
        PreconditionerKind::IncompleteLu,
        PreconditionerKind::Constraint,
        PreconditionerKind::DiagonalSchur,
        PreconditionerKind::DiagonalIncompleteSchur,
        PreconditionerKind::DiagonalJacobiSchur,
    ];

    /// Integer selector (1-7).
    pub fn from_code(code: u32) -> SolverResult<Self> {
        match code {
            1..=7 => Ok(Self::ALL[code as usize - 1]),
            _ => Err(SolverError::Configuration(format!(
                "unknown preconditioner code {} (expected 1-7)",
                code
            ))),
        }
    }

    pub fn code(self) -> u32 {
        Self::ALL.iter().position(|&k| k == self).map_or(0, |p| p as u32 + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            PreconditionerKind::AugmentedLagrangian => "augmented-lagrangian",
            PreconditionerKind::IncompleteCholesky => "incomplete-cholesky",
            PreconditionerKind::IncompleteLu => "incomplete-lu",
            PreconditionerKind::Constraint => "constraint",
            PreconditionerKind::DiagonalSchur => "diagonal-schur",
            PreconditionerKind::DiagonalIncompleteSchur => "diagonal-incomplete-schur",
            PreconditionerKind::DiagonalJacobiSchur => "diagonal-jacobi-schur",
        }
    }

    /// Symmetric positive definite, hence usable with MINRES/SYMMLQ.
    pub fn is_spd(self) -> bool {
        !matches!(self, PreconditionerKind::IncompleteLu | PreconditionerKind::Constraint)
    }
}

impl fmt::Display for PreconditionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A preconditioner that could not be used, and what replaced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackNote {
    pub from: &'static str,
    pub to: &'static str,
    pub reason: String,
}

/// One diagonal block of a block-diagonal preconditioner.
#[derive(Debug)]
pub enum BlockSolve {
    /// z = r ./ d (stores 1/d)
    Diagonal(Vec<f64>),
    /// Exact sparse factor
    Ldl(LdlSolver),
    /// IC(0)
    Incomplete(IncompleteCholesky),
}

impl BlockSolve {
    fn diagonal_inverse(d: &[f64]) -> Self {
        BlockSolve::Diagonal(d.iter().map(|v| 1.0 / v).collect())
    }

    pub fn dim(&self) -> usize {
        match self {
            BlockSolve::Diagonal(d) => d.len(),
            BlockSolve::Ldl(f) => f.dim(),
            BlockSolve::Incomplete(ic) => ic.dim(),
        }
    }

    fn apply(&self, r: &[f64], z: &mut [f64]) {
        match self {
            BlockSolve::Diagonal(inv) => {
                for ((zi, ri), di) in z.iter_mut().zip(r).zip(inv) {
                    *zi = ri * di;
                }
            }
            BlockSolve::Ldl(f) => ldl_apply(f, r, z),
            BlockSolve::Incomplete(ic) => ic.apply(r, z),
        }
    }
}

/// Built preconditioner, one variant per construction.
#[derive(Debug)]
pub enum Preconditioner {
    Identity,
    AugmentedLagrangian { primal: BlockSolve, dual: BlockSolve },
    IncompleteCholesky { primal: BlockSolve, dual: BlockSolve },
    IncompleteLu(IncompleteLu),
    Constraint(LdlSolver),
    DiagonalSchur { primal: BlockSolve, dual: BlockSolve },
    DiagonalIncompleteSchur { primal: BlockSolve, dual: BlockSolve },
    DiagonalJacobiSchur { primal: BlockSolve, dual: BlockSolve },
}

impl Preconditioner {
    pub fn name(&self) -> &'static str {
        match self {
            Preconditioner::Identity => "identity",
            Preconditioner::AugmentedLagrangian { .. } => PreconditionerKind::AugmentedLagrangian.name(),
            Preconditioner::IncompleteCholesky { .. } => PreconditionerKind::IncompleteCholesky.name(),
            Preconditioner::IncompleteLu(_) => PreconditionerKind::IncompleteLu.name(),
            Preconditioner::Constraint(_) => PreconditionerKind::Constraint.name(),
            Preconditioner::DiagonalSchur { .. } => PreconditionerKind::DiagonalSchur.name(),
            Preconditioner::DiagonalIncompleteSchur { .. } => PreconditionerKind::DiagonalIncompleteSchur.name(),
            Preconditioner::DiagonalJacobiSchur { .. } => PreconditionerKind::DiagonalJacobiSchur.name(),
        }
    }
}

impl PrecondApply for Preconditioner {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        match self {
            Preconditioner::Identity => IdentityPrecond.apply(r, z),
            Preconditioner::IncompleteLu(ilu) => ilu.apply(r, z),
            Preconditioner::Constraint(f) => ldl_apply(f, r, z),
            Preconditioner::AugmentedLagrangian { primal, dual }
            | Preconditioner::IncompleteCholesky { primal, dual }
            | Preconditioner::DiagonalSchur { primal, dual }
            | Preconditioner::DiagonalIncompleteSchur { primal, dual }
            | Preconditioner::DiagonalJacobiSchur { primal, dual } => {
                let n = primal.dim();
                let (rx, ry) = r.split_at(n);
                let (zx, zy) = z.split_at_mut(n);
                primal.apply(rx, zx);
                dual.apply(ry, zy);
            }
        }
    }
}

/// Factor solve, identity on failure.
fn ldl_apply(f: &LdlSolver, r: &[f64], z: &mut [f64]) {
    match f.solve(r) {
        Ok(sol) => z.copy_from_slice(&sol),
        Err(e) => {
            debug!("preconditioner solve failed ({}), applying identity", e);
            z.copy_from_slice(r);
        }
    }
}

fn build_err(kind: PreconditionerKind, detail: impl Into<String>) -> SolverError {
    SolverError::PreconditionerBuild {
        kind: kind.name(),
        detail: detail.into(),
    }
}

/// diag(H), required strictly positive.
fn positive_h_diag(blocks: &SqdBlocks, kind: PreconditionerKind) -> SolverResult<Vec<f64>> {
    let d = blocks.h_diag();
    if let Some(j) = d.iter().position(|&v| !(v > 0.0) || !v.is_finite()) {
        return Err(build_err(kind, format!("diag(H)[{}] = {:.3e} is not positive", j, d[j])));
    }
    Ok(d)
}

/// S = D2² + A diag(H)⁻¹ Aᵀ
fn diagonal_schur(blocks: &SqdBlocks, hdiag: &[f64]) -> SparseCsc {
    let hinv: Vec<f64> = hdiag.iter().map(|v| 1.0 / v).collect();
    blocks.schur_with_diagonal(&hinv)
}

fn factor_block(mat: &SparseCsc, kind: PreconditionerKind) -> SolverResult<LdlSolver> {
    let mut f = LdlSolver::new(mat.rows(), PivotPolicy::PositiveDefinite);
    f.factor(mat).map_err(|e| build_err(kind, e.to_string()))?;
    Ok(f)
}

/// Build the preconditioner `kind` for `blocks`.
pub fn build(kind: PreconditionerKind, blocks: &SqdBlocks) -> SolverResult<Preconditioner> {
    match kind {
        PreconditionerKind::AugmentedLagrangian => {
            let hnorm = sparse::frobenius_norm(&blocks.h);
            let anorm_sq = sparse::frobenius_norm(&blocks.a).powi(2);
            let gamma = hnorm / anorm_sq.max(f64::EPSILON);
            if !(gamma > 0.0) || !gamma.is_finite() {
                return Err(build_err(kind, format!("augmentation weight γ = {:.3e}", gamma)));
            }

            // W = D2² + I/γ, primal block H + Aᵀ W⁻¹ A
            let w: Vec<f64> = blocks.d2sq.iter().map(|d| d + 1.0 / gamma).collect();
            let n = blocks.n();
            let mut tri = SparseTriMat::new((n, n));
            for (&v, (i, j)) in blocks.h.iter() {
                tri.add_triplet(i, j, v);
            }
            let at = sparse::transpose(&blocks.a);
            // Column i of Aᵀ is row i of A: contributes a_i a_iᵀ / w_i
            for (i, row) in at.outer_iterator().enumerate() {
                let wi = 1.0 / w[i];
                for (j1, &v1) in row.iter() {
                    for (j2, &v2) in row.iter() {
                        tri.add_triplet(j1, j2, wi * v1 * v2);
                    }
                }
            }
            let primal = factor_block(&tri.to_csc(), kind)?;
            Ok(Preconditioner::AugmentedLagrangian {
                primal: BlockSolve::Ldl(primal),
                dual: BlockSolve::diagonal_inverse(&w),
            })
        }
        PreconditionerKind::IncompleteCholesky => {
            let hdiag = positive_h_diag(blocks, kind)?;
            let primal = factor_block(&blocks.h, kind)?;
            let s = diagonal_schur(blocks, &hdiag);
            let ic = IncompleteCholesky::factor(&s).map_err(|e| build_err(kind, e))?;
            Ok(Preconditioner::IncompleteCholesky {
                primal: BlockSolve::Ldl(primal),
                dual: BlockSolve::Incomplete(ic),
            })
        }
        PreconditionerKind::IncompleteLu => {
            let k = blocks.assemble(true);
            let ilu = IncompleteLu::factor(&k, ILU_DROPTOL).map_err(|e| build_err(kind, e))?;
            Ok(Preconditioner::IncompleteLu(ilu))
        }
        PreconditionerKind::Constraint => {
            positive_h_diag(blocks, kind)?;
            let c = blocks.assemble_diagonal_h(true);
            let mut f = LdlSolver::new(c.rows(), PivotPolicy::QuasiDefinite);
            f.factor(&c).map_err(|e| build_err(kind, e.to_string()))?;
            Ok(Preconditioner::Constraint(f))
        }
        PreconditionerKind::DiagonalSchur => {
            let hdiag = positive_h_diag(blocks, kind)?;
            let s = diagonal_schur(blocks, &hdiag);
            let schur = factor_block(&s, kind)?;
            Ok(Preconditioner::DiagonalSchur {
                primal: BlockSolve::diagonal_inverse(&hdiag),
                dual: BlockSolve::Ldl(schur),
            })
        }
        PreconditionerKind::DiagonalIncompleteSchur => {
            let hdiag = positive_h_diag(blocks, kind)?;
            let s = diagonal_schur(blocks, &hdiag);
            let dual = match IncompleteCholesky::factor(&s) {
                Ok(ic) => BlockSolve::Incomplete(ic),
                Err(e) => {
                    debug!("IC(0) of the Schur complement failed ({}), using diag(S)", e);
                    // Rows with no usable diagonal pass through unscaled
                    let sdiag: Vec<f64> = sparse::diag_of(&s)
                        .into_iter()
                        .map(|v| if v > 0.0 && v.is_finite() { v } else { 1.0 })
                        .collect();
                    BlockSolve::diagonal_inverse(&sdiag)
                }
            };
            Ok(Preconditioner::DiagonalIncompleteSchur {
                primal: BlockSolve::diagonal_inverse(&hdiag),
                dual,
            })
        }
        PreconditionerKind::DiagonalJacobiSchur => {
            let hdiag = positive_h_diag(blocks, kind)?;
            let sdiag = schur_diagonal(blocks, &hdiag);
            if let Some(i) = sdiag.iter().position(|&v| !(v > 0.0)) {
                return Err(build_err(kind, format!("diag(S)[{}] is not positive", i)));
            }
            Ok(Preconditioner::DiagonalJacobiSchur {
                primal: BlockSolve::diagonal_inverse(&hdiag),
                dual: BlockSolve::diagonal_inverse(&sdiag),
            })
        }
    }
}

/// diag(D2² + A diag(H)⁻¹ Aᵀ) without forming S.
pub fn schur_diagonal(blocks: &SqdBlocks, hdiag: &[f64]) -> Vec<f64> {
    let mut d = blocks.d2sq.clone();
    for (&v, (i, j)) in blocks.a.iter() {
        d[i] += v * v / hdiag[j];
    }
    d
}

/// Build `kind`, falling back to `DiagonalJacobiSchur` and then the
/// identity. Every skipped entry is reported.
pub fn build_with_fallback(
    kind: PreconditionerKind,
    blocks: &SqdBlocks,
) -> (Preconditioner, Vec<FallbackNote>) {
    let mut notes = Vec::new();
    let mut chain = vec![kind];
    if kind != PreconditionerKind::DiagonalJacobiSchur {
        chain.push(PreconditionerKind::DiagonalJacobiSchur);
    }

    for (pos, &k) in chain.iter().enumerate() {
        match build(k, blocks) {
            Ok(p) => return (p, notes),
            Err(e) => {
                let to = chain.get(pos + 1).map_or("identity", |next| next.name());
                notes.push(FallbackNote {
                    from: k.name(),
                    to,
                    reason: e.to_string(),
                });
            }
        }
    }
    (Preconditioner::Identity, notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::operator::{LinearOperator, SqdOperator};

    fn blocks() -> SqdBlocks {
        let h = sparse::from_triplets(3, 3, vec![(0, 0, 4.0), (1, 1, 2.0), (2, 2, 3.0), (0, 1, 0.5), (1, 0, 0.5)]);
        let a = sparse::from_triplets(2, 3, vec![(0, 0, 1.0), (0, 1, 1.0), (1, 1, -1.0), (1, 2, 2.0)]);
        SqdBlocks::new(h, a, vec![0.1, 0.2])
    }

    #[test]
    fn test_kind_codes() {
        for code in 1..=7 {
            assert_eq!(PreconditionerKind::from_code(code).unwrap().code(), code);
        }
        assert!(PreconditionerKind::from_code(8).is_err());
    }

    #[test]
    fn test_every_kind_builds_and_is_finite() {
        let b = blocks();
        let r = vec![1.0, -2.0, 0.5, 1.0, 3.0];
        for &kind in PreconditionerKind::ALL.iter() {
            let pc = build(kind, &b).unwrap_or_else(|e| panic!("{}: {}", kind, e));
            let mut z = vec![0.0; 5];
            pc.apply(&r, &mut z);
            assert!(z.iter().all(|v| v.is_finite()), "{}", kind);
            assert!(z.iter().any(|&v| v != 0.0), "{}", kind);
        }
    }

    #[test]
    fn test_constraint_is_exact_for_diagonal_h() {
        // With diagonal H the constraint preconditioner is the exact inverse of -K.
        let h = sparse::diagonal(&[4.0, 2.0, 3.0]);
        let a = sparse::from_triplets(2, 3, vec![(0, 0, 1.0), (0, 1, 1.0), (1, 1, -1.0), (1, 2, 2.0)]);
        let b = SqdBlocks::new(h, a, vec![0.1, 0.2]);
        let op = SqdOperator { blocks: &b, negated: true };

        let x_true = vec![1.0, 2.0, -1.0, 0.5, 0.25];
        let mut rhs = vec![0.0; 5];
        op.apply(&x_true, &mut rhs);

        let pc = build(PreconditionerKind::Constraint, &b).unwrap();
        let mut z = vec![0.0; 5];
        pc.apply(&rhs, &mut z);
        for i in 0..5 {
            assert!((z[i] - x_true[i]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_spd_block_preconditioners_are_positive() {
        let b = blocks();
        let r = vec![1.0, -1.0, 2.0, -0.5, 0.3];
        for &kind in PreconditionerKind::ALL.iter().filter(|k| k.is_spd()) {
            let pc = build(kind, &b).unwrap();
            let mut z = vec![0.0; 5];
            pc.apply(&r, &mut z);
            let rz: f64 = r.iter().zip(&z).map(|(a, b)| a * b).sum();
            assert!(rz > 0.0, "{}: rᵀz = {}", kind, rz);
        }
    }

    #[test]
    fn test_incomplete_schur_falls_back_to_diagonal() {
        let b = blocks();
        let pc = build(PreconditionerKind::DiagonalIncompleteSchur, &b).unwrap();
        assert!(matches!(
            pc,
            Preconditioner::DiagonalIncompleteSchur { dual: BlockSolve::Incomplete(_), .. }
        ));

        // Row 0 of A is empty and its D2² is zero, so S has a zero diagonal
        let h = sparse::diagonal(&[1.0, 1.0]);
        let a = sparse::from_triplets(2, 2, vec![(1, 0, 1.0), (1, 1, 1.0)]);
        let b = SqdBlocks::new(h, a, vec![0.0, 0.5]);
        let pc = build(PreconditionerKind::DiagonalIncompleteSchur, &b).unwrap();
        assert!(matches!(
            pc,
            Preconditioner::DiagonalIncompleteSchur { dual: BlockSolve::Diagonal(_), .. }
        ));
        let mut z = vec![0.0; 4];
        pc.apply(&[1.0, 1.0, 1.0, 1.0], &mut z);
        assert_eq!(z[..3], [1.0, 1.0, 1.0]);
        assert!((z[3] - 0.4).abs() < 1e-15);
    }

    #[test]
    fn test_fallback_on_nonpositive_h() {
        let h = sparse::diagonal(&[1.0, -1.0]);
        let a = sparse::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
        let b = SqdBlocks::new(h, a, vec![1.0]);
        let (pc, notes) = build_with_fallback(PreconditionerKind::DiagonalSchur, &b);
        assert!(matches!(pc, Preconditioner::Identity));
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].to, "diagonal-jacobi-schur");
        assert_eq!(notes[1].to, "identity");
    }
}
