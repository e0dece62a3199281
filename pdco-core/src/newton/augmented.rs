//! Full-curvature family on the SQD matrix
//!
//! ```text
//!     K = [ -H   Aᵀ  ]      rhs = [ -w ]
//!         [  A   D2² ]            [ r1 ]
//! ```
//!
//! Fixed variables are decoupled before anything is solved: their rows and
//! columns of H become identity rows, their columns of A are dropped and
//! their right-hand side entries are zero.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{explicit_a, Direction, InnerSolve, NewtonNote, NewtonSolver, NewtonSystem, SolveFamily};
use crate::error::{SolverError, SolverResult};
use crate::krylov::{self, KrylovOptions};
use crate::linalg::ldl::{LdlSolver, PivotPolicy};
use crate::linalg::operator::SqdBlocks;
use crate::linalg::sparse::{self, SparseCsc, SparseTriMat};
use crate::linalg::vector;
use crate::objective::Curvature;

/// Relative size of the diagonal perturbation of the retry.
const PERTURBATION: f64 = 1e-10;

/// SQD blocks with fixed variables decoupled. `a` must already have its
/// fixed columns removed.
pub(super) fn sqd_blocks(sys: &NewtonSystem, a: &SparseCsc) -> SqdBlocks {
    let n = sys.n();
    let fixed = &sys.bounds.is_fixed;
    let mut tri = SparseTriMat::new((n, n));
    match sys.curvature {
        Curvature::Diagonal(d) => {
            for j in (0..n).filter(|&j| !fixed[j]) {
                tri.add_triplet(j, j, d[j]);
            }
        }
        Curvature::Sparse(h) => {
            for (&v, (i, j)) in h.iter() {
                if !fixed[i] && !fixed[j] {
                    tri.add_triplet(i, j, v);
                }
            }
        }
    }
    for j in 0..n {
        tri.add_triplet(j, j, if fixed[j] { 1.0 } else { sys.h_barrier[j] });
    }
    SqdBlocks::new(tri.to_csc(), a.clone(), sys.d2sq.to_vec())
}

/// [−w; r1], zero on fixed variables.
pub(super) fn sqd_rhs(sys: &NewtonSystem) -> Vec<f64> {
    let mut rhs: Vec<f64> = sys
        .w
        .iter()
        .zip(&sys.bounds.is_fixed)
        .map(|(w, &f)| if f { 0.0 } else { -w })
        .collect();
    rhs.extend_from_slice(sys.r1);
    rhs
}

/// Dense LU with partial pivoting; a failed or non-finite solve is retried
/// with full pivoting.
fn dense_solve(k: &DMatrix<f64>, rhs: &[f64]) -> Option<Vec<f64>> {
    let b = DVector::from_column_slice(rhs);
    let first = k.clone().lu().solve(&b).filter(|z| z.iter().all(|v| v.is_finite()));
    let z = match first {
        Some(z) => Some(z),
        None => {
            debug!("partial-pivoting LU failed, retrying with full pivoting");
            k.clone().full_piv_lu().solve(&b).filter(|z| z.iter().all(|v| v.is_finite()))
        }
    };
    z.map(|z| z.iter().copied().collect())
}

fn singular(sys: &NewtonSystem, what: &str) -> SolverError {
    SolverError::IndefiniteSystem {
        iter: sys.iter,
        detail: format!("{}: SQD matrix is singular", what),
    }
}

impl NewtonSolver {
    pub(super) fn solve_sqd(&mut self, sys: &NewtonSystem) -> SolverResult<Direction> {
        let a = explicit_a(&mut self.a_explicit, sys);
        let blocks = sqd_blocks(sys, a);
        let rhs = sqd_rhs(sys);
        let n = sys.n();

        let mut notes = Vec::new();
        let mut inner = None;
        let mut z = match self.family {
            SolveFamily::SqdLu => {
                let k = blocks.assemble(false);
                self.sqd_lu.solve(&k, &rhs).map_err(|e| SolverError::IndefiniteSystem {
                    iter: sys.iter,
                    detail: format!("SQD sparse LU: {}", e),
                })?
            }
            SolveFamily::SqdLdl => {
                let k = blocks.assemble(false);
                let ldl = self
                    .sqd_ldl
                    .get_or_insert_with(|| LdlSolver::new(k.rows(), PivotPolicy::QuasiDefinite));
                ldl.factor(&k).map_err(|e| SolverError::IndefiniteSystem {
                    iter: sys.iter,
                    detail: format!("SQD LDLᵀ: {}", e),
                })?;
                ldl.solve(&rhs)?
            }
            SolveFamily::SqdBackslash => {
                let k = sparse::to_dense(&blocks.assemble(false));
                dense_solve(&k, &rhs).ok_or_else(|| singular(sys, "backslash"))?
            }
            SolveFamily::SqdBackslashPerturbed => {
                let mut k = sparse::to_dense(&blocks.assemble(false));
                match dense_solve(&k, &rhs) {
                    Some(z) => z,
                    None => {
                        let magnitude = PERTURBATION * k.amax().max(1.0);
                        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(sys.iter as u64));
                        for i in 0..k.nrows() {
                            let delta = magnitude * (1.0 + rng.gen::<f64>());
                            // keep the quasi-definite sign pattern
                            k[(i, i)] += if i < n { -delta } else { delta };
                        }
                        warn!(
                            "iteration {}: singular SQD matrix, retrying with diagonal perturbation {:.1e}",
                            sys.iter, magnitude
                        );
                        notes.push(NewtonNote::Perturbed { magnitude });
                        dense_solve(&k, &rhs).ok_or_else(|| singular(sys, "perturbed backslash"))?
                    }
                }
            }
            SolveFamily::SqdKrylov => {
                let opts = KrylovOptions {
                    tol: sys.inner_tol,
                    max_iter: self.max_inner(blocks.dim()),
                    restart: self.gmres_restart,
                };
                let sol = krylov::solve_sqd(self.method, &blocks, &rhs, self.pc_kind, &opts)?;
                debug!(
                    "{} with {}: {} in {} iterations",
                    self.method, sol.preconditioner, sol.outcome.status, sol.outcome.iters
                );
                notes.extend(sol.notes.iter().cloned().map(NewtonNote::PreconditionerFallback));
                inner = Some(InnerSolve {
                    method: self.method.name(),
                    preconditioner: sol.preconditioner,
                    tol: opts.tol,
                    max_iter: opts.max_iter,
                    iters: sol.outcome.iters,
                    rel_resid: sol.outcome.rel_resid,
                    status: sol.outcome.status,
                });
                let mut z = sol.dx;
                z.extend_from_slice(&sol.dy);
                z
            }
            other => {
                return Err(SolverError::Configuration(format!(
                    "{} is not an SQD solve family",
                    other
                )))
            }
        };

        if !vector::all_finite(&z) {
            return Err(SolverError::NonFiniteSolution {
                iter: sys.iter,
                pinf: sys.pinf,
                dinf: sys.dinf,
            });
        }
        let dy = z.split_off(n);
        Ok(Direction {
            dx: z,
            dy,
            inner,
            exact_error: None,
            notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{block_residual, Fixture};
    use super::*;
    use crate::problem::{ConstraintOperator, SolverSettings};

    fn solver(family: SolveFamily) -> NewtonSolver {
        NewtonSolver::new(&SolverSettings {
            family,
            ..SolverSettings::default()
        })
    }

    #[test]
    fn test_fixed_variables_are_decoupled() {
        let fx = Fixture::small(Curvature::Diagonal(vec![1.0, 1.0, 1.0, 9.0]));
        let sys = fx.system(1e-8);
        let a = sparse::from_triplets(2, 4, vec![(0, 0, 1.0)]);
        let blocks = sqd_blocks(&sys, &a);
        let h = sparse::to_dense(&blocks.h);
        assert_eq!(h[(3, 3)], 1.0);
        assert_eq!(h[(0, 0)], 2.5);
        let rhs = sqd_rhs(&sys);
        assert_eq!(rhs[3], 0.0);
        assert_eq!(rhs[0], -1.0);
        assert_eq!(rhs.len(), 6);
    }

    /// Variable 2 has no curvature and no constraint coupling: K is singular.
    fn singular_fixture() -> Fixture {
        let mut fx = Fixture::small(Curvature::zeros(4));
        fx.h_barrier[2] = 0.0;
        fx.a = ConstraintOperator::Explicit(sparse::from_triplets(
            2,
            4,
            vec![(0, 0, 1.0), (0, 1, 2.0), (1, 1, -1.0), (1, 3, 3.0)],
        ));
        fx
    }

    #[test]
    fn test_backslash_reports_singular_matrix() {
        let fx = singular_fixture();
        let err = solver(SolveFamily::SqdBackslash).solve(&fx.system(1e-8)).unwrap_err();
        assert!(matches!(err, SolverError::IndefiniteSystem { iter: 3, .. }));
    }

    #[test]
    fn test_perturbed_backslash_recovers() {
        let fx = singular_fixture();
        let dir = solver(SolveFamily::SqdBackslashPerturbed).solve(&fx.system(1e-8)).unwrap();
        assert!(matches!(dir.notes.as_slice(), [NewtonNote::Perturbed { .. }]));
        assert!(dir.dx.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sqd_krylov_reports_inner_solve() {
        let fx = Fixture::small(Curvature::Diagonal(vec![0.5, 0.0, 1.0, 0.0]));
        let mut s = solver(SolveFamily::SqdKrylov);
        s.method = krylov::KrylovMethod::ProjectedCg;
        let dir = s.solve(&fx.system(1e-12)).unwrap();
        let inner = dir.inner.as_ref().unwrap();
        assert_eq!(inner.method, "Projected-CG");
        assert_eq!(inner.preconditioner, "constraint");
        assert!(inner.status.is_converged());
        assert!(block_residual(&fx, &dir) < 1e-8);
    }
}
