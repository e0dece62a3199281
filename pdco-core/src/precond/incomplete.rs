//! Incomplete factorizations.
//!
//! `IncompleteCholesky` is IC(0) on the symmetrically scaled matrix
//! D S D (unit diagonal), keeping the lower-triangular pattern of S. A
//! breakdown (non-positive pivot) is retried with a growing diagonal shift.
//!
//! `IncompleteLu` is ILUTP: row-wise threshold ILU (IKJ order) with column
//! pivoting. Each row is eliminated in a sparse work row; multipliers and
//! entries of U below `droptol` times the row norm are dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::krylov::PrecondApply;
use crate::linalg::sparse::{self, SparseCsc};

/// Diagonal shifts tried in order when IC(0) breaks down.
const IC_SHIFTS: [f64; 6] = [0.0, 1e-4, 1e-3, 1e-2, 1e-1, 1.0];

/// Smallest accepted squared pivot in the scaled IC factor.
const IC_MIN_PIVOT: f64 = 1e-12;

/// IC(0) factor, L Lᵀ ≈ D S D.
#[derive(Debug, Clone)]
pub struct IncompleteCholesky {
    /// D = diag(S)^{-1/2}
    scale: Vec<f64>,
    /// Strictly lower part of L, row-wise, sorted by column
    rows: Vec<Vec<(usize, f64)>>,
    /// diag(L)
    diag: Vec<f64>,
    /// Shift that made the factorization succeed
    shift: f64,
}

impl IncompleteCholesky {
    /// Factor a symmetric matrix stored with both triangles.
    pub fn factor(s: &SparseCsc) -> Result<Self, String> {
        let m = s.rows();
        let d = sparse::diag_of(s);
        if let Some(i) = d.iter().position(|&v| !(v > 0.0) || !v.is_finite()) {
            return Err(format!("diagonal entry {} is {:.3e}", i, d[i]));
        }
        let scale: Vec<f64> = d.iter().map(|v| 1.0 / v.sqrt()).collect();

        // Scaled strictly-lower pattern, row-wise
        let mut pattern: Vec<Vec<(usize, f64)>> = vec![Vec::new(); m];
        for (&v, (i, j)) in s.iter() {
            if j < i && v != 0.0 {
                pattern[i].push((j, v * scale[i] * scale[j]));
            }
        }
        for row in pattern.iter_mut() {
            row.sort_by_key(|&(j, _)| j);
            row.dedup_by(|next, prev| {
                if next.0 == prev.0 {
                    prev.1 += next.1;
                    true
                } else {
                    false
                }
            });
        }

        let mut last_pivot = 0.0;
        for &shift in IC_SHIFTS.iter() {
            match Self::factor_shifted(&pattern, shift) {
                Ok((rows, diag)) => {
                    return Ok(Self { scale, rows, diag, shift });
                }
                Err(p) => last_pivot = p,
            }
        }
        Err(format!(
            "IC(0) broke down for every shift up to {} (last pivot {:.3e})",
            IC_SHIFTS[IC_SHIFTS.len() - 1],
            last_pivot
        ))
    }

    #[allow(clippy::type_complexity)]
    fn factor_shifted(
        pattern: &[Vec<(usize, f64)>],
        shift: f64,
    ) -> Result<(Vec<Vec<(usize, f64)>>, Vec<f64>), f64> {
        let m = pattern.len();
        let mut rows: Vec<Vec<(usize, f64)>> = Vec::with_capacity(m);
        let mut diag = vec![0.0; m];

        for i in 0..m {
            let mut row = pattern[i].clone();
            for idx in 0..row.len() {
                let (j, sij) = row[idx];
                // Σ_{k<j} L_ik L_jk over the shared pattern
                let mut acc = 0.0;
                let (mut p, mut q) = (0, 0);
                let lj = &rows[j];
                while p < idx && q < lj.len() {
                    let (kp, vp) = row[p];
                    let (kq, vq) = lj[q];
                    if kp == kq {
                        acc += vp * vq;
                        p += 1;
                        q += 1;
                    } else if kp < kq {
                        p += 1;
                    } else {
                        q += 1;
                    }
                }
                row[idx].1 = (sij - acc) / diag[j];
            }
            let sq: f64 = row.iter().map(|&(_, l)| l * l).sum();
            let pivot = 1.0 + shift - sq;
            if !(pivot > IC_MIN_PIVOT) || !pivot.is_finite() {
                return Err(pivot);
            }
            diag[i] = pivot.sqrt();
            rows.push(row);
        }
        Ok((rows, diag))
    }

    pub fn dim(&self) -> usize {
        self.diag.len()
    }

    pub fn shift(&self) -> f64 {
        self.shift
    }
}

impl PrecondApply for IncompleteCholesky {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        let m = self.diag.len();
        for i in 0..m {
            z[i] = r[i] * self.scale[i];
        }
        // L t = D r
        for i in 0..m {
            let mut acc = z[i];
            for &(j, l) in &self.rows[i] {
                acc -= l * z[j];
            }
            z[i] = acc / self.diag[i];
        }
        // Lᵀ u = t
        for i in (0..m).rev() {
            z[i] /= self.diag[i];
            let zi = z[i];
            for &(j, l) in &self.rows[i] {
                z[j] -= l * zi;
            }
        }
        for i in 0..m {
            z[i] *= self.scale[i];
        }
    }
}

/// Swap the diagonal for a larger entry of the row when
/// PIVOT_TOL·|w_j| > |w_diag|.
const PIVOT_TOL: f64 = 0.5;

/// Threshold ILU with column pivoting, K Q ≈ L U.
#[derive(Debug, Clone)]
pub struct IncompleteLu {
    /// Column k of the factored system is column perm[k] of K
    perm: Vec<usize>,
    /// Strictly lower part of unit L, row-wise
    l_rows: Vec<Vec<(usize, f64)>>,
    /// Strictly upper part of U, row-wise
    u_rows: Vec<Vec<(usize, f64)>>,
    u_diag: Vec<f64>,
}

impl IncompleteLu {
    pub fn factor(k: &SparseCsc, droptol: f64) -> Result<Self, String> {
        let n = k.rows();
        let csr = k.to_csr();
        let anorm = csr
            .outer_iterator()
            .map(|row| row.iter().map(|(_, v)| v * v).sum::<f64>().sqrt())
            .fold(0.0, f64::max);
        if anorm == 0.0 {
            return Err("matrix is zero".to_string());
        }

        // perm: position -> column of K, iperm: column of K -> position
        let mut perm: Vec<usize> = (0..n).collect();
        let mut iperm: Vec<usize> = (0..n).collect();
        let mut l_rows = Vec::with_capacity(n);
        // U rows hold columns of K until the end, positions move while pivoting
        let mut u_rows: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
        let mut u_diag: Vec<f64> = Vec::with_capacity(n);

        // Sparse work row indexed by column of K
        let mut w = vec![0.0; n];
        let mut in_row = vec![false; n];
        let mut nz: Vec<usize> = Vec::new();
        let mut lower: BinaryHeap<Reverse<usize>> = BinaryHeap::new();

        for (i, row) in csr.outer_iterator().enumerate() {
            let mut norm2 = 0.0;
            for (j, &v) in row.iter() {
                if !in_row[j] {
                    in_row[j] = true;
                    nz.push(j);
                    if iperm[j] < i {
                        lower.push(Reverse(iperm[j]));
                    }
                }
                w[j] += v;
                norm2 += v * v;
            }
            let tol = droptol * norm2.sqrt();

            let mut l_row = Vec::new();
            while let Some(Reverse(p)) = lower.pop() {
                let col = perm[p];
                let l = w[col] / u_diag[p];
                w[col] = 0.0;
                if l == 0.0 || l.abs() < tol {
                    continue;
                }
                l_row.push((p, l));
                for &(j, u) in &u_rows[p] {
                    if !in_row[j] {
                        in_row[j] = true;
                        nz.push(j);
                        if iperm[j] < i {
                            lower.push(Reverse(iperm[j]));
                        }
                    }
                    w[j] -= l * u;
                }
            }
            l_row.sort_by_key(|&(p, _)| p);

            // Column pivoting among the remaining columns
            let mut best = perm[i];
            for &j in &nz {
                if iperm[j] > i && w[j].abs() > w[best].abs() {
                    best = j;
                }
            }
            if PIVOT_TOL * w[best].abs() > w[perm[i]].abs() {
                let pj = iperm[best];
                perm.swap(i, pj);
                iperm[perm[i]] = i;
                iperm[perm[pj]] = pj;
            }
            let pivot = w[perm[i]];
            if !(pivot.abs() > f64::EPSILON * anorm) || !pivot.is_finite() {
                return Err(format!("no usable pivot in row {}", i));
            }

            let mut u_row = Vec::new();
            for &j in &nz {
                if iperm[j] > i && w[j] != 0.0 && w[j].abs() >= tol {
                    u_row.push((j, w[j]));
                }
            }
            for &j in &nz {
                w[j] = 0.0;
                in_row[j] = false;
            }
            nz.clear();

            l_rows.push(l_row);
            u_rows.push(u_row);
            u_diag.push(pivot);
        }

        for row in u_rows.iter_mut() {
            for entry in row.iter_mut() {
                entry.0 = iperm[entry.0];
            }
        }
        Ok(Self { perm, l_rows, u_rows, u_diag })
    }

    pub fn dim(&self) -> usize {
        self.u_diag.len()
    }

    /// Stored entries of L and U (diagonal included).
    pub fn nnz(&self) -> usize {
        self.l_rows.iter().map(Vec::len).sum::<usize>()
            + self.u_rows.iter().map(Vec::len).sum::<usize>()
            + self.u_diag.len()
    }
}

impl PrecondApply for IncompleteLu {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        let n = self.u_diag.len();
        let mut t = vec![0.0; n];
        for i in 0..n {
            let mut acc = r[i];
            for &(p, l) in &self.l_rows[i] {
                acc -= l * t[p];
            }
            t[i] = acc;
        }
        for i in (0..n).rev() {
            let mut acc = t[i];
            for &(p, u) in &self.u_rows[i] {
                acc -= u * t[p];
            }
            t[i] = acc / self.u_diag[i];
        }
        for (p, &col) in self.perm.iter().enumerate() {
            z[col] = t[p];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::krylov::test_systems::{convection, laplacian, saddle};
    use crate::linalg::operator::LinearOperator;

    #[test]
    fn test_ic0_exact_on_tridiagonal() {
        // IC(0) of a tridiagonal SPD matrix has no fill: it is the exact Cholesky.
        let s = laplacian(6);
        let ic = IncompleteCholesky::factor(&s).unwrap();
        assert_eq!(ic.shift(), 0.0);
        let x_true = vec![1.0, -1.0, 2.0, 0.5, 0.0, 3.0];
        let mut b = vec![0.0; 6];
        s.apply(&x_true, &mut b);
        let mut x = vec![0.0; 6];
        ic.apply(&b, &mut x);
        for i in 0..6 {
            assert!((x[i] - x_true[i]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_ic0_rejects_nonpositive_diagonal() {
        let s = sparse::diagonal(&[1.0, 0.0]);
        assert!(IncompleteCholesky::factor(&s).is_err());
    }

    #[test]
    fn test_ilu_without_dropping_is_exact() {
        let k = saddle();
        let ilu = IncompleteLu::factor(&k, 0.0).unwrap();
        let x_true = vec![1.0, 2.0, -1.0, 0.5, -0.5];
        let mut b = vec![0.0; 5];
        k.apply(&x_true, &mut b);
        let mut x = vec![0.0; 5];
        ilu.apply(&b, &mut x);
        for i in 0..5 {
            assert!((x[i] - x_true[i]).abs() < 1e-10, "{} vs {}", x[i], x_true[i]);
        }
    }

    #[test]
    fn test_ilu_pivots_past_zero_diagonal() {
        // [[0, 1], [1, 0]] has no usable diagonal without pivoting
        let k = sparse::from_triplets(2, 2, vec![(0, 1, 1.0), (1, 0, 1.0)]);
        let ilu = IncompleteLu::factor(&k, 0.0).unwrap();
        let mut x = vec![0.0; 2];
        ilu.apply(&[3.0, -2.0], &mut x);
        assert_eq!(x, vec![-2.0, 3.0]);
    }

    #[test]
    fn test_ilu_dropping_thins_the_factor() {
        let k = convection(12);
        let exact = IncompleteLu::factor(&k, 0.0).unwrap();
        let thin = IncompleteLu::factor(&k, 0.3).unwrap();
        assert!(thin.nnz() <= exact.nnz());
        assert_eq!(thin.dim(), 12);

        let b: Vec<f64> = (0..12).map(|i| 1.0 + i as f64).collect();
        let mut x = vec![0.0; 12];
        thin.apply(&b, &mut x);
        assert!(x.iter().all(|v| v.is_finite()));
        assert!(IncompleteLu::factor(&sparse::from_triplets(2, 2, Vec::<(usize, usize, f64)>::new()), 0.0).is_err());
    }
}
