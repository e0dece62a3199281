//! Objective evaluation.
//!
//! The solver never looks inside φ: it asks an `Objective` for the value,
//! gradient and curvature at a point. Curvature is either a diagonal (the
//! common case: linear, separable quadratic, entropy) or a sparse symmetric
//! matrix with both triangles stored.

use crate::linalg::sparse::{self, SparseCsc};

/// Second-order information of φ at a point.
#[derive(Debug, Clone)]
pub enum Curvature {
    /// diag(∇²φ)
    Diagonal(Vec<f64>),
    /// Full ∇²φ, n x n, both triangles stored
    Sparse(SparseCsc),
}

impl Curvature {
    pub fn zeros(n: usize) -> Self {
        Curvature::Diagonal(vec![0.0; n])
    }

    pub fn dim(&self) -> usize {
        match self {
            Curvature::Diagonal(d) => d.len(),
            Curvature::Sparse(h) => h.rows(),
        }
    }

    pub fn is_diagonal(&self) -> bool {
        match self {
            Curvature::Diagonal(_) => true,
            Curvature::Sparse(h) => sparse::is_diagonal(h),
        }
    }

    /// Diagonal entries, whichever representation is held.
    pub fn diagonal(&self) -> Vec<f64> {
        match self {
            Curvature::Diagonal(d) => d.clone(),
            Curvature::Sparse(h) => sparse::diag_of(h),
        }
    }

    /// Multiply every entry by `alpha`.
    pub fn scaled(&self, alpha: f64) -> Self {
        match self {
            Curvature::Diagonal(d) => Curvature::Diagonal(d.iter().map(|v| alpha * v).collect()),
            Curvature::Sparse(h) => Curvature::Sparse(h.map(|v| alpha * v)),
        }
    }

    /// y = ∇²φ x
    pub fn apply(&self, x: &[f64], y: &mut [f64]) {
        match self {
            Curvature::Diagonal(d) => {
                for ((yi, xi), di) in y.iter_mut().zip(x).zip(d) {
                    *yi = di * xi;
                }
            }
            Curvature::Sparse(h) => sparse::spmv(h, x, y, 1.0, 0.0),
        }
    }

    pub fn all_finite(&self) -> bool {
        match self {
            Curvature::Diagonal(d) => d.iter().all(|v| v.is_finite()),
            Curvature::Sparse(h) => h.data().iter().all(|v| v.is_finite()),
        }
    }
}

/// Value, gradient and curvature of φ at one point.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: f64,
    pub gradient: Vec<f64>,
    pub curvature: Curvature,
}

/// A smooth convex objective φ(x).
pub trait Objective {
    fn evaluate(&self, x: &[f64]) -> Evaluation;
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> Evaluation,
{
    fn evaluate(&self, x: &[f64]) -> Evaluation {
        self(x)
    }
}

/// φ(x) = cᵀx
#[derive(Debug, Clone)]
pub struct LinearObjective {
    pub c: Vec<f64>,
}

impl LinearObjective {
    pub fn new(c: Vec<f64>) -> Self {
        Self { c }
    }
}

impl Objective for LinearObjective {
    fn evaluate(&self, x: &[f64]) -> Evaluation {
        Evaluation {
            value: self.c.iter().zip(x).map(|(ci, xi)| ci * xi).sum(),
            gradient: self.c.clone(),
            curvature: Curvature::zeros(self.c.len()),
        }
    }
}

/// φ(x) = cᵀx + ½ xᵀQx with Q positive semidefinite.
#[derive(Debug, Clone)]
pub struct QuadraticObjective {
    pub c: Vec<f64>,
    pub q: Curvature,
}

impl QuadraticObjective {
    pub fn new(c: Vec<f64>, q: Curvature) -> Self {
        Self { c, q }
    }
}

impl Objective for QuadraticObjective {
    fn evaluate(&self, x: &[f64]) -> Evaluation {
        let mut qx = vec![0.0; x.len()];
        self.q.apply(x, &mut qx);
        let value = self
            .c
            .iter()
            .zip(x)
            .zip(&qx)
            .map(|((ci, xi), qxi)| ci * xi + 0.5 * xi * qxi)
            .sum();
        let gradient = self.c.iter().zip(&qx).map(|(ci, qxi)| ci + qxi).collect();
        Evaluation {
            value,
            gradient,
            curvature: self.q.clone(),
        }
    }
}
