//! Iterate and residuals of the barrier iteration.
//!
//! All vectors have full length n; slack/multiplier entries outside their
//! index set (x1, z1 off `low`, x2, z2 off `upp`) are held at zero.

use crate::bounds::BoundPartition;
use crate::linalg::operator::LinearOperator;
use crate::linalg::vector::{norm2, norm_inf};
use crate::objective::{Evaluation, Objective};
use crate::problem::ConstraintOperator;

/// Scaled problem data the controller iterates on.
pub struct Model<'a> {
    pub objective: &'a dyn Objective,
    pub a: &'a ConstraintOperator,
    pub b: Vec<f64>,
    pub bl: Vec<f64>,
    pub bu: Vec<f64>,
    pub d1sq: Vec<f64>,
    pub d2sq: Vec<f64>,
    pub bounds: BoundPartition,
}

impl Model<'_> {
    pub fn n(&self) -> usize {
        self.bl.len()
    }

    pub fn m(&self) -> usize {
        self.b.len()
    }

    /// φ(x) + ½‖D1x‖² + ½‖D2y‖²
    pub fn objective_value(&self, st: &IterateState, eval: &Evaluation) -> f64 {
        let reg_x: f64 = st.x.iter().zip(&self.d1sq).map(|(x, d)| d * x * x).sum();
        let reg_y: f64 = st.y.iter().zip(&self.d2sq).map(|(y, d)| d * y * y).sum();
        eval.value + 0.5 * (reg_x + reg_y)
    }

    /// Pin fixed variables to bl and tie x to its slack on zero bounds.
    pub fn tie_primal(&self, st: &mut IterateState) {
        for &j in &self.bounds.fixed {
            st.x[j] = self.bl[j];
        }
        for &j in &self.bounds.zlo {
            st.x[j] = st.x1[j];
        }
        for &j in &self.bounds.zup {
            st.x[j] = -st.x2[j];
        }
    }

    pub fn residuals(&self, st: &IterateState, grad: &[f64]) -> Residuals {
        let n = self.n();
        let m = self.m();
        let bounds = &self.bounds;

        // r1 = b − Ax − D2²y
        let mut r1 = vec![0.0; m];
        if m > 0 {
            self.a.apply(&st.x, &mut r1);
        }
        for i in 0..m {
            r1[i] = self.b[i] - r1[i] - self.d2sq[i] * st.y[i];
        }

        // r2 = Aᵀy + z1 − z2 − g − D1²x
        let mut r2 = vec![0.0; n];
        if m > 0 {
            self.a.apply_transpose(&st.y, &mut r2);
        }
        for j in 0..n {
            r2[j] += st.z1[j] - st.z2[j] - grad[j] - self.d1sq[j] * st.x[j];
        }
        for &j in &bounds.fixed {
            r2[j] = 0.0;
        }

        let mut rl = vec![0.0; n];
        let mut cl = vec![0.0; n];
        for &j in &bounds.low {
            rl[j] = self.bl[j] - st.x[j] + st.x1[j];
            cl[j] = st.mu - st.x1[j] * st.z1[j];
        }
        let mut ru = vec![0.0; n];
        let mut cu = vec![0.0; n];
        for &j in &bounds.upp {
            ru[j] = self.bu[j] - st.x[j] - st.x2[j];
            cu[j] = st.mu - st.x2[j] * st.z2[j];
        }

        let pinf = norm_inf(&r1).max(norm_inf(&rl)).max(norm_inf(&ru));
        let dinf = norm_inf(&r2);
        let cinf = norm_inf(&cl).max(norm_inf(&cu));

        let products = bounds
            .low
            .iter()
            .map(|&j| st.x1[j] * st.z1[j])
            .chain(bounds.upp.iter().map(|&j| st.x2[j] * st.z2[j]));
        let (mut max_xz, mut min_xz) = (0.0f64, f64::INFINITY);
        for p in products {
            max_xz = max_xz.max(p);
            min_xz = min_xz.min(p);
        }
        let center = if min_xz.is_finite() && min_xz > 0.0 { max_xz / min_xz } else { 1.0 };

        let merit = [&r1, &r2, &rl, &ru, &cl, &cu]
            .iter()
            .map(|v| norm2(v).powi(2))
            .sum::<f64>()
            .sqrt();

        Residuals {
            r1,
            r2,
            rl,
            ru,
            cl,
            cu,
            pinf,
            dinf,
            cinf,
            cinf0: max_xz,
            center,
            merit,
        }
    }
}

/// Primal-dual iterate.
#[derive(Debug, Clone)]
pub struct IterateState {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub x1: Vec<f64>,
    pub x2: Vec<f64>,
    pub z1: Vec<f64>,
    pub z2: Vec<f64>,
    pub mu: f64,
}

impl IterateState {
    /// Starting point from (x0, y0, z0) pushed into the interior.
    pub fn initial(
        model: &Model,
        x0: &[f64],
        y0: &[f64],
        z0: &[f64],
        x0_min: f64,
        z0_min: f64,
        mu0: f64,
    ) -> Self {
        let n = model.n();
        let bounds = &model.bounds;
        let mut st = IterateState {
            x: x0.to_vec(),
            y: y0.to_vec(),
            x1: vec![0.0; n],
            x2: vec![0.0; n],
            z1: vec![0.0; n],
            z2: vec![0.0; n],
            mu: mu0,
        };
        for &j in &bounds.fixed {
            st.x[j] = model.bl[j];
        }
        for &j in &bounds.low {
            st.x1[j] = (st.x[j] - model.bl[j]).max(x0_min);
            st.z1[j] = z0[j].max(z0_min);
        }
        for &j in &bounds.upp {
            st.x2[j] = (model.bu[j] - st.x[j]).max(x0_min);
            st.z2[j] = (-z0[j]).max(z0_min);
        }
        model.tie_primal(&mut st);

        if mu0 == 0.0 {
            let pairs = bounds.num_pairs();
            if pairs > 0 {
                let total: f64 = bounds.low.iter().map(|&j| st.x1[j] * st.z1[j]).sum::<f64>()
                    + bounds.upp.iter().map(|&j| st.x2[j] * st.z2[j]).sum::<f64>();
                st.mu = total / pairs as f64;
            }
        }
        st
    }

    /// Smallest slack or multiplier over the bounded sets.
    pub fn min_pair(&self, bounds: &BoundPartition) -> f64 {
        let low = bounds.low.iter().map(|&j| self.x1[j].min(self.z1[j]));
        let upp = bounds.upp.iter().map(|&j| self.x2[j].min(self.z2[j]));
        low.chain(upp).fold(f64::INFINITY, f64::min)
    }

    /// z = z1 − z2
    pub fn z(&self) -> Vec<f64> {
        self.z1.iter().zip(&self.z2).map(|(a, b)| a - b).collect()
    }
}

/// Residual blocks and their summary norms.
#[derive(Debug, Clone)]
pub struct Residuals {
    pub r1: Vec<f64>,
    pub r2: Vec<f64>,
    pub rl: Vec<f64>,
    pub ru: Vec<f64>,
    pub cl: Vec<f64>,
    pub cu: Vec<f64>,
    pub pinf: f64,
    pub dinf: f64,
    /// ‖[cL; cU]‖∞
    pub cinf: f64,
    /// max x z over the pairs
    pub cinf0: f64,
    /// max(x z) / min(x z)
    pub center: f64,
    pub merit: f64,
}

impl Residuals {
    pub fn all_finite(&self) -> bool {
        self.merit.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse;
    use crate::objective::LinearObjective;

    #[test]
    fn test_initial_point_and_residuals() {
        let obj = LinearObjective::new(vec![1.0, -1.0, 0.0]);
        let a = ConstraintOperator::Explicit(sparse::from_triplets(1, 3, vec![(0, 0, 1.0), (0, 1, 1.0), (0, 2, 1.0)]));
        let bl = vec![0.0, -1.0, 2.0];
        let bu = vec![4.0, 1e20, 2.0];
        let model = Model {
            objective: &obj,
            a: &a,
            b: vec![3.0],
            bl: bl.clone(),
            bu: bu.clone(),
            d1sq: vec![0.0; 3],
            d2sq: vec![0.0],
            bounds: BoundPartition::classify(&bl, &bu, 1e20),
        };
        let st = IterateState::initial(&model, &[1.0, 0.0, 0.0], &[0.0], &[0.0; 3], 1.0, 1.0, 0.0);

        assert_eq!(st.x[2], 2.0, "fixed variable pinned to its bound");
        assert_eq!(st.x[0], st.x1[0], "zero lower bound ties x to x1");
        assert_eq!(st.x2[0], 3.0);
        assert_eq!(st.x1[1], 1.0);
        assert_eq!(st.z2[1], 0.0);
        // pairs: (1·1), (3·1), (1·1) → μ = 5/3
        assert!((st.mu - 5.0 / 3.0).abs() < 1e-15);

        let eval = obj.evaluate(&st.x);
        let res = model.residuals(&st, &eval.gradient);
        assert_eq!(res.r1[0], 3.0 - 3.0);
        assert_eq!(res.r2[2], 0.0, "no dual residual on fixed variables");
        assert_eq!(res.rl[0], 0.0);
        assert_eq!(res.cinf0, 3.0);
        assert_eq!(res.center, 3.0);
        assert!(res.merit > 0.0);
        assert_eq!(st.min_pair(&model.bounds), 1.0);
    }
}
