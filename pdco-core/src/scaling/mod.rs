//! Problem scaling.
//!
//! x is measured in units of `x_size` (β) and y, z in units of `z_size` (ζ).
//! The barrier iteration runs entirely on scaled quantities; only the final
//! solution is mapped back.
//!
//! ```text
//! x̃ = x/β      ỹ = y/ζ      z̃ = z/ζ
//! b̃ = b/β      b̃l = bl/β    b̃u = bu/β
//! d̃1 = d1·√(β/ζ)            d̃2 = d2·√(ζ/β)
//! φ̃(x̃) = φ(βx̃)/θ           θ = βζ
//! ```

use crate::objective::{Evaluation, Objective};

/// Scale factors (β, ζ).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProblemScaling {
    pub beta: f64,
    pub zeta: f64,
}

fn sanitize(size: f64) -> f64 {
    if size > 0.0 && size.is_finite() {
        size
    } else {
        1.0
    }
}

impl ProblemScaling {
    pub fn new(x_size: f64, z_size: f64) -> Self {
        Self {
            beta: sanitize(x_size),
            zeta: sanitize(z_size),
        }
    }

    pub fn theta(&self) -> f64 {
        self.beta * self.zeta
    }

    pub fn is_identity(&self) -> bool {
        self.beta == 1.0 && self.zeta == 1.0
    }

    /// Quantities measured like x (x, bl, bu, b)
    pub fn scale_primal(&self, v: &[f64]) -> Vec<f64> {
        v.iter().map(|x| x / self.beta).collect()
    }

    pub fn unscale_primal(&self, v: &[f64]) -> Vec<f64> {
        v.iter().map(|x| x * self.beta).collect()
    }

    /// Quantities measured like y or z
    pub fn scale_dual(&self, v: &[f64]) -> Vec<f64> {
        v.iter().map(|x| x / self.zeta).collect()
    }

    pub fn unscale_dual(&self, v: &[f64]) -> Vec<f64> {
        v.iter().map(|x| x * self.zeta).collect()
    }

    pub fn scale_d1(&self, d1: &[f64]) -> Vec<f64> {
        let f = (self.beta / self.zeta).sqrt();
        d1.iter().map(|d| d * f).collect()
    }

    pub fn scale_d2(&self, d2: &[f64]) -> Vec<f64> {
        let f = (self.zeta / self.beta).sqrt();
        d2.iter().map(|d| d * f).collect()
    }

    pub fn unscale_objective(&self, value: f64) -> f64 {
        value * self.theta()
    }
}

/// φ seen through the scaling.
pub struct ScaledObjective<'a> {
    inner: &'a dyn Objective,
    scaling: ProblemScaling,
}

impl<'a> ScaledObjective<'a> {
    pub fn new(inner: &'a dyn Objective, scaling: ProblemScaling) -> Self {
        Self { inner, scaling }
    }
}

impl Objective for ScaledObjective<'_> {
    fn evaluate(&self, x: &[f64]) -> Evaluation {
        let ProblemScaling { beta, zeta } = self.scaling;
        if self.scaling.is_identity() {
            return self.inner.evaluate(x);
        }
        let x_orig = self.scaling.unscale_primal(x);
        let ev = self.inner.evaluate(&x_orig);
        Evaluation {
            value: ev.value / self.scaling.theta(),
            gradient: ev.gradient.iter().map(|g| g / zeta).collect(),
            curvature: ev.curvature.scaled(beta / zeta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::{Curvature, QuadraticObjective};

    #[test]
    fn test_round_trip() {
        let s = ProblemScaling::new(10.0, 0.5);
        let x = vec![1.0, -2.5, 1e-3];
        let back = s.unscale_primal(&s.scale_primal(&x));
        let back_d = s.unscale_dual(&s.scale_dual(&x));
        for i in 0..3 {
            assert!((back[i] - x[i]).abs() <= 1e-15 * x[i].abs().max(1.0));
            assert!((back_d[i] - x[i]).abs() <= 1e-15 * x[i].abs().max(1.0));
        }
    }

    #[test]
    fn test_invalid_sizes_fall_back_to_one() {
        let s = ProblemScaling::new(0.0, f64::NAN);
        assert!(s.is_identity());
        let s = ProblemScaling::new(-3.0, 2.0);
        assert_eq!(s.beta, 1.0);
        assert_eq!(s.zeta, 2.0);
    }

    #[test]
    fn test_regularization_terms_are_invariant() {
        // θ·½(d̃1 x̃)² must equal ½(d1 x)²
        let s = ProblemScaling::new(4.0, 9.0);
        let (d1, d2, x, y) = (0.3, 0.7, 2.0, -5.0);
        let d1s = s.scale_d1(&[d1])[0];
        let d2s = s.scale_d2(&[d2])[0];
        let xs = s.scale_primal(&[x])[0];
        let ys = s.scale_dual(&[y])[0];
        assert!((s.theta() * (d1s * xs).powi(2) - (d1 * x).powi(2)).abs() < 1e-12);
        assert!((s.theta() * (d2s * ys).powi(2) - (d2 * y).powi(2)).abs() < 1e-12);
    }

    #[test]
    fn test_scaled_objective() {
        let obj = QuadraticObjective::new(vec![1.0], Curvature::Diagonal(vec![2.0]));
        let s = ProblemScaling::new(2.0, 3.0);
        let scaled = ScaledObjective::new(&obj, s);
        // x̃ = 1 → x = 2: φ = 2 + 4 = 6, ∇φ = 5, ∇²φ = 2
        let ev = scaled.evaluate(&[1.0]);
        assert!((ev.value - 1.0).abs() < 1e-12);
        assert!((ev.gradient[0] - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(ev.curvature.diagonal(), vec![2.0 * 2.0 / 3.0]);
    }
}
