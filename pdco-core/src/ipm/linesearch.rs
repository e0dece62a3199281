//! Step lengths: fraction-to-boundary ratio test and merit backtracking.

use super::state::{IterateState, Model, Residuals};
use crate::bounds::BoundPartition;
use crate::objective::Evaluation;

/// Armijo constant of the merit decrease test.
const ARMIJO_ETA: f64 = 1e-4;

/// Ratio-test bound when no component limits the step.
const UNBOUNDED_STEP: f64 = 1e20;

/// Full search direction.
#[derive(Debug, Clone)]
pub struct StepDirection {
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
    pub dx1: Vec<f64>,
    pub dx2: Vec<f64>,
    pub dz1: Vec<f64>,
    pub dz2: Vec<f64>,
}

impl StepDirection {
    /// Recover the slack and multiplier steps from (Δx, Δy).
    pub fn expand(st: &IterateState, res: &Residuals, bounds: &BoundPartition, dx: Vec<f64>, dy: Vec<f64>) -> Self {
        let n = dx.len();
        let mut dx1 = vec![0.0; n];
        let mut dz1 = vec![0.0; n];
        for &j in &bounds.low {
            dx1[j] = dx[j] - res.rl[j];
            dz1[j] = (res.cl[j] - st.z1[j] * dx1[j]) / st.x1[j];
        }
        let mut dx2 = vec![0.0; n];
        let mut dz2 = vec![0.0; n];
        for &j in &bounds.upp {
            dx2[j] = res.ru[j] - dx[j];
            dz2[j] = (res.cu[j] - st.z2[j] * dx2[j]) / st.x2[j];
        }
        Self { dx, dy, dx1, dx2, dz1, dz2 }
    }
}

/// Largest α ≤ UNBOUNDED_STEP with v + α dv ≥ 0 on `idx`.
fn max_step(v: &[f64], dv: &[f64], idx: &[usize]) -> f64 {
    idx.iter()
        .filter(|&&j| dv[j] < 0.0)
        .map(|&j| -v[j] / dv[j])
        .fold(UNBOUNDED_STEP, f64::min)
}

/// Ratio-test maxima (primal, dual).
pub fn ratio_test(st: &IterateState, dir: &StepDirection, bounds: &BoundPartition) -> (f64, f64) {
    let px = max_step(&st.x1, &dir.dx1, &bounds.low).min(max_step(&st.x2, &dir.dx2, &bounds.upp));
    let pz = max_step(&st.z1, &dir.dz1, &bounds.low).min(max_step(&st.z2, &dir.dz2, &bounds.upp));
    (px, pz)
}

/// Damped steps from the ratio-test maxima.
pub fn damped_steps(max_x: f64, max_z: f64, step_tol: f64, step_same: bool) -> (f64, f64) {
    let mut stepx = (step_tol * max_x).min(1.0);
    let mut stepz = (step_tol * max_z).min(1.0);
    if step_same {
        stepx = stepx.min(stepz);
        stepz = stepx;
    }
    (stepx, stepz)
}

/// Iterate at (stepx, stepz) along `dir`.
pub fn trial_point(model: &Model, st: &IterateState, dir: &StepDirection, stepx: f64, stepz: f64) -> IterateState {
    let axpy = |v: &[f64], dv: &[f64], a: f64| -> Vec<f64> { v.iter().zip(dv).map(|(x, d)| x + a * d).collect() };
    let mut next = IterateState {
        x: axpy(&st.x, &dir.dx, stepx),
        y: axpy(&st.y, &dir.dy, stepz),
        x1: axpy(&st.x1, &dir.dx1, stepx),
        x2: axpy(&st.x2, &dir.dx2, stepx),
        z1: axpy(&st.z1, &dir.dz1, stepz),
        z2: axpy(&st.z2, &dir.dz2, stepz),
        mu: st.mu,
    };
    model.tie_primal(&mut next);
    next
}

/// Accepted trial point.
pub struct Accepted {
    pub state: IterateState,
    pub eval: Evaluation,
    pub residuals: Residuals,
    pub stepx: f64,
    pub stepz: f64,
    pub backtracks: usize,
}

pub enum LinesearchOutcome {
    Accepted(Box<Accepted>),
    /// No trial point decreased the merit; the iterate is unchanged.
    /// `last_step` is min(stepx, stepz) of the last trial point.
    Failed { backtracks: usize, last_step: f64 },
}

/// Backtrack on ‖residuals‖₂ from (stepx, stepz).
///
/// The first rejection snaps both steps to their minimum; later ones halve
/// them. At most `max_evals` trial points are evaluated. With `backtrack`
/// off the first trial point is taken whatever its merit.
pub fn linesearch(
    model: &Model,
    st: &IterateState,
    merit0: f64,
    dir: &StepDirection,
    (mut stepx, mut stepz): (f64, f64),
    backtrack: bool,
    max_evals: usize,
) -> LinesearchOutcome {
    let mut evals = 0;
    let mut last_step = stepx.min(stepz);
    while evals < max_evals.max(1) {
        let trial = trial_point(model, st, dir, stepx, stepz);
        let eval = model.objective.evaluate(&trial.x);
        let residuals = model.residuals(&trial, &eval.gradient);
        evals += 1;
        last_step = stepx.min(stepz);

        let target = (1.0 - ARMIJO_ETA * stepx.min(stepz)) * merit0;
        let ok = residuals.all_finite() && residuals.merit <= target;
        if ok || !backtrack {
            return LinesearchOutcome::Accepted(Box::new(Accepted {
                state: trial,
                eval,
                residuals,
                stepx,
                stepz,
                backtracks: evals - 1,
            }));
        }

        if evals == 1 && stepx != stepz {
            let s = stepx.min(stepz);
            stepx = s;
            stepz = s;
        } else {
            stepx *= 0.5;
            stepz *= 0.5;
        }
    }
    LinesearchOutcome::Failed {
        backtracks: evals,
        last_step,
    }
}

/// Steps for the retry after a failed linesearch: both capped by `cap`.
pub fn capped_steps((stepx, stepz): (f64, f64), cap: Option<f64>) -> (f64, f64) {
    match cap {
        Some(c) => (stepx.min(c), stepz.min(c)),
        None => (stepx, stepz),
    }
}
