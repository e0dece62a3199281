//! Convergence monitor: stopping tests, barrier parameter and inner
//! tolerance schedules.

use super::state::Residuals;
use crate::problem::{SolveStatus, SolverSettings};

/// Optimality: Pinf, Dinf ≤ feas_tol and Cinf0 ≤ opt_tol.
pub fn is_converged(res: &Residuals, settings: &SolverSettings) -> bool {
    res.pinf <= settings.feas_tol && res.dinf <= settings.feas_tol && res.cinf0 <= settings.opt_tol
}

/// Status to stop with before starting iteration `iter + 1`, if any.
pub fn check_termination(
    res: &Residuals,
    iter: usize,
    elapsed_ms: u128,
    settings: &SolverSettings,
) -> Option<SolveStatus> {
    if !res.all_finite() {
        return Some(SolveStatus::NumericalError);
    }
    if iter >= settings.min_iter && is_converged(res, settings) {
        return Some(SolveStatus::Solved);
    }
    if iter >= settings.max_iter {
        return Some(SolveStatus::IterationLimit);
    }
    if let Some(limit) = settings.time_limit_ms {
        if elapsed_ms >= u128::from(limit) {
            return Some(SolveStatus::TimeLimit);
        }
    }
    None
}

/// Barrier parameter after a step of (stepx, stepz).
///
/// Returns the new μ and whether the decrease was held back because the
/// pairs are badly centered.
pub fn next_mu(mu: f64, stepx: f64, stepz: f64, res: &Residuals, settings: &SolverSettings) -> (f64, bool) {
    if res.center > settings.big_center {
        return (mu, true);
    }
    let step = stepx.min(stepz).min(settings.step_tol);
    let reduced = mu - step * mu;
    let floor = (0.1 * settings.opt_tol).max(0.1 * res.pinf.max(res.dinf));
    (reduced.max(floor).min(mu), false)
}

/// Inner tolerance schedule.
///
/// Tightens with the outer residuals, never loosens, and stays within
/// [inner_tol_floor, inner_tol_ceiling]. `auto_scale` is the extra bound
/// 0.5·√μ / (√2·‖y‖₁ + σ̂·‖x‖₁) when that option is enabled.
pub fn inner_tolerance(prev: f64, res: &Residuals, auto_scale: Option<f64>, settings: &SolverSettings) -> f64 {
    let mut tol = prev.min(0.1 * res.pinf.max(res.dinf).max(res.cinf));
    if let Some(bound) = auto_scale.filter(|b| b.is_finite() && *b > 0.0) {
        tol = tol.min(bound);
    }
    tol.clamp(settings.inner_tol_floor, settings.inner_tol_ceiling)
}

/// 0.5·√μ / (√2·‖y‖₁ + σ̂·‖x‖₁), None when the denominator vanishes.
pub fn auto_scale_bound(mu: f64, y_norm1: f64, x_norm1: f64, sigma: f64) -> Option<f64> {
    let denom = std::f64::consts::SQRT_2 * y_norm1 + sigma * x_norm1;
    if denom > 0.0 && mu > 0.0 {
        Some(0.5 * mu.sqrt() / denom)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn residuals(pinf: f64, dinf: f64, cinf: f64, cinf0: f64, center: f64) -> Residuals {
        Residuals {
            r1: vec![],
            r2: vec![],
            rl: vec![],
            ru: vec![],
            cl: vec![],
            cu: vec![],
            pinf,
            dinf,
            cinf,
            cinf0,
            center,
            merit: 1.0,
        }
    }

    #[test]
    fn test_termination_order() {
        let s = SolverSettings {
            max_iter: 10,
            min_iter: 2,
            ..SolverSettings::default()
        };
        let done = residuals(1e-9, 1e-9, 1e-9, 1e-9, 1.0);
        assert_eq!(check_termination(&done, 1, 0, &s), None);
        assert_eq!(check_termination(&done, 2, 0, &s), Some(SolveStatus::Solved));
        let open = residuals(1.0, 1.0, 1.0, 1.0, 1.0);
        assert_eq!(check_termination(&open, 10, 0, &s), Some(SolveStatus::IterationLimit));
        let timed = SolverSettings {
            time_limit_ms: Some(5),
            ..s.clone()
        };
        assert_eq!(check_termination(&open, 3, 6, &timed), Some(SolveStatus::TimeLimit));
        let mut bad = open.clone();
        bad.merit = f64::NAN;
        assert_eq!(check_termination(&bad, 3, 0, &s), Some(SolveStatus::NumericalError));
    }

    #[test]
    fn test_mu_schedule() {
        let s = SolverSettings::default();
        let res = residuals(1e-3, 1e-4, 0.0, 0.0, 10.0);
        let (mu, held) = next_mu(1.0, 0.9, 0.5, &res, &s);
        assert!(!held);
        assert!((mu - 0.5).abs() < 1e-15);

        // floored at 0.1·max(Pinf, Dinf), never above the previous μ
        let (mu, _) = next_mu(1e-3, 1.0, 1.0, &res, &s);
        assert!((mu - 1e-4).abs() < 1e-18);
        let (mu, _) = next_mu(1e-5, 1.0, 1.0, &res, &s);
        assert_eq!(mu, 1e-5);

        let off_center = residuals(0.0, 0.0, 0.0, 0.0, 1e4);
        assert_eq!(next_mu(0.3, 1.0, 1.0, &off_center, &s), (0.3, true));
    }

    #[test]
    fn test_inner_tolerance_schedule() {
        let s = SolverSettings {
            inner_tol_ceiling: 1e-2,
            inner_tol_floor: 1e-10,
            ..SolverSettings::default()
        };
        let res = residuals(1e-2, 1e-3, 1e-4, 0.0, 1.0);
        assert!((inner_tolerance(1e-2, &res, None, &s) - 1e-3).abs() < 1e-18);
        // never loosens
        assert_eq!(inner_tolerance(1e-5, &res, None, &s), 1e-5);
        // floor
        let tiny = residuals(0.0, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(inner_tolerance(1e-5, &tiny, None, &s), 1e-10);
        // auto scale bound
        assert_eq!(inner_tolerance(1e-2, &res, Some(1e-6), &s), 1e-6);
        assert!(auto_scale_bound(1.0, 0.0, 0.0, 1.0).is_none());
    }
}
