//! Primal-dual barrier iteration.
//!
//! One outer iteration: residuals → Newton direction → ratio test →
//! backtracking on the merit function → μ update. The loop runs on the
//! scaled problem; results are unscaled on the way out.

pub mod diagnostics;
pub mod linesearch;
pub mod perf;
pub mod state;
pub mod termination;

use std::time::Instant;

use log::{debug, info};

use crate::bounds::BoundPartition;
use crate::error::SolverError;
use crate::linalg::vector::norm1;
use crate::newton::{Direction, NewtonNote, NewtonSolver, NewtonSystem};
use crate::problem::{ProblemData, SolveInfo, SolveResult, SolveStatus, SolverSettings};
use crate::scaling::{ProblemScaling, ScaledObjective};
use diagnostics::{DiagnosticEvent, DiagnosticsConfig, DiagnosticsLog, IterationRecord};
use linesearch::{capped_steps, damped_steps, linesearch, ratio_test, LinesearchOutcome, StepDirection};
use perf::{PerfSection, PerfTimers};
use state::{IterateState, Model, Residuals};
use termination::{auto_scale_bound, check_termination, inner_tolerance, next_mu};

/// H = D1² + Z1 X1⁻¹ + Z2 X2⁻¹ (zero on fixed variables; the curvature of φ
/// is added by the Newton solver)
fn barrier_diagonal(model: &Model, st: &IterateState) -> Vec<f64> {
    let mut h = model.d1sq.clone();
    for &j in &model.bounds.low {
        h[j] += st.z1[j] / st.x1[j];
    }
    for &j in &model.bounds.upp {
        h[j] += st.z2[j] / st.x2[j];
    }
    for &j in &model.bounds.fixed {
        h[j] = 0.0;
    }
    h
}

/// w = r2 + X1⁻¹(cL + Z1 rL) − X2⁻¹(cU − Z2 rU)
fn newton_rhs(model: &Model, st: &IterateState, res: &Residuals) -> Vec<f64> {
    let mut w = res.r2.clone();
    for &j in &model.bounds.low {
        w[j] += (res.cl[j] + st.z1[j] * res.rl[j]) / st.x1[j];
    }
    for &j in &model.bounds.upp {
        w[j] -= (res.cu[j] - st.z2[j] * res.ru[j]) / st.x2[j];
    }
    w
}

fn status_for(err: &SolverError) -> SolveStatus {
    match err {
        SolverError::IndefiniteSystem { .. } => SolveStatus::IndefiniteSystem,
        SolverError::LinesearchExhausted { .. } => SolveStatus::LinesearchFailed,
        _ => SolveStatus::NumericalError,
    }
}

fn snapshot(iter: usize, model: &Model, st: &IterateState, res: &Residuals, objective: f64) -> IterationRecord {
    IterationRecord {
        iter,
        pinf: res.pinf,
        dinf: res.dinf,
        cinf: res.cinf,
        cinf0: res.cinf0,
        mu: st.mu,
        merit: res.merit,
        objective,
        min_pair: st.min_pair(&model.bounds),
        center: res.center,
        ..Default::default()
    }
}

/// Turn the notes of one Newton solve into events.
fn record_notes(log: &mut DiagnosticsLog, iter: usize, dir: &Direction) {
    for note in &dir.notes {
        let event = match note {
            NewtonNote::PreconditionerFallback(f) => DiagnosticEvent::PreconditionerFallback {
                iter,
                from: f.from,
                to: f.to,
                reason: f.reason.clone(),
            },
            NewtonNote::Perturbed { magnitude } => DiagnosticEvent::Perturbation {
                iter,
                magnitude: *magnitude,
            },
            NewtonNote::ExactErrorUnavailable(detail) => DiagnosticEvent::ExactErrorUnavailable {
                iter,
                detail: detail.clone(),
            },
        };
        log.event(event);
    }
    if let Some(inner) = &dir.inner {
        if !inner.status.is_converged() {
            log.event(DiagnosticEvent::InnerEarlyTermination {
                iter,
                tol: inner.tol,
                resid: inner.rel_resid,
                status: inner.status,
            });
        }
    }
}

/// Solve with the primal-dual barrier method.
///
/// Returns `Err` only for invalid problem data or settings; every numeric
/// failure ends the loop and is reported in [`SolveResult::failure`] with
/// the last accepted iterate.
pub fn solve_pdco(prob: &ProblemData, settings: &SolverSettings) -> Result<SolveResult, SolverError> {
    let start = Instant::now();
    settings.validate()?;
    prob.validate().map_err(SolverError::InvalidProblem)?;

    let diag_cfg = DiagnosticsConfig::from_env();
    let mut timers = PerfTimers::default();
    let mut log = DiagnosticsLog::default();

    let n = prob.num_vars();
    let m = prob.num_constraints();
    let scaling = ProblemScaling::new(prob.x_size, prob.z_size);
    let scaled_obj = ScaledObjective::new(prob.objective.as_ref(), scaling);

    let (model, x0, y0, z0) = {
        let _g = timers.scoped(PerfSection::Setup);
        // classified on the unscaled data so the infinity sentinel keeps its meaning
        let bounds = BoundPartition::classify(&prob.bl, &prob.bu, settings.bound_inf);
        let square = |v: Vec<f64>| -> Vec<f64> { v.into_iter().map(|d| d * d).collect() };
        let model = Model {
            objective: &scaled_obj,
            a: &prob.a,
            b: scaling.scale_primal(&prob.b),
            bl: scaling.scale_primal(&prob.bl),
            bu: scaling.scale_primal(&prob.bu),
            d1sq: square(scaling.scale_d1(&prob.d1.expand(n))),
            d2sq: square(scaling.scale_d2(&prob.d2.expand(m))),
            bounds,
        };
        let x0 = prob.x0.as_ref().map_or_else(|| vec![0.0; n], |v| scaling.scale_primal(v));
        let y0 = prob.y0.as_ref().map_or_else(|| vec![0.0; m], |v| scaling.scale_dual(v));
        let z0 = prob.z0.as_ref().map_or_else(|| vec![0.0; n], |v| scaling.scale_dual(v));
        (model, x0, y0, z0)
    };

    let mut newton = NewtonSolver::new(settings);
    info!(
        "pdco: n={} m={} low={} upp={} fixed={} family={} scaling=(β={:.1e}, ζ={:.1e})",
        n,
        m,
        model.bounds.low.len(),
        model.bounds.upp.len(),
        model.bounds.fixed.len(),
        newton.family(),
        scaling.beta,
        scaling.zeta,
    );

    let mut st = IterateState::initial(&model, &x0, &y0, &z0, settings.x0_min, settings.z0_min, settings.mu0);
    let mut eval = {
        let _g = timers.scoped(PerfSection::Evaluation);
        model.objective.evaluate(&st.x)
    };
    let mut res = {
        let _g = timers.scoped(PerfSection::Residuals);
        model.residuals(&st, &eval.gradient)
    };
    log.record(
        snapshot(0, &model, &st, &res, model.objective_value(&st, &eval)),
        &diag_cfg,
        settings.verbose,
    );

    let sigma = if settings.inexact_auto_scale && m > 0 {
        prob.a.norm2_estimate(20)
    } else {
        0.0
    };

    let mut iter = 0;
    let mut inner_tol = settings.inner_tol_ceiling;
    let mut inner_iters = Vec::new();
    let mut ls_failures = 0;
    // After a failed linesearch the retry starts below the last step tried.
    let mut step_cap: Option<f64> = None;
    let mut failure: Option<SolverError> = None;

    let status = loop {
        let stop = {
            let _g = timers.scoped(PerfSection::Termination);
            check_termination(&res, iter, start.elapsed().as_millis(), settings)
        };
        if let Some(s) = stop {
            if s == SolveStatus::NumericalError && failure.is_none() {
                failure = Some(SolverError::NonFiniteSolution {
                    iter,
                    pinf: res.pinf,
                    dinf: res.dinf,
                });
            }
            break s;
        }
        iter += 1;

        let auto = if settings.inexact_auto_scale {
            auto_scale_bound(st.mu, norm1(&st.y), norm1(&st.x), sigma)
        } else {
            None
        };
        inner_tol = inner_tolerance(inner_tol, &res, auto, settings);

        let h_barrier = barrier_diagonal(&model, &st);
        let w = newton_rhs(&model, &st, &res);
        let sys = NewtonSystem {
            iter,
            a: model.a,
            curvature: &eval.curvature,
            h_barrier: &h_barrier,
            bounds: &model.bounds,
            d2sq: &model.d2sq,
            w: &w,
            r1: &res.r1,
            inner_tol,
            pinf: res.pinf,
            dinf: res.dinf,
        };
        let solved = {
            let _g = timers.scoped(PerfSection::NewtonSolve);
            newton.solve(&sys)
        };
        let dir = match solved {
            Ok(dir) => dir,
            Err(e) if e.is_setup_error() => return Err(e),
            Err(e) => {
                let s = status_for(&e);
                failure = Some(e);
                break s;
            }
        };
        record_notes(&mut log, iter, &dir);
        let inner = dir.inner.clone();
        let exact_error = dir.exact_error;
        inner_iters.push(inner.as_ref().map_or(0, |s| s.iters));

        let (step_dir, max_x, max_z, steps) = {
            let _g = timers.scoped(PerfSection::StepLength);
            let step_dir = StepDirection::expand(&st, &res, &model.bounds, dir.dx, dir.dy);
            let (max_x, max_z) = ratio_test(&st, &step_dir, &model.bounds);
            let steps = capped_steps(
                damped_steps(max_x, max_z, settings.step_tol, settings.step_same),
                step_cap.take(),
            );
            (step_dir, max_x, max_z, steps)
        };
        debug!(
            "iter {}: ratio test ({:.2e}, {:.2e}) → steps ({:.3}, {:.3})",
            iter, max_x, max_z, steps.0, steps.1
        );

        let outcome = {
            let _g = timers.scoped(PerfSection::LineSearch);
            linesearch(&model, &st, res.merit, &step_dir, steps, settings.backtrack, settings.max_backtracks)
        };

        let mut rec = match outcome {
            LinesearchOutcome::Failed { backtracks, last_step } => {
                ls_failures += 1;
                log.event(DiagnosticEvent::LinesearchFailure { iter, backtracks });
                let mut rec = snapshot(iter, &model, &st, &res, model.objective_value(&st, &eval));
                rec.backtracks = backtracks;
                rec.max_stepx = max_x;
                rec.max_stepz = max_z;
                rec.inner_tol = inner_tol;
                rec.inner_iters = inner.as_ref().map_or(0, |s| s.iters);
                rec.inner_rel_resid = inner.as_ref().map(|s| s.rel_resid);
                rec.inner_status = inner.as_ref().map(|s| s.status);
                rec.exact_error = exact_error;
                log.record(rec, &diag_cfg, settings.verbose);
                step_cap = Some(0.5 * last_step);
                inner_tol = (0.1 * inner_tol).max(settings.inner_tol_floor);
                if ls_failures > settings.max_linesearch_failures {
                    failure = Some(SolverError::LinesearchExhausted { iter, backtracks });
                    break SolveStatus::LinesearchFailed;
                }
                continue;
            }
            LinesearchOutcome::Accepted(acc) => {
                ls_failures = 0;
                let acc = *acc;
                st = acc.state;
                eval = acc.eval;
                res = acc.residuals;

                let (mu, held) = next_mu(st.mu, acc.stepx, acc.stepz, &res, settings);
                if held {
                    log.event(DiagnosticEvent::CenteringHold { iter, center: res.center });
                }
                st.mu = mu;
                res = {
                    let _g = timers.scoped(PerfSection::Residuals);
                    model.residuals(&st, &eval.gradient)
                };

                let mut rec = snapshot(iter, &model, &st, &res, model.objective_value(&st, &eval));
                rec.stepx = acc.stepx;
                rec.stepz = acc.stepz;
                rec.backtracks = acc.backtracks;
                rec
            }
        };
        rec.max_stepx = max_x;
        rec.max_stepz = max_z;
        rec.inner_tol = inner_tol;
        rec.inner_iters = inner.as_ref().map_or(0, |s| s.iters);
        rec.inner_rel_resid = inner.as_ref().map(|s| s.rel_resid);
        rec.inner_status = inner.as_ref().map(|s| s.status);
        rec.exact_error = exact_error;
        let min_step = rec.stepx.min(rec.stepz);
        log.record(rec, &diag_cfg, settings.verbose);

        if min_step < settings.min_step {
            break SolveStatus::StepTooSmall;
        }
    };

    let objective = model.objective_value(&st, &eval);
    let mut x = scaling.unscale_primal(&st.x);
    for &j in &model.bounds.fixed {
        x[j] = prob.bl[j];
    }
    let z1 = scaling.unscale_dual(&st.z1);
    let z2 = scaling.unscale_dual(&st.z2);
    let z = z1.iter().zip(&z2).map(|(a, b)| a - b).collect();
    let obj_val = scaling.unscale_objective(objective);

    let info = SolveInfo {
        iters: iter,
        inner_iters_total: inner_iters.iter().sum(),
        inner_iters,
        solve_time: start.elapsed(),
        timers,
        pinf: res.pinf,
        dinf: res.dinf,
        cinf0: res.cinf0,
        mu: st.mu,
    };
    info!(
        "pdco: {} after {} iterations ({} inner), obj={:.8e}, pinf={:.1e} dinf={:.1e} cinf0={:.1e}, {:.3}s",
        status,
        info.iters,
        info.inner_iters_total,
        obj_val,
        info.pinf,
        info.dinf,
        info.cinf0,
        info.solve_time.as_secs_f64(),
    );

    Ok(SolveResult {
        status,
        failure,
        x,
        y: scaling.unscale_dual(&st.y),
        z,
        z1,
        z2,
        obj_val,
        info,
        diagnostics: log,
    })
}
