//! Per-iteration records and non-fatal events.

use std::env;
use std::fmt;

use log::{info, warn};

use crate::krylov::KrylovStatus;

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub every: usize,
}

impl DiagnosticsConfig {
    pub fn from_env() -> Self {
        let enabled = match env::var("PDCO_DIAGNOSTICS") {
            Ok(v) => v != "0" && v.to_lowercase() != "false",
            Err(_) => false,
        };

        let every = env::var("PDCO_DIAGNOSTICS_EVERY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1);

        Self { enabled, every }
    }

    #[inline]
    pub fn should_log(&self, iter: usize) -> bool {
        self.enabled && (iter % self.every == 0)
    }
}

/// State of the iteration after one accepted (or rejected) step.
#[derive(Debug, Clone, Default)]
pub struct IterationRecord {
    pub iter: usize,
    pub pinf: f64,
    pub dinf: f64,
    pub cinf: f64,
    pub cinf0: f64,
    pub mu: f64,
    pub stepx: f64,
    pub stepz: f64,
    /// Largest steps the ratio test allowed before damping
    pub max_stepx: f64,
    pub max_stepz: f64,
    pub backtracks: usize,
    pub merit: f64,
    /// Scaled objective φ(x) + ½‖D1x‖² + ½‖D2y‖²
    pub objective: f64,
    pub inner_tol: f64,
    pub inner_iters: usize,
    pub inner_rel_resid: Option<f64>,
    pub inner_status: Option<KrylovStatus>,
    pub exact_error: Option<f64>,
    /// min over bounded x1, x2, z1, z2
    pub min_pair: f64,
    /// max(x z) / min(x z)
    pub center: f64,
}

/// Something worth knowing that did not stop the solve.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    InnerEarlyTermination {
        iter: usize,
        tol: f64,
        resid: f64,
        status: KrylovStatus,
    },
    PreconditionerFallback {
        iter: usize,
        from: &'static str,
        to: &'static str,
        reason: String,
    },
    Perturbation {
        iter: usize,
        magnitude: f64,
    },
    ExactErrorUnavailable {
        iter: usize,
        detail: String,
    },
    LinesearchFailure {
        iter: usize,
        backtracks: usize,
    },
    /// μ held because the pairs are badly centered
    CenteringHold {
        iter: usize,
        center: f64,
    },
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticEvent::InnerEarlyTermination { iter, tol, resid, status } => write!(
                f,
                "iter {}: inner solve stopped early ({}), residual {:.2e} vs tolerance {:.2e}",
                iter, status, resid, tol
            ),
            DiagnosticEvent::PreconditionerFallback { iter, from, to, reason } => {
                write!(f, "iter {}: preconditioner {} replaced by {}: {}", iter, from, to, reason)
            }
            DiagnosticEvent::Perturbation { iter, magnitude } => {
                write!(f, "iter {}: Newton matrix perturbed by {:.1e}", iter, magnitude)
            }
            DiagnosticEvent::ExactErrorUnavailable { iter, detail } => {
                write!(f, "iter {}: exact-error reference solve failed: {}", iter, detail)
            }
            DiagnosticEvent::LinesearchFailure { iter, backtracks } => {
                write!(f, "iter {}: linesearch failed after {} backtracks", iter, backtracks)
            }
            DiagnosticEvent::CenteringHold { iter, center } => {
                write!(f, "iter {}: center {:.1e} too large, mu not reduced", iter, center)
            }
        }
    }
}

/// Append-only record of the solve.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsLog {
    pub records: Vec<IterationRecord>,
    pub events: Vec<DiagnosticEvent>,
}

impl DiagnosticsLog {
    pub fn record(&mut self, rec: IterationRecord, config: &DiagnosticsConfig, verbose: bool) {
        if verbose || config.should_log(rec.iter) {
            info!(
                "{:3} pinf={:.1e} dinf={:.1e} cinf0={:.1e} mu={:.1e} step=({:.3}, {:.3}) bt={} obj={:.6e} inner={} ({:.1e})",
                rec.iter,
                rec.pinf,
                rec.dinf,
                rec.cinf0,
                rec.mu,
                rec.stepx,
                rec.stepz,
                rec.backtracks,
                rec.objective,
                rec.inner_iters,
                rec.inner_rel_resid.unwrap_or(0.0),
            );
        }
        self.records.push(rec);
    }

    pub fn event(&mut self, event: DiagnosticEvent) {
        warn!("{}", event);
        self.events.push(event);
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_log_respects_stride() {
        let cfg = DiagnosticsConfig { enabled: true, every: 3 };
        assert!(cfg.should_log(0));
        assert!(!cfg.should_log(2));
        assert!(cfg.should_log(6));
        let off = DiagnosticsConfig { enabled: false, every: 1 };
        assert!(!off.should_log(1));
    }

    #[test]
    fn test_log_appends() {
        let mut log = DiagnosticsLog::default();
        let cfg = DiagnosticsConfig { enabled: false, every: 1 };
        log.record(IterationRecord { iter: 1, ..Default::default() }, &cfg, false);
        log.event(DiagnosticEvent::Perturbation { iter: 1, magnitude: 1e-10 });
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.last().map(|r| r.iter), Some(1));
        assert_eq!(log.events.len(), 1);
    }
}
