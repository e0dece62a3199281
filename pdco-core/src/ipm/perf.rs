use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone)]
pub enum PerfSection {
    Setup,
    Evaluation,
    Residuals,
    NewtonSolve,
    StepLength,
    LineSearch,
    Termination,
}

/// Wall time spent per phase of the barrier iteration.
#[derive(Debug, Default, Clone)]
pub struct PerfTimers {
    pub setup: Duration,
    pub evaluation: Duration,
    pub residuals: Duration,
    pub newton_solve: Duration,
    pub step_length: Duration,
    pub line_search: Duration,
    pub termination: Duration,
}

impl PerfTimers {
    pub fn scoped(&mut self, section: PerfSection) -> PerfGuard<'_> {
        PerfGuard {
            section,
            start: Instant::now(),
            timers: self,
        }
    }

    pub fn add(&mut self, section: PerfSection, dt: Duration) {
        match section {
            PerfSection::Setup => self.setup += dt,
            PerfSection::Evaluation => self.evaluation += dt,
            PerfSection::Residuals => self.residuals += dt,
            PerfSection::NewtonSolve => self.newton_solve += dt,
            PerfSection::StepLength => self.step_length += dt,
            PerfSection::LineSearch => self.line_search += dt,
            PerfSection::Termination => self.termination += dt,
        }
    }

    pub fn total(&self) -> Duration {
        self.setup
            + self.evaluation
            + self.residuals
            + self.newton_solve
            + self.step_length
            + self.line_search
            + self.termination
    }
}

pub struct PerfGuard<'a> {
    section: PerfSection,
    start: Instant,
    timers: &'a mut PerfTimers,
}

impl Drop for PerfGuard<'_> {
    fn drop(&mut self) {
        self.timers.add(self.section, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_accumulates_on_drop() {
        let mut timers = PerfTimers::default();
        timers.add(PerfSection::NewtonSolve, Duration::from_millis(3));
        {
            let _g = timers.scoped(PerfSection::NewtonSolve);
        }
        assert!(timers.newton_solve >= Duration::from_millis(3));
        assert_eq!(timers.total(), timers.newton_solve);
    }
}
