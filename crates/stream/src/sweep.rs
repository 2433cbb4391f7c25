// Copyright 2025-2026 CEMAXECUTER LLC

//! Stepped frequency sweep over a running session.
//!
//! Every step is an ordinary reconfigure: the acquisition loop closes the
//! stream, retunes and reopens it, so each block carries the frequency it
//! was captured at.

use std::time::Duration;

use crossbeam::channel;
use tokio::sync::oneshot;

use rf_sdr::{Error, Result};

use crate::acquisition::{Command, ConfigCell};
use crate::supervisor::request;

/// HackRF's widest instantaneous bandwidth.
pub const DEFAULT_STEP: f64 = 20e6;
/// Pause before retrying a step that did not apply.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPlan {
    /// Hz
    pub start: f64,
    /// Hz, inclusive
    pub stop: f64,
    /// Hz
    pub step: f64,
    /// Time spent on each frequency
    pub dwell: Duration,
}

impl SweepPlan {
    pub fn new(start: f64, stop: f64, step: f64, dwell: Duration) -> Result<Self> {
        for (name, value) in [("start", start), ("stop", stop), ("step", step)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::InvalidParameter(format!(
                    "sweep {} must be positive, got {}",
                    name, value
                )));
            }
        }
        if start >= stop {
            return Err(Error::InvalidParameter(format!(
                "sweep start ({:.3} MHz) must be below stop ({:.3} MHz)",
                start / 1e6,
                stop / 1e6
            )));
        }
        if dwell.is_zero() {
            return Err(Error::InvalidParameter("sweep dwell must be non-zero".into()));
        }
        Ok(Self {
            start,
            stop,
            step,
            dwell,
        })
    }

    /// Frequencies visited per pass.
    pub fn steps(&self) -> usize {
        ((self.stop - self.start) / self.step).floor() as usize + 1
    }

    pub fn frequencies(&self) -> Frequencies {
        Frequencies {
            plan: *self,
            index: 0,
        }
    }
}

/// Endless `start, start + step, ..` that goes back to `start` once the
/// next frequency would pass `stop`.
#[derive(Debug, Clone)]
pub struct Frequencies {
    plan: SweepPlan,
    index: usize,
}

impl Iterator for Frequencies {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let mut freq = self.plan.start + self.index as f64 * self.plan.step;
        if freq > self.plan.stop {
            self.index = 0;
            freq = self.plan.start;
        }
        self.index += 1;
        Some(freq)
    }
}

/// Retune the session through `plan` until `stop` fires (or its sender is
/// dropped) or the session goes away. A step already sent is always
/// waited for, so nothing retunes after this returns.
pub(crate) async fn run(
    plan: SweepPlan,
    commands: channel::Sender<Command>,
    applied: ConfigCell,
    reply_timeout: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    log::info!(
        "sweep {:.3}-{:.3} MHz, {} step(s) of {:.3} MHz, dwell {:?}",
        plan.start / 1e6,
        plan.stop / 1e6,
        plan.steps(),
        plan.step / 1e6,
        plan.dwell
    );
    let mut frequencies = plan.frequencies();
    let mut pending = frequencies.next();

    while let Some(freq) = pending {
        let config = applied.get().with_frequency(freq);
        let pause = match request(&commands, reply_timeout, |reply| Command::Reconfigure { config, reply }).await {
            Ok(()) => plan.dwell,
            Err(Error::PartialApply(report)) => {
                log::warn!("sweep step {:.3} MHz: {}", freq / 1e6, report);
                plan.dwell
            }
            Err(Error::NoSession) => {
                log::info!("session ended, sweep stopping");
                return;
            }
            Err(e) => {
                log::error!("sweep step {:.3} MHz failed: {}", freq / 1e6, e);
                tokio::select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(RETRY_PAUSE) => {}
                }
                continue;
            }
        };
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(pause) => {}
        }
        pending = frequencies.next();
    }
    log::info!("sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(start: f64, stop: f64, step: f64) -> SweepPlan {
        SweepPlan::new(start, stop, step, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let dwell = Duration::from_millis(10);
        assert!(matches!(
            SweepPlan::new(500e6, 100e6, DEFAULT_STEP, dwell),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            SweepPlan::new(100e6, 100e6, DEFAULT_STEP, dwell),
            Err(Error::InvalidParameter(_))
        ));
        assert!(SweepPlan::new(100e6, 200e6, 0.0, dwell).is_err());
        assert!(SweepPlan::new(-1.0, 200e6, DEFAULT_STEP, dwell).is_err());
        assert!(SweepPlan::new(100e6, f64::INFINITY, DEFAULT_STEP, dwell).is_err());
        assert!(SweepPlan::new(100e6, 200e6, DEFAULT_STEP, Duration::ZERO).is_err());
    }

    #[test]
    fn test_steps_up_to_stop_inclusive() {
        let p = plan(100e6, 160e6, 20e6);
        assert_eq!(p.steps(), 4);
        let freqs: Vec<f64> = p.frequencies().take(4).collect();
        assert_eq!(freqs, vec![100e6, 120e6, 140e6, 160e6]);
    }

    #[test]
    fn test_wraps_back_to_start() {
        // 160 MHz would pass the stop, so the pass ends at 140 MHz.
        let p = plan(100e6, 150e6, 20e6);
        assert_eq!(p.steps(), 3);
        let freqs: Vec<f64> = p.frequencies().take(7).collect();
        assert_eq!(freqs, vec![100e6, 120e6, 140e6, 100e6, 120e6, 140e6, 100e6]);
    }

    #[test]
    fn test_step_wider_than_range() {
        let freqs: Vec<f64> = plan(100e6, 110e6, 20e6).frequencies().take(3).collect();
        assert_eq!(freqs, vec![100e6, 100e6, 100e6]);
    }
}
