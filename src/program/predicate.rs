//! Settle decisions: when has the chamber reached a setpoint?
//!
//! A [`SettlePredicate`] is fed one temperature per poll together with the
//! time elapsed since the setpoint was commanded. Three implementations:
//!
//! - [`StabilityPredicate`]: the last N samples agree within a tolerance and
//!   a minimum dwell has passed (calibration).
//! - [`DriftPredicate`]: the least-squares slope over a trailing time window
//!   stays below a threshold for k consecutive polls (baking).
//! - [`ConditioningPredicate`]: the chamber is at or below a temperature
//!   (calibration cycle preconditioning).

use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of one observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep polling.
    Settling,
    /// The setpoint may be recorded.
    Settled,
}

/// Decides when the chamber has settled at a setpoint.
pub trait SettlePredicate: Send {
    /// Feeds one sample taken `elapsed` after the setpoint command.
    fn observe(&mut self, elapsed: Duration, temperature_c: f64) -> Verdict;

    /// Forgets all history, e.g. after a pause.
    fn reset(&mut self);

    /// Latest drift estimate in °C/min, if the predicate computes one.
    fn drift_rate(&self) -> Option<f64> {
        None
    }
}

/// Samples needed before a slope is trusted.
pub const MIN_DRIFT_SAMPLES: usize = 3;

/// Least-squares slope of `(seconds, °C)` samples, in °C per minute.
///
/// `None` with fewer than [`MIN_DRIFT_SAMPLES`] samples or when every sample
/// has the same timestamp.
pub fn slope_per_minute(samples: &[(f64, f64)]) -> Option<f64> {
    if samples.len() < MIN_DRIFT_SAMPLES {
        return None;
    }
    let n = samples.len() as f64;
    let mean_t = samples.iter().map(|(t, _)| t).sum::<f64>() / n;
    let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (t, y) in samples {
        sxy += (t - mean_t) * (y - mean_y);
        sxx += (t - mean_t) * (t - mean_t);
    }
    if sxx <= f64::EPSILON {
        return None;
    }
    Some(sxy / sxx * 60.0)
}

/// Settled when the last `window` samples agree within `tolerance_c` and
/// `min_dwell` has passed.
#[derive(Debug)]
pub struct StabilityPredicate {
    tolerance_c: f64,
    window: usize,
    min_dwell: Duration,
    recent: VecDeque<f64>,
}

impl StabilityPredicate {
    /// A window of zero is treated as one sample.
    pub fn new(tolerance_c: f64, window: usize, min_dwell: Duration) -> Self {
        Self {
            tolerance_c,
            window: window.max(1),
            min_dwell,
            recent: VecDeque::with_capacity(window),
        }
    }

    /// Max minus min of the current window.
    pub fn spread(&self) -> Option<f64> {
        let max = self.recent.iter().copied().reduce(f64::max)?;
        let min = self.recent.iter().copied().reduce(f64::min)?;
        Some(max - min)
    }
}

impl SettlePredicate for StabilityPredicate {
    fn observe(&mut self, elapsed: Duration, temperature_c: f64) -> Verdict {
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(temperature_c);

        let full = self.recent.len() == self.window;
        let agreed = self.spread().is_some_and(|s| s <= self.tolerance_c);
        if full && agreed && elapsed >= self.min_dwell {
            Verdict::Settled
        } else {
            Verdict::Settling
        }
    }

    fn reset(&mut self) {
        self.recent.clear();
    }
}

/// Settled when the fitted slope stays under the threshold for
/// `required_polls` polls in a row.
#[derive(Debug)]
pub struct DriftPredicate {
    threshold_c_per_min: f64,
    window: Duration,
    required_polls: u32,
    samples: VecDeque<(f64, f64)>,
    below: u32,
    rate: Option<f64>,
}

impl DriftPredicate {
    /// Slope is fitted over the trailing `window`.
    pub fn new(threshold_c_per_min: f64, window: Duration, required_polls: u32) -> Self {
        Self {
            threshold_c_per_min,
            window,
            required_polls: required_polls.max(1),
            samples: VecDeque::new(),
            below: 0,
            rate: None,
        }
    }
}

impl SettlePredicate for DriftPredicate {
    fn observe(&mut self, elapsed: Duration, temperature_c: f64) -> Verdict {
        let now = elapsed.as_secs_f64();
        self.samples.push_back((now, temperature_c));
        let horizon = now - self.window.as_secs_f64();
        while self.samples.front().is_some_and(|(t, _)| *t < horizon) {
            self.samples.pop_front();
        }

        self.rate = slope_per_minute(self.samples.make_contiguous());
        match self.rate {
            Some(rate) if rate.abs() < self.threshold_c_per_min => self.below += 1,
            _ => self.below = 0,
        }
        if self.below >= self.required_polls {
            Verdict::Settled
        } else {
            Verdict::Settling
        }
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.below = 0;
        self.rate = None;
    }

    fn drift_rate(&self) -> Option<f64> {
        self.rate
    }
}

/// Settled once the chamber is at or below `target_c`.
#[derive(Debug)]
pub struct ConditioningPredicate {
    target_c: f64,
}

impl ConditioningPredicate {
    /// Waits for the chamber to drop to `target_c`.
    pub fn new(target_c: f64) -> Self {
        Self { target_c }
    }
}

impl SettlePredicate for ConditioningPredicate {
    fn observe(&mut self, _elapsed: Duration, temperature_c: f64) -> Verdict {
        if temperature_c <= self.target_c {
            Verdict::Settled
        } else {
            Verdict::Settling
        }
    }

    fn reset(&mut self) {}
}
