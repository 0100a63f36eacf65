//! Per-step error statistics and frequency selection.
//!
//! Every poll outside the settling window is one observation at the active
//! frequency step. The error count and the observation weight both decay by
//! [`DECAY`] before the new sample is added, so the error rate tracks recent
//! behavior. The rate is damped while the weight is small so that a single
//! bad poll on a fresh step does not condemn it. The historical maximum of
//! each step's rate only ever grows; frequency selection works from those
//! maxima.

use crate::types::DecayingAverage;

pub const STEPS: usize = 256;

const DECAY: f64 = 0.995;

/// Steps whose historical error rate reaches this are never selected.
pub const MAX_ERROR_RATE: f64 = 0.1;

/// Score bonus for the active step, in frequency units.
pub const HYSTERESIS: f64 = 0.1;

/// Weight the active step needs before climbing above the default step.
pub const CLIMB_WEIGHT: f64 = 150.0;

#[derive(Debug, Clone, Copy)]
struct StepStats {
    errors: DecayingAverage,
    rate: f64,
    max_rate: f64,
}

impl Default for StepStats {
    fn default() -> Self {
        Self {
            errors: DecayingAverage::new(DECAY),
            rate: 0.0,
            max_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrequencyStatistics {
    steps: Box<[StepStats; STEPS]>,
}

impl Default for FrequencyStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyStatistics {
    pub fn new() -> Self {
        Self {
            steps: Box::new([StepStats::default(); STEPS]),
        }
    }

    /// Record one observation at `step`: `errors` of `total` slots failed
    /// the nonce check.
    pub fn record(&mut self, step: u8, errors: usize, total: usize) {
        let total = total.max(1);
        let s = &mut self.steps[step as usize];
        s.errors.record(errors as f64 / total as f64);
        let weight = s.errors.weight();
        s.rate = s.errors.value() * (weight * 0.01).min(1.0);
        if s.rate > s.max_rate {
            s.max_rate = s.rate;
        }
    }

    pub fn error_rate(&self, step: u8) -> f64 {
        self.steps[step as usize].rate
    }

    pub fn max_error_rate(&self, step: u8) -> f64 {
        self.steps[step as usize].max_rate
    }

    pub fn weight(&self, step: u8) -> f64 {
        self.steps[step as usize].errors.weight()
    }

    /// Highest step currently allowed.
    ///
    /// Climbs from step 0 up to the default while the next step's
    /// historical error rate stays below [`MAX_ERROR_RATE`]. Beyond the
    /// default each step must also have collected [`CLIMB_WEIGHT`] of
    /// observations before the next one is unlocked.
    pub fn max_allowed_step(&self, default_step: u8, max_step: u8) -> u8 {
        let mut m = 0u8;
        while m < default_step && self.max_error_rate(m + 1) < MAX_ERROR_RATE {
            m += 1;
        }
        while m < max_step
            && self.weight(m) > CLIMB_WEIGHT
            && self.max_error_rate(m + 1) < MAX_ERROR_RATE
        {
            m += 1;
        }
        m
    }

    /// Step with the best expected good-hash throughput.
    ///
    /// Score is `(step + 1 + bonus) * (1 - max_error_rate)`, where the bonus
    /// [`HYSTERESIS`] applies to `current` only. A competitor must score
    /// strictly higher to win.
    pub fn best_step(&self, current: u8, default_step: u8, max_step: u8) -> u8 {
        let limit = self.max_allowed_step(default_step, max_step);
        let mut best = 0u8;
        let mut best_score = 0.0;
        for step in 0..=limit {
            let bonus = if step == current { HYSTERESIS } else { 0.0 };
            let score = (step as f64 + 1.0 + bonus) * (1.0 - self.max_error_rate(step));
            if score > best_score {
                best = step;
                best_score = score;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Observations needed before a clean step passes the climb gate.
    fn observations_to_unlock() -> usize {
        let mut stats = FrequencyStatistics::new();
        let mut n = 0;
        while stats.weight(0) <= CLIMB_WEIGHT {
            stats.record(0, 0, 1);
            n += 1;
        }
        n
    }

    #[test]
    fn test_rate_damped_while_weight_is_small() {
        let mut stats = FrequencyStatistics::new();
        stats.record(3, 1, 1);
        // One failed poll: raw rate 1.0, damped by weight 1 * 0.01
        assert!((stats.error_rate(3) - 0.01).abs() < 1e-6);
        assert_eq!(stats.max_error_rate(3), stats.error_rate(3));
    }

    #[test]
    fn test_max_error_rate_never_decreases() {
        let mut stats = FrequencyStatistics::new();
        let mut prev = 0.0;
        for i in 0..1000 {
            let errors = if i < 300 { 1 } else { 0 };
            stats.record(7, errors, 4);
            let max = stats.max_error_rate(7);
            assert!(max >= prev);
            assert!(max >= stats.error_rate(7));
            prev = max;
        }
        assert!(stats.error_rate(7) < stats.max_error_rate(7));
    }

    #[test]
    fn test_clean_device_holds_default_until_weight_gate() {
        let mut stats = FrequencyStatistics::new();
        for _ in 0..50 {
            stats.record(5, 0, 1);
        }
        assert_eq!(stats.best_step(5, 5, 10), 5);
    }

    #[test]
    fn test_clean_device_climbs_to_max_step() {
        let mut stats = FrequencyStatistics::new();
        let mut step = 5;
        let mut trajectory = vec![step];
        for _ in 0..observations_to_unlock() * 6 {
            stats.record(step, 0, 1);
            let next = stats.best_step(step, 5, 10);
            if next != step {
                trajectory.push(next);
                step = next;
            }
        }
        assert_eq!(step, 10);
        assert_eq!(trajectory, vec![5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_step_with_high_error_rate_is_avoided() {
        let mut stats = FrequencyStatistics::new();
        for _ in 0..300 {
            stats.record(6, 1, 2);
        }
        assert!(stats.max_error_rate(6) >= MAX_ERROR_RATE);
        assert_eq!(stats.max_allowed_step(10, 20), 5);
        assert_eq!(stats.best_step(6, 10, 20), 5);
    }

    #[test]
    fn test_repeated_selection_is_stable() {
        let stats = FrequencyStatistics::new();
        for _ in 0..3 {
            assert_eq!(stats.best_step(4, 4, 4), 4);
        }
    }

    #[test]
    fn test_hysteresis_keeps_current_step() {
        let mut stats = FrequencyStatistics::new();
        // Step 9 settles at a 9.5% historical rate: 10 * 0.905 = 9.05.
        // Clean step 8 scores 9.0, or 9.1 with the bonus.
        for _ in 0..400 {
            stats.record(9, 19, 200);
        }
        let rate9 = stats.max_error_rate(9);
        assert!(rate9 > 0.094 && rate9 < MAX_ERROR_RATE);

        assert_eq!(stats.best_step(8, 9, 9), 8);
        assert_eq!(stats.best_step(7, 9, 9), 9);
    }

    #[test]
    fn test_bad_current_step_is_abandoned() {
        let mut stats = FrequencyStatistics::new();
        for _ in 0..400 {
            stats.record(9, 1, 5);
        }
        assert_eq!(stats.best_step(9, 9, 9), 8);
    }
}
