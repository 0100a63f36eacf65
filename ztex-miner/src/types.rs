//! Core types shared across the miner.

use std::fmt;
use std::iter::Sum;

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Create from megahashes per second
    pub fn from_megahashes(mh: f64) -> Self {
        Self((mh * 1_000_000.0) as u64)
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Get value as terahashes per second
    pub fn as_terahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000_000.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000_000 {
            format!("{:.2} TH/s", self.as_terahashes())
        } else if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.as_gigahashes())
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}

impl Sum for HashRate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|r| r.0).sum())
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0 as f64
    }
}

/// Exponentially weighted average.
///
/// Both the running sum and the sample weight decay by the same factor on
/// every observation, so `value()` is the recent mean with older samples
/// fading out. The weight starts slightly above zero to keep the mean
/// defined before the first sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayingAverage {
    sum: f64,
    weight: f64,
    decay: f64,
}

impl DecayingAverage {
    pub const fn new(decay: f64) -> Self {
        Self {
            sum: 0.0,
            weight: 1e-6,
            decay,
        }
    }

    pub fn record(&mut self, sample: f64) {
        self.sum = self.sum * self.decay + sample;
        self.weight = self.weight * self.decay + 1.0;
    }

    pub fn value(&self) -> f64 {
        self.sum / self.weight
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}
