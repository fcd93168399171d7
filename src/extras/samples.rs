// src/extras/samples.rs
// Combining repeated contact heights into one value.

use heapless::Vec;

use crate::extras::probe_params::MAX_SAMPLES;

/// Weighted average of a fast and a slow sample, favouring the slow one.
pub fn weighted_double(fast_z: f64, slow_z: f64) -> f64 {
    (slow_z * 3.0 + fast_z * 2.0) / 5.0
}

/// Heights measured at one XY, kept in ascending order.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    values: Vec<f64, MAX_SAMPLES>,
}

impl SampleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts keeping the set sorted. Gives the value back when full.
    pub fn insert(&mut self, z: f64) -> Result<(), f64> {
        let idx = self.values.iter().position(|&v| v > z).unwrap_or(self.values.len());
        self.values.insert(idx, z)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Centre value, or the mean of the two centre values for an even count.
    pub fn median(&self) -> f64 {
        let n = self.values.len();
        if n == 0 {
            return f64::NAN;
        }
        let half = (n - 1) / 2;
        let middle = self.values[half];
        if n % 2 == 1 {
            middle
        } else {
            (middle + self.values[half + 1]) * 0.5
        }
    }

    pub fn mean(&self) -> f64 {
        self.trimmed_mean(0)
    }

    /// Mean after dropping the `discard` values farthest from the median.
    /// On equal distance the low end is dropped first.
    pub fn trimmed_mean(&self, discard: usize) -> f64 {
        let n = self.values.len();
        if n == 0 {
            return f64::NAN;
        }
        let discard = discard.min(n - 1);
        let median = self.median();
        let (mut lo, mut hi) = (0, n - 1);
        for _ in 0..discard {
            if (self.values[hi] - median).abs() > (self.values[lo] - median).abs() {
                hi -= 1;
            } else {
                lo += 1;
            }
        }
        let kept = &self.values[lo..=hi];
        kept.iter().sum::<f64>() / kept.len() as f64
    }
}
