use serde::{Deserialize, Serialize};

/// Incremental mean using Welford's update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    count: u64,
    mean: f64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: f64) {
        self.count += 1;
        self.mean += (sample - self.mean) / self.count as f64;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `None` until the first sample.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.mean)
        }
    }

    /// Mean multiplied back out; useful when weighting means across flows.
    pub fn total(&self) -> f64 {
        self.mean * self.count as f64
    }
}

/// Count-weighted mean of several running means.
pub fn combined_mean<'a, I>(means: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a RunningMean>,
{
    let (count, total) = means
        .into_iter()
        .fold((0u64, 0.0f64), |(c, t), m| (c + m.count(), t + m.total()));
    if count == 0 {
        None
    } else {
        Some(total / count as f64)
    }
}
