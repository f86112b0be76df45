//! Median filter over a bounded window of recent samples.
//!
//! Rejects single-reading outliers (bus glitches, a torn serial line that
//! still happened to parse) while bounding how long a real change takes to
//! show up: at most `window / 2 + 1` samples.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Smoother {
    samples: VecDeque<f64>,
    capacity: usize,
    value: f64,
}

impl Smoother {
    /// A window of zero disables smoothing: only the latest sample is kept.
    pub fn new(window: usize) -> Self {
        let capacity = window.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            value: 0.0,
        }
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.value = median(&self.samples);
    }

    /// Median of the retained samples, or 0 before the first push.
    pub fn current(&self) -> f64 {
        self.value
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn median(samples: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
