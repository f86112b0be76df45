use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::smoother::Smoother;

// ---------------------------------------------------------------------------
// Export snapshot
// ---------------------------------------------------------------------------

/// Flat `id -> value` / `id_valid -> flag` mapping handed to the export
/// surface. Rebuilt from scratch on every export call.
pub type Export = BTreeMap<String, Measurement>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Measurement {
    Value(f64),
    Flag(bool),
}

/// Write a numeric reading and its validity, rounded to two decimals.
pub fn insert_value(out: &mut Export, id: &str, value: f64, valid: bool) {
    out.insert(id.to_string(), Measurement::Value(round2(value)));
    out.insert(format!("{id}_valid"), Measurement::Flag(valid));
}

/// Write a boolean reading (switch state) and its validity.
pub fn insert_flag(out: &mut Export, id: &str, value: bool, valid: bool) {
    out.insert(id.to_string(), Measurement::Flag(value));
    out.insert(format!("{id}_valid"), Measurement::Flag(valid));
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Per-channel watcher state
// ---------------------------------------------------------------------------

/// Smoothed value plus the time of the last accepted sample. Lives behind
/// its watcher's lock; the exporter only ever copies out of it.
#[derive(Debug, Clone)]
pub struct ChannelState {
    smoother: Smoother,
    updated: Option<Instant>,
}

impl ChannelState {
    pub fn new(window: usize) -> Self {
        Self {
            smoother: Smoother::new(window),
            updated: None,
        }
    }

    pub fn record(&mut self, sample: f64, at: Instant) {
        self.smoother.push(sample);
        self.updated = Some(at);
    }

    pub fn value(&self) -> f64 {
        self.smoother.current()
    }

    #[cfg(test)]
    pub fn updated(&self) -> Option<Instant> {
        self.updated
    }

    /// True while the last accepted sample is younger than `timeout`.
    pub fn is_fresh(&self, now: Instant, timeout: Duration) -> bool {
        is_fresh(self.updated, now, timeout)
    }
}

pub fn is_fresh(updated: Option<Instant>, now: Instant, timeout: Duration) -> bool {
    updated.is_some_and(|at| now.saturating_duration_since(at) < timeout)
}

// ===========================================================================
// Tests
// ===========================================================================
