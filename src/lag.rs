// Lag Estimator - staleness derived from the newest consumed event timestamp

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Tracks the `updated_at` of the most recently consumed change event.
///
/// The consumer records every event here, including its own echoes and events
/// the merge guard rejects: the metric measures how fresh the log feed is,
/// not how many merges were applied.
#[derive(Debug, Default)]
pub struct LagTracker {
    last_seen: Mutex<Option<DateTime<Utc>>>,
}

impl LagTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, updated_at: DateTime<Utc>) {
        let mut last_seen = self
            .last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *last_seen = Some(updated_at);
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Seconds between now and the newest consumed event. Zero before any
    /// event has been consumed; clamped to zero when cross-region clock skew
    /// puts the event timestamp in this region's future.
    pub fn lag_seconds(&self) -> f64 {
        match self.last_seen() {
            None => 0.0,
            Some(last_seen) => {
                let millis = (Utc::now() - last_seen).num_milliseconds();
                (millis as f64 / 1000.0).max(0.0)
            }
        }
    }
}
