//! # Failure Backoff
//!
//! Capped exponential backoff per request key. Jitter is derived from the
//! key and attempt count, so retry timing is spread across requests without
//! carrying a randomness dependency.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

/// Per-key consecutive-failure bookkeeping
pub struct BackoffTracker {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl std::fmt::Debug for BackoffTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffTracker")
            .field("base", &self.base)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl BackoffTracker {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for this key and return the delay before the next
    /// attempt
    pub fn record_failure(&self, key: &str) -> Duration {
        let attempts = {
            let mut map = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let count = map.entry(key.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        delay_for(attempts, self.base, self.max, key)
    }

    /// A successful pass clears the failure streak
    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    #[cfg(test)]
    pub fn attempts_for(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// `base * 2^(attempts-1)` capped at `max`, with a deterministic per-key
/// jitter of up to 20% subtracted so colliding requests fan out. The jitter
/// depends only on the key, keeping each key's delay non-decreasing across
/// a failure streak.
pub fn delay_for(attempts: u32, base: Duration, max: Duration, key: &str) -> Duration {
    let exponent = attempts.saturating_sub(1).min(20);
    let uncapped = base.saturating_mul(1u32 << exponent);
    let capped = uncapped.min(max);

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let jitter_fraction = (hasher.finish() % 200) as f64 / 1000.0;

    capped.mul_f64(1.0 - jitter_fraction)
}
