//! # Cloud API Rate Limiting
//!
//! Token-bucket limiter sitting in front of each cloud backend. Acquisition
//! that cannot complete within the configured timeout surfaces as a
//! transient error so the request retries with backoff instead of queueing
//! unboundedly.

use crate::config::RateLimitConfig;
use crate::controller::error::CredentialsError;
use crate::crd::provider::ProviderKind;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::warn;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with continuous refill
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    acquire_timeout: Duration,
    state: Mutex<BucketState>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            acquire_timeout: config.acquire_timeout,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting up to the acquire timeout for refill
    pub async fn acquire(&self, provider: ProviderKind) -> Result<(), CredentialsError> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                // Seconds until one full token accrues
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };

            if Instant::now() + wait > deadline {
                warn!(
                    "Rate limiter for {} saturated, deferring cloud call",
                    provider
                );
                return Err(CredentialsError::TransientCloud(format!(
                    "{provider} rate limiter saturated after {:?}",
                    self.acquire_timeout
                )));
            }
            sleep(wait).await;
        }
    }
}

/// One bucket per provider backend
pub struct RateLimiterSet {
    buckets: HashMap<ProviderKind, TokenBucket>,
}

impl std::fmt::Debug for RateLimiterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterSet").finish_non_exhaustive()
    }
}

impl RateLimiterSet {
    pub fn new(limits: &HashMap<ProviderKind, RateLimitConfig>) -> Self {
        let buckets = limits
            .iter()
            .map(|(kind, config)| (*kind, TokenBucket::new(config)))
            .collect();
        Self { buckets }
    }

    /// Acquire a call slot for one backend. Backends without a configured
    /// limit are unthrottled.
    pub async fn acquire(&self, provider: ProviderKind) -> Result<(), CredentialsError> {
        match self.buckets.get(&provider) {
            Some(bucket) => bucket.acquire(provider).await,
            None => Ok(()),
        }
    }
}
