//! # Error Policy
//!
//! Maps reconciliation errors onto requeue cadence, and classifies watch
//! stream errors for operator-facing logging.

use crate::controller::error::{CredentialsError, RetryClass};
use crate::controller::reconciler::Context;
use crate::crd::CredentialsRequest;
use crate::observability::metrics;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Decide when a failed request is retried.
///
/// Transient cloud errors back off exponentially per resource so one
/// throttled request does not slow the rest of the queue. Permanent errors
/// ride the baseline interval; the cause will not change quickly, but
/// self-healing still requires another look. Store write conflicts retry
/// immediately without counting against the backoff streak.
pub fn handle_reconciliation_error(
    obj: Arc<CredentialsRequest>,
    error: &CredentialsError,
    ctx: Arc<Context>,
) -> Action {
    metrics::increment_reconciliation_errors();
    let key = obj.owner_key();

    match error.retry_class() {
        RetryClass::Immediate => {
            info!("Write conflict on {}, retrying immediately", key);
            metrics::increment_requeues_total("conflict-retry");
            Action::requeue(Duration::ZERO)
        }
        RetryClass::Backoff => {
            let delay = ctx.backoff.record_failure(&key);
            warn!(
                "Transient failure on {} ({}), retrying in {:?}",
                key, error, delay
            );
            metrics::increment_requeues_total("error-backoff");
            Action::requeue(delay)
        }
        RetryClass::Baseline => {
            warn!(
                "Permanent failure on {} ({}), next attempt at the baseline interval",
                key, error
            );
            metrics::increment_requeues_total("baseline-retry");
            Action::requeue(ctx.config.base_reconcile_interval)
        }
    }
}

/// Coarse classification of watch stream errors for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// 401/403: RBAC revoked or token expired, needs operator attention
    AuthFailure,
    /// 410: resource version expired, the watcher relists on its own
    ResourceVersionExpired,
    /// 429: API server under pressure, retries are already throttled
    Throttled,
    Other,
}

pub fn classify_watch_error(error_string: &str) -> WatchErrorClass {
    if error_string.contains("401")
        || error_string.contains("403")
        || error_string.contains("Unauthorized")
        || error_string.contains("Forbidden")
    {
        WatchErrorClass::AuthFailure
    } else if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        WatchErrorClass::ResourceVersionExpired
    } else if error_string.contains("429") || error_string.contains("TooManyRequests") {
        WatchErrorClass::Throttled
    } else {
        WatchErrorClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_watch_errors() {
        assert_eq!(
            classify_watch_error("ApiError: Unauthorized: 401"),
            WatchErrorClass::AuthFailure
        );
        assert_eq!(
            classify_watch_error("too old resource version: 1 (2)"),
            WatchErrorClass::ResourceVersionExpired
        );
        assert_eq!(
            classify_watch_error("429 TooManyRequests"),
            WatchErrorClass::Throttled
        );
        assert_eq!(
            classify_watch_error("connection reset by peer"),
            WatchErrorClass::Other
        );
    }
}
