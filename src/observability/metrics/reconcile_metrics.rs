//! # Reconcile Metrics
//!
//! Counters and histograms for reconciliation passes, cloud API traffic,
//! secret writes, and requeue scheduling.

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cloud_credential_reconciliations_total",
        "Total number of reconciliation passes started",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cloud_credential_reconciliation_errors_total",
        "Total number of reconciliation passes that ended in error",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "cloud_credential_reconcile_duration_seconds",
            "Duration of reconciliation passes in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0]),
    )
    .expect("Failed to create RECONCILE_DURATION metric - this should never happen")
});

static CLOUD_API_CALLS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "cloud_credential_cloud_api_calls_total",
            "Total number of cloud IAM API calls by provider and operation",
        ),
        &["provider", "operation"],
    )
    .expect("Failed to create CLOUD_API_CALLS_TOTAL metric - this should never happen")
});

static SECRET_WRITES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cloud_credential_secret_writes_total",
        "Total number of target secret creates and updates",
    )
    .expect("Failed to create SECRET_WRITES_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "cloud_credential_requeues_total",
            "Total number of requeues by trigger source",
        ),
        &["trigger"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

pub(super) fn register(registry: &Registry) -> Result<()> {
    for collector in [
        Box::new(RECONCILIATIONS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RECONCILIATION_ERRORS_TOTAL.clone()),
        Box::new(RECONCILE_DURATION.clone()),
        Box::new(CLOUD_API_CALLS_TOTAL.clone()),
        Box::new(SECRET_WRITES_TOTAL.clone()),
        Box::new(REQUEUES_TOTAL.clone()),
    ] {
        // Re-registration happens in tests that each call register_metrics
        if let Err(e) = registry.register(collector) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconcile_duration(seconds: f64) {
    RECONCILE_DURATION.observe(seconds);
}

pub fn increment_cloud_api_calls(provider: &str, operation: &str) {
    CLOUD_API_CALLS_TOTAL
        .with_label_values(&[provider, operation])
        .inc();
}

pub fn increment_secret_writes() {
    SECRET_WRITES_TOTAL.inc();
}

pub fn increment_requeues_total(trigger: &str) {
    REQUEUES_TOTAL.with_label_values(&[trigger]).inc();
}
