//! Policy-level behavior: rotation scheduling, failure backoff, secret
//! drift detection, and derived naming, exercised through the public API.

use chrono::{Duration as ChronoDuration, Utc};
use cloud_credential_controller::config::{parse_kubernetes_duration, ControllerConfig};
use cloud_credential_controller::controller::actuator::derived_principal_name;
use cloud_credential_controller::controller::reconciler::backoff::{delay_for, BackoffTracker};
use cloud_credential_controller::controller::reconciler::rotation::next_check_after;
use cloud_credential_controller::controller::reconciler::secret_sync::content_hash;
use cloud_credential_controller::controller::{CredentialsError, Mode, RetryClass};
use cloud_credential_controller::runtime::error_policy::{classify_watch_error, WatchErrorClass};
use cloud_credential_controller::CredentialsRequest;
use std::collections::BTreeMap;
use std::time::Duration;

fn request_with_status(generation: i64, observed: i64, expires_at: Option<String>) -> CredentialsRequest {
    let mut request: CredentialsRequest = serde_json::from_value(serde_json::json!({
        "apiVersion": "cloudcredential.microscaler.io/v1",
        "kind": "CredentialsRequest",
        "metadata": {"name": "image-registry", "namespace": "registry", "generation": generation},
        "spec": {
            "providerSpec": {
                "aws": {
                    "statementEntries": [
                        {"effect": "Allow", "action": ["s3:GetObject"], "resource": "*"}
                    ]
                }
            },
            "secretRef": {"name": "registry-creds", "namespace": "registry"}
        }
    }))
    .expect("valid request");
    let mut status = cloud_credential_controller::CredentialsRequestStatus::default();
    status.last_sync_generation = Some(observed);
    status.credentials_expire_at = expires_at;
    request.status = Some(status);
    request
}

#[test]
fn rotation_schedule_prefers_urgency() {
    let baseline = Duration::from_secs(7200);
    let margin = Duration::from_secs(1800);
    let now = Utc::now();

    // Steady state rides the baseline
    let steady = request_with_status(2, 2, None);
    assert_eq!(next_check_after(&steady, now, baseline, margin), baseline);

    // An unapplied spec edit outranks everything
    let edited = request_with_status(3, 2, None);
    assert_eq!(
        next_check_after(&edited, now, baseline, margin),
        Duration::ZERO
    );

    // An expiry closing in pulls the check inside the baseline
    let expiring = request_with_status(
        2,
        2,
        Some((now + ChronoDuration::minutes(45)).to_rfc3339()),
    );
    let next = next_check_after(&expiring, now, baseline, margin);
    assert!(next < baseline);
    assert!(next <= Duration::from_secs(15 * 60));
}

#[test]
fn backoff_is_capped_and_recoverable() {
    let tracker = BackoffTracker::new(Duration::from_secs(5), Duration::from_secs(900));

    let mut last = Duration::ZERO;
    for _ in 0..14 {
        let delay = tracker.record_failure("registry/image-registry");
        assert!(delay <= Duration::from_secs(900));
        assert!(delay >= last, "delay must not decrease across a failure streak");
        last = delay;
    }

    tracker.reset("registry/image-registry");
    let fresh = tracker.record_failure("registry/image-registry");
    assert!(fresh <= Duration::from_secs(5));
}

#[test]
fn backoff_jitter_separates_noisy_neighbors() {
    let delays: Vec<Duration> = (0..16)
        .map(|i| {
            delay_for(
                6,
                Duration::from_secs(5),
                Duration::from_secs(900),
                &format!("team-{i}/request"),
            )
        })
        .collect();
    let distinct: std::collections::HashSet<_> = delays.iter().collect();
    assert!(distinct.len() > 4, "expected jitter to spread delays");
}

#[test]
fn retry_classes_route_each_error_kind() {
    assert_eq!(
        CredentialsError::TransientCloud("throttled".into()).retry_class(),
        RetryClass::Backoff
    );
    assert_eq!(
        CredentialsError::StoreConflict("409".into()).retry_class(),
        RetryClass::Immediate
    );
    assert_eq!(
        CredentialsError::Conflict("owned elsewhere".into()).retry_class(),
        RetryClass::Baseline
    );
    assert_eq!(
        CredentialsError::Authorization("denied".into()).reason(),
        "CloudAuthorizationFailed"
    );
}

#[test]
fn content_hash_detects_tampering() {
    let mut delivered = BTreeMap::new();
    delivered.insert("aws_access_key_id".to_string(), "AKIA123".to_string());
    delivered.insert("aws_secret_access_key".to_string(), "secret".to_string());
    let original = content_hash(&delivered);

    delivered.insert("aws_secret_access_key".to_string(), "tampered".to_string());
    assert_ne!(original, content_hash(&delivered));
}

#[test]
fn derived_names_fit_provider_limits() {
    let aws = derived_principal_name(
        "a-rather-long-namespace-for-a-platform-team",
        "credentials-request-for-the-image-registry",
        None,
        64,
    );
    assert!(aws.len() <= 64);

    let gcp = derived_principal_name(
        "a-rather-long-namespace-for-a-platform-team",
        "credentials-request-for-the-image-registry",
        None,
        30,
    );
    assert!(gcp.len() <= 30);

    // Truncation appends a digest so near-identical long names stay distinct
    let sibling = derived_principal_name(
        "a-rather-long-namespace-for-a-platform-team",
        "credentials-request-for-the-image-registry-2",
        None,
        30,
    );
    assert_ne!(gcp, sibling);
}

#[test]
fn mode_override_parses_from_config() {
    assert_eq!("mint".parse::<Mode>().unwrap(), Mode::Mint);
    assert_eq!("Manual".parse::<Mode>().unwrap(), Mode::Manual);
    assert!("automagic".parse::<Mode>().is_err());

    let config = ControllerConfig::default();
    assert!(config.mode_override.is_none());
    assert_eq!(
        config.base_reconcile_interval,
        parse_kubernetes_duration("2h").unwrap()
    );
}

#[test]
fn watch_errors_classify_for_alerting() {
    assert_eq!(
        classify_watch_error("401 Unauthorized"),
        WatchErrorClass::AuthFailure
    );
    assert_eq!(
        classify_watch_error("watch error: 410 Gone"),
        WatchErrorClass::ResourceVersionExpired
    );
    assert_eq!(
        classify_watch_error("timeout awaiting response"),
        WatchErrorClass::Other
    );
}
