//! # Rotation Scheduling
//!
//! Decides how soon a successfully reconciled request should be looked at
//! again. Generation advances and the force-rotation annotation demand an
//! immediate pass; a known credential expiry pulls the next check inside the
//! safety margin; everything else rides the baseline interval.

use crate::crd::CredentialsRequest;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// When the next reconcile pass should run after a successful one
pub fn next_check_after(
    request: &CredentialsRequest,
    now: DateTime<Utc>,
    baseline: Duration,
    safety_margin: Duration,
) -> Duration {
    if request.force_rotation_requested() {
        return Duration::ZERO;
    }

    // A spec edit the last pass has not applied yet
    let observed = request
        .status
        .as_ref()
        .and_then(|s| s.last_sync_generation);
    if let (Some(current), Some(observed)) = (request.metadata.generation, observed) {
        if current > observed {
            return Duration::ZERO;
        }
    }

    let expires_at = request
        .status
        .as_ref()
        .and_then(|s| s.credentials_expire_at.as_deref())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));

    if let Some(expires_at) = expires_at {
        let margin = ChronoDuration::from_std(safety_margin).unwrap_or(ChronoDuration::zero());
        let rotate_at = expires_at - margin;
        if rotate_at <= now {
            return Duration::ZERO;
        }
        let until_rotation = (rotate_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if until_rotation < baseline {
            return until_rotation;
        }
    }

    baseline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FORCE_ROTATION_ANNOTATION;
    use crate::crd::CredentialsRequestStatus;

    const BASELINE: Duration = Duration::from_secs(7200);
    const MARGIN: Duration = Duration::from_secs(1800);

    fn request(generation: i64, observed: Option<i64>, expires_at: Option<&str>) -> CredentialsRequest {
        let mut request: CredentialsRequest = serde_json::from_value(serde_json::json!({
            "apiVersion": "cloudcredential.microscaler.io/v1",
            "kind": "CredentialsRequest",
            "metadata": {"name": "req", "namespace": "ns", "generation": generation},
            "spec": {
                "providerSpec": {"aws": {"statementEntries": []}},
                "secretRef": {"name": "creds", "namespace": "ns"}
            }
        }))
        .unwrap();
        request.status = Some(CredentialsRequestStatus {
            last_sync_generation: observed,
            credentials_expire_at: expires_at.map(str::to_string),
            ..CredentialsRequestStatus::default()
        });
        request
    }

    #[test]
    fn test_steady_state_uses_baseline() {
        let req = request(3, Some(3), None);
        assert_eq!(next_check_after(&req, Utc::now(), BASELINE, MARGIN), BASELINE);
    }

    #[test]
    fn test_generation_advance_requeues_immediately() {
        let req = request(4, Some(3), None);
        assert_eq!(
            next_check_after(&req, Utc::now(), BASELINE, MARGIN),
            Duration::ZERO
        );
    }

    #[test]
    fn test_force_rotation_annotation_requeues_immediately() {
        let mut req = request(3, Some(3), None);
        req.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(FORCE_ROTATION_ANNOTATION.to_string(), "now".to_string());
        assert_eq!(
            next_check_after(&req, Utc::now(), BASELINE, MARGIN),
            Duration::ZERO
        );
    }

    #[test]
    fn test_imminent_expiry_shortens_the_interval() {
        let now = Utc::now();
        // Expires one hour out; with a 30m margin the check lands ~30m away,
        // well inside the 2h baseline
        let expires = (now + ChronoDuration::hours(1)).to_rfc3339();
        let req = request(3, Some(3), Some(&expires));
        let next = next_check_after(&req, now, BASELINE, MARGIN);
        assert!(next < Duration::from_secs(1900));
        assert!(next > Duration::from_secs(1700));
    }

    #[test]
    fn test_expiry_inside_margin_requeues_immediately() {
        let now = Utc::now();
        let expires = (now + ChronoDuration::minutes(10)).to_rfc3339();
        let req = request(3, Some(3), Some(&expires));
        assert_eq!(next_check_after(&req, now, BASELINE, MARGIN), Duration::ZERO);
    }

    #[test]
    fn test_distant_expiry_keeps_baseline() {
        let now = Utc::now();
        let expires = (now + ChronoDuration::days(30)).to_rfc3339();
        let req = request(3, Some(3), Some(&expires));
        assert_eq!(next_check_after(&req, now, BASELINE, MARGIN), BASELINE);
    }

    #[test]
    fn test_unparseable_expiry_falls_back_to_baseline() {
        let req = request(3, Some(3), Some("not-a-timestamp"));
        assert_eq!(next_check_after(&req, Utc::now(), BASELINE, MARGIN), BASELINE);
    }
}
