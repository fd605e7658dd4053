//! # CredentialsRequest Status
//!
//! Observed state owned exclusively by the reconciler, plus condition helpers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types reported on a CredentialsRequest
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROVISIONED: &str = "CredentialsProvisioned";
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Status of the CredentialsRequest resource
///
/// Written only by the reconciler, through the status subresource.
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRequestStatus {
    /// Whether the target secret currently holds provisioned credentials
    #[serde(default)]
    pub provisioned: bool,
    /// Last successful sync time (RFC3339)
    #[serde(default)]
    pub last_sync_timestamp: Option<String>,
    /// Desired-state generation last successfully applied
    #[serde(default)]
    pub last_sync_generation: Option<i64>,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Provider-specific opaque blob used to re-identify cloud-side objects
    /// across reconciles (e.g. the minted principal name)
    #[serde(default)]
    pub provider_status: Option<serde_json::Value>,
    /// Known expiry of the delivered credentials (RFC3339), if any.
    /// Drives accelerated rotation checks when approaching.
    #[serde(default)]
    pub credentials_expire_at: Option<String>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

/// Set a condition in place, bumping the transition time only when the
/// status value actually flips. Reason/message updates alone keep the
/// original transition time.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    r#type: &str,
    status: &str,
    reason: &str,
    message: Option<&str>,
) {
    let now = chrono::Utc::now().to_rfc3339();
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == r#type) {
        if existing.status != status {
            existing.last_transition_time = Some(now);
        }
        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = message.map(|s| s.to_string());
        return;
    }
    conditions.push(Condition {
        r#type: r#type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(now),
        reason: Some(reason.to_string()),
        message: message.map(|s| s.to_string()),
    });
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            CONDITION_READY,
            "True",
            "ReconciliationSucceeded",
            None,
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].r#type, CONDITION_READY);
        assert!(conditions[0].last_transition_time.is_some());
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = vec![Condition {
            r#type: CONDITION_DEGRADED.to_string(),
            status: "True".to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("TransientCloudError".to_string()),
            message: None,
        }];
        set_condition(
            &mut conditions,
            CONDITION_DEGRADED,
            "True",
            "TransientCloudError",
            Some("still throttled"),
        );
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("still throttled"));
    }

    #[test]
    fn test_set_condition_bumps_transition_time_on_flip() {
        let mut conditions = vec![Condition {
            r#type: CONDITION_READY.to_string(),
            status: "False".to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: None,
            message: None,
        }];
        set_condition(
            &mut conditions,
            CONDITION_READY,
            "True",
            "ReconciliationSucceeded",
            None,
        );
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_find_condition() {
        let mut conditions = vec![];
        set_condition(&mut conditions, CONDITION_PROVISIONED, "True", "Minted", None);
        assert!(find_condition(&conditions, CONDITION_PROVISIONED).is_some());
        assert!(find_condition(&conditions, CONDITION_DEGRADED).is_none());
    }
}
