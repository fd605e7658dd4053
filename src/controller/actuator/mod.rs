//! # Credential Actuators
//!
//! Provider-specific provisioning behind a uniform contract. The reconciler
//! drives validate/exists/create/update/delete without knowing which backend
//! it is talking to; actuators own naming, policy rendering, and the shape of
//! the delivered secret fields.

pub mod aws;
pub mod gcp;

use crate::controller::error::CredentialsError;
use crate::controller::mode::Mode;
use crate::controller::ratelimit::RateLimiterSet;
use crate::crd::provider::ProviderKind;
use crate::crd::CredentialsRequest;
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use aws::AwsActuator;
pub use gcp::GcpActuator;

/// Outcome of a successful create or update pass
#[derive(Debug)]
pub struct Provisioned {
    /// Opaque provider bookkeeping persisted into the request status.
    /// Always carries a `kind` field so provider immutability can be
    /// enforced on later passes.
    pub provider_status: serde_json::Value,
    /// Secret fields to deliver to the target secret
    pub secret_fields: BTreeMap<String, String>,
    /// Known expiry of the delivered material, when the backend reports one
    pub expires_at: Option<DateTime<Utc>>,
}

/// Provider-specific provisioning contract.
///
/// Implementations never write to the Kubernetes store; they return desired
/// secret content and status for the reconciler to persist.
#[async_trait]
pub trait CredentialsActuator: Send + Sync {
    fn provider_kind(&self) -> ProviderKind;

    /// Check the request is well-formed for the given mode. Pure; no cloud
    /// calls.
    fn validate(&self, request: &CredentialsRequest, mode: Mode) -> Result<(), CredentialsError>;

    /// Whether cloud-side state for this request already exists. Modes
    /// without cloud-side state report false and take the create path,
    /// which is a pure computation for them.
    async fn exists(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
    ) -> Result<bool, CredentialsError>;

    /// Provision from scratch
    async fn create(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
    ) -> Result<Provisioned, CredentialsError>;

    /// Converge existing cloud-side state. `existing_fields` is the current
    /// target secret content, already verified against its content-hash
    /// annotation; `recorded_status` is the provider status persisted by the
    /// last successful pass. Existing key material is carried forward only
    /// when rotation is not forced and the fields match what the status
    /// records; anything else is re-minted.
    async fn update(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
        existing_fields: Option<&BTreeMap<String, String>>,
        recorded_status: Option<&serde_json::Value>,
        force_rotate: bool,
    ) -> Result<Provisioned, CredentialsError>;

    /// Tear down cloud-side state. Must be idempotent: absence of the
    /// underlying resources is success.
    async fn delete(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
    ) -> Result<(), CredentialsError>;
}

/// Dispatch table from provider kind to actuator
pub struct ActuatorRegistry {
    actuators: HashMap<ProviderKind, Arc<dyn CredentialsActuator>>,
}

impl std::fmt::Debug for ActuatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorRegistry")
            .field("kinds", &self.actuators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActuatorRegistry {
    pub fn new() -> Self {
        Self {
            actuators: HashMap::new(),
        }
    }

    pub fn register(&mut self, actuator: Arc<dyn CredentialsActuator>) {
        self.actuators.insert(actuator.provider_kind(), actuator);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn CredentialsActuator>, CredentialsError> {
        self.actuators.get(&kind).cloned().ok_or_else(|| {
            CredentialsError::Validation(format!("no actuator registered for provider {kind}"))
        })
    }
}

impl Default for ActuatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Gate one cloud API call: take a rate-limit token and count the call
pub(crate) async fn cloud_call(
    limiter: &RateLimiterSet,
    kind: ProviderKind,
    operation: &str,
) -> Result<(), CredentialsError> {
    limiter.acquire(kind).await?;
    metrics::increment_cloud_api_calls(kind.as_str(), operation);
    Ok(())
}

/// Digest of a rendered grant document. Recorded in the provider status so
/// later passes can skip the policy write when the grants are unchanged.
pub(crate) fn grant_fingerprint(document: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(document.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Derive a deterministic cloud principal name from the request identity.
///
/// The result is lowercase alphanumeric with single hyphens. Names longer
/// than `max_len` are truncated and suffixed with a short digest of the full
/// name, so distinct requests never collide after truncation.
pub fn derived_principal_name(namespace: &str, name: &str, hint: Option<&str>, max_len: usize) -> String {
    let base = match hint {
        Some(hint) if !hint.trim().is_empty() => hint.trim().to_string(),
        _ => format!("{namespace}-{name}"),
    };

    let mut sanitized = String::with_capacity(base.len());
    let mut last_hyphen = true;
    for ch in base.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            sanitized.push(ch);
            last_hyphen = false;
        } else if !last_hyphen {
            sanitized.push('-');
            last_hyphen = true;
        }
    }
    let sanitized = sanitized.trim_matches('-').to_string();

    if sanitized.len() <= max_len {
        return sanitized;
    }

    let digest = format!("{:x}", md5::compute(sanitized.as_bytes()));
    let suffix = &digest[..8];
    let keep = max_len.saturating_sub(suffix.len() + 1);
    let truncated = sanitized[..keep].trim_end_matches('-');
    format!("{truncated}-{suffix}")
}
