//! # Error Taxonomy
//!
//! Typed reconciliation errors. The reconciler is the only place that
//! classifies these into conditions and retry cadence.

use crate::provider::CloudError;
use thiserror::Error;

/// Errors surfaced by actuators, the synchronizer, and the mode detector.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// Malformed desired state. Permanent; never auto-corrects without a
    /// spec change.
    #[error("invalid credentials request: {0}")]
    Validation(String),

    /// Root credential insufficient or expired. Permanent until externally
    /// remediated.
    #[error("cloud authorization failed: {0}")]
    Authorization(String),

    /// Rate limiting, network timeouts, eventual-consistency lag.
    #[error("transient cloud error: {0}")]
    TransientCloud(String),

    /// Target secret exists and is not owned by this request. Never
    /// auto-overwritten.
    #[error("secret ownership conflict: {0}")]
    Conflict(String),

    /// Optimistic-concurrency failure on a store write. A benign race,
    /// retried immediately without counting against backoff.
    #[error("store write conflict: {0}")]
    StoreConflict(String),
}

/// Retry cadence the reconciler applies per error class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Capped exponential backoff with jitter
    Backoff,
    /// Baseline periodic interval; the external cause is unlikely to change
    /// quickly, but self-healing still requires retrying
    Baseline,
    /// Immediate requeue, not counted against backoff
    Immediate,
}

impl CredentialsError {
    pub const fn retry_class(&self) -> RetryClass {
        match self {
            CredentialsError::TransientCloud(_) => RetryClass::Backoff,
            CredentialsError::Validation(_)
            | CredentialsError::Authorization(_)
            | CredentialsError::Conflict(_) => RetryClass::Baseline,
            CredentialsError::StoreConflict(_) => RetryClass::Immediate,
        }
    }

    /// Condition reason reported for this error
    pub const fn reason(&self) -> &'static str {
        match self {
            CredentialsError::Validation(_) => "CredentialsRequestInvalid",
            CredentialsError::Authorization(_) => "CloudAuthorizationFailed",
            CredentialsError::TransientCloud(_) => "TransientCloudError",
            CredentialsError::Conflict(_) => "SecretOwnershipConflict",
            CredentialsError::StoreConflict(_) => "StoreWriteConflict",
        }
    }

    /// Generic translation from a cloud client error, for call sites where
    /// NotFound/AlreadyExists are not expected outcomes.
    pub fn from_cloud(operation: &str, err: CloudError) -> Self {
        match err {
            CloudError::Unauthorized(msg) => {
                CredentialsError::Authorization(format!("{operation}: {msg}"))
            }
            CloudError::RateLimited(msg) => {
                CredentialsError::TransientCloud(format!("{operation}: rate limited: {msg}"))
            }
            CloudError::NotFound(msg)
            | CloudError::AlreadyExists(msg)
            | CloudError::Api(msg) => {
                CredentialsError::TransientCloud(format!("{operation}: {msg}"))
            }
        }
    }
}

/// Classify a Kubernetes API error. Conflicts on writes indicate a benign
/// optimistic-concurrency race; everything else is treated as transient
/// store I/O.
pub fn classify_kube_error(context: &str, err: &kube::Error) -> CredentialsError {
    if let kube::Error::Api(api_err) = err {
        if api_err.code == 409 {
            return CredentialsError::StoreConflict(format!("{context}: {api_err}"));
        }
        if api_err.code == 403 || api_err.code == 401 {
            return CredentialsError::Authorization(format!("{context}: {api_err}"));
        }
    }
    CredentialsError::TransientCloud(format!("{context}: {err}"))
}
