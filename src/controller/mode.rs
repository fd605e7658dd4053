//! # Mode Detection
//!
//! Derives the cluster-wide provisioning strategy from explicit overrides,
//! root credential presence, and a live validity check against the backend.
//! The result is cached briefly to bound cloud-API call volume.

use crate::controller::error::CredentialsError;
use crate::controller::root_credentials::RootCredentialSource;
use crate::crd::provider::ProviderKind;
use crate::provider::{CloudError, CloudIamClient};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Cluster-wide provisioning strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Create narrowly-scoped child credentials using the root credential
    Mint,
    /// Copy the root credential's access as-is into target secrets
    Passthrough,
    /// No cloud calls; external tooling supplies secrets, the controller
    /// only verifies they exist and reports status
    Manual,
    /// Configure federated short-lived token issuance instead of static keys
    TokenExchange,
}

impl Mode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Mode::Mint => "Mint",
            Mode::Passthrough => "Passthrough",
            Mode::Manual => "Manual",
            Mode::TokenExchange => "TokenExchange",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mint" => Ok(Mode::Mint),
            "passthrough" => Ok(Mode::Passthrough),
            "manual" => Ok(Mode::Manual),
            "tokenexchange" | "token-exchange" => Ok(Mode::TokenExchange),
            other => Err(format!("unknown provisioning mode '{other}'")),
        }
    }
}

/// Derives and caches the active provisioning mode.
///
/// Resolution order: explicit override wins unconditionally; else an absent
/// root credential means Manual; else a root credential that fails its live
/// validity check is an error (silently downgrading mode risks
/// under-provisioning); else Mint when the backend supports it, Passthrough
/// otherwise.
pub struct ModeDetector {
    override_mode: RwLock<Option<Mode>>,
    root: Arc<dyn RootCredentialSource>,
    validators: HashMap<ProviderKind, Arc<dyn CloudIamClient>>,
    ttl: Duration,
    cache: Mutex<HashMap<ProviderKind, (Mode, Instant)>>,
    mint_authorization_failed: AtomicBool,
}

impl std::fmt::Debug for ModeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeDetector")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ModeDetector {
    pub fn new(
        override_mode: Option<Mode>,
        root: Arc<dyn RootCredentialSource>,
        validators: HashMap<ProviderKind, Arc<dyn CloudIamClient>>,
        ttl: Duration,
    ) -> Self {
        Self {
            override_mode: RwLock::new(override_mode),
            root,
            validators,
            ttl,
            cache: Mutex::new(HashMap::new()),
            mint_authorization_failed: AtomicBool::new(false),
        }
    }

    /// Change the explicit override, invalidating the cache immediately
    pub async fn set_override(&self, mode: Option<Mode>) {
        *self.override_mode.write().await = mode;
        self.cache.lock().await.clear();
        match mode {
            Some(m) => info!("Provisioning mode override set to {}", m),
            None => info!("Provisioning mode override cleared, returning to detection"),
        }
    }

    /// Record that a Mint pass failed with an authorization error. Subsequent
    /// detections surface Degraded until a validity check succeeds again.
    pub fn record_mint_authorization_failure(&self) {
        self.mint_authorization_failed.store(true, Ordering::SeqCst);
    }

    /// Determine the active mode for one provider backend
    pub async fn determine_mode(&self, kind: ProviderKind) -> Result<Mode, CredentialsError> {
        if let Some(mode) = *self.override_mode.read().await {
            return Ok(mode);
        }

        // Single-writer refresh: one caller recomputes while others block
        // briefly on the lock, avoiding a thundering herd of validity checks
        let mut cache = self.cache.lock().await;
        if let Some((mode, at)) = cache.get(&kind) {
            if at.elapsed() < self.ttl {
                return Ok(*mode);
            }
        }

        let root = self.root.load().await?;
        let mode = match root {
            None => {
                debug!("Root credential absent, operating in Manual mode");
                Mode::Manual
            }
            Some(_) => {
                let validator = self.validators.get(&kind).ok_or_else(|| {
                    CredentialsError::Validation(format!("no cloud client registered for {kind}"))
                })?;
                match validator.authenticate().await {
                    Ok(()) => {
                        // A recorded mint denial forces one explicit
                        // revalidation cycle; the failure stays visible as
                        // Degraded instead of being silently retried
                        if self.mint_authorization_failed.swap(false, Ordering::SeqCst) {
                            return Err(CredentialsError::Authorization(
                                "a prior mint attempt was denied by the cloud backend; \
                                 root credential revalidated, minting resumes next pass"
                                    .into(),
                            ));
                        }
                        if kind.supports_mint() {
                            Mode::Mint
                        } else {
                            Mode::Passthrough
                        }
                    }
                    Err(CloudError::Unauthorized(msg)) => {
                        warn!("Root credential failed validation: {}", msg);
                        return Err(CredentialsError::Authorization(format!(
                            "root credential is present but failed validation: {msg}"
                        )));
                    }
                    Err(other) => {
                        return Err(CredentialsError::TransientCloud(format!(
                            "root credential validation: {other}"
                        )));
                    }
                }
            }
        };

        cache.insert(kind, (mode, Instant::now()));
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::root_credentials::mock::MockRootSource;
    use crate::provider::mock::MockCloudClient;

    fn detector_with(
        override_mode: Option<Mode>,
        root: MockRootSource,
        client: Arc<MockCloudClient>,
        ttl: Duration,
    ) -> ModeDetector {
        let mut validators: HashMap<ProviderKind, Arc<dyn CloudIamClient>> = HashMap::new();
        validators.insert(ProviderKind::Aws, client);
        ModeDetector::new(override_mode, Arc::new(root), validators, ttl)
    }

    #[tokio::test]
    async fn test_override_wins_unconditionally() {
        let client = Arc::new(MockCloudClient::default());
        client.deny_auth.store(true, Ordering::SeqCst);
        let detector = detector_with(
            Some(Mode::TokenExchange),
            MockRootSource::absent(),
            Arc::clone(&client),
            Duration::from_secs(30),
        );
        let mode = detector.determine_mode(ProviderKind::Aws).await.unwrap();
        assert_eq!(mode, Mode::TokenExchange);
        // Overridden detection performs no validity checks
        assert_eq!(client.authenticate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_root_means_manual() {
        let client = Arc::new(MockCloudClient::default());
        let detector = detector_with(
            None,
            MockRootSource::absent(),
            Arc::clone(&client),
            Duration::from_secs(30),
        );
        let mode = detector.determine_mode(ProviderKind::Aws).await.unwrap();
        assert_eq!(mode, Mode::Manual);
        assert_eq!(client.authenticate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_root_means_mint() {
        let client = Arc::new(MockCloudClient::default());
        let detector = detector_with(
            None,
            MockRootSource::with_fields(&[("aws_access_key_id", "AKIA")]),
            Arc::clone(&client),
            Duration::from_secs(30),
        );
        let mode = detector.determine_mode(ProviderKind::Aws).await.unwrap();
        assert_eq!(mode, Mode::Mint);
    }

    #[tokio::test]
    async fn test_invalid_root_is_an_error_not_a_downgrade() {
        let client = Arc::new(MockCloudClient::default());
        client.deny_auth.store(true, Ordering::SeqCst);
        let detector = detector_with(
            None,
            MockRootSource::with_fields(&[("aws_access_key_id", "AKIA")]),
            Arc::clone(&client),
            Duration::from_secs(30),
        );
        let err = detector
            .determine_mode(ProviderKind::Aws)
            .await
            .expect_err("invalid root must not silently downgrade");
        assert!(matches!(err, CredentialsError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_mode_is_cached_within_ttl() {
        let client = Arc::new(MockCloudClient::default());
        let detector = detector_with(
            None,
            MockRootSource::with_fields(&[("aws_access_key_id", "AKIA")]),
            Arc::clone(&client),
            Duration::from_secs(300),
        );
        for _ in 0..5 {
            detector.determine_mode(ProviderKind::Aws).await.unwrap();
        }
        assert_eq!(client.authenticate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_override_invalidates_cache() {
        let client = Arc::new(MockCloudClient::default());
        let detector = detector_with(
            None,
            MockRootSource::with_fields(&[("aws_access_key_id", "AKIA")]),
            Arc::clone(&client),
            Duration::from_secs(300),
        );
        assert_eq!(
            detector.determine_mode(ProviderKind::Aws).await.unwrap(),
            Mode::Mint
        );
        detector.set_override(Some(Mode::Manual)).await;
        assert_eq!(
            detector.determine_mode(ProviderKind::Aws).await.unwrap(),
            Mode::Manual
        );
        detector.set_override(None).await;
        // Cache was cleared, detection re-derives from the root credential
        assert_eq!(
            detector.determine_mode(ProviderKind::Aws).await.unwrap(),
            Mode::Mint
        );
        assert_eq!(client.authenticate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recorded_mint_authorization_failure_degrades() {
        let client = Arc::new(MockCloudClient::default());
        let detector = detector_with(
            None,
            MockRootSource::with_fields(&[("aws_access_key_id", "AKIA")]),
            Arc::clone(&client),
            Duration::from_secs(0),
        );
        detector.record_mint_authorization_failure();
        let err = detector
            .determine_mode(ProviderKind::Aws)
            .await
            .expect_err("recorded authorization failure must surface");
        assert!(matches!(err, CredentialsError::Authorization(_)));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("mint".parse::<Mode>().unwrap(), Mode::Mint);
        assert_eq!("Passthrough".parse::<Mode>().unwrap(), Mode::Passthrough);
        assert_eq!("token-exchange".parse::<Mode>().unwrap(), Mode::TokenExchange);
        assert!("invalid".parse::<Mode>().is_err());
    }
}
