//! # Cloud Capability Providers
//!
//! Thin clients exposing the IAM primitives the actuators drive:
//! authenticate, create-principal, attach-policy, create-key,
//! delete-principal. Each backend translates its own error-code taxonomy
//! into [`CloudError`] so the actuators can map outcomes uniformly.

pub mod aws;
pub mod gcp;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub use aws::AwsIamClient;
pub use gcp::GcpIamClient;

/// Uniform error taxonomy across cloud backends
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("cloud api error: {0}")]
    Api(String),
}

/// Key material minted for a principal
#[derive(Debug)]
pub struct CredentialKey {
    /// Backend identifier of the key (access key ID, key name)
    pub id: String,
    /// Raw credential fields, keyed the way the backend names them
    pub fields: BTreeMap<String, String>,
}

/// IAM primitives one cloud backend exposes.
///
/// Implementations are capability providers only; they perform no
/// request-level orchestration and never touch the Kubernetes API beyond
/// loading the root credential they authenticate with.
#[async_trait]
pub trait CloudIamClient: Send + Sync {
    /// Live authenticated check that the root credential is valid
    async fn authenticate(&self) -> Result<(), CloudError>;

    /// Whether a principal with this exact name exists
    async fn principal_exists(&self, name: &str) -> Result<bool, CloudError>;

    /// Create a principal, returning its backend identifier.
    /// `AlreadyExists` is an error here; callers decide whether prior
    /// state is acceptable.
    async fn create_principal(&self, name: &str) -> Result<String, CloudError>;

    /// Attach or replace the permission grants on a principal
    async fn attach_policy(&self, principal: &str, policy_document: &str) -> Result<(), CloudError>;

    /// Mint fresh key material for a principal, revoking prior keys
    async fn create_key(&self, principal: &str) -> Result<CredentialKey, CloudError>;

    /// Tear down a principal and its keys. `NotFound` is an error here;
    /// callers treat it as success for idempotent deletes.
    async fn delete_principal(&self, name: &str) -> Result<(), CloudError>;
}

#[cfg(test)]
pub mod mock {
    //! In-memory cloud backend used by actuator and mode-detector tests.

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Shape of the key material the mock mints, matching what the real
    /// backend of each kind delivers
    #[derive(Debug, Clone, Copy, Default)]
    pub enum MockKeyShape {
        #[default]
        AwsStaticKey,
        GcpServiceAccountJson,
    }

    #[derive(Default)]
    pub struct MockCloudClient {
        pub principals: Mutex<Vec<String>>,
        pub policies: Mutex<BTreeMap<String, String>>,
        pub key_shape: MockKeyShape,
        pub authenticate_calls: AtomicU32,
        pub exists_calls: AtomicU32,
        pub create_calls: AtomicU32,
        pub attach_calls: AtomicU32,
        pub key_calls: AtomicU32,
        pub delete_calls: AtomicU32,
        /// When set, authenticate() fails with Unauthorized
        pub deny_auth: std::sync::atomic::AtomicBool,
    }

    impl MockCloudClient {
        pub fn with_principal(name: &str) -> Self {
            let mock = Self::default();
            mock.principals.lock().unwrap().push(name.to_string());
            mock
        }

        pub fn gcp() -> Self {
            Self {
                key_shape: MockKeyShape::GcpServiceAccountJson,
                ..Self::default()
            }
        }

        pub fn total_mutating_calls(&self) -> u32 {
            self.create_calls.load(Ordering::SeqCst)
                + self.attach_calls.load(Ordering::SeqCst)
                + self.key_calls.load(Ordering::SeqCst)
                + self.delete_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CloudIamClient for MockCloudClient {
        async fn authenticate(&self) -> Result<(), CloudError> {
            self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
            if self.deny_auth.load(Ordering::SeqCst) {
                return Err(CloudError::Unauthorized("access denied".into()));
            }
            Ok(())
        }

        async fn principal_exists(&self, name: &str) -> Result<bool, CloudError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.principals.lock().unwrap().iter().any(|p| p == name))
        }

        async fn create_principal(&self, name: &str) -> Result<String, CloudError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let mut principals = self.principals.lock().unwrap();
            if principals.iter().any(|p| p == name) {
                return Err(CloudError::AlreadyExists(name.to_string()));
            }
            principals.push(name.to_string());
            Ok(name.to_string())
        }

        async fn attach_policy(
            &self,
            principal: &str,
            policy_document: &str,
        ) -> Result<(), CloudError> {
            self.attach_calls.fetch_add(1, Ordering::SeqCst);
            self.policies
                .lock()
                .unwrap()
                .insert(principal.to_string(), policy_document.to_string());
            Ok(())
        }

        async fn create_key(&self, principal: &str) -> Result<CredentialKey, CloudError> {
            self.key_calls.fetch_add(1, Ordering::SeqCst);
            if !self.principals.lock().unwrap().iter().any(|p| p == principal) {
                return Err(CloudError::NotFound(principal.to_string()));
            }
            let serial = self.key_calls.load(Ordering::SeqCst);
            let mut fields = BTreeMap::new();
            let id = match self.key_shape {
                MockKeyShape::AwsStaticKey => {
                    let id = format!("AKIA{serial:08}");
                    fields.insert("aws_access_key_id".to_string(), id.clone());
                    fields.insert("aws_secret_access_key".to_string(), format!("secret-{serial}"));
                    id
                }
                MockKeyShape::GcpServiceAccountJson => {
                    fields.insert(
                        "service_account.json".to_string(),
                        format!("{{\"type\":\"service_account\",\"key_serial\":{serial}}}"),
                    );
                    format!("projects/_/serviceAccounts/{principal}/keys/{serial}")
                }
            };
            Ok(CredentialKey { id, fields })
        }

        async fn delete_principal(&self, name: &str) -> Result<(), CloudError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let mut principals = self.principals.lock().unwrap();
            match principals.iter().position(|p| p == name) {
                Some(idx) => {
                    principals.remove(idx);
                    Ok(())
                }
                None => Err(CloudError::NotFound(name.to_string())),
            }
        }
    }
}
