//! # Root Credential
//!
//! The administrator-level credential Mint mode scopes child credentials
//! from. Read-only to the controller; absence or invalidation surfaces as a
//! Degraded condition on dependent requests, never a crash.

use crate::controller::error::{classify_kube_error, CredentialsError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroize;

/// Decoded root credential material. Values are scrubbed from memory on
/// drop and never rendered through Debug.
#[derive(Clone)]
pub struct RootCredentials {
    pub fields: BTreeMap<String, String>,
}

impl std::fmt::Debug for RootCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCredentials")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RootCredentials {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

impl Drop for RootCredentials {
    fn drop(&mut self) {
        for value in self.fields.values_mut() {
            value.zeroize();
        }
    }
}

/// Source of the root credential. Seam for tests; production wires the
/// Kubernetes secret implementation.
#[async_trait]
pub trait RootCredentialSource: Send + Sync {
    /// Load the root credential, or `None` when it is absent
    async fn load(&self) -> Result<Option<Arc<RootCredentials>>, CredentialsError>;
}

/// Root credential stored as a Kubernetes Secret, cached with a short TTL.
/// Absence is cached too, so a missing secret does not turn every reconcile
/// into an API call.
pub struct KubeRootCredentialSource {
    client: Client,
    name: String,
    namespace: String,
    ttl: Duration,
    cache: Mutex<Option<(Option<Arc<RootCredentials>>, Instant)>>,
}

impl std::fmt::Debug for KubeRootCredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeRootCredentialSource")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeRootCredentialSource {
    pub fn new(client: Client, name: String, namespace: String, ttl: Duration) -> Self {
        Self {
            client,
            name,
            namespace,
            ttl,
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RootCredentialSource for KubeRootCredentialSource {
    async fn load(&self) -> Result<Option<Arc<RootCredentials>>, CredentialsError> {
        // Single-writer refresh: concurrent callers block on the cache lock
        // rather than racing re-reads against the API server
        let mut cache = self.cache.lock().await;
        if let Some((cached, at)) = cache.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api
            .get_opt(&self.name)
            .await
            .map_err(|e| classify_kube_error("read root credential secret", &e))?;

        let loaded = secret.and_then(|s| s.data).map(|data| {
            let fields = data
                .into_iter()
                .filter_map(|(k, v)| String::from_utf8(v.0).ok().map(|value| (k, value)))
                .collect();
            Arc::new(RootCredentials { fields })
        });

        if loaded.is_none() {
            debug!(
                "Root credential secret {}/{} not found",
                self.namespace, self.name
            );
        }

        *cache = Some((loaded.clone(), Instant::now()));
        Ok(loaded)
    }
}
