//! # GCP IAM Client
//!
//! IAM primitives over the native REST APIs, using reqwest with rustls.
//! Bearer tokens come from the metadata server (Workload Identity); the
//! endpoint can be overridden for tests via `GCE_METADATA_HOST`.

use crate::provider::{CloudError, CloudIamClient, CredentialKey};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const IAM_API: &str = "https://iam.googleapis.com/v1";
const RESOURCE_MANAGER_API: &str = "https://cloudresourcemanager.googleapis.com/v1";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Tokens are refreshed this far before the metadata server's expiry
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// GCP IAM capability provider (native REST implementation)
pub struct GcpIamClient {
    http: reqwest::Client,
    project_id: String,
    token_cache: Mutex<Option<(String, Instant)>>,
}

impl std::fmt::Debug for GcpIamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpIamClient")
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    name: String,
    #[serde(rename = "privateKeyData")]
    private_key_data: String,
}

impl GcpIamClient {
    pub fn new(project_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            project_id,
            token_cache: Mutex::new(None),
        }
    }

    /// Fully qualified email of a service account in this project
    pub fn service_account_email(&self, account_id: &str) -> String {
        format!("{account_id}@{}.iam.gserviceaccount.com", self.project_id)
    }

    async fn token(&self) -> Result<String, CloudError> {
        let mut cache = self.token_cache.lock().await;
        if let Some((token, expires_at)) = cache.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let host = std::env::var("GCE_METADATA_HOST")
            .unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        let url =
            format!("http://{host}/computeMetadata/v1/instance/service-accounts/default/token");
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| CloudError::Unauthorized(format!("metadata token fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CloudError::Unauthorized(format!(
                "metadata token fetch returned {}",
                response.status()
            )));
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| CloudError::Api(format!("metadata token parse failed: {e}")))?;

        let ttl = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_SLACK);
        *cache = Some((token.access_token.clone(), Instant::now() + ttl));
        Ok(token.access_token)
    }

    async fn request(
        &self,
        operation: &str,
        method: reqwest::Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CloudError> {
        let token = self.token().await?;
        let mut builder = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CloudError::Api(format!("{operation}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            if status == reqwest::StatusCode::NO_CONTENT {
                return Ok(serde_json::Value::Null);
            }
            return response
                .json()
                .await
                .map_err(|e| CloudError::Api(format!("{operation}: invalid response body: {e}")));
        }

        let body_text = response.text().await.unwrap_or_default();
        let msg = format!("{operation}: HTTP {status}: {body_text}");
        Err(match status.as_u16() {
            401 | 403 => CloudError::Unauthorized(msg),
            404 => CloudError::NotFound(msg),
            409 => CloudError::AlreadyExists(msg),
            429 => CloudError::RateLimited(msg),
            _ => CloudError::Api(msg),
        })
    }
}

/// Policy grants passed to `attach_policy`: the member to bind and the
/// predefined roles it receives at project level
#[derive(Debug, Deserialize, serde::Serialize)]
pub struct GcpPolicyBinding {
    pub member: String,
    pub roles: Vec<String>,
}

#[async_trait]
impl CloudIamClient for GcpIamClient {
    async fn authenticate(&self) -> Result<(), CloudError> {
        let url = format!(
            "{IAM_API}/projects/{}/serviceAccounts?pageSize=1",
            self.project_id
        );
        self.request("iam.serviceAccounts.list", reqwest::Method::GET, url, None)
            .await?;
        Ok(())
    }

    async fn principal_exists(&self, name: &str) -> Result<bool, CloudError> {
        let email = self.service_account_email(name);
        let url = format!("{IAM_API}/projects/{}/serviceAccounts/{email}", self.project_id);
        match self
            .request("iam.serviceAccounts.get", reqwest::Method::GET, url, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn create_principal(&self, name: &str) -> Result<String, CloudError> {
        let url = format!("{IAM_API}/projects/{}/serviceAccounts", self.project_id);
        let body = serde_json::json!({
            "accountId": name,
            "serviceAccount": {"displayName": name}
        });
        self.request(
            "iam.serviceAccounts.create",
            reqwest::Method::POST,
            url,
            Some(body),
        )
        .await?;
        let email = self.service_account_email(name);
        info!("Created service account {}", email);
        Ok(email)
    }

    async fn attach_policy(&self, principal: &str, policy_document: &str) -> Result<(), CloudError> {
        let binding: GcpPolicyBinding = serde_json::from_str(policy_document)
            .map_err(|e| CloudError::Api(format!("invalid policy binding document: {e}")))?;

        // Project policy writes are read-modify-write; the etag carried back
        // through setIamPolicy turns concurrent writers into 409s we retry
        let get_url = format!(
            "{RESOURCE_MANAGER_API}/projects/{}:getIamPolicy",
            self.project_id
        );
        let mut policy = self
            .request(
                "cloudresourcemanager.projects.getIamPolicy",
                reqwest::Method::POST,
                get_url,
                Some(serde_json::json!({})),
            )
            .await?;

        let bindings = policy
            .get_mut("bindings")
            .and_then(serde_json::Value::as_array_mut)
            .map(std::mem::take)
            .unwrap_or_default();
        let mut bindings = bindings;

        let mut changed = false;
        for role in &binding.roles {
            let member = serde_json::Value::String(binding.member.clone());
            match bindings.iter_mut().find(|b| {
                b.get("role").and_then(serde_json::Value::as_str) == Some(role.as_str())
            }) {
                Some(existing) => {
                    let members = existing
                        .get_mut("members")
                        .and_then(serde_json::Value::as_array_mut);
                    if let Some(members) = members {
                        if !members.contains(&member) {
                            members.push(member);
                            changed = true;
                        }
                    }
                }
                None => {
                    bindings.push(serde_json::json!({
                        "role": role,
                        "members": [binding.member.clone()]
                    }));
                    changed = true;
                }
            }
        }
        if !changed {
            debug!(
                "{} already bound to {} role(s) on project {}, skipping policy write",
                binding.member,
                binding.roles.len(),
                self.project_id
            );
            return Ok(());
        }
        policy["bindings"] = serde_json::Value::Array(bindings);

        let set_url = format!(
            "{RESOURCE_MANAGER_API}/projects/{}:setIamPolicy",
            self.project_id
        );
        self.request(
            "cloudresourcemanager.projects.setIamPolicy",
            reqwest::Method::POST,
            set_url,
            Some(serde_json::json!({"policy": policy})),
        )
        .await?;
        debug!(
            "Bound {} to {} role(s) on project {}",
            binding.member,
            binding.roles.len(),
            self.project_id
        );
        Ok(())
    }

    async fn create_key(&self, principal: &str) -> Result<CredentialKey, CloudError> {
        let email = self.service_account_email(principal);
        let url = format!(
            "{IAM_API}/projects/{}/serviceAccounts/{email}/keys",
            self.project_id
        );
        let response = self
            .request(
                "iam.serviceAccounts.keys.create",
                reqwest::Method::POST,
                url,
                Some(serde_json::json!({})),
            )
            .await?;

        let key: ServiceAccountKey = serde_json::from_value(response)
            .map_err(|e| CloudError::Api(format!("invalid key response: {e}")))?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&key.private_key_data)
            .map_err(|e| CloudError::Api(format!("key material decode failed: {e}")))?;
        let json = String::from_utf8(decoded)
            .map_err(|e| CloudError::Api(format!("key material is not UTF-8: {e}")))?;

        let mut fields = BTreeMap::new();
        fields.insert("service_account.json".to_string(), json);

        Ok(CredentialKey {
            id: key.name,
            fields,
        })
    }

    async fn delete_principal(&self, name: &str) -> Result<(), CloudError> {
        let email = self.service_account_email(name);
        let url = format!("{IAM_API}/projects/{}/serviceAccounts/{email}", self.project_id);
        self.request(
            "iam.serviceAccounts.delete",
            reqwest::Method::DELETE,
            url,
            None,
        )
        .await?;
        info!("Deleted service account {}", email);
        Ok(())
    }
}
