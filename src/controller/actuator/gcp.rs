//! # GCP Actuator
//!
//! Minted requests become a service account with project-level role bindings
//! and a JSON key; Passthrough copies the root service account key;
//! TokenExchange renders a workload-identity-federation configuration with
//! no cloud calls.

use crate::constants::WEB_IDENTITY_TOKEN_PATH;
use crate::controller::actuator::{
    cloud_call, derived_principal_name, grant_fingerprint, CredentialsActuator, Provisioned,
};
use crate::controller::error::CredentialsError;
use crate::controller::mode::Mode;
use crate::controller::ratelimit::RateLimiterSet;
use crate::controller::root_credentials::RootCredentialSource;
use crate::crd::provider::{GcpProviderSpec, ProviderKind, ProviderSpec};
use crate::crd::CredentialsRequest;
use crate::provider::{CloudError, CloudIamClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Service account IDs are capped at 30 characters
const MAX_ACCOUNT_ID_LEN: usize = 30;

/// Secret field holding the service account key JSON
pub const SERVICE_ACCOUNT_KEY_FIELD: &str = "service_account.json";

pub struct GcpActuator {
    client: Arc<dyn CloudIamClient>,
    root: Arc<dyn RootCredentialSource>,
    limiter: Arc<RateLimiterSet>,
    project_id: String,
}

impl std::fmt::Debug for GcpActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpActuator")
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

fn gcp_spec(request: &CredentialsRequest) -> Result<&GcpProviderSpec, CredentialsError> {
    match &request.spec.provider_spec {
        ProviderSpec::Gcp(spec) => Ok(spec),
        ProviderSpec::Aws(_) => Err(CredentialsError::Validation(
            "request routed to the gcp actuator carries an aws provider spec".into(),
        )),
    }
}

impl GcpActuator {
    pub fn new(
        client: Arc<dyn CloudIamClient>,
        root: Arc<dyn RootCredentialSource>,
        limiter: Arc<RateLimiterSet>,
        project_id: String,
    ) -> Self {
        Self {
            client,
            root,
            limiter,
            project_id,
        }
    }

    fn account_id(request: &CredentialsRequest) -> Result<String, CredentialsError> {
        let spec = gcp_spec(request)?;
        let namespace = request.metadata.namespace.as_deref().unwrap_or("default");
        let name = request
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| CredentialsError::Validation("request has no name".into()))?;
        let mut id = derived_principal_name(
            namespace,
            name,
            spec.service_account_hint.as_deref(),
            MAX_ACCOUNT_ID_LEN,
        );
        // Account IDs must begin with a letter
        if id.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            id = derived_principal_name("sa", &id, None, MAX_ACCOUNT_ID_LEN);
        }
        Ok(id)
    }

    fn account_email(&self, account_id: &str) -> String {
        format!("{account_id}@{}.iam.gserviceaccount.com", self.project_id)
    }

    async fn mint(
        &self,
        request: &CredentialsRequest,
        reuse_fields: Option<&BTreeMap<String, String>>,
        recorded_status: Option<&serde_json::Value>,
    ) -> Result<Provisioned, CredentialsError> {
        let spec = gcp_spec(request)?;
        let account_id = Self::account_id(request)?;
        let email = self.account_email(&account_id);

        cloud_call(&self.limiter, ProviderKind::Gcp, "principal_exists").await?;
        let present = self
            .client
            .principal_exists(&account_id)
            .await
            .map_err(|e| CredentialsError::from_cloud("service account lookup", e))?;

        if !present {
            cloud_call(&self.limiter, ProviderKind::Gcp, "create_principal").await?;
            match self.client.create_principal(&account_id).await {
                Ok(_) => info!(
                    "Minted service account {} for {}",
                    email,
                    request.owner_key()
                ),
                Err(CloudError::AlreadyExists(_)) => {
                    debug!("Service account {} already present", email);
                }
                Err(err) => {
                    return Err(CredentialsError::from_cloud("service account creation", err))
                }
            }
        }

        let binding = serde_json::json!({
            "member": format!("serviceAccount:{email}"),
            "roles": spec.predefined_roles,
        })
        .to_string();
        let binding_hash = grant_fingerprint(&binding);
        let recorded_binding_hash = recorded_status
            .and_then(|status| status.get("bindingHash"))
            .and_then(serde_json::Value::as_str);
        if present && recorded_binding_hash == Some(binding_hash.as_str()) {
            debug!("Role bindings for {} unchanged, skipping write", email);
        } else {
            cloud_call(&self.limiter, ProviderKind::Gcp, "attach_policy").await?;
            self.client
                .attach_policy(&account_id, &binding)
                .await
                .map_err(|e| CredentialsError::from_cloud("role binding", e))?;
        }

        let reusable =
            reuse_fields.filter(|fields| fields.contains_key(SERVICE_ACCOUNT_KEY_FIELD));

        let (secret_fields, key_id) = match reusable {
            Some(fields) => {
                // Reused material keeps the key ID the status already records
                let recorded_key_id = recorded_status
                    .and_then(|status| status.get("keyId"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                (fields.clone(), recorded_key_id)
            }
            None => {
                cloud_call(&self.limiter, ProviderKind::Gcp, "create_key").await?;
                let key = self
                    .client
                    .create_key(&account_id)
                    .await
                    .map_err(|e| CredentialsError::from_cloud("service account key creation", e))?;
                if !key.fields.contains_key(SERVICE_ACCOUNT_KEY_FIELD) {
                    return Err(CredentialsError::TransientCloud(
                        "service account key response carried no key material".into(),
                    ));
                }
                (key.fields, serde_json::Value::String(key.id))
            }
        };

        Ok(Provisioned {
            provider_status: serde_json::json!({
                "kind": "gcp",
                "serviceAccountEmail": email,
                "accountId": account_id,
                "bindingHash": binding_hash,
                "keyId": key_id,
            }),
            secret_fields,
            expires_at: None,
        })
    }

    async fn passthrough(&self) -> Result<Provisioned, CredentialsError> {
        let root = self.root.load().await?.ok_or_else(|| {
            CredentialsError::Authorization(
                "passthrough requires the root credential secret, which is absent".into(),
            )
        })?;

        let key_json = root.field(SERVICE_ACCOUNT_KEY_FIELD).ok_or_else(|| {
            CredentialsError::Authorization(format!(
                "root credential secret is missing field {SERVICE_ACCOUNT_KEY_FIELD}"
            ))
        })?;

        let mut secret_fields = BTreeMap::new();
        secret_fields.insert(SERVICE_ACCOUNT_KEY_FIELD.to_string(), key_json.to_string());

        Ok(Provisioned {
            provider_status: serde_json::json!({"kind": "gcp", "passthrough": true}),
            secret_fields,
            expires_at: None,
        })
    }

    fn token_exchange(request: &CredentialsRequest) -> Result<Provisioned, CredentialsError> {
        let spec = gcp_spec(request)?;
        let audience = spec.audience.as_deref().ok_or_else(|| {
            CredentialsError::Validation("token exchange requires spec.gcp.audience".into())
        })?;
        let email = spec.service_account_email.as_deref().ok_or_else(|| {
            CredentialsError::Validation(
                "token exchange requires spec.gcp.serviceAccountEmail".into(),
            )
        })?;

        let configuration = serde_json::json!({
            "type": "external_account",
            "audience": audience,
            "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
            "token_url": "https://sts.googleapis.com/v1/token",
            "service_account_impersonation_url": format!(
                "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{email}:generateAccessToken"
            ),
            "credential_source": {
                "file": WEB_IDENTITY_TOKEN_PATH,
                "format": {"type": "text"}
            }
        });

        let mut secret_fields = BTreeMap::new();
        secret_fields.insert(
            SERVICE_ACCOUNT_KEY_FIELD.to_string(),
            serde_json::to_string_pretty(&configuration)
                .map_err(|e| CredentialsError::Validation(e.to_string()))?,
        );

        Ok(Provisioned {
            provider_status: serde_json::json!({
                "kind": "gcp",
                "audience": audience,
                "serviceAccountEmail": email,
            }),
            secret_fields,
            expires_at: None,
        })
    }
}

#[async_trait]
impl CredentialsActuator for GcpActuator {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn validate(&self, request: &CredentialsRequest, mode: Mode) -> Result<(), CredentialsError> {
        let spec = gcp_spec(request)?;
        match mode {
            Mode::Mint => {
                if spec.predefined_roles.is_empty() {
                    return Err(CredentialsError::Validation(
                        "mint mode requires at least one predefined role".into(),
                    ));
                }
                for role in &spec.predefined_roles {
                    if !role.starts_with("roles/") {
                        return Err(CredentialsError::Validation(format!(
                            "'{role}' is not a predefined role (expected roles/ prefix)"
                        )));
                    }
                }
            }
            Mode::TokenExchange => {
                if spec.audience.is_none() || spec.service_account_email.is_none() {
                    return Err(CredentialsError::Validation(
                        "token exchange requires spec.gcp.audience and spec.gcp.serviceAccountEmail"
                            .into(),
                    ));
                }
            }
            Mode::Passthrough | Mode::Manual => {}
        }
        Ok(())
    }

    async fn exists(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
    ) -> Result<bool, CredentialsError> {
        if mode != Mode::Mint {
            return Ok(false);
        }
        let account_id = Self::account_id(request)?;
        cloud_call(&self.limiter, ProviderKind::Gcp, "principal_exists").await?;
        self.client
            .principal_exists(&account_id)
            .await
            .map_err(|e| CredentialsError::from_cloud("service account lookup", e))
    }

    async fn create(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
    ) -> Result<Provisioned, CredentialsError> {
        match mode {
            Mode::Mint => self.mint(request, None, None).await,
            Mode::Passthrough => self.passthrough().await,
            Mode::TokenExchange => Self::token_exchange(request),
            Mode::Manual => Err(CredentialsError::Validation(
                "manual mode never provisions".into(),
            )),
        }
    }

    async fn update(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
        existing_fields: Option<&BTreeMap<String, String>>,
        recorded_status: Option<&serde_json::Value>,
        force_rotate: bool,
    ) -> Result<Provisioned, CredentialsError> {
        match mode {
            Mode::Mint => {
                let reuse = if force_rotate { None } else { existing_fields };
                self.mint(request, reuse, recorded_status).await
            }
            Mode::Passthrough => self.passthrough().await,
            Mode::TokenExchange => Self::token_exchange(request),
            Mode::Manual => Err(CredentialsError::Validation(
                "manual mode never provisions".into(),
            )),
        }
    }

    async fn delete(
        &self,
        request: &CredentialsRequest,
        mode: Mode,
    ) -> Result<(), CredentialsError> {
        if mode != Mode::Mint {
            return Ok(());
        }
        let account_id = Self::account_id(request)?;
        cloud_call(&self.limiter, ProviderKind::Gcp, "delete_principal").await?;
        match self.client.delete_principal(&account_id).await {
            Ok(()) => {
                info!(
                    "Deprovisioned service account {} for {}",
                    self.account_email(&account_id),
                    request.owner_key()
                );
                Ok(())
            }
            Err(CloudError::NotFound(_)) => Ok(()),
            Err(err) => Err(CredentialsError::from_cloud("service account deletion", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::root_credentials::mock::MockRootSource;
    use crate::provider::mock::MockCloudClient;
    use std::sync::atomic::Ordering;

    fn request(name: &str) -> CredentialsRequest {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "cloudcredential.microscaler.io/v1",
            "kind": "CredentialsRequest",
            "metadata": {"name": name, "namespace": "registry"},
            "spec": {
                "providerSpec": {
                    "gcp": {
                        "predefinedRoles": ["roles/storage.objectViewer"],
                        "audience": "//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/p/providers/v",
                        "serviceAccountEmail": "wi@proj.iam.gserviceaccount.com"
                    }
                },
                "secretRef": {"name": "creds", "namespace": "registry"}
            }
        }))
        .unwrap()
    }

    fn actuator(client: Arc<MockCloudClient>, root: MockRootSource) -> GcpActuator {
        GcpActuator::new(
            client,
            Arc::new(root),
            Arc::new(RateLimiterSet::new(&std::collections::HashMap::new())),
            "proj".to_string(),
        )
    }

    #[tokio::test]
    async fn test_mint_creates_account_binding_and_key() {
        let client = Arc::new(MockCloudClient::gcp());
        let actuator = actuator(Arc::clone(&client), MockRootSource::absent());

        let provisioned = actuator.create(&request("image-registry"), Mode::Mint).await.unwrap();

        assert_eq!(client.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.attach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.key_calls.load(Ordering::SeqCst), 1);
        assert!(provisioned.secret_fields.contains_key(SERVICE_ACCOUNT_KEY_FIELD));
        assert_eq!(provisioned.provider_status["kind"], "gcp");
        assert_eq!(
            provisioned.provider_status["serviceAccountEmail"],
            "registry-image-registry@proj.iam.gserviceaccount.com"
        );
        // Binding document carries the member and roles
        let policies = client.policies.lock().unwrap();
        let doc = policies.get("registry-image-registry").unwrap();
        assert!(doc.contains("serviceAccount:registry-image-registry@proj.iam.gserviceaccount.com"));
        assert!(doc.contains("roles/storage.objectViewer"));
    }

    #[tokio::test]
    async fn test_update_without_force_reuses_key() {
        let client = Arc::new(MockCloudClient::with_principal("registry-image-registry"));
        let actuator = actuator(Arc::clone(&client), MockRootSource::absent());

        let mut existing = BTreeMap::new();
        existing.insert(
            SERVICE_ACCOUNT_KEY_FIELD.to_string(),
            "{\"type\":\"service_account\"}".to_string(),
        );
        let recorded = serde_json::json!({
            "kind": "gcp",
            "keyId": "projects/_/serviceAccounts/sa/keys/1"
        });
        let provisioned = actuator
            .update(
                &request("image-registry"),
                Mode::Mint,
                Some(&existing),
                Some(&recorded),
                false,
            )
            .await
            .unwrap();

        assert_eq!(client.key_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            provisioned.secret_fields[SERVICE_ACCOUNT_KEY_FIELD],
            "{\"type\":\"service_account\"}"
        );
        // Reuse carries the recorded key ID forward
        assert_eq!(
            provisioned.provider_status["keyId"],
            "projects/_/serviceAccounts/sa/keys/1"
        );
    }

    #[tokio::test]
    async fn test_steady_state_pass_skips_binding_write() {
        let client = Arc::new(MockCloudClient::gcp());
        let actuator = actuator(Arc::clone(&client), MockRootSource::absent());
        let req = request("image-registry");

        let first = actuator.create(&req, Mode::Mint).await.unwrap();
        assert_eq!(client.attach_calls.load(Ordering::SeqCst), 1);

        // Unchanged roles mean no setIamPolicy write on the next pass
        let second = actuator
            .update(
                &req,
                Mode::Mint,
                Some(&first.secret_fields),
                Some(&first.provider_status),
                false,
            )
            .await
            .unwrap();
        assert_eq!(client.attach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.key_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.provider_status["keyId"], first.provider_status["keyId"]);
    }

    #[tokio::test]
    async fn test_role_change_rewrites_binding() {
        let client = Arc::new(MockCloudClient::gcp());
        let actuator = actuator(Arc::clone(&client), MockRootSource::absent());
        let req = request("image-registry");

        let first = actuator.create(&req, Mode::Mint).await.unwrap();

        let mut edited = request("image-registry");
        if let ProviderSpec::Gcp(ref mut spec) = edited.spec.provider_spec {
            spec.predefined_roles.push("roles/storage.objectCreator".to_string());
        }
        actuator
            .update(
                &edited,
                Mode::Mint,
                Some(&first.secret_fields),
                Some(&first.provider_status),
                false,
            )
            .await
            .unwrap();
        assert_eq!(client.attach_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_token_exchange_renders_federation_config() {
        let client = Arc::new(MockCloudClient::default());
        let actuator = actuator(Arc::clone(&client), MockRootSource::absent());

        let provisioned = actuator
            .create(&request("image-registry"), Mode::TokenExchange)
            .await
            .unwrap();

        assert_eq!(client.total_mutating_calls(), 0);
        let config: serde_json::Value =
            serde_json::from_str(&provisioned.secret_fields[SERVICE_ACCOUNT_KEY_FIELD]).unwrap();
        assert_eq!(config["type"], "external_account");
        assert_eq!(config["credential_source"]["file"], WEB_IDENTITY_TOKEN_PATH);
    }

    #[tokio::test]
    async fn test_passthrough_requires_root_key_field() {
        let client = Arc::new(MockCloudClient::default());
        let actuator = actuator(
            Arc::clone(&client),
            MockRootSource::with_fields(&[("unrelated", "x")]),
        );
        let err = actuator
            .create(&request("image-registry"), Mode::Passthrough)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::Authorization(_)));
    }

    #[test]
    fn test_validate_requires_predefined_role_prefix() {
        let client = Arc::new(MockCloudClient::default());
        let actuator = actuator(client, MockRootSource::absent());

        let mut req = request("image-registry");
        if let ProviderSpec::Gcp(ref mut spec) = req.spec.provider_spec {
            spec.predefined_roles = vec!["storage.objectViewer".to_string()];
        }
        assert!(actuator.validate(&req, Mode::Mint).is_err());
    }

    #[test]
    fn test_account_id_never_starts_with_digit() {
        let req: CredentialsRequest = serde_json::from_value(serde_json::json!({
            "apiVersion": "cloudcredential.microscaler.io/v1",
            "kind": "CredentialsRequest",
            "metadata": {"name": "cluster", "namespace": "99-ns"},
            "spec": {
                "providerSpec": {"gcp": {"predefinedRoles": ["roles/viewer"]}},
                "secretRef": {"name": "creds", "namespace": "99-ns"}
            }
        }))
        .unwrap();
        let id = GcpActuator::account_id(&req).unwrap();
        assert!(id.starts_with("sa-"));
        assert!(id.len() <= MAX_ACCOUNT_ID_LEN);
    }
}
