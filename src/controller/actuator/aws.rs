//! # AWS Actuator
//!
//! Maps the provisioning contract onto AWS IAM: minted requests become an
//! IAM user with an inline policy and an access key; Passthrough copies the
//! root key; TokenExchange renders a web-identity profile with no cloud
//! calls at all.

use crate::constants::WEB_IDENTITY_TOKEN_PATH;
use crate::controller::actuator::{
    cloud_call, derived_principal_name, grant_fingerprint, CredentialsActuator, Provisioned,
};
use crate::controller::error::CredentialsError;
use crate::controller::mode::Mode;
use crate::controller::ratelimit::RateLimiterSet;
use crate::controller::root_credentials::RootCredentialSource;
use crate::crd::provider::{AwsProviderSpec, ProviderKind, ProviderSpec, StatementEntry};
use crate::crd::CredentialsRequest;
use crate::provider::aws::{ROOT_ACCESS_KEY_FIELD, ROOT_SECRET_KEY_FIELD};
use crate::provider::{CloudError, CloudIamClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// IAM caps user names at 64 characters
const MAX_USER_NAME_LEN: usize = 64;

pub struct AwsActuator {
    client: Arc<dyn CloudIamClient>,
    root: Arc<dyn RootCredentialSource>,
    limiter: Arc<RateLimiterSet>,
}

impl std::fmt::Debug for AwsActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsActuator").finish_non_exhaustive()
    }
}

fn aws_spec(request: &CredentialsRequest) -> Result<&AwsProviderSpec, CredentialsError> {
    match &request.spec.provider_spec {
        ProviderSpec::Aws(spec) => Ok(spec),
        ProviderSpec::Gcp(_) => Err(CredentialsError::Validation(
            "request routed to the aws actuator carries a gcp provider spec".into(),
        )),
    }
}

/// Render statement entries into an IAM policy document
fn render_policy(entries: &[StatementEntry]) -> String {
    let statements: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| {
            serde_json::json!({
                "Effect": entry.effect,
                "Action": entry.action,
                "Resource": entry.resource,
            })
        })
        .collect();
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": statements,
    })
    .to_string()
}

/// Shared-credentials-file rendering of a static key
fn static_credentials_ini(access_key_id: &str, secret_access_key: &str) -> String {
    format!(
        "[default]\naws_access_key_id = {access_key_id}\naws_secret_access_key = {secret_access_key}\n"
    )
}

impl AwsActuator {
    pub fn new(
        client: Arc<dyn CloudIamClient>,
        root: Arc<dyn RootCredentialSource>,
        limiter: Arc<RateLimiterSet>,
    ) -> Self {
        Self {
            client,
            root,
            limiter,
        }
    }

    fn user_name(request: &CredentialsRequest) -> Result<String, CredentialsError> {
        let spec = aws_spec(request)?;
        let namespace = request.metadata.namespace.as_deref().unwrap_or("default");
        let name = request
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| CredentialsError::Validation("request has no name".into()))?;
        Ok(derived_principal_name(
            namespace,
            name,
            spec.user_name_hint.as_deref(),
            MAX_USER_NAME_LEN,
        ))
    }

    async fn mint(
        &self,
        request: &CredentialsRequest,
        reuse_fields: Option<&BTreeMap<String, String>>,
        recorded_status: Option<&serde_json::Value>,
    ) -> Result<Provisioned, CredentialsError> {
        let spec = aws_spec(request)?;
        let user_name = Self::user_name(request)?;

        cloud_call(&self.limiter, ProviderKind::Aws, "principal_exists").await?;
        let present = self
            .client
            .principal_exists(&user_name)
            .await
            .map_err(|e| CredentialsError::from_cloud("iam user lookup", e))?;

        if !present {
            cloud_call(&self.limiter, ProviderKind::Aws, "create_principal").await?;
            match self.client.create_principal(&user_name).await {
                Ok(_) => info!("Minted IAM user {} for {}", user_name, request.owner_key()),
                // A concurrent pass or a prior partial pass created it first
                Err(CloudError::AlreadyExists(_)) => {
                    debug!("IAM user {} already present", user_name);
                }
                Err(err) => return Err(CredentialsError::from_cloud("iam user creation", err)),
            }
        }

        let policy_document = render_policy(&spec.statement_entries);
        let policy_hash = grant_fingerprint(&policy_document);
        let recorded_policy_hash = recorded_status
            .and_then(|status| status.get("policyHash"))
            .and_then(serde_json::Value::as_str);
        if present && recorded_policy_hash == Some(policy_hash.as_str()) {
            debug!("Inline policy on {} unchanged, skipping write", user_name);
        } else {
            cloud_call(&self.limiter, ProviderKind::Aws, "attach_policy").await?;
            self.client
                .attach_policy(&user_name, &policy_document)
                .await
                .map_err(|e| CredentialsError::from_cloud("iam policy attachment", e))?;
        }

        // Carry forward existing key material only when the current secret
        // holds a complete key whose ID matches the one recorded in status;
        // anything else is re-minted
        let recorded_key_id = recorded_status
            .and_then(|status| status.get("accessKeyId"))
            .and_then(serde_json::Value::as_str);
        let reusable = reuse_fields.filter(|fields| {
            fields.contains_key(ROOT_SECRET_KEY_FIELD)
                && fields.get(ROOT_ACCESS_KEY_FIELD).map(String::as_str) == recorded_key_id
                && recorded_key_id.is_some()
        });

        let (secret_fields, access_key_id) = match reusable {
            Some(fields) => {
                let id = fields
                    .get(ROOT_ACCESS_KEY_FIELD)
                    .cloned()
                    .unwrap_or_default();
                (fields.clone(), id)
            }
            None => {
                cloud_call(&self.limiter, ProviderKind::Aws, "create_key").await?;
                let key = self
                    .client
                    .create_key(&user_name)
                    .await
                    .map_err(|e| CredentialsError::from_cloud("iam access key creation", e))?;

                let access_key_id = key
                    .fields
                    .get(ROOT_ACCESS_KEY_FIELD)
                    .cloned()
                    .unwrap_or_else(|| key.id.clone());
                let secret_key = key
                    .fields
                    .get(ROOT_SECRET_KEY_FIELD)
                    .cloned()
                    .unwrap_or_default();

                let mut fields = key.fields;
                fields.insert(
                    "credentials".to_string(),
                    static_credentials_ini(&access_key_id, &secret_key),
                );
                (fields, access_key_id)
            }
        };

        Ok(Provisioned {
            provider_status: serde_json::json!({
                "kind": "aws",
                "userName": user_name,
                "policyName": format!("{user_name}-policy"),
                "policyHash": policy_hash,
                "accessKeyId": access_key_id,
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

        let access_key_id = root.field(ROOT_ACCESS_KEY_FIELD).ok_or_else(|| {
            CredentialsError::Authorization(format!(
                "root credential secret is missing field {ROOT_ACCESS_KEY_FIELD}"
            ))
        })?;
        let secret_key = root.field(ROOT_SECRET_KEY_FIELD).ok_or_else(|| {
            CredentialsError::Authorization(format!(
                "root credential secret is missing field {ROOT_SECRET_KEY_FIELD}"
            ))
        })?;

        let mut secret_fields = BTreeMap::new();
        secret_fields.insert(ROOT_ACCESS_KEY_FIELD.to_string(), access_key_id.to_string());
        secret_fields.insert(ROOT_SECRET_KEY_FIELD.to_string(), secret_key.to_string());
        secret_fields.insert(
            "credentials".to_string(),
            static_credentials_ini(access_key_id, secret_key),
        );

        Ok(Provisioned {
            provider_status: serde_json::json!({"kind": "aws", "passthrough": true}),
            secret_fields,
            expires_at: None,
        })
    }

    fn token_exchange(request: &CredentialsRequest) -> Result<Provisioned, CredentialsError> {
        let spec = aws_spec(request)?;
        let role_arn = spec.sts_role_arn.as_deref().ok_or_else(|| {
            CredentialsError::Validation("token exchange requires spec.aws.stsRoleArn".into())
        })?;

        let profile = format!(
            "[default]\nrole_arn = {role_arn}\nweb_identity_token_file = {WEB_IDENTITY_TOKEN_PATH}\n"
        );
        let mut secret_fields = BTreeMap::new();
        secret_fields.insert("credentials".to_string(), profile);

        Ok(Provisioned {
            provider_status: serde_json::json!({"kind": "aws", "stsRoleArn": role_arn}),
            secret_fields,
            expires_at: None,
        })
    }
}

#[async_trait]
impl CredentialsActuator for AwsActuator {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn validate(&self, request: &CredentialsRequest, mode: Mode) -> Result<(), CredentialsError> {
        let spec = aws_spec(request)?;
        match mode {
            Mode::Mint => {
                if spec.statement_entries.is_empty() {
                    return Err(CredentialsError::Validation(
                        "mint mode requires at least one statement entry".into(),
                    ));
                }
                for entry in &spec.statement_entries {
                    if entry.effect != "Allow" && entry.effect != "Deny" {
                        return Err(CredentialsError::Validation(format!(
                            "statement effect must be Allow or Deny, got '{}'",
                            entry.effect
                        )));
                    }
                    if entry.action.is_empty() {
                        return Err(CredentialsError::Validation(
                            "statement entry has no actions".into(),
                        ));
                    }
                }
            }
            Mode::TokenExchange => {
                if spec.sts_role_arn.is_none() {
                    return Err(CredentialsError::Validation(
                        "token exchange requires spec.aws.stsRoleArn".into(),
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
        let user_name = Self::user_name(request)?;
        cloud_call(&self.limiter, ProviderKind::Aws, "principal_exists").await?;
        self.client
            .principal_exists(&user_name)
            .await
            .map_err(|e| CredentialsError::from_cloud("iam user lookup", e))
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
        // Only minted requests own cloud-side state
        if mode != Mode::Mint {
            return Ok(());
        }
        let user_name = Self::user_name(request)?;
        cloud_call(&self.limiter, ProviderKind::Aws, "delete_principal").await?;
        match self.client.delete_principal(&user_name).await {
            Ok(()) => {
                info!("Deprovisioned IAM user {} for {}", user_name, request.owner_key());
                Ok(())
            }
            Err(CloudError::NotFound(_)) => Ok(()),
            Err(err) => Err(CredentialsError::from_cloud("iam user deletion", err)),
        }
    }
}
