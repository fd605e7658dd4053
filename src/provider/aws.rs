//! # AWS IAM Client
//!
//! IAM primitives backed by the official AWS SDK. Authenticates with the
//! root credential secret; validity checks go through STS GetCallerIdentity.

use crate::controller::root_credentials::RootCredentialSource;
use crate::provider::{CloudError, CloudIamClient, CredentialKey};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Root secret fields holding the administrator access key
pub const ROOT_ACCESS_KEY_FIELD: &str = "aws_access_key_id";
pub const ROOT_SECRET_KEY_FIELD: &str = "aws_secret_access_key";

/// AWS IAM capability provider.
///
/// SDK clients are rebuilt when the cached handle ages out, so an externally
/// rotated root credential is picked up without a controller restart.
pub struct AwsIamClient {
    root: Arc<dyn RootCredentialSource>,
    region: String,
    client_ttl: Duration,
    cached: Mutex<Option<(aws_sdk_iam::Client, aws_sdk_sts::Client, Instant)>>,
}

impl std::fmt::Debug for AwsIamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsIamClient")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl AwsIamClient {
    pub fn new(root: Arc<dyn RootCredentialSource>, region: String, client_ttl: Duration) -> Self {
        Self {
            root,
            region,
            client_ttl,
            cached: Mutex::new(None),
        }
    }

    async fn clients(&self) -> Result<(aws_sdk_iam::Client, aws_sdk_sts::Client), CloudError> {
        let mut cached = self.cached.lock().await;
        if let Some((iam, sts, at)) = cached.as_ref() {
            if at.elapsed() < self.client_ttl {
                return Ok((iam.clone(), sts.clone()));
            }
        }

        let root = self
            .root
            .load()
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?
            .ok_or_else(|| CloudError::Unauthorized("root credential secret is absent".into()))?;

        let access_key_id = root.field(ROOT_ACCESS_KEY_FIELD).ok_or_else(|| {
            CloudError::Unauthorized(format!(
                "root credential secret is missing field {ROOT_ACCESS_KEY_FIELD}"
            ))
        })?;
        let secret_access_key = root.field(ROOT_SECRET_KEY_FIELD).ok_or_else(|| {
            CloudError::Unauthorized(format!(
                "root credential secret is missing field {ROOT_SECRET_KEY_FIELD}"
            ))
        })?;

        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "cloud-credential-root",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let iam = aws_sdk_iam::Client::new(&sdk_config);
        let sts = aws_sdk_sts::Client::new(&sdk_config);
        *cached = Some((iam.clone(), sts.clone(), Instant::now()));
        debug!("Rebuilt AWS SDK clients from root credential");
        Ok((iam, sts))
    }
}

/// Translate the AWS error-code taxonomy into the uniform cloud taxonomy
fn map_sdk_err<E>(operation: &str, err: SdkError<E>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = ProvideErrorMetadata::code(&err).map(str::to_string);
    let msg = format!("{operation}: {}", DisplayErrorContext(&err));
    match code.as_deref() {
        Some("NoSuchEntity") => CloudError::NotFound(msg),
        Some("EntityAlreadyExists") => CloudError::AlreadyExists(msg),
        Some(
            "AccessDenied" | "AccessDeniedException" | "InvalidClientTokenId"
            | "SignatureDoesNotMatch" | "ExpiredToken" | "UnauthorizedOperation",
        ) => CloudError::Unauthorized(msg),
        Some("Throttling" | "ThrottlingException" | "RequestLimitExceeded" | "LimitExceeded") => {
            CloudError::RateLimited(msg)
        }
        _ => CloudError::Api(msg),
    }
}

fn policy_name_for(principal: &str) -> String {
    format!("{principal}-policy")
}

#[async_trait]
impl CloudIamClient for AwsIamClient {
    async fn authenticate(&self) -> Result<(), CloudError> {
        let (_, sts) = self.clients().await?;
        sts.get_caller_identity()
            .send()
            .await
            .map_err(|e| map_sdk_err("sts:GetCallerIdentity", e))?;
        Ok(())
    }

    async fn principal_exists(&self, name: &str) -> Result<bool, CloudError> {
        let (iam, _) = self.clients().await?;
        match iam.get_user().user_name(name).send().await {
            Ok(_) => Ok(true),
            Err(err) => match map_sdk_err("iam:GetUser", err) {
                CloudError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_principal(&self, name: &str) -> Result<String, CloudError> {
        let (iam, _) = self.clients().await?;
        iam.create_user()
            .user_name(name)
            .send()
            .await
            .map_err(|e| map_sdk_err("iam:CreateUser", e))?;
        info!("Created IAM user {}", name);
        Ok(name.to_string())
    }

    async fn attach_policy(&self, principal: &str, policy_document: &str) -> Result<(), CloudError> {
        let (iam, _) = self.clients().await?;
        iam.put_user_policy()
            .user_name(principal)
            .policy_name(policy_name_for(principal))
            .policy_document(policy_document)
            .send()
            .await
            .map_err(|e| map_sdk_err("iam:PutUserPolicy", e))?;
        Ok(())
    }

    async fn create_key(&self, principal: &str) -> Result<CredentialKey, CloudError> {
        let (iam, _) = self.clients().await?;

        // IAM caps users at two access keys; revoke prior keys so minting
        // never fails mid-rotation with a limit error
        let existing = iam
            .list_access_keys()
            .user_name(principal)
            .send()
            .await
            .map_err(|e| map_sdk_err("iam:ListAccessKeys", e))?;
        for metadata in existing.access_key_metadata() {
            if let Some(key_id) = metadata.access_key_id() {
                iam.delete_access_key()
                    .user_name(principal)
                    .access_key_id(key_id)
                    .send()
                    .await
                    .map_err(|e| map_sdk_err("iam:DeleteAccessKey", e))?;
                debug!("Revoked prior access key {} for {}", key_id, principal);
            }
        }

        let created = iam
            .create_access_key()
            .user_name(principal)
            .send()
            .await
            .map_err(|e| map_sdk_err("iam:CreateAccessKey", e))?;

        let access_key = created
            .access_key()
            .ok_or_else(|| CloudError::Api("iam:CreateAccessKey returned no key".into()))?;

        let mut fields = BTreeMap::new();
        fields.insert(
            ROOT_ACCESS_KEY_FIELD.to_string(),
            access_key.access_key_id().to_string(),
        );
        fields.insert(
            ROOT_SECRET_KEY_FIELD.to_string(),
            access_key.secret_access_key().to_string(),
        );

        Ok(CredentialKey {
            id: access_key.access_key_id().to_string(),
            fields,
        })
    }

    async fn delete_principal(&self, name: &str) -> Result<(), CloudError> {
        let (iam, _) = self.clients().await?;

        // Inline policies and keys must go before the user itself
        let policies = iam
            .list_user_policies()
            .user_name(name)
            .send()
            .await
            .map_err(|e| map_sdk_err("iam:ListUserPolicies", e))?;
        for policy_name in policies.policy_names() {
            iam.delete_user_policy()
                .user_name(name)
                .policy_name(policy_name)
                .send()
                .await
                .map_err(|e| map_sdk_err("iam:DeleteUserPolicy", e))?;
        }

        let keys = iam
            .list_access_keys()
            .user_name(name)
            .send()
            .await
            .map_err(|e| map_sdk_err("iam:ListAccessKeys", e))?;
        for metadata in keys.access_key_metadata() {
            if let Some(key_id) = metadata.access_key_id() {
                iam.delete_access_key()
                    .user_name(name)
                    .access_key_id(key_id)
                    .send()
                    .await
                    .map_err(|e| map_sdk_err("iam:DeleteAccessKey", e))?;
            }
        }

        iam.delete_user()
            .user_name(name)
            .send()
            .await
            .map_err(|e| map_sdk_err("iam:DeleteUser", e))?;
        info!("Deleted IAM user {}", name);
        Ok(())
    }
}
