//! # Custom Resource Definitions
//!
//! CRD types for the Cloud Credential Controller.
//!
//! This module contains the CredentialsRequest custom resource: the declarative
//! record describing a desired cloud credential and its delivery target.

pub mod provider;
pub mod status;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use provider::{AwsProviderSpec, GcpProviderSpec, ProviderKind, ProviderSpec, StatementEntry};
pub use status::{Condition, CredentialsRequestStatus};

/// CredentialsRequest Custom Resource Definition
///
/// Declares a desired cloud credential: the permissions it must carry and the
/// Kubernetes Secret the material should be delivered to. The controller
/// continuously converges cloud-side state and the target secret against this
/// record.
///
/// # Example
///
/// ```yaml
/// apiVersion: cloudcredential.microscaler.io/v1
/// kind: CredentialsRequest
/// metadata:
///   name: image-registry
///   namespace: registry
/// spec:
///   providerSpec:
///     aws:
///       statementEntries:
///         - effect: Allow
///           action: ["s3:GetObject", "s3:PutObject"]
///           resource: "arn:aws:s3:::registry-storage/*"
///   secretRef:
///     name: registry-cloud-credentials
///     namespace: registry
///   serviceAccountNames:
///     - registry
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "CredentialsRequest",
    group = "cloudcredential.microscaler.io",
    version = "v1",
    namespaced,
    status = "CredentialsRequestStatus",
    shortname = "credreq",
    printcolumn = r#"{"name":"Provisioned", "type":"boolean", "jsonPath":".status.provisioned"}"#,
    printcolumn = r#"{"name":"LastSync", "type":"string", "jsonPath":".status.lastSyncTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRequestSpec {
    /// Provider-specific desired state. The variant tag (provider kind) is
    /// immutable after creation; changing provider requires deleting and
    /// recreating the request.
    pub provider_spec: ProviderSpec,
    /// Target secret the credential material is delivered to
    pub secret_ref: SecretRef,
    /// Workload service accounts entitled to use the credential
    #[serde(default)]
    pub service_account_names: Vec<String>,
}

/// Namespace+name reference to the target secret
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

impl CredentialsRequest {
    /// `<namespace>/<name>` key identifying this request, used for ownership
    /// annotations and per-key bookkeeping
    pub fn owner_key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or("unknown")
        )
    }

    /// Whether the force-rotation annotation is present
    pub fn force_rotation_requested(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|ann| ann.contains_key(crate::constants::FORCE_ROTATION_ANNOTATION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_json() -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "cloudcredential.microscaler.io/v1",
            "kind": "CredentialsRequest",
            "metadata": {"name": "image-registry", "namespace": "registry"},
            "spec": {
                "providerSpec": {
                    "aws": {
                        "statementEntries": [
                            {"effect": "Allow", "action": ["s3:GetObject"], "resource": "*"}
                        ]
                    }
                },
                "secretRef": {"name": "registry-creds", "namespace": "registry"},
                "serviceAccountNames": ["registry"]
            }
        })
    }

    #[test]
    fn test_deserialize_credentials_request() {
        let request: CredentialsRequest = serde_json::from_value(request_json()).unwrap();
        assert_eq!(request.spec.provider_spec.kind(), ProviderKind::Aws);
        assert_eq!(request.spec.secret_ref.name, "registry-creds");
        assert_eq!(request.spec.service_account_names, vec!["registry"]);
        assert_eq!(request.owner_key(), "registry/image-registry");
    }

    #[test]
    fn test_force_rotation_annotation() {
        let mut json = request_json();
        json["metadata"]["annotations"] = serde_json::json!({
            crate::constants::FORCE_ROTATION_ANNOTATION: "true"
        });
        let request: CredentialsRequest = serde_json::from_value(json).unwrap();
        assert!(request.force_rotation_requested());
    }
}
