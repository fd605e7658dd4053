//! # Provider Spec
//!
//! Polymorphic provider payloads for AWS and GCP credentials requests.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Closed set of supported provider backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Gcp,
}

impl ProviderKind {
    /// All supported provider kinds
    pub const fn all() -> &'static [ProviderKind] {
        &[ProviderKind::Aws, ProviderKind::Gcp]
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Gcp => "gcp",
        }
    }

    /// Whether this backend supports minting scoped child credentials
    /// from a root credential. Backends that cannot mint fall back to
    /// Passthrough when a valid root credential is present.
    pub const fn supports_mint(&self) -> bool {
        match self {
            ProviderKind::Aws | ProviderKind::Gcp => true,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific desired state
/// Kubernetes sends data in format: {"type": "aws", "aws": {...}}
/// We use externally tagged format and ignore the "type" field during deserialization
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ProviderSpec {
    /// Amazon Web Services IAM
    #[serde(rename = "aws")]
    Aws(AwsProviderSpec),
    /// Google Cloud Platform IAM
    #[serde(rename = "gcp")]
    Gcp(GcpProviderSpec),
}

impl ProviderSpec {
    /// The variant tag. Immutable after creation; the reconciler rejects
    /// requests whose recorded kind differs from the spec's current kind.
    pub const fn kind(&self) -> ProviderKind {
        match self {
            ProviderSpec::Aws(_) => ProviderKind::Aws,
            ProviderSpec::Gcp(_) => ProviderKind::Gcp,
        }
    }
}

impl<'de> serde::Deserialize<'de> for ProviderSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, MapAccess, Visitor};
        use std::fmt;

        struct ProviderSpecVisitor;

        impl<'de> Visitor<'de> for ProviderSpecVisitor {
            type Value = ProviderSpec;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a provider spec object with an aws or gcp field")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut aws: Option<AwsProviderSpec> = None;
                let mut gcp: Option<GcpProviderSpec> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "aws" => {
                            if aws.is_some() {
                                return Err(de::Error::duplicate_field("aws"));
                            }
                            aws = Some(map.next_value()?);
                        }
                        "gcp" => {
                            if gcp.is_some() {
                                return Err(de::Error::duplicate_field("gcp"));
                            }
                            gcp = Some(map.next_value()?);
                        }
                        _ => {
                            // Ignore unknown fields (like the redundant "type")
                            let _: serde::de::IgnoredAny = map.next_value()?;
                        }
                    }
                }

                match (aws, gcp) {
                    (Some(spec), None) => Ok(ProviderSpec::Aws(spec)),
                    (None, Some(spec)) => Ok(ProviderSpec::Gcp(spec)),
                    (None, None) => Err(de::Error::missing_field("aws or gcp")),
                    _ => Err(de::Error::custom("multiple provider types specified")),
                }
            }
        }

        deserializer.deserialize_map(ProviderSpecVisitor)
    }
}

/// AWS IAM provider spec
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderSpec {
    /// Requested IAM policy statements. Required in Mint mode; the minted
    /// user gets exactly these grants as an inline policy.
    #[serde(default)]
    pub statement_entries: Vec<StatementEntry>,
    /// Optional hint for the minted IAM user name. The final name is still
    /// derived deterministically from the request identity.
    #[serde(default)]
    pub user_name_hint: Option<String>,
    /// IAM role to assume via web identity federation.
    /// Required in TokenExchange mode, ignored otherwise.
    #[serde(default)]
    pub sts_role_arn: Option<String>,
}

/// One IAM policy statement
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatementEntry {
    /// "Allow" or "Deny"
    pub effect: String,
    /// Actions granted, e.g. "s3:GetObject"
    pub action: Vec<String>,
    /// Resource ARN the statement applies to
    pub resource: String,
}

/// GCP IAM provider spec
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpProviderSpec {
    /// Predefined roles bound to the minted service account at project level,
    /// e.g. "roles/storage.objectViewer". Required in Mint mode.
    #[serde(default)]
    pub predefined_roles: Vec<String>,
    /// Optional hint for the minted service account ID. The final ID is still
    /// derived deterministically from the request identity.
    #[serde(default)]
    pub service_account_hint: Option<String>,
    /// Workload identity pool audience.
    /// Required in TokenExchange mode, ignored otherwise.
    #[serde(default)]
    pub audience: Option<String>,
    /// Service account impersonated via federated tokens.
    /// Required in TokenExchange mode, ignored otherwise.
    #[serde(default)]
    pub service_account_email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_aws_spec() {
        let json = serde_json::json!({
            "aws": {
                "statementEntries": [
                    {"effect": "Allow", "action": ["s3:GetObject"], "resource": "arn:aws:s3:::bucket/*"}
                ],
                "userNameHint": "image-registry"
            }
        });
        let spec: ProviderSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.kind(), ProviderKind::Aws);
        match spec {
            ProviderSpec::Aws(aws) => {
                assert_eq!(aws.statement_entries.len(), 1);
                assert_eq!(aws.statement_entries[0].effect, "Allow");
                assert_eq!(aws.user_name_hint.as_deref(), Some("image-registry"));
            }
            ProviderSpec::Gcp(_) => panic!("expected aws spec"),
        }
    }

    #[test]
    fn test_deserialize_gcp_spec_ignores_type_field() {
        let json = serde_json::json!({
            "type": "gcp",
            "gcp": {
                "predefinedRoles": ["roles/storage.objectViewer"]
            }
        });
        let spec: ProviderSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.kind(), ProviderKind::Gcp);
    }

    #[test]
    fn test_deserialize_rejects_multiple_providers() {
        let json = serde_json::json!({
            "aws": {"statementEntries": []},
            "gcp": {"predefinedRoles": []}
        });
        assert!(serde_json::from_value::<ProviderSpec>(json).is_err());
    }

    #[test]
    fn test_deserialize_rejects_missing_provider() {
        let json = serde_json::json!({"type": "aws"});
        assert!(serde_json::from_value::<ProviderSpec>(json).is_err());
    }

    #[test]
    fn test_provider_kind_roundtrip() {
        assert_eq!(ProviderKind::Aws.as_str(), "aws");
        assert_eq!(ProviderKind::Gcp.to_string(), "gcp");
        assert!(ProviderKind::Aws.supports_mint());
    }
}
