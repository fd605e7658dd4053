//! # Secret Synchronization
//!
//! Converges the target secret toward the desired credential fields.
//! Ownership is tracked through an annotation linking the secret back to its
//! request; a pre-existing secret owned by anything else is never
//! overwritten. Writes are skipped when the content hash already matches.

use crate::constants::{HASH_ANNOTATION, LAST_ROTATED_ANNOTATION, OWNER_ANNOTATION};
use crate::controller::error::{classify_kube_error, CredentialsError};
use crate::crd::SecretRef;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Content hash of the delivered fields, stable across map ordering
pub fn content_hash(fields: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in fields {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Reject secrets this request does not own. A secret without the ownership
/// annotation predates the controller and is equally off-limits.
pub fn verify_ownership(secret: &Secret, owner_key: &str) -> Result<(), CredentialsError> {
    let owner = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|ann| ann.get(OWNER_ANNOTATION));
    match owner {
        Some(existing) if existing == owner_key => Ok(()),
        Some(existing) => Err(CredentialsError::Conflict(format!(
            "target secret is owned by {existing}, not {owner_key}"
        ))),
        None => Err(CredentialsError::Conflict(
            "target secret exists but carries no ownership annotation".into(),
        )),
    }
}

/// Decode the current field values of a delivered secret
pub fn decode_fields(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .filter_map(|(k, v)| {
                    String::from_utf8(v.0.clone())
                        .ok()
                        .map(|value| (k.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn desired_secret(
    owner_key: &str,
    secret_ref: &SecretRef,
    fields: &BTreeMap<String, String>,
    resource_version: Option<String>,
) -> Secret {
    let mut annotations = BTreeMap::new();
    annotations.insert(OWNER_ANNOTATION.to_string(), owner_key.to_string());
    annotations.insert(HASH_ANNOTATION.to_string(), content_hash(fields));
    annotations.insert(LAST_ROTATED_ANNOTATION.to_string(), Utc::now().to_rfc3339());

    Secret {
        metadata: ObjectMeta {
            name: Some(secret_ref.name.clone()),
            namespace: Some(secret_ref.namespace.clone()),
            annotations: Some(annotations),
            resource_version,
            ..ObjectMeta::default()
        },
        string_data: Some(fields.clone()),
        ..Secret::default()
    }
}

/// Fields of a delivered secret, but only when they can be trusted: the
/// ownership annotation must name this request and the hash annotation must
/// match the decoded content. Tampered or foreign secrets yield `None`, so
/// their content is never adopted as desired state.
pub fn verified_fields(secret: &Secret, owner_key: &str) -> Option<BTreeMap<String, String>> {
    let annotations = secret.metadata.annotations.as_ref()?;
    if annotations.get(OWNER_ANNOTATION).map(String::as_str) != Some(owner_key) {
        return None;
    }
    let fields = decode_fields(secret);
    if annotations.get(HASH_ANNOTATION) != Some(&content_hash(&fields)) {
        return None;
    }
    Some(fields)
}

/// Verified fields of the target secret, or `None` when the secret is
/// absent or fails verification
pub async fn reusable_fields(
    client: &Client,
    secret_ref: &SecretRef,
    owner_key: &str,
) -> Result<Option<BTreeMap<String, String>>, CredentialsError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);
    let secret = api
        .get_opt(&secret_ref.name)
        .await
        .map_err(|e| classify_kube_error("read target secret", &e))?;
    Ok(secret.as_ref().and_then(|s| verified_fields(s, owner_key)))
}

/// Write the desired fields to the target secret. Returns whether the secret
/// content actually changed.
pub async fn sync(
    client: &Client,
    owner_key: &str,
    secret_ref: &SecretRef,
    fields: &BTreeMap<String, String>,
) -> Result<bool, CredentialsError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);
    let existing = api
        .get_opt(&secret_ref.name)
        .await
        .map_err(|e| classify_kube_error("read target secret", &e))?;

    match existing {
        None => {
            let secret = desired_secret(owner_key, secret_ref, fields, None);
            api.create(&PostParams::default(), &secret)
                .await
                .map_err(|e| classify_kube_error("create target secret", &e))?;
            info!(
                "Created secret {}/{} for {}",
                secret_ref.namespace, secret_ref.name, owner_key
            );
            Ok(true)
        }
        Some(current) => {
            verify_ownership(&current, owner_key)?;

            let current_hash = current
                .metadata
                .annotations
                .as_ref()
                .and_then(|ann| ann.get(HASH_ANNOTATION));
            if current_hash == Some(&content_hash(fields)) {
                debug!(
                    "Secret {}/{} already up to date",
                    secret_ref.namespace, secret_ref.name
                );
                return Ok(false);
            }

            // Replace with the observed resourceVersion; a concurrent writer
            // turns this into a 409 and the pass retries immediately
            let secret = desired_secret(
                owner_key,
                secret_ref,
                fields,
                current.metadata.resource_version.clone(),
            );
            api.replace(&secret_ref.name, &PostParams::default(), &secret)
                .await
                .map_err(|e| classify_kube_error("replace target secret", &e))?;
            info!(
                "Updated secret {}/{} for {}",
                secret_ref.namespace, secret_ref.name, owner_key
            );
            Ok(true)
        }
    }
}

/// Manual-mode ownership rule: the secret is supplied by an operator, so an
/// unannotated secret is fine; one claimed by a different request is not.
pub fn verify_manual_ownership(secret: &Secret, owner_key: &str) -> Result<(), CredentialsError> {
    let owner = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|ann| ann.get(OWNER_ANNOTATION));
    match owner {
        None => Ok(()),
        Some(existing) if existing == owner_key => Ok(()),
        Some(existing) => Err(CredentialsError::Conflict(format!(
            "manual secret is owned by {existing}, not {owner_key}"
        ))),
    }
}

/// Manual-mode check: the externally supplied secret must exist and must not
/// belong to another request
pub async fn manual_secret_present(
    client: &Client,
    secret_ref: &SecretRef,
    owner_key: &str,
) -> Result<bool, CredentialsError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);
    let secret = api
        .get_opt(&secret_ref.name)
        .await
        .map_err(|e| classify_kube_error("read manual secret", &e))?;
    match secret {
        None => Ok(false),
        Some(secret) => {
            verify_manual_ownership(&secret, owner_key)?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_content_hash_is_order_insensitive() {
        let a = fields(&[("x", "1"), ("y", "2")]);
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), "2".to_string());
        b.insert("x".to_string(), "1".to_string());
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        let a = fields(&[("x", "1")]);
        let b = fields(&[("x", "2")]);
        let c = fields(&[("x2", "")]);
        assert_ne!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn test_ownership_annotation_must_match() {
        let secret = desired_secret(
            "registry/image-registry",
            &SecretRef {
                name: "creds".to_string(),
                namespace: "registry".to_string(),
            },
            &fields(&[("k", "v")]),
            None,
        );
        verify_ownership(&secret, "registry/image-registry").unwrap();

        let err = verify_ownership(&secret, "other/request").unwrap_err();
        assert!(matches!(err, CredentialsError::Conflict(_)));
    }

    #[test]
    fn test_unannotated_secret_is_a_conflict() {
        let secret = Secret::default();
        let err = verify_ownership(&secret, "registry/image-registry").unwrap_err();
        assert!(matches!(err, CredentialsError::Conflict(_)));
    }

    #[test]
    fn test_desired_secret_carries_hash_annotation() {
        let content = fields(&[("aws_access_key_id", "AKIA")]);
        let secret = desired_secret(
            "ns/req",
            &SecretRef {
                name: "creds".to_string(),
                namespace: "ns".to_string(),
            },
            &content,
            Some("42".to_string()),
        );
        let annotations = secret.metadata.annotations.unwrap();
        assert_eq!(annotations[HASH_ANNOTATION], content_hash(&content));
        assert_eq!(annotations[OWNER_ANNOTATION], "ns/req");
        assert!(annotations.contains_key(LAST_ROTATED_ANNOTATION));
        assert_eq!(secret.metadata.resource_version.as_deref(), Some("42"));
    }

    fn delivered_secret(owner_key: &str, pairs: &[(&str, &str)]) -> Secret {
        use k8s_openapi::ByteString;
        let content = fields(pairs);
        let mut secret = desired_secret(
            owner_key,
            &SecretRef {
                name: "creds".to_string(),
                namespace: "ns".to_string(),
            },
            &content,
            None,
        );
        // Shape it the way a read returns it: data, not stringData
        secret.data = Some(
            content
                .into_iter()
                .map(|(k, v)| (k, ByteString(v.into_bytes())))
                .collect(),
        );
        secret.string_data = None;
        secret
    }

    #[test]
    fn test_verified_fields_accepts_intact_secret() {
        let secret = delivered_secret("ns/req", &[("aws_access_key_id", "AKIA")]);
        let fields = verified_fields(&secret, "ns/req").unwrap();
        assert_eq!(fields["aws_access_key_id"], "AKIA");
    }

    #[test]
    fn test_verified_fields_rejects_tampered_content() {
        use k8s_openapi::ByteString;
        let mut secret = delivered_secret("ns/req", &[("aws_secret_access_key", "genuine")]);
        secret.data.as_mut().unwrap().insert(
            "aws_secret_access_key".to_string(),
            ByteString(b"attacker-value".to_vec()),
        );
        assert!(verified_fields(&secret, "ns/req").is_none());
    }

    #[test]
    fn test_verified_fields_rejects_foreign_owner() {
        let secret = delivered_secret("other/request", &[("k", "v")]);
        assert!(verified_fields(&secret, "ns/req").is_none());
    }

    #[test]
    fn test_verified_fields_rejects_missing_hash_annotation() {
        let mut secret = delivered_secret("ns/req", &[("k", "v")]);
        secret
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .remove(HASH_ANNOTATION);
        assert!(verified_fields(&secret, "ns/req").is_none());
    }

    #[test]
    fn test_manual_ownership_tolerates_unannotated_secret() {
        let secret = Secret::default();
        verify_manual_ownership(&secret, "ns/req").unwrap();
    }

    #[test]
    fn test_manual_ownership_accepts_own_annotation() {
        let secret = delivered_secret("ns/req", &[("k", "v")]);
        verify_manual_ownership(&secret, "ns/req").unwrap();
    }

    #[test]
    fn test_manual_ownership_rejects_foreign_annotation() {
        let secret = delivered_secret("other/request", &[("k", "v")]);
        let err = verify_manual_ownership(&secret, "ns/req").unwrap_err();
        assert!(matches!(err, CredentialsError::Conflict(_)));
    }

    #[test]
    fn test_decode_fields_roundtrip() {
        use k8s_openapi::ByteString;
        let mut data = BTreeMap::new();
        data.insert("key".to_string(), ByteString(b"value".to_vec()));
        let secret = Secret {
            data: Some(data),
            ..Secret::default()
        };
        assert_eq!(decode_fields(&secret), fields(&[("key", "value")]));
    }
}
