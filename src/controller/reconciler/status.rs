//! # Status Persistence
//!
//! Writes observed state back through the status subresource and maintains
//! the finalizer and force-rotation annotation on the request itself.

use crate::constants::{CONTROLLER_NAME, FINALIZER, FORCE_ROTATION_ANNOTATION};
use crate::controller::error::{classify_kube_error, CredentialsError};
use crate::crd::status::{
    set_condition, CONDITION_DEGRADED, CONDITION_PROVISIONED, CONDITION_READY,
};
use crate::crd::{CredentialsRequest, CredentialsRequestStatus};
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::Api;
use tracing::debug;

fn patch_params() -> PatchParams {
    PatchParams::apply(CONTROLLER_NAME)
}

async fn patch_status(
    api: &Api<CredentialsRequest>,
    request: &CredentialsRequest,
    status: CredentialsRequestStatus,
) -> Result<(), CredentialsError> {
    // Unchanged status means nothing to write; avoids no-op churn on the
    // watch stream
    if let Some(existing) = &request.status {
        if serde_json::to_value(existing).ok() == serde_json::to_value(&status).ok() {
            debug!("Status unchanged for {}, skipping patch", request.owner_key());
            return Ok(());
        }
    }

    let name = request
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| CredentialsError::Validation("request has no name".into()))?;
    let patch = serde_json::json!({"status": status});
    api.patch_status(name, &patch_params(), &Patch::Merge(&patch))
        .await
        .map_err(|e| classify_kube_error("patch request status", &e))?;
    Ok(())
}

/// Record a fully successful pass
pub async fn persist_success(
    api: &Api<CredentialsRequest>,
    request: &CredentialsRequest,
    provider_status: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), CredentialsError> {
    let mut status = request.status.clone().unwrap_or_default();
    status.provisioned = true;
    status.last_sync_timestamp = Some(Utc::now().to_rfc3339());
    status.last_sync_generation = request.metadata.generation;
    status.provider_status = Some(provider_status);
    status.credentials_expire_at = expires_at.map(|t| t.to_rfc3339());

    set_condition(
        &mut status.conditions,
        CONDITION_READY,
        "True",
        "ReconciliationSucceeded",
        None,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_PROVISIONED,
        "True",
        "CredentialsDelivered",
        None,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_DEGRADED,
        "False",
        "AsExpected",
        None,
    );

    patch_status(api, request, status).await
}

/// Record a failed pass. Provisioned state and provider bookkeeping are left
/// as they were; only the conditions change.
pub async fn persist_failure(
    api: &Api<CredentialsRequest>,
    request: &CredentialsRequest,
    err: &CredentialsError,
) -> Result<(), CredentialsError> {
    let mut status = request.status.clone().unwrap_or_default();
    let message = err.to_string();

    set_condition(
        &mut status.conditions,
        CONDITION_READY,
        "False",
        err.reason(),
        Some(&message),
    );
    set_condition(
        &mut status.conditions,
        CONDITION_DEGRADED,
        "True",
        err.reason(),
        Some(&message),
    );

    patch_status(api, request, status).await
}

/// Record a Manual-mode pass: the controller only observes whether the
/// externally supplied secret exists
pub async fn persist_manual(
    api: &Api<CredentialsRequest>,
    request: &CredentialsRequest,
    secret_present: bool,
) -> Result<(), CredentialsError> {
    let mut status = request.status.clone().unwrap_or_default();
    status.provisioned = secret_present;
    status.last_sync_timestamp = Some(Utc::now().to_rfc3339());
    status.last_sync_generation = request.metadata.generation;

    if secret_present {
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            "True",
            "ManualSecretPresent",
            None,
        );
        set_condition(
            &mut status.conditions,
            CONDITION_DEGRADED,
            "False",
            "AsExpected",
            None,
        );
    } else {
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            "False",
            "ManualActionRequired",
            Some("target secret must be supplied by external tooling"),
        );
        set_condition(
            &mut status.conditions,
            CONDITION_DEGRADED,
            "True",
            "ManualActionRequired",
            Some("target secret must be supplied by external tooling"),
        );
    }

    patch_status(api, request, status).await
}

/// Add the deprovisioning finalizer if it is not present yet
pub async fn ensure_finalizer(
    api: &Api<CredentialsRequest>,
    request: &CredentialsRequest,
) -> Result<(), CredentialsError> {
    let has_finalizer = request
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER));
    if has_finalizer {
        return Ok(());
    }

    let name = request
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| CredentialsError::Validation("request has no name".into()))?;
    let mut finalizers = request.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &patch_params(), &Patch::Merge(&patch))
        .await
        .map_err(|e| classify_kube_error("add finalizer", &e))?;
    Ok(())
}

/// Drop the deprovisioning finalizer after cloud-side teardown
pub async fn remove_finalizer(
    api: &Api<CredentialsRequest>,
    request: &CredentialsRequest,
) -> Result<(), CredentialsError> {
    let name = request
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| CredentialsError::Validation("request has no name".into()))?;
    let finalizers: Vec<String> = request
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &patch_params(), &Patch::Merge(&patch))
        .await
        .map_err(|e| classify_kube_error("remove finalizer", &e))?;
    Ok(())
}

/// Clear the force-rotation annotation after the rotation it requested
/// completed
pub async fn clear_force_rotation(
    api: &Api<CredentialsRequest>,
    request: &CredentialsRequest,
) -> Result<(), CredentialsError> {
    if !request.force_rotation_requested() {
        return Ok(());
    }
    let name = request
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| CredentialsError::Validation("request has no name".into()))?;
    let patch = serde_json::json!({
        "metadata": {"annotations": {FORCE_ROTATION_ANNOTATION: serde_json::Value::Null}}
    });
    api.patch(name, &patch_params(), &Patch::Merge(&patch))
        .await
        .map_err(|e| classify_kube_error("clear force-rotation annotation", &e))?;
    Ok(())
}
