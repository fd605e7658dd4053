//! # Reconciler
//!
//! The convergence loop for a single CredentialsRequest: detect mode,
//! validate, drive the provider actuator, deliver the secret, persist
//! status, and schedule the next look.

pub mod backoff;
pub mod rotation;
pub mod secret_sync;
pub mod status;

use crate::config::ControllerConfig;
use crate::constants::FORCE_ROTATION_ANNOTATION;
use crate::controller::actuator::ActuatorRegistry;
use crate::controller::error::{CredentialsError, RetryClass};
use crate::controller::mode::{Mode, ModeDetector};
use crate::controller::reconciler::backoff::BackoffTracker;
use crate::crd::CredentialsRequest;
use crate::observability::metrics;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Shared state handed to every reconcile invocation
pub struct Context {
    pub client: Client,
    pub config: ControllerConfig,
    pub registry: ActuatorRegistry,
    pub mode_detector: ModeDetector,
    pub backoff: BackoffTracker,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

fn has_finalizer(request: &CredentialsRequest) -> bool {
    request
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == crate::constants::FINALIZER))
}

/// Reconcile one CredentialsRequest toward its desired state
#[instrument(skip_all, fields(request = %request.owner_key()))]
pub async fn reconcile(
    request: Arc<CredentialsRequest>,
    ctx: Arc<Context>,
) -> Result<Action, CredentialsError> {
    let start = Instant::now();
    metrics::increment_reconciliations();

    let namespace = request.metadata.namespace.as_deref().unwrap_or("default");
    let api: Api<CredentialsRequest> = Api::namespaced(ctx.client.clone(), namespace);

    let outcome = reconcile_inner(&request, &ctx, &api).await;
    metrics::observe_reconcile_duration(start.elapsed().as_secs_f64());

    match outcome {
        Ok(action) => {
            ctx.backoff.reset(&request.owner_key());
            Ok(action)
        }
        Err(err) => {
            if should_record_failure(&err) {
                // Best effort; the primary error is the one worth propagating
                if let Err(status_err) = status::persist_failure(&api, &request, &err).await {
                    warn!(
                        "Failed to persist failure status for {}: {}",
                        request.owner_key(),
                        status_err
                    );
                }
                error!("Reconcile failed for {}: {}", request.owner_key(), err);
            } else {
                debug!(
                    "Retrying {} immediately without status update: {}",
                    request.owner_key(),
                    err
                );
            }
            Err(err)
        }
    }
}

/// Whether a failed pass is worth a Degraded condition. Immediately retried
/// write races are not failures of the request itself.
fn should_record_failure(err: &CredentialsError) -> bool {
    err.retry_class() != RetryClass::Immediate
}

async fn reconcile_inner(
    request: &CredentialsRequest,
    ctx: &Context,
    api: &Api<CredentialsRequest>,
) -> Result<Action, CredentialsError> {
    let kind = request.spec.provider_spec.kind();

    if request.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(request) {
            return Ok(Action::await_change());
        }
        let mode = ctx.mode_detector.determine_mode(kind).await?;
        let actuator = ctx.registry.get(kind)?;
        actuator.delete(request, mode).await?;
        status::remove_finalizer(api, request).await?;
        info!("Deprovisioned and released {}", request.owner_key());
        return Ok(Action::await_change());
    }

    status::ensure_finalizer(api, request).await?;

    // Provider kind is immutable once recorded; switching providers would
    // orphan cloud-side state
    let recorded_kind = request
        .status
        .as_ref()
        .and_then(|s| s.provider_status.as_ref())
        .and_then(|p| p.get("kind"))
        .and_then(serde_json::Value::as_str);
    if let Some(recorded) = recorded_kind {
        if recorded != kind.as_str() {
            return Err(CredentialsError::Validation(format!(
                "provider kind is immutable: provisioned as {recorded}, spec now says {kind}"
            )));
        }
    }

    let mode = ctx.mode_detector.determine_mode(kind).await?;
    let actuator = ctx.registry.get(kind)?;
    actuator.validate(request, mode)?;

    if mode == Mode::Manual {
        let present = secret_sync::manual_secret_present(
            &ctx.client,
            &request.spec.secret_ref,
            &request.owner_key(),
        )
        .await?;
        status::persist_manual(api, request, present).await?;
        return Ok(Action::requeue(ctx.config.base_reconcile_interval));
    }

    let force_rotate = request.force_rotation_requested();
    let existing_fields = secret_sync::reusable_fields(
        &ctx.client,
        &request.spec.secret_ref,
        &request.owner_key(),
    )
    .await?;
    let recorded_status = request
        .status
        .as_ref()
        .and_then(|s| s.provider_status.as_ref());

    let exists = actuator.exists(request, mode).await?;
    let result = if exists {
        actuator
            .update(
                request,
                mode,
                existing_fields.as_ref(),
                recorded_status,
                force_rotate,
            )
            .await
    } else {
        actuator.create(request, mode).await
    };
    let provisioned = match result {
        Ok(provisioned) => provisioned,
        Err(err) => {
            if mode == Mode::Mint && matches!(err, CredentialsError::Authorization(_)) {
                ctx.mode_detector.record_mint_authorization_failure();
            }
            return Err(err);
        }
    };

    let changed = secret_sync::sync(
        &ctx.client,
        &request.owner_key(),
        &request.spec.secret_ref,
        &provisioned.secret_fields,
    )
    .await?;
    if changed {
        metrics::increment_secret_writes();
    }

    let expires_at = provisioned.expires_at;
    status::persist_success(api, request, provisioned.provider_status, expires_at).await?;
    status::clear_force_rotation(api, request).await?;

    // Schedule against the state just written, not the stale copy we were
    // handed: the generation is applied and any forced rotation is done
    let mut applied = request.clone();
    if let Some(annotations) = applied.metadata.annotations.as_mut() {
        annotations.remove(FORCE_ROTATION_ANNOTATION);
    }
    let mut applied_status = applied.status.take().unwrap_or_default();
    applied_status.last_sync_generation = applied.metadata.generation;
    applied_status.credentials_expire_at = expires_at.map(|t| t.to_rfc3339());
    applied.status = Some(applied_status);

    let next = rotation::next_check_after(
        &applied,
        Utc::now(),
        ctx.config.base_reconcile_interval,
        ctx.config.rotation_safety_margin,
    );
    metrics::increment_requeues_total("scheduled");
    Ok(Action::requeue(next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflicts_do_not_degrade_status() {
        // A lost write race retries immediately; only real failures are
        // recorded on the request
        assert!(!should_record_failure(&CredentialsError::StoreConflict(
            "409 on secret replace".into()
        )));
        assert!(should_record_failure(&CredentialsError::TransientCloud(
            "throttled".into()
        )));
        assert!(should_record_failure(&CredentialsError::Validation(
            "bad spec".into()
        )));
        assert!(should_record_failure(&CredentialsError::Conflict(
            "owned elsewhere".into()
        )));
    }
}
