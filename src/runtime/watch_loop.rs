//! # Watch Loop
//!
//! The long-running controller loop over CredentialsRequest resources.
//! kube-runtime serializes reconciles per resource key, so two passes never
//! run concurrently for the same request even with many workers.

use crate::controller::reconciler::{reconcile, Context};
use crate::crd::CredentialsRequest;
use crate::runtime::error_policy::{classify_watch_error, handle_reconciliation_error, WatchErrorClass};
use anyhow::Result;
use futures::StreamExt;
use kube::runtime::controller::{Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::Api;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Run the controller until a shutdown signal arrives
pub async fn run_watch_loop(
    requests: Api<CredentialsRequest>,
    context: Arc<Context>,
) -> Result<()> {
    let concurrency = context.config.worker_count;

    Controller::new(requests, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, handle_reconciliation_error, context)
        .for_each(|result| async move {
            match result {
                Ok((reference, _action)) => {
                    debug!("Reconciled {}", reference.name);
                }
                Err(err) => {
                    let message = err.to_string();
                    match classify_watch_error(&message) {
                        WatchErrorClass::AuthFailure => {
                            error!(
                                "Watch authentication failed, RBAC may have been revoked \
                                 or the token expired: {}",
                                message
                            );
                        }
                        WatchErrorClass::ResourceVersionExpired => {
                            debug!("Watch resource version expired, relisting: {}", message);
                        }
                        WatchErrorClass::Throttled => {
                            warn!("Watch throttled by the API server: {}", message);
                        }
                        WatchErrorClass::Other => {
                            warn!("Controller stream error: {}", message);
                        }
                    }
                }
            }
        })
        .await;

    Ok(())
}
