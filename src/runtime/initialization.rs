//! # Initialization
//!
//! Controller startup: rustls setup, tracing, metrics registration, HTTP
//! server startup, Kubernetes client creation, and wiring of the cloud
//! clients, actuators, and reconciler context.

use crate::config::{ControllerConfig, ServerConfig};
use crate::controller::actuator::{ActuatorRegistry, AwsActuator, GcpActuator};
use crate::controller::mode::ModeDetector;
use crate::controller::ratelimit::RateLimiterSet;
use crate::controller::reconciler::{backoff::BackoffTracker, reconcile, Context};
use crate::controller::root_credentials::{KubeRootCredentialSource, RootCredentialSource};
use crate::controller::server::{start_server, ServerState};
use crate::crd::provider::ProviderKind;
use crate::crd::CredentialsRequest;
use crate::observability;
use crate::provider::{AwsIamClient, CloudIamClient, GcpIamClient};
use anyhow::Result;
use kube::api::ListParams;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// API for CredentialsRequest CRD, all namespaces
    pub requests: Api<CredentialsRequest>,
    /// Shared reconciler context
    pub context: Arc<Context>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Cloud client, actuator, and mode detector wiring
/// - Reconciling existing resources before the watch starts
pub async fn initialize() -> Result<InitializationResult> {
    // Configure rustls crypto provider FIRST, before any other operations.
    // Required for rustls 0.23+ when no default provider is set via features.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloud_credential_controller=info".into()),
        )
        .init();

    info!("Starting Cloud Credential Controller");

    observability::metrics::register_metrics()?;

    let server_config = ServerConfig::from_env();
    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    });

    // Start the server in a background task but wait for it to be ready, so
    // readiness probes pass immediately after startup
    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default().await?;
    let config = ControllerConfig::from_env();

    let context = build_context(client.clone(), config)?;

    // Watch all namespaces; requests may live wherever the workloads do
    let requests: Api<CredentialsRequest> = Api::all(client.clone());

    // Resources created before controller deployment would otherwise wait
    // for the first watch event that may never come
    reconcile_existing_resources(&requests, &context).await?;

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        requests,
        context,
        server_state,
    })
}

/// Wire cloud clients, actuators, rate limiters, and the mode detector into
/// a reconciler context
pub fn build_context(client: Client, config: ControllerConfig) -> Result<Arc<Context>> {
    let root: Arc<dyn RootCredentialSource> = Arc::new(KubeRootCredentialSource::new(
        client.clone(),
        config.root_secret_name.clone(),
        config.root_secret_namespace.clone(),
        config.root_cache_ttl,
    ));

    let aws_client: Arc<dyn CloudIamClient> = Arc::new(AwsIamClient::new(
        Arc::clone(&root),
        config.aws_region.clone(),
        config.root_cache_ttl,
    ));
    let gcp_client: Arc<dyn CloudIamClient> =
        Arc::new(GcpIamClient::new(config.gcp_project_id.clone()));

    let limiter = Arc::new(RateLimiterSet::new(&config.rate_limits));

    let mut registry = ActuatorRegistry::new();
    registry.register(Arc::new(AwsActuator::new(
        Arc::clone(&aws_client),
        Arc::clone(&root),
        Arc::clone(&limiter),
    )));
    registry.register(Arc::new(GcpActuator::new(
        Arc::clone(&gcp_client),
        Arc::clone(&root),
        Arc::clone(&limiter),
        config.gcp_project_id.clone(),
    )));

    let mut validators: HashMap<ProviderKind, Arc<dyn CloudIamClient>> = HashMap::new();
    validators.insert(ProviderKind::Aws, aws_client);
    validators.insert(ProviderKind::Gcp, gcp_client);
    let mode_detector = ModeDetector::new(
        config.mode_override,
        root,
        validators,
        config.mode_cache_ttl,
    );

    let backoff = BackoffTracker::new(config.backoff_base, config.backoff_max);

    Ok(Arc::new(Context {
        client,
        config,
        registry,
        mode_detector,
        backoff,
    }))
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = std::time::Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = std::time::Duration::from_millis(config.poll_interval_ms);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state
            .is_ready
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

/// Reconcile existing CredentialsRequest resources before starting the watch
///
/// This ensures resources created before controller deployment are processed.
async fn reconcile_existing_resources(
    requests: &Api<CredentialsRequest>,
    context: &Arc<Context>,
) -> Result<()> {
    match requests.list(&ListParams::default()).await {
        Ok(list) => {
            info!(
                "CRD is queryable, found {} existing CredentialsRequest resources",
                list.items.len()
            );

            for item in list.items {
                let key = item.owner_key();
                info!("Reconciling existing resource {}", key);
                if let Err(e) = reconcile(Arc::new(item), Arc::clone(context)).await {
                    // The watch loop will pick it up again; startup proceeds
                    warn!("Startup reconcile of {} failed: {}", key, e);
                }
            }
            Ok(())
        }
        Err(e) => {
            error!("Failed to list CredentialsRequest resources: {}", e);
            Err(anyhow::anyhow!(
                "CRD is not queryable, is it installed? {e}"
            ))
        }
    }
}
