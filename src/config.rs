//! # Controller Configuration
//!
//! Controller-level configuration loaded from environment variables (populated from ConfigMap).
//!
//! All configuration has sensible defaults and can be overridden via environment variables.
//! Environment variables are populated from a ConfigMap using `envFrom` in the deployment.

use crate::constants;
use crate::controller::mode::Mode;
use crate::crd::provider::ProviderKind;
use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;

/// Controller configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Explicit cluster-wide provisioning mode override.
    /// When set, mode detection is bypassed unconditionally.
    pub mode_override: Option<Mode>,
    /// Maximum number of CredentialsRequests reconciled in parallel
    pub worker_count: u16,
    /// Baseline periodic re-check interval after a successful pass
    pub base_reconcile_interval: Duration,
    /// How long a detected mode stays valid before re-derivation
    pub mode_cache_ttl: Duration,
    /// How long a loaded root credential stays valid before re-reading
    pub root_cache_ttl: Duration,
    /// Re-check this far ahead of a known credential expiry
    pub rotation_safety_margin: Duration,
    /// First retry delay after a transient failure
    pub backoff_base: Duration,
    /// Ceiling for transient-failure retry delays
    pub backoff_max: Duration,
    /// Per-provider token bucket parameters
    pub rate_limits: HashMap<ProviderKind, RateLimitConfig>,
    /// Name of the root/administrator credential secret
    pub root_secret_name: String,
    /// Namespace of the root/administrator credential secret
    pub root_secret_namespace: String,
    /// AWS region for IAM/STS calls
    pub aws_region: String,
    /// GCP project ID for IAM calls
    pub gcp_project_id: String,
}

/// Token bucket parameters for one provider backend
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum burst size
    pub capacity: f64,
    /// Sustained tokens per second
    pub refill_per_sec: f64,
    /// How long a cloud call may wait for a token before being reported
    /// as a transient failure
    pub acquire_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: constants::DEFAULT_RATE_LIMIT_CAPACITY,
            refill_per_sec: constants::DEFAULT_RATE_LIMIT_REFILL_PER_SEC,
            acquire_timeout: Duration::from_secs(constants::DEFAULT_RATE_LIMIT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode_override: None,
            worker_count: constants::DEFAULT_WORKER_COUNT,
            base_reconcile_interval: parse_kubernetes_duration(
                constants::DEFAULT_BASE_RECONCILE_INTERVAL,
            )
            .unwrap_or(Duration::from_secs(7200)),
            mode_cache_ttl: Duration::from_secs(constants::DEFAULT_MODE_CACHE_TTL_SECS),
            root_cache_ttl: Duration::from_secs(constants::DEFAULT_ROOT_CACHE_TTL_SECS),
            rotation_safety_margin: Duration::from_secs(
                constants::DEFAULT_ROTATION_SAFETY_MARGIN_SECS,
            ),
            backoff_base: Duration::from_secs(constants::DEFAULT_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(constants::DEFAULT_BACKOFF_MAX_SECS),
            rate_limits: ProviderKind::all()
                .iter()
                .map(|kind| (*kind, RateLimitConfig::default()))
                .collect(),
            root_secret_name: constants::DEFAULT_ROOT_SECRET_NAME.to_string(),
            root_secret_namespace: constants::DEFAULT_ROOT_SECRET_NAMESPACE.to_string(),
            aws_region: "us-east-1".to_string(),
            gcp_project_id: String::new(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mode_override = std::env::var("MODE_OVERRIDE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .and_then(|v| v.parse::<Mode>().ok());

        let base_reconcile_interval = std::env::var("BASE_RECONCILE_INTERVAL")
            .ok()
            .and_then(|v| parse_kubernetes_duration(&v).ok())
            .unwrap_or(defaults.base_reconcile_interval);

        let rate_limits = ProviderKind::all()
            .iter()
            .map(|kind| {
                let prefix = kind.as_str().to_uppercase();
                let limits = RateLimitConfig {
                    capacity: env_var_or_default(
                        &format!("{prefix}_RATE_LIMIT_CAPACITY"),
                        constants::DEFAULT_RATE_LIMIT_CAPACITY,
                    ),
                    refill_per_sec: env_var_or_default(
                        &format!("{prefix}_RATE_LIMIT_REFILL_PER_SEC"),
                        constants::DEFAULT_RATE_LIMIT_REFILL_PER_SEC,
                    ),
                    acquire_timeout: Duration::from_secs(env_var_or_default(
                        "RATE_LIMIT_ACQUIRE_TIMEOUT_SECS",
                        constants::DEFAULT_RATE_LIMIT_ACQUIRE_TIMEOUT_SECS,
                    )),
                };
                (*kind, limits)
            })
            .collect();

        Self {
            mode_override,
            worker_count: env_var_or_default("WORKER_COUNT", constants::DEFAULT_WORKER_COUNT),
            base_reconcile_interval,
            mode_cache_ttl: Duration::from_secs(env_var_or_default(
                "MODE_CACHE_TTL_SECS",
                constants::DEFAULT_MODE_CACHE_TTL_SECS,
            )),
            root_cache_ttl: Duration::from_secs(env_var_or_default(
                "ROOT_CACHE_TTL_SECS",
                constants::DEFAULT_ROOT_CACHE_TTL_SECS,
            )),
            rotation_safety_margin: Duration::from_secs(env_var_or_default(
                "ROTATION_SAFETY_MARGIN_SECS",
                constants::DEFAULT_ROTATION_SAFETY_MARGIN_SECS,
            )),
            backoff_base: Duration::from_secs(env_var_or_default(
                "BACKOFF_BASE_SECS",
                constants::DEFAULT_BACKOFF_BASE_SECS,
            )),
            backoff_max: Duration::from_secs(env_var_or_default(
                "BACKOFF_MAX_SECS",
                constants::DEFAULT_BACKOFF_MAX_SECS,
            )),
            rate_limits,
            root_secret_name: std::env::var("ROOT_SECRET_NAME")
                .unwrap_or_else(|_| defaults.root_secret_name),
            root_secret_namespace: std::env::var("ROOT_SECRET_NAMESPACE")
                .unwrap_or_else(|_| defaults.root_secret_namespace),
            aws_region: std::env::var("AWS_REGION").unwrap_or_else(|_| defaults.aws_region),
            gcp_project_id: std::env::var("GCP_PROJECT_ID").unwrap_or_default(),
        }
    }

    /// Rate limit parameters for one provider, falling back to defaults
    pub fn rate_limit_for(&self, kind: ProviderKind) -> RateLimitConfig {
        self.rate_limits.get(&kind).copied().unwrap_or_default()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server port for metrics and health probes
    pub metrics_port: u16,
    /// How long to wait for the server to be ready before giving up (seconds)
    pub startup_timeout_secs: u64,
    /// How often to check if the server is ready during startup (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_port: constants::DEFAULT_METRICS_PORT,
            startup_timeout_secs: constants::DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            poll_interval_ms: constants::DEFAULT_SERVER_POLL_INTERVAL_MS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", constants::DEFAULT_METRICS_PORT),
            startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                constants::DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            ),
            poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                constants::DEFAULT_SERVER_POLL_INTERVAL_MS,
            ),
        }
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse Kubernetes duration string into std::time::Duration
/// Supports formats: "30s", "1m", "5m", "1h", "2h", "1d"
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let duration_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    let interval_lower = duration_trimmed.to_lowercase();

    let captures = duration_regex.captures(&interval_lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '1m', '5m', '1h')",
            duration_trimmed
        )
    })?;

    let number: u64 = captures
        .name("number")
        .map(|m| m.as_str())
        .unwrap_or("0")
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid duration number in '{duration_trimmed}': {e}"))?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration number must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    let seconds = match captures.name("unit").map(|m| m.as_str()) {
        Some("s") => number,
        Some("m") => number * 60,
        Some("h") => number * 3600,
        Some("d") => number * 86400,
        other => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{:?}' in duration '{}'. Expected: s, m, h, or d",
                other,
                duration_trimmed
            ));
        }
    };

    Ok(Duration::from_secs(seconds))
}
