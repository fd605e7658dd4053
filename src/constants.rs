//! # Constants
//!
//! Shared constants: API group, annotation keys, and configuration defaults.

/// Field manager / apply owner used for all Kubernetes patches.
pub const CONTROLLER_NAME: &str = "cloud-credential-controller";

/// Finalizer guarding cloud-side teardown before a request is removed.
pub const FINALIZER: &str = "cloudcredential.microscaler.io/deprovision";

/// Annotation on target secrets linking back to the owning CredentialsRequest
/// as `<namespace>/<name>`.
pub const OWNER_ANNOTATION: &str = "cloudcredential.microscaler.io/owner";

/// Annotation carrying the sha256 content hash of the delivered secret fields.
pub const HASH_ANNOTATION: &str = "cloudcredential.microscaler.io/secret-hash";

/// Annotation recording when the secret content last changed (RFC3339).
pub const LAST_ROTATED_ANNOTATION: &str = "cloudcredential.microscaler.io/last-rotated";

/// Annotation on a CredentialsRequest forcing key rotation on the next pass.
/// Cleared by the controller after a successful cycle.
pub const FORCE_ROTATION_ANNOTATION: &str = "cloudcredential.microscaler.io/force-rotation";

/// Projected service-account token path handed to TokenExchange consumers.
pub const WEB_IDENTITY_TOKEN_PATH: &str = "/var/run/secrets/cloud-credential/token";

// Controller defaults
pub const DEFAULT_WORKER_COUNT: u16 = 8;
pub const DEFAULT_BASE_RECONCILE_INTERVAL: &str = "2h";
pub const DEFAULT_MODE_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_ROOT_CACHE_TTL_SECS: u64 = 60;
pub const DEFAULT_ROTATION_SAFETY_MARGIN_SECS: u64 = 1800;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 900;

// Rate limiting defaults, sized below the documented throttling thresholds
// of the slowest supported backend
pub const DEFAULT_RATE_LIMIT_CAPACITY: f64 = 10.0;
pub const DEFAULT_RATE_LIMIT_REFILL_PER_SEC: f64 = 2.0;
pub const DEFAULT_RATE_LIMIT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// Root credential defaults
pub const DEFAULT_ROOT_SECRET_NAME: &str = "cloud-credential-root";
pub const DEFAULT_ROOT_SECRET_NAMESPACE: &str = "cloud-credential-system";

// HTTP server defaults
pub const DEFAULT_METRICS_PORT: u16 = 8080;
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 100;
