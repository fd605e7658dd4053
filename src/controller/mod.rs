//! # Controller
//!
//! Reconciliation machinery for `CredentialsRequest` resources: mode
//! detection, provider actuators, secret synchronization, rotation
//! scheduling, and the error taxonomy the retry policy keys off.

pub mod actuator;
pub mod error;
pub mod mode;
pub mod ratelimit;
pub mod reconciler;
pub mod root_credentials;
pub mod server;

pub use error::{CredentialsError, RetryClass};
pub use mode::{Mode, ModeDetector};
pub use reconciler::{reconcile, Context};
