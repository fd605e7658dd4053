//! # Cloud Credential Controller
//!
//! A Kubernetes controller that provisions, rotates, and retires cloud-provider
//! IAM credentials for workloads running inside the cluster.
//!
//! ## Overview
//!
//! This controller provides declarative credential management by:
//!
//! 1. **Watching CredentialsRequest resources** - Consumers declare the permissions
//!    they need and the Secret the material should land in
//! 2. **Detecting the provisioning mode** - Mint, Passthrough, Manual, or
//!    TokenExchange, derived from the root credential and an optional override
//! 3. **Driving provider actuators** - AWS IAM and GCP IAM implementations of a
//!    uniform existence/create/update/delete/validate contract
//! 4. **Syncing target secrets** - Content-hash based drift detection so delivered
//!    credentials self-heal without needless rewrites
//! 5. **Scheduling rotation** - Periodic re-checks, forced rotation, and
//!    expiry-aware acceleration
//!
//! ## Features
//!
//! - **Multi-provider**: AWS and GCP actuators behind one capability interface
//! - **Idempotent convergence**: safe under partial failure and concurrent mutation
//! - **Ownership protection**: hand-authored secrets are never overwritten
//! - **Prometheus metrics**: reconciliation and cloud-API observability
//! - **Health probes**: HTTP endpoints for liveness and readiness checks
//!
//! ## Usage
//!
//! See the [README.md](../README.md) for detailed usage instructions and examples.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod provider;
pub mod runtime;

pub use crd::{CredentialsRequest, CredentialsRequestSpec, CredentialsRequestStatus};
