//! # Observability
//!
//! Prometheus metrics for the controller. Tracing setup lives in the runtime
//! initialization path; the HTTP surface serving these metrics lives with
//! the controller server.

pub mod metrics;
