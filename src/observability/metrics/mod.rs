//! # Metrics
//!
//! Controller metrics registered against a dedicated registry so the
//! /metrics endpoint only exposes what this controller owns.

mod reconcile_metrics;

pub use reconcile_metrics::*;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::LazyLock;

/// Controller-wide metric registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Register all controller metrics. Called once during initialization.
pub fn register_metrics() -> Result<()> {
    reconcile_metrics::register(&REGISTRY)
}

/// Encode the registry for the /metrics endpoint
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
