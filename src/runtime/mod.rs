//! # Runtime Module
//!
//! Runtime components for the Cloud Credential Controller, including
//! initialization, watch loop, and error handling.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;

pub use error_policy::*;
pub use initialization::*;
pub use watch_loop::*;
