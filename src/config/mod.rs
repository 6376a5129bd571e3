//! Configuration
//!
//! Supervisor/host configuration, error types, and startup validation.

pub mod types;
pub mod validator;

pub use types::{Result, RuntimeMode, SandboxConfig, SandboxError};
