//! Observability
//!
//! Structured audit events and in-process metrics.

pub mod audit;
pub mod metrics;
