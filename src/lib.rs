//! codebox: a supervisor for running untrusted code in capability-restricted
//! execution units.
//!
//! # Architecture
//!
//! ## Wire Protocol ([`protocol`])
//! - [`protocol::message`]: closed message enum exchanged with the host
//! - [`protocol::codec`]: sentinel-prefixed base64 line framing
//!
//! ## Large Payloads ([`ipc`])
//! - [`ipc::side_channel`]: shared-directory transport for oversized payloads
//!
//! ## Core ([`core`])
//! - [`core::supervisor`]: host lifecycle, job table, crash recovery, public API
//! - [`core::host`]: the execution host loop, one unit per job
//! - [`core::launcher`]: how the supervisor obtains a host process
//! - [`core::unit`]: execution-unit seam and its event set
//! - [`core::deno`]: Deno-backed units
//! - [`core::manifest`]: explicit capability manifest per unit
//! - [`core::wrapper`]: job wrapper assembly and embedded runtime shims
//! - [`core::transform`]: source pre-transform collaborators
//!
//! ## Execution API ([`exec`])
//! - [`exec::events`]: caller-facing events and buffered outcomes
//! - [`exec::stream`]: per-call event stream with exit conditions
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: per-job working directories
//! - [`safety::cleanup`]: policy-gated, idempotent artifact cleanup
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured lifecycle events
//! - [`observability::metrics`]: counters, gauges and Prometheus export
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: `SandboxConfig`, errors and defaults
//! - [`config::validator`]: configuration checks
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::scripted`]: scripted unit provider
//! - [`testing::in_process`]: in-process host launcher

// Wire Protocol
pub mod protocol;

// Large Payloads
pub mod ipc;

// Supervisor, host and execution units
pub mod core;

// Execution API
pub mod exec;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint shared by the codebox and codebox-host binaries.
pub mod cli;

pub use config::types::{Result, RuntimeMode, SandboxConfig, SandboxError};
pub use core::supervisor::{HostState, Supervisor, SupervisorSnapshot};
pub use exec::{CodeExecutionEvent, EventKind, ExecutionOutcome, ExecutionStream, FunctionOutcome};
