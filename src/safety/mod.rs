//! Safety and cleanup
//!
//! Per-job working directories and idempotent, policy-gated artifact removal.

pub mod cleanup;
pub mod workspace;
