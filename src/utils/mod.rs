//! Utilities
//!
//! Identifier generation, clocks, and environment hygiene for spawned processes.

pub mod env_hygiene;
pub mod ids;
