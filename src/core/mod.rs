//! Sandbox core.
//!
//! The supervisor and the execution host on either side of the wire, plus the
//! execution-unit seam the host drives.

pub mod deno;
pub mod host;
pub mod launcher;
pub mod manifest;
pub mod supervisor;
pub mod transform;
pub mod unit;
pub mod wrapper;
