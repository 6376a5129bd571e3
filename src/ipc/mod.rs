//! Shared-directory side-channel for payloads too large for the framed stream.

pub mod side_channel;

pub use side_channel::{Direction, PendingPayload, PendingPayloads, SideChannel};
