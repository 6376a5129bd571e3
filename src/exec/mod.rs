//! Caller-facing execution API: the event type and the per-call stream.

pub mod events;
pub mod stream;

pub use events::{CodeExecutionEvent, EventKind, ExecutionOutcome, FunctionOutcome};
pub use stream::ExecutionStream;
