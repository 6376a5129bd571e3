//! Wire protocol between supervisor and execution host.
//!
//! One frame per line: `data: <base64(JSON(message))>\n`. Anything else on the
//! stream is diagnostic text and is ignored by the decoder.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, FrameReader, LineBuffer, FRAME_SENTINEL};
pub use message::{
    ExceptionPayload, JobException, JobLog, JobResult, JobStatus, JobStatusUpdate, JobTest,
    LargePayload, LogKind, Message, NewJob, OriginalMessage, StructuredException, TestStatus,
};
