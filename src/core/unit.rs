//! Execution-unit seam.
//!
//! A unit runs one job's wrapped source under a [`CapabilityManifest`] and
//! reports a small event set. Providers decide how isolation is achieved; the
//! host only sees [`UnitEvent`]s.

use crate::config::types::Result;
use crate::core::manifest::CapabilityManifest;
use crate::protocol::message::{ExceptionPayload, LogKind, TestStatus};
use crossbeam_channel::Receiver;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Prefix the runtime shim puts on structured event lines written to stdout.
pub const UNIT_EVENT_PREFIX: &str = "@@unit ";

#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    Log {
        kind: LogKind,
        text: String,
    },
    Test {
        name: String,
        status: TestStatus,
        event_timestamp: u64,
        message: String,
        duration: i64,
    },
    Exception(ExceptionPayload),
    /// JSON text of the function's return value.
    Result(String),
    Complete,
    /// The unit process is gone. Always the last event a unit produces.
    Exited {
        code: Option<i32>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestPayload {
    name: String,
    status: TestStatus,
    event_timestamp: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    duration: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawUnitEvent {
    Log { kind: LogKind, payload: String },
    Test { payload: TestPayload },
    Exception { payload: ExceptionPayload },
    Result { payload: serde_json::Value },
    Complete {},
}

impl From<RawUnitEvent> for UnitEvent {
    fn from(raw: RawUnitEvent) -> Self {
        match raw {
            RawUnitEvent::Log { kind, payload } => UnitEvent::Log { kind, text: payload },
            RawUnitEvent::Test { payload } => UnitEvent::Test {
                name: payload.name,
                status: payload.status,
                event_timestamp: payload.event_timestamp,
                message: payload.message,
                duration: payload.duration,
            },
            RawUnitEvent::Exception { payload } => UnitEvent::Exception(payload),
            RawUnitEvent::Result { payload } => match payload {
                serde_json::Value::String(text) => UnitEvent::Result(text),
                other => UnitEvent::Exception(ExceptionPayload::Message(format!(
                    "result payload must be a string, got {}",
                    json_type_name(&other)
                ))),
            },
            RawUnitEvent::Complete {} => UnitEvent::Complete,
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Map one stdout line from a unit. Structured lines become their event, a
/// corrupt structured line or any raw output becomes a plain log entry.
pub fn parse_stdout_line(line: &str) -> UnitEvent {
    if let Some(body) = line.strip_prefix(UNIT_EVENT_PREFIX) {
        match serde_json::from_str::<RawUnitEvent>(body) {
            Ok(raw) => return raw.into(),
            Err(e) => log::debug!("unparseable unit event ({}), forwarding as log", e),
        }
    }
    UnitEvent::Log {
        kind: LogKind::Log,
        text: line.to_string(),
    }
}

pub fn parse_stderr_line(line: &str) -> UnitEvent {
    UnitEvent::Log {
        kind: LogKind::Error,
        text: line.to_string(),
    }
}

/// Everything a provider needs to start one unit.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub job_id: String,
    pub job_dir: PathBuf,
    /// Wrapped entry module inside `job_dir`.
    pub entry: PathBuf,
    /// Transformed user source, as materialized in `job_dir`.
    pub source: String,
    pub testing: bool,
    pub function_input: Option<String>,
    pub manifest: CapabilityManifest,
    pub env: BTreeMap<String, String>,
}

pub trait UnitHandle: Send + Sync {
    fn id(&self) -> u32;
    /// Event stream; ends with [`UnitEvent::Exited`].
    fn events(&self) -> Receiver<UnitEvent>;
    /// Force-stop the unit. Idempotent.
    fn terminate(&self);
}

pub trait UnitProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Verify the provider can start units at all.
    fn preflight(&self) -> Result<()>;
    fn spawn(&self, spec: &UnitSpec) -> Result<Box<dyn UnitHandle>>;
}
