use crate::protocol::message::{ExceptionPayload, JobStatus, LogKind, TestStatus};
use serde::{Deserialize, Serialize};

/// One event delivered to a caller of the execution API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeExecutionEvent {
    pub code_execution_id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    Start,
    #[serde(rename_all = "camelCase")]
    Status {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Log {
        kind: LogKind,
        log: String,
    },
    Exception {
        exception: ExceptionPayload,
    },
    #[serde(rename_all = "camelCase")]
    Test {
        name: String,
        status: TestStatus,
        event_timestamp: u64,
        message: String,
        duration: i64,
    },
    Result {
        result: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Status { .. } => "status",
            Self::Log { .. } => "log",
            Self::Exception { .. } => "exception",
            Self::Test { .. } => "test",
            Self::Result { .. } => "result",
        }
    }
}

impl CodeExecutionEvent {
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match &self.kind {
            EventKind::Status { status, .. } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }
}

/// Fully drained event sequence of a plain execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub events: Vec<CodeExecutionEvent>,
}

impl ExecutionOutcome {
    /// Last status observed, terminal or not.
    pub fn status(&self) -> Option<JobStatus> {
        self.events.iter().rev().find_map(|event| match &event.kind {
            EventKind::Status { status, .. } => Some(*status),
            _ => None,
        })
    }

    pub fn error(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match &event.kind {
            EventKind::Status { error: Some(error), .. } => Some(error.as_str()),
            _ => None,
        })
    }

    pub fn logs(&self) -> Vec<(LogKind, &str)> {
        self.events
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::Log { kind, log } => Some((*kind, log.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn exceptions(&self) -> Vec<&ExceptionPayload> {
        self.events
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::Exception { exception } => Some(exception),
                _ => None,
            })
            .collect()
    }

    pub fn result(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match &event.kind {
            EventKind::Result { result } => Some(result.as_str()),
            _ => None,
        })
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.iter().map(|event| event.kind.name()).collect()
    }
}

/// Drained function execution. `value` is set only when the raw result
/// decodes as JSON.
#[derive(Debug, Clone, Default)]
pub struct FunctionOutcome {
    pub outcome: ExecutionOutcome,
    pub result: Option<String>,
    pub value: Option<serde_json::Value>,
}

impl FunctionOutcome {
    pub fn from_outcome(outcome: ExecutionOutcome) -> Self {
        let result = outcome.result().map(str::to_string);
        let value = result.as_deref().and_then(|raw| match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("function result is not valid JSON: {}", e);
                None
            }
        });
        Self {
            outcome,
            result,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind) -> CodeExecutionEvent {
        CodeExecutionEvent {
            code_execution_id: "exec".to_string(),
            message_id: "msg".to_string(),
            kind,
        }
    }

    #[test]
    fn events_serialize_flat_with_type_tag() {
        let json = serde_json::to_value(event(EventKind::Log {
            kind: LogKind::Warn,
            log: "careful".to_string(),
        }))
        .unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["codeExecutionId"], "exec");
        assert_eq!(json["messageId"], "msg");
        assert_eq!(json["kind"], "warn");

        let start = serde_json::to_value(event(EventKind::Start)).unwrap();
        assert_eq!(start["type"], "start");
    }

    #[test]
    fn outcome_accessors_pick_latest_values() {
        let outcome = ExecutionOutcome {
            events: vec![
                event(EventKind::Start),
                event(EventKind::Status {
                    status: JobStatus::Running,
                    error: None,
                }),
                event(EventKind::Result {
                    result: "[1,2]".to_string(),
                }),
                event(EventKind::Status {
                    status: JobStatus::Completed,
                    error: None,
                }),
            ],
        };
        assert_eq!(outcome.status(), Some(JobStatus::Completed));
        assert_eq!(outcome.kinds(), vec!["start", "status", "result", "status"]);

        let function = FunctionOutcome::from_outcome(outcome);
        assert_eq!(function.result.as_deref(), Some("[1,2]"));
        assert_eq!(function.value, Some(serde_json::json!([1, 2])));
    }

    #[test]
    fn undecodable_result_leaves_value_empty() {
        let outcome = ExecutionOutcome {
            events: vec![event(EventKind::Result {
                result: "not json".to_string(),
            })],
        };
        let function = FunctionOutcome::from_outcome(outcome);
        assert_eq!(function.result.as_deref(), Some("not json"));
        assert!(function.value.is_none());
    }
}
