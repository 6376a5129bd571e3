use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of frames exchanged on the supervisor/host stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    NewJob(NewJob),
    JobStatus(JobStatusUpdate),
    JobLog(JobLog),
    JobTest(JobTest),
    JobException(JobException),
    JobResult(JobResult),
    LargePayload(LargePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub job_id: String,
    pub code: String,
    pub testing: bool,
    /// JSON text of the argument list. Absent for plain code execution, and
    /// omitted when the input travels through the side-channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_input: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Timeout => 2,
        }
    }

    /// Monotone lifecycle: pending -> running -> terminal, each entered at most once.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub job_id: String,
    pub kind: LogKind,
    pub log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Running,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTest {
    pub job_id: String,
    pub name: String,
    pub status: TestStatus,
    pub event_timestamp: u64,
    pub message: String,
    /// Milliseconds; -1 while the test is still running or was skipped.
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredException {
    #[serde(default)]
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExceptionPayload {
    Message(String),
    Structured(StructuredException),
}

impl ExceptionPayload {
    pub fn message(&self) -> &str {
        match self {
            Self::Message(message) => message,
            Self::Structured(structured) => &structured.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobException {
    pub job_id: String,
    pub exception: ExceptionPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: String,
    /// Opaque result text. Omitted on the wire when diverted to the side-channel.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginalMessage {
    NewJob,
    JobResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LargePayload {
    pub job_id: String,
    pub original_message: OriginalMessage,
    /// File name relative to the shared IPC directory.
    pub file_path: String,
    pub timestamp: u64,
}

impl Message {
    pub fn job_id(&self) -> &str {
        match self {
            Self::NewJob(m) => &m.job_id,
            Self::JobStatus(m) => &m.job_id,
            Self::JobLog(m) => &m.job_id,
            Self::JobTest(m) => &m.job_id,
            Self::JobException(m) => &m.job_id,
            Self::JobResult(m) => &m.job_id,
            Self::LargePayload(m) => &m.job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewJob(_) => "new-job",
            Self::JobStatus(_) => "job-status",
            Self::JobLog(_) => "job-log",
            Self::JobTest(_) => "job-test",
            Self::JobException(_) => "job-exception",
            Self::JobResult(_) => "job-result",
            Self::LargePayload(_) => "large-payload",
        }
    }

    /// Structural checks serde cannot express. Job ids become path components on
    /// both sides, and side-channel paths must stay inside the IPC directory.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_job_id(self.job_id()) {
            return Err(format!("invalid jobId {:?}", self.job_id()));
        }
        if let Self::LargePayload(wrapper) = self {
            let name = &wrapper.file_path;
            let marker = format!(".{}.", wrapper.job_id);
            if name.contains('/') || name.contains('\\') || name.starts_with('.') {
                return Err(format!("filePath {:?} escapes the IPC directory", name));
            }
            if !name.ends_with(".json") || !name.contains(&marker) {
                return Err(format!("filePath {:?} does not belong to job {}", name, wrapper.job_id));
            }
        }
        Ok(())
    }
}

pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_kebab_type_and_camel_fields() {
        let msg = Message::JobTest(JobTest {
            job_id: "abc".into(),
            name: "adds".into(),
            status: TestStatus::Passed,
            event_timestamp: 1_700_000_000_000,
            message: "Test passed".into(),
            duration: 3,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "job-test",
                "jobId": "abc",
                "name": "adds",
                "status": "passed",
                "eventTimestamp": 1_700_000_000_000u64,
                "message": "Test passed",
                "duration": 3
            })
        );
    }

    #[test]
    fn exception_accepts_string_or_structured() {
        let plain: JobException =
            serde_json::from_value(json!({"jobId": "a", "exception": "boom"})).unwrap();
        assert_eq!(plain.exception, ExceptionPayload::Message("boom".into()));

        let structured: JobException = serde_json::from_value(json!({
            "jobId": "a",
            "kind": "exception",
            "exception": {"name": "Error", "message": "x", "stack": "Uncaught Error: x"}
        }))
        .unwrap();
        assert_eq!(structured.exception.message(), "x");

        let partial: JobException =
            serde_json::from_value(json!({"jobId": "a", "exception": {"message": "only"}})).unwrap();
        assert_eq!(
            partial.exception,
            ExceptionPayload::Structured(StructuredException {
                name: String::new(),
                message: "only".into(),
                stack: String::new(),
            })
        );
    }

    #[test]
    fn status_transitions_are_monotone() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Timeout.can_transition_to(Completed));
    }

    #[test]
    fn wrapper_paths_are_confined_to_ipc_dir() {
        let wrapper = |path: &str| {
            Message::LargePayload(LargePayload {
                job_id: "job1".into(),
                original_message: OriginalMessage::JobResult,
                file_path: path.into(),
                timestamp: 1,
            })
        };
        assert!(wrapper("1.job1.output.json").validate().is_ok());
        assert!(wrapper("../1.job1.output.json").validate().is_err());
        assert!(wrapper("/etc/1.job1.output.json").validate().is_err());
        assert!(wrapper("1.job2.output.json").validate().is_err());
    }

    #[test]
    fn job_ids_are_path_safe() {
        assert!(is_valid_job_id("0f8fad5bd9cb469fa16570867728950e"));
        assert!(is_valid_job_id("abc-def_1"));
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("../etc"));
        assert!(!is_valid_job_id("a b"));
    }
}
