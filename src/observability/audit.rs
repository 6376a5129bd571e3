//! Structured audit events for the sandbox lifecycle.
//!
//! Events are serialized to JSON and emitted through `log` under the
//! `codebox::audit` target, so any logger configuration captures them.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const AUDIT_TARGET: &str = "codebox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxEventType {
    // Job lifecycle
    JobSubmitted,
    UnitStarted,
    JobTerminal,
    JobSetupFailed,

    // Host lifecycle
    HostSpawned,
    HostCrashed,
    HostShutdown,

    // Side-channel
    PayloadDiverted,
    PayloadFailure,

    // Protocol
    FrameDropped,
}

impl SandboxEventType {
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::JobSubmitted | Self::UnitStarted | Self::JobTerminal => Severity::Low,
            Self::HostSpawned | Self::HostShutdown | Self::PayloadDiverted => Severity::Low,
            Self::JobSetupFailed | Self::FrameDropped => Severity::Medium,
            Self::PayloadFailure => Severity::High,
            Self::HostCrashed => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub event_type: SandboxEventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_fingerprint: Option<String>,
}

impl SandboxEvent {
    pub fn new(event_type: SandboxEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            job_id: None,
            pid: None,
            exit_code: None,
            manifest_fingerprint: None,
        }
    }

    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_manifest_fingerprint(mut self, fingerprint: String) -> Self {
        self.manifest_fingerprint = Some(fingerprint);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

pub fn log_event(event: SandboxEvent) {
    let level = match event.severity {
        Severity::Critical | Severity::High => log::Level::Warn,
        Severity::Medium => log::Level::Info,
        Severity::Low => log::Level::Debug,
    };
    match serde_json::to_string(&event) {
        Ok(json) => log::log!(target: AUDIT_TARGET, level, "{}", json),
        Err(e) => log::warn!(target: AUDIT_TARGET, "unserializable audit event {:?}: {}", event.event_type, e),
    }
}

pub fn job_submitted(job_id: &str, function_mode: bool, diverted_input: bool) {
    log_event(
        SandboxEvent::new(
            SandboxEventType::JobSubmitted,
            format!(
                "job submitted: function_mode={}, side_channel_input={}",
                function_mode, diverted_input
            ),
        )
        .with_job_id(job_id),
    );
}

pub fn unit_started(job_id: &str, pid: u32, fingerprint: String) {
    log_event(
        SandboxEvent::new(SandboxEventType::UnitStarted, "execution unit started")
            .with_job_id(job_id)
            .with_pid(pid)
            .with_manifest_fingerprint(fingerprint),
    );
}

pub fn job_terminal(job_id: &str, status: &str, error: Option<&str>) {
    let details = match error {
        Some(error) => format!("job {}: {}", status, error),
        None => format!("job {}", status),
    };
    log_event(SandboxEvent::new(SandboxEventType::JobTerminal, details).with_job_id(job_id));
}

pub fn job_setup_failed(job_id: &str, error: &str) {
    log_event(
        SandboxEvent::new(SandboxEventType::JobSetupFailed, format!("job setup failed: {}", error))
            .with_job_id(job_id),
    );
}

pub fn host_spawned(pid: Option<u32>, generation: u64) {
    let mut event = SandboxEvent::new(
        SandboxEventType::HostSpawned,
        format!("host process spawned (generation {})", generation),
    );
    event.pid = pid;
    log_event(event);
}

pub fn host_crashed(exit_code: Option<i32>, affected_jobs: usize) {
    log_event(
        SandboxEvent::new(
            SandboxEventType::HostCrashed,
            format!("host process exited, failing {} active job(s)", affected_jobs),
        )
        .with_exit_code(exit_code),
    );
}

pub fn host_shutdown(exit_code: Option<i32>) {
    log_event(
        SandboxEvent::new(SandboxEventType::HostShutdown, "host process stopped on shutdown")
            .with_exit_code(exit_code),
    );
}

pub fn payload_diverted(job_id: &str, direction: &str, bytes: usize) {
    log_event(
        SandboxEvent::new(
            SandboxEventType::PayloadDiverted,
            format!("{} payload of {} bytes moved to side-channel", direction, bytes),
        )
        .with_job_id(job_id),
    );
}

pub fn payload_failure(job_id: &str, error: &str) {
    log_event(
        SandboxEvent::new(SandboxEventType::PayloadFailure, format!("side-channel failure: {}", error))
            .with_job_id(job_id),
    );
}

pub fn frame_dropped(reason: &str) {
    log_event(SandboxEvent::new(
        SandboxEventType::FrameDropped,
        format!("malformed frame dropped: {}", reason),
    ));
}
