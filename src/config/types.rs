use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Single authoritative side-channel threshold shared by both ends of the wire.
pub const DEFAULT_LARGE_PAYLOAD_THRESHOLD: usize = 8 * 1024;
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(1500);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
pub const DEFAULT_RUNTIME_COMMAND: &str = "deno";
pub const HOST_BINARY_NAME: &str = "codebox-host";

pub const ENV_ROOT: &str = "CODEBOX_ROOT";
pub const ENV_RUNTIME: &str = "CODEBOX_RUNTIME";
pub const ENV_HOST_BIN: &str = "CODEBOX_HOST_BIN";
pub const ENV_THRESHOLD: &str = "CODEBOX_THRESHOLD";
pub const ENV_JOB_TIMEOUT_MS: &str = "CODEBOX_JOB_TIMEOUT_MS";
pub const ENV_RESTART_BACKOFF_MS: &str = "CODEBOX_RESTART_BACKOFF_MS";
pub const ENV_MODE: &str = "CODEBOX_MODE";
pub const ENV_CLEANUP: &str = "CODEBOX_CLEANUP";
pub const ENV_MEMORY_MB: &str = "CODEBOX_MEMORY_MB";
/// JSON object of variables injected into every unit.
pub const ENV_UNIT_ENV: &str = "CODEBOX_UNIT_ENV";

/// Deployment mode. Development keeps job artifacts on disk for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    Development,
    #[default]
    Production,
    Test,
}

impl RuntimeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

impl FromStr for RuntimeMode {
    type Err = SandboxError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" | "testing" => Ok(Self::Test),
            other => Err(SandboxError::Config(format!("unknown runtime mode '{}'", other))),
        }
    }
}

/// Effective configuration for a supervisor and the host process it spawns.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub root_dir: PathBuf,
    pub runtime_command: String,
    pub host_command: PathBuf,
    pub large_payload_threshold: usize,
    pub job_timeout: Duration,
    pub restart_backoff: Duration,
    pub ready_timeout: Duration,
    pub mode: RuntimeMode,
    pub cleanup: bool,
    pub memory_limit_mb: u64,
    /// Injected into every unit as the frozen environment object.
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let root_dir = std::env::current_dir()
            .unwrap_or_else(|_| std::env::temp_dir())
            .join("tmp")
            .join("sandbox");
        Self::with_root(root_dir)
    }
}

impl SandboxConfig {
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        let mode = RuntimeMode::default();
        Self {
            root_dir: root_dir.into(),
            runtime_command: DEFAULT_RUNTIME_COMMAND.to_string(),
            host_command: default_host_command(),
            large_payload_threshold: DEFAULT_LARGE_PAYLOAD_THRESHOLD,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            mode,
            cleanup: mode != RuntimeMode::Development,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            env: BTreeMap::new(),
        }
    }

    /// Overlay `CODEBOX_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an arbitrary lookup. Cleanup follows the mode unless
    /// `CODEBOX_CLEANUP` is set explicitly.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_ROOT) {
            self.root_dir = PathBuf::from(root);
        }
        if let Some(runtime) = lookup(ENV_RUNTIME) {
            self.runtime_command = runtime;
        }
        if let Some(host) = lookup(ENV_HOST_BIN) {
            self.host_command = PathBuf::from(host);
        }
        if let Some(threshold) = lookup(ENV_THRESHOLD) {
            self.large_payload_threshold = parse_number(ENV_THRESHOLD, &threshold)? as usize;
        }
        if let Some(ms) = lookup(ENV_JOB_TIMEOUT_MS) {
            self.job_timeout = Duration::from_millis(parse_number(ENV_JOB_TIMEOUT_MS, &ms)?);
        }
        if let Some(ms) = lookup(ENV_RESTART_BACKOFF_MS) {
            self.restart_backoff =
                Duration::from_millis(parse_number(ENV_RESTART_BACKOFF_MS, &ms)?);
        }
        if let Some(mb) = lookup(ENV_MEMORY_MB) {
            self.memory_limit_mb = parse_number(ENV_MEMORY_MB, &mb)?;
        }
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = mode.parse()?;
            self.cleanup = self.mode != RuntimeMode::Development;
        }
        if let Some(cleanup) = lookup(ENV_CLEANUP) {
            self.cleanup = parse_bool(ENV_CLEANUP, &cleanup)?;
        }
        if let Some(json) = lookup(ENV_UNIT_ENV) {
            self.env = serde_json::from_str(&json).map_err(|e| {
                SandboxError::Config(format!("{} must be a JSON object of strings: {}", ENV_UNIT_ENV, e))
            })?;
        }
        Ok(())
    }

    /// Environment variables that reproduce this configuration in a host process.
    pub fn to_env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_ROOT, self.root_dir.display().to_string()),
            (ENV_RUNTIME, self.runtime_command.clone()),
            (ENV_THRESHOLD, self.large_payload_threshold.to_string()),
            (ENV_JOB_TIMEOUT_MS, self.job_timeout.as_millis().to_string()),
            (ENV_MODE, self.mode.as_str().to_string()),
            (ENV_CLEANUP, self.cleanup.to_string()),
            (ENV_MEMORY_MB, self.memory_limit_mb.to_string()),
        ];
        if !self.env.is_empty() {
            if let Ok(json) = serde_json::to_string(&self.env) {
                vars.push((ENV_UNIT_ENV, json));
            }
        }
        vars
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.root_dir.join("vm")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.root_dir.join("ipc")
    }

    pub fn deno_dir(&self) -> PathBuf {
        self.root_dir.join("deno_dir")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root_dir.join("scripts")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.vm_dir().join(job_id)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.vm_dir(), self.ipc_dir(), self.deno_dir(), self.scripts_dir()] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        SandboxError::Workspace(format!("failed to create {}: {}", dir.display(), e))
    })
}

fn default_host_command() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(HOST_BINARY_NAME)))
        .unwrap_or_else(|| PathBuf::from(HOST_BINARY_NAME))
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| SandboxError::Config(format!("{} must be a non-negative integer: {}", key, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SandboxError::Config(format!("{} must be a boolean, got '{}'", key, other))),
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime preflight failed: {0}")]
    Runtime(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Side-channel error: {0}")]
    SideChannel(String),

    #[error("Host process error: {0}")]
    Host(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Supervisor has shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SandboxError>;
