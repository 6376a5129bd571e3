// Startup validation: fail fast with actionable errors before any host is spawned.

use crate::config::types::{Result, RuntimeMode, SandboxConfig, SandboxError};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate config at startup. Errors are fatal, warnings are logged.
pub fn validate_config(config: &SandboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);
    validate_policy(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.large_payload_threshold == 0 {
        result.add_error("large_payload_threshold cannot be zero".to_string());
    } else if config.large_payload_threshold < 256 {
        result.add_warning(format!(
            "large_payload_threshold {} is very low, most results will use the side-channel",
            config.large_payload_threshold
        ));
    }

    if config.job_timeout.is_zero() {
        result.add_error("job_timeout cannot be zero".to_string());
    }

    if config.memory_limit_mb == 0 {
        result.add_error("memory_limit_mb cannot be zero".to_string());
    } else if config.memory_limit_mb < 64 {
        result.add_warning(format!(
            "memory_limit_mb {} is very low (< 64MB), units may fail to start",
            config.memory_limit_mb
        ));
    }

    if config.restart_backoff.is_zero() {
        result.add_warning("restart_backoff is zero, a crash-looping host will respawn immediately".to_string());
    }
}

fn validate_paths(config: &SandboxConfig, result: &mut ValidationResult) {
    if !config.root_dir.is_absolute() {
        result.add_error(format!(
            "root_dir must be absolute: {}",
            config.root_dir.display()
        ));
    }
    if config.runtime_command.trim().is_empty() {
        result.add_error("runtime_command cannot be empty".to_string());
    }
    if config.host_command.as_os_str().is_empty() {
        result.add_error("host_command cannot be empty".to_string());
    }
}

fn validate_policy(config: &SandboxConfig, result: &mut ValidationResult) {
    if !config.cleanup && config.mode != RuntimeMode::Development {
        result.add_warning(format!(
            "cleanup disabled in {} mode, job artifacts will accumulate under {}",
            config.mode.as_str(),
            config.root_dir.display()
        ));
    }

    for key in config.env.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            result.add_error(format!("invalid injected environment key '{}'", key));
        }
    }
}
