//! Host process launching.
//!
//! The supervisor never spawns the host directly; it asks a [`HostLauncher`]
//! for a [`HostProcess`]: the three stdio streams plus a control handle. The
//! production launcher starts the `codebox-host` binary in its own process
//! group so a kill takes every unit down with it.

use crate::config::types::{Result, SandboxConfig, SandboxError};
use crate::core::deno::{exit_code, resolve_binary, DenoRuntime};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

/// Lifecycle handle for a running host.
pub trait HostControl: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// Force-stop the host and everything it started. Idempotent, and still
    /// effective after the host itself has exited.
    fn kill(&self);
    /// Block until the host is gone and return its exit code.
    fn wait(&self) -> Option<i32>;
}

pub struct HostProcess {
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Option<Box<dyn Read + Send>>,
    pub control: Arc<dyn HostControl>,
}

pub trait HostLauncher: Send + Sync {
    /// Environment checks that must pass before any host is started.
    fn preflight(&self) -> Result<()>;
    fn launch(&self, config: &SandboxConfig) -> Result<HostProcess>;
}

/// Starts `config.host_command` as a child process.
#[derive(Debug, Default)]
pub struct ProcessHostLauncher {
    runtime_command: Option<String>,
}

impl ProcessHostLauncher {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            runtime_command: Some(config.runtime_command.clone()),
        }
    }
}

impl HostLauncher for ProcessHostLauncher {
    fn preflight(&self) -> Result<()> {
        if let Some(command) = &self.runtime_command {
            DenoRuntime::locate(command)?;
        }
        Ok(())
    }

    fn launch(&self, config: &SandboxConfig) -> Result<HostProcess> {
        let host: PathBuf = resolve_binary(&config.host_command.to_string_lossy()).ok_or_else(|| {
            SandboxError::Host(format!(
                "host binary {} not found",
                config.host_command.display()
            ))
        })?;

        let mut child = Command::new(&host)
            .envs(config.to_env_vars())
            .current_dir(&config.root_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| SandboxError::Host(format!("failed to start {}: {}", host.display(), e)))?;

        let pipe_error = |name: &str| SandboxError::Host(format!("host {} was not captured", name));
        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();
        log::debug!("launched host {} as pid {}", host.display(), pid);

        Ok(HostProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn Read + Send>),
            control: Arc::new(ChildControl {
                pid,
                child: Mutex::new(child),
            }),
        })
    }
}

struct ChildControl {
    pid: u32,
    child: Mutex<Child>,
}

impl HostControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&self) {
        // The group id stays reserved while any unit in it is alive, so this
        // reaches units that outlived a reaped host.
        match killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => log::warn!("failed to kill host group {}: {}", self.pid, e),
        }
    }

    fn wait(&self) -> Option<i32> {
        let mut child = match self.child.lock() {
            Ok(child) => child,
            Err(poisoned) => poisoned.into_inner(),
        };
        match child.wait() {
            Ok(status) => exit_code(&status),
            Err(e) => {
                log::warn!("wait on host {} failed: {}", self.pid, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{process_running, write_script};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn missing_host_binary_is_a_host_error() {
        let dir = TempDir::new().unwrap();
        let mut config = SandboxConfig::with_root(dir.path());
        config.host_command = dir.path().join("no-such-host");
        let err = ProcessHostLauncher::default().launch(&config).err().unwrap();
        assert!(matches!(err, SandboxError::Host(_)));
    }

    #[test]
    fn exit_status_is_reported_after_kill() {
        let dir = TempDir::new().unwrap();
        let mut config = SandboxConfig::with_root(dir.path());
        config.host_command = PathBuf::from("/bin/cat");
        let process = ProcessHostLauncher::default().launch(&config).unwrap();
        process.control.kill();
        assert_eq!(process.control.wait(), Some(128 + 9));
        // Killing a gone group is not an error.
        process.control.kill();
    }

    #[test]
    fn kill_after_host_exit_reaches_stray_units() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("unit.pid");
        let script = dir.path().join("host.sh");
        write_script(
            &script,
            &format!(
                "sleep 300 </dev/null >/dev/null 2>&1 &\necho $! > {}\nexit 3",
                pid_file.display()
            ),
        )
        .unwrap();
        let mut config = SandboxConfig::with_root(dir.path());
        config.host_command = script;

        let process = ProcessHostLauncher::default().launch(&config).unwrap();
        assert_eq!(process.control.wait(), Some(3));
        let unit: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(process_running(unit));

        process.control.kill();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_running(unit) {
            assert!(Instant::now() < deadline, "unit {} survived the group kill", unit);
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
