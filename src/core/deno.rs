//! Process-backed unit provider for the Deno runtime.
//!
//! Each unit is one `deno run` child with the manifest rendered to permission
//! flags, a sanitized environment, and piped stdio. Stdout carries structured
//! unit events; stderr is forwarded as error logs.

use crate::config::types::{Result, SandboxError};
use crate::core::unit::{parse_stderr_line, parse_stdout_line, UnitEvent, UnitHandle, UnitProvider, UnitSpec};
use crate::protocol::codec::FrameReader;
use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone)]
pub struct DenoRuntime {
    command: PathBuf,
    version: String,
}

impl DenoRuntime {
    /// Resolve the runtime on PATH and confirm it runs. Failure is fatal for
    /// the caller: there is no way to execute jobs without it.
    pub fn locate(command: &str) -> Result<Self> {
        let resolved = resolve_binary(command).ok_or_else(|| {
            SandboxError::Runtime(format!(
                "'{}' is not installed or not on PATH; install Deno to run sandboxed code",
                command
            ))
        })?;

        let output = Command::new(&resolved)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                SandboxError::Runtime(format!("failed to run {} --version: {}", resolved.display(), e))
            })?;
        if !output.status.success() {
            return Err(SandboxError::Runtime(format!(
                "{} --version exited with {}",
                resolved.display(),
                output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        log::info!("runtime preflight: {} ({})", resolved.display(), version);
        Ok(Self {
            command: resolved,
            version,
        })
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn build_command(&self, spec: &UnitSpec) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("run")
            .arg("--quiet")
            .arg("--no-config")
            .args(spec.manifest.to_runtime_flags())
            .arg(&spec.entry)
            .current_dir(&spec.job_dir)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Fires when the spawning job thread exits, which happens only once the
        // job is terminal, or when the whole host dies.
        unsafe {
            cmd.pre_exec(|| prctl::set_pdeathsig(Signal::SIGKILL).map_err(io::Error::from));
        }
        cmd
    }
}

/// Search PATH for `command` unless it already contains a path separator.
pub fn resolve_binary(command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Exit code, with signal deaths reported shell-style as 128 + signal.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

impl UnitProvider for DenoRuntime {
    fn name(&self) -> &str {
        "deno"
    }

    fn preflight(&self) -> Result<()> {
        if is_executable(&self.command) {
            Ok(())
        } else {
            Err(SandboxError::Runtime(format!(
                "{} is no longer executable",
                self.command.display()
            )))
        }
    }

    fn spawn(&self, spec: &UnitSpec) -> Result<Box<dyn UnitHandle>> {
        spec.manifest.validate()?;
        let mut child = self.build_command(spec).spawn().map_err(|e| {
            SandboxError::Host(format!("failed to start unit for job {}: {}", spec.job_id, e))
        })?;
        let pid = child.id();
        let (tx, rx) = unbounded();

        let stdout = child.stdout.take().map(|s| forward_lines(s, tx.clone(), parse_stdout_line));
        let stderr = child.stderr.take().map(|s| forward_lines(s, tx.clone(), parse_stderr_line));
        let process = Arc::new(UnitProcess::new(pid));
        let waiter = Arc::clone(&process);
        let job_id = spec.job_id.clone();

        thread::Builder::new()
            .name(format!("unit-wait-{}", pid))
            .spawn(move || {
                // Drain both pipes before reporting exit so no event trails Exited.
                for reader in [stdout, stderr].into_iter().flatten() {
                    let _ = reader.join();
                }
                let code = waiter.reap(&mut child, &job_id);
                let _ = tx.send(UnitEvent::Exited { code });
            })
            .map_err(|e| SandboxError::Host(format!("failed to start unit waiter: {}", e)))?;

        log::debug!("unit {} started for job {}", pid, spec.job_id);
        Ok(Box::new(DenoUnit { process, events: rx }))
    }
}

fn forward_lines<R, F>(stream: R, tx: Sender<UnitEvent>, parse: F) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(&str) -> UnitEvent + Send + 'static,
{
    thread::spawn(move || {
        for line in FrameReader::new(stream) {
            if tx.send(parse(&line)).is_err() {
                break;
            }
        }
    })
}

/// Pid of a unit plus whether it has been reaped. Signals and the reap are
/// serialized on `reaped`, so a signal never reaches a recycled pid.
struct UnitProcess {
    pid: u32,
    reaped: Mutex<bool>,
}

impl UnitProcess {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            reaped: Mutex::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.reaped.lock() {
            Ok(reaped) => reaped,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn is_reaped(&self) -> bool {
        *self.lock()
    }

    fn kill(&self) {
        let reaped = self.lock();
        if *reaped {
            return;
        }
        match kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("failed to kill unit {}: {}", self.pid, e),
        }
    }

    /// Wait for the unit to exit, then reap it under the lock. The zombie keeps
    /// the pid reserved until then.
    fn reap(&self, child: &mut Child, job_id: &str) -> Option<i32> {
        let pid = Pid::from_raw(self.pid as i32);
        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("waitid on unit {} for job {} failed: {}", self.pid, job_id, e);
                    break;
                }
            }
        }

        let mut reaped = self.lock();
        let code = match child.wait() {
            Ok(status) => exit_code(&status),
            Err(e) => {
                log::warn!("wait on unit {} for job {} failed: {}", self.pid, job_id, e);
                None
            }
        };
        *reaped = true;
        code
    }
}

struct DenoUnit {
    process: Arc<UnitProcess>,
    events: Receiver<UnitEvent>,
}

impl UnitHandle for DenoUnit {
    fn id(&self) -> u32 {
        self.process.pid
    }

    fn events(&self) -> Receiver<UnitEvent> {
        self.events.clone()
    }

    fn terminate(&self) {
        self.process.kill();
    }
}

impl Drop for DenoUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}
