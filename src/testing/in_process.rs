//! Host launcher that runs an [`ExecutionHost`] on a thread.
//!
//! The supervisor talks to it over Unix socket pairs exactly as it would over a
//! child's pipes. Killing the host shuts the sockets down, which the host
//! treats like losing its input: every live unit is terminated.

use crate::config::types::{Result, SandboxConfig};
use crate::core::host::ExecutionHost;
use crate::core::launcher::{HostControl, HostLauncher, HostProcess};
use crate::core::unit::UnitProvider;
use crate::observability::metrics::MetricsRegistry;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Exit code reported for a killed in-process host, matching SIGKILL.
pub const KILLED_HOST_EXIT_CODE: i32 = 137;

pub struct InProcessHostLauncher {
    provider: Arc<dyn UnitProvider>,
    metrics: Arc<MetricsRegistry>,
    launches: AtomicUsize,
}

impl InProcessHostLauncher {
    pub fn new(provider: Arc<dyn UnitProvider>) -> Self {
        Self {
            provider,
            metrics: Arc::new(MetricsRegistry::new()),
            launches: AtomicUsize::new(0),
        }
    }

    /// Host-side metrics, shared by every host this launcher started.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl HostLauncher for InProcessHostLauncher {
    fn preflight(&self) -> Result<()> {
        self.provider.preflight()
    }

    fn launch(&self, config: &SandboxConfig) -> Result<HostProcess> {
        let (supervisor_in, host_in) = UnixStream::pair()?;
        let (host_out, supervisor_out) = UnixStream::pair()?;
        let sockets = vec![host_in.try_clone()?, host_out.try_clone()?];

        let host = Arc::new(ExecutionHost::new(
            config.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.metrics),
        ));
        let generation = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = thread::Builder::new()
            .name(format!("in-process-host-{}", generation))
            .spawn(move || {
                if let Err(e) = host.run(host_in, host_out) {
                    log::error!("in-process host stopped with error: {}", e);
                }
            })?;

        Ok(HostProcess {
            stdin: Box::new(supervisor_in),
            stdout: Box::new(supervisor_out),
            stderr: None,
            control: Arc::new(ThreadControl {
                sockets,
                handle: Mutex::new(Some(handle)),
                killed: AtomicBool::new(false),
                exit: Mutex::new(None),
            }),
        })
    }
}

struct ThreadControl {
    sockets: Vec<UnixStream>,
    handle: Mutex<Option<JoinHandle<()>>>,
    killed: AtomicBool,
    exit: Mutex<Option<Option<i32>>>,
}

impl HostControl for ThreadControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        for socket in &self.sockets {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn wait(&self) -> Option<i32> {
        let mut exit = match self.exit.lock() {
            Ok(exit) => exit,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(code) = *exit {
            return code;
        }
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let panicked = handle.map(|h| h.join().is_err()).unwrap_or(false);
        let code = if self.killed.load(Ordering::SeqCst) {
            Some(KILLED_HOST_EXIT_CODE)
        } else if panicked {
            Some(101)
        } else {
            Some(0)
        };
        *exit = Some(code);
        code
    }
}
