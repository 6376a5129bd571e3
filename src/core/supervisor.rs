//! Sandbox supervisor.
//!
//! Owns one host process at a time and every piece of job state. All state
//! lives on a single command-loop thread; callers, host reader threads and
//! side-channel loaders talk to it only through [`Command`]s, so there is one
//! writer and no shared tables.

use crate::config::types::{Result, SandboxConfig, SandboxError};
use crate::config::validator::validate_config;
use crate::core::launcher::{HostControl, HostLauncher, HostProcess, ProcessHostLauncher};
use crate::core::transform::{apply_or_original, IdentityTransform, SourceTransform};
use crate::core::wrapper::RuntimeScripts;
use crate::exec::events::{CodeExecutionEvent, EventKind, ExecutionOutcome, FunctionOutcome};
use crate::exec::stream::ExecutionStream;
use crate::ipc::side_channel::{Direction, PendingPayloads, SideChannel};
use crate::observability::audit;
use crate::observability::metrics::MetricsRegistry;
use crate::protocol::codec::{decode_frame, encode, FrameReader};
use crate::protocol::message::{
    JobStatus, JobStatusUpdate, Message, NewJob, OriginalMessage,
};
use crate::safety::cleanup::ArtifactCleaner;
use crate::utils::ids::{new_job_id, new_message_id};
use chrono::{DateTime, Utc};
use crossbeam_channel::{after, bounded, never, select, unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Terminal job rows kept for inspection after they leave the active set.
const FINISHED_JOB_HISTORY: usize = 256;

pub fn crash_message(code: Option<i32>) -> String {
    let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
    format!(
        "VM encountered a fatal error, out of memory or system resources exhausted. (exit code {})",
        code
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Starting,
    Ready,
    Crashed,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub code: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of supervisor state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub host_state: HostState,
    pub generation: u64,
    pub host_pid: Option<u32>,
    pub jobs: Vec<JobRecord>,
    pub active_jobs: usize,
    pub pending_large_results: usize,
    pub listeners: usize,
    pub queued_jobs: usize,
}

struct Submission {
    record: JobRecord,
    job: NewJob,
    execution_id: String,
    listener: Sender<CodeExecutionEvent>,
}

enum Command {
    Submit(Box<Submission>),
    Frame { generation: u64, message: Message },
    HostExited { generation: u64, code: Option<i32> },
    LargeResultLoaded { job_id: String, result: std::result::Result<String, String> },
    Detach { job_id: String },
    TerminateHost { reply: Sender<bool> },
    Snapshot { reply: Sender<SupervisorSnapshot> },
    Shutdown { reply: Sender<()> },
}

/// Host state shared with callers blocked in [`Supervisor::wait_for_ready`].
struct StateCell {
    state: Mutex<HostState>,
    changed: Condvar,
}

impl StateCell {
    fn set(&self, next: HostState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            log::debug!("supervisor: host {:?} -> {:?}", *state, next);
            *state = next;
            self.changed.notify_all();
        }
    }

    fn get(&self) -> HostState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub struct Supervisor {
    config: Arc<SandboxConfig>,
    commands: Sender<Command>,
    state: Arc<StateCell>,
    side_channel: SideChannel,
    transform: Arc<dyn SourceTransform>,
    metrics: Arc<MetricsRegistry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Supervisor backed by the `codebox-host` binary. Fails if the execution
    /// runtime is missing.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let launcher = Arc::new(ProcessHostLauncher::new(&config));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: SandboxConfig, launcher: Arc<dyn HostLauncher>) -> Result<Self> {
        validate_config(&config)?;
        launcher.preflight()?;
        config.ensure_dirs()?;

        let config = Arc::new(config);
        let metrics = Arc::new(MetricsRegistry::new());
        let state = Arc::new(StateCell {
            state: Mutex::new(HostState::Starting),
            changed: Condvar::new(),
        });
        let (tx, rx) = unbounded();

        let mut event_loop = EventLoop {
            config: Arc::clone(&config),
            launcher,
            side_channel: SideChannel::from_config(&config),
            cleaner: ArtifactCleaner::new(&config),
            metrics: Arc::clone(&metrics),
            state: Arc::clone(&state),
            commands: tx.clone(),
            host: None,
            generation: 0,
            restart: None,
            jobs: HashMap::new(),
            started: HashMap::new(),
            finished: VecDeque::new(),
            active_jobs: HashSet::new(),
            pending_large_results: PendingPayloads::new(),
            loading: HashMap::new(),
            listeners: HashMap::new(),
            backlog: VecDeque::new(),
        };
        let worker = thread::Builder::new()
            .name("codebox-supervisor".to_string())
            .spawn(move || event_loop.run(rx))?;

        Ok(Self {
            side_channel: SideChannel::from_config(&config),
            config,
            commands: tx,
            state,
            transform: Arc::new(IdentityTransform),
            metrics,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Rewrite every job's source before dispatch.
    pub fn with_transform(mut self, transform: Arc<dyn SourceTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn host_state(&self) -> HostState {
        self.state.get()
    }

    /// Block until the host is ready to take jobs.
    pub fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = match self.state.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            match *state {
                HostState::Ready => return Ok(()),
                HostState::Stopped => return Err(SandboxError::ShutDown),
                _ => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SandboxError::Host(format!(
                    "host not ready after {:?} (state {:?})",
                    timeout, *state
                )));
            }
            state = match self.state.changed.wait_timeout(state, remaining) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Submit `code` and return its event stream. A non-empty `function_input`
    /// (JSON text of the argument array) runs the module's default export.
    pub fn execute_code(
        &self,
        code: &str,
        testing: bool,
        function_input: Option<&str>,
    ) -> Result<ExecutionStream> {
        let job_id = new_job_id();
        let execution_id = new_job_id();
        let function_input = function_input.filter(|input| !input.is_empty());
        let function_mode = function_input.is_some();
        let source = apply_or_original(self.transform.as_ref(), code);

        let job = NewJob {
            job_id: job_id.clone(),
            code: source,
            testing,
            function_input: function_input.map(str::to_string),
        };
        audit::job_submitted(
            &job_id,
            function_mode,
            function_input.is_some_and(|input| self.side_channel.should_divert(input)),
        );

        let (listener, events) = unbounded();
        let submission = Submission {
            record: JobRecord {
                id: job_id.clone(),
                code: code.to_string(),
                status: JobStatus::Pending,
                created_at: Utc::now(),
                completed_at: None,
                error: None,
            },
            job,
            execution_id: execution_id.clone(),
            listener,
        };
        self.commands
            .send(Command::Submit(Box::new(submission)))
            .map_err(|_| SandboxError::ShutDown)?;

        let start = CodeExecutionEvent {
            code_execution_id: execution_id,
            message_id: new_message_id(),
            kind: EventKind::Start,
        };
        let commands = self.commands.clone();
        let detach_id = job_id.clone();
        Ok(ExecutionStream::new(
            job_id,
            start,
            function_mode,
            events,
            Box::new(move || {
                let _ = commands.send(Command::Detach { job_id: detach_id });
            }),
        ))
    }

    pub fn execute_code_buffered(
        &self,
        code: &str,
        testing: bool,
        function_input: Option<&str>,
    ) -> Result<ExecutionOutcome> {
        let stream = self.execute_code(code, testing, function_input)?;
        Ok(ExecutionOutcome {
            events: stream.collect(),
        })
    }

    /// Run the default export with `input` and decode its JSON result.
    pub fn execute_function_buffered(&self, code: &str, input: &str) -> Result<FunctionOutcome> {
        let outcome = self.execute_code_buffered(code, false, Some(input))?;
        Ok(FunctionOutcome::from_outcome(outcome))
    }

    /// Kill the current host. Its jobs fail and a fresh host is started after
    /// the restart backoff. Returns false if no host was running.
    pub fn terminate_host(&self) -> Result<bool> {
        let (reply, response) = bounded(1);
        self.commands
            .send(Command::TerminateHost { reply })
            .map_err(|_| SandboxError::ShutDown)?;
        response.recv().map_err(|_| SandboxError::ShutDown)
    }

    pub fn snapshot(&self) -> Result<SupervisorSnapshot> {
        let (reply, response) = bounded(1);
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| SandboxError::ShutDown)?;
        response.recv().map_err(|_| SandboxError::ShutDown)
    }

    /// Stop the host without respawning and fail every outstanding job.
    pub fn shutdown(&self) -> Result<()> {
        let (reply, response) = bounded(1);
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = response.recv();
        }
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| SandboxError::Host("supervisor loop panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("supervisor shutdown: {}", e);
        }
    }
}

struct ActiveHost {
    generation: u64,
    stdin: Box<dyn Write + Send>,
    control: Arc<dyn HostControl>,
}

struct Listener {
    execution_id: String,
    events: Sender<CodeExecutionEvent>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct EventLoop {
    config: Arc<SandboxConfig>,
    launcher: Arc<dyn HostLauncher>,
    side_channel: SideChannel,
    cleaner: ArtifactCleaner,
    metrics: Arc<MetricsRegistry>,
    state: Arc<StateCell>,
    commands: Sender<Command>,

    host: Option<ActiveHost>,
    generation: u64,
    restart: Option<Receiver<Instant>>,

    jobs: HashMap<String, JobRecord>,
    started: HashMap<String, Instant>,
    finished: VecDeque<String>,
    active_jobs: HashSet<String>,
    pending_large_results: PendingPayloads,
    /// Jobs whose large result is being read, with frames that arrived meanwhile.
    loading: HashMap<String, VecDeque<Message>>,
    listeners: HashMap<String, Listener>,
    /// Jobs submitted while no host was ready.
    backlog: VecDeque<NewJob>,
}

impl EventLoop {
    fn run(&mut self, commands: Receiver<Command>) {
        self.start_host();
        loop {
            let restart = self.restart.clone().unwrap_or_else(never);
            let flow = select! {
                recv(commands) -> command => match command {
                    Ok(command) => self.handle(command),
                    Err(_) => Flow::Stop,
                },
                recv(restart) -> _ => {
                    self.restart = None;
                    self.start_host();
                    Flow::Continue
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }
        self.state.set(HostState::Stopped);
        log::debug!("supervisor: loop stopped");
    }

    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Submit(submission) => self.submit(*submission),
            Command::Frame { generation, message } => {
                if generation == self.generation {
                    self.metrics.frames_decoded.inc();
                    self.handle_message(message);
                } else {
                    log::debug!("supervisor: dropping frame from stale host {}", generation);
                }
            }
            Command::HostExited { generation, code } => self.host_exited(generation, code),
            Command::LargeResultLoaded { job_id, result } => self.large_result_loaded(job_id, result),
            Command::Detach { job_id } => {
                if self.listeners.remove(&job_id).is_some() {
                    log::debug!("supervisor: caller detached from job {}", job_id);
                }
            }
            Command::TerminateHost { reply } => {
                let running = match &self.host {
                    Some(host) => {
                        log::info!("supervisor: terminating host generation {}", host.generation);
                        host.control.kill();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(running);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn submit(&mut self, submission: Submission) {
        let Submission {
            record,
            job,
            execution_id,
            listener,
        } = submission;
        let job_id = record.id.clone();
        if self.jobs.contains_key(&job_id) {
            log::error!("supervisor: duplicate job id {}, rejecting", job_id);
            let _ = listener.send(CodeExecutionEvent {
                code_execution_id: execution_id,
                message_id: new_message_id(),
                kind: EventKind::Status {
                    status: JobStatus::Failed,
                    error: Some("duplicate job id".to_string()),
                },
            });
            return;
        }

        self.metrics.jobs_submitted.inc();
        self.metrics.active_jobs.inc();
        self.jobs.insert(job_id.clone(), record);
        self.started.insert(job_id.clone(), Instant::now());
        self.active_jobs.insert(job_id.clone());
        self.listeners.insert(
            job_id.clone(),
            Listener {
                execution_id,
                events: listener,
            },
        );

        if self.host.is_some() && self.state.get() == HostState::Ready {
            self.send_job(job);
        } else {
            log::debug!("supervisor: host not ready, queueing job {}", job_id);
            self.backlog.push_back(job);
        }
    }

    /// Write a job to the host, diverting an oversized input first. A failed
    /// write means the host is going away; its exit fails the job.
    fn send_job(&mut self, mut job: NewJob) {
        let mut frames = Vec::with_capacity(2);
        let diverted = job
            .function_input
            .as_deref()
            .filter(|input| self.side_channel.should_divert(input))
            .map(|input| (input.len(), self.side_channel.write(&job.job_id, Direction::Input, input)));
        match diverted {
            Some((bytes, Ok(wrapper))) => {
                self.metrics.side_channel_writes.inc();
                audit::payload_diverted(&job.job_id, "input", bytes);
                frames.push(Message::LargePayload(wrapper));
                job.function_input = None;
            }
            Some((_, Err(e))) => {
                // Inline delivery still works.
                self.metrics.side_channel_failures.inc();
                audit::payload_failure(&job.job_id, &e.to_string());
            }
            None => {}
        }
        let job_id = job.job_id.clone();
        frames.push(Message::NewJob(job));

        let Some(host) = self.host.as_mut() else {
            return;
        };
        for message in &frames {
            let result = encode(message).and_then(|frame| {
                host.stdin.write_all(frame.as_bytes())?;
                host.stdin.flush()?;
                Ok(())
            });
            if let Err(e) = result {
                log::warn!("supervisor: failed to send {} for job {}: {}", message.kind(), job_id, e);
                return;
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        let job_id = message.job_id().to_string();
        if let Some(deferred) = self.loading.get_mut(&job_id) {
            deferred.push_back(message);
            return;
        }

        match message {
            Message::LargePayload(wrapper) => match wrapper.original_message {
                OriginalMessage::JobResult => self.pending_large_results.record(&wrapper),
                OriginalMessage::NewJob => {
                    log::warn!("supervisor: host announced job input for {}, ignoring", job_id)
                }
            },
            Message::JobResult(result) => match self.pending_large_results.take(&job_id) {
                Some(entry) => self.load_large_result(job_id, entry.file_path),
                None => self.dispatch(&job_id, EventKind::Result { result: result.result }),
            },
            Message::JobStatus(update) => self.apply_status(update),
            Message::JobLog(log) => self.dispatch(&job_id, EventKind::Log { kind: log.kind, log: log.log }),
            Message::JobTest(test) => self.dispatch(
                &job_id,
                EventKind::Test {
                    name: test.name,
                    status: test.status,
                    event_timestamp: test.event_timestamp,
                    message: test.message,
                    duration: test.duration,
                },
            ),
            Message::JobException(exception) => self.dispatch(
                &job_id,
                EventKind::Exception {
                    exception: exception.exception,
                },
            ),
            Message::NewJob(_) => log::warn!("supervisor: host echoed a job request for {}", job_id),
        }
    }

    /// Read a diverted result off the loop thread. Frames for the job are held
    /// back until it lands so the result still precedes the terminal status.
    fn load_large_result(&mut self, job_id: String, file_path: String) {
        self.loading.insert(job_id.clone(), VecDeque::new());
        let side_channel = self.side_channel.clone();
        let commands = self.commands.clone();
        let spawned = thread::Builder::new()
            .name(format!("large-result-{}", job_id))
            .spawn({
                let job_id = job_id.clone();
                move || {
                    let result = side_channel.read(&file_path).map_err(|e| e.to_string());
                    let _ = commands.send(Command::LargeResultLoaded { job_id, result });
                }
            });
        if let Err(e) = spawned {
            self.large_result_loaded(job_id, Err(format!("cannot start reader: {}", e)));
        }
    }

    fn large_result_loaded(&mut self, job_id: String, result: std::result::Result<String, String>) {
        let result = match result {
            Ok(result) => {
                self.metrics.side_channel_reads.inc();
                result
            }
            Err(e) => {
                self.metrics.side_channel_failures.inc();
                audit::payload_failure(&job_id, &e);
                String::new()
            }
        };
        let mut deferred = self.loading.remove(&job_id).unwrap_or_default();
        self.dispatch(&job_id, EventKind::Result { result });

        while let Some(message) = deferred.pop_front() {
            self.handle_message(message);
            if let Some(held) = self.loading.get_mut(&job_id) {
                held.extend(deferred.drain(..));
                break;
            }
        }
    }

    fn apply_status(&mut self, update: JobStatusUpdate) {
        let Some(record) = self.jobs.get_mut(&update.job_id) else {
            log::debug!("supervisor: status for unknown job {}", update.job_id);
            return;
        };
        if !record.status.can_transition_to(update.status) {
            log::debug!(
                "supervisor: ignoring {} -> {} for job {}",
                record.status,
                update.status,
                update.job_id
            );
            return;
        }
        record.status = update.status;
        record.error = update.error.clone();
        if update.status.is_terminal() {
            record.completed_at = update
                .completed_at
                .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
                .or_else(|| Some(Utc::now()));
        }

        let status = update.status;
        let event = EventKind::Status {
            status,
            error: update.error,
        };
        if status.is_terminal() {
            self.finish_job(&update.job_id, status, event);
        } else {
            self.dispatch(&update.job_id, event);
        }
    }

    fn dispatch(&mut self, job_id: &str, kind: EventKind) {
        let Some(listener) = self.listeners.get(job_id) else {
            return;
        };
        let event = CodeExecutionEvent {
            code_execution_id: listener.execution_id.clone(),
            message_id: new_message_id(),
            kind,
        };
        if listener.events.send(event).is_err() {
            self.listeners.remove(job_id);
        }
    }

    /// Leave the active set, clean up artifacts, deliver the terminal event and
    /// close the caller's queue.
    fn finish_job(&mut self, job_id: &str, status: JobStatus, event: EventKind) {
        if !self.active_jobs.remove(job_id) {
            return;
        }
        let elapsed = self
            .started
            .remove(job_id)
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.metrics.record_terminal(status, elapsed);
        if self.pending_large_results.take(job_id).is_some() {
            log::warn!("supervisor: job {} ended with an unconsumed large result", job_id);
        }
        self.cleaner.cleanup_job(job_id);

        self.dispatch(job_id, event);
        self.listeners.remove(job_id);

        self.finished.push_back(job_id.to_string());
        while self.finished.len() > FINISHED_JOB_HISTORY {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }

    /// Fail a job without any frame from the host.
    fn fail_job(&mut self, job_id: &str, error: &str) {
        self.apply_status(JobStatusUpdate {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            error: Some(error.to_string()),
            completed_at: None,
        });
    }

    fn fail_active_jobs(&mut self, error: &str) -> usize {
        self.backlog.clear();
        let mut active: Vec<String> = self.active_jobs.iter().cloned().collect();
        active.sort_by_key(|id| self.started.get(id).copied());
        for job_id in &active {
            self.loading.remove(job_id);
            self.fail_job(job_id, error);
        }
        active.len()
    }

    fn start_host(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.state.set(HostState::Starting);

        let launched = RuntimeScripts::install(&self.config.scripts_dir()).and_then(|()| {
            let purged = self.cleaner.purge_orphans();
            if !purged.is_empty() {
                log::info!(
                    "supervisor: purged {} stale job dir(s) and {} side-channel file(s)",
                    purged.job_dirs,
                    purged.ipc_files
                );
            }
            self.launcher.launch(&self.config)
        });

        match launched {
            Ok(process) => {
                let pid = process.control.pid();
                self.attach(generation, process);
                self.metrics.host_spawns.inc();
                audit::host_spawned(pid, generation);
                self.state.set(HostState::Ready);

                let backlog: Vec<NewJob> = self.backlog.drain(..).collect();
                for job in backlog {
                    self.send_job(job);
                }
            }
            Err(e) => {
                log::error!("supervisor: failed to start host: {}", e);
                self.state.set(HostState::Crashed);
                let failed = self.fail_active_jobs(&format!("failed to start execution host: {}", e));
                if failed > 0 {
                    log::warn!("supervisor: failed {} job(s) waiting for the host", failed);
                }
                self.schedule_restart();
            }
        }
    }

    fn attach(&mut self, generation: u64, process: HostProcess) {
        let HostProcess {
            stdin,
            stdout,
            stderr,
            control,
        } = process;

        if let Some(stderr) = stderr {
            spawn_named(format!("host-stderr-{}", generation), move || {
                for line in FrameReader::new(stderr) {
                    log::debug!("[host] {}", line);
                }
            });
        }

        let commands = self.commands.clone();
        let metrics = Arc::clone(&self.metrics);
        let reader_control = Arc::clone(&control);
        spawn_named(format!("host-stdout-{}", generation), move || {
            read_host_output(stdout, generation, &commands, &metrics);
            let code = reader_control.wait();
            let _ = commands.send(Command::HostExited { generation, code });
        });

        self.host = Some(ActiveHost {
            generation,
            stdin,
            control,
        });
    }

    fn host_exited(&mut self, generation: u64, code: Option<i32>) {
        if generation != self.generation {
            return;
        }
        // Units share the host's process group and would otherwise outlive it
        // with no timeout watching them.
        if let Some(host) = self.host.take() {
            host.control.kill();
        }
        self.metrics.host_crashes.inc();
        self.state.set(HostState::Crashed);

        let affected = self.fail_active_jobs(&crash_message(code));
        audit::host_crashed(code, affected);
        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        self.state.set(HostState::Restarting);
        log::info!(
            "supervisor: restarting host in {:?}",
            self.config.restart_backoff
        );
        self.restart = Some(after(self.config.restart_backoff));
    }

    fn shutdown(&mut self) {
        self.restart = None;
        let failed = self.fail_active_jobs("sandbox supervisor shut down");
        if let Some(host) = self.host.take() {
            host.control.kill();
        }
        // Invalidate frames still in flight from the old host.
        self.generation += 1;
        audit::host_shutdown(None);
        log::info!("supervisor: shut down ({} job(s) failed)", failed);
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        let mut jobs: Vec<JobRecord> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        SupervisorSnapshot {
            host_state: self.state.get(),
            generation: self.generation,
            host_pid: self.host.as_ref().and_then(|host| host.control.pid()),
            jobs,
            active_jobs: self.active_jobs.len(),
            pending_large_results: self.pending_large_results.len(),
            listeners: self.listeners.len(),
            queued_jobs: self.backlog.len(),
        }
    }
}

fn read_host_output(
    stdout: Box<dyn Read + Send>,
    generation: u64,
    commands: &Sender<Command>,
    metrics: &MetricsRegistry,
) {
    for line in FrameReader::new(stdout) {
        match decode_frame(&line) {
            Ok(Some(message)) => {
                if commands.send(Command::Frame { generation, message }).is_err() {
                    return;
                }
            }
            Ok(None) => {
                if !line.trim().is_empty() {
                    log::debug!("[host] {}", line);
                }
            }
            Err(e) => {
                metrics.frames_dropped.inc();
                audit::frame_dropped(&e.to_string());
            }
        }
    }
}

fn spawn_named<F>(name: String, body: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = thread::Builder::new().name(name.clone()).spawn(body) {
        log::error!("supervisor: cannot start {} thread: {}", name, e);
    }
}
