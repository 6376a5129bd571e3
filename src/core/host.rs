//! Execution host.
//!
//! Reads framed jobs from its input, runs one unit per job on its own thread,
//! and writes that unit's events back as frames. The output stream is shared by
//! every job thread; frames are written whole under a lock so they never
//! interleave.

use crate::config::types::{Result, SandboxConfig};
use crate::core::manifest::CapabilityManifest;
use crate::core::unit::{UnitEvent, UnitHandle, UnitProvider, UnitSpec};
use crate::core::wrapper::{write_job_modules, RuntimeScripts, WrapperRequest};
use crate::ipc::side_channel::{Direction, PendingPayloads, SideChannel};
use crate::observability::audit;
use crate::observability::metrics::MetricsRegistry;
use crate::protocol::codec::{decode, encode, FrameReader};
use crate::protocol::message::{
    JobException, JobLog, JobResult, JobStatus, JobStatusUpdate, JobTest, Message, NewJob,
    OriginalMessage,
};
use crate::safety::workspace::JobWorkspace;
use crate::utils::env_hygiene::{unit_environment, validate_environment_safety, EnvPolicy};
use crate::utils::ids::now_millis;
use crossbeam_channel::{after, select};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub const TIMEOUT_MESSAGE: &str = "VM reached max time of execution allowed, timed out.";

/// Units keyed by job id. A job is reserved on the read loop before its thread
/// starts and holds `None` until its unit is spawned.
#[derive(Default)]
struct LiveUnits {
    units: Mutex<HashMap<String, Option<Arc<dyn UnitHandle>>>>,
    stopping: AtomicBool,
}

impl LiveUnits {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<Arc<dyn UnitHandle>>>> {
        match self.units.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim `job_id`. False if a job with that id is already starting or running.
    fn reserve(&self, job_id: &str) -> bool {
        let mut units = self.lock();
        if units.contains_key(job_id) {
            return false;
        }
        units.insert(job_id.to_string(), None);
        true
    }

    /// Attach a spawned unit. A unit attached after `stop_all` is stopped at once.
    fn insert(&self, job_id: &str, unit: Arc<dyn UnitHandle>) {
        self.lock().insert(job_id.to_string(), Some(Arc::clone(&unit)));
        if self.stopping.load(Ordering::SeqCst) {
            unit.terminate();
        }
    }

    fn remove(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    fn stop_all(&self) -> usize {
        self.stopping.store(true, Ordering::SeqCst);
        let units: Vec<Arc<dyn UnitHandle>> = self.lock().values().flatten().cloned().collect();
        for unit in &units {
            unit.terminate();
        }
        units.len()
    }
}

/// Serialized writer for outbound frames.
struct Outbound {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl Outbound {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn send(&self, message: &Message) {
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("host: cannot encode {} frame: {}", message.kind(), e);
                return;
            }
        };
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.write_all(frame.as_bytes()).and_then(|_| writer.flush()) {
            log::warn!("host: failed to write {} frame: {}", message.kind(), e);
        }
    }
}

/// Outbound frames for one job. Guarantees at most one terminal status.
struct JobReporter {
    job_id: String,
    outbound: Arc<Outbound>,
    finished: bool,
}

impl JobReporter {
    fn new(job_id: String, outbound: Arc<Outbound>) -> Self {
        Self {
            job_id,
            outbound,
            finished: false,
        }
    }

    fn send(&self, message: Message) {
        if self.finished {
            log::debug!("host: dropping {} for finished job {}", message.kind(), self.job_id);
            return;
        }
        self.outbound.send(&message);
    }

    fn running(&self) {
        self.send(Message::JobStatus(JobStatusUpdate {
            job_id: self.job_id.clone(),
            status: JobStatus::Running,
            error: None,
            completed_at: None,
        }));
    }

    fn finish(&mut self, status: JobStatus, error: Option<String>) {
        if self.finished {
            return;
        }
        audit::job_terminal(&self.job_id, status.as_str(), error.as_deref());
        self.send(Message::JobStatus(JobStatusUpdate {
            job_id: self.job_id.clone(),
            status,
            error,
            completed_at: Some(now_millis()),
        }));
        self.finished = true;
    }
}

pub struct ExecutionHost {
    config: Arc<SandboxConfig>,
    provider: Arc<dyn UnitProvider>,
    side_channel: SideChannel,
    env_policy: EnvPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl ExecutionHost {
    pub fn new(config: SandboxConfig, provider: Arc<dyn UnitProvider>, metrics: Arc<MetricsRegistry>) -> Self {
        let side_channel = SideChannel::from_config(&config);
        Self {
            config: Arc::new(config),
            provider,
            side_channel,
            env_policy: EnvPolicy::default(),
            metrics,
        }
    }

    /// Serve jobs until `input` reaches end of stream, then stop every live unit.
    pub fn run<R, W>(self: &Arc<Self>, input: R, output: W) -> Result<()>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        self.config.ensure_dirs()?;
        let outbound = Arc::new(Outbound::new(Box::new(output)));
        let live = Arc::new(LiveUnits::default());
        let mut pending = PendingPayloads::new();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        log::info!(
            "host: ready (provider={}, threshold={}B, timeout={:?})",
            self.provider.name(),
            self.side_channel.threshold(),
            self.config.job_timeout
        );

        for line in FrameReader::new(input) {
            let Some(message) = decode(&line) else {
                continue;
            };
            match message {
                Message::LargePayload(wrapper) => match wrapper.original_message {
                    OriginalMessage::NewJob => pending.record(&wrapper),
                    OriginalMessage::JobResult => log::warn!(
                        "host: ignoring result payload announcement for job {}",
                        wrapper.job_id
                    ),
                },
                Message::NewJob(job) => {
                    let Some(job) = self.resolve_input(job, &mut pending, &outbound) else {
                        continue;
                    };
                    if !live.reserve(&job.job_id) {
                        log::warn!("host: job {} is already live, ignoring duplicate", job.job_id);
                        continue;
                    }
                    let host = Arc::clone(self);
                    let job_id = job.job_id.clone();
                    let job_outbound = Arc::clone(&outbound);
                    let job_live = Arc::clone(&live);
                    match thread::Builder::new()
                        .name(format!("job-{}", job_id))
                        .spawn(move || host.run_job(job, job_outbound, job_live))
                    {
                        Ok(handle) => workers.push(handle),
                        Err(e) => {
                            log::error!("host: cannot start job thread: {}", e);
                            let mut reporter = JobReporter::new(job_id.clone(), Arc::clone(&outbound));
                            reporter.finish(JobStatus::Failed, Some(format!("cannot start job: {}", e)));
                            live.remove(&job_id);
                        }
                    }
                }
                other => log::warn!(
                    "host: ignoring unexpected {} frame for job {}",
                    other.kind(),
                    other.job_id()
                ),
            }
            workers.retain(|worker| !worker.is_finished());
        }

        let stopped = live.stop_all();
        log::info!("host: input closed, stopped {} live unit(s)", stopped);
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }

    /// Merge a side-channel input into its job. A job whose input cannot be read
    /// is failed here and never reaches a unit.
    fn resolve_input(
        &self,
        mut job: NewJob,
        pending: &mut PendingPayloads,
        outbound: &Arc<Outbound>,
    ) -> Option<NewJob> {
        let Some(entry) = pending.take(&job.job_id) else {
            return Some(job);
        };
        match self.side_channel.read(&entry.file_path) {
            Ok(input) => {
                self.metrics.side_channel_reads.inc();
                job.function_input = Some(input);
                Some(job)
            }
            Err(e) => {
                self.metrics.side_channel_failures.inc();
                audit::payload_failure(&job.job_id, &e.to_string());
                let mut reporter = JobReporter::new(job.job_id, Arc::clone(outbound));
                reporter.finish(JobStatus::Failed, Some(format!("failed to read job input: {}", e)));
                None
            }
        }
    }

    fn run_job(&self, job: NewJob, outbound: Arc<Outbound>, live: Arc<LiveUnits>) {
        let job_id = job.job_id.clone();
        let mut reporter = JobReporter::new(job_id.clone(), outbound);

        let unit: Arc<dyn UnitHandle> = match self.start_unit(&job) {
            Ok(unit) => Arc::from(unit),
            Err(e) => {
                audit::job_setup_failed(&job_id, &e.to_string());
                reporter.finish(JobStatus::Failed, Some(e.to_string()));
                live.remove(&job_id);
                return;
            }
        };
        live.insert(&job_id, Arc::clone(&unit));
        reporter.running();

        let events = unit.events();
        let deadline = after(self.config.job_timeout);
        loop {
            select! {
                recv(events) -> event => {
                    let Ok(event) = event else {
                        reporter.finish(JobStatus::Failed, Some("execution unit event stream closed".to_string()));
                        break;
                    };
                    if self.forward(event, &unit, &mut reporter) {
                        break;
                    }
                }
                recv(deadline) -> _ => {
                    log::info!("host: job {} timed out after {:?}", job_id, self.config.job_timeout);
                    unit.terminate();
                    reporter.finish(JobStatus::Timeout, Some(TIMEOUT_MESSAGE.to_string()));
                    break;
                }
            }
        }

        live.remove(&job_id);
    }

    /// Translate one unit event into frames. Returns true once the job is terminal.
    fn forward(&self, event: UnitEvent, unit: &Arc<dyn UnitHandle>, reporter: &mut JobReporter) -> bool {
        let job_id = reporter.job_id.clone();
        match event {
            UnitEvent::Log { kind, text } => {
                reporter.send(Message::JobLog(JobLog { job_id, kind, log: text }));
            }
            UnitEvent::Test {
                name,
                status,
                event_timestamp,
                message,
                duration,
            } => reporter.send(Message::JobTest(JobTest {
                job_id,
                name,
                status,
                event_timestamp,
                message,
                duration,
            })),
            UnitEvent::Exception(exception) => {
                reporter.send(Message::JobException(JobException { job_id, exception }));
            }
            UnitEvent::Result(result) => self.send_result(reporter, result),
            UnitEvent::Complete => {
                unit.terminate();
                reporter.finish(JobStatus::Completed, None);
                return true;
            }
            UnitEvent::Exited { code } => {
                let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                reporter.finish(
                    JobStatus::Failed,
                    Some(format!("execution unit exited before completing (exit code {})", code)),
                );
                return true;
            }
        }
        false
    }

    /// Inline below the threshold; otherwise through the side-channel, falling
    /// back to a truncated inline result if the file cannot be written.
    fn send_result(&self, reporter: &JobReporter, result: String) {
        let job_id = reporter.job_id.clone();
        if !self.side_channel.should_divert(&result) {
            reporter.send(Message::JobResult(JobResult { job_id, result }));
            return;
        }
        match self.side_channel.write(&job_id, Direction::Output, &result) {
            Ok(wrapper) => {
                self.metrics.side_channel_writes.inc();
                audit::payload_diverted(&job_id, "output", result.len());
                reporter.send(Message::LargePayload(wrapper));
                reporter.send(Message::JobResult(JobResult {
                    job_id,
                    result: String::new(),
                }));
            }
            Err(e) => {
                self.metrics.side_channel_failures.inc();
                audit::payload_failure(&job_id, &e.to_string());
                reporter.send(Message::JobResult(JobResult {
                    job_id,
                    result: self.side_channel.truncate(&result),
                }));
            }
        }
    }

    fn start_unit(&self, job: &NewJob) -> Result<Box<dyn UnitHandle>> {
        let workspace = JobWorkspace::materialize(&self.config.vm_dir(), &job.job_id)?;
        let scripts = RuntimeScripts::load(&self.config.scripts_dir())?;
        let wrapped = write_job_modules(
            workspace.dir(),
            &job.code,
            &scripts,
            &WrapperRequest {
                testing: job.testing,
                function_input: job.function_input.as_deref(),
                env: &self.config.env,
            },
        )?;

        let manifest = CapabilityManifest::for_job(workspace.dir(), self.config.memory_limit_mb);
        manifest.validate()?;
        let fingerprint = manifest.fingerprint();
        let spec = UnitSpec {
            job_id: job.job_id.clone(),
            job_dir: workspace.dir().to_path_buf(),
            entry: wrapped.entry,
            source: job.code.clone(),
            testing: job.testing,
            function_input: job.function_input.clone(),
            env: unit_environment(&self.env_policy, workspace.dir(), &self.config.deno_dir()),
            manifest,
        };
        for warning in validate_environment_safety(&spec.env) {
            log::warn!("host: job {}: {}", job.job_id, warning);
        }

        let unit = self.provider.spawn(&spec)?;
        self.metrics.units_started.inc();
        audit::unit_started(&job.job_id, unit.id(), fingerprint);
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::LogKind;
    use crate::testing::scripted::ScriptedProvider;
    use std::net::Shutdown;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _root: TempDir,
        config: SandboxConfig,
        to_host: UnixStream,
        from_host: FrameReader<UnixStream>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn start(provider: Arc<ScriptedProvider>, tweak: impl FnOnce(&mut SandboxConfig)) -> Self {
            let root = TempDir::new().unwrap();
            let mut config = SandboxConfig::with_root(root.path());
            tweak(&mut config);
            config.ensure_dirs().unwrap();
            RuntimeScripts::install(&config.scripts_dir()).unwrap();

            let (supervisor_side, host_side) = UnixStream::pair().unwrap();
            let host = Arc::new(ExecutionHost::new(
                config.clone(),
                provider,
                Arc::new(MetricsRegistry::new()),
            ));
            let host_in = host_side.try_clone().unwrap();
            let handle = thread::spawn(move || host.run(host_in, host_side).unwrap());
            Self {
                _root: root,
                config,
                from_host: FrameReader::new(supervisor_side.try_clone().unwrap()),
                to_host: supervisor_side,
                handle: Some(handle),
            }
        }

        fn send(&mut self, message: &Message) {
            self.to_host.write_all(encode(message).unwrap().as_bytes()).unwrap();
        }

        fn submit(&mut self, job_id: &str, code: &str, function_input: Option<&str>) {
            self.send(&Message::NewJob(NewJob {
                job_id: job_id.to_string(),
                code: code.to_string(),
                testing: false,
                function_input: function_input.map(str::to_string),
            }));
        }

        /// Frames for `job_id` up to and including its terminal status.
        fn until_terminal(&mut self, job_id: &str) -> Vec<Message> {
            let mut frames = Vec::new();
            for line in self.from_host.by_ref() {
                let Some(message) = decode(&line) else { continue };
                if message.job_id() != job_id {
                    continue;
                }
                let terminal = matches!(&message, Message::JobStatus(s) if s.status.is_terminal());
                frames.push(message);
                if terminal {
                    break;
                }
            }
            frames
        }

        fn stop(mut self) {
            self.to_host.shutdown(Shutdown::Write).unwrap();
            if let Some(handle) = self.handle.take() {
                handle.join().unwrap();
            }
        }
    }

    fn terminal(frames: &[Message]) -> &JobStatusUpdate {
        match frames.last() {
            Some(Message::JobStatus(update)) => update,
            other => panic!("expected terminal status, got {:?}", other),
        }
    }

    #[test]
    fn plain_job_reports_running_log_completed() {
        let mut harness = Harness::start(Arc::new(ScriptedProvider::new()), |_| {});
        harness.submit("job1", "console.log('hi')", None);
        let frames = harness.until_terminal("job1");

        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], Message::JobStatus(s) if s.status == JobStatus::Running));
        assert!(matches!(&frames[1], Message::JobLog(l) if l.kind == LogKind::Log && l.log == "hi"));
        let done = terminal(&frames);
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(harness.config.job_dir("job1").join("worker.mjs").exists());
        harness.stop();
    }

    #[test]
    fn spawn_failure_is_a_terminal_failure_without_running() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_fail_spawn(true);
        let mut harness = Harness::start(provider, |_| {});
        harness.submit("job1", "console.log('hi')", None);
        let frames = harness.until_terminal("job1");
        assert_eq!(frames.len(), 1);
        assert_eq!(terminal(&frames).status, JobStatus::Failed);
        harness.stop();
    }

    #[test]
    fn busy_units_time_out() {
        let mut harness = Harness::start(Arc::new(ScriptedProvider::new()), |config| {
            config.job_timeout = Duration::from_millis(100);
        });
        harness.submit("slow", "while(true){}", None);
        let frames = harness.until_terminal("slow");
        let done = terminal(&frames);
        assert_eq!(done.status, JobStatus::Timeout);
        assert_eq!(done.error.as_deref(), Some(TIMEOUT_MESSAGE));
        harness.stop();
    }

    #[test]
    fn large_results_go_through_the_side_channel() {
        let mut harness = Harness::start(Arc::new(ScriptedProvider::new()), |config| {
            config.large_payload_threshold = 64;
        });
        let big = "x".repeat(200);
        let input = serde_json::to_string(&vec![big.clone()]).unwrap();
        harness.submit("big", "return args[0]", Some(&input));
        let frames = harness.until_terminal("big");

        let wrapper = frames
            .iter()
            .find_map(|m| match m {
                Message::LargePayload(w) => Some(w.clone()),
                _ => None,
            })
            .expect("wrapper frame");
        assert_eq!(wrapper.original_message, OriginalMessage::JobResult);
        let inline = frames.iter().find_map(|m| match m {
            Message::JobResult(r) => Some(r.result.clone()),
            _ => None,
        });
        assert_eq!(inline.as_deref(), Some(""));

        let on_disk = std::fs::read_to_string(harness.config.ipc_dir().join(&wrapper.file_path)).unwrap();
        assert_eq!(on_disk, serde_json::to_string(&big).unwrap());
        assert_eq!(terminal(&frames).status, JobStatus::Completed);
        harness.stop();
    }

    #[test]
    fn diverted_input_is_merged_into_the_job() {
        let mut harness = Harness::start(Arc::new(ScriptedProvider::new()), |config| {
            config.large_payload_threshold = 16;
        });
        let side_channel = SideChannel::from_config(&harness.config);
        let wrapper = side_channel
            .write("in", Direction::Input, r#"["from the side channel"]"#)
            .unwrap();
        harness.send(&Message::LargePayload(wrapper));
        harness.submit("in", "return args[0]", None);
        let frames = harness.until_terminal("in");
        assert!(frames.iter().any(|m| matches!(
            m,
            Message::LargePayload(w) if w.original_message == OriginalMessage::JobResult
        )));
        assert_eq!(terminal(&frames).status, JobStatus::Completed);
        harness.stop();
    }

    #[test]
    fn unreadable_input_fails_the_job() {
        let mut harness = Harness::start(Arc::new(ScriptedProvider::new()), |_| {});
        harness.send(&Message::LargePayload(crate::protocol::message::LargePayload {
            job_id: "lost".to_string(),
            original_message: OriginalMessage::NewJob,
            file_path: "1.lost.input.json".to_string(),
            timestamp: 1,
        }));
        harness.submit("lost", "return args", None);
        let frames = harness.until_terminal("lost");
        assert_eq!(frames.len(), 1);
        assert_eq!(terminal(&frames).status, JobStatus::Failed);
        harness.stop();
    }

    #[test]
    fn exiting_without_complete_fails_with_exit_code() {
        let mut harness = Harness::start(Arc::new(ScriptedProvider::new()), |_| {});
        harness.submit("quit", "Deno.exit(3)", None);
        let frames = harness.until_terminal("quit");
        let done = terminal(&frames);
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("exit code 3"));
        harness.stop();
    }

    #[test]
    fn unwritable_side_channel_falls_back_to_truncated_result() {
        let mut harness = Harness::start(Arc::new(ScriptedProvider::new()), |config| {
            config.large_payload_threshold = 64;
        });
        // Directories exist once a first job has run; then make the ipc dir unusable.
        harness.submit("warmup", "console.log('up')", None);
        harness.until_terminal("warmup");
        let ipc_dir = harness.config.ipc_dir();
        std::fs::remove_dir_all(&ipc_dir).unwrap();
        std::fs::write(&ipc_dir, "not a directory").unwrap();

        let input = serde_json::to_string(&vec!["y".repeat(200)]).unwrap();
        harness.submit("big", "return args[0]", Some(&input));
        let frames = harness.until_terminal("big");

        assert!(!frames.iter().any(|m| matches!(m, Message::LargePayload(_))));
        let result = frames
            .iter()
            .find_map(|m| match m {
                Message::JobResult(r) => Some(r.result.clone()),
                _ => None,
            })
            .expect("inline result");
        assert!(result.starts_with("\"yyyy"));
        assert!(result.ends_with("...[truncated due to error]"));
        assert_eq!(result.len(), 64 + "...[truncated due to error]".len());
        assert_eq!(terminal(&frames).status, JobStatus::Completed);
        harness.stop();
    }

    #[test]
    fn duplicate_job_ids_start_a_single_unit() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut harness = Harness::start(Arc::clone(&provider), |_| {});
        harness.submit("twin", "sleep(200)", None);
        harness.submit("twin", "sleep(200)", None);
        let frames = harness.until_terminal("twin");

        let running = frames
            .iter()
            .filter(|m| matches!(m, Message::JobStatus(s) if s.status == JobStatus::Running))
            .count();
        assert_eq!(running, 1);
        assert_eq!(terminal(&frames).status, JobStatus::Completed);
        harness.stop();
        assert_eq!(provider.spawned().len(), 1);
    }
}
