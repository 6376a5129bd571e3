//! Scripted unit provider.
//!
//! Interprets job source as a tiny line-oriented script instead of running it.
//! Each line is one statement:
//!
//! - `console.log('text')` (also `info`, `warn`, `error`, `debug`)
//! - `throw new Error('message')`
//! - `sleep(ms)` and `while(true){}`
//! - `test('name', pass)` / `test('name', fail)`
//! - `Deno.exit(code)`
//! - `return args[N]`, `return args`, `return undefined` (function mode)
//!
//! Anything else is ignored. Events follow the same order a real unit
//! produces: body output, tests, then `complete`.

use crate::config::types::{Result, SandboxError};
use crate::core::unit::{UnitEvent, UnitHandle, UnitProvider, UnitSpec};
use crate::protocol::message::{ExceptionPayload, LogKind, StructuredException, TestStatus};
use crate::utils::ids::now_millis;
use crossbeam_channel::{after, bounded, select, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Exit code reported for a unit stopped with `terminate`, matching SIGKILL.
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    next_id: AtomicU32,
    fail_spawn: AtomicBool,
    spawned: Mutex<Vec<UnitSpec>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ..Self::default()
        }
    }

    /// Make every following spawn fail, as if the runtime could not start.
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Specs of every unit started so far.
    pub fn spawned(&self) -> Vec<UnitSpec> {
        match self.spawned.lock() {
            Ok(spawned) => spawned.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl UnitProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    fn spawn(&self, spec: &UnitSpec) -> Result<Box<dyn UnitHandle>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SandboxError::Host(format!(
                "scripted runtime refused job {}",
                spec.job_id
            )));
        }
        spec.manifest.validate()?;
        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.push(spec.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = unbounded();
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let script = Script {
            statements: spec.source.lines().map(|l| l.trim().trim_end_matches(';').to_string()).collect(),
            testing: spec.testing,
            function_input: spec.function_input.clone(),
            events: events_tx,
            cancel: cancel_rx,
        };
        thread::Builder::new()
            .name(format!("scripted-unit-{}", id))
            .spawn(move || script.run())?;

        Ok(Box::new(ScriptedUnit {
            id,
            events: events_rx,
            cancel: Mutex::new(Some(cancel_tx)),
        }))
    }
}

struct ScriptedUnit {
    id: u32,
    events: Receiver<UnitEvent>,
    cancel: Mutex<Option<Sender<()>>>,
}

impl UnitHandle for ScriptedUnit {
    fn id(&self) -> u32 {
        self.id
    }

    fn events(&self) -> Receiver<UnitEvent> {
        self.events.clone()
    }

    fn terminate(&self) {
        // Dropping the sender disconnects the cancel channel.
        if let Ok(mut cancel) = self.cancel.lock() {
            cancel.take();
        }
    }
}

enum Step {
    Next,
    Threw,
    Returned,
    Exit(i32),
    Killed,
}

struct Script {
    statements: Vec<String>,
    testing: bool,
    function_input: Option<String>,
    events: Sender<UnitEvent>,
    cancel: Receiver<()>,
}

impl Script {
    fn run(self) {
        let mut tests = Vec::new();
        let mut returned = false;
        for statement in &self.statements {
            match self.execute(statement, &mut tests) {
                Step::Next => {}
                Step::Returned => {
                    returned = true;
                    break;
                }
                Step::Threw => {
                    returned = true;
                    break;
                }
                Step::Exit(code) => return self.exit(Some(code)),
                Step::Killed => return self.exit(Some(KILLED_EXIT_CODE)),
            }
        }
        if self.function_input.is_some() && !returned {
            self.emit(not_serializable("undefined"));
        }
        if self.testing {
            for (name, passes) in tests {
                self.run_test(&name, passes);
            }
        }
        self.emit(UnitEvent::Complete);
        self.exit(Some(0));
    }

    fn execute(&self, statement: &str, tests: &mut Vec<(String, bool)>) -> Step {
        for (prefix, kind) in [
            ("console.log(", LogKind::Log),
            ("console.info(", LogKind::Info),
            ("console.warn(", LogKind::Warn),
            ("console.error(", LogKind::Error),
            ("console.debug(", LogKind::Debug),
        ] {
            if let Some(text) = call_argument(statement, prefix) {
                self.emit(UnitEvent::Log {
                    kind,
                    text: unquote(text),
                });
                return Step::Next;
            }
        }
        if let Some(message) = call_argument(statement, "throw new Error(") {
            self.emit(UnitEvent::Exception(ExceptionPayload::Structured(StructuredException {
                name: "Error".to_string(),
                message: unquote(message),
                stack: format!("Uncaught Error: {}", unquote(message)),
            })));
            return Step::Threw;
        }
        if let Some(ms) = call_argument(statement, "sleep(") {
            let delay = Duration::from_millis(ms.trim().parse().unwrap_or(0));
            return self.sleep(delay);
        }
        if statement.starts_with("while(true)") || statement.starts_with("while (true)") {
            let _ = self.cancel.recv();
            return Step::Killed;
        }
        if let Some(arguments) = call_argument(statement, "test(") {
            if let Some((name, outcome)) = arguments.rsplit_once(',') {
                tests.push((unquote(name), outcome.trim() == "pass"));
            }
            return Step::Next;
        }
        if let Some(code) = call_argument(statement, "Deno.exit(") {
            return Step::Exit(code.trim().parse().unwrap_or(1));
        }
        if let Some(expression) = statement.strip_prefix("return ") {
            return self.return_value(expression.trim());
        }
        Step::Next
    }

    fn sleep(&self, delay: Duration) -> Step {
        select! {
            recv(self.cancel) -> _ => Step::Killed,
            recv(after(delay)) -> _ => Step::Next,
        }
    }

    fn return_value(&self, expression: &str) -> Step {
        if self.function_input.is_none() {
            return Step::Returned;
        }
        let args = self
            .function_input
            .as_deref()
            .and_then(|input| serde_json::from_str::<serde_json::Value>(input).ok())
            .unwrap_or(serde_json::Value::Null);

        let value = if expression == "args" {
            Some(args)
        } else if let Some(index) = expression
            .strip_prefix("args[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|index| index.parse::<usize>().ok())
        {
            Some(args.get(index).cloned().unwrap_or(serde_json::Value::Null))
        } else {
            None
        };

        match value.and_then(|value| serde_json::to_string(&value).ok()) {
            Some(result) => self.emit(UnitEvent::Result(result)),
            None => self.emit(not_serializable("undefined")),
        }
        Step::Returned
    }

    fn run_test(&self, name: &str, passes: bool) {
        let started = Instant::now();
        self.emit(UnitEvent::Test {
            name: name.to_string(),
            status: TestStatus::Running,
            event_timestamp: now_millis(),
            message: "Test started".to_string(),
            duration: -1,
        });
        let (status, message) = if passes {
            (TestStatus::Passed, "Test passed")
        } else {
            (TestStatus::Failed, "Test assertion failed")
        };
        self.emit(UnitEvent::Test {
            name: name.to_string(),
            status,
            event_timestamp: now_millis(),
            message: message.to_string(),
            duration: started.elapsed().as_millis() as i64,
        });
    }

    fn emit(&self, event: UnitEvent) {
        let _ = self.events.send(event);
    }

    fn exit(&self, code: Option<i32>) {
        self.emit(UnitEvent::Exited { code });
    }
}

fn call_argument<'a>(statement: &'a str, prefix: &str) -> Option<&'a str> {
    statement.strip_prefix(prefix)?.strip_suffix(')')
}

fn unquote(text: &str) -> String {
    let text = text.trim();
    for quote in ['\'', '"', '`'] {
        if let Some(inner) = text.strip_prefix(quote).and_then(|t| t.strip_suffix(quote)) {
            return inner.to_string();
        }
    }
    text.to_string()
}

fn not_serializable(kind: &str) -> UnitEvent {
    UnitEvent::Exception(ExceptionPayload::Structured(StructuredException {
        name: "TypeError".to_string(),
        message: format!(
            "Function returned a value that cannot be serialized to JSON ({})",
            kind
        ),
        stack: String::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::CapabilityManifest;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec(source: &str, testing: bool, function_input: Option<&str>) -> UnitSpec {
        let job_dir = PathBuf::from("/tmp/codebox-scripted");
        UnitSpec {
            job_id: "job".to_string(),
            entry: job_dir.join("worker.mjs"),
            manifest: CapabilityManifest::for_job(&job_dir, 64),
            job_dir,
            source: source.to_string(),
            testing,
            function_input: function_input.map(str::to_string),
            env: BTreeMap::new(),
        }
    }

    fn collect(unit: Box<dyn UnitHandle>) -> Vec<UnitEvent> {
        let events = unit.events();
        let mut seen = Vec::new();
        for event in events.iter() {
            let done = matches!(event, UnitEvent::Exited { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn logs_then_completes() {
        let provider = ScriptedProvider::new();
        let unit = provider.spawn(&spec("console.log('hi')\nconsole.warn(\"careful\")", false, None)).unwrap();
        assert_eq!(
            collect(unit),
            vec![
                UnitEvent::Log { kind: LogKind::Log, text: "hi".to_string() },
                UnitEvent::Log { kind: LogKind::Warn, text: "careful".to_string() },
                UnitEvent::Complete,
                UnitEvent::Exited { code: Some(0) },
            ]
        );
        assert_eq!(provider.spawned().len(), 1);
    }

    #[test]
    fn function_mode_echoes_arguments() {
        let provider = ScriptedProvider::new();
        let unit = provider.spawn(&spec("return args[1]", false, Some(r#"["a",{"b":2}]"#))).unwrap();
        let events = collect(unit);
        assert_eq!(events[0], UnitEvent::Result(r#"{"b":2}"#.to_string()));
    }

    #[test]
    fn throwing_skips_the_result() {
        let provider = ScriptedProvider::new();
        let unit = provider
            .spawn(&spec("throw new Error('boom')\nreturn args", false, Some("[]")))
            .unwrap();
        let events = collect(unit);
        assert!(matches!(&events[0], UnitEvent::Exception(e) if e.message() == "boom"));
        assert!(!events.iter().any(|e| matches!(e, UnitEvent::Result(_))));
        assert!(events.contains(&UnitEvent::Complete));
    }

    #[test]
    fn terminate_interrupts_busy_loops() {
        let provider = ScriptedProvider::new();
        let unit = provider.spawn(&spec("while(true){}", false, None)).unwrap();
        unit.terminate();
        assert_eq!(collect(unit), vec![UnitEvent::Exited { code: Some(KILLED_EXIT_CODE) }]);
    }

    #[test]
    fn tests_run_only_in_testing_mode() {
        let provider = ScriptedProvider::new();
        let unit = provider.spawn(&spec("test('adds', pass)\ntest('breaks', fail)", true, None)).unwrap();
        let statuses: Vec<TestStatus> = collect(unit)
            .into_iter()
            .filter_map(|e| match e {
                UnitEvent::Test { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![TestStatus::Running, TestStatus::Passed, TestStatus::Running, TestStatus::Failed]
        );

        let unit = provider.spawn(&spec("test('adds', pass)", false, None)).unwrap();
        assert!(!collect(unit).iter().any(|e| matches!(e, UnitEvent::Test { .. })));
    }

    #[test]
    fn explicit_exit_skips_complete() {
        let provider = ScriptedProvider::new();
        let unit = provider.spawn(&spec("Deno.exit(3)", false, None)).unwrap();
        assert_eq!(collect(unit), vec![UnitEvent::Exited { code: Some(3) }]);
    }
}
