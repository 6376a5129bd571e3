//! Per-call event sequence.
//!
//! A stream is a pull iterator over one job's events. It ends when the job's
//! exit condition is met or when the supervisor closes the job's queue.
//! Dropping a stream early detaches its listener; the job itself keeps
//! running on the host.

use super::events::{CodeExecutionEvent, EventKind};
use crate::protocol::message::JobStatus;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::Duration;

pub struct ExecutionStream {
    job_id: String,
    execution_id: String,
    function_mode: bool,
    start: Option<CodeExecutionEvent>,
    events: Receiver<CodeExecutionEvent>,
    seen_exception: bool,
    finished: bool,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ExecutionStream {
    pub(crate) fn new(
        job_id: String,
        start: CodeExecutionEvent,
        function_mode: bool,
        events: Receiver<CodeExecutionEvent>,
        detach: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            job_id,
            execution_id: start.code_execution_id.clone(),
            function_mode,
            start: Some(start),
            events,
            seen_exception: false,
            finished: false,
            detach: Some(detach),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn is_function(&self) -> bool {
        self.function_mode
    }

    /// Like [`Iterator::next`], but gives up after `timeout` without ending the
    /// stream. `Disconnected` means the stream is over.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<CodeExecutionEvent, RecvTimeoutError> {
        if let Some(start) = self.start.take() {
            return Ok(start);
        }
        if self.finished {
            return Err(RecvTimeoutError::Disconnected);
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(self.observe(event)),
            Err(RecvTimeoutError::Timeout) => Err(RecvTimeoutError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                self.finish();
                Err(RecvTimeoutError::Disconnected)
            }
        }
    }

    fn observe(&mut self, event: CodeExecutionEvent) -> CodeExecutionEvent {
        if self.ends_stream(&event.kind) {
            self.finish();
        }
        event
    }

    fn ends_stream(&mut self, kind: &EventKind) -> bool {
        match kind {
            EventKind::Exception { .. } => {
                self.seen_exception = true;
                false
            }
            EventKind::Result { result } => self.function_mode && !result.is_empty(),
            EventKind::Status { status, .. } if status.is_terminal() => {
                !self.function_mode || *status != JobStatus::Completed || self.seen_exception
            }
            _ => false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Iterator for ExecutionStream {
    type Item = CodeExecutionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(start) = self.start.take() {
            return Some(start);
        }
        if self.finished {
            return None;
        }
        match self.events.recv() {
            Ok(event) => Some(self.observe(event)),
            Err(_) => {
                self.finish();
                None
            }
        }
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::ExceptionPayload;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(kind: EventKind) -> CodeExecutionEvent {
        CodeExecutionEvent {
            code_execution_id: "exec".to_string(),
            message_id: "m".to_string(),
            kind,
        }
    }

    fn status(status: JobStatus) -> CodeExecutionEvent {
        event(EventKind::Status { status, error: None })
    }

    fn stream(function_mode: bool) -> (ExecutionStream, crossbeam_channel::Sender<CodeExecutionEvent>, Arc<AtomicUsize>) {
        let (tx, rx) = unbounded();
        let detached = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&detached);
        let stream = ExecutionStream::new(
            "job".to_string(),
            event(EventKind::Start),
            function_mode,
            rx,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (stream, tx, detached)
    }

    fn names(stream: ExecutionStream) -> Vec<&'static str> {
        stream.map(|e| e.kind.name()).collect()
    }

    #[test]
    fn plain_execution_stops_at_terminal_status() {
        let (stream, tx, detached) = stream(false);
        tx.send(status(JobStatus::Running)).unwrap();
        tx.send(status(JobStatus::Completed)).unwrap();
        tx.send(event(EventKind::Log {
            kind: crate::protocol::message::LogKind::Log,
            log: "late".to_string(),
        }))
        .unwrap();
        assert_eq!(names(stream), vec!["start", "status", "status"]);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn function_execution_stops_at_non_empty_result() {
        let (stream, tx, _) = stream(true);
        tx.send(status(JobStatus::Running)).unwrap();
        tx.send(event(EventKind::Result { result: "\"ok\"".to_string() })).unwrap();
        tx.send(status(JobStatus::Completed)).unwrap();
        assert_eq!(names(stream), vec!["start", "status", "result"]);
    }

    #[test]
    fn function_execution_stops_at_completed_after_exception() {
        let (stream, tx, _) = stream(true);
        tx.send(event(EventKind::Exception {
            exception: ExceptionPayload::Message("boom".to_string()),
        }))
        .unwrap();
        tx.send(status(JobStatus::Completed)).unwrap();
        tx.send(event(EventKind::Result { result: "1".to_string() })).unwrap();
        assert_eq!(names(stream), vec!["start", "exception", "status"]);
    }

    #[test]
    fn function_execution_keeps_waiting_after_clean_completion() {
        let (mut stream, tx, _) = stream(true);
        tx.send(status(JobStatus::Completed)).unwrap();
        assert!(stream.next().is_some());
        assert!(stream.next().is_some());
        drop(tx);
        assert!(stream.next().is_none());
    }

    #[test]
    fn failed_status_ends_function_execution() {
        let (stream, tx, _) = stream(true);
        tx.send(status(JobStatus::Timeout)).unwrap();
        assert_eq!(names(stream), vec!["start", "status"]);
    }

    #[test]
    fn dropping_early_detaches_once() {
        let (mut stream, _tx, detached) = stream(false);
        assert!(stream.next().is_some());
        assert_eq!(
            stream.next_timeout(Duration::from_millis(10)).err(),
            Some(RecvTimeoutError::Timeout)
        );
        drop(stream);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }
}
