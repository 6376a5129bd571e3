use super::message::Message;
use crate::config::types::{Result, SandboxError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::{ErrorKind, Read};

/// Prefix that marks a protocol frame. Lines without it are diagnostics.
pub const FRAME_SENTINEL: &str = "data:";

const READ_CHUNK: usize = 8 * 1024;
const PREVIEW_LEN: usize = 80;

/// Encode a message as one newline-terminated frame.
pub fn encode(message: &Message) -> Result<String> {
    let json = serde_json::to_vec(message)?;
    Ok(format!("{} {}\n", FRAME_SENTINEL, STANDARD.encode(json)))
}

/// Decode one line. Non-frame lines yield `None` silently; malformed frames
/// yield `None` and are logged.
pub fn decode(line: &str) -> Option<Message> {
    match decode_frame(line) {
        Ok(message) => message,
        Err(err) => {
            log::warn!("dropping malformed frame ({}): {}", err, preview(line));
            None
        }
    }
}

/// Strict variant of [`decode`]: `Ok(None)` for non-frame lines, `Err` for frames
/// that fail base64, JSON, or structural validation.
pub fn decode_frame(line: &str) -> Result<Option<Message>> {
    let line = line.trim_end_matches(['\n', '\r']);
    let Some(body) = line.strip_prefix(FRAME_SENTINEL) else {
        return Ok(None);
    };
    let bytes = STANDARD
        .decode(body.trim())
        .map_err(|e| SandboxError::Protocol(format!("invalid base64: {}", e)))?;
    let message: Message = serde_json::from_slice(&bytes)
        .map_err(|e| SandboxError::Protocol(format!("invalid message: {}", e)))?;
    message.validate().map_err(SandboxError::Protocol)?;
    Ok(Some(message))
}

fn preview(line: &str) -> String {
    let mut end = line.len().min(PREVIEW_LEN);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    if end < line.len() {
        format!("{}...", &line[..end])
    } else {
        line.to_string()
    }
}

/// Reassembles newline-delimited lines from arbitrary byte chunks, keeping the
/// trailing fragment until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let raw = &self.pending[start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            lines.push(String::from_utf8_lossy(raw).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}

/// Line iterator over a byte stream, built on [`LineBuffer`].
pub struct FrameReader<R> {
    inner: R,
    buffer: LineBuffer,
    ready: std::collections::VecDeque<String>,
    eof: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: LineBuffer::new(),
            ready: std::collections::VecDeque::new(),
            eof: false,
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(line);
            }
            if self.eof {
                return None;
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    if let Some(rest) = self.buffer.finish() {
                        self.ready.push_back(rest);
                    }
                }
                Ok(n) => self.ready.extend(self.buffer.push(&chunk[..n])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("stream read failed: {}", e);
                    self.eof = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::NewJob(NewJob {
                job_id: "j1".into(),
                code: "console.log('a\\nb')\n// ünïcödé \u{0}".into(),
                testing: true,
                function_input: Some("[1,\"two\"]".into()),
            }),
            Message::JobStatus(JobStatusUpdate {
                job_id: "j1".into(),
                status: JobStatus::Timeout,
                error: Some("late".into()),
                completed_at: Some(42),
            }),
            Message::JobLog(JobLog {
                job_id: "j1".into(),
                kind: LogKind::Warn,
                log: "line one\nline two".into(),
            }),
            Message::JobException(JobException {
                job_id: "j1".into(),
                exception: ExceptionPayload::Message("plain".into()),
            }),
            Message::JobResult(JobResult {
                job_id: "j1".into(),
                result: "{\"ok\":true}".into(),
            }),
            Message::LargePayload(LargePayload {
                job_id: "j1".into(),
                original_message: OriginalMessage::NewJob,
                file_path: "1700000000000.j1.input.json".into(),
                timestamp: 1_700_000_000_000,
            }),
        ]
    }

    #[test]
    fn encode_then_decode_is_identity() {
        for message in sample_messages() {
            let line = encode(&message).unwrap();
            assert!(line.starts_with("data: "));
            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1, "frame must be a single line");
            assert_eq!(decode(&line), Some(message));
        }
    }

    #[test]
    fn non_frame_lines_are_ignored() {
        assert_eq!(decode("[host] starting up"), None);
        assert_eq!(decode(""), None);
        assert!(decode_frame("plain text").unwrap().is_none());
    }

    #[test]
    fn malformed_frames_are_rejected_not_fatal() {
        assert!(decode_frame("data: !!!not-base64!!!").is_err());
        let bad_json = format!("data: {}", STANDARD.encode("{\"type\":\"job-log\"}"));
        assert!(decode_frame(&bad_json).is_err());
        let bad_kind = format!(
            "data: {}",
            STANDARD.encode(r#"{"type":"job-log","jobId":"a","kind":"shout","log":"x"}"#)
        );
        assert_eq!(decode(&bad_kind), None);
        let unknown = format!("data: {}", STANDARD.encode(r#"{"type":"job-gossip","jobId":"a"}"#));
        assert_eq!(decode(&unknown), None);
    }

    #[test]
    fn line_buffer_keeps_partial_fragments() {
        let frame = encode(&sample_messages()[2]).unwrap();
        let (head, tail) = frame.split_at(frame.len() / 2);
        let mut buffer = LineBuffer::new();

        assert!(buffer.push(b"noise\r\n").first().is_some_and(|l| l == "noise"));
        assert!(buffer.push(head.as_bytes()).is_empty());
        assert!(buffer.buffered_len() > 0);

        let lines = buffer.push(tail.as_bytes());
        assert_eq!(lines.len(), 1);
        assert_eq!(decode(&lines[0]), Some(sample_messages()[2].clone()));
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn frame_reader_yields_trailing_line_at_eof() {
        let data = b"first\nsecond\nthird".to_vec();
        let lines: Vec<String> = FrameReader::new(std::io::Cursor::new(data)).collect();
        assert_eq!(lines, vec!["first", "second", "third"]);
    }
}
