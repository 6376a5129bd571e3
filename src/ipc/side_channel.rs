use crate::config::types::{Result, SandboxConfig, SandboxError};
use crate::protocol::message::{LargePayload, OriginalMessage};
use crate::utils::ids::now_millis;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const TRUNCATION_MARKER: &str = "...[truncated due to error]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    pub fn original_message(self) -> OriginalMessage {
        match self {
            Self::Input => OriginalMessage::NewJob,
            Self::Output => OriginalMessage::JobResult,
        }
    }
}

/// File-backed transport for payloads at or above the configured threshold.
/// Files are named `{unixMillis}.{jobId}.{input|output}.json` inside the IPC dir.
#[derive(Debug, Clone)]
pub struct SideChannel {
    dir: PathBuf,
    threshold: usize,
    cleanup: bool,
}

impl SideChannel {
    pub fn new(dir: impl Into<PathBuf>, threshold: usize, cleanup: bool) -> Self {
        Self {
            dir: dir.into(),
            threshold,
            cleanup,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.ipc_dir(), config.large_payload_threshold, config.cleanup)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn should_divert(&self, payload: &str) -> bool {
        payload.len() >= self.threshold
    }

    pub fn file_name(timestamp: u64, job_id: &str, direction: Direction) -> String {
        format!("{}.{}.{}.json", timestamp, job_id, direction.as_str())
    }

    /// Write the payload and return the wrapper frame announcing it. The file is
    /// staged under a temporary name and renamed so readers never see a partial write.
    pub fn write(&self, job_id: &str, direction: Direction, payload: &str) -> Result<LargePayload> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SandboxError::SideChannel(format!("cannot create {}: {}", self.dir.display(), e))
        })?;
        let timestamp = now_millis();
        let name = Self::file_name(timestamp, job_id, direction);
        let final_path = self.dir.join(&name);
        let staging = self.dir.join(format!("{}.tmp", name));

        fs::write(&staging, payload.as_bytes())
            .and_then(|_| fs::rename(&staging, &final_path))
            .map_err(|e| {
                let _ = fs::remove_file(&staging);
                SandboxError::SideChannel(format!("write {} failed: {}", final_path.display(), e))
            })?;

        log::debug!(
            "side-channel: wrote {} bytes for job {} to {}",
            payload.len(),
            job_id,
            name
        );
        Ok(LargePayload {
            job_id: job_id.to_string(),
            original_message: direction.original_message(),
            file_path: name,
            timestamp,
        })
    }

    /// Read a payload by file name and, when cleanup is enabled, delete it.
    /// Deletion failures are logged only.
    pub fn read(&self, file_name: &str) -> Result<String> {
        let path = self.dir.join(file_name);
        let content = fs::read_to_string(&path).map_err(|e| {
            SandboxError::SideChannel(format!("read {} failed: {}", path.display(), e))
        })?;
        if self.cleanup {
            remove_quietly(&path);
        }
        Ok(content)
    }

    /// Remove every side-channel file belonging to `job_id`. Returns how many
    /// were removed; a second call is a no-op.
    pub fn remove_job_files(&self, job_id: &str) -> usize {
        let marker = format!(".{}.", job_id);
        self.remove_matching(|name| name.contains(&marker))
    }

    /// Clear the IPC directory of anything left behind by a previous host.
    pub fn purge_orphans(&self) -> usize {
        let removed = self.remove_matching(|_| true);
        if removed > 0 {
            log::info!("side-channel: purged {} orphaned file(s) from {}", removed, self.dir.display());
        }
        removed
    }

    fn remove_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                log::warn!("side-channel: cannot list {}: {}", self.dir.display(), e);
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file && predicate(name) && remove_quietly(&entry.path()) {
                removed += 1;
            }
        }
        removed
    }

    /// Inline fallback used when the output file cannot be written.
    pub fn truncate(&self, payload: &str) -> String {
        let mut end = payload.len().min(self.threshold);
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}{}", &payload[..end], TRUNCATION_MARKER)
    }
}

fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            log::warn!("side-channel: failed to delete {}: {}", path.display(), e);
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayload {
    pub file_path: String,
    pub timestamp: u64,
}

/// Per-job record of announced side-channel payloads awaiting their real message.
#[derive(Debug, Default)]
pub struct PendingPayloads {
    entries: HashMap<String, PendingPayload>,
}

impl PendingPayloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, wrapper: &LargePayload) {
        let previous = self.entries.insert(
            wrapper.job_id.clone(),
            PendingPayload {
                file_path: wrapper.file_path.clone(),
                timestamp: wrapper.timestamp,
            },
        );
        if let Some(previous) = previous {
            log::warn!(
                "side-channel: job {} announced a second payload, dropping {}",
                wrapper.job_id,
                previous.file_path
            );
        }
    }

    /// Consume the pending entry for `job_id`, if any.
    pub fn take(&mut self, job_id: &str) -> Option<PendingPayload> {
        self.entries.remove(job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn threshold_is_inclusive() {
        let channel = SideChannel::new("/unused", 4, true);
        assert!(!channel.should_divert("abc"));
        assert!(channel.should_divert("abcd"));
        assert!(channel.should_divert("abcde"));
    }

    #[test]
    fn write_then_read_consumes_file_when_cleanup_enabled() {
        let tmp = TempDir::new().unwrap();
        let channel = SideChannel::new(tmp.path(), 4, true);

        let wrapper = channel.write("job1", Direction::Output, "\"payload\"").unwrap();
        assert_eq!(wrapper.original_message, OriginalMessage::JobResult);
        assert!(wrapper.file_path.ends_with(".job1.output.json"));
        assert!(tmp.path().join(&wrapper.file_path).exists());

        assert_eq!(channel.read(&wrapper.file_path).unwrap(), "\"payload\"");
        assert!(!tmp.path().join(&wrapper.file_path).exists());
        assert!(channel.read(&wrapper.file_path).is_err());
    }

    #[test]
    fn read_keeps_file_when_cleanup_disabled() {
        let tmp = TempDir::new().unwrap();
        let channel = SideChannel::new(tmp.path(), 4, false);
        let wrapper = channel.write("job1", Direction::Input, "[1,2,3]").unwrap();
        channel.read(&wrapper.file_path).unwrap();
        assert!(tmp.path().join(&wrapper.file_path).exists());
    }

    #[test]
    fn job_cleanup_is_scoped_and_idempotent() {
        let tmp = TempDir::new().unwrap();
        let channel = SideChannel::new(tmp.path(), 1, true);
        channel.write("alpha", Direction::Input, "a").unwrap();
        channel.write("alpha", Direction::Output, "b").unwrap();
        channel.write("beta", Direction::Input, "c").unwrap();

        assert_eq!(channel.remove_job_files("alpha"), 2);
        assert_eq!(channel.remove_job_files("alpha"), 0);
        assert_eq!(channel.purge_orphans(), 1);
        assert_eq!(channel.purge_orphans(), 0);
    }

    #[test]
    fn purge_on_missing_dir_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let channel = SideChannel::new(tmp.path().join("missing"), 1, true);
        assert_eq!(channel.purge_orphans(), 0);
        assert_eq!(channel.remove_job_files("x"), 0);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let channel = SideChannel::new("/unused", 3, true);
        assert_eq!(channel.truncate("abcdef"), "abc...[truncated due to error]");
        assert_eq!(channel.truncate("aé"), "aé...[truncated due to error]");
        assert_eq!(channel.truncate("éé"), "é...[truncated due to error]");
    }

    #[test]
    fn pending_entries_are_consumed_exactly_once() {
        let mut pending = PendingPayloads::new();
        pending.record(&LargePayload {
            job_id: "j".into(),
            original_message: OriginalMessage::JobResult,
            file_path: "1.j.output.json".into(),
            timestamp: 1,
        });
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.take("j").map(|p| p.file_path), Some("1.j.output.json".to_string()));
        assert!(pending.take("j").is_none());
        assert!(pending.is_empty());
    }
}
