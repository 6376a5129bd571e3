//! Policy-gated artifact cleanup.
//!
//! Terminal jobs lose their working directory and side-channel files; a fresh
//! host starts from an empty IPC directory and no stale job directories. Every
//! operation is idempotent and failures are logged, never propagated.

use crate::config::types::SandboxConfig;
use crate::ipc::side_channel::SideChannel;
use crate::safety::workspace::remove_path;
use std::fs;
use std::path::PathBuf;

/// What a cleanup pass actually removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub job_dirs: usize,
    pub ipc_files: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.job_dirs == 0 && self.ipc_files == 0
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactCleaner {
    vm_dir: PathBuf,
    side_channel: SideChannel,
    enabled: bool,
}

impl ArtifactCleaner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            vm_dir: config.vm_dir(),
            side_channel: SideChannel::from_config(config),
            enabled: config.cleanup,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Remove the artifacts of one job. No-op when disabled or already clean.
    pub fn cleanup_job(&self, job_id: &str) -> CleanupReport {
        if !self.enabled {
            return CleanupReport::default();
        }
        let mut report = CleanupReport::default();
        let job_dir = self.vm_dir.join(job_id);
        if job_dir.exists() {
            match remove_path(&job_dir) {
                Ok(()) => report.job_dirs = 1,
                Err(e) => log::warn!("cleanup: {}", e),
            }
        }
        report.ipc_files = self.side_channel.remove_job_files(job_id);
        if !report.is_empty() {
            log::debug!("cleanup: job {} removed {:?}", job_id, report);
        }
        report
    }

    /// Clear everything a previous host may have left behind.
    pub fn purge_orphans(&self) -> CleanupReport {
        if !self.enabled {
            return CleanupReport::default();
        }
        let mut report = CleanupReport {
            job_dirs: 0,
            ipc_files: self.side_channel.purge_orphans(),
        };
        if let Ok(entries) = fs::read_dir(&self.vm_dir) {
            for entry in entries.flatten() {
                match remove_path(&entry.path()) {
                    Ok(()) => report.job_dirs += 1,
                    Err(e) => log::warn!("cleanup: {}", e),
                }
            }
        }
        if !report.is_empty() {
            log::info!("cleanup: purged orphaned artifacts {:?}", report);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::side_channel::Direction;
    use tempfile::TempDir;

    fn setup(cleanup: bool) -> (TempDir, SandboxConfig) {
        let tmp = TempDir::new().unwrap();
        let mut config = SandboxConfig::with_root(tmp.path());
        config.cleanup = cleanup;
        config.large_payload_threshold = 1;
        config.ensure_dirs().unwrap();
        (tmp, config)
    }

    #[test]
    fn job_cleanup_removes_dir_and_ipc_files_once() {
        let (_tmp, config) = setup(true);
        fs::create_dir_all(config.job_dir("j1")).unwrap();
        SideChannel::from_config(&config)
            .write("j1", Direction::Output, "big")
            .unwrap();
        let cleaner = ArtifactCleaner::new(&config);

        assert_eq!(cleaner.cleanup_job("j1"), CleanupReport { job_dirs: 1, ipc_files: 1 });
        assert!(cleaner.cleanup_job("j1").is_empty());
    }

    #[test]
    fn disabled_policy_keeps_artifacts() {
        let (_tmp, config) = setup(false);
        fs::create_dir_all(config.job_dir("j1")).unwrap();
        let cleaner = ArtifactCleaner::new(&config);
        assert!(cleaner.cleanup_job("j1").is_empty());
        assert!(cleaner.purge_orphans().is_empty());
        assert!(config.job_dir("j1").exists());
    }

    #[test]
    fn purge_clears_stale_jobs_and_ipc() {
        let (_tmp, config) = setup(true);
        fs::create_dir_all(config.job_dir("a")).unwrap();
        fs::create_dir_all(config.job_dir("b")).unwrap();
        SideChannel::from_config(&config)
            .write("a", Direction::Input, "x")
            .unwrap();
        let cleaner = ArtifactCleaner::new(&config);
        assert_eq!(cleaner.purge_orphans(), CleanupReport { job_dirs: 2, ipc_files: 1 });
        assert!(cleaner.purge_orphans().is_empty());
    }
}
