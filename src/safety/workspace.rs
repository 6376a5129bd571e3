//! Job-scoped working directories.
//!
//! Each job gets `vm/<jobId>`, owner-only, which is also the only filesystem
//! scope its unit is granted.

use crate::config::types::{Result, SandboxError};
use crate::protocol::message::is_valid_job_id;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Working directory for one job.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    job_id: String,
    dir: PathBuf,
}

impl JobWorkspace {
    /// Create `base_dir/<job_id>`. Refuses ids that are not plain path components.
    pub fn materialize(base_dir: &Path, job_id: &str) -> Result<Self> {
        if !is_valid_job_id(job_id) {
            return Err(SandboxError::Workspace(format!(
                "refusing to create workspace for job id {:?}",
                job_id
            )));
        }
        let dir = base_dir.join(job_id);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| {
                SandboxError::Workspace(format!(
                    "failed to create workspace directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        let dir = dir.canonicalize().map_err(|e| {
            SandboxError::Workspace(format!("cannot resolve {}: {}", dir.display(), e))
        })?;

        Ok(Self {
            job_id: job_id.to_string(),
            dir,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Absolute, symlink-free path of the job directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cleanup workspace (idempotent)
    pub fn cleanup(&self) -> Result<()> {
        remove_path(&self.dir)
    }
}

/// Remove a file or directory tree without following a top-level symlink.
/// A missing path is not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SandboxError::Workspace(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}
