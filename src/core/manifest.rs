//! Capability manifest handed to the execution-unit provider.
//!
//! Every capability is listed with an explicit grant; nothing is inherited from
//! a permissive default. The manifest renders to runtime permission flags and to
//! a stable fingerprint recorded in audit events.

use crate::config::types::{Result, SandboxError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Net,
    Import,
    Run,
    Ffi,
    Sys,
    Env,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Read,
        Capability::Write,
        Capability::Net,
        Capability::Import,
        Capability::Run,
        Capability::Ffi,
        Capability::Sys,
        Capability::Env,
    ];

    pub fn flag_name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Net => "net",
            Self::Import => "import",
            Self::Run => "run",
            Self::Ffi => "ffi",
            Self::Sys => "sys",
            Self::Env => "env",
        }
    }

    fn is_filesystem(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "grant", content = "paths", rename_all = "lowercase")]
pub enum Grant {
    Deny,
    Allow,
    Scoped(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityManifest {
    pub read: Grant,
    pub write: Grant,
    pub net: Grant,
    pub import: Grant,
    pub run: Grant,
    pub ffi: Grant,
    pub sys: Grant,
    pub env: Grant,
    pub memory_limit_mb: u64,
}

impl CapabilityManifest {
    /// The isolation boundary for one job: filesystem scoped to its own
    /// directory, network and module import allowed, everything else denied.
    pub fn for_job(job_dir: &Path, memory_limit_mb: u64) -> Self {
        Self {
            read: Grant::Scoped(vec![job_dir.to_path_buf()]),
            write: Grant::Scoped(vec![job_dir.to_path_buf()]),
            net: Grant::Allow,
            import: Grant::Allow,
            run: Grant::Deny,
            ffi: Grant::Deny,
            sys: Grant::Deny,
            env: Grant::Deny,
            memory_limit_mb,
        }
    }

    pub fn grant(&self, capability: Capability) -> &Grant {
        match capability {
            Capability::Read => &self.read,
            Capability::Write => &self.write,
            Capability::Net => &self.net,
            Capability::Import => &self.import,
            Capability::Run => &self.run,
            Capability::Ffi => &self.ffi,
            Capability::Sys => &self.sys,
            Capability::Env => &self.env,
        }
    }

    /// Reject manifests that would open the filesystem wholesale or hand out
    /// process spawning, native libraries, or raw system access.
    pub fn validate(&self) -> Result<()> {
        for capability in Capability::ALL {
            let grant = self.grant(capability);
            match (capability, grant) {
                (c, Grant::Allow) if c.is_filesystem() => {
                    return Err(SandboxError::Config(format!(
                        "{} access must be scoped to explicit paths",
                        c.flag_name()
                    )))
                }
                (Capability::Run | Capability::Ffi | Capability::Sys, g) if *g != Grant::Deny => {
                    return Err(SandboxError::Config(format!(
                        "{} capability must be denied",
                        capability.flag_name()
                    )))
                }
                (_, Grant::Scoped(paths)) if paths.iter().any(|p| !p.is_absolute()) => {
                    return Err(SandboxError::Config(format!(
                        "{} grant contains a relative path",
                        capability.flag_name()
                    )))
                }
                _ => {}
            }
        }
        if self.memory_limit_mb == 0 {
            return Err(SandboxError::Config("memory limit cannot be zero".to_string()));
        }
        Ok(())
    }

    /// Permission flags for the Deno runtime, one per capability.
    pub fn to_runtime_flags(&self) -> Vec<String> {
        let mut flags = Vec::with_capacity(Capability::ALL.len() + 2);
        for capability in Capability::ALL {
            let name = capability.flag_name();
            let flag = match self.grant(capability) {
                Grant::Deny => format!("--deny-{}", name),
                Grant::Allow => format!("--allow-{}", name),
                Grant::Scoped(paths) => {
                    let joined: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                    format!("--allow-{}={}", name, joined.join(","))
                }
            };
            flags.push(flag);
        }
        flags.push("--no-prompt".to_string());
        flags.push(format!("--v8-flags=--max-old-space-size={}", self.memory_limit_mb));
        flags
    }

    /// SHA-256 over the canonical JSON form.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("codebox-{}", env!("CARGO_PKG_VERSION")));
        match serde_json::to_vec(self) {
            Ok(bytes) => hasher.update(bytes),
            Err(_) => hasher.update(format!("{:?}", self)),
        }
        format!("{:x}", hasher.finalize())
    }
}
