//! In-process doubles for the execution runtime and the host process.
//!
//! They let a full supervisor run end to end inside one test binary without
//! the external runtime installed.

pub mod in_process;
pub mod scripted;

pub use in_process::InProcessHostLauncher;
pub use scripted::ScriptedProvider;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write an executable shell script standing in for a host binary.
pub fn write_script(path: &Path, body: &str) -> io::Result<()> {
    fs::write(path, format!("#!/bin/sh\n{}\n", body))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

/// True while `pid` exists and is not a zombie.
pub fn process_running(pid: i32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state field follows the parenthesized command name.
    match stat.rsplit_once(')') {
        Some((_, rest)) => !matches!(rest.trim_start().chars().next(), Some('Z') | Some('X') | None),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_running() {
        assert!(process_running(std::process::id() as i32));
        assert!(!process_running(i32::MAX));
    }
}
