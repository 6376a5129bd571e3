//! Environment hygiene for execution units.
//!
//! Units start from an empty environment; only a deterministic baseline plus a
//! small proxy passthrough list reaches the runtime process.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

const DETERMINISTIC_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Variables forwarded from the host so network access keeps working behind proxies.
const PASSTHROUGH_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

const DANGEROUS_VARS: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT", "DENO_AUTH_TOKENS"];

/// Environment sanitization policy
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    /// Forward proxy variables from the host
    pub passthrough_proxies: bool,
    /// Set deterministic locale
    pub set_deterministic_locale: bool,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy {
            passthrough_proxies: true,
            set_deterministic_locale: true,
        }
    }
}

/// Build the environment for one unit. HOME and TMPDIR point into the job
/// directory so any runtime scratch writes stay within the granted scope.
pub fn unit_environment(policy: &EnvPolicy, job_dir: &Path, deno_dir: &Path) -> BTreeMap<String, String> {
    unit_environment_from(policy, job_dir, deno_dir, |key| env::var(key).ok())
}

fn unit_environment_from<F>(
    policy: &EnvPolicy,
    job_dir: &Path,
    deno_dir: &Path,
    lookup: F,
) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env_map = BTreeMap::new();
    let job_dir = job_dir.display().to_string();

    env_map.insert("PATH".to_string(), DETERMINISTIC_PATH.to_string());
    env_map.insert("HOME".to_string(), job_dir.clone());
    env_map.insert("TMPDIR".to_string(), job_dir);
    env_map.insert("DENO_DIR".to_string(), deno_dir.display().to_string());
    env_map.insert("DENO_NO_UPDATE_CHECK".to_string(), "1".to_string());
    env_map.insert("NO_COLOR".to_string(), "1".to_string());

    if policy.set_deterministic_locale {
        env_map.insert("LANG".to_string(), "C.UTF-8".to_string());
        env_map.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
    }

    if policy.passthrough_proxies {
        for var in PASSTHROUGH_VARS {
            if let Some(value) = lookup(var) {
                env_map.insert(var.to_string(), value);
            }
        }
    }

    env_map
}

/// Validate environment safety
pub fn validate_environment_safety(env_map: &BTreeMap<String, String>) -> Vec<String> {
    let mut warnings = Vec::new();

    for var in DANGEROUS_VARS {
        if env_map.contains_key(*var) {
            warnings.push(format!("Dangerous environment variable present: {}", var));
        }
    }

    if let Some(path) = env_map.get("PATH") {
        if path.contains("..") || path.contains('~') {
            warnings.push("PATH contains relative or home directory references".to_string());
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn unit_env_is_scoped_to_job_dir() {
        let job_dir = PathBuf::from("/srv/sandbox/vm/abc");
        let deno_dir = PathBuf::from("/srv/sandbox/deno_dir");
        let env_map = unit_environment_from(&EnvPolicy::default(), &job_dir, &deno_dir, |_| None);

        assert_eq!(env_map.get("HOME").map(String::as_str), Some("/srv/sandbox/vm/abc"));
        assert_eq!(env_map.get("TMPDIR").map(String::as_str), Some("/srv/sandbox/vm/abc"));
        assert_eq!(env_map.get("DENO_DIR").map(String::as_str), Some("/srv/sandbox/deno_dir"));
        assert_eq!(env_map.get("PATH").map(String::as_str), Some(DETERMINISTIC_PATH));
        assert!(validate_environment_safety(&env_map).is_empty());
    }

    #[test]
    fn only_proxy_variables_pass_through() {
        let lookup = |key: &str| match key {
            "HTTPS_PROXY" => Some("http://proxy:3128".to_string()),
            "LD_PRELOAD" => Some("/evil.so".to_string()),
            _ => None,
        };
        let env_map = unit_environment_from(
            &EnvPolicy::default(),
            Path::new("/j"),
            Path::new("/d"),
            lookup,
        );
        assert_eq!(env_map.get("HTTPS_PROXY").map(String::as_str), Some("http://proxy:3128"));
        assert!(!env_map.contains_key("LD_PRELOAD"));
    }

    #[test]
    fn dangerous_variables_are_flagged() {
        let mut env_map = BTreeMap::new();
        env_map.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        assert!(validate_environment_safety(&env_map).is_empty());

        env_map.insert("LD_PRELOAD".to_string(), "/evil.so".to_string());
        let warnings = validate_environment_safety(&env_map);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("LD_PRELOAD"));
    }
}
