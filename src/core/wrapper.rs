//! Job wrapper assembly.
//!
//! `worker.mjs` is the concatenation of: the event emitter prelude, the test
//! setup (or its no-op twin), the frozen environment preamble, the runtime
//! shims, and the completion trampoline that imports `code-function.mjs`.

use crate::config::types::{Result, SandboxError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const USER_MODULE: &str = "code-function.mjs";
pub const WORKER_MODULE: &str = "worker.mjs";

const RUNTIME_SETUP: &str = include_str!("scripts/runtime-setup.mjs");
const TESTING_SETUP: &str = include_str!("scripts/testing-setup.mjs");
const NO_TESTS_SETUP: &str = include_str!("scripts/no-tests-setup.mjs");

const RUNTIME_SETUP_FILE: &str = "runtime-setup.mjs";
const TESTING_SETUP_FILE: &str = "testing-setup.mjs";
const NO_TESTS_SETUP_FILE: &str = "no-tests-setup.mjs";

const EMITTER_PRELUDE: &str = r#"const __codeboxEncoder = new TextEncoder()
const __codeboxStdout = Deno.stdout
function __codeboxEmit(event) {
  try {
    const bytes = __codeboxEncoder.encode('@@unit ' + JSON.stringify(event) + '\n')
    let offset = 0
    while (offset < bytes.length) {
      offset += __codeboxStdout.writeSync(bytes.subarray(offset))
    }
  } catch (_) {}
}
"#;

/// The setup scripts units are assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeScripts {
    pub runtime_setup: String,
    pub testing_setup: String,
    pub no_tests_setup: String,
}

impl RuntimeScripts {
    pub fn embedded() -> Self {
        Self {
            runtime_setup: RUNTIME_SETUP.to_string(),
            testing_setup: TESTING_SETUP.to_string(),
            no_tests_setup: NO_TESTS_SETUP.to_string(),
        }
    }

    /// Write the embedded scripts into `dir`, replacing whatever is there.
    pub fn install(dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            SandboxError::Workspace(format!("cannot create scripts dir {}: {}", dir.display(), e))
        })?;
        for (name, content) in [
            (RUNTIME_SETUP_FILE, RUNTIME_SETUP),
            (TESTING_SETUP_FILE, TESTING_SETUP),
            (NO_TESTS_SETUP_FILE, NO_TESTS_SETUP),
        ] {
            let path = dir.join(name);
            fs::write(&path, content).map_err(|e| {
                SandboxError::Workspace(format!("cannot write {}: {}", path.display(), e))
            })?;
        }
        log::debug!("installed runtime scripts into {}", dir.display());
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<String> {
            let path = dir.join(name);
            fs::read_to_string(&path).map_err(|e| {
                SandboxError::Workspace(format!("cannot read runtime script {}: {}", path.display(), e))
            })
        };
        Ok(Self {
            runtime_setup: read(RUNTIME_SETUP_FILE)?,
            testing_setup: read(TESTING_SETUP_FILE)?,
            no_tests_setup: read(NO_TESTS_SETUP_FILE)?,
        })
    }
}

pub struct WrapperRequest<'a> {
    pub testing: bool,
    pub function_input: Option<&'a str>,
    pub env: &'a BTreeMap<String, String>,
}

/// Paths of the two modules written for a job.
#[derive(Debug, Clone)]
pub struct WrappedJob {
    pub user_module: PathBuf,
    pub entry: PathBuf,
}

pub fn build_worker_source(scripts: &RuntimeScripts, request: &WrapperRequest<'_>) -> Result<String> {
    let setup = if request.testing {
        &scripts.testing_setup
    } else {
        &scripts.no_tests_setup
    };

    let mut source = String::with_capacity(
        EMITTER_PRELUDE.len() + setup.len() + scripts.runtime_setup.len() + 1024,
    );
    source.push_str(EMITTER_PRELUDE);
    source.push_str(setup);
    source.push('\n');
    source.push_str(&env_preamble(request.env, request.testing)?);
    source.push_str(&scripts.runtime_setup);
    source.push('\n');
    source.push_str(&trampoline(request.function_input)?);
    Ok(source)
}

fn env_preamble(env: &BTreeMap<String, String>, testing: bool) -> Result<String> {
    let mut env = env.clone();
    let node_env = if testing { "testing" } else { "development" };
    env.insert("NODE_ENV".to_string(), node_env.to_string());
    let json = serde_json::to_string(&env)?;
    Ok(format!(
        "const __codeboxEnv = Object.freeze({})\nimport.meta.env = __codeboxEnv\n",
        json
    ))
}

fn trampoline(function_input: Option<&str>) -> Result<String> {
    let body = match function_input {
        Some(input) => {
            let literal = serde_json::to_string(input)?;
            format!(
                r#"    const module = await import(new URL('./{module}', import.meta.url).href)
    if (typeof module.default !== 'function') {{
      throw new Error('Module must export a default function')
    }}
    const args = JSON.parse({literal})
    const result = await module.default(...(Array.isArray(args) ? args : [args]))
    __codeboxSendResult(result)"#,
                module = USER_MODULE,
                literal = literal
            )
        }
        None => format!(
            "    await import(new URL('./{}', import.meta.url).href)",
            USER_MODULE
        ),
    };
    Ok(format!(
        r#"await (async () => {{
  try {{
{body}
  }} catch (err) {{
    __codeboxReportException(err)
  }}
  await __codeboxRunTests()
}})().finally(() => __codeboxComplete())
"#,
        body = body
    ))
}

/// Write the user module and its wrapper into `job_dir`.
pub fn write_job_modules(
    job_dir: &Path,
    user_source: &str,
    scripts: &RuntimeScripts,
    request: &WrapperRequest<'_>,
) -> Result<WrappedJob> {
    let user_module = job_dir.join(USER_MODULE);
    let entry = job_dir.join(WORKER_MODULE);
    let worker_source = build_worker_source(scripts, request)?;

    fs::write(&user_module, user_source).map_err(|e| {
        SandboxError::Workspace(format!("cannot write {}: {}", user_module.display(), e))
    })?;
    fs::write(&entry, worker_source).map_err(|e| {
        SandboxError::Workspace(format!("cannot write {}: {}", entry.display(), e))
    })?;

    Ok(WrappedJob { user_module, entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("API_BASE".to_string(), "https://example.test".to_string());
        env
    }

    #[test]
    fn chunks_are_assembled_in_order() {
        let scripts = RuntimeScripts::embedded();
        let env = env();
        let source = build_worker_source(
            &scripts,
            &WrapperRequest {
                testing: true,
                function_input: None,
                env: &env,
            },
        )
        .unwrap();

        let emitter = source.find("function __codeboxEmit").unwrap();
        let tests = source.find("async function __codeboxRunTests").unwrap();
        let env_at = source.find("const __codeboxEnv").unwrap();
        let runtime = source.find("function __codeboxComplete").unwrap();
        let trampoline = source.find("__codeboxComplete())").unwrap();
        assert!(emitter < tests && tests < env_at && env_at < runtime && runtime < trampoline);
        assert!(source.contains(r#""NODE_ENV":"testing""#));
        assert!(source.contains(r#""API_BASE":"https://example.test""#));
        assert!(source.contains("jsr:@std/expect"));
    }

    #[test]
    fn function_mode_embeds_input_as_string_literal() {
        let scripts = RuntimeScripts::embedded();
        let env = BTreeMap::new();
        let input = r#"["line\nbreak", {"quote": "\""}]"#;
        let source = build_worker_source(
            &scripts,
            &WrapperRequest {
                testing: false,
                function_input: Some(input),
                env: &env,
            },
        )
        .unwrap();

        assert!(source.contains(&format!("JSON.parse({})", serde_json::to_string(input).unwrap())));
        assert!(source.contains("module.default(...(Array.isArray(args) ? args : [args]))"));
        assert!(source.contains(r#""NODE_ENV":"development""#));
        assert!(!source.contains("jsr:@std/expect"));
    }

    #[test]
    fn scripts_round_trip_through_disk() {
        let tmp = TempDir::new().unwrap();
        RuntimeScripts::install(tmp.path()).unwrap();
        assert_eq!(RuntimeScripts::load(tmp.path()).unwrap(), RuntimeScripts::embedded());
    }

    #[test]
    fn missing_scripts_are_a_workspace_error() {
        let tmp = TempDir::new().unwrap();
        let err = RuntimeScripts::load(tmp.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Workspace(_)));
    }

    #[test]
    fn job_modules_land_in_job_dir() {
        let tmp = TempDir::new().unwrap();
        let env = BTreeMap::new();
        let wrapped = write_job_modules(
            tmp.path(),
            "console.log('hi')",
            &RuntimeScripts::embedded(),
            &WrapperRequest {
                testing: false,
                function_input: None,
                env: &env,
            },
        )
        .unwrap();
        assert_eq!(fs::read_to_string(&wrapped.user_module).unwrap(), "console.log('hi')");
        assert!(fs::read_to_string(&wrapped.entry).unwrap().contains(USER_MODULE));
    }
}
