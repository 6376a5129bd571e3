use crate::config::types::SandboxConfig;
use crate::config::validator::validate_config;
use crate::core::deno::DenoRuntime;
use crate::core::host::ExecutionHost;
use crate::core::supervisor::Supervisor;
use crate::core::transform::ImportPrefixTransform;
use crate::observability::metrics::get_metrics;
use crate::protocol::message::JobStatus;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    /// Operator front end: `codebox`.
    Client,
    /// Execution host speaking the wire protocol on stdio: `codebox-host`.
    Host,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sandbox root directory (overrides CODEBOX_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file in the sandbox and print its events as JSON lines
    Run {
        /// Source file to execute
        file: PathBuf,
        /// Run registered tests after the module evaluates
        #[arg(long)]
        testing: bool,
        /// JSON argument array; runs the module's default export
        #[arg(long)]
        input: Option<String>,
        /// Per-job timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Prefix bare import specifiers with npm:/node:
        #[arg(long)]
        prefix_imports: bool,
        /// Print supervisor metrics to stderr when done
        #[arg(long)]
        metrics: bool,
    },
    /// Check that the execution runtime is installed
    CheckDeps {
        /// Verbose output showing resolved paths
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration and its validation result
    Config,
}

/// Execution host flags. Everything else comes from `CODEBOX_*` variables set
/// by the supervisor.
#[derive(Parser)]
#[command(author, version, about = "codebox execution host", long_about = None)]
struct HostCli {
    /// Verify the runtime and exit without serving jobs
    #[arg(long)]
    preflight: bool,
}

pub fn run(mode: CliMode) -> Result<()> {
    env_logger::init();
    match mode {
        CliMode::Client => run_client(Cli::parse()),
        CliMode::Host => run_host(HostCli::parse()),
    }
}

fn run_host(cli: HostCli) -> Result<()> {
    let config = SandboxConfig::from_env().context("invalid host configuration")?;
    let runtime = DenoRuntime::locate(&config.runtime_command)?;
    if cli.preflight {
        eprintln!("{} {}", runtime.command().display(), runtime.version());
        return Ok(());
    }
    log::info!(
        "host starting (root={}, mode={})",
        config.root_dir.display(),
        config.mode.as_str()
    );
    let host = Arc::new(ExecutionHost::new(config, Arc::new(runtime), get_metrics()));
    host.run(std::io::stdin(), std::io::stdout())?;
    log::info!("host input closed, exiting");
    Ok(())
}

fn load_config(root: Option<PathBuf>) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::from_env().context("invalid CODEBOX_* environment")?;
    if let Some(root) = root {
        config.root_dir = root;
    }
    Ok(config)
}

fn run_client(cli: Cli) -> Result<()> {
    let config = load_config(cli.root)?;
    match cli.command {
        Commands::Run {
            file,
            testing,
            input,
            timeout_ms,
            prefix_imports,
            metrics,
        } => {
            let mut config = config;
            if let Some(ms) = timeout_ms {
                config.job_timeout = Duration::from_millis(ms);
            }
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            if let Some(input) = input.as_deref() {
                serde_json::from_str::<serde_json::Value>(input)
                    .context("--input must be valid JSON")?;
            }
            run_file(config, &code, testing, input.as_deref(), prefix_imports, metrics)
        }
        Commands::CheckDeps { verbose } => check_dependencies(&config, verbose),
        Commands::Config => print_config(&config),
    }
}

fn run_file(
    config: SandboxConfig,
    code: &str,
    testing: bool,
    input: Option<&str>,
    prefix_imports: bool,
    print_metrics: bool,
) -> Result<()> {
    let ready_timeout = config.ready_timeout;
    let mut supervisor = Supervisor::new(config)?;
    if prefix_imports {
        supervisor = supervisor.with_transform(Arc::new(ImportPrefixTransform));
    }
    supervisor.wait_for_ready(ready_timeout)?;

    let mut terminal = None;
    for event in supervisor.execute_code(code, testing, input)? {
        if let Some(status) = event.terminal_status() {
            terminal = Some(status);
        }
        println!("{}", serde_json::to_string(&event)?);
    }

    if print_metrics {
        eprint!("{}", supervisor.metrics().export_prometheus());
    }
    supervisor.shutdown()?;

    match terminal {
        Some(JobStatus::Completed) | None => Ok(()),
        Some(status) => {
            eprintln!("job ended with status {}", status);
            std::process::exit(1);
        }
    }
}

fn check_dependencies(config: &SandboxConfig, verbose: bool) -> Result<()> {
    println!("Checking sandbox dependencies...");
    let mut all_ok = true;

    match DenoRuntime::locate(&config.runtime_command) {
        Ok(runtime) => {
            println!("✅ runtime - OK");
            if verbose {
                println!("  {} -> {}", runtime.command().display(), runtime.version());
            }
        }
        Err(e) => {
            println!("❌ runtime - MISSING");
            if verbose {
                println!("  {}", e);
            }
            all_ok = false;
        }
    }

    let host = crate::core::deno::resolve_binary(&config.host_command.to_string_lossy());
    match host {
        Some(path) => {
            println!("✅ host binary - OK");
            if verbose {
                println!("  {}", path.display());
            }
        }
        None => {
            println!("❌ host binary - MISSING");
            if verbose {
                println!("  looked for {}", config.host_command.display());
            }
            all_ok = false;
        }
    }

    if all_ok {
        println!("All dependencies are installed.");
        Ok(())
    } else {
        anyhow::bail!("missing dependencies")
    }
}

fn print_config(config: &SandboxConfig) -> Result<()> {
    for (key, value) in config.to_env_vars() {
        println!("{}={}", key, value);
    }
    let validation = validate_config(config)?;
    println!(
        "configuration is valid ({} warning(s))",
        validation.warnings.len()
    );
    Ok(())
}
