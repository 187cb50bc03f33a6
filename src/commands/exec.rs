//! Run one command in a throwaway sandbox.
//!
//! The sandbox is created, started, used once and destroyed. The process exit
//! code mirrors the command's; a timeout exits with 124 like `timeout(1)`.

use anyhow::Result;
use bytes::Bytes;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sandbox_rls::config::Config;
use sandbox_rls::runtime::{
    BwrapRuntime, ExecRequest, ExecResult, Result as RuntimeResult, Runtime, SandboxConfig,
};

/// Exit code reported when the command times out.
const TIMEOUT_EXIT_CODE: u8 = 124;

/// Arguments for `sandbox-rls exec`.
#[derive(Debug, clap::Args)]
pub(crate) struct ExecArgs {
    /// Host directory mounted as the codebase
    #[arg(long)]
    codebase: Option<PathBuf>,

    /// Where the codebase appears inside the sandbox (default: /workspace)
    #[arg(long)]
    mount_point: Option<PathBuf>,

    /// Working directory for the command
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Environment variable as KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Timeout in seconds (default: from config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Text passed to the command's stdin
    #[arg(long)]
    stdin: Option<String>,

    /// Print stdout as it is produced
    #[arg(long)]
    stream: bool,

    /// Print the result as JSON
    #[arg(long, conflicts_with = "stream")]
    json: bool,

    /// Command to run; a single argument is passed to the shell verbatim
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the exec command and returns the exit code to report.
pub(crate) async fn run(config: &Config, args: ExecArgs) -> Result<ExitCode> {
    let runtime = BwrapRuntime::new(config.runtime.clone());
    let id = format!("cli-{}", uuid::Uuid::new_v4());

    match execute(&runtime, &id, &args, config.runtime.stream_buffer).await {
        Ok(result) => {
            print_result(&id, &result, &args)?;
            Ok(ExitCode::from(exit_code(result.exit_code)))
        }
        Err(e) if e.is_timeout() => {
            eprintln!("{} {}", "✗".red(), e);
            Ok(ExitCode::from(TIMEOUT_EXIT_CODE))
        }
        Err(e) => Err(e.into()),
    }
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct JsonOutput<'a> {
    sandbox_id: &'a str,
    #[serde(flatten)]
    result: &'a ExecResult,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

/// Creates, starts, runs and destroys one sandbox. Once created, the sandbox
/// is destroyed however the rest goes.
async fn execute(
    runtime: &dyn Runtime,
    id: &str,
    args: &ExecArgs,
    buffer: usize,
) -> RuntimeResult<ExecResult> {
    runtime.create(sandbox_config(id, args)).await?;

    let outcome = match runtime.start(id).await {
        Ok(()) => {
            let request = exec_request(args);
            debug!("Executing {:?} in {}", request.command, id);
            if args.stream {
                stream(runtime, id, request, buffer).await
            } else {
                runtime.exec(id, request).await
            }
        }
        Err(e) => Err(e),
    };

    if let Err(e) = runtime.destroy(id).await {
        warn!("Failed to destroy sandbox {}: {}", id, e);
    }
    outcome
}

fn sandbox_config(id: &str, args: &ExecArgs) -> SandboxConfig {
    let mut config = SandboxConfig::new(id).label("origin", "cli");
    config.codebase_path.clone_from(&args.codebase);
    config.mount_point.clone_from(&args.mount_point);
    config
}

fn exec_request(args: &ExecArgs) -> ExecRequest {
    ExecRequest {
        command: command_line(&args.command),
        env: args.env.iter().cloned().collect(),
        work_dir: args.workdir.clone(),
        stdin: args.stdin.clone(),
        timeout: args.timeout.map(Duration::from_secs),
    }
}

/// A single word is shell text; several are quoted and joined.
fn command_line(words: &[String]) -> String {
    match words {
        [single] => single.clone(),
        _ => shell_words::join(words),
    }
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Copies streamed chunks to stdout while the command runs.
async fn stream(
    runtime: &dyn Runtime,
    id: &str,
    request: ExecRequest,
    buffer: usize,
) -> RuntimeResult<ExecResult> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(buffer.max(1));

    let printer = async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = rx.recv().await {
            let written = async {
                stdout.write_all(&chunk).await?;
                stdout.flush().await
            };
            if let Err(e) = written.await {
                // Dropping the receiver stops the forwarder.
                warn!("Stopped printing output: {}", e);
                break;
            }
        }
    };

    let (result, ()) = tokio::join!(runtime.exec_stream(id, request, tx), printer);
    result
}

fn print_result(id: &str, result: &ExecResult, args: &ExecArgs) -> Result<()> {
    if args.json {
        let out = serde_json::to_string_pretty(&JsonOutput {
            sandbox_id: id,
            result,
        })?;
        println!("{out}");
        return Ok(());
    }

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    Ok(())
}

/// Codes outside 0..=255 (signal deaths) become 1.
fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
