use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sandbox_rls::config::{Config, LogFormat, LoggingConfig};

mod commands;

#[derive(Parser)]
#[command(name = "sandbox-rls")]
#[command(
    author,
    version,
    about = "Run commands in isolated sandboxes against a mounted codebase"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a config file (default: ./sandbox-rls.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path or name of the bubblewrap binary
    #[arg(long, global = true, env = "SANDBOX_RLS_BWRAP")]
    bwrap_path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the selected backend and effective configuration
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a command in a throwaway sandbox
    Exec(commands::exec::ExecArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(path) = cli.bwrap_path {
        config.runtime.bwrap_path = path;
    }

    init_logging(&config.logging, cli.verbose);

    match cli.command {
        Commands::Info { json } => {
            commands::info::run(&config, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Exec(args) => commands::exec::run(&config, args).await,
    }
}

/// Logs go to stderr so command output on stdout stays clean.
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sandbox_rls=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("sandbox_rls={}", logging.level)))
    };

    let (text, json) = match logging.format {
        LogFormat::Text => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };

    tracing_subscriber::registry()
        .with(text)
        .with(json)
        .with(filter)
        .init();
}
