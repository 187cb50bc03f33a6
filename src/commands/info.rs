//! Show which backend the host supports and the effective configuration.

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use std::path::PathBuf;

use sandbox_rls::config::{Config, RuntimeConfig};
use sandbox_rls::runtime::{BwrapRuntime, Runtime};

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the info command.
pub(crate) fn run(config: &Config, json: bool) -> Result<()> {
    let runtime = BwrapRuntime::new(config.runtime.clone());
    let report = InfoReport {
        backend: runtime.name(),
        isolation: runtime.is_isolated(),
        bwrap: runtime.capabilities().bwrap.clone(),
        runtime: runtime.config(),
    };

    if json {
        let out = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{out}");
    } else {
        print!("{}", format_report(&report));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct InfoReport<'a> {
    backend: &'static str,
    isolation: bool,
    bwrap: Option<PathBuf>,
    runtime: &'a RuntimeConfig,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn format_report(report: &InfoReport<'_>) -> String {
    let mut out = String::new();
    let isolation = if report.isolation {
        "enabled".green().bold()
    } else {
        "unavailable (compatibility mode)".yellow()
    };
    let bwrap = report.bwrap.as_ref().map_or_else(
        || format!("{} (not found)", report.runtime.bwrap_path),
        |p| p.display().to_string(),
    );
    let network = if report.runtime.enable_networking {
        "enabled"
    } else {
        "isolated"
    };

    writeln!(&mut out, "  Backend:    {}", report.backend.cyan()).unwrap();
    writeln!(&mut out, "  Isolation:  {isolation}").unwrap();
    writeln!(&mut out, "  bwrap:      {}", bwrap.cyan()).unwrap();
    writeln!(
        &mut out,
        "  Timeout:    {}",
        format!("{}s", report.runtime.default_timeout_secs).cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Work dir:   {}",
        report.runtime.work_dir.display().to_string().cyan()
    )
    .unwrap();
    writeln!(&mut out, "  Network:    {}", network.cyan()).unwrap();
    out
}
