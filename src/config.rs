//! Configuration file loading.
//!
//! Settings live in `sandbox-rls.toml`. Every field has a default, so a
//! missing file or a partial one is fine.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the project-local config file.
pub const CONFIG_FILE: &str = "sandbox-rls.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Runtime backend settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend configuration. Fixed once a runtime has been constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path or name of the bubblewrap binary.
    #[serde(default = "default_bwrap_path")]
    pub bwrap_path: String,

    /// Timeout applied when a request does not set one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Base working directory for commands with no codebase.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Keep the host network visible inside sandboxes.
    #[serde(default)]
    pub enable_networking: bool,

    /// Channel capacity for streamed output.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bwrap_path: default_bwrap_path(),
            default_timeout_secs: default_timeout_secs(),
            work_dir: default_work_dir(),
            enable_networking: false,
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl RuntimeConfig {
    /// The default timeout as a `Duration`. Zero falls back to 30 seconds.
    pub fn default_timeout(&self) -> Duration {
        match self.default_timeout_secs {
            0 => Duration::from_secs(default_timeout_secs()),
            secs => Duration::from_secs(secs),
        }
    }

    /// Rejects settings that would make every command fail.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            bail!("runtime.default_timeout_secs must be greater than zero");
        }
        if self.bwrap_path.trim().is_empty() {
            bail!("runtime.bwrap_path must not be empty");
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

// Default value functions
fn default_bwrap_path() -> String {
    "bwrap".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/sandbox-rls")
}

fn default_stream_buffer() -> usize {
    64
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration.
    ///
    /// An explicit path must exist. Otherwise `./sandbox-rls.toml` is tried,
    /// then `<config dir>/sandbox-rls/config.toml`, then defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }

        let candidates = [
            Some(PathBuf::from(CONFIG_FILE)),
            dirs::config_dir().map(|dir| dir.join("sandbox-rls").join("config.toml")),
        ];

        for path in candidates.into_iter().flatten() {
            if path.exists() {
                return Self::load_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Loads configuration from a specific file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .runtime
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }
}
