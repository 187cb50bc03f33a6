//! Data types shared by every runtime backend.
//!
//! These are passive records: the runtime owns the authoritative copy of each
//! [`Sandbox`] and hands out clones, so nothing a caller does to a returned
//! value can reach back into backend state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{Result, RuntimeError};

/// Mount point used when a config does not name one.
pub const DEFAULT_MOUNT_POINT: &str = "/workspace";

/// Lifecycle status of a sandbox.
///
/// A destroyed sandbox has no status: it is simply absent from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Created but never started.
    Pending,
    /// Accepting exec calls.
    Running,
    /// Stopped after running; may be started again.
    Stopped,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Access granted to paths matching a [`PermissionRule`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Path is hidden.
    #[default]
    None,
    /// Path is listed but its content is hidden.
    View,
    /// Path is readable.
    Read,
    /// Path is readable and writable.
    Write,
}

/// A filesystem visibility rule. The runtime stores these without reading them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Glob pattern relative to the codebase root.
    pub pattern: String,
    /// Access for matching paths.
    pub access: AccessLevel,
}

/// Resource quotas accepted at creation time.
///
/// Validated and recorded, not enforced by this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit such as `"512m"` or `"8g"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU share, e.g. `1.5`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    /// Maximum number of processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u32>,
}

impl ResourceLimits {
    /// Parses the memory limit into bytes, if one is set.
    pub fn memory_bytes(&self) -> Result<Option<u64>> {
        self.memory.as_deref().map(parse_memory_limit).transpose()
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<u64> {
    let limit = limit.trim().to_lowercase();
    let invalid = || RuntimeError::invalid_config(format!("invalid memory limit: {limit:?}"));

    let (digits, multiplier) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Creation-time definition of a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Caller-assigned unique identifier.
    pub id: String,
    /// Opaque reference to the mounted code.
    #[serde(default)]
    pub codebase_id: String,
    /// Host directory backing the codebase. Must exist when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codebase_path: Option<PathBuf>,
    /// Visibility rules, passed through untouched.
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
    /// Caller metadata.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Where the codebase appears inside the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
    /// Resource quotas.
    #[serde(default)]
    pub resources: ResourceLimits,
}

impl SandboxConfig {
    /// Creates a config with the given ID and everything else defaulted.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sets the host codebase path.
    #[must_use]
    pub fn codebase_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.codebase_path = Some(path.into());
        self
    }

    /// Sets the in-sandbox mount point.
    #[must_use]
    pub fn mount_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(path.into());
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Mount point with the default applied.
    pub fn effective_mount_point(&self) -> &Path {
        self.mount_point
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new(DEFAULT_MOUNT_POINT))
    }

    /// Codebase path, treating an empty path as unset.
    pub fn host_codebase(&self) -> Option<&Path> {
        self.codebase_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Checks the config before anything is registered.
    ///
    /// An ID that is empty or only whitespace is rejected, as is a codebase
    /// path that does not exist or an unparsable memory limit.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RuntimeError::invalid_config("sandbox ID is required"));
        }

        if let Some(path) = self.host_codebase() {
            if !path.exists() {
                return Err(RuntimeError::invalid_config(format!(
                    "codebase path does not exist: {}",
                    path.display()
                )));
            }
        }

        self.resources.memory_bytes()?;
        Ok(())
    }
}

/// The record of an isolated environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Unique identifier.
    pub id: String,
    /// Opaque codebase reference.
    pub codebase_id: String,
    /// Visibility rules.
    pub permissions: Vec<PermissionRule>,
    /// Current lifecycle status.
    pub status: SandboxStatus,
    /// Caller metadata.
    pub labels: BTreeMap<String, String>,
    /// When `create` registered the sandbox.
    pub created_at: DateTime<Utc>,
    /// When the sandbox last entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the sandbox last entered `Stopped`.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Where the codebase is visible inside the sandbox.
    pub mount_point: PathBuf,
}

impl Sandbox {
    /// Builds the `Pending` record for a validated config.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            id: config.id.clone(),
            codebase_id: config.codebase_id.clone(),
            permissions: config.permissions.clone(),
            status: SandboxStatus::Pending,
            labels: config.labels.clone(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            mount_point: config.effective_mount_point().to_path_buf(),
        }
    }

    /// Returns true while exec calls are accepted.
    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }

    /// Applies `Pending|Stopped -> Running`.
    pub(crate) fn mark_running(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(RuntimeError::already_running(&self.id));
        }
        self.status = SandboxStatus::Running;
        self.started_at = Some(Utc::now());
        self.stopped_at = None;
        Ok(())
    }

    /// Applies `Running -> Stopped`.
    pub(crate) fn mark_stopped(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(RuntimeError::not_running(&self.id));
        }
        self.status = SandboxStatus::Stopped;
        self.stopped_at = Some(Utc::now());
        Ok(())
    }
}

/// A single command to run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Shell command text, run with `/bin/sh -c`.
    pub command: String,
    /// Variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// Working directory override.
    pub work_dir: Option<PathBuf>,
    /// Text written to the command's stdin.
    pub stdin: Option<String>,
    /// Deadline; `None` or zero uses the backend default.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// Creates a request for the given shell command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Sets stdin content.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Timeout to apply, falling back to `default` for `None` or zero.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.filter(|t| !t.is_zero()).unwrap_or(default)
    }
}

/// Outcome of a command that ran to completion.
///
/// A non-zero `exit_code` is still a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Captured stdout. Empty for streamed executions.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    /// Wall time from spawn to exit.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ExecResult {
    /// Returns true for exit code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
