//! Host capability detection.

use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// What the host offers for isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCapabilities {
    /// Resolved path of the isolation helper, when found.
    pub bwrap: Option<PathBuf>,
    /// Whether the OS supports namespace unsharing.
    pub namespaces: bool,
}

impl HostCapabilities {
    /// Probes the host for the given helper binary.
    pub fn detect(bwrap_path: &str) -> Self {
        let bwrap = which::which(bwrap_path).ok();
        if bwrap.is_none() {
            debug!("{} not found on this host", bwrap_path);
        }

        Self {
            bwrap,
            namespaces: cfg!(target_os = "linux"),
        }
    }

    /// True when commands can run under the isolation helper.
    pub fn isolation(&self) -> bool {
        self.namespaces && self.bwrap.is_some()
    }
}

/// Returns true if `bwrap_path` resolves to an executable and the host is Linux.
pub fn is_isolation_available(bwrap_path: &str) -> bool {
    HostCapabilities::detect(bwrap_path).isolation()
}
