//! Sandbox runtimes.
//!
//! A [`Runtime`] creates sandboxes, moves them through their lifecycle and
//! executes commands inside them. Callers depend on the trait only:
//!
//! - [`BwrapRuntime`]: bubblewrap isolation on Linux, with a direct-process
//!   compatibility path when bubblewrap is unavailable.
//! - [`MockRuntime`]: in-memory state machine with per-operation hooks.
//!
//! Lifecycle: `Pending --start--> Running --stop--> Stopped --start--> Running`,
//! and `destroy` removes a sandbox from any state. `exec` and `exec_stream`
//! require `Running`.

mod bwrap;
mod error;
mod mock;
mod probe;
mod process;
mod types;

pub use bwrap::BwrapRuntime;
pub use error::{Result, RuntimeError};
pub use mock::MockRuntime;
pub use probe::{is_isolation_available, HostCapabilities};
pub use types::{
    AccessLevel, ExecRequest, ExecResult, PermissionRule, ResourceLimits, Sandbox, SandboxConfig,
    SandboxStatus, DEFAULT_MOUNT_POINT,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Receives streamed stdout chunks. Dropping the last sender closes the stream.
pub type OutputSink = mpsc::Sender<Bytes>;

/// Size of the chunks delivered to an [`OutputSink`].
pub const STREAM_CHUNK_SIZE: usize = 4096;

/// Contract implemented by every sandbox backend.
///
/// All methods are safe to call concurrently, including for the same sandbox.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Returns the backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Registers a new sandbox in `Pending` state. No process is started.
    async fn create(&self, config: SandboxConfig) -> Result<Sandbox>;

    /// Moves a sandbox to `Running`.
    async fn start(&self, id: &str) -> Result<()>;

    /// Moves a running sandbox to `Stopped`, killing any in-flight command.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Removes a sandbox in any state, killing any in-flight command.
    async fn destroy(&self, id: &str) -> Result<()>;

    /// Returns a snapshot of one sandbox.
    async fn get(&self, id: &str) -> Result<Sandbox>;

    /// Returns snapshots of every sandbox, oldest first.
    async fn list(&self) -> Vec<Sandbox>;

    /// Runs a command to completion and returns its captured output.
    ///
    /// A non-zero exit code is not an error.
    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecResult>;

    /// Runs a command, forwarding stdout to `output` as it is produced.
    ///
    /// `output` is closed on every return path. The returned result has an
    /// empty `stdout`; stderr is still captured.
    async fn exec_stream(
        &self,
        id: &str,
        request: ExecRequest,
        output: OutputSink,
    ) -> Result<ExecResult>;
}

/// Sorts snapshots oldest first, breaking ties by ID.
pub(crate) fn sort_snapshots(sandboxes: &mut [Sandbox]) {
    sandboxes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
