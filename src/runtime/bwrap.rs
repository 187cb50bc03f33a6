//! Bubblewrap sandbox runtime.
//!
//! On Linux with `bwrap` installed each command runs under bubblewrap with a
//! read-only view of the system directories, private `/proc`, `/dev` and
//! `/tmp`, fresh PID/UTS/IPC (and by default network) namespaces, and the
//! codebase bound read-write at the sandbox mount point.
//!
//! Elsewhere the runtime falls back to a compatibility mode that runs the
//! command directly on the host in its own process group. Lifecycle and
//! error behavior are identical in both modes.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{Result, RuntimeError};
use super::probe::HostCapabilities;
use super::process::{kill_group, Execution};
use super::types::{ExecRequest, ExecResult, Sandbox, SandboxConfig};
use super::{sort_snapshots, OutputSink, Runtime};
use crate::config::RuntimeConfig;

/// Shell used to interpret request commands.
const SHELL: &str = "/bin/sh";

/// Host directories exposed read-only inside the sandbox.
const SYSTEM_READ_ONLY_PATHS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin"];

/// Registry entry for one sandbox.
struct SandboxState {
    sandbox: Sandbox,
    config: SandboxConfig,
    /// Process groups of commands currently running.
    processes: HashSet<u32>,
    /// Present while running; cancelled by stop and destroy.
    cancel: Option<CancellationToken>,
}

impl SandboxState {
    /// Cancels in-flight commands and kills their process groups.
    fn interrupt(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        for pgid in self.processes.drain() {
            kill_group(pgid);
        }
    }
}

/// What a command needs from the registry, copied out under the read lock.
struct Launch {
    config: SandboxConfig,
    cancel: CancellationToken,
}

/// Removes a process group from the registry when the exec call ends,
/// including when its future is dropped before completion.
struct Tracked<'a> {
    states: &'a RwLock<HashMap<String, SandboxState>>,
    id: &'a str,
    pgid: Option<u32>,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            if let Some(state) = self.states.write().get_mut(self.id) {
                state.processes.remove(&pgid);
            }
        }
    }
}

/// Runtime backed by bubblewrap, or direct execution when bubblewrap is missing.
pub struct BwrapRuntime {
    config: RuntimeConfig,
    capabilities: HostCapabilities,
    states: RwLock<HashMap<String, SandboxState>>,
}

impl BwrapRuntime {
    /// Creates a runtime, probing the host once for isolation support.
    pub fn new(config: RuntimeConfig) -> Self {
        let capabilities = HostCapabilities::detect(&config.bwrap_path);
        if capabilities.isolation() {
            info!("Using bubblewrap isolation");
        } else {
            info!("bubblewrap unavailable, running sandboxes in compatibility mode");
        }

        Self {
            config,
            capabilities,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Returns true when commands run under bubblewrap.
    pub fn is_isolated(&self) -> bool {
        self.capabilities.isolation()
    }

    /// The probed host capabilities.
    pub fn capabilities(&self) -> &HostCapabilities {
        &self.capabilities
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn launch(&self, id: &str) -> Result<Launch> {
        let states = self.states.read();
        let state = states.get(id).ok_or_else(|| RuntimeError::not_found(id))?;

        if !state.sandbox.is_running() {
            return Err(RuntimeError::not_running(id));
        }

        Ok(Launch {
            config: state.config.clone(),
            cancel: state
                .cancel
                .as_ref()
                .map_or_else(CancellationToken::new, CancellationToken::child_token),
        })
    }

    /// Records a spawned process group so stop and destroy can kill it.
    fn track(&self, id: &str, pgid: u32, cancel: &CancellationToken) {
        let mut states = self.states.write();
        match states.get_mut(id) {
            Some(state) if !cancel.is_cancelled() => {
                state.processes.insert(pgid);
            }
            // Stopped or destroyed between lookup and spawn.
            _ => cancel.cancel(),
        }
    }

    fn tracked<'a>(&'a self, id: &'a str, execution: &Execution) -> Tracked<'a> {
        Tracked {
            states: &self.states,
            id,
            pgid: execution.pgid(),
        }
    }

    fn spawn(&self, id: &str, request: ExecRequest) -> Result<Execution> {
        let launch = self.launch(id)?;
        let timeout = request.effective_timeout(self.config.default_timeout());
        let command = self.build_command(&launch.config, &request);

        debug!("Running in {}: {}", id, request.command);
        let execution = Execution::spawn(
            command,
            request.stdin,
            id,
            launch.cancel.clone(),
            timeout,
        )?;

        if let Some(pgid) = execution.pgid() {
            self.track(id, pgid, &launch.cancel);
        }
        Ok(execution)
    }

    fn build_command(&self, config: &SandboxConfig, request: &ExecRequest) -> Command {
        let mut command = if self.is_isolated() {
            let program = self
                .capabilities
                .bwrap
                .as_deref()
                .map_or_else(|| OsString::from(&self.config.bwrap_path), |p| p.into());
            let mut command = Command::new(program);
            command.args(bwrap_args(&self.config, config, request));
            command
        } else {
            local_command(&self.config, config, request)
        };

        // Inherited environment is the base; request entries win.
        command.envs(&request.env);
        command
    }
}

/// Arguments for `bwrap` that run `request` inside the sandbox.
fn bwrap_args(
    runtime: &RuntimeConfig,
    config: &SandboxConfig,
    request: &ExecRequest,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    // Missing directories (e.g. /lib64 on some distros) are skipped.
    for path in SYSTEM_READ_ONLY_PATHS {
        args.extend(["--ro-bind-try", *path, *path].map(OsString::from));
    }

    args.extend(
        [
            "--proc",
            "/proc",
            "--dev",
            "/dev",
            "--tmpfs",
            "/tmp",
            "--unshare-pid",
            "--unshare-uts",
            "--unshare-ipc",
        ]
        .map(OsString::from),
    );

    if !runtime.enable_networking {
        args.push("--unshare-net".into());
    }

    args.push("--die-with-parent".into());

    let mount_point = config.effective_mount_point();
    if let Some(codebase) = config.host_codebase() {
        args.push("--bind".into());
        args.push(codebase.into());
        args.push(mount_point.into());
    }

    if let Some(dir) = request.work_dir.as_deref() {
        args.push("--chdir".into());
        args.push(dir.into());
    } else if config.host_codebase().is_some() {
        args.push("--chdir".into());
        args.push(mount_point.into());
    }

    args.extend([SHELL, "-c", request.command.as_str()].map(OsString::from));
    args
}

/// Runs `request` directly on the host.
fn local_command(runtime: &RuntimeConfig, config: &SandboxConfig, request: &ExecRequest) -> Command {
    let mut command = Command::new(SHELL);
    command.arg("-c").arg(&request.command);
    if let Some(dir) = local_work_dir(runtime, config, request) {
        command.current_dir(dir);
    }
    command
}

/// Request override, then codebase, then the configured base directory if it exists.
fn local_work_dir<'a>(
    runtime: &'a RuntimeConfig,
    config: &'a SandboxConfig,
    request: &'a ExecRequest,
) -> Option<&'a Path> {
    request
        .work_dir
        .as_deref()
        .or_else(|| config.host_codebase())
        .or_else(|| Some(runtime.work_dir.as_path()).filter(|dir| dir.is_dir()))
}

#[async_trait]
impl Runtime for BwrapRuntime {
    fn name(&self) -> &'static str {
        if self.is_isolated() {
            "bwrap"
        } else {
            "bwrap-compat"
        }
    }

    async fn create(&self, config: SandboxConfig) -> Result<Sandbox> {
        config.validate()?;

        let mut states = self.states.write();
        if states.contains_key(&config.id) {
            return Err(RuntimeError::already_exists(&config.id));
        }

        if let Some(bytes) = config.resources.memory_bytes()? {
            debug!("Sandbox {} memory limit recorded: {} bytes", config.id, bytes);
        }

        let sandbox = Sandbox::from_config(&config);
        info!("Created sandbox {}", sandbox.id);
        states.insert(
            config.id.clone(),
            SandboxState {
                sandbox: sandbox.clone(),
                config,
                processes: HashSet::new(),
                cancel: None,
            },
        );
        Ok(sandbox)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut states = self.states.write();
        let state = states.get_mut(id).ok_or_else(|| RuntimeError::not_found(id))?;

        // Commands are spawned per exec, so there is nothing to launch here.
        state.sandbox.mark_running()?;
        state.cancel = Some(CancellationToken::new());
        info!("Started sandbox {}", id);
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut states = self.states.write();
        let state = states.get_mut(id).ok_or_else(|| RuntimeError::not_found(id))?;

        state.sandbox.mark_stopped()?;
        state.interrupt();
        info!("Stopped sandbox {}", id);
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        let mut states = self.states.write();
        let mut state = states.remove(id).ok_or_else(|| RuntimeError::not_found(id))?;

        state.interrupt();
        info!("Destroyed sandbox {}", id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Sandbox> {
        self.states
            .read()
            .get(id)
            .map(|state| state.sandbox.clone())
            .ok_or_else(|| RuntimeError::not_found(id))
    }

    async fn list(&self) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self
            .states
            .read()
            .values()
            .map(|state| state.sandbox.clone())
            .collect();
        sort_snapshots(&mut sandboxes);
        sandboxes
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecResult> {
        let execution = self.spawn(id, request)?;
        let _tracked = self.tracked(id, &execution);

        execution.output().await
    }

    async fn exec_stream(
        &self,
        id: &str,
        request: ExecRequest,
        output: OutputSink,
    ) -> Result<ExecResult> {
        // Early returns drop `output`, which closes it.
        let execution = self.spawn(id, request)?;
        let _tracked = self.tracked(id, &execution);

        execution.stream(output).await
    }
}
