//! In-memory runtime for testing callers.
//!
//! [`MockRuntime`] implements the same state machine and errors as the real
//! backend without spawning anything. Any operation can be replaced with a
//! hook; a hook fully replaces the default behavior for that call.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::error::{Result, RuntimeError};
use super::types::{ExecRequest, ExecResult, Sandbox, SandboxConfig};
use super::{sort_snapshots, OutputSink, Runtime};

type CreateHook = Box<dyn Fn(&SandboxConfig) -> Result<Sandbox> + Send + Sync>;
type LifecycleHook = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;
type GetHook = Box<dyn Fn(&str) -> Result<Sandbox> + Send + Sync>;
type ListHook = Box<dyn Fn() -> Vec<Sandbox> + Send + Sync>;
type ExecHook = Box<dyn Fn(&str, &ExecRequest) -> Result<ExecResult> + Send + Sync>;
type StreamHook = Box<dyn Fn(&str, &ExecRequest, OutputSink) -> Result<ExecResult> + Send + Sync>;

/// A runtime that keeps sandboxes in a map and runs nothing.
#[derive(Default)]
pub struct MockRuntime {
    sandboxes: RwLock<HashMap<String, Sandbox>>,
    exec_calls: AtomicUsize,
    on_create: Option<CreateHook>,
    on_start: Option<LifecycleHook>,
    on_stop: Option<LifecycleHook>,
    on_destroy: Option<LifecycleHook>,
    on_get: Option<GetHook>,
    on_list: Option<ListHook>,
    on_exec: Option<ExecHook>,
    on_exec_stream: Option<StreamHook>,
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime")
            .field("sandboxes", &self.sandboxes.read().len())
            .field("exec_calls", &self.exec_calls())
            .finish_non_exhaustive()
    }
}

impl MockRuntime {
    /// Creates a mock with default behavior for every operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `create`.
    #[must_use]
    pub fn on_create(
        mut self,
        hook: impl Fn(&SandboxConfig) -> Result<Sandbox> + Send + Sync + 'static,
    ) -> Self {
        self.on_create = Some(Box::new(hook));
        self
    }

    /// Replaces `start`.
    #[must_use]
    pub fn on_start(mut self, hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Replaces `stop`.
    #[must_use]
    pub fn on_stop(mut self, hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Replaces `destroy`.
    #[must_use]
    pub fn on_destroy(mut self, hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        self.on_destroy = Some(Box::new(hook));
        self
    }

    /// Replaces `get`.
    #[must_use]
    pub fn on_get(mut self, hook: impl Fn(&str) -> Result<Sandbox> + Send + Sync + 'static) -> Self {
        self.on_get = Some(Box::new(hook));
        self
    }

    /// Replaces `list`.
    #[must_use]
    pub fn on_list(mut self, hook: impl Fn() -> Vec<Sandbox> + Send + Sync + 'static) -> Self {
        self.on_list = Some(Box::new(hook));
        self
    }

    /// Replaces `exec`.
    #[must_use]
    pub fn on_exec(
        mut self,
        hook: impl Fn(&str, &ExecRequest) -> Result<ExecResult> + Send + Sync + 'static,
    ) -> Self {
        self.on_exec = Some(Box::new(hook));
        self
    }

    /// Replaces `exec_stream`. The hook owns the sink and closes it by dropping it.
    #[must_use]
    pub fn on_exec_stream(
        mut self,
        hook: impl Fn(&str, &ExecRequest, OutputSink) -> Result<ExecResult> + Send + Sync + 'static,
    ) -> Self {
        self.on_exec_stream = Some(Box::new(hook));
        self
    }

    /// Number of `exec` and `exec_stream` calls that reached a running sandbox.
    pub fn exec_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    fn check_running(&self, id: &str) -> Result<()> {
        let sandboxes = self.sandboxes.read();
        let sandbox = sandboxes.get(id).ok_or_else(|| RuntimeError::not_found(id))?;
        if !sandbox.is_running() {
            return Err(RuntimeError::not_running(id));
        }
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, config: SandboxConfig) -> Result<Sandbox> {
        if let Some(hook) = &self.on_create {
            return hook(&config);
        }

        config.validate()?;
        let mut sandboxes = self.sandboxes.write();
        if sandboxes.contains_key(&config.id) {
            return Err(RuntimeError::already_exists(&config.id));
        }

        let sandbox = Sandbox::from_config(&config);
        sandboxes.insert(config.id, sandbox.clone());
        Ok(sandbox)
    }

    async fn start(&self, id: &str) -> Result<()> {
        if let Some(hook) = &self.on_start {
            return hook(id);
        }

        self.sandboxes
            .write()
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(id))?
            .mark_running()
    }

    async fn stop(&self, id: &str) -> Result<()> {
        if let Some(hook) = &self.on_stop {
            return hook(id);
        }

        self.sandboxes
            .write()
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(id))?
            .mark_stopped()
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        if let Some(hook) = &self.on_destroy {
            return hook(id);
        }

        self.sandboxes
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::not_found(id))
    }

    async fn get(&self, id: &str) -> Result<Sandbox> {
        if let Some(hook) = &self.on_get {
            return hook(id);
        }

        self.sandboxes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(id))
    }

    async fn list(&self) -> Vec<Sandbox> {
        if let Some(hook) = &self.on_list {
            return hook();
        }

        let mut sandboxes: Vec<Sandbox> = self.sandboxes.read().values().cloned().collect();
        sort_snapshots(&mut sandboxes);
        sandboxes
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecResult> {
        if let Some(hook) = &self.on_exec {
            return hook(id, &request);
        }

        self.check_running(id)?;
        Ok(ExecResult {
            duration: Duration::from_millis(1),
            ..Default::default()
        })
    }

    async fn exec_stream(
        &self,
        id: &str,
        request: ExecRequest,
        output: OutputSink,
    ) -> Result<ExecResult> {
        if let Some(hook) = &self.on_exec_stream {
            return hook(id, &request, output);
        }

        self.check_running(id)?;
        drop(output);
        Ok(ExecResult {
            duration: Duration::from_millis(1),
            ..Default::default()
        })
    }
}
