//! Child process plumbing shared by the isolated and compatibility paths.
//!
//! Every child runs in its own process group so that termination reaches
//! anything it spawned. An [`Execution`] owns the child from spawn to reap and
//! races it against the request deadline and the sandbox cancellation token.

use bytes::Bytes;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{Result, RuntimeError};
use super::types::ExecResult;
use super::{OutputSink, STREAM_CHUNK_SIZE};

/// Why a bounded wait ended before the work did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Timeout,
    Cancelled,
}

/// A spawned command bounded by a deadline and a cancellation token.
pub(crate) struct Execution {
    child: Child,
    pgid: Option<u32>,
    sandbox_id: String,
    cancel: CancellationToken,
    started: Instant,
    deadline: Instant,
    timeout: Duration,
}

impl Execution {
    /// Spawns `command` with piped output and, when given, piped stdin.
    pub(crate) fn spawn(
        mut command: Command,
        stdin: Option<String>,
        sandbox_id: &str,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<Self> {
        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::spawn(program, e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                // Commands that exit without reading stdin close the pipe early.
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!("stdin not fully written: {}", e);
                }
            });
        }

        Ok(Self {
            pgid: child.id(),
            child,
            sandbox_id: sandbox_id.to_string(),
            cancel,
            started,
            deadline: deadline_after(started, timeout),
            timeout,
        })
    }

    /// Process group ID of the child, if it is still known.
    pub(crate) fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    /// Waits for the command and returns its buffered output.
    pub(crate) async fn output(mut self) -> Result<ExecResult> {
        let waited = bounded(collect(&mut self.child), self.deadline, &self.cancel).await;

        let (status, stdout, stderr) = match waited {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(self.fail(e).await),
            Err(why) => return Err(self.interrupt(why).await),
        };

        let duration = self.started.elapsed();
        self.classify(status)?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code(status),
            duration,
        })
    }

    /// Waits for the command while forwarding its stdout into `sink`.
    pub(crate) async fn stream(mut self, sink: OutputSink) -> Result<ExecResult> {
        let forwarder = tokio::spawn(forward(
            self.child.stdout.take(),
            sink,
            self.cancel.clone(),
        ));
        let stderr = self.child.stderr.take();

        let waited = bounded(
            wait_with_stderr(&mut self.child, stderr),
            self.deadline,
            &self.cancel,
        )
        .await;

        let (status, stderr) = match waited {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let err = self.fail(e).await;
                join(forwarder).await;
                return Err(err);
            }
            Err(why) => {
                let err = self.interrupt(why).await;
                join(forwarder).await;
                return Err(err);
            }
        };

        let duration = self.started.elapsed();

        // Deliver whatever the command wrote before it exited.
        if let Err(why) = bounded(join(forwarder), self.deadline, &self.cancel).await {
            return Err(self.interrupt(why).await);
        }

        self.classify(status)?;

        Ok(ExecResult {
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code(status),
            duration,
        })
    }

    /// A failing exit observed at or past the deadline counts as a timeout.
    fn classify(&self, status: ExitStatus) -> Result<()> {
        if !status.success() && self.expired() {
            return Err(RuntimeError::timeout(self.timeout));
        }
        debug!(
            "command in {} exited with {:?} after {:?}",
            self.sandbox_id,
            status.code(),
            self.started.elapsed()
        );
        Ok(())
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    async fn fail(&mut self, source: io::Error) -> RuntimeError {
        self.terminate().await;
        if self.expired() {
            RuntimeError::timeout(self.timeout)
        } else {
            RuntimeError::io("reading command output", source)
        }
    }

    async fn interrupt(&mut self, why: Interrupt) -> RuntimeError {
        self.terminate().await;
        match why {
            Interrupt::Timeout => {
                debug!("command in {} timed out after {:?}", self.sandbox_id, self.timeout);
                RuntimeError::timeout(self.timeout)
            }
            Interrupt::Cancelled => RuntimeError::cancelled(&self.sandbox_id),
        }
    }

    /// Stops output forwarding, kills the process group and reaps the child.
    async fn terminate(&mut self) {
        self.cancel.cancel();
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
        // Fails harmlessly when the child has already been reaped.
        let _ = self.child.start_kill();
        if let Err(e) = self.child.wait().await {
            warn!("failed to reap command in {}: {}", self.sandbox_id, e);
        }
    }
}

impl Drop for Execution {
    /// Runs on completion and when the owning future is abandoned. Either way
    /// nothing from the group outlives the execution.
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

/// Sends SIGKILL to a process group. A group that is already gone is ignored.
#[cfg(unix)]
pub(crate) fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pgid: u32) {}

/// Drives `work` until it completes, `deadline` passes, or `cancel` fires.
///
/// The deadline is checked first so that expiry wins any tie.
pub(crate) async fn bounded<F: Future>(
    work: F,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        () = tokio::time::sleep_until(deadline) => Err(Interrupt::Timeout),
        () = cancel.cancelled() => Err(Interrupt::Cancelled),
        out = work => Ok(out),
    }
}

/// Copies `reader` into `sink` in chunks of at most [`STREAM_CHUNK_SIZE`]
/// bytes until EOF, a read failure, a dropped receiver, or cancellation.
///
/// The sink is dropped, and so closed, when this returns.
pub(crate) async fn forward<R>(reader: Option<R>, sink: OutputSink, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("stopped streaming output: {}", e);
                    return;
                }
            },
        };

        tokio::select! {
            () = cancel.cancelled() => return,
            sent = sink.send(Bytes::copy_from_slice(&buf[..n])) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn collect(child: &mut Child) -> io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::try_join!(child.wait(), read_all(stdout), read_all(stderr))
}

async fn wait_with_stderr(
    child: &mut Child,
    stderr: Option<ChildStderr>,
) -> io::Result<(ExitStatus, Vec<u8>)> {
    tokio::try_join!(child.wait(), read_all(stderr))
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

async fn join(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!("output forwarder failed: {}", e);
    }
}

/// Exit code, or -1 for a signal death.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + Duration::from_secs(60 * 60 * 24 * 365))
}
