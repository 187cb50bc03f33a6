//! End-to-end tests for the bubblewrap runtime in compatibility mode.
//!
//! Pointing `bwrap_path` at a missing binary forces the direct-process path,
//! so these run on any Unix host with `/bin/sh`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sandbox_rls::config::RuntimeConfig;
use sandbox_rls::runtime::{
    BwrapRuntime, ExecRequest, Runtime, SandboxConfig, SandboxStatus, STREAM_CHUNK_SIZE,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

fn compat_runtime() -> BwrapRuntime {
    BwrapRuntime::new(RuntimeConfig {
        bwrap_path: "/nonexistent/bwrap".to_string(),
        default_timeout_secs: 10,
        ..Default::default()
    })
}

async fn running(runtime: &BwrapRuntime, id: &str) {
    runtime.create(SandboxConfig::new(id)).await.unwrap();
    runtime.start(id).await.unwrap();
}

async fn collect(mut rx: mpsc::Receiver<Bytes>) -> (Vec<u8>, usize) {
    let mut data = Vec::new();
    let mut chunks = 0;
    while let Some(chunk) = rx.recv().await {
        assert!(chunk.len() <= STREAM_CHUNK_SIZE);
        data.extend_from_slice(&chunk);
        chunks += 1;
    }
    (data, chunks)
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_create_reports_pending() {
    let runtime = compat_runtime();
    let created = runtime
        .create(SandboxConfig::new("sb").label("owner", "ci"))
        .await
        .unwrap();
    assert_eq!(created.status, SandboxStatus::Pending);

    let fetched = runtime.get("sb").await.unwrap();
    assert_eq!(fetched.status, SandboxStatus::Pending);
    assert!(fetched.started_at.is_none());
    assert!(fetched.stopped_at.is_none());
    assert_eq!(fetched.labels["owner"], "ci");
    assert_eq!(fetched.mount_point.to_str(), Some("/workspace"));
}

#[tokio::test]
async fn test_create_rejects_duplicate_and_empty_ids() {
    let runtime = compat_runtime();
    runtime.create(SandboxConfig::new("sb")).await.unwrap();

    let err = runtime.create(SandboxConfig::new("sb")).await.unwrap_err();
    assert!(err.is_already_exists());

    let err = runtime.create(SandboxConfig::new("")).await.unwrap_err();
    assert!(err.is_invalid_config());
    assert_eq!(runtime.list().await.len(), 1);
}

#[tokio::test]
async fn test_create_rejects_missing_codebase() {
    let runtime = compat_runtime();
    let err = runtime
        .create(SandboxConfig::new("sb").codebase_path("/no/such/codebase"))
        .await
        .unwrap_err();
    assert!(err.is_invalid_config());
    assert!(runtime.get("sb").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_start_twice_keeps_started_at() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;
    let started_at = runtime.get("sb").await.unwrap().started_at;
    assert!(started_at.is_some());

    let err = runtime.start("sb").await.unwrap_err();
    assert!(err.is_already_running());
    assert_eq!(runtime.get("sb").await.unwrap().started_at, started_at);
}

#[tokio::test]
async fn test_stop_requires_running() {
    let runtime = compat_runtime();
    runtime.create(SandboxConfig::new("sb")).await.unwrap();
    assert!(runtime.stop("sb").await.unwrap_err().is_not_running());

    runtime.start("sb").await.unwrap();
    runtime.stop("sb").await.unwrap();
    let sandbox = runtime.get("sb").await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Stopped);
    assert!(sandbox.stopped_at.is_some());
}

#[tokio::test]
async fn test_destroy_removes_sandbox() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;
    runtime.destroy("sb").await.unwrap();

    assert!(runtime.get("sb").await.unwrap_err().is_not_found());
    assert!(runtime.start("sb").await.unwrap_err().is_not_found());
    assert!(runtime.stop("sb").await.unwrap_err().is_not_found());
    assert!(runtime.destroy("sb").await.unwrap_err().is_not_found());
    assert!(runtime
        .exec("sb", ExecRequest::new("true"))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_list_returns_snapshots() {
    let runtime = compat_runtime();
    assert!(runtime.list().await.is_empty());

    running(&runtime, "a").await;
    runtime.create(SandboxConfig::new("b")).await.unwrap();

    let mut snapshot = runtime.list().await;
    assert_eq!(snapshot.len(), 2);

    // Mutating a snapshot does not reach the runtime.
    snapshot[0].status = SandboxStatus::Stopped;
    snapshot[0].labels.insert("x".into(), "y".into());
    let fresh = runtime.get(&snapshot[0].id).await.unwrap();
    assert!(fresh.labels.is_empty());
    assert_ne!(fresh, snapshot[0]);
}

#[tokio::test]
async fn test_instances_do_not_share_state() {
    let first = compat_runtime();
    let second = compat_runtime();
    first.create(SandboxConfig::new("sb")).await.unwrap();
    assert!(second.get("sb").await.unwrap_err().is_not_found());
}

// -----------------------------------------------------------------------------
// Exec
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_exec_requires_running() {
    let runtime = compat_runtime();
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let request = ExecRequest::new(format!("touch {}", marker.display()));

    runtime.create(SandboxConfig::new("sb")).await.unwrap();
    let err = runtime.exec("sb", request.clone()).await.unwrap_err();
    assert!(err.is_not_running());

    runtime.start("sb").await.unwrap();
    runtime.stop("sb").await.unwrap();
    let err = runtime.exec("sb", request.clone()).await.unwrap_err();
    assert!(err.is_not_running());

    let (tx, rx) = mpsc::channel(1);
    let err = runtime.exec_stream("sb", request, tx).await.unwrap_err();
    assert!(err.is_not_running());
    assert_eq!(collect(rx).await.1, 0);

    assert!(!marker.exists());
}

#[tokio::test]
async fn test_exec_nonzero_exit_is_not_an_error() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    let result = runtime
        .exec("sb", ExecRequest::new("echo partial; echo oops >&2; exit 7"))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 7);
    assert!(!result.success());
    assert_eq!(result.stdout, "partial\n");
    assert_eq!(result.stderr, "oops\n");
}

#[tokio::test]
async fn test_exec_timeout() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    let started = Instant::now();
    let err = runtime
        .exec(
            "sb",
            ExecRequest::new("sleep 10").timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_exec_timeout_kills_descendants() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("late");

    let script = format!("(sleep 1; touch {}) & wait", marker.display());
    let err = runtime
        .exec("sb", ExecRequest::new(script).timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_exec_env_overrides_host() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    let result = runtime
        .exec(
            "sb",
            ExecRequest::new("printf '%s|%s' \"$HOME\" \"$SANDBOX_TEST_VAR\"")
                .env("HOME", "/sandbox/home")
                .env("SANDBOX_TEST_VAR", "set"),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "/sandbox/home|set");

    // Ambient variables still come through.
    let result = runtime
        .exec("sb", ExecRequest::new("test -n \"$PATH\""))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn test_exec_working_directory() {
    let runtime = compat_runtime();
    let codebase = TempDir::new().unwrap();
    std::fs::write(codebase.path().join("README"), "hello").unwrap();
    runtime
        .create(SandboxConfig::new("sb").codebase_path(codebase.path()))
        .await
        .unwrap();
    runtime.start("sb").await.unwrap();

    let result = runtime.exec("sb", ExecRequest::new("cat README")).await.unwrap();
    assert_eq!(result.stdout, "hello");

    let other = TempDir::new().unwrap();
    let result = runtime
        .exec("sb", ExecRequest::new("pwd -P").work_dir(other.path()))
        .await
        .unwrap();
    let expected = other.path().canonicalize().unwrap();
    assert_eq!(result.stdout.trim_end(), expected.to_str().unwrap());
}

#[tokio::test]
async fn test_exec_stdin() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    let result = runtime
        .exec("sb", ExecRequest::new("tr a-z A-Z").stdin("shout"))
        .await
        .unwrap();
    assert_eq!(result.stdout, "SHOUT");

    // Without stdin the command sees EOF immediately.
    let result = runtime
        .exec("sb", ExecRequest::new("cat").timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result.stdout, "");
}

#[tokio::test]
async fn test_stop_cancels_inflight_exec() {
    let runtime = Arc::new(compat_runtime());
    running(&runtime, "sb").await;

    let handle = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.exec("sb", ExecRequest::new("sleep 30")).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    runtime.stop("sb").await.unwrap();
    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_destroy_cancels_inflight_exec() {
    let runtime = Arc::new(compat_runtime());
    running(&runtime, "sb").await;

    let handle = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.exec("sb", ExecRequest::new("sleep 30")).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    runtime.destroy("sb").await.unwrap();
    assert!(handle.await.unwrap().unwrap_err().is_cancelled());
}

/// Runs a command whose background child writes `marker` after a second,
/// interrupts it with `interrupt`, and checks the child never got there.
async fn assert_interrupt_kills_descendants<F, Fut>(interrupt: F, streaming: bool)
where
    F: FnOnce(Arc<BwrapRuntime>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let runtime = Arc::new(compat_runtime());
    running(&runtime, "sb").await;
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("late");
    let request = ExecRequest::new(format!(
        "echo started; (sleep 1; touch {}) & sleep 30",
        marker.display()
    ));

    let (tx, rx) = mpsc::channel(4);
    let handle = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            if streaming {
                runtime.exec_stream("sb", request, tx).await
            } else {
                drop(tx);
                runtime.exec("sb", request).await
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    interrupt(Arc::clone(&runtime)).await;
    assert!(handle.await.unwrap().unwrap_err().is_cancelled());
    let (data, _) = collect(rx).await;
    if streaming {
        assert_eq!(data, b"started\n");
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_stop_kills_descendants() {
    assert_interrupt_kills_descendants(
        |runtime| async move { runtime.stop("sb").await.unwrap() },
        false,
    )
    .await;
}

#[tokio::test]
async fn test_destroy_kills_descendants() {
    assert_interrupt_kills_descendants(
        |runtime| async move { runtime.destroy("sb").await.unwrap() },
        false,
    )
    .await;
}

#[tokio::test]
async fn test_stop_during_stream_kills_descendants() {
    assert_interrupt_kills_descendants(
        |runtime| async move { runtime.stop("sb").await.unwrap() },
        true,
    )
    .await;
}

#[tokio::test]
async fn test_zero_default_timeout_uses_fallback() {
    let runtime = BwrapRuntime::new(RuntimeConfig {
        bwrap_path: "/nonexistent/bwrap".to_string(),
        default_timeout_secs: 0,
        ..Default::default()
    });
    running(&runtime, "sb").await;

    let result = runtime.exec("sb", ExecRequest::new("echo hi")).await.unwrap();
    assert_eq!(result.stdout, "hi\n");

    let result = runtime
        .exec("sb", ExecRequest::new("echo zero").timeout(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(result.stdout, "zero\n");
}

#[tokio::test]
async fn test_slow_exec_does_not_block_lifecycle() {
    let runtime = Arc::new(compat_runtime());
    running(&runtime, "slow").await;

    let handle = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.exec("slow", ExecRequest::new("sleep 1")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    running(&runtime, "other").await;
    assert_eq!(runtime.list().await.len(), 2);
    runtime.destroy("other").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(handle.await.unwrap().unwrap().exit_code, 0);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;
    runtime.stop("sb").await.unwrap();
    runtime.start("sb").await.unwrap();

    let sandbox = runtime.get("sb").await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Running);
    assert!(sandbox.stopped_at.is_none());

    let result = runtime.exec("sb", ExecRequest::new("echo ok")).await.unwrap();
    assert_eq!(result.stdout, "ok\n");
}

// -----------------------------------------------------------------------------
// Streaming
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_exec_stream_delivers_all_bytes_in_order() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    let (tx, rx) = mpsc::channel(4);
    let reader = tokio::spawn(collect(rx));
    let result = runtime
        .exec_stream(
            "sb",
            ExecRequest::new("i=0; while [ $i -lt 2000 ]; do printf '%05d\\n' $i; i=$((i+1)); done"),
            tx,
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.is_empty());

    let (data, chunks) = reader.await.unwrap();
    let expected: String = (0..2000).map(|i| format!("{i:05}\n")).collect();
    assert_eq!(data.len(), expected.len());
    assert_eq!(String::from_utf8(data).unwrap(), expected);
    assert!(chunks >= 1);
}

#[tokio::test]
async fn test_exec_stream_reports_exit_code_and_stderr() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    let (tx, rx) = mpsc::channel(4);
    let result = runtime
        .exec_stream("sb", ExecRequest::new("echo out; echo err >&2; exit 3"), tx)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr, "err\n");
    assert_eq!(collect(rx).await.0, b"out\n");
}

#[tokio::test]
async fn test_exec_stream_missing_sandbox_closes_sink() {
    let runtime = compat_runtime();
    let (tx, rx) = mpsc::channel(1);
    let err = runtime
        .exec_stream("ghost", ExecRequest::new("echo hi"), tx)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(collect(rx).await, (Vec::new(), 0));
}

#[tokio::test]
async fn test_exec_stream_timeout_closes_sink() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    let (tx, rx) = mpsc::channel(4);
    let reader = tokio::spawn(collect(rx));
    let err = runtime
        .exec_stream(
            "sb",
            ExecRequest::new("echo first; sleep 10").timeout(Duration::from_millis(300)),
            tx,
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let (data, _) = reader.await.unwrap();
    assert_eq!(data, b"first\n");
}

#[tokio::test]
async fn test_stop_during_stream_closes_sink() {
    let runtime = Arc::new(compat_runtime());
    running(&runtime, "sb").await;

    let (tx, mut rx) = mpsc::channel(4);
    let handle = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            runtime
                .exec_stream("sb", ExecRequest::new("while true; do echo tick; sleep 0.05; done"), tx)
                .await
        })
    };

    // Wait until output is flowing, then stop mid-transfer.
    assert!(rx.recv().await.is_some());
    runtime.stop("sb").await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        while rx.recv().await.is_some() {}
        handle.await.unwrap()
    })
    .await
    .expect("stream did not terminate after stop");
    assert!(outcome.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn test_stalled_receiver_does_not_hang() {
    let runtime = compat_runtime();
    running(&runtime, "sb").await;

    // A one-slot channel that is never drained.
    let (tx, _rx) = mpsc::channel(1);
    let started = Instant::now();
    let err = runtime
        .exec_stream(
            "sb",
            ExecRequest::new("head -c 1000000 /dev/zero").timeout(Duration::from_millis(300)),
            tx,
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));
}
