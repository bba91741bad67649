//! Docker-based sandbox for secure command execution.
//!
//! A [`Sandbox`] owns one long-lived container and runs each command as a
//! separate exec inside it. Security features:
//! - Read-only root filesystem, all capabilities dropped, no privilege escalation
//! - Memory (swap disabled), CPU and process-count limits
//! - Network disabled by default, optional gVisor runtime
//! - `noexec` scratch space on `/tmp` and the work directory
//! - Every command screened by the [command guard](crate::guard) first
//!
//! Lifecycle: `Unstarted → Running → Stopped`, with `reset` going back to
//! `Running` and `close` terminal from any state.

pub mod docker;
pub mod runtime;
pub mod types;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use base64::Engine;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::guard::guard_command;
use crate::pool::PoolSlot;

pub use docker::DockerRuntime;
pub use runtime::{ContainerRuntime, ContainerSpec, ExecRequest, ExecSession, OutputChunk};
pub use types::{ExecOutput, SandboxState};

/// Grace period before a stopping container is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SandboxError::Cancelled),
        res = fut => res,
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// One isolated execution environment backed by a container.
pub struct Sandbox {
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
    /// Serializes start/stop/reset/close
    lifecycle: tokio::sync::Mutex<()>,
    container_id: RwLock<Option<String>>,
    state: Mutex<SandboxState>,
    running: AtomicBool,
    /// Pool capacity held for as long as this sandbox lives
    slot: Option<PoolSlot>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("image", &self.config.image)
            .field("container_id", &self.container_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create an unstarted sandbox. The config is validated on a copy.
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config: config.validated(),
            runtime,
            lifecycle: tokio::sync::Mutex::new(()),
            container_id: RwLock::new(None),
            state: Mutex::new(SandboxState::Unstarted),
            running: AtomicBool::new(false),
            slot: None,
        }
    }

    pub(crate) fn with_slot(mut self, slot: PoolSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Container id, `None` until started.
    pub fn container_id(&self) -> Option<String> {
        self.container_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock-free check of the running flag.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Running flag plus a live inspect of the container.
    pub async fn is_alive(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(id) = self.container_id() else {
            return false;
        };
        match self.runtime.is_container_running(&id).await {
            Ok(alive) => alive,
            Err(e) => {
                tracing::debug!(container = %short_id(&id), "Inspect failed, treating sandbox as dead: {}", e);
                false
            }
        }
    }

    fn set_state(&self, state: SandboxState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.running
            .store(state == SandboxState::Running, Ordering::Release);
    }

    /// Ping the container runtime.
    pub async fn ping(&self) -> Result<()> {
        self.runtime.ping().await
    }

    /// Start the container.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(cancel).await
    }

    async fn start_locked(&self, cancel: &CancellationToken) -> Result<()> {
        match self.state() {
            SandboxState::Closed => return Err(SandboxError::Closed),
            SandboxState::Running => return Err(SandboxError::AlreadyRunning),
            SandboxState::Unstarted | SandboxState::Stopped => {}
        }

        cancellable(cancel, self.ensure_image()).await?;

        let spec = ContainerSpec::from_config(&self.config);
        let id = self.runtime.create_container(&spec).await?;

        if cancel.is_cancelled() {
            self.discard(&id).await;
            return Err(SandboxError::Cancelled);
        }

        if let Err(e) = self.runtime.start_container(&id).await {
            tracing::warn!(container = %spec.name, "Failed to start sandbox container: {}", e);
            self.discard(&id).await;
            return Err(e);
        }

        *self
            .container_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        self.set_state(SandboxState::Running);

        tracing::info!(
            container = %short_id(&id),
            image = %self.config.image,
            memory_mb = self.config.memory_mb,
            cpu = self.config.cpu,
            network = self.config.network_enabled,
            gvisor = self.config.gvisor,
            "Sandbox started"
        );
        Ok(())
    }

    async fn ensure_image(&self) -> Result<()> {
        if self.runtime.image_exists(&self.config.image).await? {
            return Ok(());
        }
        self.runtime.pull_image(&self.config.image).await
    }

    /// Remove a container that never became usable.
    async fn discard(&self, id: &str) {
        if let Err(e) = self.runtime.remove_container(id).await {
            tracing::warn!(container = %short_id(id), "Failed to remove sandbox container: {}", e);
        }
    }

    /// Run an argv inside the sandbox.
    pub async fn execute(&self, cancel: &CancellationToken, argv: &[String]) -> Result<ExecOutput> {
        let command = argv.join(" ");
        if let Some(reason) = guard_command(&command) {
            tracing::warn!(reason = %reason, "Sandbox command blocked by guard");
            return Err(SandboxError::GuardBlocked { reason });
        }
        self.run(cancel, argv.to_vec()).await
    }

    /// Run a shell command (`sh -c`) inside the sandbox.
    pub async fn execute_shell(&self, cancel: &CancellationToken, command: &str) -> Result<ExecOutput> {
        if let Some(reason) = guard_command(command) {
            tracing::warn!(reason = %reason, "Sandbox command blocked by guard");
            return Err(SandboxError::GuardBlocked { reason });
        }
        self.run(
            cancel,
            vec!["sh".to_string(), "-c".to_string(), command.to_string()],
        )
        .await
    }

    /// Exec-attach without the guard.
    async fn run(&self, cancel: &CancellationToken, cmd: Vec<String>) -> Result<ExecOutput> {
        if !self.is_running() {
            return Err(SandboxError::NotRunning);
        }
        let id = self.container_id().ok_or(SandboxError::NotRunning)?;

        let started = Instant::now();
        let request = ExecRequest::new(cmd).working_dir(self.config.work_dir.clone());
        let ExecSession {
            id: exec_id,
            mut output,
        } = cancellable(cancel, self.runtime.create_exec(&id, &request)).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                chunk = output.next() => match chunk {
                    Some(Ok(OutputChunk::Stdout(bytes))) => stdout.extend_from_slice(&bytes),
                    Some(Ok(OutputChunk::Stderr(bytes))) => stderr.extend_from_slice(&bytes),
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
                () = &mut deadline => {
                    tracing::warn!(
                        container = %short_id(&id),
                        timeout_secs = self.config.timeout.as_secs_f64(),
                        "Sandbox command timed out"
                    );
                    return Err(SandboxError::Timeout {
                        timeout: self.config.timeout,
                        output: ExecOutput::from_bytes(&stdout, &stderr, -1, started.elapsed()),
                    });
                }
                () = cancel.cancelled() => return Err(SandboxError::Cancelled),
            }
        }

        let exit_code = self.runtime.exec_exit_code(&exec_id).await?;
        let exit_code = i32::try_from(exit_code).unwrap_or(-1);

        tracing::debug!(
            container = %short_id(&id),
            exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sandbox command finished"
        );

        Ok(ExecOutput::from_bytes(&stdout, &stderr, exit_code, started.elapsed()))
    }

    /// Stage a file inside the container.
    pub async fn copy_into(&self, cancel: &CancellationToken, path: &str, content: &[u8]) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let target = shell_quote(path);
        let script = format!(
            "mkdir -p \"$(dirname {target})\" && printf '%s' '{encoded}' | base64 -d > {target}"
        );

        let output = self
            .run(cancel, vec!["sh".to_string(), "-c".to_string(), script])
            .await?;
        if !output.success() {
            return Err(SandboxError::Execution(format!(
                "Failed to copy {path} into sandbox: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Stop the container. Stopping a stopped sandbox is a no-op.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(cancel).await
    }

    async fn stop_locked(&self, cancel: &CancellationToken) -> Result<()> {
        let id = self
            .container_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(id) = id else {
            return Ok(());
        };
        self.set_state(SandboxState::Stopped);

        let graceful = tokio::select! {
            res = self.runtime.stop_container(&id, STOP_GRACE) => res,
            () = cancel.cancelled() => Err(SandboxError::Cancelled),
        };

        if let Err(e) = graceful {
            tracing::debug!(container = %short_id(&id), "Graceful stop failed ({}), forcing removal", e);
            if let Err(e) = self.runtime.remove_container(&id).await {
                tracing::error!(container = %short_id(&id), "Failed to remove sandbox container: {}", e);
                return Err(e);
            }
        }

        tracing::info!(container = %short_id(&id), "Sandbox stopped");
        Ok(())
    }

    /// Stop then start, discarding all in-container state.
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == SandboxState::Closed {
            return Err(SandboxError::Closed);
        }
        self.stop_locked(cancel).await?;
        self.start_locked(cancel).await
    }

    /// Tear down for good.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == SandboxState::Closed {
            return Ok(());
        }
        let result = self.stop_locked(&CancellationToken::new()).await;
        self.set_state(SandboxState::Closed);
        result
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let id = self
            .container_id
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(id) = id else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = Arc::clone(&self.runtime);
                handle.spawn(async move {
                    if let Err(e) = runtime.remove_container(&id).await {
                        tracing::warn!(container = %short_id(&id), "Failed to remove dropped sandbox: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(container = %short_id(&id), "Sandbox dropped outside a runtime, container may leak");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::MockContainerRuntime;
    use futures_util::stream;
    use mockall::predicate::eq;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    fn session(chunks: Vec<OutputChunk>) -> ExecSession {
        ExecSession {
            id: "exec-1".into(),
            output: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }

    fn lifecycle_mock() -> MockContainerRuntime {
        let mut mock = MockContainerRuntime::new();
        mock.expect_image_exists().returning(|_| Ok(true));
        mock.expect_create_container()
            .returning(|_| Ok("container-1".to_string()));
        mock.expect_start_container().returning(|_| Ok(()));
        mock.expect_stop_container().returning(|_, _| Ok(()));
        mock
    }

    fn sandbox(mock: MockContainerRuntime) -> Sandbox {
        Sandbox::new(SandboxConfig::default(), Arc::new(mock))
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn start_pulls_missing_image_and_runs() {
        let mut mock = MockContainerRuntime::new();
        mock.expect_image_exists().times(1).returning(|_| Ok(false));
        mock.expect_pull_image()
            .with(eq("alpine:3.19"))
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_create_container()
            .withf(|spec| spec.readonly_rootfs && spec.network_disabled)
            .times(1)
            .returning(|_| Ok("container-1".to_string()));
        mock.expect_start_container()
            .with(eq("container-1"))
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_stop_container().times(1).returning(|_, _| Ok(()));

        let sb = sandbox(mock);
        assert_eq!(sb.state(), SandboxState::Unstarted);
        assert_eq!(sb.container_id(), None);

        sb.start(&token()).await.unwrap();
        assert!(sb.is_running());
        assert_eq!(sb.container_id().as_deref(), Some("container-1"));

        sb.close().await.unwrap();
        assert_eq!(sb.state(), SandboxState::Closed);
    }

    #[tokio::test]
    async fn start_failure_removes_container() {
        let mut mock = MockContainerRuntime::new();
        mock.expect_image_exists().returning(|_| Ok(true));
        mock.expect_create_container()
            .returning(|_| Ok("broken".to_string()));
        mock.expect_start_container()
            .returning(|_| Err(SandboxError::Runtime("no such runtime: runsc".into())));
        mock.expect_remove_container()
            .with(eq("broken"))
            .times(1)
            .returning(|_| Ok(()));

        let sb = sandbox(mock);
        let err = sb.start(&token()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
        assert!(!sb.is_running());
        assert_eq!(sb.container_id(), None);
        assert_eq!(sb.state(), SandboxState::Unstarted);
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let sb = sandbox(lifecycle_mock());
        sb.start(&token()).await.unwrap();
        let err = sb.start(&token()).await.unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyRunning));
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn execute_before_start_is_not_running() {
        // No exec expectations: any runtime call would panic
        let sb = sandbox(MockContainerRuntime::new());
        let err = sb
            .execute(&token(), &argv(&["echo", "hi"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning));
    }

    #[tokio::test]
    async fn guard_blocks_before_exec() {
        let sb = sandbox(lifecycle_mock());
        sb.start(&token()).await.unwrap();

        let err = sb.execute_shell(&token(), "rm -rf /").await.unwrap_err();
        assert!(err.is_guard_blocked());
        let err = sb
            .execute(&token(), &argv(&["shutdown", "-h", "now"]))
            .await
            .unwrap_err();
        assert!(err.is_guard_blocked());

        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn execute_collects_output_and_exit_code() {
        let mut mock = lifecycle_mock();
        mock.expect_create_exec()
            .withf(|id, req| {
                id == "container-1"
                    && req.cmd == ["sh", "-c", "echo hello; echo oops >&2; exit 3"]
                    && req.working_dir.as_deref() == Some("/workspace")
            })
            .times(1)
            .returning(|_, _| {
                Ok(session(vec![
                    OutputChunk::Stdout(b"hel".to_vec()),
                    OutputChunk::Stderr(b"oops\n".to_vec()),
                    OutputChunk::Stdout(b"lo\n".to_vec()),
                ]))
            });
        mock.expect_exec_exit_code()
            .with(eq("exec-1"))
            .returning(|_| Ok(3));

        let sb = sandbox(mock);
        sb.start(&token()).await.unwrap();

        let out = sb
            .execute_shell(&token(), "echo hello; echo oops >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());

        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_returns_partial_output_and_keeps_sandbox() {
        let mut mock = lifecycle_mock();
        mock.expect_create_exec().returning(|_, _| {
            Ok(ExecSession {
                id: "exec-slow".into(),
                output: stream::iter(vec![Ok(OutputChunk::Stdout(b"started\n".to_vec()))])
                    .chain(stream::pending())
                    .boxed(),
            })
        });

        let config = SandboxConfig::default().with_timeout(Duration::from_millis(50));
        let sb = Sandbox::new(config, Arc::new(mock));
        sb.start(&token()).await.unwrap();

        let err = sb.execute_shell(&token(), "sleep 100").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.partial_output().unwrap().stdout, "started\n");
        assert!(sb.is_running());

        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_aborts_execute() {
        let mut mock = lifecycle_mock();
        mock.expect_create_exec().returning(|_, _| {
            Ok(ExecSession {
                id: "exec-hang".into(),
                output: stream::pending().boxed(),
            })
        });

        let sb = sandbox(mock);
        sb.start(&token()).await.unwrap();

        let cancel = token();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = sb.execute_shell(&cancel, "sleep 100").await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(sb.is_running());

        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sb = sandbox(MockContainerRuntime::new());
        sb.stop(&token()).await.unwrap();
        sb.stop(&token()).await.unwrap();
        assert_eq!(sb.state(), SandboxState::Unstarted);
    }

    #[tokio::test]
    async fn stop_forces_removal_when_graceful_stop_fails() {
        let mut mock = MockContainerRuntime::new();
        mock.expect_image_exists().returning(|_| Ok(true));
        mock.expect_create_container()
            .returning(|_| Ok("container-1".to_string()));
        mock.expect_start_container().returning(|_| Ok(()));
        mock.expect_stop_container()
            .times(1)
            .returning(|_, _| Err(SandboxError::Runtime("timeout".into())));
        mock.expect_remove_container()
            .with(eq("container-1"))
            .times(1)
            .returning(|_| Ok(()));

        let sb = sandbox(mock);
        sb.start(&token()).await.unwrap();
        sb.stop(&token()).await.unwrap();
        assert_eq!(sb.state(), SandboxState::Stopped);
        assert!(!sb.is_running());

        // Already stopped: no further runtime calls
        sb.stop(&token()).await.unwrap();
    }

    #[tokio::test]
    async fn execute_after_stop_is_not_running() {
        let sb = sandbox(lifecycle_mock());
        sb.start(&token()).await.unwrap();
        sb.stop(&token()).await.unwrap();

        let err = sb.execute_shell(&token(), "echo hi").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning));
    }

    #[tokio::test]
    async fn reset_replaces_container() {
        let mut mock = MockContainerRuntime::new();
        let mut seq = 0;
        mock.expect_image_exists().returning(|_| Ok(true));
        mock.expect_create_container().times(2).returning(move |_| {
            seq += 1;
            Ok(format!("container-{seq}"))
        });
        mock.expect_start_container().times(2).returning(|_| Ok(()));
        mock.expect_stop_container().times(2).returning(|_, _| Ok(()));

        let sb = sandbox(mock);
        sb.start(&token()).await.unwrap();
        assert_eq!(sb.container_id().as_deref(), Some("container-1"));

        sb.reset(&token()).await.unwrap();
        assert_eq!(sb.container_id().as_deref(), Some("container-2"));
        assert!(sb.is_running());

        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_sandbox_cannot_restart() {
        let sb = sandbox(lifecycle_mock());
        sb.start(&token()).await.unwrap();
        sb.close().await.unwrap();
        sb.close().await.unwrap();

        assert!(matches!(sb.start(&token()).await, Err(SandboxError::Closed)));
        assert!(matches!(sb.reset(&token()).await, Err(SandboxError::Closed)));
    }

    #[tokio::test]
    async fn copy_into_stages_base64_payload() {
        let mut mock = lifecycle_mock();
        mock.expect_create_exec()
            .withf(|_, req| {
                let script = &req.cmd[2];
                req.cmd[0] == "sh"
                    && script.contains("aGVsbG8=")
                    && script.contains("base64 -d > '/workspace/in.txt'")
            })
            .times(1)
            .returning(|_, _| Ok(session(Vec::new())));
        mock.expect_exec_exit_code().returning(|_| Ok(0));

        let sb = sandbox(mock);
        sb.start(&token()).await.unwrap();
        sb.copy_into(&token(), "/workspace/in.txt", b"hello")
            .await
            .unwrap();
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn is_alive_consults_runtime() {
        let mut mock = lifecycle_mock();
        mock.expect_is_container_running()
            .with(eq("container-1"))
            .returning(|_| Ok(false));

        let sb = sandbox(mock);
        assert!(!sb.is_alive().await);
        sb.start(&token()).await.unwrap();
        assert!(!sb.is_alive().await);
        sb.close().await.unwrap();
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
