//! In-memory container runtime for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use zero_sandbox::sandbox::runtime::{ContainerRuntime, ContainerSpec, ExecRequest, ExecSession, OutputChunk};
use zero_sandbox::{Result, SandboxError};

/// Fake runtime: containers are map entries, execs echo their last argument.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, bool>>,
    next_id: AtomicUsize,
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub removed: AtomicUsize,
    pub execs: AtomicUsize,
    pub pulls: AtomicUsize,
    pub fail_ping: AtomicBool,
    pub fail_start: AtomicBool,
    pub exit_code: AtomicI64,
    /// Execs print their output and then never finish
    pub hang_exec: AtomicBool,
    start_delay_ms: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        let rt = Self::default();
        rt.fail_ping.store(true, Ordering::SeqCst);
        rt
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.start_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Containers currently running.
    pub fn live(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|running| **running)
            .count()
    }

    /// Containers stopped or removed.
    pub fn torn_down(&self) -> usize {
        self.stopped.load(Ordering::SeqCst) + self.removed.load(Ordering::SeqCst)
    }

    /// Simulate every container dying underneath the engine.
    pub fn kill_all(&self) {
        for running in self.containers.lock().unwrap().values_mut() {
            *running = false;
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(SandboxError::BackendUnavailable("fake daemon is down".into()));
        }
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(self.pulls.load(Ordering::SeqCst) > 0)
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        assert!(spec.readonly_rootfs, "containers must be read-only");
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(id.clone(), false);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandboxError::Runtime("fake start failure".into()));
        }
        self.containers.lock().unwrap().insert(id.to_string(), true);
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        // auto_remove: a stopped container is gone
        self.containers.lock().unwrap().remove(id);
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.containers.lock().unwrap().remove(id);
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_container_running(&self, id: &str) -> Result<bool> {
        Ok(self.containers.lock().unwrap().get(id).copied().unwrap_or(false))
    }

    async fn create_exec(&self, id: &str, request: &ExecRequest) -> Result<ExecSession> {
        if !self.is_container_running(id).await? {
            return Err(SandboxError::Runtime(format!("container {id} is not running")));
        }
        let n = self.execs.fetch_add(1, Ordering::SeqCst);
        let echo = request.cmd.last().cloned().unwrap_or_default();
        let output = stream::iter(vec![Ok(OutputChunk::Stdout(format!("{echo}\n").into_bytes()))]);
        let output = if self.hang_exec.load(Ordering::SeqCst) {
            output.chain(stream::pending()).boxed()
        } else {
            output.boxed()
        };
        Ok(ExecSession {
            id: format!("exec-{n}"),
            output,
        })
    }

    async fn exec_exit_code(&self, _exec_id: &str) -> Result<i64> {
        Ok(self.exit_code.load(Ordering::SeqCst))
    }
}
