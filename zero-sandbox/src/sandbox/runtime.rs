//! Container runtime boundary.
//!
//! [`ContainerRuntime`] is the only place the engine talks to a container
//! backend. [`DockerRuntime`](super::docker::DockerRuntime) implements it over
//! bollard; tests substitute fakes or mocks.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::{SandboxConfig, CPU_PERIOD_US};
use crate::error::Result;

/// Command that keeps an idle sandbox container alive.
pub const KEEP_ALIVE_CMD: &[&str] = &["tail", "-f", "/dev/null"];

/// Label applied to every container created by the engine.
pub const SANDBOX_LABEL: &str = "zero.sandbox";

/// Alternate OCI runtime used when gVisor isolation is requested.
pub const GVISOR_RUNTIME: &str = "runsc";

/// Mount options for the writable scratch filesystems.
const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,nodev,size=256m";

/// Backend-agnostic, hardened container launch specification.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
    pub memory_bytes: i64,
    /// Equal to `memory_bytes`: swap disabled
    pub memory_swap_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub readonly_rootfs: bool,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub auto_remove: bool,
    /// Mount point → tmpfs options
    pub tmpfs: BTreeMap<String, String>,
    pub network_disabled: bool,
    /// Alternate low-level runtime, e.g. `runsc`
    pub runtime: Option<String>,
    /// `source:target[:ro]`
    pub binds: Vec<String>,
}

impl ContainerSpec {
    /// Build the locked-down launch spec for a sandbox config.
    pub fn from_config(config: &SandboxConfig) -> Self {
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("zero-sandbox-{}", &short_id[..8]);

        let mut tmpfs = BTreeMap::new();
        tmpfs.insert("/tmp".to_string(), TMPFS_OPTIONS.to_string());
        // A bind mount over the work dir takes precedence over scratch space
        if !config.mounts.iter().any(|m| m.target == config.work_dir) {
            tmpfs.insert(config.work_dir.clone(), TMPFS_OPTIONS.to_string());
        }

        let mut labels = BTreeMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());

        Self {
            name,
            image: config.image.clone(),
            cmd: KEEP_ALIVE_CMD.iter().map(|s| (*s).to_string()).collect(),
            working_dir: config.work_dir.clone(),
            labels,
            memory_bytes: config.memory_bytes(),
            memory_swap_bytes: config.memory_bytes(),
            cpu_period: CPU_PERIOD_US,
            cpu_quota: config.cpu_quota(),
            pids_limit: i64::from(config.max_processes),
            readonly_rootfs: true,
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges:true".to_string()],
            auto_remove: true,
            tmpfs,
            network_disabled: !config.network_enabled,
            runtime: config.gvisor.then(|| GVISOR_RUNTIME.to_string()),
            binds: config.mounts.iter().map(|m| m.bind_spec()).collect(),
        }
    }
}

/// An exec to create inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
}

impl ExecRequest {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// One demultiplexed piece of exec output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// An attached exec: its id and its output stream.
pub struct ExecSession {
    pub id: String,
    pub output: BoxStream<'static, Result<OutputChunk>>,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Narrow client interface over a container backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check the daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image, waiting for completion.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop gracefully, killing after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove. Removing an already-gone container is not an error.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Whether the container is still running.
    async fn is_container_running(&self, id: &str) -> Result<bool>;

    /// Create and attach an exec inside a running container.
    async fn create_exec(&self, id: &str, request: &ExecRequest) -> Result<ExecSession>;

    /// Exit code of a finished exec.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64>;
}
