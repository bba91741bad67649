//! Zero Sandbox - Isolated command execution for AI agents.
//!
//! This crate provides:
//! - A pattern-based command guard applied before anything runs
//! - Hardened Docker sandboxes with exec-per-command
//! - A bounded pool of pre-started sandboxes
//! - A local process executor used as a degraded fallback
//! - An `Executor` trait and factory tying the backends together

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod local;
pub mod logging;
pub mod pool;
pub mod sandbox;

pub use config::{EngineConfig, MountPath, PoolSettings, SandboxConfig};
pub use error::{Result, SandboxError};
pub use executor::{
    container_runtime_available, new_executor, Backend, Executor, ExecutorFactory, FallbackPolicy,
};
pub use guard::{check_command, contains_obfuscation, guard_command, GuardResult};
pub use local::{LimitedWriter, LocalConfig, LocalExecutor};
pub use pool::Pool;
pub use sandbox::{
    ContainerRuntime, ContainerSpec, DockerRuntime, ExecOutput, ExecRequest, ExecSession,
    OutputChunk, Sandbox, SandboxState,
};

/// Cancellation handle accepted by every blocking operation.
pub use tokio_util::sync::CancellationToken;
