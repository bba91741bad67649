//! Error types for the sandbox engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sandbox::types::ExecOutput;

/// Result type alias using the sandbox error type.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Unified error type for sandboxed and local execution.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The command guard rejected the command; nothing was executed.
    #[error("Command blocked: {reason}")]
    GuardBlocked { reason: String },

    /// Execute/stop was called on a sandbox that is not running
    #[error("Sandbox is not running")]
    NotRunning,

    /// Start was called on a sandbox that is already running
    #[error("Sandbox is already running")]
    AlreadyRunning,

    /// The sandbox has been closed and cannot be used again
    #[error("Sandbox is closed")]
    Closed,

    /// The pool has been closed
    #[error("Sandbox pool is closed")]
    PoolClosed,

    /// The command exceeded its time budget. Output captured so far is kept.
    #[error("Command timed out after {}s", timeout.as_secs_f64())]
    Timeout {
        timeout: Duration,
        output: ExecOutput,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The process could not be launched
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The container runtime cannot be reached
    #[error("Container runtime unavailable: {0}")]
    BackendUnavailable(String),

    /// A container runtime call failed
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// Working directory does not exist or is not a directory
    #[error("Invalid working directory: {}", .0.display())]
    InvalidWorkDir(PathBuf),

    /// No candidate shell could be found on PATH
    #[error("No usable shell found on PATH")]
    NoShell,

    /// Configuration file could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Check if this is a guard rejection.
    pub const fn is_guard_blocked(&self) -> bool {
        matches!(self, Self::GuardBlocked { .. })
    }

    /// Check if this is a timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this is a cancellation.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Output captured before a timeout, if any.
    pub fn partial_output(&self) -> Option<&ExecOutput> {
        match self {
            Self::Timeout { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Runtime(err.to_string())
    }
}
