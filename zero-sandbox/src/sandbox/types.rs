//! Sandbox execution types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a [`Sandbox`](super::Sandbox).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Constructed, no container yet
    Unstarted,
    /// Container is live and accepts commands
    Running,
    /// Container was torn down; `reset`/`start` may bring it back
    Stopped,
    /// Terminal
    Closed,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Result of running one command.
///
/// A non-zero exit code is not an error; launch failures and timeouts are
/// reported through [`SandboxError`](crate::SandboxError) instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (0 = success, -1 when unknown)
    pub exit_code: i32,
    /// Wall-clock duration
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ExecOutput {
    /// Check if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Build an output from raw captured bytes.
    pub(crate) fn from_bytes(
        stdout: &[u8],
        stderr: &[u8],
        exit_code: i32,
        duration: Duration,
    ) -> Self {
        Self {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            exit_code,
            duration,
        }
    }
}
