//! Local process executor.
//!
//! Used when the container runtime is unreachable. Isolation is only what the
//! OS user gives you, but the command guard still screens every call:
//! - Guard check before any process is created
//! - Per-call timeout, child killed on expiry or cancellation
//! - stdout/stderr capped at `max_output_bytes` each
//! - Extra environment merged over the inherited one

mod limited;

pub use limited::LimitedWriter;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_TIMEOUT;
use crate::error::{Result, SandboxError};
use crate::guard::guard_command;
use crate::sandbox::types::ExecOutput;

/// Default per-stream output cap (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[cfg(windows)]
const CANDIDATE_SHELLS: &[&str] = &["cmd", "powershell"];
#[cfg(not(windows))]
const CANDIDATE_SHELLS: &[&str] = &["sh", "bash", "zsh"];

/// Local executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Working directory; relative paths resolve against the current dir
    pub work_dir: Option<PathBuf>,
    /// Per-call timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Shell names that may be used, in preference order
    pub allowed_shells: Vec<String>,
    /// Cap on captured bytes per stream
    pub max_output_bytes: usize,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            timeout: DEFAULT_TIMEOUT,
            allowed_shells: CANDIDATE_SHELLS.iter().map(|s| (*s).to_string()).collect(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            env: HashMap::new(),
        }
    }
}

impl LocalConfig {
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_allowed_shells<I, S>(mut self, shells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_shells = shells.into_iter().map(Into::into).collect();
        self
    }
}

/// How a shell takes an inline command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Posix,
    Cmd,
    PowerShell,
}

impl ShellKind {
    fn from_name(name: &str) -> Self {
        match name {
            "cmd" => Self::Cmd,
            "powershell" | "pwsh" => Self::PowerShell,
            _ => Self::Posix,
        }
    }

    /// Arguments placed before the command string.
    pub fn flags(self) -> &'static [&'static str] {
        match self {
            Self::Posix => &["-c"],
            Self::Cmd => &["/C"],
            Self::PowerShell => &["-NoProfile", "-NonInteractive", "-Command"],
        }
    }
}

/// A shell found on PATH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    pub path: PathBuf,
    pub kind: ShellKind,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs commands as plain child processes.
#[derive(Debug, Default)]
pub struct LocalExecutor {
    config: LocalConfig,
    spawned: AtomicU64,
}

impl LocalExecutor {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Number of processes this executor has tried to create.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// First allowed candidate shell that resolves on PATH.
    pub fn resolve_shell(&self) -> Result<Shell> {
        CANDIDATE_SHELLS
            .iter()
            .filter(|name| self.config.allowed_shells.iter().any(|a| a == *name))
            .find_map(|name| {
                which::which(name).ok().map(|path| Shell {
                    path,
                    kind: ShellKind::from_name(name),
                })
            })
            .ok_or(SandboxError::NoShell)
    }

    /// True iff at least one candidate shell resolves.
    pub fn is_available(&self) -> bool {
        self.resolve_shell().is_ok()
    }

    /// Run an argv directly, without a shell.
    pub async fn execute(&self, cancel: &CancellationToken, argv: &[String]) -> Result<ExecOutput> {
        let command = argv.join(" ");
        if let Some(reason) = guard_command(&command) {
            tracing::warn!(reason = %reason, "Local command blocked by guard");
            return Err(SandboxError::GuardBlocked { reason });
        }
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Execution("empty argv".into()))?;
        self.run(cancel, OsStr::new(program), args).await
    }

    /// Run a command through the first available shell.
    pub async fn execute_shell(&self, cancel: &CancellationToken, command: &str) -> Result<ExecOutput> {
        if let Some(reason) = guard_command(command) {
            tracing::warn!(reason = %reason, "Local command blocked by guard");
            return Err(SandboxError::GuardBlocked { reason });
        }
        let shell = self.resolve_shell()?;
        let mut args: Vec<String> = shell.kind.flags().iter().map(|f| (*f).to_string()).collect();
        args.push(command.to_string());
        self.run(cancel, shell.path.as_os_str(), &args).await
    }

    async fn resolve_work_dir(&self) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.config.work_dir else {
            return Ok(None);
        };
        let dir = if dir.is_relative() {
            std::env::current_dir()?.join(dir)
        } else {
            dir.clone()
        };
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(Some(dir)),
            _ => Err(SandboxError::InvalidWorkDir(dir)),
        }
    }

    async fn run(&self, cancel: &CancellationToken, program: &OsStr, args: &[String]) -> Result<ExecOutput> {
        let work_dir = self.resolve_work_dir().await?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &work_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::Execution(format!("Failed to spawn {}: {e}", program.to_string_lossy()))
        })?;

        let limit = self.config.max_output_bytes;
        let mut stdout = LimitedWriter::new(Vec::new(), limit);
        let mut stderr = LimitedWriter::new(Vec::new(), limit);
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let outcome = {
            let finished = async {
                let (out, err) = tokio::join!(
                    drain(stdout_pipe, &mut stdout),
                    drain(stderr_pipe, &mut stderr)
                );
                out?;
                err?;
                child.wait().await
            };
            tokio::select! {
                status = finished => Outcome::Exited(status),
                () = tokio::time::sleep(self.config.timeout) => Outcome::TimedOut,
                () = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        if stdout.truncated() || stderr.truncated() {
            tracing::debug!(limit, "Local command output truncated");
        }

        match outcome {
            Outcome::Exited(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                tracing::debug!(
                    program = %program.to_string_lossy(),
                    exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Local command finished"
                );
                Ok(ExecOutput::from_bytes(
                    &stdout.into_inner(),
                    &stderr.into_inner(),
                    exit_code,
                    started.elapsed(),
                ))
            }
            Outcome::Exited(Err(e)) => Err(SandboxError::Execution(format!(
                "Failed to wait for {}: {e}",
                program.to_string_lossy()
            ))),
            Outcome::TimedOut => {
                let _ = child.kill().await;
                tracing::warn!(
                    program = %program.to_string_lossy(),
                    timeout_secs = self.config.timeout.as_secs_f64(),
                    "Local command timed out"
                );
                Err(SandboxError::Timeout {
                    timeout: self.config.timeout,
                    output: ExecOutput::from_bytes(
                        &stdout.into_inner(),
                        &stderr.into_inner(),
                        -1,
                        started.elapsed(),
                    ),
                })
            }
            Outcome::Cancelled => {
                let _ = child.kill().await;
                Err(SandboxError::Cancelled)
            }
        }
    }
}

async fn drain<R>(pipe: Option<R>, sink: &mut LimitedWriter<Vec<u8>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n])?;
    }
}
