//! Sandbox configuration.
//!
//! [`SandboxConfig`] is a plain value type. `with_*` methods return a modified
//! copy and never touch the receiver; [`SandboxConfig::validate`] silently
//! replaces invalid fields with their defaults.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (`ZERO_SANDBOX_*` prefix)
//! 2. Explicit config file values (`~/.codecoder/sandbox.json`)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ZERO_SANDBOX_IMAGE` → sandbox.image
//! - `ZERO_SANDBOX_MEMORY_MB` → sandbox.memory_mb
//! - `ZERO_SANDBOX_CPU` → sandbox.cpu
//! - `ZERO_SANDBOX_MAX_PROCESSES` → sandbox.max_processes
//! - `ZERO_SANDBOX_NETWORK` → sandbox.network_enabled
//! - `ZERO_SANDBOX_GVISOR` → sandbox.gvisor
//! - `ZERO_SANDBOX_WORKDIR` → sandbox.work_dir
//! - `ZERO_SANDBOX_TIMEOUT_SECS` → sandbox.timeout
//! - `ZERO_SANDBOX_POOL_SIZE` → pool.max_size
//! - `ZERO_SANDBOX_FALLBACK` → fallback (`allow` / `deny`)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::executor::FallbackPolicy;
use crate::local::LocalConfig;

/// Default container image.
pub const DEFAULT_IMAGE: &str = "alpine:3.19";
/// Default memory limit in megabytes.
pub const DEFAULT_MEMORY_MB: u64 = 512;
/// Default CPU share (fraction of one core).
pub const DEFAULT_CPU: f64 = 0.5;
/// Default process-count ceiling inside the container.
pub const DEFAULT_MAX_PROCESSES: u32 = 100;
/// Default working directory inside the container.
pub const DEFAULT_WORK_DIR: &str = "/workspace";
/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default pool size.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".codecoder"),
        |dirs| dirs.home_dir().join(".codecoder"),
    )
}

/// Get the sandbox configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("sandbox.json")
}

/// A host path bind-mounted into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPath {
    /// Host path
    pub source: String,
    /// Path inside the container
    pub target: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl MountPath {
    /// Docker bind specification (`source:target[:ro]`).
    pub fn bind_spec(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Configuration for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container image reference
    pub image: String,
    /// Memory limit in MB (swap is disabled)
    pub memory_mb: u64,
    /// CPU limit as a fraction of one core, in (0, 1]
    pub cpu: f64,
    /// Maximum number of processes inside the container
    pub max_processes: u32,
    /// Network access enabled (default: false)
    pub network_enabled: bool,
    /// Run under gVisor (`runsc`) for stronger kernel isolation
    pub gvisor: bool,
    /// Working directory inside the container
    pub work_dir: String,
    /// Per-call timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Host paths bind-mounted into the container
    pub mounts: Vec<MountPath>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.into(),
            memory_mb: DEFAULT_MEMORY_MB,
            cpu: DEFAULT_CPU,
            max_processes: DEFAULT_MAX_PROCESSES,
            network_enabled: false,
            gvisor: false,
            work_dir: DEFAULT_WORK_DIR.into(),
            timeout: DEFAULT_TIMEOUT,
            mounts: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Replace every invalid field with its default. Idempotent.
    pub fn validate(&mut self) {
        if self.image.trim().is_empty() {
            self.image = DEFAULT_IMAGE.into();
        }
        if self.memory_mb == 0 {
            self.memory_mb = DEFAULT_MEMORY_MB;
        }
        if self.cpu.is_nan() || self.cpu <= 0.0 || self.cpu > 1.0 {
            self.cpu = DEFAULT_CPU;
        }
        if self.max_processes == 0 {
            self.max_processes = DEFAULT_MAX_PROCESSES;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.work_dir.trim().is_empty() {
            self.work_dir = DEFAULT_WORK_DIR.into();
        }
    }

    /// Consume, validate and return.
    pub fn validated(mut self) -> Self {
        self.validate();
        self
    }

    /// Copy with a different image.
    pub fn with_image(&self, image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..self.clone()
        }
    }

    /// Copy with a different memory limit in MiB.
    pub fn with_memory_mb(&self, memory_mb: u64) -> Self {
        Self {
            memory_mb,
            ..self.clone()
        }
    }

    /// Copy with a different CPU share (1.0 is one core).
    pub fn with_cpu(&self, cpu: f64) -> Self {
        Self { cpu, ..self.clone() }
    }

    /// Copy with a different process limit.
    pub fn with_max_processes(&self, max_processes: u32) -> Self {
        Self {
            max_processes,
            ..self.clone()
        }
    }

    /// Copy with networking switched on or off.
    pub fn with_network(&self, enabled: bool) -> Self {
        Self {
            network_enabled: enabled,
            ..self.clone()
        }
    }

    /// Copy with the gVisor runtime switched on or off.
    pub fn with_gvisor(&self, enabled: bool) -> Self {
        Self {
            gvisor: enabled,
            ..self.clone()
        }
    }

    /// Copy with a different working directory inside the container.
    pub fn with_work_dir(&self, work_dir: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..self.clone()
        }
    }

    /// Copy with a different per-command timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    /// Copy with one more bind mount.
    pub fn with_mount(&self, source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        let mut copy = self.clone();
        copy.add_mount_path(source, target, read_only);
        copy
    }

    /// Append a bind mount.
    pub fn add_mount_path(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        read_only: bool,
    ) {
        self.mounts.push(MountPath {
            source: source.into(),
            target: target.into(),
            read_only,
        });
    }

    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }

    /// CPU quota in microseconds per [`CPU_PERIOD_US`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn cpu_quota(&self) -> i64 {
        ((self.cpu * CPU_PERIOD_US as f64) as i64).max(1_000)
    }

    /// Expand `~` and `$VAR` in mount sources.
    fn expand_mounts(&mut self) {
        for mount in &mut self.mounts {
            match shellexpand::full(&mount.source) {
                Ok(expanded) => mount.source = expanded.into_owned(),
                Err(e) => {
                    tracing::warn!(source = %mount.source, "Failed to expand mount source: {}", e);
                }
            }
        }
    }
}

/// CFS scheduler period used for CPU quotas.
pub const CPU_PERIOD_US: i64 = 100_000;

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum live sandboxes
    pub max_size: usize,
    /// Sandboxes to pre-start
    pub warmup: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            warmup: 0,
        }
    }
}

/// Top-level engine configuration, loaded from `sandbox.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container sandbox settings
    pub sandbox: SandboxConfig,
    /// Pool sizing
    pub pool: PoolSettings,
    /// Fallback executor settings
    pub local: LocalConfig,
    /// Whether to fall back to local execution when Docker is unavailable
    pub fallback: FallbackPolicy,
}

impl EngineConfig {
    /// Load configuration from the default path, or defaults if absent.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Sandbox config not found, using defaults");
            return Ok(Self::default().normalized());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;

        tracing::debug!(path = %path.display(), "Loaded sandbox config");
        Ok(config.normalized())
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `ZERO_SANDBOX_*` overrides, then re-validate.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(image) = lookup("ZERO_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(mb) = lookup("ZERO_SANDBOX_MEMORY_MB").and_then(|v| v.parse().ok()) {
            self.sandbox.memory_mb = mb;
        }
        if let Some(cpu) = lookup("ZERO_SANDBOX_CPU").and_then(|v| v.parse().ok()) {
            self.sandbox.cpu = cpu;
        }
        if let Some(n) = lookup("ZERO_SANDBOX_MAX_PROCESSES").and_then(|v| v.parse().ok()) {
            self.sandbox.max_processes = n;
        }
        if let Some(flag) = lookup("ZERO_SANDBOX_NETWORK").and_then(|v| parse_bool(&v)) {
            self.sandbox.network_enabled = flag;
        }
        if let Some(flag) = lookup("ZERO_SANDBOX_GVISOR").and_then(|v| parse_bool(&v)) {
            self.sandbox.gvisor = flag;
        }
        if let Some(dir) = lookup("ZERO_SANDBOX_WORKDIR") {
            self.sandbox.work_dir = dir;
        }
        if let Some(secs) = lookup("ZERO_SANDBOX_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.sandbox.timeout = Duration::from_secs(secs);
        }
        if let Some(size) = lookup("ZERO_SANDBOX_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.pool.max_size = size;
        }
        match lookup("ZERO_SANDBOX_FALLBACK").as_deref() {
            Some("allow") => self.fallback = FallbackPolicy::Allow,
            Some("deny") => self.fallback = FallbackPolicy::Deny,
            Some(other) => tracing::warn!("Ignoring unknown ZERO_SANDBOX_FALLBACK value: {}", other),
            None => {}
        }
        self.sandbox.validate();
        if self.pool.max_size == 0 {
            self.pool.max_size = DEFAULT_POOL_SIZE;
        }
    }

    fn normalized(mut self) -> Self {
        self.sandbox.expand_mounts();
        self.sandbox.validate();
        if self.pool.max_size == 0 {
            self.pool.max_size = DEFAULT_POOL_SIZE;
        }
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
