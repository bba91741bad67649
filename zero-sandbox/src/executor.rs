//! Backend-agnostic execution.
//!
//! [`Executor`] is implemented by [`Sandbox`], [`Pool`] and [`LocalExecutor`]
//! so callers don't care which backend they got. [`ExecutorFactory`] picks
//! one: a started container sandbox when the runtime is reachable, otherwise
//! a local executor if [`FallbackPolicy::Allow`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::local::{LocalConfig, LocalExecutor};
use crate::pool::Pool;
use crate::sandbox::{ContainerRuntime, DockerRuntime, ExecOutput, Sandbox};

/// Which isolation an executor provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Container-isolated
    Container,
    /// Plain local process
    Local,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// What the factory does when the container runtime is unusable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Degrade to local execution with a warning
    #[default]
    Allow,
    /// Fail with `BackendUnavailable`
    Deny,
}

/// Runs guarded commands.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run an argv.
    async fn execute(&self, cancel: &CancellationToken, argv: &[String]) -> Result<ExecOutput>;

    /// Run a shell command string.
    async fn execute_shell(&self, cancel: &CancellationToken, command: &str) -> Result<ExecOutput>;

    /// The isolation this executor provides.
    fn backend(&self) -> Backend;

    /// Release backend resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Executor for Sandbox {
    async fn execute(&self, cancel: &CancellationToken, argv: &[String]) -> Result<ExecOutput> {
        Sandbox::execute(self, cancel, argv).await
    }

    async fn execute_shell(&self, cancel: &CancellationToken, command: &str) -> Result<ExecOutput> {
        Sandbox::execute_shell(self, cancel, command).await
    }

    fn backend(&self) -> Backend {
        Backend::Container
    }

    async fn close(&self) -> Result<()> {
        Sandbox::close(self).await
    }
}

#[async_trait]
impl Executor for Pool {
    async fn execute(&self, cancel: &CancellationToken, argv: &[String]) -> Result<ExecOutput> {
        self.execute_in_pool(cancel, argv).await
    }

    async fn execute_shell(&self, cancel: &CancellationToken, command: &str) -> Result<ExecOutput> {
        self.execute_shell_in_pool(cancel, command).await
    }

    fn backend(&self) -> Backend {
        Backend::Container
    }

    async fn close(&self) -> Result<()> {
        Pool::close(self).await;
        Ok(())
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, cancel: &CancellationToken, argv: &[String]) -> Result<ExecOutput> {
        LocalExecutor::execute(self, cancel, argv).await
    }

    async fn execute_shell(&self, cancel: &CancellationToken, command: &str) -> Result<ExecOutput> {
        LocalExecutor::execute_shell(self, cancel, command).await
    }

    fn backend(&self) -> Backend {
        Backend::Local
    }
}

/// Builds an [`Executor`], falling back per [`FallbackPolicy`].
#[derive(Debug, Clone, Default)]
pub struct ExecutorFactory {
    config: SandboxConfig,
    local: LocalConfig,
    fallback: FallbackPolicy,
}

impl ExecutorFactory {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Factory for a loaded engine config.
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            config: engine.sandbox.clone(),
            local: engine.local.clone(),
            fallback: engine.fallback,
        }
    }

    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = policy;
        self
    }

    pub fn with_local(mut self, local: LocalConfig) -> Self {
        self.local = local;
        self
    }

    /// Connect to Docker and build.
    pub async fn build(&self, cancel: &CancellationToken) -> Result<Box<dyn Executor>> {
        self.build_with(cancel, || {
            DockerRuntime::connect().map(|rt| Arc::new(rt) as Arc<dyn ContainerRuntime>)
        })
        .await
    }

    /// Build using a custom runtime connector.
    pub async fn build_with<F>(&self, cancel: &CancellationToken, connect: F) -> Result<Box<dyn Executor>>
    where
        F: FnOnce() -> Result<Arc<dyn ContainerRuntime>> + Send,
    {
        match self.start_sandbox(cancel, connect).await {
            Ok(sandbox) => Ok(Box::new(sandbox)),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => match self.fallback {
                FallbackPolicy::Allow => {
                    tracing::warn!(
                        error = %e,
                        "Container runtime unusable, falling back to local execution without isolation"
                    );
                    Ok(Box::new(self.local_executor()))
                }
                FallbackPolicy::Deny => {
                    tracing::error!(error = %e, "Container runtime unusable and fallback is denied");
                    match e {
                        SandboxError::BackendUnavailable(_) => Err(e),
                        other => Err(SandboxError::BackendUnavailable(other.to_string())),
                    }
                }
            },
        }
    }

    async fn start_sandbox<F>(&self, cancel: &CancellationToken, connect: F) -> Result<Sandbox>
    where
        F: FnOnce() -> Result<Arc<dyn ContainerRuntime>> + Send,
    {
        let runtime = connect()?;
        runtime.ping().await?;
        let sandbox = Sandbox::new(self.config.clone(), runtime);
        sandbox.start(cancel).await?;
        Ok(sandbox)
    }

    /// The fallback executor: local settings with the sandbox timeout, and the
    /// sandbox work dir when it exists on this host and none is configured.
    pub fn local_executor(&self) -> LocalExecutor {
        let mut local = self.local.clone();
        local.timeout = self.config.timeout;
        if local.work_dir.is_none() {
            let dir = PathBuf::from(&self.config.work_dir);
            if dir.is_dir() {
                local.work_dir = Some(dir);
            }
        }
        LocalExecutor::new(local)
    }
}

/// Always returns an executor: a container sandbox if possible, otherwise local.
///
/// Check [`Executor::backend`] or [`container_runtime_available`] when the
/// isolation level matters.
pub async fn new_executor(config: SandboxConfig) -> Box<dyn Executor> {
    let factory = ExecutorFactory::new(config);
    match factory.build(&CancellationToken::new()).await {
        Ok(executor) => executor,
        Err(_) => Box::new(factory.local_executor()),
    }
}

/// Whether the Docker daemon is reachable.
pub async fn container_runtime_available() -> bool {
    match DockerRuntime::connect() {
        Ok(runtime) => runtime.ping().await.is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::MockContainerRuntime;
    use std::time::Duration;

    fn unreachable() -> Result<Arc<dyn ContainerRuntime>> {
        Err(SandboxError::BackendUnavailable("connection refused".into()))
    }

    #[tokio::test]
    async fn allow_falls_back_to_local() {
        let config = SandboxConfig::default().with_timeout(Duration::from_secs(7));
        let executor = ExecutorFactory::new(config)
            .build_with(&CancellationToken::new(), unreachable)
            .await
            .unwrap();
        assert_eq!(executor.backend(), Backend::Local);
    }

    #[tokio::test]
    async fn deny_surfaces_backend_unavailable() {
        let err = ExecutorFactory::new(SandboxConfig::default())
            .with_fallback(FallbackPolicy::Deny)
            .build_with(&CancellationToken::new(), unreachable)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn failed_ping_falls_back() {
        let executor = ExecutorFactory::new(SandboxConfig::default())
            .build_with(&CancellationToken::new(), || {
                let mut mock = MockContainerRuntime::new();
                mock.expect_ping()
                    .returning(|| Err(SandboxError::BackendUnavailable("daemon down".into())));
                Ok(Arc::new(mock) as Arc<dyn ContainerRuntime>)
            })
            .await
            .unwrap();
        assert_eq!(executor.backend(), Backend::Local);
    }

    #[tokio::test]
    async fn failed_start_is_wrapped_when_denied() {
        let err = ExecutorFactory::new(SandboxConfig::default())
            .with_fallback(FallbackPolicy::Deny)
            .build_with(&CancellationToken::new(), || {
                let mut mock = MockContainerRuntime::new();
                mock.expect_ping().returning(|| Ok(()));
                mock.expect_image_exists()
                    .returning(|_| Err(SandboxError::Runtime("registry unreachable".into())));
                Ok(Arc::new(mock) as Arc<dyn ContainerRuntime>)
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::BackendUnavailable(msg) if msg.contains("registry unreachable")));
    }

    #[tokio::test]
    async fn healthy_runtime_yields_container_backend() {
        let executor = ExecutorFactory::new(SandboxConfig::default())
            .with_fallback(FallbackPolicy::Deny)
            .build_with(&CancellationToken::new(), || {
                let mut mock = MockContainerRuntime::new();
                mock.expect_ping().returning(|| Ok(()));
                mock.expect_image_exists().returning(|_| Ok(true));
                mock.expect_create_container().returning(|_| Ok("c-1".into()));
                mock.expect_start_container().returning(|_| Ok(()));
                mock.expect_stop_container().returning(|_, _| Ok(()));
                Ok(Arc::new(mock) as Arc<dyn ContainerRuntime>)
            })
            .await
            .unwrap();
        assert_eq!(executor.backend(), Backend::Container);
        executor.close().await.unwrap();
    }

    #[test]
    fn local_executor_inherits_timeout() {
        let factory = ExecutorFactory::new(
            SandboxConfig::default()
                .with_timeout(Duration::from_secs(9))
                .with_work_dir("/no/such/host/dir"),
        );
        let local = factory.local_executor();
        assert_eq!(local.config().timeout, Duration::from_secs(9));
        assert!(local.config().work_dir.is_none());
    }

    #[test]
    fn fallback_policy_serde() {
        assert_eq!(FallbackPolicy::default(), FallbackPolicy::Allow);
        let p: FallbackPolicy = serde_json::from_str("\"deny\"").unwrap();
        assert_eq!(p, FallbackPolicy::Deny);
        assert_eq!(Backend::Local.to_string(), "local");
    }
}
