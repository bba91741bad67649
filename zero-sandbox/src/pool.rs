//! Bounded pool of reusable sandboxes.
//!
//! Available sandboxes sit in a bounded channel; the number of live sandboxes
//! (available plus checked out) is an atomic counter reserved with CAS, so it
//! never exceeds `max_size`. Acquirers that find the pool full wait for a
//! release, for a slot freed by destruction, for pool shutdown, or for their
//! own cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{PoolSettings, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::sandbox::{cancellable, ContainerRuntime, ExecOutput, Sandbox};

/// Upper bound on a background warmup.
pub const WARMUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Live-sandbox count shared between the pool and its slots.
#[derive(Debug, Default)]
struct Slots {
    created: AtomicUsize,
    freed: Notify,
}

impl Slots {
    fn free(&self) {
        let _ = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.freed.notify_one();
    }
}

/// One unit of pool capacity. It travels with its sandbox and is freed when
/// the sandbox is dropped, wherever that happens.
#[derive(Debug)]
pub(crate) struct PoolSlot {
    slots: Arc<Slots>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.slots.free();
    }
}

/// Bounded set of pre-started sandboxes.
pub struct Pool {
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
    max_size: usize,
    available_tx: mpsc::Sender<Sandbox>,
    available_rx: Mutex<mpsc::Receiver<Sandbox>>,
    slots: Arc<Slots>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("image", &self.config.image)
            .field("max_size", &self.max_size)
            .field("created", &self.created())
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create an empty pool. A `max_size` of 0 is treated as 1.
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        let (available_tx, available_rx) = mpsc::channel(max_size);
        Self {
            config: config.validated(),
            runtime,
            max_size,
            available_tx,
            available_rx: Mutex::new(available_rx),
            slots: Arc::new(Slots::default()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool sized from settings, warming up in the background when asked to.
    pub fn from_settings(
        config: SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
        settings: &PoolSettings,
    ) -> Arc<Self> {
        let pool = Arc::new(Self::new(config, runtime, settings.max_size));
        if settings.warmup > 0 {
            drop(pool.warmup_async(settings.warmup));
        }
        pool
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Live sandboxes, checked out or available.
    pub fn created(&self) -> usize {
        self.slots.created.load(Ordering::Acquire)
    }

    /// Sandboxes waiting to be acquired.
    pub fn available(&self) -> usize {
        self.max_size - self.available_tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn try_reserve(&self) -> Option<PoolSlot> {
        self.slots
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_size).then_some(n + 1)
            })
            .ok()
            .map(|_| PoolSlot {
                slots: Arc::clone(&self.slots),
            })
    }

    /// Start a sandbox in an already reserved slot.
    async fn create(&self, cancel: &CancellationToken, slot: PoolSlot) -> Result<Sandbox> {
        let sandbox = Sandbox::new(self.config.clone(), Arc::clone(&self.runtime)).with_slot(slot);
        sandbox.start(cancel).await?;

        if self.is_closed() {
            self.destroy(sandbox).await;
            return Err(SandboxError::PoolClosed);
        }
        tracing::debug!(created = self.created(), max = self.max_size, "Pool created sandbox");
        Ok(sandbox)
    }

    /// Close a sandbox; dropping it frees its slot.
    async fn destroy(&self, sandbox: Sandbox) {
        if let Err(e) = sandbox.close().await {
            tracing::warn!("Failed to close pooled sandbox: {}", e);
        }
    }

    fn try_take(&self) -> Option<Sandbox> {
        // A locked receiver means a waiter is already taking from the queue
        self.available_rx.try_lock().ok()?.try_recv().ok()
    }

    async fn recv(&self) -> Option<Sandbox> {
        self.available_rx.lock().await.recv().await
    }

    /// Check out a sandbox, creating one if below capacity, otherwise waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Sandbox> {
        loop {
            if self.is_closed() {
                return Err(SandboxError::PoolClosed);
            }

            if let Some(sandbox) = self.try_take() {
                if sandbox.is_alive().await {
                    return Ok(sandbox);
                }
                tracing::info!("Discarding dead pooled sandbox");
                self.destroy(sandbox).await;
                continue;
            }

            if let Some(slot) = self.try_reserve() {
                return self.create(cancel, slot).await;
            }

            let notified = self.slots.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.created() < self.max_size {
                continue;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SandboxError::Cancelled),
                () = self.shutdown.cancelled() => return Err(SandboxError::PoolClosed),
                () = &mut notified => continue,
                received = self.recv() => {
                    let Some(sandbox) = received else {
                        return Err(SandboxError::PoolClosed);
                    };
                    if sandbox.is_alive().await {
                        return Ok(sandbox);
                    }
                    tracing::info!("Discarding dead pooled sandbox");
                    self.destroy(sandbox).await;
                }
            }
        }
    }

    /// Return a sandbox. Closed pools and stopped sandboxes destroy it instead.
    pub async fn release(&self, sandbox: Sandbox) {
        if self.is_closed() || !sandbox.is_running() {
            self.destroy(sandbox).await;
            return;
        }

        match self.available_tx.try_send(sandbox) {
            Ok(()) => {
                // Close may have drained between the check and the send
                if self.is_closed() {
                    self.drain().await;
                }
            }
            Err(TrySendError::Full(sandbox) | TrySendError::Closed(sandbox)) => {
                tracing::debug!("Pool has no room, destroying surplus sandbox");
                self.destroy(sandbox).await;
            }
        }
    }

    /// Reset, then release. A failed reset destroys the sandbox.
    pub async fn release_with_reset(&self, cancel: &CancellationToken, sandbox: Sandbox) {
        if self.is_closed() {
            self.destroy(sandbox).await;
            return;
        }
        match sandbox.reset(cancel).await {
            Ok(()) => self.release(sandbox).await,
            Err(e) => {
                tracing::warn!("Sandbox reset failed, destroying: {}", e);
                self.destroy(sandbox).await;
            }
        }
    }

    /// Pre-start up to `count` sandboxes (capped at `max_size`) in parallel.
    /// Only the first creation error is reported.
    pub async fn warmup(&self, cancel: &CancellationToken, count: usize) -> Result<()> {
        if self.is_closed() {
            return Err(SandboxError::PoolClosed);
        }
        let count = count.min(self.max_size);

        let results = join_all((0..count).map(|_| async {
            let Some(slot) = self.try_reserve() else {
                return Ok(());
            };
            let sandbox = self.create(cancel, slot).await?;
            self.release(sandbox).await;
            Ok::<(), SandboxError>(())
        }))
        .await;

        tracing::info!(
            requested = count,
            created = self.created(),
            available = self.available(),
            "Sandbox pool warmed up"
        );

        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// [`warmup`](Self::warmup) in the background, bounded by [`WARMUP_TIMEOUT`].
    pub fn warmup_async(self: &Arc<Self>, count: usize) -> JoinHandle<Result<()>> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = pool.shutdown.child_token();
            let warmup = pool.warmup(&cancel, count);
            tokio::pin!(warmup);

            let result = tokio::select! {
                res = &mut warmup => res,
                () = tokio::time::sleep(WARMUP_TIMEOUT) => {
                    cancel.cancel();
                    warmup.await
                }
            };
            if let Err(e) = &result {
                tracing::warn!("Background pool warmup failed: {}", e);
            }
            result
        })
    }

    /// Acquire, run an argv, release on every path. A dropped call drops the
    /// checked-out sandbox, which removes its container and frees its slot.
    pub async fn execute_in_pool(&self, cancel: &CancellationToken, argv: &[String]) -> Result<ExecOutput> {
        let sandbox = self.acquire(cancel).await?;
        let result = sandbox.execute(cancel, argv).await;
        self.release(sandbox).await;
        result
    }

    /// Acquire, run a shell command, release on every path.
    pub async fn execute_shell_in_pool(&self, cancel: &CancellationToken, command: &str) -> Result<ExecOutput> {
        let sandbox = self.acquire(cancel).await?;
        let result = sandbox.execute_shell(cancel, command).await;
        self.release(sandbox).await;
        result
    }

    /// Ping the runtime through a throwaway sandbox, leaving capacity alone.
    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        let probe = Sandbox::new(self.config.clone(), Arc::clone(&self.runtime));
        cancellable(cancel, probe.ping()).await
    }

    /// Close the pool and destroy every available sandbox. Idempotent.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.shutdown.cancel();
        let destroyed = self.drain().await;
        tracing::info!(destroyed, checked_out = self.created(), "Sandbox pool closed");
    }

    async fn drain(&self) -> usize {
        let mut drained = Vec::new();
        {
            let mut rx = self.available_rx.lock().await;
            while let Ok(sandbox) = rx.try_recv() {
                drained.push(sandbox);
            }
        }
        let count = drained.len();
        join_all(drained.into_iter().map(|sandbox| self.destroy(sandbox))).await;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::MockContainerRuntime;

    fn lifecycle_mock() -> MockContainerRuntime {
        let mut mock = MockContainerRuntime::new();
        mock.expect_image_exists().returning(|_| Ok(true));
        mock.expect_create_container()
            .returning(|_| Ok(uuid::Uuid::new_v4().to_string()));
        mock.expect_start_container().returning(|_| Ok(()));
        mock.expect_stop_container().returning(|_, _| Ok(()));
        mock.expect_is_container_running().returning(|_| Ok(true));
        mock
    }

    #[test]
    fn zero_max_size_becomes_one() {
        let pool = Pool::new(SandboxConfig::default(), Arc::new(MockContainerRuntime::new()), 0);
        assert_eq!(pool.max_size(), 1);
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn reservations_never_exceed_max() {
        let pool = Pool::new(SandboxConfig::default(), Arc::new(MockContainerRuntime::new()), 2);
        let a = pool.try_reserve().unwrap();
        let b = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_none());
        assert_eq!(pool.created(), 2);

        drop(a);
        assert_eq!(pool.created(), 1);
        let c = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_none());
        drop((b, c));
        assert_eq!(pool.created(), 0);
    }

    #[tokio::test]
    async fn dropped_checkout_frees_its_slot() {
        let mut mock = lifecycle_mock();
        mock.expect_remove_container().returning(|_| Ok(()));
        let pool = Pool::new(SandboxConfig::default(), Arc::new(mock), 1);
        let cancel = CancellationToken::new();

        let sandbox = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.created(), 1);
        drop(sandbox);
        assert_eq!(pool.created(), 0);

        let again = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&cancel))
            .await
            .expect("acquire should not wait on a dropped checkout")
            .unwrap();
        assert_eq!(pool.created(), 1);
        pool.release(again).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn failed_start_frees_slot() {
        let mut mock = MockContainerRuntime::new();
        mock.expect_image_exists()
            .returning(|_| Err(SandboxError::Runtime("boom".into())));
        let pool = Pool::new(SandboxConfig::default(), Arc::new(mock), 1);

        let err = pool.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
        assert_eq!(pool.created(), 0);
    }

    #[tokio::test]
    async fn release_reuses_sandbox() {
        let pool = Pool::new(SandboxConfig::default(), Arc::new(lifecycle_mock()), 1);
        let cancel = CancellationToken::new();

        let sb = pool.acquire(&cancel).await.unwrap();
        let id = sb.container_id();
        pool.release(sb).await;
        assert_eq!(pool.available(), 1);

        let again = pool.acquire(&cancel).await.unwrap();
        assert_eq!(again.container_id(), id);
        assert_eq!(pool.created(), 1);
        pool.release(again).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn acquire_pends_until_release() {
        let pool = Pool::new(SandboxConfig::default(), Arc::new(lifecycle_mock()), 1);
        let cancel = CancellationToken::new();
        let held = pool.acquire(&cancel).await.unwrap();

        let mut waiting = tokio_test::task::spawn(pool.acquire(&cancel));
        tokio_test::assert_pending!(waiting.poll());
        assert_eq!(pool.created(), 1);

        pool.release(held).await;
        assert!(waiting.is_woken());
        let sandbox = tokio_test::assert_ready_ok!(waiting.poll());
        drop(waiting);

        pool.release(sandbox).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn acquire_after_close_fails_fast() {
        let pool = Pool::new(SandboxConfig::default(), Arc::new(lifecycle_mock()), 1);
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire(&CancellationToken::new()).await,
            Err(SandboxError::PoolClosed)
        ));
    }
}
