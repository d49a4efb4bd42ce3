//! Keyed cache of long-lived spawners.
//!
//! One pool per tier. Creation is single-flight per key, failures are handed
//! to every waiter and never cached, and a background reaper evicts spawners
//! that sat unused past their idle timeout.

mod handle;

pub use handle::SpawnerHandle;

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{PoolTier, SpawnError, SpawnResult};
use crate::spawner::Spawner;

type CreationOutcome<S> = Option<Result<Arc<SpawnerHandle<S>>, SpawnError>>;

enum Slot<S: ?Sized> {
    Ready(Arc<SpawnerHandle<S>>),
    /// A creation is in flight; the receiver yields its outcome.
    Creating(watch::Receiver<CreationOutcome<S>>),
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Cached spawners.
    pub ready: usize,
    /// Creations in flight.
    pub creating: usize,
    /// Cached spawners with at least one in-flight request.
    pub busy: usize,
}

/// A pool of spawners keyed by `K`.
pub struct SpawnerPool<K, S: ?Sized> {
    tier: PoolTier,
    default_timeout: Duration,
    slots: Mutex<HashMap<K, Slot<S>>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl<K, S> SpawnerPool<K, S>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    S: ?Sized + Spawner + 'static,
{
    /// Create a pool. `default_timeout` applies when a caller passes 0.
    pub fn new(tier: PoolTier, default_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tier,
            default_timeout,
            slots: Mutex::new(HashMap::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn tier(&self) -> PoolTier {
        self.tier
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Idle timeout for a requested value in seconds (0 = pool default).
    pub fn effective_timeout(&self, timeout_secs: u32) -> Duration {
        if timeout_secs == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(u64::from(timeout_secs))
        }
    }

    /// Return the live spawner for `key`, creating it with `factory` if
    /// needed.
    ///
    /// The returned handle is acquired; pass it to [`Self::release`] when
    /// the dependent spawn is done. Concurrent callers for the same key
    /// share one creation; `factory` runs at most once per call and only in
    /// the caller that won the slot.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: K,
        timeout_secs: u32,
        factory: F,
    ) -> SpawnResult<Arc<SpawnerHandle<S>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SpawnResult<Arc<S>>>,
    {
        let tx = loop {
            let mut slots = self.slots.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(
                    self.creation_error(&key, SpawnError::PoolClosed { tier: self.tier })
                );
            }
            let existing = match slots.get(&key) {
                Some(Slot::Ready(handle)) => {
                    handle.acquire();
                    Ok(handle.clone())
                }
                Some(Slot::Creating(rx)) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), Slot::Creating(rx));
                    break tx;
                }
            };
            drop(slots);

            match existing {
                Ok(handle) => {
                    if handle.spawner().is_alive().await {
                        return Ok(handle);
                    }
                    self.discard_dead(&key, &handle).await;
                }
                Err(mut rx) => {
                    let waited = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => {
                            Some(outcome.as_ref().and_then(|o| o.as_ref().err().cloned()))
                        }
                        Err(_) => None,
                    };
                    match waited {
                        Some(Some(e)) => return Err(self.creation_error(&key, e)),
                        // Created; the next pass acquires it.
                        Some(None) => {}
                        None => self.clear_abandoned(&key, &rx).await,
                    }
                }
            }
        };

        let timeout = self.effective_timeout(timeout_secs);
        debug!("Creating {} spawner for {}", self.tier, key);
        let created = factory().await;

        let mut orphan = None;
        let outcome = {
            let mut slots = self.slots.lock().await;
            match created {
                // Shut down while we were creating; the slot was already drained.
                Ok(spawner) if self.closed.load(Ordering::SeqCst) => {
                    slots.remove(&key);
                    orphan = Some(spawner);
                    Err(SpawnError::PoolClosed { tier: self.tier })
                }
                Ok(spawner) => {
                    let handle = Arc::new(SpawnerHandle::new(spawner, timeout));
                    handle.acquire();
                    slots.insert(key.clone(), Slot::Ready(handle.clone()));
                    info!(
                        "Created {} spawner for {} (pid={}, timeout={}s)",
                        self.tier,
                        key,
                        handle.spawner().pid(),
                        timeout.as_secs()
                    );
                    Ok(handle)
                }
                Err(e) => {
                    slots.remove(&key);
                    warn!("Failed to create {} spawner for {}: {}", self.tier, key, e);
                    Err(e)
                }
            }
        };

        // No receivers left just means nobody was waiting.
        let _ = tx.send(Some(outcome.clone()));
        if let Some(spawner) = orphan {
            info!(
                "{} pool closed while creating spawner for {}, stopping pid={}",
                self.tier,
                key,
                spawner.pid()
            );
            spawner.shutdown().await;
        }
        outcome.map_err(|e| self.creation_error(&key, e))
    }

    /// Give back a handle obtained from [`Self::get_or_create`].
    pub async fn release(&self, handle: &Arc<SpawnerHandle<S>>) {
        let stop = {
            let _slots = self.slots.lock().await;
            handle.release() == 0 && handle.is_retired()
        };
        if stop {
            debug!(
                "Last user released retired {} spawner pid={}",
                self.tier,
                handle.spawner().pid()
            );
            handle.spawner().shutdown().await;
        }
    }

    /// Evict spawners idle past their timeout. Returns the number evicted.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut slots = self.slots.lock().await;
            slots.retain(|key, slot| match slot {
                Slot::Ready(handle) if handle.is_expired(now) => {
                    handle.retire();
                    expired.push((key.clone(), handle.clone()));
                    false
                }
                _ => true,
            });
        }

        let count = expired.len();
        for (key, handle) in expired {
            info!(
                "Evicting {} spawner for {} (pid={}) after {}s idle",
                self.tier,
                key,
                handle.spawner().pid(),
                handle.idle_for(now).as_secs()
            );
            handle.spawner().shutdown().await;
        }
        count
    }

    /// Retire every cached spawner whose key matches. Idle ones are shut
    /// down now, busy ones on their last release. Returns how many were
    /// retired.
    pub async fn remove_where<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let mut idle = Vec::new();
        let mut retired = 0;
        {
            let mut slots = self.slots.lock().await;
            slots.retain(|key, slot| match slot {
                Slot::Ready(handle) if predicate(key) => {
                    handle.retire();
                    retired += 1;
                    if handle.refcount() == 0 {
                        idle.push(handle.clone());
                    }
                    false
                }
                _ => true,
            });
        }

        for handle in idle {
            handle.spawner().shutdown().await;
        }
        if retired > 0 {
            info!("Retired {} {} spawner(s)", retired, self.tier);
        }
        retired
    }

    /// Number of cached spawners.
    pub async fn len(&self) -> usize {
        self.stats().await.ready
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        slots.values().fold(PoolStats::default(), |mut stats, slot| {
            match slot {
                Slot::Ready(handle) => {
                    stats.ready += 1;
                    if handle.refcount() > 0 {
                        stats.busy += 1;
                    }
                }
                Slot::Creating(_) => stats.creating += 1,
            }
            stats
        })
    }

    /// Run the reaper until [`Self::shutdown`].
    pub async fn reaper_loop(self: Arc<Self>, interval: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.reap_idle().await;
                    if evicted > 0 {
                        debug!("{} reaper evicted {} spawner(s)", self.tier, evicted);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("{} reaper shutting down", self.tier);
                    break;
                }
            }
        }
    }

    /// Start [`Self::reaper_loop`] on its own task.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).reaper_loop(interval))
    }

    /// Stop the reaper and shut down every cached spawner.
    ///
    /// Later [`Self::get_or_create`] calls fail with
    /// [`SpawnError::PoolClosed`]; a spawner whose creation is still in
    /// flight is shut down as soon as it is ready.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<(K, Arc<SpawnerHandle<S>>)> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(handle) => Some((key, handle)),
                    Slot::Creating(_) => None,
                })
                .collect()
        };

        info!("Shutting down {} {} spawner(s)", handles.len(), self.tier);
        for (key, handle) in handles {
            handle.retire();
            if handle.refcount() > 0 {
                warn!(
                    "{} spawner for {} still has {} user(s) at shutdown",
                    self.tier,
                    key,
                    handle.refcount()
                );
            }
            handle.spawner().shutdown().await;
        }
    }

    async fn discard_dead(&self, key: &K, handle: &Arc<SpawnerHandle<S>>) {
        let stop = {
            let mut slots = self.slots.lock().await;
            if matches!(slots.get(key), Some(Slot::Ready(current)) if Arc::ptr_eq(current, handle)) {
                slots.remove(key);
            }
            handle.retire();
            handle.release() == 0
        };
        warn!(
            "Cached {} spawner for {} (pid={}) is dead, replacing it",
            self.tier,
            key,
            handle.spawner().pid()
        );
        if stop {
            handle.spawner().shutdown().await;
        }
    }

    async fn clear_abandoned(&self, key: &K, rx: &watch::Receiver<CreationOutcome<S>>) {
        let mut slots = self.slots.lock().await;
        if matches!(slots.get(key), Some(Slot::Creating(current)) if current.same_channel(rx)) {
            debug!("Creation of {} spawner for {} was abandoned", self.tier, key);
            slots.remove(key);
        }
    }

    fn creation_error(&self, key: &K, source: SpawnError) -> SpawnError {
        SpawnError::PoolCreation {
            tier: self.tier,
            key: key.to_string(),
            source: Arc::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LaunchError, LaunchFailureKind};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeSpawner {
        pid: u32,
        dead: AtomicBool,
        shutdowns: AtomicUsize,
    }

    impl FakeSpawner {
        fn with_pid(pid: u32) -> Arc<Self> {
            Arc::new(Self {
                pid,
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Spawner for FakeSpawner {
        fn pid(&self) -> u32 {
            self.pid
        }

        async fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestPool = SpawnerPool<String, FakeSpawner>;

    fn pool() -> Arc<TestPool> {
        Arc::new(SpawnerPool::new(
            PoolTier::Application,
            Duration::from_secs(600),
        ))
    }

    fn launch_failure() -> SpawnError {
        SpawnError::Launch(LaunchError::new(
            "hatch-helper",
            LaunchFailureKind::EarlyExit,
            "exit status 1",
        ))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_creation() {
        let pool = pool();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                pool.get_or_create("/srv/app".to_string(), 0, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(FakeSpawner::with_pid(100))
                })
                .await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(handles[0].refcount(), 16);

        for handle in &handles {
            pool.release(handle).await;
        }
        assert_eq!(handles[0].refcount(), 0);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_waiters_and_is_not_cached() {
        let pool = pool();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        let creator = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.get_or_create("/srv/broken".to_string(), 0, || async move {
                    let _ = gate_rx.await;
                    Err(launch_failure())
                })
                .await
            })
        };
        // Let the creator claim the slot.
        while pool.stats().await.creating == 0 {
            tokio::task::yield_now().await;
        }

        // A waiter that created its own spawner would succeed.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.get_or_create("/srv/broken".to_string(), 0, || async {
                    Ok(FakeSpawner::with_pid(99))
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate_tx.send(()).unwrap();

        for result in [creator.await.unwrap(), waiter.await.unwrap()] {
            match result {
                Err(SpawnError::PoolCreation { tier, key, source }) => {
                    assert_eq!(tier, PoolTier::Application);
                    assert_eq!(key, "/srv/broken");
                    assert!(matches!(*source, SpawnError::Launch(_)));
                }
                other => panic!("expected pool creation failure, got {other:?}"),
            }
        }
        assert!(pool.is_empty().await);

        let handle = pool
            .get_or_create("/srv/broken".to_string(), 0, || async {
                Ok(FakeSpawner::with_pid(7))
            })
            .await
            .unwrap();
        assert_eq!(handle.spawner().pid(), 7);
    }

    #[tokio::test]
    async fn test_dead_spawner_is_replaced() {
        let pool = pool();
        let first = pool
            .get_or_create("k".to_string(), 0, || async { Ok(FakeSpawner::with_pid(1)) })
            .await
            .unwrap();
        pool.release(&first).await;
        first.spawner().dead.store(true, Ordering::SeqCst);

        let second = pool
            .get_or_create("k".to_string(), 0, || async { Ok(FakeSpawner::with_pid(2)) })
            .await
            .unwrap();

        assert_eq!(second.spawner().pid(), 2);
        assert_eq!(first.spawner().shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_uses_pool_default() {
        let pool = pool();
        let handle = pool
            .get_or_create("k".to_string(), 0, || async { Ok(FakeSpawner::with_pid(1)) })
            .await
            .unwrap();
        assert_eq!(handle.timeout(), Duration::from_secs(600));

        let explicit = pool
            .get_or_create("other".to_string(), 30, || async { Ok(FakeSpawner::with_pid(2)) })
            .await
            .unwrap();
        assert_eq!(explicit.timeout(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_spawner_evicted_only_after_timeout() {
        let pool = pool();
        let handle = pool
            .get_or_create("k".to_string(), 60, || async { Ok(FakeSpawner::with_pid(1)) })
            .await
            .unwrap();
        pool.release(&handle).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(pool.reap_idle().await, 0);
        assert_eq!(pool.len().await, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pool.reap_idle().await, 1);
        assert!(pool.is_empty().await);
        assert_eq!(handle.spawner().shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_spawner_is_never_evicted() {
        let pool = pool();
        let handle = pool
            .get_or_create("k".to_string(), 1, || async { Ok(FakeSpawner::with_pid(1)) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(pool.reap_idle().await, 0);
        assert_eq!(handle.spawner().shutdowns.load(Ordering::SeqCst), 0);

        pool.release(&handle).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pool.reap_idle().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_loop_evicts_and_stops() {
        let pool = pool();
        let handle = pool
            .get_or_create("k".to_string(), 5, || async { Ok(FakeSpawner::with_pid(1)) })
            .await
            .unwrap();
        pool.release(&handle).await;

        let reaper = pool.spawn_reaper(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(pool.is_empty().await);

        pool.shutdown().await;
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_where_retires_busy_spawner_on_release() {
        let pool = pool();
        let busy = pool
            .get_or_create("/srv/a".to_string(), 0, || async { Ok(FakeSpawner::with_pid(1)) })
            .await
            .unwrap();
        let idle = pool
            .get_or_create("/srv/b".to_string(), 0, || async { Ok(FakeSpawner::with_pid(2)) })
            .await
            .unwrap();
        pool.release(&idle).await;

        assert_eq!(pool.remove_where(|_| true).await, 2);
        assert!(pool.is_empty().await);
        assert_eq!(idle.spawner().shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(busy.spawner().shutdowns.load(Ordering::SeqCst), 0);

        pool.release(&busy).await;
        assert_eq!(busy.spawner().shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_creation_is_retried() {
        let pool = pool();
        let creator = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.get_or_create("k".to_string(), 0, || async {
                    std::future::pending::<SpawnResult<Arc<FakeSpawner>>>().await
                })
                .await
            })
        };
        while pool.stats().await.creating == 0 {
            tokio::task::yield_now().await;
        }
        creator.abort();
        let _ = creator.await;

        let handle = pool
            .get_or_create("k".to_string(), 0, || async { Ok(FakeSpawner::with_pid(9)) })
            .await
            .unwrap();
        assert_eq!(handle.spawner().pid(), 9);
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_spawner() {
        let pool = pool();
        let a = pool
            .get_or_create("a".to_string(), 0, || async { Ok(FakeSpawner::with_pid(1)) })
            .await
            .unwrap();
        let b = pool
            .get_or_create("b".to_string(), 0, || async { Ok(FakeSpawner::with_pid(2)) })
            .await
            .unwrap();
        pool.release(&a).await;
        pool.release(&b).await;

        pool.shutdown().await;
        assert!(pool.is_empty().await);
        assert_eq!(a.spawner().shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(b.spawner().shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_creation_finishing_after_shutdown_is_stopped() {
        let pool = pool();
        let spawner = FakeSpawner::with_pid(5);
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        let creator = {
            let pool = pool.clone();
            let spawner = spawner.clone();
            tokio::spawn(async move {
                pool.get_or_create("k".to_string(), 0, || async move {
                    let _ = gate_rx.await;
                    Ok(spawner)
                })
                .await
            })
        };
        while pool.stats().await.creating == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown().await;
        gate_tx.send(()).unwrap();

        match creator.await.unwrap() {
            Err(SpawnError::PoolCreation { source, .. }) => {
                assert!(matches!(*source, SpawnError::PoolClosed { .. }));
            }
            other => panic!("expected closed pool error, got {other:?}"),
        }
        assert!(pool.is_empty().await);
        assert_eq!(spawner.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_creates_nothing() {
        let pool = pool();
        pool.shutdown().await;

        let calls = AtomicUsize::new(0);
        let result = pool
            .get_or_create("k2".to_string(), 0, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(FakeSpawner::with_pid(6))
            })
            .await;

        assert!(matches!(
            result,
            Err(SpawnError::PoolCreation { ref source, .. })
                if matches!(**source, SpawnError::PoolClosed { tier: PoolTier::Application })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(pool.is_empty().await);
    }
}
