//! Pooled spawner handle.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::spawner::Spawner;

/// A cached spawner with its usage bookkeeping.
///
/// Refcount, last-used time and the retired flag change only while the
/// owning pool's lock is held, so they are consistent with the pool map.
pub struct SpawnerHandle<S: ?Sized> {
    spawner: Arc<S>,
    refcount: AtomicUsize,
    last_used: Mutex<Instant>,
    timeout: Duration,
    retired: AtomicBool,
}

impl<S: ?Sized + Spawner> SpawnerHandle<S> {
    pub(crate) fn new(spawner: Arc<S>, timeout: Duration) -> Self {
        Self {
            spawner,
            refcount: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            timeout,
            retired: AtomicBool::new(false),
        }
    }

    /// The pooled spawner.
    pub fn spawner(&self) -> &Arc<S> {
        &self.spawner
    }

    /// Number of in-flight requests using this spawner.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Idle time after which the reaper may evict this spawner.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retired handles are out of the pool and shut down on last release.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.refcount() == 0 && self.idle_for(now) >= self.timeout
    }

    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// Drop one reference; returns the remaining count.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        self.touch();
        previous.saturating_sub(1)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

impl<S: ?Sized + Spawner> fmt::Debug for SpawnerHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnerHandle")
            .field("pid", &self.spawner.pid())
            .field("refcount", &self.refcount())
            .field("timeout", &self.timeout)
            .field("retired", &self.is_retired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Spawner for Idle {
        fn pid(&self) -> u32 {
            7
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_requires_zero_refcount_and_timeout() {
        let handle = SpawnerHandle::new(Arc::new(Idle), Duration::from_secs(60));
        handle.acquire();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(!handle.is_expired(Instant::now()));

        assert_eq!(handle.release(), 0);
        assert!(!handle.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!handle.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(handle.is_expired(Instant::now()));
    }

    #[test]
    fn test_release_never_underflows() {
        let handle = SpawnerHandle::new(Arc::new(Idle), Duration::from_secs(1));
        assert_eq!(handle.release(), 0);
        assert_eq!(handle.refcount(), 0);
    }
}
