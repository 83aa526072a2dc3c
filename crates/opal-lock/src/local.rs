//! Local timed reader-writer lock
//!
//! The single-node RW primitive behind namespace lock entries. Unlike the
//! standard library lock it takes a deadline on acquire and releases by
//! explicit call rather than guard drop, which is what the namespace map
//! needs to hand one shared primitive to many tasks.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::RwLocker;

/// Bounds for the acquire retry sleep, in milliseconds.
const RETRY_MIN_MS: u64 = 2;
const RETRY_MAX_MS: u64 = 20;

#[derive(Default)]
struct State {
    writer: bool,
    readers: usize,
}

/// A reader-writer lock with timed acquire and explicit release
#[derive(Default)]
pub struct LocalRwLock {
    state: Mutex<State>,
}

impl LocalRwLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(&self, read: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if read {
                    if !state.writer {
                        state.readers += 1;
                        return true;
                    }
                } else if !state.writer && state.readers == 0 {
                    state.writer = true;
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            let nap =
                Duration::from_millis(rand::thread_rng().gen_range(RETRY_MIN_MS..=RETRY_MAX_MS));
            tokio::time::sleep(nap.min(remaining)).await;
        }
    }
}

#[async_trait]
impl RwLocker for LocalRwLock {
    async fn get_lock(&self, timeout: Duration) -> bool {
        self.acquire(false, timeout).await
    }

    async fn get_rlock(&self, timeout: Duration) -> bool {
        self.acquire(true, timeout).await
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        if !state.writer {
            // Releasing an unheld lock is a caller bug; tolerate it.
            warn!("unlock called without a held write lock");
            return;
        }
        state.writer = false;
    }

    fn runlock(&self) {
        let mut state = self.state.lock();
        if state.readers == 0 {
            warn!("runlock called without a held read lock");
            return;
        }
        state.readers -= 1;
    }

    fn force_unlock(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        state.readers = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_excludes_write() {
        let lk = Arc::new(LocalRwLock::new());
        assert!(lk.get_lock(Duration::from_millis(50)).await);
        assert!(!lk.get_lock(Duration::from_millis(50)).await);
        lk.unlock();
        assert!(lk.get_lock(Duration::from_millis(50)).await);
        lk.unlock();
    }

    #[tokio::test]
    async fn test_readers_share_writers_wait() {
        let lk = Arc::new(LocalRwLock::new());
        assert!(lk.get_rlock(Duration::from_millis(50)).await);
        assert!(lk.get_rlock(Duration::from_millis(50)).await);
        assert!(!lk.get_lock(Duration::from_millis(50)).await);
        lk.runlock();
        assert!(!lk.get_lock(Duration::from_millis(50)).await);
        lk.runlock();
        assert!(lk.get_lock(Duration::from_millis(100)).await);
        lk.unlock();
    }

    #[tokio::test]
    async fn test_writer_blocks_readers() {
        let lk = Arc::new(LocalRwLock::new());
        assert!(lk.get_lock(Duration::from_millis(50)).await);
        assert!(!lk.get_rlock(Duration::from_millis(50)).await);
        lk.unlock();
        assert!(lk.get_rlock(Duration::from_millis(50)).await);
        lk.runlock();
    }

    #[tokio::test]
    async fn test_release_without_hold_is_tolerated() {
        let lk = LocalRwLock::new();
        lk.unlock();
        lk.runlock();
        assert!(lk.get_lock(Duration::from_millis(20)).await);
        lk.unlock();
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let lk = Arc::new(LocalRwLock::new());
        assert!(lk.get_lock(Duration::from_millis(20)).await);

        let waiter = {
            let lk = lk.clone();
            tokio::spawn(async move { lk.get_lock(Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lk.unlock();
        assert!(waiter.await.unwrap());
    }
}
