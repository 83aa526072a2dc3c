//! Namespace lock map
//!
//! Serializes operations on logical `(volume, path)` pairs with
//! reader-writer semantics. One map-level mutex protects entry lookup and
//! reference counting and is released before blocking on the entry's RW
//! primitive, so one slow lock never stalls unrelated namespaces. The
//! same map drives single-node and distributed deployments; only the
//! primitive behind the entry changes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use opal_common::error::{Error, Result};

use crate::timeout::DynamicTimeout;
use crate::{LockType, RwLocker};

/// Per-operation lock state, `none → blocked → running → none`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Blocked,
    Running,
}

/// Instrumentation record for one in-flight lock operation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpsLockState {
    pub operation_id: String,
    pub lock_source: String,
    pub lock_type: LockType,
    pub status: LockStatus,
    pub since: DateTime<Utc>,
}

/// Lock details for one `(bucket, object)` as reported to admins
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeLockInfo {
    pub bucket: String,
    pub object: String,
    pub locks_on_object: u64,
    pub total_blocked_locks: u64,
    pub locks_acquired_on_object: u64,
    pub lock_details: Vec<OpsLockState>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct NsParam {
    volume: String,
    path: String,
}

struct NsEntry {
    locker: Arc<dyn RwLocker>,
    refs: usize,
}

#[derive(Default)]
struct DebugLockInfo {
    total: u64,
    blocked: u64,
    granted: u64,
    ops: HashMap<String, OpsLockState>,
}

#[derive(Default)]
struct Inner {
    lock_map: HashMap<NsParam, NsEntry>,
    debug_map: HashMap<NsParam, DebugLockInfo>,
}

/// Factory producing the RW primitive for a fresh `(volume, path)` entry.
pub type LockerFactory = Box<dyn Fn(&str, &str) -> Arc<dyn RwLocker> + Send + Sync>;

/// The namespace lock map
pub struct NsLockMap {
    inner: Mutex<Inner>,
    factory: LockerFactory,
    is_dist: bool,
}

impl NsLockMap {
    /// Map for a single-node deployment: entries are local RW locks.
    #[must_use]
    pub fn new_local() -> Arc<Self> {
        Self::with_factory(false, Box::new(|_, _| Arc::new(crate::LocalRwLock::new())))
    }

    /// Map with a caller-supplied primitive factory; used for the
    /// distributed variant and for fault injection in tests.
    #[must_use]
    pub fn with_factory(is_dist: bool, factory: LockerFactory) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            factory,
            is_dist,
        })
    }

    /// Obtain a lock instance for `(volume, path)`. The instance carries
    /// its own operation id; `source` names the calling operation for
    /// the instrumentation records.
    #[must_use]
    pub fn new_ns_lock(self: &Arc<Self>, volume: &str, path: &str, source: &str) -> NsLock {
        NsLock {
            ns: self.clone(),
            volume: volume.to_string(),
            path: path.to_string(),
            source: source.to_string(),
            ops_id: Uuid::new_v4().to_string(),
        }
    }

    async fn lock(
        &self,
        volume: &str,
        path: &str,
        source: &str,
        ops_id: &str,
        lock_type: LockType,
        timeout: Duration,
    ) -> bool {
        let param = NsParam {
            volume: volume.to_string(),
            path: path.to_string(),
        };

        // Entry lookup, reference count and debug state all mutate under
        // the map mutex, which is dropped before the blocking acquire.
        let locker = {
            let mut inner = self.inner.lock();
            let entry = inner.lock_map.entry(param.clone()).or_insert_with(|| NsEntry {
                locker: (self.factory)(volume, path),
                refs: 0,
            });
            entry.refs += 1;
            let locker = entry.locker.clone();

            let debug = inner.debug_map.entry(param.clone()).or_default();
            debug.total += 1;
            debug.blocked += 1;
            debug.ops.insert(
                ops_id.to_string(),
                OpsLockState {
                    operation_id: ops_id.to_string(),
                    lock_source: source.to_string(),
                    lock_type,
                    status: LockStatus::Blocked,
                    since: Utc::now(),
                },
            );
            locker
        };

        let locked = match lock_type {
            LockType::Read => locker.get_rlock(timeout).await,
            LockType::Write => locker.get_lock(timeout).await,
        };

        let mut inner = self.inner.lock();
        if locked {
            if let Some(debug) = inner.debug_map.get_mut(&param) {
                debug.blocked = debug.blocked.saturating_sub(1);
                debug.granted += 1;
                if let Some(op) = debug.ops.get_mut(ops_id) {
                    op.status = LockStatus::Running;
                }
            }
        } else {
            // Timed out: revert the reference count and debug state, and
            // drop the entry when nobody else is waiting on it.
            if let Some(entry) = inner.lock_map.get_mut(&param) {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs == 0 {
                    inner.lock_map.remove(&param);
                }
            }
            if let Some(debug) = inner.debug_map.get_mut(&param) {
                debug.blocked = debug.blocked.saturating_sub(1);
                debug.total = debug.total.saturating_sub(1);
                debug.ops.remove(ops_id);
                if debug.ops.is_empty() {
                    inner.debug_map.remove(&param);
                }
            }
        }
        locked
    }

    fn unlock(&self, volume: &str, path: &str, ops_id: &str, lock_type: LockType) {
        let param = NsParam {
            volume: volume.to_string(),
            path: path.to_string(),
        };
        let mut inner = self.inner.lock();
        let Some(entry) = inner.lock_map.get_mut(&param) else {
            warn!(volume, path, "unlock on unknown namespace entry");
            return;
        };
        match lock_type {
            LockType::Read => entry.locker.runlock(),
            LockType::Write => entry.locker.unlock(),
        }
        if entry.refs == 0 {
            warn!(volume, path, "namespace reference count already zero");
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            inner.lock_map.remove(&param);
        }

        if let Some(debug) = inner.debug_map.get_mut(&param) {
            debug.granted = debug.granted.saturating_sub(1);
            debug.total = debug.total.saturating_sub(1);
            debug.ops.remove(ops_id);
            if debug.ops.is_empty() {
                inner.debug_map.remove(&param);
            }
        }
    }

    /// Administrative unlock: drop the entry from the map so new
    /// operations proceed on a fresh primitive. Existing waiters keep
    /// blocking until their own timeout. In distributed mode the
    /// participating lock servers are told to drop their grants too.
    pub fn force_unlock(&self, volume: &str, path: &str) {
        if self.is_dist {
            let locker = (self.factory)(volume, path);
            locker.force_unlock();
        }
        let param = NsParam {
            volume: volume.to_string(),
            path: path.to_string(),
        };
        let mut inner = self.inner.lock();
        inner.lock_map.remove(&param);
        inner.debug_map.remove(&param);
    }

    /// Locks held or awaited under `bucket` and `prefix` for longer than
    /// `older_than`.
    #[must_use]
    pub fn list_locks(
        &self,
        bucket: &str,
        prefix: &str,
        older_than: Duration,
    ) -> Vec<VolumeLockInfo> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for (param, debug) in &inner.debug_map {
            if param.volume != bucket || !param.path.starts_with(prefix) {
                continue;
            }
            let details: Vec<OpsLockState> = debug
                .ops
                .values()
                .filter(|op| {
                    now.signed_duration_since(op.since).num_milliseconds() as u128
                        >= older_than.as_millis()
                })
                .cloned()
                .collect();
            if details.is_empty() {
                continue;
            }
            out.push(VolumeLockInfo {
                bucket: param.volume.clone(),
                object: param.path.clone(),
                locks_on_object: debug.total,
                total_blocked_locks: debug.blocked,
                locks_acquired_on_object: debug.granted,
                lock_details: details,
            });
        }
        out
    }

    /// Number of live namespace entries; instrumentation only.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().lock_map.len()
    }
}

/// Front-end lock instance for one `(volume, path)`
pub struct NsLock {
    ns: Arc<NsLockMap>,
    volume: String,
    path: String,
    source: String,
    ops_id: String,
}

impl NsLock {
    /// Block until the write lock is taken or the budget runs out.
    pub async fn get_lock(&self, timeout: &DynamicTimeout) -> Result<()> {
        self.acquire(LockType::Write, timeout).await
    }

    /// Block until a read lock is taken or the budget runs out.
    pub async fn get_rlock(&self, timeout: &DynamicTimeout) -> Result<()> {
        self.acquire(LockType::Read, timeout).await
    }

    async fn acquire(&self, lock_type: LockType, timeout: &DynamicTimeout) -> Result<()> {
        let start = Instant::now();
        let locked = self
            .ns
            .lock(
                &self.volume,
                &self.path,
                &self.source,
                &self.ops_id,
                lock_type,
                timeout.timeout(),
            )
            .await;
        if !locked {
            timeout.log_failure();
            return Err(Error::OperationTimedOut {
                path: format!("{}/{}", self.volume, self.path),
            });
        }
        timeout.log_success(start.elapsed());
        Ok(())
    }

    pub fn unlock(&self) {
        self.ns
            .unlock(&self.volume, &self.path, &self.ops_id, LockType::Write);
    }

    pub fn runlock(&self) {
        self.ns
            .unlock(&self.volume, &self.path, &self.ops_id, LockType::Read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn short_timeout() -> DynamicTimeout {
        DynamicTimeout::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(400),
        )
    }

    #[tokio::test]
    async fn test_write_lock_excludes_and_times_out() {
        let ns = NsLockMap::new_local();
        let t = short_timeout();

        let first = ns.new_ns_lock("bucket", "object", "test");
        first.get_lock(&t).await.unwrap();

        let second = ns.new_ns_lock("bucket", "object", "test");
        let started = Instant::now();
        let err = second.get_lock(&t).await.unwrap_err();
        assert!(matches!(err, Error::OperationTimedOut { .. }));
        assert!(started.elapsed() >= Duration::from_millis(90));

        first.unlock();
        let third = ns.new_ns_lock("bucket", "object", "test");
        third.get_lock(&t).await.unwrap();
        third.unlock();
        assert_eq!(ns.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_unrelated_paths_do_not_contend() {
        let ns = NsLockMap::new_local();
        let t = short_timeout();

        let a = ns.new_ns_lock("bucket", "a", "test");
        let b = ns.new_ns_lock("bucket", "b", "test");
        a.get_lock(&t).await.unwrap();
        b.get_lock(&t).await.unwrap();
        a.unlock();
        b.unlock();
    }

    #[tokio::test]
    async fn test_read_locks_share() {
        let ns = NsLockMap::new_local();
        let t = short_timeout();

        let r1 = ns.new_ns_lock("bucket", "object", "test");
        let r2 = ns.new_ns_lock("bucket", "object", "test");
        r1.get_rlock(&t).await.unwrap();
        r2.get_rlock(&t).await.unwrap();

        let w = ns.new_ns_lock("bucket", "object", "test");
        assert!(w.get_lock(&t).await.is_err());

        r1.runlock();
        r2.runlock();
        w.get_lock(&t).await.unwrap();
        w.unlock();
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_overlap() {
        let ns = NsLockMap::new_local();
        let concurrency = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ns = ns.clone();
            let concurrency = concurrency.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let t = DynamicTimeout::new(
                    Duration::from_secs(5),
                    Duration::from_secs(1),
                    Duration::from_secs(10),
                );
                let lk = ns.new_ns_lock("bucket", "hot", "test");
                lk.get_lock(&t).await.unwrap();
                let live = concurrency.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(live, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrency.fetch_sub(1, Ordering::SeqCst);
                lk.unlock();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(ns.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_entry_behind() {
        let ns = NsLockMap::new_local();
        let t = short_timeout();

        let holder = ns.new_ns_lock("bucket", "object", "test");
        holder.get_lock(&t).await.unwrap();

        let loser = ns.new_ns_lock("bucket", "object", "test");
        assert!(loser.get_lock(&t).await.is_err());
        // Only the holder's reference remains.
        assert_eq!(ns.entry_count(), 1);
        holder.unlock();
        assert_eq!(ns.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_force_unlock_allows_fresh_acquire() {
        let ns = NsLockMap::new_local();
        let t = short_timeout();

        let stuck = ns.new_ns_lock("bucket", "object", "test");
        stuck.get_lock(&t).await.unwrap();

        ns.force_unlock("bucket", "object");
        let next = ns.new_ns_lock("bucket", "object", "test");
        next.get_lock(&t).await.unwrap();
        next.unlock();
    }

    #[tokio::test]
    async fn test_list_locks_reports_running_state() {
        let ns = NsLockMap::new_local();
        let t = short_timeout();

        let lk = ns.new_ns_lock("bucket", "path/to/object", "PutObject");
        lk.get_lock(&t).await.unwrap();

        let locks = ns.list_locks("bucket", "path/", Duration::ZERO);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].object, "path/to/object");
        assert_eq!(locks[0].locks_acquired_on_object, 1);
        assert_eq!(locks[0].lock_details.len(), 1);
        assert_eq!(locks[0].lock_details[0].status, LockStatus::Running);
        assert_eq!(locks[0].lock_details[0].lock_source, "PutObject");

        assert!(ns.list_locks("bucket", "zzz", Duration::ZERO).is_empty());
        assert!(ns.list_locks("other", "", Duration::ZERO).is_empty());

        lk.unlock();
        assert!(ns.list_locks("bucket", "", Duration::ZERO).is_empty());
    }
}
