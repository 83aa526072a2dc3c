//! Opal namespace locking
//!
//! Per-`(volume, path)` reader-writer locks with an identical contract in
//! single-node and distributed deployments. The namespace map hands out
//! lock instances backed by either a local timed RW lock or a
//! cluster-wide quorum mutex; callers cannot tell the difference.

pub mod dsync;
pub mod local;
pub mod namespace;
pub mod timeout;

pub use dsync::{DRwMutex, LockArgs, LockServer, Locker};
pub use local::LocalRwLock;
pub use namespace::{LockStatus, NsLock, NsLockMap, OpsLockState, VolumeLockInfo};
pub use timeout::DynamicTimeout;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of hold being requested on a namespace entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Read,
    Write,
}

/// The RW primitive behind one namespace entry.
///
/// Acquire is timed and asynchronous. Release is synchronous and never
/// blocks: the distributed variant notifies its peers from a detached
/// task. Releasing an unheld lock is tolerated (and logged) rather than
/// escalated.
#[async_trait]
pub trait RwLocker: Send + Sync {
    async fn get_lock(&self, timeout: Duration) -> bool;

    async fn get_rlock(&self, timeout: Duration) -> bool;

    fn unlock(&self);

    fn runlock(&self);

    /// Drop all holders unconditionally.
    fn force_unlock(&self);
}
