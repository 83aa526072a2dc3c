//! Distributed synchronization
//!
//! A cluster-wide RW mutex built from per-node lock servers. Clients
//! gather grants from a majority of lock servers; a grant is only good
//! while held simultaneously on a quorum, and partial grants are rolled
//! back. This is message passing between peers, never shared memory.

pub mod drwmutex;
pub mod server;

pub use drwmutex::DRwMutex;
pub use server::{LockRequesterInfo, LockServer};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use opal_common::error::Result;

/// Arguments carried by every lock-service operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArgs {
    /// Unique id of one acquisition attempt; the same uid is presented
    /// to every lock server.
    pub uid: String,
    /// Resource being locked, `volume/path`.
    pub resource: String,
    /// Who is asking, for the instrumentation records.
    pub source: String,
}

/// One node's lock service, as seen over the wire.
///
/// `Ok(true)` is a grant, `Ok(false)` means the resource is held by
/// someone else, and `Err(_)` means the node was unreachable.
#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self, args: &LockArgs) -> Result<bool>;

    async fn rlock(&self, args: &LockArgs) -> Result<bool>;

    async fn unlock(&self, args: &LockArgs) -> Result<bool>;

    async fn runlock(&self, args: &LockArgs) -> Result<bool>;

    /// Drop every holder of the resource, whatever its uid.
    async fn force_unlock(&self, args: &LockArgs) -> Result<bool>;

    /// Report whether this node no longer knows the uid for the
    /// resource. Peers poll this to reap grants from crashed holders.
    async fn expired(&self, args: &LockArgs) -> Result<bool>;

    /// Address of the node answering, for logs.
    fn endpoint(&self) -> &str;
}

/// Simultaneous holders required for a grant to stand.
#[must_use]
pub fn quorum(nodes: usize) -> usize {
    nodes / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
        assert_eq!(quorum(8), 5);
    }
}
