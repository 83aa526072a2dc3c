//! Per-node lock server
//!
//! Each node runs one `LockServer` holding a resource → requester-record
//! map. The server answers the lock service operations for its share of
//! the quorum and periodically reaps records whose holders have crashed,
//! by polling its peers' `expired` view.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use opal_common::error::Result;

use super::{quorum, LockArgs, Locker};

/// One holder (or would-be holder) of a resource
#[derive(Clone, Debug)]
pub struct LockRequesterInfo {
    pub uid: String,
    pub source: String,
    pub writer: bool,
    pub timestamp: DateTime<Utc>,
}

/// The lock service of one node
pub struct LockServer {
    addr: String,
    lock_map: Mutex<HashMap<String, Vec<LockRequesterInfo>>>,
}

impl LockServer {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            lock_map: Mutex::new(HashMap::new()),
        }
    }

    fn record(args: &LockArgs, writer: bool) -> LockRequesterInfo {
        LockRequesterInfo {
            uid: args.uid.clone(),
            source: args.source.clone(),
            writer,
            timestamp: Utc::now(),
        }
    }

    /// Number of resources currently tracked; instrumentation only.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.lock_map.lock().len()
    }

    /// Reap grants whose holders have crashed.
    ///
    /// For every record older than `validity`, the peers are polled: if a
    /// majority of the cluster (the peers plus this node's own "held"
    /// vote) no longer knows the uid, the record was part of a failed or
    /// abandoned acquisition and is dropped.
    pub async fn sweep_stale(&self, peers: &[Arc<dyn Locker>], validity: Duration) {
        let now = Utc::now();
        let candidates: Vec<(String, String)> = {
            let map = self.lock_map.lock();
            map.iter()
                .flat_map(|(resource, holders)| {
                    holders.iter().filter_map(|h| {
                        let age = now.signed_duration_since(h.timestamp);
                        if age.num_milliseconds() as u128 >= validity.as_millis() {
                            Some((resource.clone(), h.uid.clone()))
                        } else {
                            None
                        }
                    })
                })
                .collect()
        };

        let nodes = peers.len() + 1;
        for (resource, uid) in candidates {
            let args = LockArgs {
                uid: uid.clone(),
                resource: resource.clone(),
                source: self.addr.clone(),
            };
            let mut expired_votes = 0usize;
            for peer in peers {
                if let Ok(true) = peer.expired(&args).await {
                    expired_votes += 1;
                }
            }
            // This node still holds the record, so it votes "not
            // expired"; the peers alone must form a majority.
            if expired_votes >= quorum(nodes) {
                let mut map = self.lock_map.lock();
                if let Some(holders) = map.get_mut(&resource) {
                    holders.retain(|h| h.uid != uid);
                    if holders.is_empty() {
                        map.remove(&resource);
                    }
                    info!(resource, uid, "reaped stale lock grant");
                }
            }
        }
    }
}

#[async_trait]
impl Locker for LockServer {
    async fn lock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        if map.contains_key(&args.resource) {
            // Writers never upgrade over existing holders, readers
            // included; callers must release reads first.
            return Ok(false);
        }
        map.insert(args.resource.clone(), vec![Self::record(args, true)]);
        Ok(true)
    }

    async fn rlock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        match map.get_mut(&args.resource) {
            Some(holders) => {
                if holders.iter().any(|h| h.writer) {
                    return Ok(false);
                }
                holders.push(Self::record(args, false));
                Ok(true)
            }
            None => {
                map.insert(args.resource.clone(), vec![Self::record(args, false)]);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        let Some(holders) = map.get_mut(&args.resource) else {
            return Ok(false);
        };
        let before = holders.len();
        holders.retain(|h| !(h.writer && h.uid == args.uid));
        let removed = holders.len() != before;
        if holders.is_empty() {
            map.remove(&args.resource);
        }
        Ok(removed)
    }

    async fn runlock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        let Some(holders) = map.get_mut(&args.resource) else {
            return Ok(false);
        };
        let before = holders.len();
        // Remove one matching reader record.
        if let Some(pos) = holders
            .iter()
            .position(|h| !h.writer && h.uid == args.uid)
        {
            holders.remove(pos);
        }
        let removed = holders.len() != before;
        if holders.is_empty() {
            map.remove(&args.resource);
        }
        Ok(removed)
    }

    async fn force_unlock(&self, args: &LockArgs) -> Result<bool> {
        Ok(self.lock_map.lock().remove(&args.resource).is_some())
    }

    async fn expired(&self, args: &LockArgs) -> Result<bool> {
        let map = self.lock_map.lock();
        let known = map
            .get(&args.resource)
            .is_some_and(|holders| holders.iter().any(|h| h.uid == args.uid));
        Ok(!known)
    }

    fn endpoint(&self) -> &str {
        &self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(uid: &str, resource: &str) -> LockArgs {
        LockArgs {
            uid: uid.into(),
            resource: resource.into(),
            source: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_write_lock_is_exclusive() {
        let srv = LockServer::new("node1");
        assert!(srv.lock(&args("u1", "v/o")).await.unwrap());
        assert!(!srv.lock(&args("u2", "v/o")).await.unwrap());
        assert!(srv.unlock(&args("u1", "v/o")).await.unwrap());
        assert!(srv.lock(&args("u2", "v/o")).await.unwrap());
    }

    #[tokio::test]
    async fn test_readers_share_but_never_upgrade() {
        let srv = LockServer::new("node1");
        assert!(srv.rlock(&args("r1", "v/o")).await.unwrap());
        assert!(srv.rlock(&args("r2", "v/o")).await.unwrap());
        // No write grant over live readers.
        assert!(!srv.lock(&args("w1", "v/o")).await.unwrap());
        assert!(srv.runlock(&args("r1", "v/o")).await.unwrap());
        assert!(srv.runlock(&args("r2", "v/o")).await.unwrap());
        assert!(srv.lock(&args("w1", "v/o")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_uid() {
        let srv = LockServer::new("node1");
        assert!(srv.lock(&args("u1", "v/o")).await.unwrap());
        assert!(!srv.unlock(&args("other", "v/o")).await.unwrap());
        assert!(srv.unlock(&args("u1", "v/o")).await.unwrap());
    }

    #[tokio::test]
    async fn test_force_unlock_clears_everything() {
        let srv = LockServer::new("node1");
        srv.rlock(&args("r1", "v/o")).await.unwrap();
        srv.rlock(&args("r2", "v/o")).await.unwrap();
        assert!(srv.force_unlock(&args("", "v/o")).await.unwrap());
        assert_eq!(srv.held_count(), 0);
        assert!(srv.lock(&args("w", "v/o")).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_reports_unknown_uids() {
        let srv = LockServer::new("node1");
        srv.lock(&args("u1", "v/o")).await.unwrap();
        assert!(!srv.expired(&args("u1", "v/o")).await.unwrap());
        assert!(srv.expired(&args("ghost", "v/o")).await.unwrap());
        assert!(srv.expired(&args("u1", "v/other")).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_reaps_crashed_holder() {
        // node1 holds a grant that no peer knows about: a crashed
        // acquisition. With two peers both voting expired, quorum(3)=2
        // is met and the record goes away.
        let srv = LockServer::new("node1");
        let peer1: Arc<dyn Locker> = Arc::new(LockServer::new("node2"));
        let peer2: Arc<dyn Locker> = Arc::new(LockServer::new("node3"));
        srv.lock(&args("u-crashed", "v/o")).await.unwrap();

        srv.sweep_stale(&[peer1.clone(), peer2.clone()], Duration::ZERO)
            .await;
        assert_eq!(srv.held_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_spares_live_grants() {
        // Here the peers also hold the uid, so nobody votes expired.
        let srv = LockServer::new("node1");
        let peer = LockServer::new("node2");
        let a = args("u-live", "v/o");
        srv.lock(&a).await.unwrap();
        peer.lock(&a).await.unwrap();

        let peers: Vec<Arc<dyn Locker>> = vec![Arc::new(peer)];
        srv.sweep_stale(&peers, Duration::ZERO).await;
        assert_eq!(srv.held_count(), 1);
    }
}
