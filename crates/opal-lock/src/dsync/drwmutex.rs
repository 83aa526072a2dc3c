//! Distributed reader-writer mutex
//!
//! One `DRwMutex` guards one resource across the cluster. An acquire
//! presents a fresh uid to every lock server in parallel; the lock is
//! held only if a majority grants it simultaneously, and partial grants
//! are released before reporting failure. Releases notify whichever
//! nodes actually granted.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::RwLocker;

use super::{quorum, LockArgs, Locker};

/// Budget for one round trip to a single lock server.
const GRANT_RPC_TIMEOUT: Duration = Duration::from_secs(1);
/// Bounds for the sleep between acquisition rounds, in milliseconds.
const RETRY_MIN_MS: u64 = 10;
const RETRY_MAX_MS: u64 = 50;

/// Per-node grants of one successful acquisition: `Some(uid)` where the
/// node granted, `None` where it refused or was unreachable.
type Grants = Vec<Option<String>>;

#[derive(Default)]
struct HeldState {
    write_grants: Option<Grants>,
    /// One entry per concurrently held read lock.
    read_grants: Vec<Grants>,
}

/// Cluster-wide RW mutex over a set of lock servers
pub struct DRwMutex {
    resource: String,
    owner: String,
    clients: Vec<Arc<dyn Locker>>,
    held: Mutex<HeldState>,
}

impl DRwMutex {
    #[must_use]
    pub fn new(
        resource: impl Into<String>,
        owner: impl Into<String>,
        clients: Vec<Arc<dyn Locker>>,
    ) -> Self {
        Self {
            resource: resource.into(),
            owner: owner.into(),
            clients,
            held: Mutex::new(HeldState::default()),
        }
    }

    fn args(&self, uid: &str) -> LockArgs {
        LockArgs {
            uid: uid.to_string(),
            resource: self.resource.clone(),
            source: self.owner.clone(),
        }
    }

    /// One grant round across all lock servers. Returns the per-node
    /// grants when a quorum was reached; rolls everything back otherwise.
    async fn try_acquire(&self, read: bool) -> Option<Grants> {
        let uid = Uuid::new_v4().to_string();
        let args = self.args(&uid);

        let calls = self.clients.iter().map(|client| {
            let args = args.clone();
            let client = client.clone();
            async move {
                let call = async {
                    if read {
                        client.rlock(&args).await
                    } else {
                        client.lock(&args).await
                    }
                };
                match tokio::time::timeout(GRANT_RPC_TIMEOUT, call).await {
                    Ok(Ok(granted)) => granted,
                    Ok(Err(e)) => {
                        debug!(node = client.endpoint(), "lock server unreachable: {e}");
                        false
                    }
                    Err(_) => {
                        debug!(node = client.endpoint(), "lock server timed out");
                        false
                    }
                }
            }
        });
        let results = futures::future::join_all(calls).await;

        let grants: Grants = results
            .into_iter()
            .map(|granted| granted.then(|| uid.clone()))
            .collect();
        let granted = grants.iter().filter(|g| g.is_some()).count();

        if granted >= quorum(self.clients.len()) {
            return Some(grants);
        }
        // Grant is granular and must be held simultaneously: on a missed
        // quorum every partial grant is released.
        self.release(&grants, read).await;
        None
    }

    async fn release(&self, grants: &Grants, read: bool) {
        for (i, grant) in grants.iter().enumerate() {
            let Some(uid) = grant else { continue };
            let args = self.args(uid);
            let client = &self.clients[i];
            let result = if read {
                client.runlock(&args).await
            } else {
                client.unlock(&args).await
            };
            if let Err(e) = result {
                warn!(node = client.endpoint(), resource = %self.resource,
                    "failed to release grant: {e}");
            }
        }
    }

    async fn lock_loop(&self, read: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(grants) = self.try_acquire(read).await {
                let mut held = self.held.lock();
                if read {
                    held.read_grants.push(grants);
                } else {
                    held.write_grants = Some(grants);
                }
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let nap =
                Duration::from_millis(rand::thread_rng().gen_range(RETRY_MIN_MS..=RETRY_MAX_MS));
            tokio::time::sleep(nap.min(deadline - now)).await;
        }
    }

    fn spawn_release(&self, grants: Grants, read: bool) {
        let clients = self.clients.clone();
        let resource = self.resource.clone();
        let owner = self.owner.clone();
        tokio::spawn(async move {
            for (i, grant) in grants.iter().enumerate() {
                let Some(uid) = grant else { continue };
                let args = LockArgs {
                    uid: uid.clone(),
                    resource: resource.clone(),
                    source: owner.clone(),
                };
                let result = if read {
                    clients[i].runlock(&args).await
                } else {
                    clients[i].unlock(&args).await
                };
                if let Err(e) = result {
                    warn!(node = clients[i].endpoint(), resource,
                        "failed to release grant: {e}");
                }
            }
        });
    }

    /// Broadcast an unconditional unlock for this resource to every
    /// participating lock server.
    pub async fn force_unlock_all(&self) {
        let args = self.args("");
        for client in &self.clients {
            if let Err(e) = client.force_unlock(&args).await {
                warn!(node = client.endpoint(), resource = %self.resource,
                    "force unlock failed: {e}");
            }
        }
        let mut held = self.held.lock();
        held.write_grants = None;
        held.read_grants.clear();
    }
}

#[async_trait]
impl RwLocker for DRwMutex {
    async fn get_lock(&self, timeout: Duration) -> bool {
        self.lock_loop(false, timeout).await
    }

    async fn get_rlock(&self, timeout: Duration) -> bool {
        self.lock_loop(true, timeout).await
    }

    fn unlock(&self) {
        let grants = self.held.lock().write_grants.take();
        match grants {
            Some(grants) => self.spawn_release(grants, false),
            None => warn!(resource = %self.resource, "unlock without a held write lock"),
        }
    }

    fn runlock(&self) {
        let grants = self.held.lock().read_grants.pop();
        match grants {
            Some(grants) => self.spawn_release(grants, true),
            None => warn!(resource = %self.resource, "runlock without a held read lock"),
        }
    }

    fn force_unlock(&self) {
        let clients = self.clients.clone();
        let args = self.args("");
        {
            let mut held = self.held.lock();
            held.write_grants = None;
            held.read_grants.clear();
        }
        tokio::spawn(async move {
            for client in clients {
                if let Err(e) = client.force_unlock(&args).await {
                    warn!(node = client.endpoint(), "force unlock failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsync::LockServer;
    use opal_common::error::{Error, Result};

    fn cluster(n: usize) -> Vec<Arc<dyn Locker>> {
        (0..n)
            .map(|i| Arc::new(LockServer::new(format!("node{i}"))) as Arc<dyn Locker>)
            .collect()
    }

    /// A lock server that refuses to answer, standing in for a dead node.
    struct DeadNode;

    #[async_trait]
    impl Locker for DeadNode {
        async fn lock(&self, _: &LockArgs) -> Result<bool> {
            Err(Error::DiskUnreachable)
        }
        async fn rlock(&self, _: &LockArgs) -> Result<bool> {
            Err(Error::DiskUnreachable)
        }
        async fn unlock(&self, _: &LockArgs) -> Result<bool> {
            Err(Error::DiskUnreachable)
        }
        async fn runlock(&self, _: &LockArgs) -> Result<bool> {
            Err(Error::DiskUnreachable)
        }
        async fn force_unlock(&self, _: &LockArgs) -> Result<bool> {
            Err(Error::DiskUnreachable)
        }
        async fn expired(&self, _: &LockArgs) -> Result<bool> {
            Err(Error::DiskUnreachable)
        }
        fn endpoint(&self) -> &str {
            "dead"
        }
    }

    #[tokio::test]
    async fn test_exclusive_across_instances() {
        let nodes = cluster(3);
        let a = DRwMutex::new("v/o", "owner-a", nodes.clone());
        let b = DRwMutex::new("v/o", "owner-b", nodes.clone());

        assert!(a.get_lock(Duration::from_millis(200)).await);
        assert!(!b.get_lock(Duration::from_millis(200)).await);

        a.unlock();
        // Release rounds are asynchronous; the second holder retries
        // until the grants land.
        assert!(b.get_lock(Duration::from_secs(2)).await);
        b.unlock();
    }

    #[tokio::test]
    async fn test_readers_share_across_instances() {
        let nodes = cluster(3);
        let a = DRwMutex::new("v/o", "owner-a", nodes.clone());
        let b = DRwMutex::new("v/o", "owner-b", nodes.clone());
        let w = DRwMutex::new("v/o", "owner-w", nodes.clone());

        assert!(a.get_rlock(Duration::from_millis(200)).await);
        assert!(b.get_rlock(Duration::from_millis(200)).await);
        assert!(!w.get_lock(Duration::from_millis(200)).await);

        a.runlock();
        b.runlock();
        assert!(w.get_lock(Duration::from_secs(2)).await);
        w.unlock();
    }

    #[tokio::test]
    async fn test_quorum_survives_minority_failure() {
        // Two live nodes out of three still form a quorum.
        let mut nodes = cluster(2);
        nodes.push(Arc::new(DeadNode));
        let m = DRwMutex::new("v/o", "owner", nodes);
        assert!(m.get_lock(Duration::from_millis(500)).await);
        m.unlock();
    }

    #[tokio::test]
    async fn test_majority_failure_denies_lock() {
        let live = Arc::new(LockServer::new("node0"));
        let nodes: Vec<Arc<dyn Locker>> =
            vec![live.clone(), Arc::new(DeadNode), Arc::new(DeadNode)];
        let m = DRwMutex::new("v/o", "owner", nodes);
        assert!(!m.get_lock(Duration::from_millis(300)).await);

        // The partial grant on the one live node was rolled back.
        assert_eq!(live.held_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_acquire_leaves_no_residue() {
        let nodes = cluster(3);
        let holder = DRwMutex::new("v/o", "holder", nodes.clone());
        assert!(holder.get_lock(Duration::from_millis(200)).await);

        let loser = DRwMutex::new("v/o", "loser", nodes.clone());
        assert!(!loser.get_lock(Duration::from_millis(150)).await);

        holder.unlock();
        // If the loser had leaked partial grants anywhere, this acquire
        // could never reach quorum.
        let next = DRwMutex::new("v/o", "next", nodes);
        assert!(next.get_lock(Duration::from_secs(2)).await);
        next.unlock();
    }

    #[tokio::test]
    async fn test_force_unlock_broadcasts() {
        let nodes = cluster(3);
        let stuck = DRwMutex::new("v/o", "stuck", nodes.clone());
        assert!(stuck.get_lock(Duration::from_millis(200)).await);

        let admin = DRwMutex::new("v/o", "admin", nodes.clone());
        admin.force_unlock_all().await;

        let next = DRwMutex::new("v/o", "next", nodes);
        assert!(next.get_lock(Duration::from_millis(500)).await);
        next.unlock();
    }
}
