//! Peer RPC operations
//!
//! Fan-out operations between cluster members: bucket deletion and
//! policy/notification propagation, event forwarding to listeners, and
//! credential/user reload nudges. State mutated here is the per-node
//! registry a transport would keep in sync across peers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use opal_common::error::{Error, Result};
use opal_object::ObjectLayer;

use crate::AuthArgs;

/// DeleteBucket arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteBucketArgs {
    pub auth: AuthArgs,
    pub bucket: String,
}

/// SetBucketPolicy arguments; the policy travels as its JSON document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetBucketPolicyArgs {
    pub auth: AuthArgs,
    pub bucket: String,
    pub policy: String,
}

/// RemoveBucketPolicy arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveBucketPolicyArgs {
    pub auth: AuthArgs,
    pub bucket: String,
}

/// Notification rules for one bucket, opaque to the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutBucketNotificationArgs {
    pub auth: AuthArgs,
    pub bucket: String,
    pub config: String,
}

/// ListenBucketNotification arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenBucketNotificationArgs {
    pub auth: AuthArgs,
    pub bucket: String,
    /// Identity of the listening client; SendEvent routes by it.
    pub listener_id: String,
}

/// One bucket event forwarded between peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEvent {
    pub bucket: String,
    pub object: String,
    pub event_name: String,
}

/// SendEvent arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendEventArgs {
    pub auth: AuthArgs,
    pub listener_id: String,
    pub event: BucketEvent,
}

/// The peer service every node answers
#[async_trait]
pub trait PeerService: Send + Sync {
    async fn delete_bucket(&self, args: DeleteBucketArgs) -> Result<()>;

    async fn set_bucket_policy(&self, args: SetBucketPolicyArgs) -> Result<()>;

    async fn remove_bucket_policy(&self, args: RemoveBucketPolicyArgs) -> Result<()>;

    async fn put_bucket_notification(&self, args: PutBucketNotificationArgs) -> Result<()>;

    async fn listen_bucket_notification(
        &self,
        args: ListenBucketNotificationArgs,
    ) -> Result<mpsc::UnboundedReceiver<BucketEvent>>;

    /// Forward an event to a listener registered on this node. Returns
    /// whether the listener existed.
    async fn send_event(&self, args: SendEventArgs) -> Result<bool>;

    /// Reload the user table from persistent storage.
    async fn load_users(&self, auth: AuthArgs) -> Result<()>;

    /// Reload access credentials from persistent storage.
    async fn load_credentials(&self, auth: AuthArgs) -> Result<()>;
}

/// In-process peer receiver with this node's registries
pub struct LocalPeerReceiver {
    layer: Arc<dyn ObjectLayer>,
    token: String,
    policies: Mutex<HashMap<String, String>>,
    notifications: Mutex<HashMap<String, String>>,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<BucketEvent>>>,
    /// Bumped on each reload so callers can observe propagation.
    reload_generation: Mutex<u64>,
}

impl LocalPeerReceiver {
    #[must_use]
    pub fn new(layer: Arc<dyn ObjectLayer>, token: impl Into<String>) -> Self {
        Self {
            layer,
            token: token.into(),
            policies: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            reload_generation: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn bucket_policy(&self, bucket: &str) -> Option<String> {
        self.policies.lock().get(bucket).cloned()
    }

    #[must_use]
    pub fn reload_generation(&self) -> u64 {
        *self.reload_generation.lock()
    }

    fn bump_generation(&self) {
        *self.reload_generation.lock() += 1;
    }
}

#[async_trait]
impl PeerService for LocalPeerReceiver {
    async fn delete_bucket(&self, args: DeleteBucketArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        self.layer.delete_bucket(&args.bucket).await?;
        self.policies.lock().remove(&args.bucket);
        self.notifications.lock().remove(&args.bucket);
        info!(bucket = args.bucket, "bucket deleted via peer rpc");
        Ok(())
    }

    async fn set_bucket_policy(&self, args: SetBucketPolicyArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        // The document must at least parse before it is adopted.
        serde_json::from_str::<serde_json::Value>(&args.policy)
            .map_err(|e| Error::invalid_argument(format!("bucket policy: {e}")))?;
        self.policies.lock().insert(args.bucket, args.policy);
        Ok(())
    }

    async fn remove_bucket_policy(&self, args: RemoveBucketPolicyArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        if self.policies.lock().remove(&args.bucket).is_none() {
            debug!(bucket = args.bucket, "no policy to remove");
        }
        Ok(())
    }

    async fn put_bucket_notification(&self, args: PutBucketNotificationArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        self.notifications.lock().insert(args.bucket, args.config);
        Ok(())
    }

    async fn listen_bucket_notification(
        &self,
        args: ListenBucketNotificationArgs,
    ) -> Result<mpsc::UnboundedReceiver<BucketEvent>> {
        args.auth.validate(&self.token)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(args.listener_id, tx);
        Ok(rx)
    }

    async fn send_event(&self, args: SendEventArgs) -> Result<bool> {
        args.auth.validate(&self.token)?;
        let mut listeners = self.listeners.lock();
        match listeners.get(&args.listener_id) {
            Some(tx) => {
                if tx.send(args.event).is_err() {
                    // Receiver is gone; drop the registration.
                    listeners.remove(&args.listener_id);
                    return Ok(false);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_users(&self, auth: AuthArgs) -> Result<()> {
        auth.validate(&self.token)?;
        self.bump_generation();
        Ok(())
    }

    async fn load_credentials(&self, auth: AuthArgs) -> Result<()> {
        auth.validate(&self.token)?;
        self.bump_generation();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_object::{FsObjects, ServerContext};
    use tempfile::TempDir;

    async fn receiver() -> (TempDir, Arc<dyn ObjectLayer>, LocalPeerReceiver) {
        let dir = TempDir::new().unwrap();
        let layer: Arc<dyn ObjectLayer> = Arc::new(
            FsObjects::new(dir.path(), ServerContext::for_tests())
                .await
                .unwrap(),
        );
        let peer = LocalPeerReceiver::new(layer.clone(), "secret");
        (dir, layer, peer)
    }

    #[tokio::test]
    async fn test_delete_bucket_clears_registries() {
        let (_dir, layer, peer) = receiver().await;
        layer.make_bucket("gone").await.unwrap();
        peer.set_bucket_policy(SetBucketPolicyArgs {
            auth: AuthArgs::new("secret"),
            bucket: "gone".into(),
            policy: "{}".into(),
        })
        .await
        .unwrap();

        peer.delete_bucket(DeleteBucketArgs {
            auth: AuthArgs::new("secret"),
            bucket: "gone".into(),
        })
        .await
        .unwrap();

        assert!(peer.bucket_policy("gone").is_none());
        assert!(layer.get_bucket_info("gone").await.is_err());
    }

    #[tokio::test]
    async fn test_policy_must_parse() {
        let (_dir, _layer, peer) = receiver().await;
        assert!(peer
            .set_bucket_policy(SetBucketPolicyArgs {
                auth: AuthArgs::new("secret"),
                bucket: "b".into(),
                policy: "not json".into(),
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_event_routing() {
        let (_dir, _layer, peer) = receiver().await;
        let mut rx = peer
            .listen_bucket_notification(ListenBucketNotificationArgs {
                auth: AuthArgs::new("secret"),
                bucket: "b".into(),
                listener_id: "client-1".into(),
            })
            .await
            .unwrap();

        let event = BucketEvent {
            bucket: "b".into(),
            object: "o".into(),
            event_name: "s3:ObjectCreated:Put".into(),
        };
        let delivered = peer
            .send_event(SendEventArgs {
                auth: AuthArgs::new("secret"),
                listener_id: "client-1".into(),
                event: event.clone(),
            })
            .await
            .unwrap();
        assert!(delivered);
        assert_eq!(rx.recv().await, Some(event));

        let missing = peer
            .send_event(SendEventArgs {
                auth: AuthArgs::new("secret"),
                listener_id: "ghost".into(),
                event: BucketEvent {
                    bucket: "b".into(),
                    object: "o".into(),
                    event_name: "x".into(),
                },
            })
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn test_reload_generation_advances() {
        let (_dir, _layer, peer) = receiver().await;
        assert_eq!(peer.reload_generation(), 0);
        peer.load_users(AuthArgs::new("secret")).await.unwrap();
        peer.load_credentials(AuthArgs::new("secret")).await.unwrap();
        assert_eq!(peer.reload_generation(), 2);
    }
}
