//! Opal object layer
//!
//! Composes disks, namespace locks, the erasure engine and the multipart
//! coordinator into the object API the HTTP edge consumes. Two backends
//! implement the API: `FsObjects` over a single disk and `XlObjects`
//! over an erasure set.

pub mod context;
pub mod fs;
pub mod listing;
pub mod meta;
pub mod multipart;
pub mod xl;

pub use context::ServerContext;
pub use fs::FsObjects;
pub use multipart::MultipartCoordinator;
pub use xl::XlObjects;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWrite;

use opal_common::error::{Error, Result};
use opal_common::etag::HashReader;
use opal_common::types::{
    check_bucket_name, check_object_key, BucketInfo, CompletePart, ListMultipartsInfo,
    ListObjectsInfo, ListObjectsV2Info, ListPartsInfo, ObjectInfo, PartInfo, StorageInfo,
    MAX_OBJECT_SIZE,
};
use opal_lock::VolumeLockInfo;

/// The object API consumed by the HTTP edge.
///
/// Every operation validates names, acquires the appropriate namespace
/// lock, delegates to the backend and reports canonical errors.
#[async_trait]
pub trait ObjectLayer: Send + Sync {
    async fn storage_info(&self) -> StorageInfo;

    // Bucket operations
    async fn make_bucket(&self, bucket: &str) -> Result<()>;
    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo>;
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>>;
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> Result<ListObjectsInfo>;
    async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: &str,
        delimiter: &str,
        max_keys: usize,
        start_after: &str,
    ) -> Result<ListObjectsV2Info>;

    // Object operations
    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: Option<u64>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
    async fn get_object_info(&self, bucket: &str, object: &str) -> Result<ObjectInfo>;
    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        data: &mut HashReader,
        meta: HashMap<String, String>,
    ) -> Result<ObjectInfo>;
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        meta: Option<HashMap<String, String>>,
    ) -> Result<ObjectInfo>;
    async fn delete_object(&self, bucket: &str, object: &str) -> Result<()>;

    /// Rebuild stale replicas/chunks of one object. Backends without
    /// redundancy report `NotImplemented`.
    async fn heal_object(&self, bucket: &str, object: &str) -> Result<()> {
        let _ = (bucket, object);
        Err(Error::not_implemented("heal"))
    }

    // Multipart operations
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        object: &str,
        upload_id_marker: &str,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo>;
    async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        meta: HashMap<String, String>,
    ) -> Result<String>;
    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u32,
        data: &mut HashReader,
    ) -> Result<PartInfo>;
    async fn copy_object_part(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<PartInfo>;
    async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: usize,
    ) -> Result<ListPartsInfo>;
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo>;
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()>;

    // Lock administration
    async fn list_locks(
        &self,
        bucket: &str,
        prefix: &str,
        older_than: Duration,
    ) -> Result<Vec<VolumeLockInfo>>;
    async fn clear_locks(&self, locks: Vec<VolumeLockInfo>) -> Result<()>;

    /// Release backend resources; called once at server exit.
    async fn shutdown(&self) -> Result<()>;
}

/// Shared argument validation for object-level operations.
pub(crate) fn check_object_args(bucket: &str, object: &str) -> Result<()> {
    check_bucket_name(bucket)?;
    check_object_key(object)
}

/// Shared validation for incoming object payloads.
pub(crate) fn check_put_size(size: u64) -> Result<()> {
    if size > MAX_OBJECT_SIZE {
        return Err(Error::EntityTooLarge {
            size,
            max: MAX_OBJECT_SIZE,
        });
    }
    Ok(())
}

/// Build the V2 listing view from the V1 result.
pub(crate) fn to_v2_listing(
    v1: ListObjectsInfo,
    continuation_token: &str,
) -> ListObjectsV2Info {
    ListObjectsV2Info {
        is_truncated: v1.is_truncated,
        continuation_token: continuation_token.to_string(),
        next_continuation_token: v1.next_marker,
        objects: v1.objects,
        prefixes: v1.prefixes,
    }
}
