//! Filesystem backend
//!
//! Single-disk object layer: object data lives at `<root>/<bucket>/<key>`,
//! per-object metadata at `.opal.sys/buckets/<bucket>/<key>/fs.json`, and
//! everything transient goes through the tmp area and an atomic rename.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use opal_common::error::{Error, Result};
use opal_common::etag::HashReader;
use opal_common::types::{
    check_bucket_name, BucketInfo, CompletePart, DiskInfo, ListMultipartsInfo, ListObjectsInfo,
    ListObjectsV2Info, ListPartsInfo, ObjectInfo, PartInfo, StorageInfo, BackendType, BackendInfo,
    BUCKET_META_PREFIX, META_BUCKET, TMP_META_PREFIX,
};
use opal_disk::{load_or_init_format, PosixDisk, StorageDisk};
use opal_lock::{DynamicTimeout, VolumeLockInfo};

use crate::context::ServerContext;
use crate::listing::{list_objects_raw, ListLeaf};
use crate::meta::{read_json, write_json, FsMeta, FS_META_FILE};
use crate::multipart::MultipartCoordinator;
use crate::{check_object_args, check_put_size, to_v2_listing, ObjectLayer};

/// Copy unit for streamed GETs.
const READ_BUF_SIZE: usize = 1024 * 1024;

/// Single-disk object layer
pub struct FsObjects {
    disk: Arc<PosixDisk>,
    mp: Arc<MultipartCoordinator>,
    ctx: Arc<ServerContext>,
    op_timeout: DynamicTimeout,
    instance_id: String,
}

impl FsObjects {
    pub async fn new(root: impl AsRef<Path>, ctx: Arc<ServerContext>) -> Result<Self> {
        let disk = Arc::new(PosixDisk::new(root.as_ref()).await?);
        load_or_init_format(&*disk, BackendType::Fs, &Uuid::new_v4().to_string()).await?;
        let config = ctx.config().load();
        let mp = MultipartCoordinator::new(disk.clone(), config.multipart.min_part_size).await?;
        let op_timeout = DynamicTimeout::from_config(&config.lock);
        Ok(Self {
            disk,
            mp,
            ctx,
            op_timeout,
            instance_id: Uuid::new_v4().to_string(),
        })
    }

    /// The multipart coordinator, for wiring the stale-upload cleaner.
    #[must_use]
    pub fn multipart(&self) -> &Arc<MultipartCoordinator> {
        &self.mp
    }

    fn meta_path(bucket: &str, object: &str) -> String {
        format!("{BUCKET_META_PREFIX}/{bucket}/{object}/{FS_META_FILE}")
    }

    fn tmp_path(&self, name: &str) -> String {
        format!("{TMP_META_PREFIX}/{}/{name}", self.instance_id)
    }

    async fn require_bucket(&self, bucket: &str) -> Result<()> {
        match self.disk.stat_volume(bucket).await {
            Ok(_) => Ok(()),
            Err(Error::VolumeNotFound) => Err(Error::BucketNotFound {
                bucket: bucket.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Objects cannot be created below an existing object.
    async fn check_parent_is_object(&self, bucket: &str, object: &str) -> Result<()> {
        let mut parent = String::new();
        for segment in object.split('/') {
            if parent.is_empty() {
                parent = segment.to_string();
            } else {
                parent = format!("{parent}/{segment}");
            }
            if parent == object {
                break;
            }
            match self.disk.stat_file(bucket, &parent).await {
                Ok(fi) if !fi.is_dir => return Err(Error::DiskAccessDenied),
                _ => {}
            }
        }
        Ok(())
    }

    async fn read_fs_meta(&self, bucket: &str, object: &str) -> FsMeta {
        read_json(&*self.disk, META_BUCKET, &Self::meta_path(bucket, object))
            .await
            .unwrap_or_default()
    }

    async fn object_info_inner(&self, bucket: &str, object: &str) -> Result<ObjectInfo> {
        let fi = self
            .disk
            .stat_file(bucket, object)
            .await
            .map_err(|e| e.with_context(bucket, object))?;
        if fi.is_dir {
            return Err(Error::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        let meta = self.read_fs_meta(bucket, object).await;
        Ok(meta.to_object_info(bucket, object, &fi))
    }

    async fn put_object_inner(
        &self,
        bucket: &str,
        object: &str,
        data: &mut HashReader,
        meta: HashMap<String, String>,
    ) -> Result<ObjectInfo> {
        self.require_bucket(bucket).await?;
        self.check_parent_is_object(bucket, object).await?;
        check_put_size(data.size())?;

        let tmp = self.tmp_path(&Uuid::new_v4().to_string());
        match self
            .disk
            .create_file(META_BUCKET, &tmp, data.size(), data)
            .await
        {
            Ok(_) => {}
            Err(Error::ShortRead) => {
                let _ = self.disk.delete_file(META_BUCKET, &tmp).await;
                return Err(Error::IncompleteBody {
                    got: data.bytes_read(),
                    expected: data.size(),
                });
            }
            Err(e) => {
                let _ = self.disk.delete_file(META_BUCKET, &tmp).await;
                return Err(e.with_context(bucket, object));
            }
        }
        if let Err(e) = data.verify() {
            let _ = self.disk.delete_file(META_BUCKET, &tmp).await;
            return Err(e);
        }

        let mut fs_meta = FsMeta::with_meta(meta);
        fs_meta
            .meta
            .insert("etag".to_string(), data.md5_current());
        write_json(
            &*self.disk,
            META_BUCKET,
            &Self::meta_path(bucket, object),
            &fs_meta,
        )
        .await?;

        if let Err(e) = self
            .disk
            .rename_file(META_BUCKET, &tmp, bucket, object)
            .await
        {
            let _ = self.disk.delete_file(META_BUCKET, &tmp).await;
            return Err(e.with_context(bucket, object));
        }

        let fi = self.disk.stat_file(bucket, object).await?;
        debug!(bucket, object, size = fi.size, "object written");
        Ok(fs_meta.to_object_info(bucket, object, &fi))
    }

    async fn get_object_inner(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: Option<u64>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        self.require_bucket(bucket).await?;
        let fi = self
            .disk
            .stat_file(bucket, object)
            .await
            .map_err(|e| e.with_context(bucket, object))?;
        if fi.is_dir {
            return Err(Error::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        let length = length.unwrap_or(fi.size.saturating_sub(offset));
        if offset.checked_add(length).is_none() || offset + length > fi.size {
            return Err(Error::invalid_argument(format!(
                "read window {offset}+{length} exceeds object size {}",
                fi.size
            )));
        }

        let mut remaining = length;
        let mut pos = offset;
        let mut buf = vec![0u8; READ_BUF_SIZE.min(length.max(1) as usize)];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = self
                .disk
                .read_file(bucket, object, pos, &mut buf[..want], None)
                .await? as usize;
            if n == 0 {
                return Err(Error::ShortRead);
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| Error::internal(format!("write to caller: {e}")))?;
            pos += n as u64;
            remaining -= n as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| Error::internal(format!("flush to caller: {e}")))?;
        Ok(())
    }

    async fn commit_completed(
        &self,
        bucket: &str,
        object: &str,
        spool_path: &str,
        mut fs_meta: FsMeta,
        etag: String,
    ) -> Result<ObjectInfo> {
        fs_meta.meta.insert("etag".to_string(), etag);
        write_json(
            &*self.disk,
            META_BUCKET,
            &Self::meta_path(bucket, object),
            &fs_meta,
        )
        .await?;
        self.disk
            .rename_file(META_BUCKET, spool_path, bucket, object)
            .await
            .map_err(|e| e.with_context(bucket, object))?;
        let fi = self.disk.stat_file(bucket, object).await?;
        Ok(fs_meta.to_object_info(bucket, object, &fi))
    }
}

#[async_trait]
impl ObjectLayer for FsObjects {
    async fn storage_info(&self) -> StorageInfo {
        let info = self.disk.disk_info().await.unwrap_or(DiskInfo::default());
        StorageInfo {
            used: info.used,
            backend: BackendInfo {
                backend_type: BackendType::Fs,
                online_disks: 1,
                offline_disks: 0,
                standard_sc_parity: 0,
                rrs_sc_parity: 0,
            },
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<()> {
        check_bucket_name(bucket)?;
        self.disk
            .make_volume(bucket)
            .await
            .map_err(|e| e.with_context(bucket, ""))
    }

    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo> {
        check_bucket_name(bucket)?;
        let vi = self
            .disk
            .stat_volume(bucket)
            .await
            .map_err(|e| e.with_context(bucket, ""))?;
        Ok(BucketInfo {
            name: vi.name,
            created: vi.created,
        })
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let mut buckets: Vec<BucketInfo> = self
            .disk
            .list_volumes()
            .await?
            .into_iter()
            .filter(|v| !v.name.starts_with('.'))
            .map(|v| BucketInfo {
                name: v.name,
                created: v.created,
            })
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        check_bucket_name(bucket)?;
        self.disk
            .delete_volume(bucket)
            .await
            .map_err(|e| e.with_context(bucket, ""))?;
        // Bucket metadata goes with the bucket.
        let _ = self
            .disk
            .delete_dir(META_BUCKET, &format!("{BUCKET_META_PREFIX}/{bucket}"))
            .await;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> Result<ListObjectsInfo> {
        check_bucket_name(bucket)?;
        self.require_bucket(bucket).await?;

        let raw = list_objects_raw(
            &*self.disk,
            ListLeaf::File,
            bucket,
            prefix,
            marker,
            delimiter,
            max_keys,
        )
        .await?;

        let mut objects = Vec::with_capacity(raw.keys.len());
        for key in &raw.keys {
            objects.push(self.object_info_inner(bucket, key).await?);
        }
        let next_marker = if raw.is_truncated {
            objects
                .last()
                .map(|o| o.name.clone())
                .or_else(|| raw.prefixes.last().cloned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        Ok(ListObjectsInfo {
            is_truncated: raw.is_truncated,
            next_marker,
            objects,
            prefixes: raw.prefixes,
        })
    }

    async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: &str,
        delimiter: &str,
        max_keys: usize,
        start_after: &str,
    ) -> Result<ListObjectsV2Info> {
        let marker = if continuation_token.is_empty() {
            start_after
        } else {
            continuation_token
        };
        let v1 = self
            .list_objects(bucket, prefix, marker, delimiter, max_keys)
            .await?;
        Ok(to_v2_listing(v1, continuation_token))
    }

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: Option<u64>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        check_object_args(bucket, object)?;
        let lk = self.ctx.ns().new_ns_lock(bucket, object, "GetObject");
        lk.get_rlock(&self.op_timeout).await?;
        let result = self
            .get_object_inner(bucket, object, offset, length, writer)
            .await;
        lk.runlock();
        result
    }

    async fn get_object_info(&self, bucket: &str, object: &str) -> Result<ObjectInfo> {
        check_object_args(bucket, object)?;
        let lk = self.ctx.ns().new_ns_lock(bucket, object, "GetObjectInfo");
        lk.get_rlock(&self.op_timeout).await?;
        let result = async {
            self.require_bucket(bucket).await?;
            self.object_info_inner(bucket, object).await
        }
        .await;
        lk.runlock();
        result
    }

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        data: &mut HashReader,
        meta: HashMap<String, String>,
    ) -> Result<ObjectInfo> {
        check_object_args(bucket, object)?;
        let lk = self.ctx.ns().new_ns_lock(bucket, object, "PutObject");
        lk.get_lock(&self.op_timeout).await?;
        let result = self.put_object_inner(bucket, object, data, meta).await;
        lk.unlock();
        result
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        meta: Option<HashMap<String, String>>,
    ) -> Result<ObjectInfo> {
        check_object_args(src_bucket, src_object)?;
        check_object_args(dst_bucket, dst_object)?;

        // Same-key copy is a metadata rewrite, under one write lock.
        if src_bucket == dst_bucket && src_object == dst_object {
            let lk = self.ctx.ns().new_ns_lock(src_bucket, src_object, "CopyObject");
            lk.get_lock(&self.op_timeout).await?;
            let result = async {
                let mut fs_meta = self.read_fs_meta(src_bucket, src_object).await;
                let etag = fs_meta.etag();
                if let Some(meta) = meta {
                    fs_meta.meta = meta;
                    fs_meta.meta.insert("etag".to_string(), etag);
                }
                write_json(
                    &*self.disk,
                    META_BUCKET,
                    &Self::meta_path(src_bucket, src_object),
                    &fs_meta,
                )
                .await?;
                self.object_info_inner(src_bucket, src_object).await
            }
            .await;
            lk.unlock();
            return result;
        }

        let src_info = self.get_object_info(src_bucket, src_object).await?;
        let meta = meta.unwrap_or_else(|| src_info.user_defined.clone());

        // Source streams under its read lock while the destination
        // consumes under its write lock; distinct keys, so no deadlock.
        let (read_half, mut write_half) = tokio::io::duplex(READ_BUF_SIZE);
        let producer = async {
            let result = self
                .get_object(src_bucket, src_object, 0, None, &mut write_half)
                .await;
            let _ = write_half.shutdown().await;
            result
        };
        let mut reader = HashReader::new(Box::new(read_half), src_info.size);
        let consumer = self.put_object(dst_bucket, dst_object, &mut reader, meta);

        let (produced, consumed) = tokio::join!(producer, consumer);
        produced?;
        consumed
    }

    async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        check_object_args(bucket, object)?;
        let lk = self.ctx.ns().new_ns_lock(bucket, object, "DeleteObject");
        lk.get_lock(&self.op_timeout).await?;
        let result = async {
            self.require_bucket(bucket).await?;
            self.disk
                .delete_file(bucket, object)
                .await
                .map_err(|e| e.with_context(bucket, object))?;
            let _ = self
                .disk
                .delete_dir(META_BUCKET, &format!("{BUCKET_META_PREFIX}/{bucket}/{object}"))
                .await;
            Ok(())
        }
        .await;
        lk.unlock();
        result
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        object: &str,
        upload_id_marker: &str,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo> {
        check_object_args(bucket, object)?;
        self.require_bucket(bucket).await?;
        self.mp
            .list_uploads(bucket, object, upload_id_marker, max_uploads)
            .await
    }

    async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        meta: HashMap<String, String>,
    ) -> Result<String> {
        check_object_args(bucket, object)?;
        self.require_bucket(bucket).await?;
        self.mp.new_upload(bucket, object, meta).await
    }

    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u32,
        data: &mut HashReader,
    ) -> Result<PartInfo> {
        check_object_args(bucket, object)?;
        self.require_bucket(bucket).await?;
        self.mp
            .put_part(bucket, object, upload_id, part_number, data)
            .await
    }

    async fn copy_object_part(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<PartInfo> {
        check_object_args(src_bucket, src_object)?;
        let src_info = self.get_object_info(src_bucket, src_object).await?;

        let (read_half, mut write_half) = tokio::io::duplex(READ_BUF_SIZE);
        let producer = async {
            let result = self
                .get_object(src_bucket, src_object, 0, None, &mut write_half)
                .await;
            let _ = write_half.shutdown().await;
            result
        };
        let mut reader = HashReader::new(Box::new(read_half), src_info.size);
        let consumer =
            self.put_object_part(dst_bucket, dst_object, upload_id, part_number, &mut reader);

        let (produced, consumed) = tokio::join!(producer, consumer);
        produced?;
        consumed
    }

    async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: usize,
    ) -> Result<ListPartsInfo> {
        check_object_args(bucket, object)?;
        self.require_bucket(bucket).await?;
        self.mp
            .list_parts(bucket, object, upload_id, part_number_marker, max_parts)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        check_object_args(bucket, object)?;
        self.require_bucket(bucket).await?;
        self.check_parent_is_object(bucket, object).await?;

        let done = self.mp.complete(bucket, object, upload_id, &parts).await?;

        // The final rename happens under the object's write lock; on any
        // failure the upload directory stays intact for a retry.
        let lk = self
            .ctx
            .ns()
            .new_ns_lock(bucket, object, "CompleteMultipartUpload");
        lk.get_lock(&self.op_timeout).await?;
        let result = self
            .commit_completed(bucket, object, &done.spool_path, done.meta, done.etag)
            .await;
        lk.unlock();

        if result.is_ok() {
            self.mp.remove_upload(bucket, object, upload_id).await;
        }
        result
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()> {
        check_object_args(bucket, object)?;
        self.require_bucket(bucket).await?;
        self.mp.abort(bucket, object, upload_id).await
    }

    async fn list_locks(
        &self,
        bucket: &str,
        prefix: &str,
        older_than: Duration,
    ) -> Result<Vec<VolumeLockInfo>> {
        Ok(self.ctx.ns().list_locks(bucket, prefix, older_than))
    }

    async fn clear_locks(&self, locks: Vec<VolumeLockInfo>) -> Result<()> {
        for lock in locks {
            self.ctx.ns().force_unlock(&lock.bucket, &lock.object);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.ctx.trigger_shutdown();
        Ok(())
    }
}
