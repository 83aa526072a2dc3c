//! Erasure backend
//!
//! Object layer over an erasure set. Each object is a directory on every
//! disk of the set holding that disk's chunk file `part.1` plus the
//! `xl.json` document; writes stage under the tmp area and land with one
//! directory rename per disk. Reads reconcile metadata by majority and
//! verify bitrot before serving a byte; stale disks found on the way are
//! healed best-effort after the read lock drops.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use opal_common::bpool::BytePool;
use opal_common::error::{Error, Result};
use opal_common::etag::HashReader;
use opal_common::types::{
    check_bucket_name, redundancy_count, BackendInfo, BackendType, BucketInfo, CompletePart,
    ListMultipartsInfo, ListObjectsInfo, ListObjectsV2Info, ListPartsInfo, ObjectInfo, PartInfo,
    StorageClass, StorageInfo, META_BUCKET, TMP_META_PREFIX,
};
use opal_disk::{load_or_init_format, PosixDisk, StorageDisk};
use opal_erasure::ErasureStorage;
use opal_lock::{DynamicTimeout, VolumeLockInfo};

use crate::context::ServerContext;
use crate::listing::{list_objects_raw, ListLeaf};
use crate::meta::{
    read_xl_meta_quorum, write_json, XlMeta, XlPart, XL_DATA_FILE, XL_META_FILE,
};
use crate::multipart::MultipartCoordinator;
use crate::{check_object_args, check_put_size, to_v2_listing, ObjectLayer};

/// Pipe capacity for server-side copies.
const COPY_PIPE_SIZE: usize = 1024 * 1024;

/// Erasure-coded object layer
pub struct XlObjects {
    disks: Vec<Option<Arc<dyn StorageDisk>>>,
    mp: Arc<MultipartCoordinator>,
    ctx: Arc<ServerContext>,
    op_timeout: DynamicTimeout,
    block_size: u64,
    bpool: Arc<BytePool>,
}

impl XlObjects {
    /// Open the erasure backend over local disk roots. The first root
    /// doubles as the multipart spool area.
    pub async fn open(roots: &[impl AsRef<Path>], ctx: Arc<ServerContext>) -> Result<Self> {
        if roots.len() < 4 {
            return Err(Error::invalid_argument(
                "erasure mode needs at least 4 disks",
            ));
        }
        let deployment_id = Uuid::new_v4().to_string();
        let mut disks: Vec<Option<Arc<dyn StorageDisk>>> = Vec::with_capacity(roots.len());
        let mut spool: Option<Arc<PosixDisk>> = None;
        for root in roots {
            match PosixDisk::new(root.as_ref()).await {
                Ok(disk) => {
                    let disk = Arc::new(disk);
                    load_or_init_format(&*disk, BackendType::Erasure, &deployment_id).await?;
                    if spool.is_none() {
                        spool = Some(disk.clone());
                    }
                    disks.push(Some(disk));
                }
                Err(e) => {
                    warn!(root = %root.as_ref().display(), "disk offline at startup: {e}");
                    disks.push(None);
                }
            }
        }
        let Some(spool) = spool else {
            return Err(Error::DiskUnreachable);
        };
        Self::new(disks, spool, ctx).await
    }

    /// Build over prepared disks; `None` slots keep stripe positions for
    /// disks that are currently missing.
    pub async fn new(
        disks: Vec<Option<Arc<dyn StorageDisk>>>,
        spool: Arc<PosixDisk>,
        ctx: Arc<ServerContext>,
    ) -> Result<Self> {
        let config = ctx.config().load();
        let block_size = config.storage.block_size;
        let bpool = Arc::new(BytePool::new(
            block_size as usize,
            config.storage.buffer_pool_capacity,
        ));
        let mp = MultipartCoordinator::new(spool, config.multipart.min_part_size).await?;
        let op_timeout = DynamicTimeout::from_config(&config.lock);

        let xl = Self {
            disks,
            mp,
            ctx,
            op_timeout,
            block_size,
            bpool,
        };
        // Every disk carries the meta volume.
        for disk in xl.disks.iter().flatten() {
            match disk.make_volume(META_BUCKET).await {
                Ok(()) | Err(Error::VolumeAlreadyExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(xl)
    }

    /// The multipart coordinator, for wiring the stale-upload cleaner.
    #[must_use]
    pub fn multipart(&self) -> &Arc<MultipartCoordinator> {
        &self.mp
    }

    fn erasure_for(&self, data: usize, parity: usize) -> Result<ErasureStorage> {
        ErasureStorage::new(
            self.disks.clone(),
            data,
            parity,
            self.block_size,
            self.bpool.clone(),
        )
    }

    fn quorum(&self) -> usize {
        self.disks.len() / 2 + 1
    }

    /// Data/parity split for a storage class, honoring configured parity
    /// overrides and clamping so both sides keep at least one drive.
    fn redundancy(&self, class: StorageClass) -> (usize, usize) {
        let n = self.disks.len();
        let config = self.ctx.config().load();
        let configured = match class {
            StorageClass::Standard => config.storage.standard_parity,
            StorageClass::ReducedRedundancy => config.storage.rrs_parity,
        };
        match configured {
            Some(parity) => {
                let parity = parity.clamp(1, n - 1);
                (n - parity, parity)
            }
            None => redundancy_count(class, n),
        }
    }

    fn data_path(object: &str) -> String {
        format!("{object}/{XL_DATA_FILE}")
    }

    fn meta_path(object: &str) -> String {
        format!("{object}/{XL_META_FILE}")
    }

    /// Objects cannot be created below an existing object directory.
    async fn check_parent_is_object(&self, bucket: &str, object: &str) -> Result<()> {
        let Some(disk) = self.disks.iter().flatten().next() else {
            return Ok(());
        };
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
            if disk
                .stat_file(bucket, &format!("{parent}/{XL_META_FILE}"))
                .await
                .is_ok()
            {
                return Err(Error::DiskAccessDenied);
            }
        }
        Ok(())
    }

    async fn require_bucket(&self, bucket: &str) -> Result<()> {
        let stats = join_all(
            self.disks
                .iter()
                .flatten()
                .map(|disk| disk.stat_volume(bucket)),
        )
        .await;
        if stats.iter().any(std::result::Result::is_ok) {
            return Ok(());
        }
        Err(Error::BucketNotFound {
            bucket: bucket.to_string(),
        })
    }

    /// Remove the staging directory `tmp/<id>` on every disk.
    async fn cleanup_tmp(&self, tmp_id: &str) {
        let path = format!("{TMP_META_PREFIX}/{tmp_id}");
        join_all(self.disks.iter().flatten().map(|disk| {
            let path = path.clone();
            async move {
                let _ = disk.delete_dir(META_BUCKET, &path).await;
            }
        }))
        .await;
    }

    /// Write the object from `data` into the namespace under an already
    /// held write lock.
    async fn put_object_locked(
        &self,
        bucket: &str,
        object: &str,
        data: &mut HashReader,
        mut user_meta: HashMap<String, String>,
        etag_override: Option<String>,
    ) -> Result<ObjectInfo> {
        self.require_bucket(bucket).await?;
        self.check_parent_is_object(bucket, object).await?;
        check_put_size(data.size())?;

        let class = StorageClass::from_metadata(&user_meta);
        let (data_blocks, parity_blocks) = self.redundancy(class);
        let erasure = self.erasure_for(data_blocks, parity_blocks)?;

        let tmp_id = Uuid::new_v4().to_string();
        let tmp_data = format!("{TMP_META_PREFIX}/{tmp_id}/{XL_DATA_FILE}");
        let bitrot = self.ctx.config().load().storage.bitrot_algorithm;

        let file_info = match erasure
            .create_file(META_BUCKET, &tmp_data, data, bitrot)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.cleanup_tmp(&tmp_id).await;
                return Err(e);
            }
        };
        if data.bytes_read() < data.size() {
            self.cleanup_tmp(&tmp_id).await;
            return Err(Error::IncompleteBody {
                got: data.bytes_read(),
                expected: data.size(),
            });
        }
        if let Err(e) = data.verify() {
            self.cleanup_tmp(&tmp_id).await;
            return Err(e);
        }

        let etag = etag_override.unwrap_or_else(|| data.md5_current());
        user_meta.insert("etag".to_string(), etag.clone());

        let mut meta = XlMeta::new(data_blocks, parity_blocks, self.block_size);
        meta.stat.size = file_info.size;
        meta.erasure.bitrot_algorithm = file_info.algorithm;
        meta.erasure.checksums = file_info
            .checksums
            .iter()
            .map(|c| c.as_ref().map(hex::encode))
            .collect();
        meta.meta = user_meta;
        meta.parts = vec![XlPart {
            number: 1,
            name: XL_DATA_FILE.to_string(),
            etag,
            size: file_info.size,
        }];

        // Stage xl.json beside the data, then land both with one rename
        // per disk.
        let tmp_meta = format!("{TMP_META_PREFIX}/{tmp_id}/{XL_META_FILE}");
        let staged: Vec<bool> = join_all(self.disks.iter().enumerate().map(|(i, disk)| {
            let wrote_data = file_info.checksums[i].is_some();
            let meta = &meta;
            let tmp_meta = tmp_meta.as_str();
            async move {
                match disk {
                    Some(disk) if wrote_data => {
                        write_json(&**disk, META_BUCKET, tmp_meta, meta).await.is_ok()
                    }
                    _ => false,
                }
            }
        }))
        .await;

        let staged_count = staged.iter().filter(|ok| **ok).count();
        if staged_count < erasure.write_quorum() {
            self.cleanup_tmp(&tmp_id).await;
            return Err(Error::InsufficientWriteQuorum {
                have: staged_count,
                need: erasure.write_quorum(),
            });
        }

        let renames = join_all(self.disks.iter().enumerate().map(|(i, disk)| {
            let ready = staged[i];
            let src = format!("{TMP_META_PREFIX}/{tmp_id}");
            async move {
                let Some(disk) = disk else { return false };
                if !ready {
                    return false;
                }
                // Replace any previous object version on this disk.
                let _ = disk.delete_dir(bucket, object).await;
                disk.rename_file(META_BUCKET, &src, bucket, object)
                    .await
                    .is_ok()
            }
        }))
        .await;

        let landed = renames.iter().filter(|ok| **ok).count();
        if landed < erasure.write_quorum() {
            self.cleanup_tmp(&tmp_id).await;
            return Err(Error::InsufficientWriteQuorum {
                have: landed,
                need: erasure.write_quorum(),
            });
        }
        self.cleanup_tmp(&tmp_id).await;

        debug!(bucket, object, size = meta.stat.size, "erasure object written");
        Ok(meta.to_object_info(bucket, object))
    }

    async fn get_object_locked(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: Option<u64>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Vec<usize>> {
        let (meta, _) = read_xl_meta_quorum(&self.disks, bucket, object).await?;
        let length = length.unwrap_or(meta.stat.size.saturating_sub(offset));
        if offset.checked_add(length).is_none() || offset + length > meta.stat.size {
            return Err(Error::invalid_argument(format!(
                "read window {offset}+{length} exceeds object size {}",
                meta.stat.size
            )));
        }
        if meta.stat.size == 0 || length == 0 {
            return Ok(Vec::new());
        }

        let erasure =
            self.erasure_for(meta.erasure.data_blocks, meta.erasure.parity_blocks)?;
        let read = erasure
            .read_file(
                bucket,
                &Self::data_path(object),
                offset,
                length,
                meta.stat.size,
                meta.erasure.bitrot_algorithm,
                &meta.checksum_bytes(),
                writer,
            )
            .await?;
        Ok(read.stale_disks)
    }

    /// Decide which disks need healing for one object.
    async fn stale_mask(&self, bucket: &str, object: &str, meta: &XlMeta) -> Vec<bool> {
        let erasure = match self.erasure_for(meta.erasure.data_blocks, meta.erasure.parity_blocks)
        {
            Ok(e) => e,
            Err(_) => return vec![false; self.disks.len()],
        };
        let shard_len = erasure.shard_file_size(meta.stat.size);
        let checksums = meta.checksum_bytes();

        join_all(self.disks.iter().enumerate().map(|(i, disk)| {
            let checksum = checksums.get(i).cloned().flatten();
            let meta = meta.clone();
            async move {
                let Some(disk) = disk else { return false };
                // Disk present: compare its copy of xl.json first.
                match crate::meta::read_json::<XlMeta>(
                    &**disk,
                    bucket,
                    &Self::meta_path(object),
                )
                .await
                {
                    Ok(found) if found == meta => {}
                    _ => return true,
                }
                if meta.stat.size == 0 {
                    return false;
                }
                let Some(checksum) = checksum else { return true };
                let verifier = opal_common::bitrot::BitrotVerifier::new(
                    meta.erasure.bitrot_algorithm,
                    checksum,
                );
                let mut buf = vec![0u8; shard_len as usize];
                match disk
                    .read_file(bucket, &Self::data_path(object), 0, &mut buf, Some(&verifier))
                    .await
                {
                    Ok(n) => n != shard_len,
                    Err(_) => true,
                }
            }
        }))
        .await
    }

    async fn heal_object_locked(&self, bucket: &str, object: &str) -> Result<()> {
        let (meta, _) = read_xl_meta_quorum(&self.disks, bucket, object).await?;
        let stale = self.stale_mask(bucket, object, &meta).await;
        if !stale.iter().any(|s| *s) {
            return Ok(());
        }
        info!(bucket, object, stale = ?stale, "healing object");

        let erasure =
            self.erasure_for(meta.erasure.data_blocks, meta.erasure.parity_blocks)?;
        let tmp_id = Uuid::new_v4().to_string();
        let tmp_data = format!("{TMP_META_PREFIX}/{tmp_id}/{XL_DATA_FILE}");

        let healed = if meta.stat.size > 0 {
            let healed = erasure
                .heal_file(
                    &stale,
                    bucket,
                    &Self::data_path(object),
                    meta.stat.size,
                    meta.erasure.bitrot_algorithm,
                    &meta.checksum_bytes(),
                    META_BUCKET,
                    &tmp_data,
                )
                .await;
            match healed {
                Ok(h) => Some(h),
                Err(e) => {
                    self.cleanup_tmp(&tmp_id).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Reconstructed chunks must hash to exactly what the metadata
        // promised, or the heal itself is suspect.
        if let Some(healed) = &healed {
            let expected = meta.checksum_bytes();
            for (i, fresh) in healed.checksums.iter().enumerate() {
                if let Some(fresh) = fresh {
                    if expected[i].as_deref() != Some(fresh.as_slice()) {
                        self.cleanup_tmp(&tmp_id).await;
                        return Err(Error::internal(format!(
                            "healed chunk checksum diverges on disk {i}"
                        )));
                    }
                }
            }
        }

        for (i, disk) in self.disks.iter().enumerate() {
            if !stale[i] {
                continue;
            }
            let Some(disk) = disk else { continue };
            // Only disks whose heal write survived get the new copy.
            if meta.stat.size > 0 {
                let wrote = healed
                    .as_ref()
                    .is_some_and(|h| h.checksums[i].is_some());
                if !wrote {
                    continue;
                }
            }
            let tmp_meta = format!("{TMP_META_PREFIX}/{tmp_id}/{XL_META_FILE}");
            if write_json(&**disk, META_BUCKET, &tmp_meta, &meta).await.is_err() {
                continue;
            }
            let _ = disk.delete_dir(bucket, object).await;
            if let Err(e) = disk
                .rename_file(
                    META_BUCKET,
                    &format!("{TMP_META_PREFIX}/{tmp_id}"),
                    bucket,
                    object,
                )
                .await
            {
                warn!(disk = i, bucket, object, "heal rename failed: {e}");
            }
        }
        self.cleanup_tmp(&tmp_id).await;
        Ok(())
    }
}

#[async_trait]
impl ObjectLayer for XlObjects {
    async fn storage_info(&self) -> StorageInfo {
        let infos = join_all(self.disks.iter().map(|disk| async move {
            match disk {
                Some(disk) => disk.disk_info().await.ok(),
                None => None,
            }
        }))
        .await;

        let online = infos.iter().filter(|i| i.is_some()).count();
        let offline = self.disks.len() - online;
        let used = infos.iter().flatten().map(|i| i.used).sum();
        let (_, standard_parity) = self.redundancy(StorageClass::Standard);
        let (_, rrs_parity) = self.redundancy(StorageClass::ReducedRedundancy);

        StorageInfo {
            used,
            backend: BackendInfo {
                backend_type: BackendType::Erasure,
                online_disks: online,
                offline_disks: offline,
                standard_sc_parity: standard_parity,
                rrs_sc_parity: rrs_parity,
            },
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<()> {
        check_bucket_name(bucket)?;
        let results = join_all(
            self.disks
                .iter()
                .flatten()
                .map(|disk| disk.make_volume(bucket)),
        )
        .await;

        let created = results.iter().filter(|r| r.is_ok()).count();
        let existing = results
            .iter()
            .filter(|r| matches!(r, Err(Error::VolumeAlreadyExists)))
            .count();
        if existing > 0 && existing >= created {
            return Err(Error::BucketAlreadyExists {
                bucket: bucket.to_string(),
            });
        }
        if created + existing < self.quorum() {
            return Err(Error::InsufficientWriteQuorum {
                have: created + existing,
                need: self.quorum(),
            });
        }
        Ok(())
    }

    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo> {
        check_bucket_name(bucket)?;
        for disk in self.disks.iter().flatten() {
            match disk.stat_volume(bucket).await {
                Ok(vi) => {
                    return Ok(BucketInfo {
                        name: vi.name,
                        created: vi.created,
                    })
                }
                Err(Error::VolumeNotFound) => {
                    return Err(Error::BucketNotFound {
                        bucket: bucket.to_string(),
                    })
                }
                Err(_) => continue,
            }
        }
        Err(Error::DiskUnreachable)
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        for disk in self.disks.iter().flatten() {
            match disk.list_volumes().await {
                Ok(volumes) => {
                    let mut buckets: Vec<BucketInfo> = volumes
                        .into_iter()
                        .filter(|v| !v.name.starts_with('.'))
                        .map(|v| BucketInfo {
                            name: v.name,
                            created: v.created,
                        })
                        .collect();
                    buckets.sort_by(|a, b| a.name.cmp(&b.name));
                    return Ok(buckets);
                }
                Err(_) => continue,
            }
        }
        Err(Error::DiskUnreachable)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        check_bucket_name(bucket)?;
        let results = join_all(
            self.disks
                .iter()
                .flatten()
                .map(|disk| disk.delete_volume(bucket)),
        )
        .await;

        if results
            .iter()
            .any(|r| matches!(r, Err(Error::VolumeNotEmpty)))
        {
            return Err(Error::BucketNotEmpty {
                bucket: bucket.to_string(),
            });
        }
        let removed = results
            .iter()
            .filter(|r| r.is_ok() || matches!(r, Err(Error::VolumeNotFound)))
            .count();
        if removed < self.quorum() {
            return Err(Error::InsufficientWriteQuorum {
                have: removed,
                need: self.quorum(),
            });
        }
        if results
            .iter()
            .all(|r| matches!(r, Err(Error::VolumeNotFound)))
        {
            return Err(Error::BucketNotFound {
                bucket: bucket.to_string(),
            });
        }
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

        let Some(disk) = self.disks.iter().flatten().next() else {
            return Err(Error::DiskUnreachable);
        };
        let raw = list_objects_raw(
            &**disk,
            ListLeaf::XlDir,
            bucket,
            prefix,
            marker,
            delimiter,
            max_keys,
        )
        .await?;

        let mut objects = Vec::with_capacity(raw.keys.len());
        for key in &raw.keys {
            let (meta, _) = read_xl_meta_quorum(&self.disks, bucket, key).await?;
            objects.push(meta.to_object_info(bucket, key));
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
            .get_object_locked(bucket, object, offset, length, writer)
            .await;
        lk.runlock();

        match result {
            Ok(stale) if !stale.is_empty() => {
                // Heal-on-read, after the read lock is gone.
                warn!(bucket, object, ?stale, "stale chunks detected during read");
                if let Err(e) = self.heal_object(bucket, object).await {
                    warn!(bucket, object, "background heal failed: {e}");
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_object_info(&self, bucket: &str, object: &str) -> Result<ObjectInfo> {
        check_object_args(bucket, object)?;
        let lk = self.ctx.ns().new_ns_lock(bucket, object, "GetObjectInfo");
        lk.get_rlock(&self.op_timeout).await?;
        let result = read_xl_meta_quorum(&self.disks, bucket, object)
            .await
            .map(|(meta, _)| meta.to_object_info(bucket, object));
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
        let result = self
            .put_object_locked(bucket, object, data, meta, None)
            .await;
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

        if src_bucket == dst_bucket && src_object == dst_object {
            // Metadata-only rewrite under one write lock.
            let lk = self
                .ctx
                .ns()
                .new_ns_lock(src_bucket, src_object, "CopyObject");
            lk.get_lock(&self.op_timeout).await?;
            let result = async {
                let (mut xl_meta, _) =
                    read_xl_meta_quorum(&self.disks, src_bucket, src_object).await?;
                let etag = xl_meta.etag();
                if let Some(meta) = meta {
                    xl_meta.meta = meta;
                    xl_meta.meta.insert("etag".to_string(), etag);
                }
                let writes = join_all(self.disks.iter().flatten().map(|disk| {
                    let xl_meta = &xl_meta;
                    async move {
                        write_json(
                            &**disk,
                            src_bucket,
                            &Self::meta_path(src_object),
                            xl_meta,
                        )
                        .await
                        .is_ok()
                    }
                }))
                .await;
                if writes.iter().filter(|ok| **ok).count() < self.quorum() {
                    return Err(Error::InsufficientWriteQuorum {
                        have: writes.iter().filter(|ok| **ok).count(),
                        need: self.quorum(),
                    });
                }
                Ok(xl_meta.to_object_info(src_bucket, src_object))
            }
            .await;
            lk.unlock();
            return result;
        }

        let src_info = self.get_object_info(src_bucket, src_object).await?;
        let meta = meta.unwrap_or_else(|| src_info.user_defined.clone());

        let (read_half, mut write_half) = tokio::io::duplex(COPY_PIPE_SIZE);
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
            let results = join_all(
                self.disks
                    .iter()
                    .flatten()
                    .map(|disk| disk.delete_dir(bucket, object)),
            )
            .await;

            if results.iter().all(|r| {
                matches!(r, Err(e) if e.is_not_found())
            }) {
                return Err(Error::ObjectNotFound {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                });
            }
            let removed = results
                .iter()
                .filter(|r| r.is_ok() || matches!(r, Err(e) if e.is_not_found()))
                .count();
            if removed < self.quorum() {
                return Err(Error::InsufficientWriteQuorum {
                    have: removed,
                    need: self.quorum(),
                });
            }
            Ok(())
        }
        .await;
        lk.unlock();
        result
    }

    async fn heal_object(&self, bucket: &str, object: &str) -> Result<()> {
        check_object_args(bucket, object)?;
        let lk = self.ctx.ns().new_ns_lock(bucket, object, "HealObject");
        lk.get_lock(&self.op_timeout).await?;
        let result = self.heal_object_locked(bucket, object).await;
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

        let (read_half, mut write_half) = tokio::io::duplex(COPY_PIPE_SIZE);
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

        let done = self.mp.complete(bucket, object, upload_id, &parts).await?;
        let spool_abs = self.mp.spool_abs_path(&done.spool_path);

        let lk = self
            .ctx
            .ns()
            .new_ns_lock(bucket, object, "CompleteMultipartUpload");
        lk.get_lock(&self.op_timeout).await?;
        let result = async {
            let mut reader: HashReader = match tokio::fs::File::open(&spool_abs).await {
                Ok(file) => HashReader::new(Box::new(file), done.total_size),
                Err(_) if done.total_size == 0 => HashReader::from_bytes(Vec::new()),
                Err(e) => {
                    return Err(Error::internal(format!(
                        "spool file unavailable: {e}"
                    )))
                }
            };
            self.put_object_locked(
                bucket,
                object,
                &mut reader,
                done.meta.meta.clone(),
                Some(done.etag.clone()),
            )
            .await
        }
        .await;
        lk.unlock();

        if result.is_ok() {
            let _ = tokio::fs::remove_file(&spool_abs).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend(disk_count: usize) -> (Vec<TempDir>, XlObjects) {
        let dirs: Vec<TempDir> = (0..disk_count).map(|_| TempDir::new().unwrap()).collect();
        let roots: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let mut config = opal_common::config::ServerConfig::default();
        // Small blocks keep the tests multi-block without big payloads.
        config.storage.block_size = 4096;
        let ctx = ServerContext::new(config, opal_lock::NsLockMap::new_local());
        let xl = XlObjects::open(&roots, ctx).await.unwrap();
        (dirs, xl)
    }

    fn reader(data: &[u8]) -> HashReader {
        HashReader::from_bytes(data.to_vec())
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dirs, xl) = backend(6).await;
        xl.make_bucket("b").await.unwrap();

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 255) as u8).collect();
        let info = xl
            .put_object("b", "o", &mut reader(&payload), HashMap::new())
            .await
            .unwrap();
        assert_eq!(info.size, payload.len() as u64);

        let mut out = Vec::new();
        xl.get_object("b", "o", 0, None, &mut out).await.unwrap();
        assert_eq!(out, payload);

        let head = xl.get_object_info("b", "o").await.unwrap();
        assert_eq!(head.size, payload.len() as u64);
        assert_eq!(head.etag, info.etag);
    }

    #[tokio::test]
    async fn test_empty_object() {
        let (_dirs, xl) = backend(4).await;
        xl.make_bucket("b").await.unwrap();
        let info = xl
            .put_object("b", "empty", &mut reader(b""), HashMap::new())
            .await
            .unwrap();
        assert_eq!(info.size, 0);

        let mut out = Vec::new();
        xl.get_object("b", "empty", 0, None, &mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_delete_object() {
        let (_dirs, xl) = backend(4).await;
        xl.make_bucket("b").await.unwrap();
        xl.put_object("b", "o", &mut reader(b"data"), HashMap::new())
            .await
            .unwrap();
        xl.delete_object("b", "o").await.unwrap();
        assert!(matches!(
            xl.get_object_info("b", "o").await,
            Err(Error::ObjectNotFound { .. })
        ));
        assert!(matches!(
            xl.delete_object("b", "o").await,
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_chunk_heals_on_read() {
        let (dirs, xl) = backend(6).await;
        xl.make_bucket("b").await.unwrap();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        xl.put_object("b", "o", &mut reader(&payload), HashMap::new())
            .await
            .unwrap();

        // Corrupt one chunk file behind the backend's back.
        let chunk = dirs[2].path().join("b/o/part.1");
        let len = std::fs::metadata(&chunk).unwrap().len();
        std::fs::write(&chunk, vec![0u8; len as usize]).unwrap();

        let mut out = Vec::new();
        xl.get_object("b", "o", 0, None, &mut out).await.unwrap();
        assert_eq!(out, payload);

        // Heal-on-read restored the chunk.
        let restored = std::fs::read(&chunk).unwrap();
        assert_ne!(restored, vec![0u8; len as usize]);

        let mut out = Vec::new();
        xl.get_object("b", "o", 0, None, &mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_listing_sees_objects_not_internals() {
        let (_dirs, xl) = backend(4).await;
        xl.make_bucket("b").await.unwrap();
        for key in ["x", "dir/y"] {
            xl.put_object("b", key, &mut reader(b"data"), HashMap::new())
                .await
                .unwrap();
        }
        let listing = xl.list_objects("b", "", "", "", 1000).await.unwrap();
        let keys: Vec<&str> = listing.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(keys, vec!["dir/y", "x"]);
    }

    #[tokio::test]
    async fn test_reduced_redundancy_class() {
        let (_dirs, xl) = backend(8).await;
        xl.make_bucket("b").await.unwrap();
        let mut meta = HashMap::new();
        meta.insert(
            opal_common::types::AMZ_STORAGE_CLASS.to_string(),
            "REDUCED_REDUNDANCY".to_string(),
        );
        let payload = vec![7u8; 9000];
        xl.put_object("b", "rr", &mut reader(&payload), meta)
            .await
            .unwrap();

        let mut out = Vec::new();
        xl.get_object("b", "rr", 0, None, &mut out).await.unwrap();
        assert_eq!(out, payload);

        let info = xl.storage_info().await;
        assert_eq!(info.backend.standard_sc_parity, 4);
        assert_eq!(info.backend.rrs_sc_parity, 2);
    }
}
