//! Multipart upload coordinator
//!
//! Accepts parts out of order over a long window and turns them into one
//! contiguous file ready for the backend to commit. Each upload id owns
//! a working directory of `NNNNN.ETAG` part files plus its metadata
//! document, and an in-memory append record that a background worker
//! keeps rolling forward part by part. The record may lag behind the
//! directory, never lead it.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use opal_common::error::{Error, Result};
use opal_common::etag::{complete_multipart_etag, HashReader};
use opal_common::types::{
    CompletePart, ListMultipartsInfo, ListPartsInfo, MultipartUploadInfo, PartInfo, MAX_PARTS,
    META_BUCKET, MULTIPART_META_PREFIX, TMP_META_PREFIX,
};
use opal_disk::{PosixDisk, StorageDisk};

use crate::meta::{read_json, write_json, FsMeta, FS_META_FILE};

/// Copy unit for on-disk append streaming.
const APPEND_BUF_SIZE: usize = 1024 * 1024;

/// One part already rolled into the append file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendedPart {
    pub number: u32,
    pub etag: String,
}

/// In-memory record of the append file for one upload id.
///
/// The record mutex is held across append I/O; the map holding the
/// records is only ever locked briefly.
struct AppendRecord {
    file_path: String,
    parts: Vec<AppendedPart>,
}

/// Everything Complete needs from the coordinator before the backend
/// commits the object
#[derive(Debug)]
pub struct CompletedUpload {
    /// Contiguous appended file, relative to the meta bucket.
    pub spool_path: String,
    /// Composite S3 ETag for the finished object.
    pub etag: String,
    pub total_size: u64,
    /// Metadata captured at initiate time.
    pub meta: FsMeta,
}

/// The multipart upload coordinator
pub struct MultipartCoordinator {
    disk: Arc<PosixDisk>,
    /// Distinguishes this process's tmp files from stale ones.
    instance_id: String,
    /// S3's 5 MiB floor unless the deployment lowers it.
    min_part_size: u64,
    append_map: Mutex<HashMap<String, Arc<tokio::sync::Mutex<AppendRecord>>>>,
}

impl MultipartCoordinator {
    pub async fn new(disk: Arc<PosixDisk>, min_part_size: u64) -> Result<Arc<Self>> {
        match disk.make_volume(META_BUCKET).await {
            Ok(()) | Err(Error::VolumeAlreadyExists) => {}
            Err(e) => return Err(e),
        }
        Ok(Arc::new(Self {
            disk,
            instance_id: Uuid::new_v4().to_string(),
            min_part_size,
            append_map: Mutex::new(HashMap::new()),
        }))
    }

    fn sha_dir(bucket: &str, object: &str) -> String {
        let digest = Sha256::digest(format!("{bucket}/{object}").as_bytes());
        format!("{MULTIPART_META_PREFIX}/{}", hex::encode(digest))
    }

    fn upload_dir(bucket: &str, object: &str, upload_id: &str) -> String {
        format!("{}/{upload_id}", Self::sha_dir(bucket, object))
    }

    fn tmp_path(&self, name: &str) -> String {
        format!("{TMP_META_PREFIX}/{}/{name}", self.instance_id)
    }

    /// Part files are named `NNNNN.ETAG`.
    fn encode_part_file(part_number: u32, etag: &str) -> String {
        format!("{part_number:05}.{etag}")
    }

    fn decode_part_file(name: &str) -> Result<(u32, String)> {
        let (number, etag) = name
            .split_once('.')
            .ok_or_else(|| Error::internal(format!("unexpected part file name {name}")))?;
        let number: u32 = number
            .parse()
            .map_err(|_| Error::internal(format!("unexpected part file name {name}")))?;
        Ok((number, etag.to_string()))
    }

    /// Absolute path of a spool file, for the backend's commit step.
    #[must_use]
    pub fn spool_abs_path(&self, rel: &str) -> PathBuf {
        self.disk.root().join(META_BUCKET).join(rel)
    }

    async fn require_upload(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()> {
        let meta_path = format!(
            "{}/{FS_META_FILE}",
            Self::upload_dir(bucket, object, upload_id)
        );
        match self.disk.stat_file(META_BUCKET, &meta_path).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::InvalidUploadId {
                upload_id: upload_id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Initiate: allocate a universally unique upload id and create its
    /// working directory with the in-progress metadata document.
    pub async fn new_upload(
        &self,
        bucket: &str,
        object: &str,
        meta: HashMap<String, String>,
    ) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        let dir = Self::upload_dir(bucket, object, &upload_id);
        write_json(
            &*self.disk,
            META_BUCKET,
            &format!("{dir}/{FS_META_FILE}"),
            &FsMeta::with_meta(meta),
        )
        .await?;
        debug!(bucket, object, upload_id, "initiated multipart upload");
        Ok(upload_id)
    }

    /// PutPart: stream to tmp, rename into the upload directory under
    /// the content ETag, and nudge the background appender.
    pub async fn put_part(
        self: &Arc<Self>,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u32,
        data: &mut HashReader,
    ) -> Result<PartInfo> {
        if part_number == 0 || part_number > MAX_PARTS {
            return Err(Error::invalid_argument(format!(
                "part number must be between 1 and {MAX_PARTS}, got {part_number}"
            )));
        }
        self.require_upload(bucket, object, upload_id).await?;

        let size = data.size();
        let tmp = self.tmp_path(&format!("{upload_id}.{}.{part_number}", Uuid::new_v4()));
        match self.disk.create_file(META_BUCKET, &tmp, size, data).await {
            Ok(_) => {}
            Err(Error::ShortRead) => {
                let _ = self.disk.delete_file(META_BUCKET, &tmp).await;
                return Err(Error::IncompleteBody {
                    got: data.bytes_read(),
                    expected: size,
                });
            }
            Err(e) => {
                let _ = self.disk.delete_file(META_BUCKET, &tmp).await;
                return Err(e);
            }
        }
        if let Err(e) = data.verify() {
            let _ = self.disk.delete_file(META_BUCKET, &tmp).await;
            return Err(e);
        }

        let etag = data.md5_current();
        let part_path = format!(
            "{}/{}",
            Self::upload_dir(bucket, object, upload_id),
            Self::encode_part_file(part_number, &etag)
        );
        self.disk
            .rename_file(META_BUCKET, &tmp, META_BUCKET, &part_path)
            .await?;

        // One idempotent worker per upload id rolls the append forward.
        let this = self.clone();
        let (bucket, object, upload_id_owned) =
            (bucket.to_string(), object.to_string(), upload_id.to_string());
        tokio::spawn(async move {
            this.background_append(&bucket, &object, &upload_id_owned).await;
        });

        let fi = self.disk.stat_file(META_BUCKET, &part_path).await?;
        Ok(PartInfo {
            part_number,
            last_modified: Some(fi.mod_time),
            etag,
            size: fi.size,
        })
    }

    fn append_record(&self, upload_id: &str) -> Arc<tokio::sync::Mutex<AppendRecord>> {
        let mut map = self.append_map.lock();
        map.entry(upload_id.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(AppendRecord {
                    file_path: self.tmp_path(&format!("{upload_id}.{}", Uuid::new_v4())),
                    parts: Vec::new(),
                }))
            })
            .clone()
    }

    /// Append uploaded parts to the spool file in strictly ascending
    /// part order, stopping at the first gap. Never waits for a part to
    /// arrive; re-invoked whenever a new part lands.
    pub async fn background_append(&self, bucket: &str, object: &str, upload_id: &str) {
        let record = self.append_record(upload_id);
        let mut record = record.lock().await;

        // Parts append sequentially, so the next wanted number is always
        // one past what the record holds.
        let mut next = record.parts.len() as u32 + 1;
        let dir = Self::upload_dir(bucket, object, upload_id);
        let mut entries = match self.disk.list_dir(META_BUCKET, &dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(upload_id, "append scan failed: {e}");
                return;
            }
        };
        entries.sort();

        for entry in entries {
            if entry == FS_META_FILE {
                continue;
            }
            let Ok((number, etag)) = Self::decode_part_file(&entry) else {
                warn!(upload_id, entry, "unrecognized entry in upload directory");
                return;
            };
            if number < next {
                continue;
            }
            if number > next {
                return;
            }
            let src = format!("{dir}/{entry}");
            if let Err(e) = self.append_on_disk(&src, &record.file_path).await {
                error!(upload_id, part = number, "spool append failed: {e}");
                return;
            }
            record.parts.push(AppendedPart { number, etag });
            next += 1;
        }
    }

    /// Copy one on-disk file onto the end of another, both below the
    /// meta bucket.
    async fn append_on_disk(&self, src: &str, dst: &str) -> Result<()> {
        let info = self.disk.stat_file(META_BUCKET, src).await?;
        let mut offset = 0u64;
        let mut buf = vec![0u8; APPEND_BUF_SIZE.min(info.size.max(1) as usize)];
        while offset < info.size {
            let n = self
                .disk
                .read_file(META_BUCKET, src, offset, &mut buf, None)
                .await?;
            if n == 0 {
                return Err(Error::ShortRead);
            }
            self.disk
                .append_file(META_BUCKET, dst, &buf[..n as usize])
                .await?;
            offset += n;
        }
        Ok(())
    }

    /// ListParts with deterministic part-number ordering; duplicate part
    /// numbers resolve to the latest upload by modtime.
    pub async fn list_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: usize,
    ) -> Result<ListPartsInfo> {
        self.require_upload(bucket, object, upload_id).await?;
        let dir = Self::upload_dir(bucket, object, upload_id);
        let entries = self.disk.list_dir(META_BUCKET, &dir).await?;

        let mut by_number: HashMap<u32, String> = HashMap::new();
        for entry in &entries {
            if entry == FS_META_FILE {
                continue;
            }
            let Ok((number, etag)) = Self::decode_part_file(entry) else {
                continue;
            };
            match by_number.get(&number) {
                None => {
                    by_number.insert(number, etag);
                }
                Some(existing) => {
                    let current = self
                        .disk
                        .stat_file(
                            META_BUCKET,
                            &format!("{dir}/{}", Self::encode_part_file(number, existing)),
                        )
                        .await?;
                    let challenger = self
                        .disk
                        .stat_file(
                            META_BUCKET,
                            &format!("{dir}/{}", Self::encode_part_file(number, &etag)),
                        )
                        .await?;
                    if challenger.mod_time > current.mod_time {
                        by_number.insert(number, etag);
                    }
                }
            }
        }

        let mut numbers: Vec<u32> = by_number.keys().copied().collect();
        numbers.sort_unstable();

        let mut result = ListPartsInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id: upload_id.to_string(),
            part_number_marker,
            max_parts,
            ..Default::default()
        };
        for number in numbers {
            if number <= part_number_marker {
                continue;
            }
            if result.parts.len() == max_parts {
                result.is_truncated = true;
                break;
            }
            let etag = by_number[&number].clone();
            let fi = self
                .disk
                .stat_file(
                    META_BUCKET,
                    &format!("{dir}/{}", Self::encode_part_file(number, &etag)),
                )
                .await?;
            result.parts.push(PartInfo {
                part_number: number,
                last_modified: Some(fi.mod_time),
                etag,
                size: fi.size,
            });
        }
        if result.is_truncated {
            result.next_part_number_marker =
                result.parts.last().map(|p| p.part_number).unwrap_or(0);
        }
        Ok(result)
    }

    /// ListUploads for one object, ordered by initiate time.
    pub async fn list_uploads(
        &self,
        bucket: &str,
        object: &str,
        upload_id_marker: &str,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo> {
        let mut result = ListMultipartsInfo {
            prefix: object.to_string(),
            upload_id_marker: upload_id_marker.to_string(),
            max_uploads,
            ..Default::default()
        };

        let sha_dir = Self::sha_dir(bucket, object);
        let upload_ids = match self.disk.list_dir(META_BUCKET, &sha_dir).await {
            Ok(ids) => ids,
            Err(e) if e.is_not_found() => return Ok(result),
            Err(e) => return Err(e),
        };

        let mut uploads = Vec::new();
        for raw in upload_ids {
            let upload_id = raw.trim_end_matches('/').to_string();
            let meta_path = format!("{sha_dir}/{upload_id}/{FS_META_FILE}");
            let Ok(fi) = self.disk.stat_file(META_BUCKET, &meta_path).await else {
                continue;
            };
            uploads.push(MultipartUploadInfo {
                object: object.to_string(),
                upload_id,
                initiated: fi.mod_time,
            });
        }
        uploads.sort_by(|a, b| a.initiated.cmp(&b.initiated));

        let mut index = 0;
        if !upload_id_marker.is_empty() {
            while index < uploads.len() {
                index += 1;
                if uploads[index - 1].upload_id == upload_id_marker {
                    break;
                }
            }
        }
        while index < uploads.len() {
            result.uploads.push(uploads[index].clone());
            result.next_upload_id_marker = uploads[index].upload_id.clone();
            index += 1;
            if result.uploads.len() == max_uploads {
                break;
            }
        }
        result.is_truncated = index < uploads.len();
        if !result.is_truncated {
            result.next_upload_id_marker.clear();
        }
        Ok(result)
    }

    /// Validate the claimed parts and produce the contiguous appended
    /// file; the backend commits it under its own write lock.
    pub async fn complete(
        self: &Arc<Self>,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> Result<CompletedUpload> {
        self.require_upload(bucket, object, upload_id).await?;
        if parts.is_empty() {
            return Err(Error::invalid_argument("no parts to complete"));
        }
        if !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
            return Err(Error::invalid_argument(
                "parts are not in ascending order",
            ));
        }

        let etag = complete_multipart_etag(parts)?;
        let dir = Self::upload_dir(bucket, object, upload_id);

        // Validate every claimed part against the file on disk. All
        // parts but the last must be at least the S3 minimum and all of
        // equal size (strict; keeps offsets computable up front).
        let mut part_size: Option<u64> = None;
        let mut total_size = 0u64;
        for (i, part) in parts.iter().enumerate() {
            let path = format!(
                "{dir}/{}",
                Self::encode_part_file(part.part_number, part.etag.trim_matches('"'))
            );
            let fi = match self.disk.stat_file(META_BUCKET, &path).await {
                Ok(fi) => fi,
                Err(e) if e.is_not_found() => {
                    return Err(Error::InvalidPart {
                        part_number: part.part_number,
                    })
                }
                Err(e) => return Err(e),
            };
            total_size += fi.size;
            if i == parts.len() - 1 {
                break;
            }
            if fi.size < self.min_part_size {
                return Err(Error::PartTooSmall {
                    part_number: part.part_number,
                    size: fi.size,
                    min: self.min_part_size,
                });
            }
            match part_size {
                None => part_size = Some(fi.size),
                Some(expected) if expected != fi.size => {
                    return Err(Error::PartsSizeUnequal)
                }
                Some(_) => {}
            }
        }

        // The appender usually finished long ago; run it once more to
        // cover a final PutPart whose worker has not been scheduled yet.
        self.background_append(bucket, object, upload_id).await;

        let record = self.append_map.lock().remove(upload_id);
        let mut spool_path = None;
        if let Some(record) = &record {
            let record = record.lock().await;
            let matches = record.parts.len() == parts.len()
                && record
                    .parts
                    .iter()
                    .zip(parts)
                    .all(|(appended, claimed)| {
                        appended.number == claimed.part_number
                            && appended.etag == claimed.etag.trim_matches('"')
                    });
            if matches {
                spool_path = Some(record.file_path.clone());
            } else {
                // A part was overwritten after it was appended; the
                // spool no longer mirrors the claimed list.
                let _ = self.disk.delete_file(META_BUCKET, &record.file_path).await;
            }
        }

        let spool_path = match spool_path {
            Some(path) => path,
            None => {
                // Fallback: fresh sequential append of exactly the
                // claimed parts.
                info!(upload_id, "background append incomplete, rebuilding spool");
                let fresh = self.tmp_path(&format!("{upload_id}.{}", Uuid::new_v4()));
                for part in parts {
                    let src = format!(
                        "{dir}/{}",
                        Self::encode_part_file(part.part_number, part.etag.trim_matches('"'))
                    );
                    self.append_on_disk(&src, &fresh).await?;
                }
                fresh
            }
        };

        let meta: FsMeta = read_json(
            &*self.disk,
            META_BUCKET,
            &format!("{dir}/{FS_META_FILE}"),
        )
        .await
        .unwrap_or_default();

        Ok(CompletedUpload {
            spool_path,
            etag,
            total_size,
            meta,
        })
    }

    /// Drop the upload's working directory after a successful commit.
    pub async fn remove_upload(&self, bucket: &str, object: &str, upload_id: &str) {
        let dir = Self::upload_dir(bucket, object, upload_id);
        if let Err(e) = self.disk.delete_dir(META_BUCKET, &dir).await {
            if !e.is_not_found() {
                warn!(upload_id, "failed to remove upload directory: {e}");
            }
        }
    }

    /// Abort: drop the append record and the working directory.
    /// Idempotent; aborting an unknown upload id is a no-op.
    pub async fn abort(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()> {
        let record = self.append_map.lock().remove(upload_id);
        if let Some(record) = record {
            let record = record.lock().await;
            let _ = self.disk.delete_file(META_BUCKET, &record.file_path).await;
        }
        match self.require_upload(bucket, object, upload_id).await {
            Ok(()) => {}
            Err(Error::InvalidUploadId { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.remove_upload(bucket, object, upload_id).await;
        Ok(())
    }

    /// Remove upload directories idle longer than `expiry`.
    pub async fn cleanup_stale(&self, expiry: Duration) {
        let now = chrono::Utc::now();
        let sha_dirs = match self.disk.list_dir(META_BUCKET, MULTIPART_META_PREFIX).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for sha in sha_dirs {
            let sha = sha.trim_end_matches('/');
            let sha_path = format!("{MULTIPART_META_PREFIX}/{sha}");
            let Ok(upload_ids) = self.disk.list_dir(META_BUCKET, &sha_path).await else {
                continue;
            };
            for raw in upload_ids {
                let upload_id = raw.trim_end_matches('/');
                let upload_path = format!("{sha_path}/{upload_id}");
                let Ok(fi) = self.disk.stat_file(META_BUCKET, &upload_path).await else {
                    continue;
                };
                let age = now.signed_duration_since(fi.mod_time);
                if age.num_milliseconds() as u128 > expiry.as_millis() {
                    info!(upload_id, "removing stale multipart upload");
                    self.append_map.lock().remove(upload_id);
                    let _ = self.disk.delete_dir(META_BUCKET, &upload_path).await;
                }
            }
        }
    }

    /// Long-running stale-upload cleaner. Wakes every `interval`,
    /// removes uploads older than `expiry`, and exits promptly once the
    /// shutdown signal fires. It is not restarted after shutdown.
    pub async fn run_cleaner(
        self: Arc<Self>,
        interval: Duration,
        expiry: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("multipart cleaner exiting");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.cleanup_stale(expiry).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_common::types::MIN_PART_SIZE;
    use tempfile::TempDir;

    async fn coordinator() -> (TempDir, Arc<MultipartCoordinator>) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(PosixDisk::new(dir.path()).await.unwrap());
        let mp = MultipartCoordinator::new(disk, MIN_PART_SIZE).await.unwrap();
        (dir, mp)
    }

    fn reader(data: &[u8]) -> HashReader {
        HashReader::from_bytes(data.to_vec())
    }

    async fn read_spool(mp: &MultipartCoordinator, rel: &str) -> Vec<u8> {
        std::fs::read(mp.spool_abs_path(rel)).unwrap()
    }

    #[tokio::test]
    async fn test_initiate_is_always_fresh() {
        let (_dir, mp) = coordinator().await;
        let a = mp.new_upload("b", "o", HashMap::new()).await.unwrap();
        let b = mp.new_upload("b", "o", HashMap::new()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_put_part_unknown_upload() {
        let (_dir, mp) = coordinator().await;
        let mut data = reader(b"xxxx");
        assert!(matches!(
            mp.put_part("b", "o", "ghost", 1, &mut data).await,
            Err(Error::InvalidUploadId { .. })
        ));
    }

    #[tokio::test]
    async fn test_part_number_bounds() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();
        let mut data = reader(b"xxxx");
        assert!(mp.put_part("b", "o", &id, 0, &mut data).await.is_err());
        let mut data = reader(b"xxxx");
        assert!(mp.put_part("b", "o", &id, MAX_PARTS + 1, &mut data).await.is_err());
        let mut data = reader(b"xxxx");
        assert!(mp.put_part("b", "o", &id, MAX_PARTS, &mut data).await.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_order_parts_assemble_in_order() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();

        // Part 2 first: the appender must stop at the gap.
        mp.put_part("b", "o", &id, 2, &mut reader(b"BBBB")).await.unwrap();
        mp.background_append("b", "o", &id).await;
        {
            let record = mp.append_record(&id);
            let record = record.lock().await;
            assert!(record.parts.is_empty());
        }

        mp.put_part("b", "o", &id, 1, &mut reader(b"AAAA")).await.unwrap();
        mp.put_part("b", "o", &id, 3, &mut reader(b"CC")).await.unwrap();
        mp.background_append("b", "o", &id).await;

        let record = mp.append_record(&id);
        let record = record.lock().await;
        let numbers: Vec<u32> = record.parts.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(read_spool(&mp, &record.file_path).await, b"AAAABBBBCC");
    }

    #[tokio::test]
    async fn test_small_parts_rejected_on_complete() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();
        mp.put_part("b", "o", &id, 1, &mut reader(b"AAAA")).await.unwrap();
        mp.put_part("b", "o", &id, 2, &mut reader(b"CC")).await.unwrap();

        let parts = vec![
            CompletePart {
                part_number: 1,
                etag: opal_common::etag::content_md5_hex(b"AAAA"),
            },
            CompletePart {
                part_number: 2,
                etag: opal_common::etag::content_md5_hex(b"CC"),
            },
        ];
        // All but the last part must meet the 5 MiB minimum.
        let err = mp.complete("b", "o", &id, &parts).await.unwrap_err();
        assert!(matches!(err, Error::PartTooSmall { part_number: 1, .. }));
    }

    #[tokio::test]
    async fn test_complete_gathers_spool() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();

        let big_a = vec![b'A'; MIN_PART_SIZE as usize];
        let big_b = vec![b'B'; MIN_PART_SIZE as usize];
        mp.put_part("b", "o", &id, 2, &mut reader(&big_b)).await.unwrap();
        mp.put_part("b", "o", &id, 1, &mut reader(&big_a)).await.unwrap();
        mp.put_part("b", "o", &id, 3, &mut reader(b"tail")).await.unwrap();

        let parts = vec![
            CompletePart {
                part_number: 1,
                etag: opal_common::etag::content_md5_hex(&big_a),
            },
            CompletePart {
                part_number: 2,
                etag: opal_common::etag::content_md5_hex(&big_b),
            },
            CompletePart {
                part_number: 3,
                etag: opal_common::etag::content_md5_hex(b"tail"),
            },
        ];
        let done = mp.complete("b", "o", &id, &parts).await.unwrap();
        assert_eq!(done.total_size, 2 * MIN_PART_SIZE + 4);
        assert_eq!(done.etag, complete_multipart_etag(&parts).unwrap());

        let mut expected = Vec::new();
        expected.extend_from_slice(&big_a);
        expected.extend_from_slice(&big_b);
        expected.extend_from_slice(b"tail");
        assert_eq!(read_spool(&mp, &done.spool_path).await, expected);
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_etag() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();
        mp.put_part("b", "o", &id, 1, &mut reader(b"data")).await.unwrap();

        let parts = vec![CompletePart {
            part_number: 1,
            etag: opal_common::etag::content_md5_hex(b"other"),
        }];
        assert!(matches!(
            mp.complete("b", "o", &id, &parts).await,
            Err(Error::InvalidPart { part_number: 1 })
        ));
    }

    #[tokio::test]
    async fn test_unequal_part_sizes_rejected() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();

        let big = vec![b'A'; MIN_PART_SIZE as usize];
        let bigger = vec![b'B'; (MIN_PART_SIZE + 1024) as usize];
        mp.put_part("b", "o", &id, 1, &mut reader(&big)).await.unwrap();
        mp.put_part("b", "o", &id, 2, &mut reader(&bigger)).await.unwrap();
        mp.put_part("b", "o", &id, 3, &mut reader(b"x")).await.unwrap();

        let parts = vec![
            CompletePart {
                part_number: 1,
                etag: opal_common::etag::content_md5_hex(&big),
            },
            CompletePart {
                part_number: 2,
                etag: opal_common::etag::content_md5_hex(&bigger),
            },
            CompletePart {
                part_number: 3,
                etag: opal_common::etag::content_md5_hex(b"x"),
            },
        ];
        assert!(matches!(
            mp.complete("b", "o", &id, &parts).await,
            Err(Error::PartsSizeUnequal)
        ));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();
        mp.put_part("b", "o", &id, 1, &mut reader(b"zzzz")).await.unwrap();

        mp.abort("b", "o", &id).await.unwrap();
        // Second abort is a no-op returning success.
        mp.abort("b", "o", &id).await.unwrap();

        let mut data = reader(b"zzzz");
        assert!(matches!(
            mp.put_part("b", "o", &id, 2, &mut data).await,
            Err(Error::InvalidUploadId { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_parts_orders_and_dedupes() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();

        mp.put_part("b", "o", &id, 3, &mut reader(b"three")).await.unwrap();
        mp.put_part("b", "o", &id, 1, &mut reader(b"one-v1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Overwrite part 1; the later upload wins.
        mp.put_part("b", "o", &id, 1, &mut reader(b"one-v2")).await.unwrap();

        let listing = mp.list_parts("b", "o", &id, 0, 100).await.unwrap();
        let numbers: Vec<u32> = listing.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(
            listing.parts[0].etag,
            opal_common::etag::content_md5_hex(b"one-v2")
        );
    }

    #[tokio::test]
    async fn test_list_uploads_sorted_by_initiation() {
        let (_dir, mp) = coordinator().await;
        let first = mp.new_upload("b", "o", HashMap::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = mp.new_upload("b", "o", HashMap::new()).await.unwrap();

        let listing = mp.list_uploads("b", "o", "", 100).await.unwrap();
        let ids: Vec<&str> = listing.uploads.iter().map(|u| u.upload_id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
    }

    #[tokio::test]
    async fn test_cleaner_removes_stale_uploads() {
        let (_dir, mp) = coordinator().await;
        let id = mp.new_upload("b", "o", HashMap::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        mp.cleanup_stale(Duration::from_millis(10)).await;

        let mut data = reader(b"data");
        assert!(matches!(
            mp.put_part("b", "o", &id, 1, &mut data).await,
            Err(Error::InvalidUploadId { .. })
        ));
    }

    #[tokio::test]
    async fn test_cleaner_task_shuts_down() {
        let (_dir, mp) = coordinator().await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(mp.clone().run_cleaner(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            rx,
        ));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("cleaner did not exit on shutdown")
            .unwrap();
    }
}
