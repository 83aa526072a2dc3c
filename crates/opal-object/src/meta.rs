//! Per-object metadata documents
//!
//! The FS backend stores `fs.json` beside the object under the meta
//! bucket; the erasure backend stores `xl.json` inside the object
//! directory on every disk. Documents are never updated in place: they
//! are written to the tmp area and renamed.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use opal_common::bitrot::BitrotAlgorithm;
use opal_common::error::{Error, Result};
use opal_common::types::{FileInfo, ObjectInfo, META_BUCKET};
use opal_disk::StorageDisk;

/// Metadata file of the FS backend and of multipart upload directories.
pub const FS_META_FILE: &str = "fs.json";
/// Metadata file of the erasure backend, one per disk.
pub const XL_META_FILE: &str = "xl.json";
/// Name of the single data file inside an erasure object directory.
pub const XL_DATA_FILE: &str = "part.1";

/// Metadata keys that never surface as user-defined metadata.
const RESERVED_META_KEYS: &[&str] = &["etag", "content-type"];

/// fs.json: format version plus the metadata map
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsMeta {
    pub version: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl FsMeta {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: "1".to_string(),
            meta: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_meta(meta: HashMap<String, String>) -> Self {
        Self {
            version: "1".to_string(),
            meta,
        }
    }

    #[must_use]
    pub fn etag(&self) -> String {
        self.meta.get("etag").cloned().unwrap_or_default()
    }

    /// Build the API view from the metadata plus a stat of the data file.
    #[must_use]
    pub fn to_object_info(&self, bucket: &str, object: &str, fi: &FileInfo) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            mod_time: Some(fi.mod_time),
            size: fi.size,
            is_dir: fi.is_dir,
            etag: self.etag(),
            content_type: self.meta.get("content-type").cloned(),
            user_defined: user_defined(&self.meta),
        }
    }
}

fn user_defined(meta: &HashMap<String, String>) -> HashMap<String, String> {
    meta.iter()
        .filter(|(k, _)| !RESERVED_META_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Stat section of xl.json
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlStat {
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

/// Erasure section of xl.json
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlErasure {
    /// Coding algorithm identifier.
    pub algorithm: String,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub block_size: u64,
    pub bitrot_algorithm: BitrotAlgorithm,
    /// Hex whole-file checksums, exactly one slot per disk of the set,
    /// `None` where the disk failed during the write.
    pub checksums: Vec<Option<String>>,
}

/// One part of an erasure object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlPart {
    pub number: u32,
    pub name: String,
    pub etag: String,
    pub size: u64,
}

/// xl.json: the full per-object document of the erasure backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlMeta {
    pub version: String,
    pub stat: XlStat,
    pub erasure: XlErasure,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub parts: Vec<XlPart>,
}

impl XlMeta {
    #[must_use]
    pub fn new(data_blocks: usize, parity_blocks: usize, block_size: u64) -> Self {
        Self {
            version: "1".to_string(),
            stat: XlStat {
                size: 0,
                mod_time: Utc::now(),
            },
            erasure: XlErasure {
                algorithm: "reed-solomon".to_string(),
                data_blocks,
                parity_blocks,
                block_size,
                bitrot_algorithm: BitrotAlgorithm::default(),
                checksums: vec![None; data_blocks + parity_blocks],
            },
            meta: HashMap::new(),
            parts: Vec::new(),
        }
    }

    /// Enforce the structural invariants before the document is trusted.
    pub fn validate(&self) -> Result<()> {
        let total = self.erasure.data_blocks + self.erasure.parity_blocks;
        if self.erasure.data_blocks == 0 || self.erasure.parity_blocks == 0 {
            return Err(Error::FileCorrupted);
        }
        if self.erasure.checksums.len() != total {
            return Err(Error::FileCorrupted);
        }
        Ok(())
    }

    #[must_use]
    pub fn etag(&self) -> String {
        self.meta.get("etag").cloned().unwrap_or_default()
    }

    /// Decode the stored hex checksums into verifier form.
    #[must_use]
    pub fn checksum_bytes(&self) -> Vec<Option<Vec<u8>>> {
        self.erasure
            .checksums
            .iter()
            .map(|c| c.as_ref().and_then(|hexed| hex::decode(hexed).ok()))
            .collect()
    }

    #[must_use]
    pub fn to_object_info(&self, bucket: &str, object: &str) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            mod_time: Some(self.stat.mod_time),
            size: self.stat.size,
            is_dir: false,
            etag: self.etag(),
            content_type: self.meta.get("content-type").cloned(),
            user_defined: user_defined(&self.meta),
        }
    }
}

/// Write a JSON document below `volume/path` on one disk, through the
/// tmp area and a rename so readers never observe a torn document.
pub async fn write_json<T: Serialize + Sync>(
    disk: &dyn StorageDisk,
    volume: &str,
    path: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
    let tmp = format!("tmp/meta-{}", Uuid::new_v4());
    let mut cursor = std::io::Cursor::new(raw.clone());
    disk.create_file(META_BUCKET, &tmp, raw.len() as u64, &mut cursor)
        .await?;
    match disk.rename_file(META_BUCKET, &tmp, volume, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = disk.delete_file(META_BUCKET, &tmp).await;
            Err(e)
        }
    }
}

/// Read and parse a JSON document from one disk.
pub async fn read_json<T: DeserializeOwned>(
    disk: &dyn StorageDisk,
    volume: &str,
    path: &str,
) -> Result<T> {
    let info = disk.stat_file(volume, path).await?;
    let mut buf = vec![0u8; info.size as usize];
    disk.read_file(volume, path, 0, &mut buf, None).await?;
    serde_json::from_slice(&buf).map_err(|_| Error::FileCorrupted)
}

/// Read xl.json from every disk and reconcile.
///
/// Copies are grouped by content; the majority group wins, and a tie
/// goes to the copy with the highest modtime. Returns the winning
/// document plus a per-disk flag telling whether that disk carries it.
pub async fn read_xl_meta_quorum(
    disks: &[Option<Arc<dyn StorageDisk>>],
    bucket: &str,
    object: &str,
) -> Result<(XlMeta, Vec<bool>)> {
    let path = format!("{object}/{XL_META_FILE}");
    let reads = disks.iter().map(|disk| {
        let disk = disk.clone();
        let path = path.clone();
        let bucket = bucket.to_string();
        async move {
            match disk {
                Some(disk) => Some(read_json::<XlMeta>(&*disk, &bucket, &path).await),
                None => None,
            }
        }
    });
    let results = futures::future::join_all(reads).await;

    let mut docs: Vec<Option<XlMeta>> = Vec::with_capacity(disks.len());
    let mut volume_missing = 0usize;
    let mut present = 0usize;
    for result in results {
        match result {
            Some(Ok(doc)) if doc.validate().is_ok() => {
                present += 1;
                docs.push(Some(doc));
            }
            Some(Err(Error::VolumeNotFound)) => {
                volume_missing += 1;
                docs.push(None);
            }
            _ => docs.push(None),
        }
    }

    if present == 0 {
        if volume_missing > 0 && volume_missing >= disks.len().div_ceil(2) {
            return Err(Error::BucketNotFound {
                bucket: bucket.to_string(),
            });
        }
        return Err(Error::ObjectNotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
        });
    }

    // Majority by content, modtime as tie-break.
    let mut groups: Vec<(XlMeta, usize)> = Vec::new();
    for doc in docs.iter().flatten() {
        match groups.iter_mut().find(|(candidate, _)| candidate == doc) {
            Some((_, count)) => *count += 1,
            None => groups.push((doc.clone(), 1)),
        }
    }
    groups.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(b.0.stat.mod_time.cmp(&a.0.stat.mod_time))
    });
    let (winner, votes) = groups.remove(0);

    if votes < winner.erasure.data_blocks {
        return Err(Error::InsufficientReadQuorum {
            have: votes,
            need: winner.erasure.data_blocks,
        });
    }

    let has_meta = docs
        .iter()
        .map(|d| d.as_ref() == Some(&winner))
        .collect();
    Ok((winner, has_meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_disk::PosixDisk;
    use tempfile::TempDir;

    async fn disk_with_meta() -> (TempDir, Arc<PosixDisk>) {
        let dir = TempDir::new().unwrap();
        let disk = PosixDisk::new(dir.path()).await.unwrap();
        disk.make_volume(META_BUCKET).await.unwrap();
        disk.make_volume("bucket").await.unwrap();
        (dir, Arc::new(disk))
    }

    #[tokio::test]
    async fn test_json_round_trip_is_atomic_rename() {
        let (_dir, disk) = disk_with_meta().await;
        let mut meta = FsMeta::new();
        meta.meta.insert("etag".into(), "abc".into());

        write_json(&*disk, "bucket", "obj/fs.json", &meta).await.unwrap();
        let loaded: FsMeta = read_json(&*disk, "bucket", "obj/fs.json").await.unwrap();
        assert_eq!(loaded, meta);

        // No tmp residue is left behind.
        let entries = disk.list_dir(META_BUCKET, "tmp").await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_xl_meta_validate() {
        let mut meta = XlMeta::new(4, 2, 1024);
        assert!(meta.validate().is_ok());
        meta.erasure.checksums.pop();
        assert!(meta.validate().is_err());
    }

    fn sample_meta(size: u64) -> XlMeta {
        let mut meta = XlMeta::new(2, 2, 1024);
        meta.stat.size = size;
        meta.erasure.checksums = vec![Some("00".into()); 4];
        meta
    }

    #[tokio::test]
    async fn test_quorum_reconciles_majority() {
        let mut dirs = Vec::new();
        let mut disks: Vec<Option<Arc<dyn StorageDisk>>> = Vec::new();
        for _ in 0..4 {
            let (dir, disk) = disk_with_meta().await;
            dirs.push(dir);
            disks.push(Some(disk));
        }

        let good = sample_meta(100);
        let mut rogue = sample_meta(999);
        rogue.stat.mod_time = good.stat.mod_time + chrono::Duration::seconds(10);

        for (i, disk) in disks.iter().enumerate() {
            let disk = disk.as_ref().unwrap();
            let doc = if i == 3 { &rogue } else { &good };
            write_json(&**disk, "bucket", "obj/xl.json", doc).await.unwrap();
        }

        let (winner, has_meta) = read_xl_meta_quorum(&disks, "bucket", "obj").await.unwrap();
        // Majority wins even though the rogue copy is newer.
        assert_eq!(winner.stat.size, 100);
        assert_eq!(has_meta, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn test_quorum_missing_object() {
        let mut dirs = Vec::new();
        let mut disks: Vec<Option<Arc<dyn StorageDisk>>> = Vec::new();
        for _ in 0..4 {
            let (dir, disk) = disk_with_meta().await;
            dirs.push(dir);
            disks.push(Some(disk));
        }
        assert!(matches!(
            read_xl_meta_quorum(&disks, "bucket", "ghost").await,
            Err(Error::ObjectNotFound { .. })
        ));
    }
}
