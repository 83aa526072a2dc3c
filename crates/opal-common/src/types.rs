//! Core type definitions for Opal
//!
//! Fundamental types used throughout the system: S3 name validation,
//! object/part/upload descriptors, disk and storage information.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Bucket that carries all Opal internal state on a disk.
pub const META_BUCKET: &str = ".opal.sys";
/// Multipart working area, below [`META_BUCKET`].
pub const MULTIPART_META_PREFIX: &str = "multipart";
/// Scratch area used as the atomic-rename source, below [`META_BUCKET`].
pub const TMP_META_PREFIX: &str = "tmp";
/// Per-object metadata area for the FS backend, below [`META_BUCKET`].
pub const BUCKET_META_PREFIX: &str = "buckets";

/// Smallest allowed part size for any part but the last (S3 rule).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Largest allowed part size.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Largest allowed part number.
pub const MAX_PARTS: u32 = 10_000;
/// Largest allowed object size (5 TiB).
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 * 1024;
/// Unit at which a stream is erasure-coded.
pub const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024 * 1024;

/// Validate a bucket name according to S3 rules.
pub fn check_bucket_name(bucket: &str) -> Result<()> {
    let invalid = || Error::InvalidBucketName {
        bucket: bucket.to_string(),
    };

    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(invalid());
    }
    let first = bucket.chars().next().unwrap();
    let last = bucket.chars().last().unwrap();
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return Err(invalid());
    }
    if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
        return Err(invalid());
    }
    for c in bucket.chars() {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.' {
            return Err(invalid());
        }
    }
    if bucket.contains("..") {
        return Err(invalid());
    }
    // Cannot be formatted as an IP address.
    if bucket.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(invalid());
    }
    Ok(())
}

/// Validate an object key: 1..=1024 bytes, no path traversal, no NUL.
pub fn check_object_key(object: &str) -> Result<()> {
    let invalid = || Error::InvalidObjectKey {
        object: object.to_string(),
    };

    if object.is_empty() || object.len() > 1024 {
        return Err(invalid());
    }
    if object.contains('\0') || object.starts_with('/') {
        return Err(invalid());
    }
    for component in object.split('/') {
        if component == ".." {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Information about a bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Information about an object, as served to the API edge
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub mod_time: Option<DateTime<Utc>>,
    pub size: u64,
    pub is_dir: bool,
    pub etag: String,
    pub content_type: Option<String>,
    /// User-defined metadata, preserved verbatim.
    pub user_defined: HashMap<String, String>,
}

/// Information about a single uploaded part
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: String,
    pub size: u64,
}

/// Part identity as claimed by a CompleteMultipartUpload caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}

/// One in-progress multipart upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUploadInfo {
    pub object: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// Result of a ListObjectParts call
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListPartsInfo {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub part_number_marker: u32,
    pub next_part_number_marker: u32,
    pub max_parts: usize,
    pub is_truncated: bool,
    pub parts: Vec<PartInfo>,
}

/// Result of a ListMultipartUploads call
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListMultipartsInfo {
    pub key_marker: String,
    pub upload_id_marker: String,
    pub next_key_marker: String,
    pub next_upload_id_marker: String,
    pub max_uploads: usize,
    pub is_truncated: bool,
    pub uploads: Vec<MultipartUploadInfo>,
    pub prefix: String,
    pub delimiter: String,
}

/// Result of a ListObjects call
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListObjectsInfo {
    pub is_truncated: bool,
    pub next_marker: String,
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
}

/// Result of a ListObjectsV2 call
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListObjectsV2Info {
    pub is_truncated: bool,
    pub continuation_token: String,
    pub next_continuation_token: String,
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
}

/// Stat information for one file or directory on a disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub volume: String,
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
}

/// Stat information for one volume on a disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Capacity numbers for one disk, in bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// Backend flavor the server is running
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    #[default]
    Fs,
    Erasure,
}

/// Aggregate storage statistics across the deployment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    pub used: u64,
    pub backend: BackendInfo,
}

/// Backend detail inside [`StorageInfo`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackendInfo {
    pub backend_type: BackendType,
    pub online_disks: usize,
    pub offline_disks: usize,
    /// Parity drives for the STANDARD storage class.
    pub standard_sc_parity: usize,
    /// Parity drives for the REDUCED_REDUNDANCY storage class.
    pub rrs_sc_parity: usize,
}

/// Signal carried by the admin SignalService operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceSignal {
    Restart,
    Stop,
}

/// Metadata key selecting the storage class of an object.
pub const AMZ_STORAGE_CLASS: &str = "x-amz-storage-class";

/// Storage classes understood by the erasure backend
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, derive_more::Display,
)]
pub enum StorageClass {
    #[default]
    #[display("STANDARD")]
    Standard,
    #[display("REDUCED_REDUNDANCY")]
    ReducedRedundancy,
}

impl StorageClass {
    /// Parse the S3 header value; unknown values fall back to STANDARD.
    #[must_use]
    pub fn from_metadata(meta: &HashMap<String, String>) -> Self {
        match meta.get(AMZ_STORAGE_CLASS).map(String::as_str) {
            Some("REDUCED_REDUNDANCY") => Self::ReducedRedundancy,
            _ => Self::Standard,
        }
    }
}

/// Split a disk count into data/parity drives for a storage class.
///
/// The standard class keeps the half/half default; reduced redundancy
/// trades parity for capacity. Parity is clamped so that both sides keep
/// at least one drive.
#[must_use]
pub fn redundancy_count(class: StorageClass, drive_count: usize) -> (usize, usize) {
    let mut parity = match class {
        StorageClass::Standard => drive_count / 2,
        StorageClass::ReducedRedundancy => drive_count / 4,
    };
    if parity == 0 {
        parity = 1;
    }
    if parity >= drive_count {
        parity = drive_count - 1;
    }
    (drive_count - parity, parity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_valid() {
        assert!(check_bucket_name("my-bucket").is_ok());
        assert!(check_bucket_name("bucket123").is_ok());
        assert!(check_bucket_name("a.b.c").is_ok());
    }

    #[test]
    fn test_bucket_name_invalid() {
        assert!(check_bucket_name("ab").is_err()); // too short
        assert!(check_bucket_name("-bucket").is_err()); // invalid start
        assert!(check_bucket_name("bucket-").is_err()); // invalid end
        assert!(check_bucket_name("Bucket").is_err()); // uppercase
        assert!(check_bucket_name("bucket..name").is_err()); // consecutive periods
        assert!(check_bucket_name("192.168.1.1").is_err()); // IP address
    }

    #[test]
    fn test_object_key() {
        assert!(check_object_key("a/b/c.txt").is_ok());
        assert!(check_object_key("").is_err());
        assert!(check_object_key("/leading").is_err());
        assert!(check_object_key("a/../b").is_err());
        assert!(check_object_key(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn test_redundancy_count() {
        assert_eq!(redundancy_count(StorageClass::Standard, 4), (2, 2));
        assert_eq!(redundancy_count(StorageClass::Standard, 6), (3, 3));
        assert_eq!(redundancy_count(StorageClass::ReducedRedundancy, 8), (6, 2));
        // Parity never collapses to zero.
        assert_eq!(redundancy_count(StorageClass::ReducedRedundancy, 2), (1, 1));
    }
}
