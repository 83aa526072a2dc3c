//! On-disk format marker
//!
//! Every initialized disk carries a format document under the meta
//! bucket. Startup refuses to proceed over a disk whose format cannot be
//! read or names an incompatible version; re-initialization is an
//! explicit administrative action.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use opal_common::error::{Error, Result};
use opal_common::types::{BackendType, META_BUCKET};

use crate::api::StorageDisk;

/// Path of the format document below the meta bucket.
pub const FORMAT_FILE: &str = "format.json";

/// Current format version.
pub const FORMAT_VERSION: &str = "1";

/// The format document stored on every disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub version: String,
    pub backend: BackendType,
    /// Identity shared by every disk of one deployment.
    pub deployment_id: String,
    /// Identity of this particular disk.
    pub disk_id: String,
}

impl FormatInfo {
    #[must_use]
    pub fn new(backend: BackendType, deployment_id: &str) -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            backend,
            deployment_id: deployment_id.to_string(),
            disk_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Read the format marker, initializing a fresh disk on first use.
///
/// An unreadable or incompatible marker is fatal to startup: the caller
/// is expected to abort rather than guess at the disk contents.
pub async fn load_or_init_format(
    disk: &dyn StorageDisk,
    backend: BackendType,
    deployment_id: &str,
) -> Result<FormatInfo> {
    match read_format(disk).await {
        Ok(format) => {
            if format.version != FORMAT_VERSION {
                return Err(Error::Configuration(format!(
                    "disk {} carries incompatible format version {}",
                    disk.id(),
                    format.version
                )));
            }
            if format.backend != backend {
                return Err(Error::Configuration(format!(
                    "disk {} was formatted for a different backend",
                    disk.id()
                )));
            }
            Ok(format)
        }
        Err(e) if e.is_not_found() => {
            let format = FormatInfo::new(backend, deployment_id);
            write_format(disk, &format).await?;
            Ok(format)
        }
        Err(e) => Err(e),
    }
}

async fn read_format(disk: &dyn StorageDisk) -> Result<FormatInfo> {
    let info = disk.stat_file(META_BUCKET, FORMAT_FILE).await?;
    let mut buf = vec![0u8; info.size as usize];
    disk.read_file(META_BUCKET, FORMAT_FILE, 0, &mut buf, None)
        .await?;
    serde_json::from_slice(&buf)
        .map_err(|e| Error::Configuration(format!("corrupt format file on {}: {e}", disk.id())))
}

/// Persist the format document, via the tmp area and a rename.
pub async fn write_format(disk: &dyn StorageDisk, format: &FormatInfo) -> Result<()> {
    if let Err(e) = disk.make_volume(META_BUCKET).await {
        if !matches!(e, Error::VolumeAlreadyExists) {
            return Err(e);
        }
    }
    let raw = serde_json::to_vec_pretty(format).map_err(|e| Error::Serialization(e.to_string()))?;
    let tmp_name = format!("tmp/format-{}.json", Uuid::new_v4());
    let mut cursor = std::io::Cursor::new(raw.clone());
    disk.create_file(META_BUCKET, &tmp_name, raw.len() as u64, &mut cursor)
        .await?;
    disk.rename_file(META_BUCKET, &tmp_name, META_BUCKET, FORMAT_FILE)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix::PosixDisk;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_first_use_initializes() {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path()).await.unwrap();

        let format = load_or_init_format(&disk, BackendType::Erasure, "dep-1")
            .await
            .unwrap();
        assert_eq!(format.version, FORMAT_VERSION);
        assert_eq!(format.deployment_id, "dep-1");

        // Second load finds the same disk id.
        let again = load_or_init_format(&disk, BackendType::Erasure, "dep-1")
            .await
            .unwrap();
        assert_eq!(format.disk_id, again.disk_id);
    }

    #[tokio::test]
    async fn test_backend_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path()).await.unwrap();
        load_or_init_format(&disk, BackendType::Fs, "dep-1").await.unwrap();
        assert!(load_or_init_format(&disk, BackendType::Erasure, "dep-1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_incompatible_version_is_fatal() {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path()).await.unwrap();
        let mut format = FormatInfo::new(BackendType::Fs, "dep-1");
        format.version = "99".into();
        write_format(&disk, &format).await.unwrap();
        assert!(load_or_init_format(&disk, BackendType::Fs, "dep-1").await.is_err());
    }
}
