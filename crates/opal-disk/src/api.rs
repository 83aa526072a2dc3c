//! The storage disk interface
//!
//! Everything above this trait consumes disks only through it, so local
//! disks, remote disks behind an RPC client, and injected faulty disks
//! are indistinguishable to the erasure engine and the object layer.
//! Every operation returns errors from the canonical set in
//! `opal_common::error`.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use opal_common::bitrot::BitrotVerifier;
use opal_common::error::Result;
use opal_common::types::{DiskInfo, FileInfo, VolumeInfo};

/// One disk: an identity plus a narrow set of filesystem capabilities
#[async_trait]
pub trait StorageDisk: Send + Sync {
    /// Stable identity (host plus path) for logs and stripe bookkeeping.
    fn id(&self) -> &str;

    fn is_local(&self) -> bool;

    /// Capacity numbers for the filesystem backing this disk.
    async fn disk_info(&self) -> Result<DiskInfo>;

    async fn make_volume(&self, volume: &str) -> Result<()>;

    async fn stat_volume(&self, volume: &str) -> Result<VolumeInfo>;

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Remove an empty volume. A non-empty volume is refused.
    async fn delete_volume(&self, volume: &str) -> Result<()>;

    /// List entries of a directory, directories suffixed with `/`.
    /// Order is unspecified.
    async fn list_dir(&self, volume: &str, dir: &str) -> Result<Vec<String>>;

    /// Atomic append, creating the file and missing parent directories.
    async fn append_file(&self, volume: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Stream exactly `size` bytes from `reader` into a fresh file.
    /// A reader that ends early is a short read.
    async fn create_file(
        &self,
        volume: &str,
        path: &str,
        size: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    /// Positional read into `buf`, returning the bytes filled.
    ///
    /// With a verifier present, the whole file is re-hashed and validated
    /// against the stored checksum before any byte is returned.
    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
        verifier: Option<&BitrotVerifier>,
    ) -> Result<u64>;

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo>;

    /// Atomic rename. Renaming across volumes of the same disk is
    /// allowed; crossing a mount point is a cross-device error.
    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()>;

    async fn delete_file(&self, volume: &str, path: &str) -> Result<()>;

    /// Recursively delete a directory tree.
    async fn delete_dir(&self, volume: &str, path: &str) -> Result<()>;
}
