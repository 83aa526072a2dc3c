//! Local disk over one filesystem root
//!
//! `PosixDisk` implements [`StorageDisk`] on a directory. OS errors are
//! classified into the canonical taxonomy at this boundary; nothing above
//! ever sees a raw `io::Error`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use opal_common::bitrot::BitrotVerifier;
use opal_common::error::{Error, Result};
use opal_common::types::{DiskInfo, FileInfo, VolumeInfo};

use crate::api::StorageDisk;

/// Buffer size for streamed copies.
const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Classify an OS error into the canonical set. The mapping is total and
/// deterministic: every errno lands on the same kind every time.
pub(crate) fn to_disk_error(e: io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::ENOSPC) | Some(libc::EDQUOT) => return Error::DiskFull,
        Some(libc::EXDEV) => return Error::CrossDevice,
        Some(libc::EISDIR) | Some(libc::ENOTDIR) => return Error::FileCorrupted,
        Some(libc::ENOTEMPTY) => return Error::VolumeNotEmpty,
        Some(libc::ENAMETOOLONG) => {
            return Error::InvalidArgument("path name too long".to_string())
        }
        Some(libc::EROFS) => return Error::DiskAccessDenied,
        Some(libc::EIO) => return Error::FileCorrupted,
        Some(libc::EMFILE) | Some(libc::ENFILE) => return Error::DiskUnreachable,
        _ => {}
    }
    match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound,
        io::ErrorKind::PermissionDenied => Error::DiskAccessDenied,
        io::ErrorKind::AlreadyExists => Error::FileAlreadyExists,
        io::ErrorKind::TimedOut => Error::OperationTimedOut {
            path: String::new(),
        },
        io::ErrorKind::UnexpectedEof => Error::ShortRead,
        _ => Error::Internal(format!("unclassified io error: {e}")),
    }
}

fn mod_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// A local disk rooted at one directory
pub struct PosixDisk {
    root: PathBuf,
    id: String,
}

impl PosixDisk {
    /// Open (creating if needed) a disk rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(to_disk_error)?;
        let root = root.canonicalize().map_err(to_disk_error)?;
        let id = root.display().to_string();
        Ok(Self { root, id })
    }

    /// Filesystem root backing this disk.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_volume_name(volume: &str) -> Result<()> {
        if volume.is_empty() || volume == "." || volume == ".." || volume.contains('/') {
            return Err(Error::invalid_argument(format!("invalid volume {volume:?}")));
        }
        Ok(())
    }

    fn check_path(path: &str) -> Result<()> {
        if path.contains('\0') || Path::new(path).components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir | std::path::Component::RootDir
            )
        }) {
            return Err(Error::invalid_argument(format!("invalid path {path:?}")));
        }
        Ok(())
    }

    fn volume_dir(&self, volume: &str) -> Result<PathBuf> {
        Self::check_volume_name(volume)?;
        Ok(self.root.join(volume))
    }

    fn resolve(&self, volume: &str, path: &str) -> Result<PathBuf> {
        let vol = self.volume_dir(volume)?;
        Self::check_path(path)?;
        Ok(vol.join(path))
    }

    /// Volume existence gates every file operation so that a missing
    /// volume and a missing file stay distinguishable.
    async fn require_volume(&self, volume: &str) -> Result<PathBuf> {
        let dir = self.volume_dir(volume)?;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(Error::FileCorrupted),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::VolumeNotFound),
            Err(e) => Err(to_disk_error(e)),
        }
    }

    /// Remove now-empty parent directories after a file delete, stopping
    /// at the volume root.
    async fn prune_empty_parents(&self, volume_dir: &Path, file_path: &Path) {
        let mut current = file_path.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            if dir == *volume_dir {
                break;
            }
            // remove_dir only succeeds on empty directories.
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }
    }

    async fn statvfs(path: PathBuf) -> Result<DiskInfo> {
        tokio::task::spawn_blocking(move || {
            let cpath = std::ffi::CString::new(path.display().to_string())
                .map_err(|_| Error::invalid_argument("path contains NUL"))?;
            let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
            if rc != 0 {
                return Err(to_disk_error(io::Error::last_os_error()));
            }
            let frsize = if stat.f_frsize > 0 {
                stat.f_frsize
            } else {
                stat.f_bsize
            } as u64;
            let total = stat.f_blocks as u64 * frsize;
            let free = stat.f_bavail as u64 * frsize;
            Ok(DiskInfo {
                total,
                free,
                used: total.saturating_sub(stat.f_bfree as u64 * frsize),
            })
        })
        .await
        .map_err(|e| Error::internal(format!("statvfs task: {e}")))?
    }
}

#[async_trait]
impl StorageDisk for PosixDisk {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn disk_info(&self) -> Result<DiskInfo> {
        Self::statvfs(self.root.clone()).await
    }

    async fn make_volume(&self, volume: &str) -> Result<()> {
        let dir = self.volume_dir(volume)?;
        match fs::create_dir(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::VolumeAlreadyExists),
            Err(e) => Err(to_disk_error(e)),
        }
    }

    async fn stat_volume(&self, volume: &str) -> Result<VolumeInfo> {
        let dir = self.require_volume(volume).await?;
        let meta = fs::metadata(&dir).await.map_err(to_disk_error)?;
        Ok(VolumeInfo {
            name: volume.to_string(),
            created: mod_time(&meta),
        })
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let mut volumes = Vec::new();
        let mut entries = fs::read_dir(&self.root).await.map_err(to_disk_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(to_disk_error)? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_dir() {
                continue;
            }
            volumes.push(VolumeInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                created: mod_time(&meta),
            });
        }
        Ok(volumes)
    }

    async fn delete_volume(&self, volume: &str) -> Result<()> {
        let dir = self.require_volume(volume).await?;
        fs::remove_dir(&dir).await.map_err(|e| match to_disk_error(e) {
            Error::FileNotFound => Error::VolumeNotFound,
            other => other,
        })
    }

    async fn list_dir(&self, volume: &str, dir: &str) -> Result<Vec<String>> {
        self.require_volume(volume).await?;
        let path = self.resolve(volume, dir)?;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&path).await.map_err(to_disk_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(to_disk_error)? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        Ok(names)
    }

    async fn append_file(&self, volume: &str, path: &str, data: &[u8]) -> Result<()> {
        self.require_volume(volume).await?;
        let full = self.resolve(volume, path)?;
        if let Ok(meta) = fs::metadata(&full).await {
            if !meta.is_file() {
                return Err(Error::FileCorrupted);
            }
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(to_disk_error)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await
            .map_err(to_disk_error)?;
        file.write_all(data).await.map_err(to_disk_error)?;
        Ok(())
    }

    async fn create_file(
        &self,
        volume: &str,
        path: &str,
        size: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        self.require_volume(volume).await?;
        let full = self.resolve(volume, path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(to_disk_error)?;
        }
        let mut file = fs::File::create(&full).await.map_err(to_disk_error)?;

        let mut limited = reader.take(size);
        let mut buf = vec![0u8; COPY_BUF_SIZE.min(size.max(1) as usize)];
        let mut written: u64 = 0;
        loop {
            let n = limited.read(&mut buf).await.map_err(to_disk_error)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(to_disk_error)?;
            written += n as u64;
        }
        file.flush().await.map_err(to_disk_error)?;

        if written < size {
            return Err(Error::ShortRead);
        }
        Ok(written)
    }

    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
        verifier: Option<&BitrotVerifier>,
    ) -> Result<u64> {
        self.require_volume(volume).await?;
        let full = self.resolve(volume, path)?;

        if let Some(verifier) = verifier {
            // Whole-file bitrot validation before a single byte escapes.
            let contents = fs::read(&full).await.map_err(to_disk_error)?;
            verifier.verify(&contents)?;
            let offset = offset as usize;
            if offset >= contents.len() {
                return Ok(0);
            }
            let n = buf.len().min(contents.len() - offset);
            buf[..n].copy_from_slice(&contents[offset..offset + n]);
            return Ok(n as u64);
        }

        let mut file = fs::File::open(&full).await.map_err(to_disk_error)?;
        file.seek(io::SeekFrom::Start(offset))
            .await
            .map_err(to_disk_error)?;
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await.map_err(to_disk_error)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled as u64)
    }

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo> {
        self.require_volume(volume).await?;
        let full = self.resolve(volume, path)?;
        let meta = fs::metadata(&full).await.map_err(to_disk_error)?;
        Ok(FileInfo {
            volume: volume.to_string(),
            name: path.to_string(),
            size: meta.len(),
            mod_time: mod_time(&meta),
            is_dir: meta.is_dir(),
        })
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()> {
        self.require_volume(src_volume).await?;
        self.require_volume(dst_volume).await?;
        let src = self.resolve(src_volume, src_path)?;
        let dst = self.resolve(dst_volume, dst_path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await.map_err(to_disk_error)?;
        }
        fs::rename(&src, &dst).await.map_err(|e| {
            match to_disk_error(e) {
                // A directory rename refused because the target has
                // contents surfaces as already-exists to the caller.
                Error::VolumeNotEmpty => Error::FileAlreadyExists,
                other => other,
            }
        })
    }

    async fn delete_file(&self, volume: &str, path: &str) -> Result<()> {
        let volume_dir = self.require_volume(volume).await?;
        let full = self.resolve(volume, path)?;
        fs::remove_file(&full).await.map_err(to_disk_error)?;
        self.prune_empty_parents(&volume_dir, &full).await;
        Ok(())
    }

    async fn delete_dir(&self, volume: &str, path: &str) -> Result<()> {
        let volume_dir = self.require_volume(volume).await?;
        let full = self.resolve(volume, path)?;
        match fs::remove_dir_all(&full).await {
            Ok(()) => {
                self.prune_empty_parents(&volume_dir, &full).await;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::FileNotFound),
            Err(e) => {
                warn!(disk = %self.id, path = %full.display(), "delete_dir failed: {e}");
                Err(to_disk_error(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_common::bitrot::BitrotAlgorithm;
    use std::io::Cursor;
    use tempfile::tempdir;

    async fn test_disk() -> (tempfile::TempDir, PosixDisk) {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path()).await.unwrap();
        (dir, disk)
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        assert!(matches!(
            disk.make_volume("vol").await,
            Err(Error::VolumeAlreadyExists)
        ));
        assert_eq!(disk.stat_volume("vol").await.unwrap().name, "vol");
        disk.delete_volume("vol").await.unwrap();
        assert!(matches!(
            disk.stat_volume("vol").await,
            Err(Error::VolumeNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_volume_refuses_non_empty() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        disk.append_file("vol", "a.txt", b"data").await.unwrap();
        assert!(matches!(
            disk.delete_volume("vol").await,
            Err(Error::VolumeNotEmpty)
        ));
    }

    #[tokio::test]
    async fn test_append_creates_directories() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        disk.append_file("vol", "a/b/c.bin", b"one").await.unwrap();
        disk.append_file("vol", "a/b/c.bin", b"two").await.unwrap();

        let mut buf = [0u8; 16];
        let n = disk.read_file("vol", "a/b/c.bin", 0, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..n as usize], b"onetwo");
    }

    #[tokio::test]
    async fn test_append_to_directory_is_corrupted() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        disk.append_file("vol", "dir/file", b"x").await.unwrap();
        assert!(matches!(
            disk.append_file("vol", "dir", b"x").await,
            Err(Error::FileCorrupted)
        ));
    }

    #[tokio::test]
    async fn test_create_file_exact_size() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();

        let mut reader = Cursor::new(b"hello world".to_vec());
        let n = disk.create_file("vol", "obj", 11, &mut reader).await.unwrap();
        assert_eq!(n, 11);

        // Short reader is refused.
        let mut short = Cursor::new(b"hi".to_vec());
        assert!(matches!(
            disk.create_file("vol", "obj2", 10, &mut short).await,
            Err(Error::ShortRead)
        ));
    }

    #[tokio::test]
    async fn test_read_with_verifier() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        disk.append_file("vol", "f", b"protected bytes").await.unwrap();

        let alg = BitrotAlgorithm::Xxh64;
        let ok = BitrotVerifier::new(alg, alg.checksum(b"protected bytes"));
        let mut buf = [0u8; 15];
        let n = disk.read_file("vol", "f", 0, &mut buf, Some(&ok)).await.unwrap();
        assert_eq!(&buf[..n as usize], b"protected bytes");

        let bad = BitrotVerifier::new(alg, alg.checksum(b"other bytes"));
        let mut buf = [0u8; 15];
        assert!(matches!(
            disk.read_file("vol", "f", 0, &mut buf, Some(&bad)).await,
            Err(Error::BitrotMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_within_disk() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("src").await.unwrap();
        disk.make_volume("dst").await.unwrap();
        disk.append_file("src", "f", b"payload").await.unwrap();

        disk.rename_file("src", "f", "dst", "nested/f").await.unwrap();
        assert!(matches!(
            disk.stat_file("src", "f").await,
            Err(Error::FileNotFound)
        ));
        assert_eq!(disk.stat_file("dst", "nested/f").await.unwrap().size, 7);
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_parents() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        disk.append_file("vol", "a/b/f", b"x").await.unwrap();
        disk.delete_file("vol", "a/b/f").await.unwrap();
        assert!(matches!(
            disk.stat_file("vol", "a").await,
            Err(Error::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_missing_volume_is_distinguished() {
        let (_dir, disk) = test_disk().await;
        let mut buf = [0u8; 4];
        assert!(matches!(
            disk.read_file("nope", "f", 0, &mut buf, None).await,
            Err(Error::VolumeNotFound)
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        assert!(disk.append_file("vol", "../escape", b"x").await.is_err());
        assert!(disk.make_volume("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_disk_info_reports_capacity() {
        let (_dir, disk) = test_disk().await;
        let info = disk.disk_info().await.unwrap();
        assert!(info.total > 0);
        assert!(info.free <= info.total);
    }

    #[tokio::test]
    async fn test_list_dir_marks_directories() {
        let (_dir, disk) = test_disk().await;
        disk.make_volume("vol").await.unwrap();
        disk.append_file("vol", "d/child", b"x").await.unwrap();
        disk.append_file("vol", "plain", b"x").await.unwrap();

        let mut entries = disk.list_dir("vol", "").await.unwrap();
        entries.sort();
        assert_eq!(entries, vec!["d/".to_string(), "plain".to_string()]);
    }
}
