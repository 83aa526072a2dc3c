//! Striped storage over an erasure set
//!
//! `ErasureStorage` writes a stream across N+M disks so any N suffice to
//! read it back, detects silent corruption through whole-file bitrot
//! checksums, and rebuilds stale disks from the healthy remainder.
//! Stripe position is positional: chunk *i* of every block lives on disk
//! *i*, always.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use opal_common::bitrot::{BitrotAlgorithm, BitrotHasher, BitrotVerifier};
use opal_common::bpool::BytePool;
use opal_common::error::{Error, Result};
use opal_disk::StorageDisk;

use crate::codec::{chunk_size, ErasureCodec};

/// Fixed deadline for one per-disk operation. A disk that cannot answer
/// in this window is treated as failed for the operation; quorum decides
/// whether the operation itself survives.
const DISK_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a write or heal: per-disk checksums for the file
#[derive(Clone, Debug)]
pub struct ErasureFileInfo {
    pub size: u64,
    pub algorithm: BitrotAlgorithm,
    /// Exactly N+M entries; `None` for disks that are missing or failed.
    pub checksums: Vec<Option<Vec<u8>>>,
}

/// Outcome of a read
#[derive(Clone, Debug, Default)]
pub struct ErasureReadInfo {
    pub bytes_written: u64,
    /// Disks that returned corrupted or wrong-length data and should be
    /// healed.
    pub stale_disks: Vec<usize>,
}

/// One erasure set: N+M disks plus the codec striping across them
pub struct ErasureStorage {
    disks: Vec<Option<Arc<dyn StorageDisk>>>,
    codec: ErasureCodec,
    block_size: u64,
    bpool: Arc<BytePool>,
}

impl ErasureStorage {
    /// Build a set over `disks`, of which the first N carry data chunks.
    /// The disk vector length must equal N+M; missing disks are `None`
    /// slots so stripe positions stay aligned.
    pub fn new(
        disks: Vec<Option<Arc<dyn StorageDisk>>>,
        data_blocks: usize,
        parity_blocks: usize,
        block_size: u64,
        bpool: Arc<BytePool>,
    ) -> Result<Self> {
        if disks.len() != data_blocks + parity_blocks {
            return Err(Error::ErasureCoding(format!(
                "disk count {} does not match {}+{} erasure config",
                disks.len(),
                data_blocks,
                parity_blocks
            )));
        }
        if block_size == 0 {
            return Err(Error::ErasureCoding("block size must be > 0".into()));
        }
        if bpool.buf_size() != block_size as usize {
            return Err(Error::ErasureCoding(
                "buffer pool size must match the block size".into(),
            ));
        }
        let codec = ErasureCodec::new(data_blocks, parity_blocks)?;
        Ok(Self {
            disks,
            codec,
            block_size,
            bpool,
        })
    }

    #[must_use]
    pub fn data_blocks(&self) -> usize {
        self.codec.data_blocks()
    }

    #[must_use]
    pub fn parity_blocks(&self) -> usize {
        self.codec.parity_blocks()
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Disks that must accept every block for a write to stand:
    /// N plus half the parity, rounded up.
    #[must_use]
    pub fn write_quorum(&self) -> usize {
        self.data_blocks() + self.parity_blocks().div_ceil(2)
    }

    /// Valid chunks required to reconstruct: exactly N.
    #[must_use]
    pub fn read_quorum(&self) -> usize {
        self.data_blocks()
    }

    #[must_use]
    pub fn disks(&self) -> &[Option<Arc<dyn StorageDisk>>] {
        &self.disks
    }

    /// Length of the per-disk chunk file for an object of `size` bytes.
    #[must_use]
    pub fn shard_file_size(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let chunk = chunk_size(self.block_size, self.data_blocks()) as u64;
        let full_blocks = size / self.block_size;
        let residual = size % self.block_size;
        let mut len = full_blocks * chunk;
        if residual > 0 {
            len += chunk_size(residual, self.data_blocks()) as u64;
        }
        len
    }

    fn online_count(&self, errs: &[Option<Error>]) -> usize {
        self.disks
            .iter()
            .zip(errs)
            .filter(|(d, e)| d.is_some() && e.is_none())
            .count()
    }

    /// Stream `reader` into per-disk chunk files at `volume/path`.
    ///
    /// The input is consumed in `block_size` units; each block is encoded
    /// into N+M chunks which are appended to their disks in parallel.
    /// All appends for block *k* finish before block *k+1* starts. The
    /// write stands only while at least `write_quorum()` disks have
    /// accepted every block.
    pub async fn create_file(
        &self,
        volume: &str,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        algorithm: BitrotAlgorithm,
    ) -> Result<ErasureFileInfo> {
        let n = self.disks.len();
        let mut hashers: Vec<BitrotHasher> = (0..n).map(|_| algorithm.hasher()).collect();
        let mut disk_errs: Vec<Option<Error>> = Vec::new();
        for _ in 0..n {
            disk_errs.push(None);
        }

        // Missing disks fail the write quorum up front when too many.
        if self.online_count(&disk_errs) < self.write_quorum() {
            return Err(Error::InsufficientWriteQuorum {
                have: self.online_count(&disk_errs),
                need: self.write_quorum(),
            });
        }

        let mut buf = self.bpool.get();
        let mut total: u64 = 0;
        loop {
            let read = read_block(reader, &mut buf).await?;
            if read == 0 {
                break;
            }
            total += read as u64;

            let shards = self.codec.encode_block(&buf[..read])?;

            // Parallel per-disk appends, checkpointed per block.
            let mut writes = Vec::new();
            for (i, disk) in self.disks.iter().enumerate() {
                let Some(disk) = disk else { continue };
                if disk_errs[i].is_some() {
                    continue;
                }
                let disk = disk.clone();
                let shard: &[u8] = &shards[i];
                writes.push(async move {
                    let result =
                        tokio::time::timeout(DISK_OP_TIMEOUT, disk.append_file(volume, path, shard))
                            .await
                            .unwrap_or_else(|_| {
                                Err(Error::OperationTimedOut {
                                    path: path.to_string(),
                                })
                            });
                    (i, result)
                });
            }
            for (i, result) in join_all(writes).await {
                match result {
                    Ok(()) => hashers[i].update(&shards[i]),
                    Err(e) => {
                        warn!(disk = i, volume, path, "append failed: {e}");
                        disk_errs[i] = Some(e);
                    }
                }
            }

            let online = self.online_count(&disk_errs);
            if online < self.write_quorum() {
                self.bpool.put(buf);
                return Err(Error::InsufficientWriteQuorum {
                    have: online,
                    need: self.write_quorum(),
                });
            }

            if read < buf.len() {
                break;
            }
        }
        self.bpool.put(buf);

        let checksums = self
            .disks
            .iter()
            .zip(hashers)
            .zip(&disk_errs)
            .map(|((disk, hasher), err)| {
                if disk.is_some() && err.is_none() {
                    Some(hasher.finalize())
                } else {
                    None
                }
            })
            .collect();

        Ok(ErasureFileInfo {
            size: total,
            algorithm,
            checksums,
        })
    }

    /// Read the whole per-disk file from every candidate disk, verifying
    /// bitrot. Returns per-disk buffers (`None` where unusable) and the
    /// indices that should be healed.
    async fn read_shards(
        &self,
        volume: &str,
        path: &str,
        shard_len: u64,
        algorithm: BitrotAlgorithm,
        checksums: &[Option<Vec<u8>>],
        exclude: Option<&[bool]>,
    ) -> (Vec<Option<Vec<u8>>>, Vec<usize>) {
        let reads = self.disks.iter().enumerate().map(|(i, disk)| {
            let disk = disk.clone();
            let checksum = checksums.get(i).cloned().flatten();
            let excluded = exclude.is_some_and(|m| m.get(i).copied().unwrap_or(false));
            async move {
                let (Some(disk), Some(checksum)) = (disk, checksum) else {
                    return (i, None, false);
                };
                if excluded {
                    return (i, None, false);
                }
                let verifier = BitrotVerifier::new(algorithm, checksum);
                let mut buf = vec![0u8; shard_len as usize];
                let read = tokio::time::timeout(
                    DISK_OP_TIMEOUT,
                    disk.read_file(volume, path, 0, &mut buf, Some(&verifier)),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(Error::OperationTimedOut {
                        path: path.to_string(),
                    })
                });
                match read {
                    Ok(n) if n == shard_len => (i, Some(buf), false),
                    Ok(n) => {
                        warn!(disk = i, volume, path, "short chunk file: {n} of {shard_len}");
                        (i, None, true)
                    }
                    Err(e) => {
                        warn!(disk = i, volume, path, "chunk read failed: {e}");
                        (i, None, true)
                    }
                }
            }
        });

        let mut buffers: Vec<Option<Vec<u8>>> = vec![None; self.disks.len()];
        let mut stale = Vec::new();
        for (i, buf, is_stale) in join_all(reads).await {
            buffers[i] = buf;
            if is_stale {
                stale.push(i);
            }
        }
        (buffers, stale)
    }

    /// Stream `length` bytes starting at `offset` of the file at
    /// `volume/path` into `writer`.
    ///
    /// Whole-file bitrot validation forces a full read of each per-disk
    /// file regardless of the window. Chunks are requested from every
    /// disk in parallel; when the data disks all answer the stripe is
    /// joined directly, otherwise missing chunks are reconstructed from
    /// parity.
    pub async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        length: u64,
        total_size: u64,
        algorithm: BitrotAlgorithm,
        checksums: &[Option<Vec<u8>>],
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ErasureReadInfo> {
        if offset.checked_add(length).is_none() || offset + length > total_size {
            return Err(Error::invalid_argument(format!(
                "read window {offset}+{length} exceeds object size {total_size}"
            )));
        }
        if length == 0 || total_size == 0 {
            return Ok(ErasureReadInfo::default());
        }

        let shard_len = self.shard_file_size(total_size);
        let (buffers, stale) = self
            .read_shards(volume, path, shard_len, algorithm, checksums, None)
            .await;

        let valid = buffers.iter().filter(|b| b.is_some()).count();
        if valid < self.read_quorum() {
            return Err(Error::InsufficientReadQuorum {
                have: valid,
                need: self.read_quorum(),
            });
        }

        let data = self.data_blocks();
        let chunk = chunk_size(self.block_size, data);
        let num_blocks = total_size.div_ceil(self.block_size);

        let mut written: u64 = 0;
        let mut shard_off = 0usize;
        for block in 0..num_blocks {
            let block_start = block * self.block_size;
            let block_len = (total_size - block_start).min(self.block_size);
            let csize = if block == num_blocks - 1 {
                chunk_size(block_len, data)
            } else {
                chunk
            };

            let window_start = offset.max(block_start);
            let window_end = (offset + length).min(block_start + block_len);
            if window_start < window_end {
                let mut shards: Vec<Option<Vec<u8>>> = buffers
                    .iter()
                    .map(|b| b.as_ref().map(|buf| buf[shard_off..shard_off + csize].to_vec()))
                    .collect();

                let have_all_data = shards.iter().take(data).all(Option::is_some);
                if !have_all_data {
                    debug!(volume, path, block, "reconstructing stripe from parity");
                    self.codec.reconstruct_data(&mut shards)?;
                }
                let block_bytes = self.codec.join_data(&shards, block_len as usize);

                let from = (window_start - block_start) as usize;
                let to = (window_end - block_start) as usize;
                writer
                    .write_all(&block_bytes[from..to])
                    .await
                    .map_err(|e| Error::internal(format!("write to caller: {e}")))?;
                written += (to - from) as u64;
            }
            shard_off += csize;
        }
        writer
            .flush()
            .await
            .map_err(|e| Error::internal(format!("flush to caller: {e}")))?;

        Ok(ErasureReadInfo {
            bytes_written: written,
            stale_disks: stale,
        })
    }

    /// Rebuild the per-disk files of `stale_disks` at `dst_volume/dst_path`.
    ///
    /// `stale_disks[i]` marks disk *i* for rewrite; the complementary
    /// subset must still meet the read quorum. Write errors on a stale
    /// disk are tolerated as long as at least one stale disk keeps
    /// accepting; fully failed disks are reported through the returned
    /// checksum slots staying `None`.
    pub async fn heal_file(
        &self,
        stale_disks: &[bool],
        volume: &str,
        path: &str,
        total_size: u64,
        algorithm: BitrotAlgorithm,
        checksums: &[Option<Vec<u8>>],
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<ErasureFileInfo> {
        if stale_disks.len() != self.disks.len() {
            return Err(Error::invalid_argument(
                "stale disk mask does not match the erasure set".to_string(),
            ));
        }
        if !stale_disks.iter().any(|&s| s) {
            return Err(Error::invalid_argument("no disks to heal".to_string()));
        }

        let mut hashers: Vec<Option<BitrotHasher>> = self
            .disks
            .iter()
            .enumerate()
            .map(|(i, disk)| {
                (stale_disks[i] && disk.is_some()).then(|| algorithm.hasher())
            })
            .collect();
        let mut write_errs: Vec<Option<Error>> = Vec::new();
        for _ in 0..self.disks.len() {
            write_errs.push(None);
        }

        let shard_len = self.shard_file_size(total_size);
        let (buffers, _) = self
            .read_shards(
                volume,
                path,
                shard_len,
                algorithm,
                checksums,
                Some(stale_disks),
            )
            .await;
        let valid = buffers.iter().filter(|b| b.is_some()).count();
        if valid < self.read_quorum() {
            return Err(Error::InsufficientReadQuorum {
                have: valid,
                need: self.read_quorum(),
            });
        }

        let data = self.data_blocks();
        let chunk = chunk_size(self.block_size, data);
        let num_blocks = total_size.div_ceil(self.block_size);

        let mut shard_off = 0usize;
        for block in 0..num_blocks {
            let block_start = block * self.block_size;
            let block_len = (total_size - block_start).min(self.block_size);
            let csize = if block == num_blocks - 1 {
                chunk_size(block_len, data)
            } else {
                chunk
            };

            let mut shards: Vec<Option<Vec<u8>>> = buffers
                .iter()
                .map(|b| b.as_ref().map(|buf| buf[shard_off..shard_off + csize].to_vec()))
                .collect();
            self.codec.reconstruct(&mut shards)?;

            let mut write_succeeded = false;
            for (i, disk) in self.disks.iter().enumerate() {
                if !stale_disks[i] || write_errs[i].is_some() {
                    continue;
                }
                let Some(disk) = disk else { continue };
                let Some(shard) = &shards[i] else { continue };
                match disk.append_file(dst_volume, dst_path, shard).await {
                    Ok(()) => {
                        if let Some(h) = hashers[i].as_mut() {
                            h.update(shard);
                        }
                        write_succeeded = true;
                    }
                    Err(e) => {
                        warn!(disk = i, "heal write failed: {e}");
                        write_errs[i] = Some(e);
                    }
                }
            }
            if !write_succeeded {
                return Err(Error::internal(
                    "all stale disks had write errors during healing".to_string(),
                ));
            }
            shard_off += csize;
        }

        let checksums = hashers
            .into_iter()
            .zip(&write_errs)
            .map(|(hasher, err)| match (hasher, err) {
                (Some(h), None) => Some(h.finalize()),
                _ => None,
            })
            .collect();

        Ok(ErasureFileInfo {
            size: total_size,
            algorithm,
            checksums,
        })
    }
}

/// Fill `buf` from `reader`, stopping at EOF; returns bytes filled.
async fn read_block(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::internal(format!("read input: {e}")))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_disk::PosixDisk;
    use rand::RngCore;
    use std::io::Cursor;
    use tempfile::TempDir;

    const VOLUME: &str = "vol";

    async fn erasure_set(
        data: usize,
        parity: usize,
        block_size: u64,
    ) -> (Vec<TempDir>, ErasureStorage) {
        let mut dirs = Vec::new();
        let mut disks: Vec<Option<Arc<dyn StorageDisk>>> = Vec::new();
        for _ in 0..data + parity {
            let dir = TempDir::new().unwrap();
            let disk = PosixDisk::new(dir.path()).await.unwrap();
            disk.make_volume(VOLUME).await.unwrap();
            dirs.push(dir);
            disks.push(Some(Arc::new(disk)));
        }
        let pool = Arc::new(BytePool::new(block_size as usize, 4));
        let storage = ErasureStorage::new(disks, data, parity, block_size, pool).unwrap();
        (dirs, storage)
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    async fn write_read_cycle(storage: &ErasureStorage, payload: &[u8]) -> ErasureFileInfo {
        let mut reader = Cursor::new(payload.to_vec());
        let info = storage
            .create_file(VOLUME, "obj", &mut reader, BitrotAlgorithm::Xxh64)
            .await
            .unwrap();
        assert_eq!(info.size, payload.len() as u64);

        let mut out = Vec::new();
        let read = storage
            .read_file(
                VOLUME,
                "obj",
                0,
                info.size,
                info.size,
                info.algorithm,
                &info.checksums,
                &mut out,
            )
            .await
            .unwrap();
        assert_eq!(read.bytes_written, payload.len() as u64);
        assert_eq!(out, payload);
        info
    }

    #[tokio::test]
    async fn test_round_trip_multi_block() {
        let (_dirs, storage) = erasure_set(4, 2, 1024).await;
        let payload = random_bytes(10_000);
        write_read_cycle(&storage, &payload).await;
    }

    #[tokio::test]
    async fn test_block_size_boundaries() {
        let (_dirs, storage) = erasure_set(4, 2, 1024).await;
        for len in [1023usize, 1024, 1025] {
            let payload = random_bytes(len);
            let mut reader = Cursor::new(payload.clone());
            let name = format!("obj-{len}");
            let info = storage
                .create_file(VOLUME, &name, &mut reader, BitrotAlgorithm::Xxh64)
                .await
                .unwrap();
            let mut out = Vec::new();
            storage
                .read_file(VOLUME, &name, 0, info.size, info.size, info.algorithm, &info.checksums, &mut out)
                .await
                .unwrap();
            assert_eq!(out, payload, "len {len}");
        }
    }

    #[tokio::test]
    async fn test_empty_object_has_checksums() {
        let (_dirs, storage) = erasure_set(4, 2, 1024).await;
        let mut reader = Cursor::new(Vec::new());
        let info = storage
            .create_file(VOLUME, "empty", &mut reader, BitrotAlgorithm::Xxh64)
            .await
            .unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.checksums.len(), 6);
        assert!(info.checksums.iter().all(Option::is_some));

        let mut out = Vec::new();
        let read = storage
            .read_file(VOLUME, "empty", 0, 0, 0, info.algorithm, &info.checksums, &mut out)
            .await
            .unwrap();
        assert_eq!(read.bytes_written, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_ranged_read() {
        let (_dirs, storage) = erasure_set(4, 2, 1024).await;
        let payload = random_bytes(5000);
        let info = write_read_cycle(&storage, &payload).await;

        let mut out = Vec::new();
        storage
            .read_file(VOLUME, "obj", 900, 2500, info.size, info.algorithm, &info.checksums, &mut out)
            .await
            .unwrap();
        assert_eq!(out, &payload[900..3400]);

        // Window past the end is refused.
        let mut out = Vec::new();
        assert!(storage
            .read_file(VOLUME, "obj", 4000, 2000, info.size, info.algorithm, &info.checksums, &mut out)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_read_survives_parity_many_corruptions() {
        let (dirs, storage) = erasure_set(4, 2, 1024).await;
        let payload = random_bytes(8192);
        let info = write_read_cycle(&storage, &payload).await;

        // Zero two chunk files: exactly the parity count.
        for i in [1usize, 4] {
            let chunk_path = dirs[i].path().join(VOLUME).join("obj");
            let len = std::fs::metadata(&chunk_path).unwrap().len();
            std::fs::write(&chunk_path, vec![0u8; len as usize]).unwrap();
        }

        let mut out = Vec::new();
        let read = storage
            .read_file(VOLUME, "obj", 0, info.size, info.size, info.algorithm, &info.checksums, &mut out)
            .await
            .unwrap();
        assert_eq!(out, payload);
        let mut stale = read.stale_disks.clone();
        stale.sort_unstable();
        assert_eq!(stale, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_read_fails_below_quorum() {
        let (dirs, storage) = erasure_set(4, 2, 1024).await;
        let payload = random_bytes(4096);
        let info = write_read_cycle(&storage, &payload).await;

        for i in [0usize, 2, 5] {
            let chunk_path = dirs[i].path().join(VOLUME).join("obj");
            std::fs::write(&chunk_path, b"garbage").unwrap();
        }

        let mut out = Vec::new();
        assert!(matches!(
            storage
                .read_file(VOLUME, "obj", 0, info.size, info.size, info.algorithm, &info.checksums, &mut out)
                .await,
            Err(Error::InsufficientReadQuorum { have: 3, need: 4 })
        ));
    }

    #[tokio::test]
    async fn test_write_quorum_loss() {
        // 4+2 with three disks gone: 3 < 4 + ceil(2/2) = 5.
        let (_dirs, base) = erasure_set(4, 2, 1024).await;
        let mut disks = base.disks().to_vec();
        disks[0] = None;
        disks[3] = None;
        disks[5] = None;
        let pool = Arc::new(BytePool::new(1024, 4));
        let storage = ErasureStorage::new(disks, 4, 2, 1024, pool).unwrap();

        let mut reader = Cursor::new(random_bytes(2048));
        assert!(matches!(
            storage
                .create_file(VOLUME, "obj", &mut reader, BitrotAlgorithm::Xxh64)
                .await,
            Err(Error::InsufficientWriteQuorum { have: 3, need: 5 })
        ));
    }

    #[tokio::test]
    async fn test_heal_restores_zeroed_disks() {
        let (dirs, storage) = erasure_set(4, 2, 1024).await;
        let payload = random_bytes(1024 * 1024);
        let info = write_read_cycle(&storage, &payload).await;

        // Zero disks 2 and 5 (stripe positions 1 and 4).
        let mut stale = vec![false; 6];
        for i in [1usize, 4] {
            let chunk_path = dirs[i].path().join(VOLUME).join("obj");
            let len = std::fs::metadata(&chunk_path).unwrap().len();
            std::fs::write(&chunk_path, vec![0u8; len as usize]).unwrap();
            stale[i] = true;
        }

        // Reads still serve the original bytes.
        let mut out = Vec::new();
        storage
            .read_file(VOLUME, "obj", 0, info.size, info.size, info.algorithm, &info.checksums, &mut out)
            .await
            .unwrap();
        assert_eq!(out, payload);

        let healed = storage
            .heal_file(
                &stale,
                VOLUME,
                "obj",
                info.size,
                info.algorithm,
                &info.checksums,
                VOLUME,
                "obj.heal",
            )
            .await
            .unwrap();

        // Fresh checksums for healed disks match what the write recorded:
        // reconstruction returned the original chunks.
        for i in 0..6 {
            if stale[i] {
                assert_eq!(healed.checksums[i], info.checksums[i], "disk {i}");
                // Move the healed file into place and spot-check contents.
                let healed_path = dirs[i].path().join(VOLUME).join("obj.heal");
                let orig_path = dirs[i].path().join(VOLUME).join("obj");
                std::fs::rename(&healed_path, &orig_path).unwrap();
            } else {
                assert!(healed.checksums[i].is_none());
            }
        }

        let mut out = Vec::new();
        let read = storage
            .read_file(VOLUME, "obj", 0, info.size, info.size, info.algorithm, &info.checksums, &mut out)
            .await
            .unwrap();
        assert_eq!(out, payload);
        assert!(read.stale_disks.is_empty());
    }

    #[tokio::test]
    async fn test_heal_needs_read_quorum() {
        let (_dirs, storage) = erasure_set(4, 2, 1024).await;
        let payload = random_bytes(2048);
        let info = write_read_cycle(&storage, &payload).await;

        // Marking three disks stale leaves only three healthy: below N.
        let stale = vec![true, true, true, false, false, false];
        assert!(matches!(
            storage
                .heal_file(&stale, VOLUME, "obj", info.size, info.algorithm, &info.checksums, VOLUME, "obj.heal")
                .await,
            Err(Error::InsufficientReadQuorum { .. })
        ));
    }

    #[tokio::test]
    async fn test_heal_tolerates_partial_write_failure() {
        let (dirs, storage) = erasure_set(4, 2, 1024).await;
        let payload = random_bytes(4096);
        let info = write_read_cycle(&storage, &payload).await;

        // Two stale disks, one of which cannot accept writes because its
        // destination volume is missing.
        let stale = vec![false, true, false, false, true, false];
        std::fs::remove_dir_all(dirs[4].path().join(VOLUME)).unwrap();

        let healed = storage
            .heal_file(
                &stale,
                VOLUME,
                "obj",
                info.size,
                info.algorithm,
                &info.checksums,
                VOLUME,
                "obj.heal",
            )
            .await
            .unwrap();
        assert!(healed.checksums[1].is_some());
        assert!(healed.checksums[4].is_none());
    }
}
