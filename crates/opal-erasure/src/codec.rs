//! Reed-Solomon codec over GF(2^8)
//!
//! Wraps `reed-solomon-erasure` with the block/chunk arithmetic the
//! storage engine needs: a block is split into N equal chunks of
//! `ceil(len / N)` bytes (the last one padded), and M parity chunks are
//! computed so that any N of the N+M survive.

use reed_solomon_erasure::galois_8::ReedSolomon;

use opal_common::error::{Error, Result};

/// Chunk size for a block of `len` bytes split across `data` disks.
#[must_use]
pub fn chunk_size(len: u64, data: usize) -> usize {
    (len as usize).div_ceil(data)
}

/// N+M Reed-Solomon codec
pub struct ErasureCodec {
    rs: ReedSolomon,
    data: usize,
    parity: usize,
}

impl ErasureCodec {
    pub fn new(data: usize, parity: usize) -> Result<Self> {
        if data == 0 {
            return Err(Error::ErasureCoding("data blocks must be > 0".into()));
        }
        if parity == 0 {
            return Err(Error::ErasureCoding("parity blocks must be > 0".into()));
        }
        if data + parity > 256 {
            return Err(Error::ErasureCoding("total blocks must be <= 256".into()));
        }
        let rs = ReedSolomon::new(data, parity)
            .map_err(|e| Error::ErasureCoding(format!("codec init: {e}")))?;
        Ok(Self { rs, data, parity })
    }

    #[must_use]
    pub fn data_blocks(&self) -> usize {
        self.data
    }

    #[must_use]
    pub fn parity_blocks(&self) -> usize {
        self.parity
    }

    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.data + self.parity
    }

    /// Encode one block into N data chunks plus M parity chunks, all of
    /// `chunk_size(block.len(), N)` bytes.
    pub fn encode_block(&self, block: &[u8]) -> Result<Vec<Vec<u8>>> {
        if block.is_empty() {
            return Err(Error::ErasureCoding("cannot encode an empty block".into()));
        }
        let chunk = chunk_size(block.len() as u64, self.data);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total_blocks());
        for i in 0..self.data {
            let start = (i * chunk).min(block.len());
            let end = ((i + 1) * chunk).min(block.len());
            let mut shard = block[start..end].to_vec();
            shard.resize(chunk, 0);
            shards.push(shard);
        }
        for _ in 0..self.parity {
            shards.push(vec![0u8; chunk]);
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::ErasureCoding(format!("encode: {e}")))?;
        Ok(shards)
    }

    /// Rebuild every missing chunk in place. At least N chunks must be
    /// present.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data {
            return Err(Error::InsufficientReadQuorum {
                have: available,
                need: self.data,
            });
        }
        self.rs
            .reconstruct(shards)
            .map_err(|e| Error::ErasureCoding(format!("reconstruct: {e}")))
    }

    /// Rebuild only the missing data chunks; cheaper when parity is not
    /// being rewritten.
    pub fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data {
            return Err(Error::InsufficientReadQuorum {
                have: available,
                need: self.data,
            });
        }
        self.rs
            .reconstruct_data(shards)
            .map_err(|e| Error::ErasureCoding(format!("reconstruct: {e}")))
    }

    /// Re-derive parity from the data chunks and compare.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        self.rs
            .verify(shards)
            .map_err(|e| Error::ErasureCoding(format!("verify: {e}")))
    }

    /// Glue the first N chunks back into the original block of
    /// `block_len` bytes.
    #[must_use]
    pub fn join_data(&self, shards: &[Option<Vec<u8>>], block_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(block_len);
        for shard in shards.iter().take(self.data) {
            if let Some(chunk) = shard {
                let take = chunk.len().min(block_len - out.len());
                out.extend_from_slice(&chunk[..take]);
                if out.len() == block_len {
                    break;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size() {
        assert_eq!(chunk_size(100, 4), 25);
        assert_eq!(chunk_size(101, 4), 26);
        assert_eq!(chunk_size(1, 4), 1);
        assert_eq!(chunk_size(0, 4), 0);
    }

    #[test]
    fn test_encode_round_trip() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let block = b"The quick brown fox jumps over the lazy dog".to_vec();

        let shards = codec.encode_block(&block).unwrap();
        assert_eq!(shards.len(), 6);
        let chunk = chunk_size(block.len() as u64, 4);
        assert!(shards.iter().all(|s| s.len() == chunk));

        let opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        assert_eq!(codec.join_data(&opts, block.len()), block);
    }

    #[test]
    fn test_reconstruct_with_parity_losses() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let block: Vec<u8> = (0..997u32).map(|i| (i % 251) as u8).collect();

        let shards = codec.encode_block(&block).unwrap();
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[1] = None; // one data chunk
        opts[5] = None; // one parity chunk

        codec.reconstruct(&mut opts).unwrap();
        assert_eq!(codec.join_data(&opts, block.len()), block);
    }

    #[test]
    fn test_too_many_losses() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let shards = codec.encode_block(b"some data to protect").unwrap();
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[0] = None;
        opts[1] = None;
        opts[2] = None;

        assert!(matches!(
            codec.reconstruct(&mut opts),
            Err(Error::InsufficientReadQuorum { have: 3, need: 4 })
        ));
    }

    #[test]
    fn test_verify_detects_tamper() {
        let codec = ErasureCodec::new(4, 2).unwrap();
        let mut shards = codec.encode_block(b"bytes worth protecting").unwrap();
        assert!(codec.verify(&shards).unwrap());
        shards[2][0] ^= 0xff;
        assert!(!codec.verify(&shards).unwrap());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ErasureCodec::new(0, 2).is_err());
        assert!(ErasureCodec::new(4, 0).is_err());
        assert!(ErasureCodec::new(200, 100).is_err());
    }
}
