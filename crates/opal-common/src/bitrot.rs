//! Bitrot detection primitives
//!
//! Every per-disk file written by the erasure engine carries a whole-file
//! checksum in the object metadata. Reads re-hash the file and compare
//! before any byte is served, turning silent corruption into a canonical
//! error the engine can route around.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::Xxh64;

use crate::error::{Error, Result};

/// Hash algorithm protecting one per-disk file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrotAlgorithm {
    /// Fast non-cryptographic hash, the default for data files.
    #[default]
    Xxh64,
    /// CRC32-Castagnoli, cheapest option.
    Crc32c,
    /// SHA-256 for deployments that want a cryptographic guarantee.
    Sha256,
}

impl BitrotAlgorithm {
    /// Start a streaming hasher for this algorithm.
    #[must_use]
    pub fn hasher(self) -> BitrotHasher {
        let state = match self {
            Self::Xxh64 => HasherState::Xxh64(Xxh64::new(0)),
            Self::Crc32c => HasherState::Crc32c(0),
            Self::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        BitrotHasher { state }
    }

    /// One-shot digest of `data`.
    #[must_use]
    pub fn checksum(self, data: &[u8]) -> Vec<u8> {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }
}

enum HasherState {
    Xxh64(Xxh64),
    Crc32c(u32),
    Sha256(Sha256),
}

/// Streaming bitrot hasher; one per disk per file on the write path
pub struct BitrotHasher {
    state: HasherState,
}

impl BitrotHasher {
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Xxh64(h) => h.update(data),
            HasherState::Crc32c(c) => *c = crc32c::crc32c_append(*c, data),
            HasherState::Sha256(h) => h.update(data),
        }
    }

    #[must_use]
    pub fn finalize(self) -> Vec<u8> {
        match self.state {
            HasherState::Xxh64(h) => h.digest().to_be_bytes().to_vec(),
            HasherState::Crc32c(c) => c.to_be_bytes().to_vec(),
            HasherState::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Expected whole-file checksum, handed to the disk layer on reads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitrotVerifier {
    pub algorithm: BitrotAlgorithm,
    pub expected: Vec<u8>,
}

impl BitrotVerifier {
    #[must_use]
    pub fn new(algorithm: BitrotAlgorithm, expected: Vec<u8>) -> Self {
        Self {
            algorithm,
            expected,
        }
    }

    /// Hash `data` and compare against the stored checksum.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let computed = self.algorithm.checksum(data);
        if computed != self.expected {
            return Err(Error::BitrotMismatch {
                expected: hex::encode(&self.expected),
                computed: hex::encode(&computed),
            });
        }
        Ok(())
    }
}
