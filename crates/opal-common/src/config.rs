//! Server configuration
//!
//! Sections mirror the subsystems: storage, locking, multipart hygiene.
//! Loaded from TOML and merged with CLI flags by the server binary; peers
//! exchange the serialized JSON form through the admin RPC surface.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::bitrot::BitrotAlgorithm;
use crate::error::{Error, Result};
use crate::types::DEFAULT_BLOCK_SIZE;

/// Version stamp carried inside persisted configuration.
pub const CONFIG_VERSION: &str = "1";

/// Root configuration for an Opal server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub multipart: MultipartConfig,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            region: default_region(),
            storage: StorageConfig::default(),
            lock: LockConfig::default(),
            multipart: MultipartConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| Error::Configuration(format!("parse {}: {e}", path.display())))
    }

    /// Serialized form exchanged over the admin RPC surface.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse the RPC form, rejecting unknown versions.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let cfg: Self =
            serde_json::from_slice(raw).map_err(|e| Error::Serialization(e.to_string()))?;
        if cfg.version != CONFIG_VERSION {
            return Err(Error::Configuration(format!(
                "unsupported config version {}",
                cfg.version
            )));
        }
        Ok(cfg)
    }
}

/// Storage engine tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Unit at which streams are erasure-coded.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Whole-file hash protecting each per-disk file.
    #[serde(default)]
    pub bitrot_algorithm: BitrotAlgorithm,
    /// Number of reusable streaming buffers kept pooled.
    #[serde(default = "default_pool_capacity")]
    pub buffer_pool_capacity: usize,
    /// Parity drives for the STANDARD storage class; the default splits
    /// the set half and half.
    #[serde(default)]
    pub standard_parity: Option<usize>,
    /// Parity drives for the REDUCED_REDUNDANCY storage class; the
    /// default is a quarter of the set.
    #[serde(default)]
    pub rrs_parity: Option<usize>,
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_pool_capacity() -> usize {
    16
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            bitrot_algorithm: BitrotAlgorithm::default(),
            buffer_pool_capacity: default_pool_capacity(),
            standard_parity: None,
            rrs_parity: None,
        }
    }
}

/// Namespace lock tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Initial budget for a lock acquire.
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    /// Floor for the dynamic timeout.
    #[serde(default = "default_lock_min_ms")]
    pub min_timeout_ms: u64,
    /// Ceiling for the dynamic timeout.
    #[serde(default = "default_lock_max_ms")]
    pub max_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_lock_min_ms() -> u64 {
    1_000
}

fn default_lock_max_ms() -> u64 {
    120_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            min_timeout_ms: default_lock_min_ms(),
            max_timeout_ms: default_lock_max_ms(),
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Multipart hygiene
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultipartConfig {
    /// How often the stale-upload cleaner wakes.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Uploads idle longer than this are removed.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    /// Smallest accepted size for any part but the last. The S3 rule is
    /// 5 MiB; lowering it is for controlled deployments only.
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
}

fn default_min_part_size() -> u64 {
    crate::types::MIN_PART_SIZE
}

fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_expiry_secs() -> u64 {
    24 * 60 * 60
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            expiry_secs: default_expiry_secs(),
            min_part_size: default_min_part_size(),
        }
    }
}

impl MultipartConfig {
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    #[must_use]
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// Shared handle to the active configuration.
///
/// Readers grab an `Arc` snapshot and never block behind a writer doing
/// I/O; writers replace the whole `Arc` in one swap.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<ServerConfig>>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot of the active configuration.
    #[must_use]
    pub fn load(&self) -> Arc<ServerConfig> {
        self.current.read().clone()
    }

    /// Publish a new configuration.
    pub fn store(&self, config: ServerConfig) {
        *self.current.write() = Arc::new(config);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
