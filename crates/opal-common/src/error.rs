//! Error types for Opal
//!
//! One canonical taxonomy is used across the disk, erasure, lock and object
//! layers. The disk layer classifies OS errors into these kinds immediately;
//! upper layers only ever see canonical kinds and add bucket/object context
//! with [`Error::with_context`].

use thiserror::Error;

/// Common result type for Opal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error type for Opal
#[derive(Debug, Error)]
pub enum Error {
    // Disk-level errors. The disk abstraction maps OS errors into these
    // deterministically; see `opal-disk`.
    #[error("file not found")]
    FileNotFound,

    #[error("file already exists")]
    FileAlreadyExists,

    #[error("volume not found")]
    VolumeNotFound,

    #[error("volume already exists")]
    VolumeAlreadyExists,

    #[error("volume not empty")]
    VolumeNotEmpty,

    #[error("access denied")]
    DiskAccessDenied,

    #[error("file is corrupted")]
    FileCorrupted,

    #[error("bitrot checksum mismatch: expected {expected}, computed {computed}")]
    BitrotMismatch { expected: String, computed: String },

    #[error("disk full")]
    DiskFull,

    #[error("cross-device rename not allowed")]
    CrossDevice,

    #[error("reader returned fewer bytes than declared")]
    ShortRead,

    #[error("disk unreachable")]
    DiskUnreachable,

    #[error("operation timed out: {path}")]
    OperationTimedOut { path: String },

    // Erasure engine outcomes.
    #[error("insufficient disks for read quorum: have {have}, need {need}")]
    InsufficientReadQuorum { have: usize, need: usize },

    #[error("insufficient disks for write quorum: have {have}, need {need}")]
    InsufficientWriteQuorum { have: usize, need: usize },

    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    // Object API errors.
    #[error("bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("bucket already exists: {bucket}")]
    BucketAlreadyExists { bucket: String },

    #[error("bucket not empty: {bucket}")]
    BucketNotEmpty { bucket: String },

    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound { bucket: String, object: String },

    #[error("object already exists: {bucket}/{object}")]
    ObjectAlreadyExists { bucket: String, object: String },

    #[error("invalid bucket name: {bucket}")]
    InvalidBucketName { bucket: String },

    #[error("invalid object key: {object}")]
    InvalidObjectKey { object: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid upload id: {upload_id}")]
    InvalidUploadId { upload_id: String },

    #[error("invalid part: {part_number}")]
    InvalidPart { part_number: u32 },

    #[error("part {part_number} is too small: {size} bytes, minimum {min} bytes")]
    PartTooSmall { part_number: u32, size: u64, min: u64 },

    #[error("all parts except the last must be of equal size")]
    PartsSizeUnequal,

    #[error("incomplete body: got {got} bytes, expected {expected}")]
    IncompleteBody { got: u64, expected: u64 },

    #[error("content md5 mismatch: expected {expected}, calculated {calculated}")]
    BadDigest { expected: String, calculated: String },

    #[error("entity too large: {size} bytes, maximum {max}")]
    EntityTooLarge { size: u64, max: u64 },

    #[error("entity too small: {size} bytes, minimum {min}")]
    EntityTooSmall { size: u64, min: u64 },

    #[error("concurrent modification defeated the operation: {0}")]
    Conflict(String),

    // Infrastructure errors.
    #[error("server not initialized")]
    ServerNotInitialized,

    #[error("rpc version mismatch: expected {expected}, got {got}")]
    RpcVersionMismatch { expected: String, got: String },

    #[error("authentication failed")]
    AuthFailed,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Check if this is a not found error of any flavor
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound
                | Self::VolumeNotFound
                | Self::BucketNotFound { .. }
                | Self::ObjectNotFound { .. }
                | Self::InvalidUploadId { .. }
        )
    }

    /// Check if this error indicates an unusable disk
    #[must_use]
    pub fn is_disk_fault(&self) -> bool {
        matches!(
            self,
            Self::DiskUnreachable
                | Self::DiskAccessDenied
                | Self::DiskFull
                | Self::FileCorrupted
                | Self::BitrotMismatch { .. }
        )
    }

    /// Check if a read against an alternate disk may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DiskUnreachable | Self::OperationTimedOut { .. } | Self::FileCorrupted
        )
    }

    /// Attach bucket/object context to a disk-level error, converting it
    /// into the matching object API error. Errors that already carry
    /// context are passed through unchanged.
    #[must_use]
    pub fn with_context(self, bucket: &str, object: &str) -> Self {
        match self {
            Self::VolumeNotFound => Self::BucketNotFound {
                bucket: bucket.to_string(),
            },
            Self::VolumeAlreadyExists => Self::BucketAlreadyExists {
                bucket: bucket.to_string(),
            },
            Self::VolumeNotEmpty => Self::BucketNotEmpty {
                bucket: bucket.to_string(),
            },
            Self::FileNotFound if object.is_empty() => Self::BucketNotFound {
                bucket: bucket.to_string(),
            },
            Self::FileNotFound => Self::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            },
            Self::FileAlreadyExists => Self::ObjectAlreadyExists {
                bucket: bucket.to_string(),
                object: object.to_string(),
            },
            other => other,
        }
    }

    /// Get HTTP status code for S3 API compatibility
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_)
            | Self::InvalidBucketName { .. }
            | Self::InvalidObjectKey { .. }
            | Self::InvalidPart { .. }
            | Self::PartTooSmall { .. }
            | Self::PartsSizeUnequal
            | Self::IncompleteBody { .. }
            | Self::BadDigest { .. }
            | Self::EntityTooSmall { .. }
            | Self::ShortRead => 400,

            Self::DiskAccessDenied | Self::AuthFailed => 403,

            Self::FileNotFound
            | Self::VolumeNotFound
            | Self::BucketNotFound { .. }
            | Self::ObjectNotFound { .. }
            | Self::InvalidUploadId { .. } => 404,

            Self::FileAlreadyExists
            | Self::VolumeAlreadyExists
            | Self::VolumeNotEmpty
            | Self::BucketAlreadyExists { .. }
            | Self::BucketNotEmpty { .. }
            | Self::ObjectAlreadyExists { .. }
            | Self::Conflict(_) => 409,

            Self::EntityTooLarge { .. } => 413,

            Self::RpcVersionMismatch { .. } => 426,

            Self::FileCorrupted
            | Self::BitrotMismatch { .. }
            | Self::CrossDevice
            | Self::ErasureCoding(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,

            Self::NotImplemented(_) => 501,

            Self::DiskFull
            | Self::DiskUnreachable
            | Self::OperationTimedOut { .. }
            | Self::InsufficientReadQuorum { .. }
            | Self::InsufficientWriteQuorum { .. }
            | Self::ServerNotInitialized => 503,
        }
    }

    /// Get S3 error code for API compatibility
    #[must_use]
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::BucketNotFound { .. } | Self::VolumeNotFound => "NoSuchBucket",
            Self::BucketAlreadyExists { .. } => "BucketAlreadyOwnedByYou",
            Self::BucketNotEmpty { .. } | Self::VolumeNotEmpty => "BucketNotEmpty",
            Self::ObjectNotFound { .. } | Self::FileNotFound => "NoSuchKey",
            Self::InvalidBucketName { .. } => "InvalidBucketName",
            Self::InvalidObjectKey { .. } => "XOpalInvalidObjectName",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidUploadId { .. } => "NoSuchUpload",
            Self::InvalidPart { .. } => "InvalidPart",
            Self::PartTooSmall { .. } | Self::EntityTooSmall { .. } => "EntityTooSmall",
            Self::PartsSizeUnequal => "InvalidRequest",
            Self::IncompleteBody { .. } => "IncompleteBody",
            Self::BadDigest { .. } => "BadDigest",
            Self::EntityTooLarge { .. } => "EntityTooLarge",
            Self::BitrotMismatch { .. } | Self::FileCorrupted => "XOpalDataCorrupted",
            Self::DiskFull => "XOpalStorageFull",
            Self::InsufficientReadQuorum { .. } => "XOpalReadQuorum",
            Self::InsufficientWriteQuorum { .. } => "XOpalWriteQuorum",
            Self::DiskAccessDenied | Self::AuthFailed => "AccessDenied",
            Self::ServerNotInitialized => "XOpalServerNotInitialized",
            Self::OperationTimedOut { .. } => "OperationTimedOut",
            Self::NotImplemented(_) => "NotImplemented",
            _ => "InternalError",
        }
    }
}
