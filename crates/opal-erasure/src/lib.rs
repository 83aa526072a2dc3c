//! Opal erasure storage engine
//!
//! Stripes byte streams across N+M disks with Reed-Solomon protection so
//! that any N remaining disks reconstruct the original, detects silent
//! corruption through per-disk whole-file checksums, and heals stale
//! disks back to a consistent view on demand.

pub mod codec;
pub mod storage;

pub use codec::{chunk_size, ErasureCodec};
pub use storage::{ErasureFileInfo, ErasureReadInfo, ErasureStorage};
