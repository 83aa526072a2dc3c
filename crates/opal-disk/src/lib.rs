//! Opal disk abstraction
//!
//! Bytes on one filesystem behind a narrow trait, with OS errors mapped
//! into the canonical taxonomy at the boundary. The erasure engine and
//! the object layer consume disks only through [`StorageDisk`], so local,
//! remote and deliberately faulty disks are interchangeable above.

pub mod api;
pub mod format;
pub mod posix;

pub use api::StorageDisk;
pub use format::{load_or_init_format, FormatInfo};
pub use posix::PosixDisk;
