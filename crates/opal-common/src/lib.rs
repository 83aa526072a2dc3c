//! Opal common library
//!
//! Shared foundation for every Opal crate: the canonical error taxonomy,
//! core data types, ETag and bitrot primitives, configuration, endpoints
//! and the streaming buffer pool.

pub mod bitrot;
pub mod bpool;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod etag;
pub mod types;

pub use bitrot::{BitrotAlgorithm, BitrotHasher, BitrotVerifier};
pub use bpool::BytePool;
pub use config::{ConfigHandle, ServerConfig};
pub use endpoint::{Endpoint, EndpointList, SetupType};
pub use error::{Error, Result};
pub use etag::HashReader;
