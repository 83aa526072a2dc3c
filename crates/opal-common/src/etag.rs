//! S3 ETag computation
//!
//! ETags are the hex MD5 of the object content, or for multipart objects
//! `hex(md5(md5(p1) || … || md5(pn)))-n`. [`HashReader`] wraps the request
//! body and keeps the digests current while the disk layer streams bytes.

use md5::{Digest, Md5};
use sha2::Sha256;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::CompletePart;

/// Hex MD5 of a byte slice.
#[must_use]
pub fn content_md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// ETag for a completed multipart upload: the MD5 of the concatenated
/// part MD5s, suffixed with the part count.
pub fn complete_multipart_etag(parts: &[CompletePart]) -> Result<String> {
    let mut all = Vec::with_capacity(parts.len() * 16);
    for part in parts {
        // ETags of parts are plain content MD5s; anything that does not
        // decode as one is a client error.
        let trimmed = part.etag.trim_matches('"');
        let raw = hex::decode(trimmed).map_err(|_| Error::InvalidPart {
            part_number: part.part_number,
        })?;
        if raw.len() != 16 {
            return Err(Error::InvalidPart {
                part_number: part.part_number,
            });
        }
        all.extend_from_slice(&raw);
    }
    Ok(format!("{}-{}", hex::encode(Md5::digest(&all)), parts.len()))
}

/// Generate an ETag for content whose MD5 was never computed.
#[must_use]
pub fn gen_etag() -> String {
    content_md5_hex(Uuid::new_v4().as_bytes())
}

/// A reader wrapper that computes MD5 (and optionally SHA-256) over
/// everything read through it, and knows the size the client declared.
///
/// The disk layer consumes the reader; callers then ask for
/// [`HashReader::md5_current`] to build the ETag, and
/// [`HashReader::verify`] to enforce a client-supplied digest.
pub struct HashReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    size: u64,
    bytes_read: u64,
    md5: Md5,
    sha256: Option<Sha256>,
    expected_md5_hex: Option<String>,
}

impl HashReader {
    /// Wrap `inner`, declaring `size` bytes of content.
    pub fn new(inner: Box<dyn AsyncRead + Send + Unpin>, size: u64) -> Self {
        Self {
            inner,
            size,
            bytes_read: 0,
            md5: Md5::new(),
            sha256: None,
            expected_md5_hex: None,
        }
    }

    /// Wrap a byte slice; handy in tests and for internal writes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self::new(Box::new(std::io::Cursor::new(data)), size)
    }

    /// Also maintain a SHA-256 of the content.
    #[must_use]
    pub fn with_sha256(mut self) -> Self {
        self.sha256 = Some(Sha256::new());
        self
    }

    /// Demand that the content MD5 equals `hex` once fully read.
    #[must_use]
    pub fn with_expected_md5(mut self, hex: impl Into<String>) -> Self {
        self.expected_md5_hex = Some(hex.into());
        self
    }

    /// Declared content size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes read through the wrapper so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Hex MD5 of the bytes read so far.
    #[must_use]
    pub fn md5_current(&self) -> String {
        hex::encode(self.md5.clone().finalize())
    }

    /// Hex SHA-256 of the bytes read so far, if tracking was enabled.
    #[must_use]
    pub fn sha256_current(&self) -> Option<String> {
        self.sha256.as_ref().map(|h| hex::encode(h.clone().finalize()))
    }

    /// Check the computed MD5 against the client-supplied one.
    pub fn verify(&self) -> Result<()> {
        if let Some(expected) = &self.expected_md5_hex {
            let calculated = self.md5_current();
            if *expected != calculated {
                return Err(Error::BadDigest {
                    expected: expected.clone(),
                    calculated,
                });
            }
        }
        Ok(())
    }
}

impl AsyncRead for HashReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                me.md5.update(filled);
                if let Some(h) = &mut me.sha256 {
                    h.update(filled);
                }
                me.bytes_read += filled.len() as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_content_md5_hex() {
        assert_eq!(content_md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_complete_multipart_etag() {
        let parts = vec![
            CompletePart {
                part_number: 1,
                etag: content_md5_hex(b"AAAA"),
            },
            CompletePart {
                part_number: 2,
                etag: content_md5_hex(b"BBBB"),
            },
        ];
        let etag = complete_multipart_etag(&parts).unwrap();
        assert!(etag.ends_with("-2"));

        let mut concat = Vec::new();
        concat.extend_from_slice(&hex::decode(content_md5_hex(b"AAAA")).unwrap());
        concat.extend_from_slice(&hex::decode(content_md5_hex(b"BBBB")).unwrap());
        assert_eq!(etag, format!("{}-2", content_md5_hex(&concat)));
    }

    #[test]
    fn test_complete_multipart_etag_rejects_garbage() {
        let parts = vec![CompletePart {
            part_number: 1,
            etag: "not-a-digest".into(),
        }];
        assert!(complete_multipart_etag(&parts).is_err());
    }

    #[tokio::test]
    async fn test_hash_reader_tracks_md5() {
        let mut reader = HashReader::from_bytes(b"hello".to_vec());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.bytes_read(), 5);
        assert_eq!(reader.md5_current(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn test_hash_reader_verify() {
        let mut reader = HashReader::from_bytes(b"hello".to_vec())
            .with_expected_md5("5d41402abc4b2a76b9719d911017c592");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(reader.verify().is_ok());

        let mut reader =
            HashReader::from_bytes(b"hello".to_vec()).with_expected_md5("00".repeat(16));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(matches!(reader.verify(), Err(Error::BadDigest { .. })));
    }
}
