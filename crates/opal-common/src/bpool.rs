//! Bounded byte-buffer pool
//!
//! Streaming encode/decode churns through block-sized buffers; the pool
//! caps how many are alive at once so peak memory stays bounded under
//! concurrent load.

use parking_lot::Mutex;

/// A bounded pool of equally sized reusable buffers
pub struct BytePool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    capacity: usize,
}

impl BytePool {
    /// Create a pool of up to `capacity` buffers of `buf_size` bytes.
    #[must_use]
    pub fn new(buf_size: usize, capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            buf_size,
            capacity,
        }
    }

    /// Take a zeroed buffer from the pool, allocating when empty.
    #[must_use]
    pub fn get(&self) -> Vec<u8> {
        if let Some(mut buf) = self.buffers.lock().pop() {
            buf.clear();
            buf.resize(self.buf_size, 0);
            return buf;
        }
        vec![0u8; self.buf_size]
    }

    /// Return a buffer. Buffers beyond capacity or of a foreign size are
    /// dropped instead of retained.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() < self.buf_size {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }

    #[must_use]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
}
