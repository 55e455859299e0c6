//! Scratch buffers for serializing request heads.
//!
//! The free list is owned by whoever creates it (one per [`ProxyBuilder`]),
//! so buffers never outlive the proxy that recycles them.
//!
//! [`ProxyBuilder`]: crate::builder::ProxyBuilder

use bytes::BytesMut;
use std::sync::Mutex;

const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;
/// Buffers that grew past this are dropped instead of recycled.
const MAX_RECYCLED_CAPACITY: usize = 64 * 1024;

pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_free: usize,
}

impl BufferPool {
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_free)),
            max_free,
        }
    }

    pub fn get(&self) -> BytesMut {
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY))
    }

    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RECYCLED_CAPACITY {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_free {
                free.push(buf);
            }
        }
    }

    pub fn free_len(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}
