//! Byte-buffer pooling for Extio's hot read/write paths: a small free-list
//! behind a single lock, so repeated Extio reads don't allocate a fresh
//! buffer per message.
//!
//! Consumers must return buffers via [`BufferPool::put`] after use; a
//! buffer must never be returned twice.

use std::sync::Mutex;

use bytes::BytesMut;

pub struct BufferPool {
    capacity_hint: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            capacity_hint,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> BytesMut {
        let mut guard = self.free.lock().unwrap();
        guard
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity_hint))
    }

    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        self.free.lock().unwrap().push(buf);
    }

    pub fn len_free(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffers() {
        let pool = BufferPool::new(64);
        let buf = pool.get();
        assert_eq!(pool.len_free(), 0);
        pool.put(buf);
        assert_eq!(pool.len_free(), 1);
        let _ = pool.get();
        assert_eq!(pool.len_free(), 0);
    }
}
