//! Reusable packet buffers
//!
//! Every packet read from the tunnel and every reply synthesized by the
//! engines lives in a [`BytesMut`] taken from a [`BufferPool`]. Buffers are
//! handed back with [`BufferPool::release`] once the last owner is done with
//! them, so the steady state performs no per-packet allocation.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capacity of every pooled buffer.
pub const BUFFER_SIZE: usize = 16384;

/// Unbounded free list of fixed-capacity buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BUFFER_SIZE)
    }
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take an empty buffer, reusing a released one when available.
    pub fn acquire(&self) -> BytesMut {
        if let Some(buf) = self.free.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(self.buffer_size)
    }

    /// Clear a buffer and put it back on the free list.
    ///
    /// Buffers whose capacity shrank below the pool size (because a
    /// consumer split or froze part of them) are dropped instead.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() < self.buffer_size {
            return;
        }
        self.free.lock().push(buf);
    }

    /// Drop every pooled buffer.
    pub fn clear(&self) {
        self.free.lock().clear();
    }

    /// Number of buffers currently waiting on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// (fresh allocations, reuses) since creation
    pub fn counters(&self) -> (u64, u64) {
        (
            self.allocated.load(Ordering::Relaxed),
            self.reused.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_full_capacity() {
        let pool = BufferPool::default();
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= BUFFER_SIZE);
        assert_eq!(pool.counters(), (1, 0));
    }

    #[test]
    fn test_release_then_acquire_reuses_cleared_buffer() {
        let pool = BufferPool::default();
        let mut buf = pool.acquire();
        buf.extend_from_slice(&[0xAB; 64]);
        pool.release(buf);
        assert_eq!(pool.available(), 1);

        let mut again = pool.acquire();
        assert!(again.is_empty());
        assert_eq!(pool.counters(), (1, 1));

        // a zero-filled resize never exposes the old bytes
        again.resize(64, 0);
        assert!(again.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_release_drops_shrunk_buffers() {
        let pool = BufferPool::new(1024);
        let mut buf = pool.acquire();
        buf.resize(1024, 0);
        let _head = buf.split_to(512);
        pool.release(buf);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_clear() {
        let pool = BufferPool::default();
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
        pool.clear();
        assert_eq!(pool.available(), 0);
    }
}
