//! Fixed-capacity byte buffers shared by every connection.
//!
//! Payload arguments and responses are copied into a [`PooledBuf`] taken from
//! a [`BufferPool`]. The buffer has exactly one owner at a time and goes back
//! to the pool when that owner drops it, so a handler cannot hold on to a
//! payload past its own completion, whichever way it exits.

use std::{
    fmt, io,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::io_err;

struct PoolInner {
    capacity: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl PoolInner {
    fn release(&self, mut storage: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        storage.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(storage);
        }
    }
}

/// Pool of byte buffers of a fixed capacity.
///
/// Cheap to clone; clones share the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `capacity` bytes and keeping at
    /// most `max_idle` released buffers for reuse.
    pub fn new(capacity: usize, max_idle: usize) -> BufferPool {
        BufferPool {
            inner: Arc::new(PoolInner {
                capacity,
                max_idle,
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an empty buffer, reusing a released one when available
    pub fn acquire(&self) -> PooledBuf {
        let storage = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.capacity));
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuf {
            storage,
            capacity: self.inner.capacity,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Capacity of every buffer of this pool
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of released buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Number of buffers currently owned by someone
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("idle", &self.idle())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`].
///
/// Writes past the capacity fail with `WriteZero`; the buffer never grows.
pub struct PooledBuf {
    storage: Vec<u8>,
    capacity: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuf {
    /// Bytes still writable before the buffer is full
    pub fn remaining(&self) -> usize {
        self.capacity - self.storage.len()
    }

    /// Fixed capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard the contents, keeping the buffer
    pub fn clear(&mut self) {
        self.storage.clear();
    }

    /// Give the buffer back to its pool
    pub fn release(self) {
        drop(self)
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.storage
    }
}

impl io::Write for PooledBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let n = data.len().min(self.remaining());
        if n == 0 {
            return Err(io_err!(WriteZero, "pooled buffer is full"));
        }
        self.storage.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.storage));
    }
}

impl PartialEq for PooledBuf {
    fn eq(&self, other: &Self) -> bool {
        self.storage == other.storage
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.storage.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
