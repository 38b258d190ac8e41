//! Bucketed transmission buffer pool.
//!
//! Buffers are bucketed by power-of-two size class to avoid fragmentation:
//! renting 5000 bytes hands out an 8192-byte buffer from the 8 KiB bucket.
//! Each bucket retains at most `buffers_per_bucket` idle buffers; surplus
//! returns are dropped, which is the pool's shrink bound under memory
//! pressure.
//!
//! Renting yields a [`PooledBuffer`] that derefs to `BytesMut`. Returning
//! is explicit via [`BufferPool::give_back`] (optionally zeroing the
//! backing bytes first); a `PooledBuffer` that is simply dropped finds its
//! own way back to the pool, so error paths cannot leak buffers.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::{FramewireError, Result};

/// Smallest bucket size class in bytes.
const MIN_BUCKET_SIZE: usize = 256;

/// Shared pool of fixed-capacity byte buffers, bucketed by size class.
///
/// Cheaply cloneable; all clones share the same buckets. Rent and return
/// are safe from any number of threads.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// One free list per size class, smallest first.
    buckets: Vec<Mutex<Vec<BytesMut>>>,
    /// Capacity of each size class, parallel to `buckets`.
    class_sizes: Vec<usize>,
    /// Retention target per bucket.
    buffers_per_bucket: usize,
    /// Largest rentable capacity.
    max_buffer_size: usize,
}

impl BufferPool {
    /// Create a pool whose largest bucket holds buffers of at least
    /// `max_buffer_size` bytes, retaining up to `buffers_per_bucket` idle
    /// buffers per size class.
    pub fn new(max_buffer_size: usize, buffers_per_bucket: usize) -> Self {
        let top = max_buffer_size.max(MIN_BUCKET_SIZE).next_power_of_two();

        let mut class_sizes = Vec::new();
        let mut size = MIN_BUCKET_SIZE;
        while size <= top {
            class_sizes.push(size);
            size *= 2;
        }

        let buckets = class_sizes.iter().map(|_| Mutex::new(Vec::new())).collect();

        Self {
            inner: Arc::new(PoolInner {
                buckets,
                class_sizes,
                buffers_per_bucket,
                max_buffer_size: top,
            }),
        }
    }

    /// Rent a buffer with capacity at least `min_capacity`.
    ///
    /// The buffer comes back empty (`len() == 0`). Fails with
    /// [`FramewireError::BufferTooLarge`] when `min_capacity` exceeds the
    /// largest size class.
    pub fn rent(&self, min_capacity: usize) -> Result<PooledBuffer> {
        if min_capacity > self.inner.max_buffer_size {
            return Err(FramewireError::BufferTooLarge {
                len: min_capacity,
                max: self.inner.max_buffer_size,
            });
        }

        let class = self.class_index(min_capacity);
        let class_size = self.inner.class_sizes[class];

        let mut buf = self.inner.buckets[class]
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(class_size));
        buf.clear();

        Ok(PooledBuffer {
            buf: Some(buf),
            class,
            pool: self.inner.clone(),
        })
    }

    /// Return a rented buffer.
    ///
    /// With `clear = true` the backing bytes are zeroed before the buffer
    /// becomes rentable again (secure erase).
    pub fn give_back(&self, mut buffer: PooledBuffer, clear: bool) {
        if let Some(mut buf) = buffer.buf.take() {
            if clear {
                zero_backing(&mut buf);
            }
            self.inner.store(buffer.class, buf);
        }
    }

    /// Number of idle buffers currently held across all buckets.
    pub fn idle_count(&self) -> usize {
        self.inner.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Largest rentable capacity.
    pub fn max_buffer_size(&self) -> usize {
        self.inner.max_buffer_size
    }

    /// Index of the smallest size class with capacity >= `min_capacity`.
    fn class_index(&self, min_capacity: usize) -> usize {
        let wanted = min_capacity.max(MIN_BUCKET_SIZE).next_power_of_two();
        // log2 distance from the smallest class
        (wanted.trailing_zeros() - MIN_BUCKET_SIZE.trailing_zeros()) as usize
    }
}

impl PoolInner {
    fn store(&self, class: usize, buf: BytesMut) {
        // A buffer whose storage was split off and reallocated no longer
        // satisfies its size class; it is not reusable.
        if buf.capacity() < self.class_sizes[class] {
            return;
        }
        let mut bucket = self.buckets[class].lock();
        if bucket.len() < self.buffers_per_bucket {
            bucket.push(buf);
        }
        // At retention target: the buffer is dropped and its memory freed.
    }
}

/// Zero the full backing region of a buffer, leaving it empty.
fn zero_backing(buf: &mut BytesMut) {
    let cap = buf.capacity();
    buf.clear();
    buf.resize(cap, 0);
    buf.clear();
}

/// A buffer rented from a [`BufferPool`].
///
/// Derefs to `BytesMut`. Dropping it returns it to the pool without the
/// secure erase; use [`BufferPool::give_back`] to control clearing.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    class: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(BytesMut::capacity).unwrap_or(0)
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer already returned")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer already returned")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.store(self.class, buf);
        }
    }
}
