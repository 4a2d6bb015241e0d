//! Bounded byte ring shared between one producer and one consumer.
//!
//! Every serial pipeline owns two of these: the rx worker fills one while the
//! direction worker drains it, and the roles flip for tx. Writes are
//! all-or-nothing so an enqueued APDU is never half-committed. Reads hand out
//! a view straight into the backing storage when the requested range does not
//! cross the wrap boundary; the wrap case assembles a contiguous copy, which
//! stays rare as long as capacity sits an order of magnitude above the
//! typical APDU size.
//!
//! Concurrency model: one producer, one consumer, plus occasional metric
//! readers. All operations serialize on a single internal mutex; the
//! single-producer/single-consumer discipline is a usage contract, not
//! something enforced here.

use std::sync::{Mutex, MutexGuard};

use crate::errors::BufferError;

struct Inner {
    buf: Box<[u8]>,
    head: usize, // next write offset
    tail: usize, // next read offset
    size: usize, // bytes readable
}

/// Fixed-capacity circular byte queue.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

/// Borrowed window over buffered bytes.
///
/// Holds the ring lock for its lifetime, so keep it short-lived: copy the
/// bytes out or process them, then drop the view before touching the ring
/// again from the same thread.
pub struct RingView<'a> {
    guard: MutexGuard<'a, Inner>,
    start: usize,
    len: usize,
    spill: Option<Vec<u8>>, // set only when the range wraps
}

impl std::ops::Deref for RingView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.spill {
            Some(bytes) => bytes,
            None => &self.guard.buf[self.start..self.start + self.len],
        }
    }
}

impl RingBuffer {
    /// Create a ring with `capacity` bytes of storage.
    ///
    /// Capacity must be at least 1; configuration validation upstream
    /// guarantees this for rings built by the relay.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be at least 1");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                size: 0,
            }),
            capacity,
        }
    }

    /// Total storage in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently readable.
    pub fn len(&self) -> usize {
        self.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Space left for writes.
    pub fn available_space(&self) -> usize {
        self.capacity - self.len()
    }

    /// Fraction of the ring in use, 0.0..=1.0.
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Append all of `src`, or nothing. An empty `src` is a no-op.
    pub fn write(&self, src: &[u8]) -> Result<usize, BufferError> {
        if src.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        let available = self.capacity - inner.size;
        if src.len() > available {
            return Err(BufferError::NoSpace {
                requested: src.len(),
                available,
            });
        }
        let head = inner.head;
        let first = (self.capacity - head).min(src.len());
        inner.buf[head..head + first].copy_from_slice(&src[..first]);
        inner.buf[..src.len() - first].copy_from_slice(&src[first..]);
        inner.head = (head + src.len()) % self.capacity;
        inner.size += src.len();
        Ok(src.len())
    }

    /// Consume up to `n` bytes and return a view over them, or `None` when
    /// the ring is empty (or `n` is zero).
    pub fn read(&self, n: usize) -> Option<RingView<'_>> {
        self.take(n, true)
    }

    /// Like [`RingBuffer::read`], but the bytes stay in the ring.
    pub fn peek(&self, n: usize) -> Option<RingView<'_>> {
        self.take(n, false)
    }

    /// Drop everything buffered and rewind both cursors.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.head = 0;
        inner.tail = 0;
        inner.size = 0;
    }

    fn take(&self, n: usize, consume: bool) -> Option<RingView<'_>> {
        let mut inner = self.lock();
        if n == 0 || inner.size == 0 {
            return None;
        }
        let len = n.min(inner.size);
        let start = inner.tail;
        let spill = if start + len > self.capacity {
            let mut bytes = Vec::with_capacity(len);
            bytes.extend_from_slice(&inner.buf[start..]);
            bytes.extend_from_slice(&inner.buf[..len - (self.capacity - start)]);
            Some(bytes)
        } else {
            None
        };
        if consume {
            inner.tail = (start + len) % self.capacity;
            inner.size -= len;
        }
        Some(RingView {
            guard: inner,
            start,
            len,
            spill,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The critical sections are short and panic-free; a poisoned lock
        // still holds consistent state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
