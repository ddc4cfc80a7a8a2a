//! Fixed-capacity, thread-safe ring buffer that evicts its oldest entry
//!
//! Writers take an exclusive lock. Readers first make a bounded number of
//! `try_read` attempts and only then queue behind the lock, so metrics
//! scrapes don't serialize behind event writes in steady state. The
//! modification stamp is not consulted on reads: a held read guard already
//! excludes writers. It backs [`EvictingRingBuffer::modifications`] and the
//! fail-fast iterator.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::{Error, Result};

/// `try_read` attempts before falling back to a blocking read lock.
const TRY_READ_ATTEMPTS: usize = 4;

/// Bounded FIFO that overwrites its oldest item once full.
pub struct EvictingRingBuffer<T> {
    ring: RwLock<Ring<T>>,
    /// Odd while a writer is mutating; advances by two per modification.
    stamp: AtomicU64,
}

impl<T> EvictingRingBuffer<T> {
    /// Create a buffer holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity(capacity));
        }
        Ok(Self {
            ring: RwLock::new(Ring::with_capacity(capacity)),
            stamp: AtomicU64::new(0),
        })
    }

    /// Append `item`, returning the evicted oldest item if the buffer was full.
    pub fn push(&self, item: T) -> Option<T> {
        self.write(|ring| ring.push(item))
    }

    /// Remove and return the oldest item.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.ring.write();
        if ring.len == 0 {
            return None;
        }
        self.stamp.fetch_add(1, Ordering::AcqRel);
        let item = ring.pop();
        self.stamp.fetch_add(1, Ordering::Release);
        item
    }

    /// Remove every item.
    pub fn clear(&self) {
        self.write(Ring::clear);
    }

    /// Remove every item, returning them oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.write(|ring| {
            let mut out = Vec::with_capacity(ring.len);
            while let Some(item) = ring.pop() {
                out.push(item);
            }
            ring.head = 0;
            out
        })
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.read(|ring| ring.len)
    }

    /// Returns `true` when no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` when the next push will evict.
    pub fn is_full(&self) -> bool {
        self.read(|ring| ring.len == ring.capacity())
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.read(Ring::capacity)
    }

    /// Number of structural modifications (push, pop, clear) so far.
    pub fn modifications(&self) -> u64 {
        self.stamp.load(Ordering::Acquire) >> 1
    }

    fn write<R>(&self, f: impl FnOnce(&mut Ring<T>) -> R) -> R {
        let mut ring = self.ring.write();
        self.stamp.fetch_add(1, Ordering::AcqRel);
        let out = f(&mut ring);
        self.stamp.fetch_add(1, Ordering::Release);
        out
    }

    fn read<R>(&self, f: impl FnOnce(&Ring<T>) -> R) -> R {
        for _ in 0..TRY_READ_ATTEMPTS {
            if let Some(ring) = self.ring.try_read() {
                return f(&ring);
            }
            std::hint::spin_loop();
        }
        f(&self.ring.read())
    }
}

impl<T: Clone> EvictingRingBuffer<T> {
    /// Oldest item, left in place.
    pub fn peek(&self) -> Option<T> {
        self.read(|ring| ring.get(0).cloned())
    }

    /// Newest item, left in place.
    pub fn peek_newest(&self) -> Option<T> {
        self.read(|ring| ring.len.checked_sub(1).and_then(|i| ring.get(i)).cloned())
    }

    /// Copy of all live items, oldest to newest.
    pub fn snapshot_ordered(&self) -> Vec<T> {
        let mut out = Vec::new();
        self.copy_into(&mut out);
        out
    }

    /// Append all live items, oldest to newest, to `out`.
    pub fn copy_into(&self, out: &mut Vec<T>) {
        self.read(|ring| {
            let (front, back) = ring.segments();
            out.reserve(ring.len);
            out.extend(front.iter().flatten().cloned());
            out.extend(back.iter().flatten().cloned());
        });
    }

    /// Fail-fast iterator over the live items, oldest first.
    ///
    /// Yields `Err(Error::ConcurrentModification)` once, then stops, if the
    /// buffer is modified after the iterator was created.
    pub fn iter(&self) -> Iter<'_, T> {
        let ring = self.ring.read();
        let expected = self.stamp.load(Ordering::Acquire);
        drop(ring);
        Iter {
            buffer: self,
            expected,
            index: 0,
            done: false,
        }
    }
}

impl<T> fmt::Debug for EvictingRingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, capacity) = self.read(|ring| (ring.len, ring.capacity()));
        f.debug_struct("EvictingRingBuffer")
            .field("len", &len)
            .field("capacity", &capacity)
            .field("modifications", &self.modifications())
            .finish()
    }
}

/// Iterator returned by [`EvictingRingBuffer::iter`].
pub struct Iter<'a, T> {
    buffer: &'a EvictingRingBuffer<T>,
    expected: u64,
    index: usize,
    done: bool,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let ring = self.buffer.ring.read();
        if self.buffer.stamp.load(Ordering::Acquire) != self.expected {
            self.done = true;
            return Some(Err(Error::ConcurrentModification));
        }
        let item = ring.get(self.index).cloned();
        self.index += 1;
        if item.is_none() {
            self.done = true;
        }
        item.map(Ok)
    }
}

/// Circular storage guarded by the buffer's lock.
struct Ring<T> {
    slots: Box<[Option<T>]>,
    /// Index of the oldest live item.
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.capacity();
        if self.len < capacity {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(item);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(item);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[(self.head + index) % self.capacity()].as_ref()
    }

    /// Live slots as two contiguous runs: head to the array end, then the wrapped prefix.
    fn segments(&self) -> (&[Option<T>], &[Option<T>]) {
        let capacity = self.capacity();
        let end = self.head + self.len;
        if end <= capacity {
            (&self.slots[self.head..end], &self.slots[..0])
        } else {
            (&self.slots[self.head..], &self.slots[..end - capacity])
        }
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}
