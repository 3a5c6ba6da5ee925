//! The shared buffer chain.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

/// One fixed-capacity buffer of entries.
pub(crate) type Buffer<T> = VecDeque<T>;

/// Chain of full (or flushed) buffers shared by every [`LocalQueue`] of one
/// kind.
///
/// [`LocalQueue`]: crate::queue::LocalQueue
pub struct SharedQueue<T> {
    name: &'static str,
    capacity: usize,
    chain: Mutex<VecDeque<Buffer<T>>>,
    enqueued: AtomicUsize,
    free: SegQueue<Buffer<T>>,
    buffers_created: AtomicUsize,
}

impl<T> fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("enqueued", &self.enqueued_buffers())
            .field("buffers_created", &self.buffers_created())
            .finish_non_exhaustive()
    }
}

impl<T> SharedQueue<T> {
    /// Creates an empty queue whose buffers hold `capacity` entries.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            chain: Mutex::new(VecDeque::new()),
            enqueued: AtomicUsize::new(0),
            free: SegQueue::new(),
            buffers_created: AtomicUsize::new(0),
        }
    }

    /// Diagnostic name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Entries per buffer.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently on the chain.
    #[must_use]
    pub fn enqueued_buffers(&self) -> usize {
        self.enqueued.load(Ordering::Acquire)
    }

    /// Whether the chain holds no buffers. Entries still in local queues
    /// are not counted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enqueued_buffers() == 0
    }

    /// Buffers allocated over the queue's lifetime; recycled buffers are
    /// counted once.
    #[must_use]
    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::Relaxed)
    }

    /// Entries on the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.lock().iter().map(VecDeque::len).sum()
    }

    pub(crate) fn alloc_buffer(&self) -> Buffer<T> {
        self.free.pop().unwrap_or_else(|| {
            self.buffers_created.fetch_add(1, Ordering::Relaxed);
            VecDeque::with_capacity(self.capacity)
        })
    }

    pub(crate) fn recycle(&self, mut buffer: Buffer<T>) {
        buffer.clear();
        self.free.push(buffer);
    }

    pub(crate) fn enqueue_back(&self, buffer: Buffer<T>) {
        if buffer.is_empty() {
            self.recycle(buffer);
            return;
        }
        self.chain.lock().push_back(buffer);
        self.enqueued.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn enqueue_front(&self, buffer: Buffer<T>) {
        if buffer.is_empty() {
            self.recycle(buffer);
            return;
        }
        self.chain.lock().push_front(buffer);
        self.enqueued.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dequeue(&self) -> Option<Buffer<T>> {
        if self.is_empty() {
            return None;
        }
        let buffer = self.chain.lock().pop_front()?;
        self.enqueued.fetch_sub(1, Ordering::AcqRel);
        Some(buffer)
    }

    /// Removes every entry from the chain in FIFO order. Only valid while
    /// no local queue is concurrently feeding it.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(mut buffer) = self.dequeue() {
            out.extend(buffer.drain(..));
            self.recycle(buffer);
        }
        out
    }
}
