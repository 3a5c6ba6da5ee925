//! Thread-local ends of a [`SharedQueue`].

use std::fmt;
use std::sync::Arc;

use super::shared::{Buffer, SharedQueue};

/// A thread's private view of a [`SharedQueue`].
///
/// Entries buffered locally are invisible to other threads until the buffer
/// fills or [`LocalQueue::flush_local`] is called. Dropping a local queue flushes
/// it.
pub struct LocalQueue<T> {
    shared: Arc<SharedQueue<T>>,
    head: Option<Buffer<T>>,
    tail: Option<Buffer<T>>,
}

impl<T> fmt::Debug for LocalQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("queue", &self.shared.name())
            .field("head", &self.head.as_ref().map_or(0, Buffer::len))
            .field("tail", &self.tail.as_ref().map_or(0, Buffer::len))
            .finish()
    }
}

impl<T> LocalQueue<T> {
    /// Creates an empty local end of `shared`.
    #[must_use]
    pub const fn new(shared: Arc<SharedQueue<T>>) -> Self {
        Self {
            shared,
            head: None,
            tail: None,
        }
    }

    /// The shared chain this queue feeds.
    #[must_use]
    pub const fn shared(&self) -> &Arc<SharedQueue<T>> {
        &self.shared
    }

    /// Appends `entry` at the tail (FIFO order).
    pub fn insert(&mut self, entry: T) {
        let capacity = self.shared.capacity();
        let tail = match &mut self.tail {
            Some(tail) if tail.len() < capacity => tail,
            slot => {
                if let Some(full) = slot.take() {
                    self.shared.enqueue_back(full);
                }
                slot.insert(self.shared.alloc_buffer())
            }
        };
        tail.push_back(entry);
    }

    /// Adds `entry` at the head (LIFO order).
    pub fn push(&mut self, entry: T) {
        let capacity = self.shared.capacity();
        let head = match &mut self.head {
            Some(head) if head.len() < capacity => head,
            slot => {
                if let Some(full) = slot.take() {
                    self.shared.enqueue_front(full);
                }
                slot.insert(self.shared.alloc_buffer())
            }
        };
        head.push_front(entry);
    }

    /// Takes the next entry: from the head buffer, else from the front of
    /// the shared chain, else from this queue's own tail buffer.
    pub fn pop(&mut self) -> Option<T> {
        loop {
            if let Some(entry) = self.head.as_mut().and_then(Buffer::pop_front) {
                return Some(entry);
            }
            let next = self.shared.dequeue().or_else(|| self.tail.take())?;
            if let Some(spent) = self.head.replace(next) {
                self.shared.recycle(spent);
            }
        }
    }

    /// Whether both local buffers are empty.
    #[must_use]
    pub fn is_locally_empty(&self) -> bool {
        self.head.as_ref().is_none_or(Buffer::is_empty)
            && self.tail.as_ref().is_none_or(Buffer::is_empty)
    }

    /// Entries held locally plus entries on the shared chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, Buffer::len)
            + self.tail.as_ref().map_or(0, Buffer::len)
            + self.shared.len()
    }

    /// Whether neither this queue nor the shared chain holds entries.
    /// Other local queues on the same chain are not consulted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_locally_empty() && self.shared.is_empty()
    }

    /// Publishes both local buffers to the shared chain.
    pub fn flush_local(&mut self) {
        if let Some(head) = self.head.take() {
            self.shared.enqueue_front(head);
        }
        if let Some(tail) = self.tail.take() {
            self.shared.enqueue_back(tail);
        }
    }
}

impl<T> Drop for LocalQueue<T> {
    fn drop(&mut self) {
        self.flush_local();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> Arc<SharedQueue<usize>> {
        Arc::new(SharedQueue::new("test", capacity))
    }

    #[test]
    fn inserts_fill_buffers_in_order() {
        let shared = queue(1000);
        let mut local = LocalQueue::new(Arc::clone(&shared));
        for i in 0..5000 {
            local.insert(i);
        }
        assert_eq!(shared.enqueued_buffers(), 4);
        local.flush_local();
        assert_eq!(shared.enqueued_buffers(), 5);
        assert_eq!(shared.len(), 5000);

        let mut reader = LocalQueue::new(Arc::clone(&shared));
        let drained: Vec<usize> = std::iter::from_fn(|| reader.pop()).collect();
        assert_eq!(drained, (0..5000).collect::<Vec<_>>());
        assert!(shared.is_empty());
    }

    #[test]
    fn pushes_pop_most_recent_first() {
        let shared = queue(4);
        let mut local = LocalQueue::new(Arc::clone(&shared));
        for i in 0..10 {
            local.push(i);
        }
        let drained: Vec<usize> = std::iter::from_fn(|| local.pop()).collect();
        assert_eq!(drained, (0..10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn pop_falls_back_to_own_tail() {
        let shared = queue(8);
        let mut local = LocalQueue::new(Arc::clone(&shared));
        local.insert(1);
        local.insert(2);
        assert!(shared.is_empty());
        assert_eq!(local.pop(), Some(1));
        assert_eq!(local.pop(), Some(2));
        assert_eq!(local.pop(), None);
        assert!(local.is_locally_empty());
    }

    #[test]
    fn shared_work_is_preferred_over_local_tail() {
        let shared = queue(2);
        let mut producer = LocalQueue::new(Arc::clone(&shared));
        producer.insert(10);
        producer.insert(11);
        producer.insert(12);

        let mut consumer = LocalQueue::new(Arc::clone(&shared));
        consumer.insert(99);
        assert_eq!(consumer.pop(), Some(10));
        assert_eq!(consumer.pop(), Some(11));
        assert_eq!(consumer.pop(), Some(99));
    }

    #[test]
    fn buffers_are_recycled() {
        let shared = queue(2);
        let mut local = LocalQueue::new(Arc::clone(&shared));
        for round in 0..10 {
            for i in 0..6 {
                local.insert(round * 6 + i);
            }
            while local.pop().is_some() {}
        }
        assert!(shared.buffers_created() <= 5, "{}", shared.buffers_created());
    }

    #[test]
    fn drop_flushes() {
        let shared = queue(16);
        {
            let mut local = LocalQueue::new(Arc::clone(&shared));
            local.insert(7);
            local.push(3);
        }
        assert_eq!(shared.drain(), vec![3, 7]);
    }
}
