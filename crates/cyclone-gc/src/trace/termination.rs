//! Distributed termination of the parallel closure.
//!
//! A collector that has drained everything it can see flushes its local
//! buffers and counts itself idle. It then waits until either some shared
//! chain has work again, in which case it leaves the idle count and
//! resumes, or every collector is idle with every chain empty, in which
//! case the closure is complete. A collector that has returned stays
//! counted as idle.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use crate::trace::TraceQueues;

/// Idle count shared by the collectors of one closure.
#[derive(Debug)]
pub struct Termination {
    idle: AtomicUsize,
    workers: usize,
}

impl Termination {
    /// Termination state for `workers` collectors, none idle.
    #[must_use]
    pub const fn new(workers: usize) -> Self {
        Self {
            idle: AtomicUsize::new(0),
            workers,
        }
    }

    /// Number of collectors taking part.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Called by a collector with no local work. Returns `true` when there
    /// is shared work to resume with, `false` once the closure is complete.
    pub fn wait_for_work(&self, queues: &TraceQueues) -> bool {
        self.idle.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if !queues.all_empty() {
                self.idle.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
            if self.idle.load(Ordering::Acquire) == self.workers && queues.all_empty() {
                return false;
            }
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_worker_terminates_immediately() {
        let queues = TraceQueues::new(8);
        let termination = Termination::new(1);
        assert!(!termination.wait_for_work(&queues));
    }

    #[test]
    fn pending_work_resumes_the_worker() {
        let queues = TraceQueues::new(8);
        {
            let shared = std::sync::Arc::clone(queues.locations());
            let mut local = crate::queue::LocalQueue::new(shared);
            local.insert(crate::address::Address::from_usize(0x10));
        }
        let termination = Termination::new(2);
        assert!(termination.wait_for_work(&queues));
    }
}
