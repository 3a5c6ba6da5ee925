//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::cycle::{CycleStats, Progress};

/// Statistics from the most recent collection of a plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcMetrics {
    /// Collection number, starting at 1.
    pub collection: usize,
    /// Wall-clock duration of the whole collection.
    pub duration: Duration,
    /// Per-phase durations.
    pub phases: PhaseTimer,
    /// Whether the collection was requested explicitly.
    pub forced: bool,
    /// Collector threads that took part.
    pub participants: usize,
    /// Pages reserved when the collection started.
    pub pages_before: usize,
    /// Pages reserved when it finished.
    pub pages_after: usize,
    /// Roots delivered to the collectors.
    pub roots: usize,
    /// Objects scanned by the trace.
    pub objects_scanned: usize,
    /// Nursery objects copied into the mature space.
    pub objects_copied: usize,
    /// Objects freed: swept cells and large objects under the hybrid plan,
    /// reference-count and cycle frees under the reference-counting plan.
    pub objects_freed: usize,
    /// Decrements applied.
    pub decrements: usize,
    /// Cycle-collector counters.
    pub cycles: CycleStats,
    /// Outcome of the cycle-collector increment; `None` under the hybrid
    /// plan.
    pub cycle_progress: Option<Progress>,
}

/// Captures phase durations of one collection.
///
/// # Example
///
/// ```
/// use cyclone_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... prepare work ...
/// timer.end_prepare();
/// assert!(timer.closure.is_zero());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Prepare: allocator resets, buffer flushes, mark flips.
    pub prepare: Duration,
    /// Root scanning and transitive closure (root increments under
    /// reference counting).
    pub closure: Duration,
    /// Deferred decrement processing.
    pub decrements: Duration,
    /// Cycle-collector increment.
    pub cycles: Duration,
    /// Sweep and release.
    pub release: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a timer with every duration zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prepare: Duration::ZERO,
            closure: Duration::ZERO,
            decrements: Duration::ZERO,
            cycles: Duration::ZERO,
            release: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn end(&mut self) -> Duration {
        self.current_start.take().map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// End the prepare phase.
    pub fn end_prepare(&mut self) {
        self.prepare = self.end();
    }

    /// End the closure phase.
    pub fn end_closure(&mut self) {
        self.closure = self.end();
    }

    /// End decrement processing. Accumulates, since decrements run twice.
    pub fn end_decrements(&mut self) {
        let elapsed = self.end();
        self.decrements += elapsed;
    }

    /// End the cycle-collector increment.
    pub fn end_cycles(&mut self) {
        self.cycles = self.end();
    }

    /// End the release phase.
    pub fn end_release(&mut self) {
        self.release = self.end();
    }
}

/// Cumulative statistics of one plan.
#[derive(Debug, Default)]
pub struct CumulativeMetrics {
    collections: AtomicUsize,
    forced_collections: AtomicUsize,
    objects_copied: AtomicUsize,
    objects_freed: AtomicUsize,
    cycle_objects_freed: AtomicUsize,
    cycle_aborts: AtomicUsize,
    pause_ns: AtomicU64,
}

impl CumulativeMetrics {
    /// Create counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            forced_collections: AtomicUsize::new(0),
            objects_copied: AtomicUsize::new(0),
            objects_freed: AtomicUsize::new(0),
            cycle_objects_freed: AtomicUsize::new(0),
            cycle_aborts: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, last: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        if last.forced {
            self.forced_collections.fetch_add(1, Ordering::Relaxed);
        }
        self.objects_copied
            .fetch_add(last.objects_copied, Ordering::Relaxed);
        self.objects_freed
            .fetch_add(last.objects_freed, Ordering::Relaxed);
        self.cycle_objects_freed
            .fetch_add(last.cycles.freed, Ordering::Relaxed);
        if last.cycles.requeued > 0 {
            self.cycle_aborts.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(last.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Returns the number of collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the number of explicitly requested collections.
    #[inline]
    #[must_use]
    pub fn total_forced_collections(&self) -> usize {
        self.forced_collections.load(Ordering::Relaxed)
    }

    /// Returns the number of nursery objects copied.
    #[inline]
    #[must_use]
    pub fn total_objects_copied(&self) -> usize {
        self.objects_copied.load(Ordering::Relaxed)
    }

    /// Returns the number of objects freed.
    #[inline]
    #[must_use]
    pub fn total_objects_freed(&self) -> usize {
        self.objects_freed.load(Ordering::Relaxed)
    }

    /// Returns the number of objects freed by the cycle collector.
    #[inline]
    #[must_use]
    pub fn total_cycle_objects_freed(&self) -> usize {
        self.cycle_objects_freed.load(Ordering::Relaxed)
    }

    /// Returns the number of abandoned mark-grey traversals.
    #[inline]
    #[must_use]
    pub fn total_cycle_aborts(&self) -> usize {
        self.cycle_aborts.load(Ordering::Relaxed)
    }

    /// Returns the total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_time_accumulates() {
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_decrements();
        let first = timer.decrements;
        timer.start();
        timer.end_decrements();
        assert!(timer.decrements >= first);
        assert!(first >= Duration::from_millis(1));
    }

    #[test]
    fn ending_without_start_records_zero() {
        let mut timer = PhaseTimer::new();
        timer.end_release();
        assert_eq!(timer.release, Duration::ZERO);
    }

    #[test]
    fn cumulative_counters_add_up() {
        let cumulative = CumulativeMetrics::new();
        let last = GcMetrics {
            forced: true,
            objects_copied: 3,
            objects_freed: 5,
            duration: Duration::from_micros(7),
            ..GcMetrics::default()
        };
        cumulative.record(&last);
        cumulative.record(&GcMetrics::default());
        assert_eq!(cumulative.total_collections(), 2);
        assert_eq!(cumulative.total_forced_collections(), 1);
        assert_eq!(cumulative.total_objects_copied(), 3);
        assert_eq!(cumulative.total_objects_freed(), 5);
        assert_eq!(cumulative.total_pause_ns(), 7_000);
    }
}
