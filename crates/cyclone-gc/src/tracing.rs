//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collections, their phases and cycle-collector
//! increments. Without the feature every helper is a no-op.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    /// Stop-the-world phases of a collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Reset allocators, flip mark states, flush mutator buffers.
        Prepare,
        /// Trace closure from the roots.
        Closure,
        /// Deferred reference-count decrements.
        Decrements,
        /// Trial-deletion increment.
        Cycles,
        /// Sweep and release of dead memory.
        Release,
    }

    /// Create a span for the entire collection. `gc_id` is the plan's
    /// collection count.
    pub fn trace_gc_collection(plan: &str, gc_id: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", plan = plan, gc_id = gc_id).entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: GcPhase, pages_reserved: usize) {
        tracing::debug!(phase = ?phase, pages_reserved, "phase_start");
    }

    /// Log the end of a phase.
    pub fn log_phase_end(phase: GcPhase, objects: usize) {
        tracing::debug!(phase = ?phase, objects, "phase_end");
    }

    /// Log a collection request raised by `poll`.
    pub fn log_trigger(space: &str, pages_reserved: usize, total_pages: usize, forced: bool) {
        tracing::debug!(space = space, pages_reserved, total_pages, forced, "collection_triggered");
    }

    /// Log the root work one collector produced.
    pub fn log_roots(ordinal: usize, locations: usize, interior: usize, values: usize) {
        tracing::trace!(ordinal, locations, interior, values, "roots_computed");
    }

    /// Log the depth of a shared queue (verbose mode only).
    pub fn log_queue_depth(queue: &str, buffers: usize) {
        tracing::debug!(queue = queue, buffers, "queue_depth");
    }

    /// Log the summary of one trial-deletion increment.
    pub fn log_cycle_increment(
        phase: &str,
        filtered: usize,
        greyed: usize,
        freed: usize,
        complete: bool,
    ) {
        tracing::debug!(
            phase = phase,
            filtered = filtered,
            greyed = greyed,
            freed = freed,
            complete = complete,
            "cycle_increment"
        );
    }

    /// Log a mark-grey abort on time-cap expiry.
    pub fn log_cycle_abort(requeued: usize) {
        tracing::debug!(requeued, "cycle_abort");
    }

    /// Log an unrecoverable failure just before the process aborts.
    pub fn log_fatal(message: &str) {
        tracing::error!(message = message, "gc_fatal");
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) mod internal {
    /// Stub phase enum when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// See the traced variant.
        Prepare,
        /// See the traced variant.
        Closure,
        /// See the traced variant.
        Decrements,
        /// See the traced variant.
        Cycles,
        /// See the traced variant.
        Release,
    }

    /// Stub span guard.
    #[derive(Debug)]
    pub struct NoSpan;

    pub const fn trace_gc_collection(_plan: &str, _gc_id: usize) -> NoSpan {
        NoSpan
    }

    pub const fn trace_phase(_phase: GcPhase) -> NoSpan {
        NoSpan
    }

    pub const fn log_phase_start(_phase: GcPhase, _pages_reserved: usize) {}

    pub const fn log_phase_end(_phase: GcPhase, _objects: usize) {}

    pub const fn log_trigger(
        _space: &str,
        _pages_reserved: usize,
        _total_pages: usize,
        _forced: bool,
    ) {
    }

    pub const fn log_roots(_ordinal: usize, _locations: usize, _interior: usize, _values: usize) {}

    pub const fn log_queue_depth(_queue: &str, _buffers: usize) {}

    pub const fn log_cycle_increment(
        _phase: &str,
        _filtered: usize,
        _greyed: usize,
        _freed: usize,
        _complete: bool,
    ) {
    }

    pub const fn log_cycle_abort(_requeued: usize) {}

    pub const fn log_fatal(_message: &str) {}
}

pub use internal::GcPhase;
