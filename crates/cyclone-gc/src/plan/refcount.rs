//! Deferred reference counting.
//!
//! Mutators count heap references eagerly through the write barrier but
//! defer every decrement to the next collection. Stack and global roots are
//! not counted by the barrier: each collection increments every root
//! referent once and undoes those increments at the following collection.
//! A newly allocated object starts with a count of one and a buffered
//! decrement, so an object that never escapes is freed at the next
//! collection.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::address::ObjectReference;
use crate::config::GcConfig;
use crate::cycle::{CycleCollector, CycleSettings, Progress, RefCountHeap};
use crate::error::fatal;
use crate::metrics::{GcMetrics, PhaseTimer};
use crate::object::Color;
use crate::plan::Plan;
use crate::queue::SharedQueue;
use crate::tracing::internal::{log_phase_end, log_phase_start, log_queue_depth, trace_phase};
use crate::tracing::GcPhase;

/// Counters of one decrement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DecrementStats {
    pub applied: usize,
    pub freed: usize,
}

/// Reference-counting state owned by a [`Plan`].
#[derive(Debug)]
pub(crate) struct RefCountState {
    decrements: Arc<SharedQueue<ObjectReference>>,
    new_roots: Arc<SharedQueue<ObjectReference>>,
    old_roots: Mutex<Vec<ObjectReference>>,
    cycles: Mutex<CycleCollector>,
}

impl RefCountState {
    pub(crate) fn new(config: &GcConfig) -> Self {
        let entries = config.queue_buffer_entries;
        Self {
            decrements: Arc::new(SharedQueue::new("decrements", entries)),
            new_roots: Arc::new(SharedQueue::new("new-roots", entries)),
            old_roots: Mutex::new(Vec::new()),
            cycles: Mutex::new(CycleCollector::new(CycleSettings::from_config(config))),
        }
    }

    /// Pool the mutators' decrement buffers drain into.
    pub(crate) const fn decrements(&self) -> &Arc<SharedQueue<ObjectReference>> {
        &self.decrements
    }

    /// Pool the collectors' root increments drain into.
    pub(crate) const fn new_roots(&self) -> &Arc<SharedQueue<ObjectReference>> {
        &self.new_roots
    }

    pub(crate) const fn cycles(&self) -> &Mutex<CycleCollector> {
        &self.cycles
    }

    /// Applies the buffered decrements and runs one cycle-collector
    /// increment, bounded by `start` plus the configured time cap.
    pub(crate) fn process(
        &self,
        plan: &Plan,
        start: Instant,
        timer: &mut PhaseTimer,
        metrics: &mut GcMetrics,
    ) {
        let mut cycles = self.cycles.lock();

        {
            let _phase = trace_phase(GcPhase::Decrements);
            log_phase_start(GcPhase::Decrements, plan.pages_reserved());
            timer.start();
            let mut work = std::mem::take(&mut *self.old_roots.lock());
            work.extend(self.decrements.drain());
            let stats = apply_decrements(plan, &mut cycles, &mut work);
            timer.end_decrements();
            metrics.decrements += stats.applied;
            metrics.objects_freed += stats.freed;
            log_phase_end(GcPhase::Decrements, stats.freed);
        }

        let mut deferred = {
            let _phase = trace_phase(GcPhase::Cycles);
            log_phase_start(GcPhase::Cycles, plan.pages_reserved());
            timer.start();
            let mut heap = RcHeap::new(plan);
            let cap = plan.gc_time_cap();
            cycles.set_time_cap(cap);
            let progress = cycles.run_until(&mut heap, start + cap);
            timer.end_cycles();
            metrics.cycles = cycles.last_stats();
            metrics.cycle_progress = Some(progress);
            metrics.objects_freed += heap.freed;
            log_phase_end(GcPhase::Cycles, heap.freed);
            if progress == Progress::Partial && plan.config().verbose {
                for (queue, entries) in cycles.queue_depths() {
                    log_queue_depth(queue, entries);
                }
            }
            heap.deferred
        };

        // Decrements of acyclic children released by cycle collection.
        timer.start();
        let stats = apply_decrements(plan, &mut cycles, &mut deferred);
        timer.end_decrements();
        metrics.decrements += stats.applied;
        metrics.objects_freed += stats.freed;
    }

    /// Retires this collection's root increments: they are undone at the
    /// next collection.
    pub(crate) fn release(&self) {
        *self.old_roots.lock() = self.new_roots.drain();
    }
}

/// Applies every decrement in `work`, cascading through objects whose count
/// reaches zero.
///
/// An object at zero is freed unless it sits in a cycle-candidate queue; the
/// cycle collector frees buffered objects when it filters them. An object
/// that survives a decrement becomes a purple candidate unless it is
/// acyclic. A count underflow is fatal.
pub(crate) fn apply_decrements(
    plan: &Plan,
    cycles: &mut CycleCollector,
    work: &mut Vec<ObjectReference>,
) -> DecrementStats {
    let mut stats = DecrementStats::default();
    while let Some(object) = work.pop() {
        if !plan.is_rc_object(object) {
            continue;
        }
        stats.applied += 1;
        let header = object.header();
        match header.dec_ref_count() {
            None => fatal(format!("reference count underflow on {object}"), || {
                plan.dump_state()
            }),
            Some(0) => {
                plan.model().enumerate_references(object, &mut |child| work.push(child));
                header.set_color(Color::Black);
                if !header.is_buffered() {
                    plan.free_object(object);
                    stats.freed += 1;
                }
            }
            Some(_) => {
                if !header.is_green() {
                    header.set_color(Color::Purple);
                    if header.set_buffered() {
                        cycles.possible_cycle_root(object);
                    }
                }
            }
        }
    }
    stats
}

/// The plan as seen by the cycle collector.
struct RcHeap<'a> {
    plan: &'a Plan,
    deferred: Vec<ObjectReference>,
    freed: usize,
}

impl<'a> RcHeap<'a> {
    const fn new(plan: &'a Plan) -> Self {
        Self {
            plan,
            deferred: Vec::new(),
            freed: 0,
        }
    }
}

impl RefCountHeap for RcHeap<'_> {
    fn is_rc_object(&self, object: ObjectReference) -> bool {
        self.plan.is_rc_object(object)
    }

    fn enumerate(&self, object: ObjectReference, visitor: &mut dyn FnMut(ObjectReference)) {
        self.plan.model().enumerate_references(object, visitor);
    }

    fn free(&mut self, object: ObjectReference) {
        self.plan.free_object(object);
        self.freed += 1;
    }

    fn defer_decrement(&mut self, object: ObjectReference) {
        self.deferred.push(object);
    }

    fn pages_available(&self) -> usize {
        self.plan.pages_available()
    }

    fn collection_count(&self) -> usize {
        self.plan.collection_count()
    }
}
