//! Parallel transitive closure.
//!
//! Each collector thread owns a [`TraceLocal`] with local ends on three
//! shared queues: *values* (objects whose fields still need scanning),
//! *locations* (slots holding references that must be traced and
//! rewritten) and *interior* pairs (a base object plus a slot holding a
//! pointer into it). Work flows freely between collectors through the
//! shared chains; [`Termination`] decides when the closure is complete.
//!
//! Under the reference-counting plan the closure degenerates into root
//! increments: every root referent gets one counted increment, recorded in
//! the plan's new root buffer so it can be undone at the next collection.

mod termination;

pub use termination::Termination;

use std::sync::Arc;

use crate::address::{Address, ObjectReference};
use crate::config::PlanKind;
use crate::error::fatal;
use crate::plan::{Plan, SpaceKind};
use crate::policy::MarkSweepAllocator;
use crate::queue::{LocalQueue, SharedQueue};
use crate::roots::{scan_roots, RootCounts, RootSink};
use crate::tracing::internal::log_roots;

/// The three shared chains of a closure.
#[derive(Debug)]
pub struct TraceQueues {
    values: Arc<SharedQueue<ObjectReference>>,
    locations: Arc<SharedQueue<Address>>,
    interior: Arc<SharedQueue<(ObjectReference, Address)>>,
}

impl TraceQueues {
    /// Empty chains whose buffers hold `entries` entries.
    #[must_use]
    pub fn new(entries: usize) -> Self {
        Self {
            values: Arc::new(SharedQueue::new("values", entries)),
            locations: Arc::new(SharedQueue::new("locations", entries)),
            interior: Arc::new(SharedQueue::new("interior", entries)),
        }
    }

    /// Whether no chain holds a buffer.
    #[must_use]
    pub fn all_empty(&self) -> bool {
        self.values.is_empty() && self.locations.is_empty() && self.interior.is_empty()
    }

    /// The values chain.
    #[must_use]
    pub const fn values(&self) -> &Arc<SharedQueue<ObjectReference>> {
        &self.values
    }

    /// The locations chain.
    #[must_use]
    pub const fn locations(&self) -> &Arc<SharedQueue<Address>> {
        &self.locations
    }

    /// The interior chain.
    #[must_use]
    pub const fn interior(&self) -> &Arc<SharedQueue<(ObjectReference, Address)>> {
        &self.interior
    }

    /// `(name, buffers on chain, buffers ever created)` per chain.
    #[must_use]
    pub fn depths(&self) -> [(&'static str, usize, usize); 3] {
        [
            (self.values.name(), self.values.enqueued_buffers(), self.values.buffers_created()),
            (
                self.locations.name(),
                self.locations.enqueued_buffers(),
                self.locations.buffers_created(),
            ),
            (
                self.interior.name(),
                self.interior.enqueued_buffers(),
                self.interior.buffers_created(),
            ),
        ]
    }
}

/// What one collector did during a closure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    /// Roots delivered by root scanning.
    pub roots: RootCounts,
    /// Objects whose fields were scanned.
    pub scanned: usize,
    /// Nursery objects this collector copied.
    pub copied: usize,
    /// Objects this collector marked in place.
    pub marked: usize,
    /// Root increments applied.
    pub increments: usize,
}

impl std::ops::AddAssign for TraceStats {
    fn add_assign(&mut self, other: Self) {
        self.roots.locations += other.roots.locations;
        self.roots.interior += other.roots.interior;
        self.roots.values += other.roots.values;
        self.scanned += other.scanned;
        self.copied += other.copied;
        self.marked += other.marked;
        self.increments += other.increments;
    }
}

/// A collector thread's view of the closure.
pub struct TraceLocal<'a> {
    plan: &'a Plan,
    ordinal: usize,
    termination: &'a Termination,
    values: LocalQueue<ObjectReference>,
    locations: LocalQueue<Address>,
    interior: LocalQueue<(ObjectReference, Address)>,
    copy: Option<&'a mut MarkSweepAllocator>,
    root_increments: Option<LocalQueue<ObjectReference>>,
    stats: TraceStats,
}

impl std::fmt::Debug for TraceLocal<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceLocal")
            .field("ordinal", &self.ordinal)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'a> TraceLocal<'a> {
    /// Creates the trace state of collector `ordinal` (1-based). `copy`
    /// receives nursery survivors and is required by the hybrid plan.
    #[must_use]
    pub fn new(
        plan: &'a Plan,
        ordinal: usize,
        termination: &'a Termination,
        copy: Option<&'a mut MarkSweepAllocator>,
    ) -> Self {
        let queues = plan.trace_queues();
        Self {
            plan,
            ordinal,
            termination,
            values: LocalQueue::new(Arc::clone(queues.values())),
            locations: LocalQueue::new(Arc::clone(queues.locations())),
            interior: LocalQueue::new(Arc::clone(queues.interior())),
            copy,
            root_increments: plan.new_root_buffer().map(|q| LocalQueue::new(Arc::clone(q))),
            stats: TraceStats::default(),
        }
    }

    /// Enumerates this collector's share of the roots.
    pub fn compute_roots(&mut self) {
        let plan = self.plan;
        let collectors = self.termination.workers();
        let ordinal = self.ordinal;
        let counts = scan_roots(plan.globals(), plan.scheduler(), ordinal, collectors, self);
        log_roots(ordinal, counts.locations, counts.interior, counts.values);
        self.stats.roots = counts;
    }

    /// Drains all three queues, cooperating with the other collectors, until
    /// the closure is complete.
    pub fn process_all_work(&mut self) {
        loop {
            self.drain();
            self.flush();
            if !self.termination.wait_for_work(self.plan.trace_queues()) {
                return;
            }
        }
    }

    fn drain(&mut self) {
        loop {
            if let Some(slot) = self.locations.pop() {
                self.process_root_edge(slot);
            } else if let Some((base, slot)) = self.interior.pop() {
                self.process_interior_edge(base, slot);
            } else if let Some(object) = self.values.pop() {
                self.scan_object(object);
            } else {
                return;
            }
        }
    }

    fn flush(&mut self) {
        self.values.flush_local();
        self.locations.flush_local();
        self.interior.flush_local();
    }

    fn scan_object(&mut self, object: ObjectReference) {
        self.stats.scanned += 1;
        let plan = self.plan;
        plan.model().scan_object(object, &mut |slot| self.process_edge(slot));
    }

    /// Traces the reference held at `slot` and rewrites the slot if the
    /// referent moved.
    pub fn process_root_edge(&mut self, slot: Address) {
        self.process_edge(slot);
    }

    fn process_edge(&mut self, slot: Address) {
        // SAFETY: slots come from root scanning or from scanning a live object.
        let Some(object) = (unsafe { slot.load_reference() }) else {
            return;
        };
        let new = self.trace_object(object);
        if new != object {
            // SAFETY: as above; the world is stopped.
            unsafe { slot.store_reference(Some(new)) };
        }
    }

    fn process_interior_edge(&mut self, base: ObjectReference, slot: Address) {
        // SAFETY: the scheduler reported `slot` as a live stack slot.
        let interior = unsafe { slot.load_word() };
        let offset = interior - base.to_address().as_usize();
        let new = self.trace_object(base);
        // SAFETY: as above.
        unsafe { slot.store_word(new.to_address().as_usize() + offset) };
    }

    /// Traces `object`, returning its (possibly new) location. Newly reached
    /// objects are queued for scanning.
    ///
    /// Tracing an address outside every space is fatal.
    pub fn trace_object(&mut self, object: ObjectReference) -> ObjectReference {
        let plan = self.plan;
        let Some(space) = plan.space_of(object) else {
            fatal(format!("trace of {object} outside every space"), || {
                plan.dump_state()
            });
        };
        match plan.kind() {
            PlanKind::Hybrid => self.trace_marking(object, space),
            PlanKind::RefCount => {
                self.increment_root(object, space);
                object
            }
        }
    }

    fn trace_marking(&mut self, object: ObjectReference, space: SpaceKind) -> ObjectReference {
        let plan = self.plan;
        let newly_reached = match space {
            SpaceKind::Nursery => {
                let (Some(nursery), Some(copy)) = (plan.nursery(), self.copy.as_deref_mut()) else {
                    fatal("nursery object traced without a copy allocator", || {
                        plan.dump_state()
                    });
                };
                let (new, copied) =
                    nursery.forward_object(object, plan.model(), |bytes| copy.alloc_copy(bytes));
                if copied {
                    self.stats.copied += 1;
                    self.values.push(new);
                }
                return new;
            }
            SpaceKind::Mature => plan.mature().test_and_mark(object),
            SpaceKind::Large => plan.large().test_and_mark(object),
            SpaceKind::Immortal => plan.immortal().test_and_mark(object),
        };
        if newly_reached {
            self.stats.marked += 1;
            self.values.push(object);
        }
        object
    }

    fn increment_root(&mut self, object: ObjectReference, space: SpaceKind) {
        if space == SpaceKind::Immortal {
            return;
        }
        object.header().inc_ref_count();
        self.stats.increments += 1;
        if let Some(buffer) = &mut self.root_increments {
            buffer.insert(object);
        }
    }

    /// Whether `object` is at its final location for this collection.
    /// Objects outside the nursery never move; nursery objects have moved
    /// once forwarded.
    #[must_use]
    pub fn has_moved(&self, object: ObjectReference) -> bool {
        self.plan
            .nursery()
            .is_none_or(|nursery| !nursery.contains(object) || nursery.is_forwarded(object))
    }

    /// Consumes the trace state, publishing any buffered root increments.
    #[must_use]
    pub fn finish(mut self) -> TraceStats {
        self.flush();
        if let Some(buffer) = &mut self.root_increments {
            buffer.flush_local();
        }
        self.stats
    }
}

impl RootSink for TraceLocal<'_> {
    fn add_location(&mut self, slot: Address) {
        self.locations.insert(slot);
    }

    fn add_interior(&mut self, base: ObjectReference, slot: Address) {
        self.interior.insert((base, slot));
    }

    fn add_value(&mut self, object: ObjectReference) {
        if self.plan.space_of(object) == Some(SpaceKind::Nursery) {
            let plan = self.plan;
            fatal(format!("pinned root {object} lies in a moving space"), || {
                plan.dump_state()
            });
        }
        self.trace_object(object);
    }
}
