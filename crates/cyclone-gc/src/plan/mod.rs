//! Plans: space layout, mutator binding and the collection sequence.
//!
//! A [`Plan`] owns every space and the shared trace state. Two policies are
//! available (see [`PlanKind`]):
//!
//! * **Hybrid**: new objects are bump allocated in a copying nursery. Each
//!   collection traces the whole heap, evacuating nursery survivors into the
//!   mark-sweep space and marking everything else in place, then sweeps.
//! * **Reference counting**: objects live in the mark-sweep and large-object
//!   spaces and are freed when their deferred count drops to zero. Garbage
//!   cycles are left to the trial-deletion [`CycleCollector`](crate::cycle::CycleCollector).
//!
//! Both plans use a large-object space for big requests and an immortal
//! space that is never reclaimed.

mod collector;
mod mutator;
mod refcount;

pub use collector::CollectorContext;
pub use mutator::Mutator;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::address::ObjectReference;
use crate::config::{GcConfig, PlanKind};
use crate::constants::PAGES_IN_BLOCK;
use crate::cycle::CyclePhase;
use crate::error::{fatal, GcResult};
use crate::metrics::{CumulativeMetrics, GcMetrics, PhaseTimer};
use crate::object::ObjectModel;
use crate::policy::{CopySpace, ImmortalSpace, LargeObjectSpace, MarkSweepSpace};
use crate::queue::SharedQueue;
use crate::roots::{GlobalRoots, Scheduler};
use crate::space::Space;
use crate::trace::TraceQueues;
use crate::tracing::internal::{
    log_phase_end, log_phase_start, log_queue_depth, log_trigger, trace_gc_collection, trace_phase,
};
use crate::tracing::GcPhase;
use refcount::RefCountState;

/// The space an object lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Copying nursery (hybrid plan).
    Nursery,
    /// Mark-sweep space.
    Mature,
    /// Large-object space.
    Large,
    /// Immortal space.
    Immortal,
}

/// A configured collector: spaces, roots, trace queues and statistics.
pub struct Plan {
    config: GcConfig,
    model: Arc<dyn ObjectModel>,
    scheduler: Arc<dyn Scheduler>,
    nursery: Option<CopySpace>,
    mature: Arc<MarkSweepSpace>,
    large: Arc<LargeObjectSpace>,
    immortal: ImmortalSpace,
    globals: GlobalRoots,
    queues: TraceQueues,
    collectors: Mutex<Vec<CollectorContext>>,
    refcount: Option<RefCountState>,
    collection_requested: AtomicBool,
    forced_requested: AtomicBool,
    in_progress: AtomicBool,
    collection_count: AtomicUsize,
    time_cap_ns: AtomicU64,
    collect_lock: Mutex<()>,
    last: Mutex<GcMetrics>,
    cumulative: CumulativeMetrics,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("kind", &self.config.plan)
            .field("collections", &self.collection_count())
            .field("pages_reserved", &self.pages_reserved())
            .finish_non_exhaustive()
    }
}

impl Plan {
    /// Validates `config` and reserves every space.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is rejected or a reservation
    /// fails.
    pub fn new(
        config: GcConfig,
        model: Arc<dyn ObjectModel>,
        scheduler: Arc<dyn Scheduler>,
    ) -> GcResult<Arc<Self>> {
        config.validate()?;
        let nursery = match config.plan {
            PlanKind::Hybrid => Some(CopySpace::new(Space::reserve(
                "nursery",
                config.nursery_bytes,
                PAGES_IN_BLOCK,
            )?)),
            PlanKind::RefCount => None,
        };
        let mature = Arc::new(MarkSweepSpace::new(Space::reserve(
            "mature",
            config.mature_bytes,
            PAGES_IN_BLOCK,
        )?));
        let large = Arc::new(LargeObjectSpace::new(Space::reserve(
            "large",
            config.large_bytes,
            1,
        )?));
        let immortal = ImmortalSpace::new(Space::reserve(
            "immortal",
            config.immortal_bytes,
            PAGES_IN_BLOCK,
        )?);
        let collectors = (1..=config.collector_threads)
            .map(|ordinal| CollectorContext::new(ordinal, Arc::clone(&mature)))
            .collect();
        let refcount = (config.plan == PlanKind::RefCount).then(|| RefCountState::new(&config));
        let time_cap_ns = AtomicU64::new(duration_nanos(config.gc_time_cap));

        Ok(Arc::new(Self {
            globals: GlobalRoots::new(config.global_root_slots),
            queues: TraceQueues::new(config.queue_buffer_entries),
            config,
            model,
            scheduler,
            nursery,
            mature,
            large,
            immortal,
            collectors: Mutex::new(collectors),
            refcount,
            collection_requested: AtomicBool::new(false),
            forced_requested: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            collection_count: AtomicUsize::new(0),
            time_cap_ns,
            collect_lock: Mutex::new(()),
            last: Mutex::new(GcMetrics::default()),
            cumulative: CumulativeMetrics::new(),
        }))
    }

    /// Creates a mutator context bound to this plan.
    #[must_use]
    pub fn bind_mutator(self: &Arc<Self>) -> Mutator {
        Mutator::new(Arc::clone(self))
    }

    /// The configuration the plan was built with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Collection policy.
    #[must_use]
    pub const fn kind(&self) -> PlanKind {
        self.config.plan
    }

    /// The runtime's object model.
    #[must_use]
    pub fn model(&self) -> &dyn ObjectModel {
        &*self.model
    }

    /// The runtime's thread scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.scheduler
    }

    /// Global reference table, scanned as roots by every collection.
    #[must_use]
    pub const fn globals(&self) -> &GlobalRoots {
        &self.globals
    }

    /// The copying nursery (hybrid plan only).
    #[must_use]
    pub const fn nursery(&self) -> Option<&CopySpace> {
        self.nursery.as_ref()
    }

    /// The mark-sweep space.
    #[must_use]
    pub const fn mature(&self) -> &Arc<MarkSweepSpace> {
        &self.mature
    }

    /// The large-object space.
    #[must_use]
    pub const fn large(&self) -> &Arc<LargeObjectSpace> {
        &self.large
    }

    /// The immortal space.
    #[must_use]
    pub const fn immortal(&self) -> &ImmortalSpace {
        &self.immortal
    }

    pub(crate) const fn trace_queues(&self) -> &TraceQueues {
        &self.queues
    }

    pub(crate) const fn refcount(&self) -> Option<&RefCountState> {
        self.refcount.as_ref()
    }

    /// Pool that root increments are recorded in, under reference counting.
    pub(crate) fn new_root_buffer(&self) -> Option<&Arc<SharedQueue<ObjectReference>>> {
        self.refcount.as_ref().map(RefCountState::new_roots)
    }

    /// Space `object` lives in, if any.
    #[must_use]
    pub fn space_of(&self, object: ObjectReference) -> Option<SpaceKind> {
        if self.nursery.as_ref().is_some_and(|n| n.contains(object)) {
            Some(SpaceKind::Nursery)
        } else if self.mature.contains(object) {
            Some(SpaceKind::Mature)
        } else if self.large.contains(object) {
            Some(SpaceKind::Large)
        } else if self.immortal.contains(object) {
            Some(SpaceKind::Immortal)
        } else {
            None
        }
    }

    /// Whether `object` is reference counted by this plan.
    #[must_use]
    pub fn is_rc_object(&self, object: ObjectReference) -> bool {
        self.refcount.is_some()
            && matches!(self.space_of(object), Some(SpaceKind::Mature | SpaceKind::Large))
    }

    /// Whether `object` denotes memory currently handed out by one of the
    /// spaces.
    #[must_use]
    pub fn is_allocated(&self, object: ObjectReference) -> bool {
        match self.space_of(object) {
            Some(SpaceKind::Mature) => self.mature.is_allocated(object),
            Some(SpaceKind::Large) => self.large.contains_object(object),
            Some(SpaceKind::Nursery | SpaceKind::Immortal) => true,
            None => false,
        }
    }

    /// Returns a dead reference-counted object's memory to its space.
    pub(crate) fn free_object(&self, object: ObjectReference) {
        match self.space_of(object) {
            Some(SpaceKind::Mature) => self.mature.free(object),
            Some(SpaceKind::Large) => self.large.free(object),
            _ => fatal(
                format!("free of {object} outside the reference-counted spaces"),
                || self.dump_state(),
            ),
        }
    }

    /// Pages currently reserved. Under the hybrid plan nursery pages count
    /// twice: a full evacuation needs as much room again in the mature
    /// space.
    #[must_use]
    pub fn pages_reserved(&self) -> usize {
        let nursery = self.nursery.as_ref().map_or(0, |n| 2 * n.space().used_pages());
        nursery
            + self.mature.space().used_pages()
            + self.large.space().used_pages()
            + self.immortal.space().used_pages()
    }

    /// Pages left before the heap budget is exceeded.
    #[must_use]
    pub fn pages_available(&self) -> usize {
        self.config.heap_pages.saturating_sub(self.pages_reserved())
    }

    /// Collections completed or in progress.
    #[must_use]
    pub fn collection_count(&self) -> usize {
        self.collection_count.load(Ordering::Acquire)
    }

    /// Wall-clock budget of one collection. The cycle-collector increment
    /// stops once it is spent.
    #[must_use]
    pub fn gc_time_cap(&self) -> Duration {
        Duration::from_nanos(self.time_cap_ns.load(Ordering::Acquire))
    }

    /// Changes the budget of subsequent collections, for example to shorten
    /// pauses while the mutator is latency sensitive. A zero cap is raised
    /// to one nanosecond.
    pub fn set_gc_time_cap(&self, cap: Duration) {
        let nanos = duration_nanos(cap).max(1);
        self.time_cap_ns.store(nanos, Ordering::Release);
    }

    /// Checks the heap budget after an allocation from `space`. Returns
    /// `true` if a collection is now requested; the caller should reach a
    /// safepoint and let the runtime call [`Plan::collect`].
    ///
    /// Polls during a collection are ignored.
    pub fn poll(&self, must_collect: bool, space: &Space) -> bool {
        if self.in_progress.load(Ordering::Acquire) {
            return false;
        }
        let reserved = self.pages_reserved();
        if !must_collect && reserved <= self.config.heap_pages {
            return false;
        }
        if must_collect {
            self.forced_requested.store(true, Ordering::Release);
        }
        if !self.collection_requested.swap(true, Ordering::AcqRel) {
            log_trigger(space.name(), reserved, self.config.heap_pages, must_collect);
        }
        true
    }

    /// Requests a collection regardless of the heap budget.
    pub fn trigger_collection(&self) {
        self.forced_requested.store(true, Ordering::Release);
        if !self.collection_requested.swap(true, Ordering::AcqRel) {
            log_trigger("user", self.pages_reserved(), self.config.heap_pages, true);
        }
    }

    /// Whether a collection has been requested and not yet run.
    #[must_use]
    pub fn is_collection_requested(&self) -> bool {
        self.collection_requested.load(Ordering::Acquire)
    }

    /// Whether a collection is running.
    #[must_use]
    pub fn is_collection_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Makes `object` a cycle candidate now instead of waiting for a
    /// decrement. Returns `true` if it was newly buffered; acyclic, dead
    /// and uncounted objects are refused.
    pub fn enqueue_for_cycle_check(&self, object: ObjectReference) -> bool {
        let Some(rc) = &self.refcount else {
            return false;
        };
        if !self.is_rc_object(object) {
            return false;
        }
        let header = object.header();
        if header.is_green() || !header.is_live_rc() {
            return false;
        }
        header.set_color(crate::object::Color::Purple);
        if header.set_buffered() {
            rc.cycles().lock().possible_cycle_root(object);
            true
        } else {
            false
        }
    }

    /// Phase the cycle collector last stopped in (`Idle` for the hybrid
    /// plan).
    #[must_use]
    pub fn cycle_phase(&self) -> CyclePhase {
        self.refcount
            .as_ref()
            .map_or(CyclePhase::Idle, |rc| rc.cycles().lock().phase())
    }

    /// Statistics of the most recent collection.
    #[must_use]
    pub fn last_metrics(&self) -> GcMetrics {
        *self.last.lock()
    }

    /// Totals over every collection.
    #[must_use]
    pub const fn cumulative_metrics(&self) -> &CumulativeMetrics {
        &self.cumulative
    }

    /// Runs one stop-the-world collection. Every mutator bound to this plan
    /// must be stopped and passed in `mutators`.
    pub fn collect(&self, mutators: &mut [&mut Mutator]) {
        let _serial = self.collect_lock.lock();
        self.in_progress.store(true, Ordering::Release);
        let forced = self.forced_requested.swap(false, Ordering::AcqRel);
        let gc_id = self.collection_count.fetch_add(1, Ordering::AcqRel) + 1;
        let _span = trace_gc_collection(self.kind().name(), gc_id);
        let start = Instant::now();
        let mut timer = PhaseTimer::new();
        let mut metrics = GcMetrics {
            collection: gc_id,
            forced,
            pages_before: self.pages_reserved(),
            ..GcMetrics::default()
        };

        {
            let _phase = trace_phase(GcPhase::Prepare);
            log_phase_start(GcPhase::Prepare, metrics.pages_before);
            timer.start();
            for mutator in mutators.iter_mut() {
                mutator.prepare_non_participating();
            }
            self.large.prepare();
            self.immortal.prepare();
            timer.end_prepare();
            log_phase_end(GcPhase::Prepare, mutators.len());
        }

        let mut collectors = self.collectors.lock();
        let participants = self
            .scheduler
            .number_of_collector_threads()
            .min(collectors.len())
            .max(1);
        metrics.participants = participants;

        {
            let _phase = trace_phase(GcPhase::Closure);
            log_phase_start(GcPhase::Closure, self.pages_reserved());
            timer.start();
            let stats = collector::run_closure(self, &mut collectors, participants);
            timer.end_closure();
            metrics.roots = stats.roots.locations + stats.roots.interior + stats.roots.values;
            metrics.objects_scanned = stats.scanned;
            metrics.objects_copied = stats.copied;
            log_phase_end(GcPhase::Closure, stats.scanned + stats.increments);
            if self.config.verbose {
                for (queue, _, created) in self.queues.depths() {
                    log_queue_depth(queue, created);
                }
            }
        }

        if let Some(rc) = &self.refcount {
            rc.process(self, start, &mut timer, &mut metrics);
        }

        {
            let _phase = trace_phase(GcPhase::Release);
            log_phase_start(GcPhase::Release, self.pages_reserved());
            timer.start();
            for context in collectors.iter_mut() {
                context.release();
            }
            drop(collectors);
            if let Some(nursery) = &self.nursery {
                nursery.release();
            }
            match &self.refcount {
                None => {
                    let swept = self.mature.sweep();
                    let large = self.large.release();
                    metrics.objects_freed += swept.freed_cells + large;
                }
                Some(rc) => {
                    self.mature.reclaim();
                    rc.release();
                }
            }
            timer.end_release();
            log_phase_end(GcPhase::Release, metrics.objects_freed);
        }

        metrics.duration = start.elapsed();
        metrics.phases = timer;
        metrics.pages_after = self.pages_reserved();
        self.cumulative.record(&metrics);
        *self.last.lock() = metrics;
        self.collection_requested.store(false, Ordering::Release);
        self.in_progress.store(false, Ordering::Release);
    }

    /// Renders spaces and queues for diagnostics. Locks held elsewhere are
    /// skipped rather than waited on.
    #[must_use]
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "[GC] {} plan after {} collections: {} pages reserved of {}",
            self.kind(),
            self.collection_count(),
            self.pages_reserved(),
            self.config.heap_pages
        );
        let mut spaces: Vec<&Space> = Vec::with_capacity(4);
        if let Some(nursery) = &self.nursery {
            spaces.push(nursery.space());
        }
        spaces.extend([self.mature.space(), self.large.space(), self.immortal.space().as_ref()]);
        for space in spaces {
            let _ = writeln!(
                out,
                "  space {:<9} {:>8} pages used {:>8} mapped [{} .. {})",
                space.name(),
                space.used_pages(),
                space.mapped_pages(),
                space.start(),
                space.end()
            );
        }
        for (name, enqueued, created) in self.queues.depths() {
            let _ = writeln!(out, "  queue {name:<9} {enqueued:>8} buffers {created:>8} created");
        }
        if let Some(rc) = &self.refcount {
            let _ = writeln!(
                out,
                "  queue {:<9} {:>8} buffers",
                rc.decrements().name(),
                rc.decrements().enqueued_buffers()
            );
            match rc.cycles().try_lock() {
                Some(cycles) => {
                    let _ = writeln!(out, "  cycles phase {}", cycles.phase());
                    for (name, entries) in cycles.queue_depths() {
                        let _ = writeln!(out, "  cycles {name:<10} {entries:>8} entries");
                    }
                }
                None => {
                    let _ = writeln!(out, "  cycles (busy)");
                }
            }
        }
        out
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
