//! Trial-deletion cycle collection.
//!
//! Reference counting alone cannot reclaim garbage cycles. Objects whose
//! count dropped without reaching zero are *purple* candidates. The
//! collector periodically assumes a candidate is dead, subtracts the counts
//! contributed by its subgraph (mark grey), gives counts back to anything
//! still referenced from outside (scan black), and frees what stays at zero
//! (white).
//!
//! Candidates flow through three FIFO queues: new candidates land in the
//! unfiltered queue, filtering moves survivors to the mature queue, and a
//! bounded batch of mature candidates becomes the filtered queue that mark
//! grey consumes. Everything is time-capped; an abandoned traversal is
//! rolled back and its root goes back to the mature queue.

mod phase;

pub use phase::{should_act, CyclePhase, Progress};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address::ObjectReference;
use crate::config::GcConfig;
use crate::error::fatal;
use crate::object::Color;
use crate::queue::{LocalQueue, SharedQueue};
use crate::tracing::internal::{log_cycle_abort, log_cycle_increment};

/// Filtering may use this fraction of the remaining budget.
const FILTER_TIME_FRACTION: u32 = 3;
/// Detection rounds continue while more than this fraction of the cap
/// remains.
const CYCLE_TIME_FRACTION: u32 = 6;
/// One mark-grey pass may use this fraction of the remaining budget.
const MARK_GREY_TIME_FRACTION: u32 = 2;

/// Heap services the cycle collector needs.
pub trait RefCountHeap {
    /// Whether `object` is reference counted (immortal objects are not).
    fn is_rc_object(&self, object: ObjectReference) -> bool;

    /// Calls `visitor` with every non-null reference held by `object`.
    fn enumerate(&self, object: ObjectReference, visitor: &mut dyn FnMut(ObjectReference));

    /// Returns `object`'s memory to its space.
    fn free(&mut self, object: ObjectReference);

    /// Queues a decrement of `object`, applied after the increment.
    fn defer_decrement(&mut self, object: ObjectReference);

    /// Pages left before the heap budget is reached.
    fn pages_available(&self) -> usize;

    /// Number of collections so far.
    fn collection_count(&self) -> usize;
}

/// Tuning of the cycle collector.
#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    /// Budget of one collection.
    pub time_cap: Duration,
    /// Headroom below which filtering always runs.
    pub filter_pages: usize,
    /// Headroom below which detection always runs.
    pub detection_pages: usize,
    /// Maximum candidates moved by one filter pass.
    pub filter_limit: usize,
    /// Mark grey checks the clock every this many visits.
    pub grey_visit_grain: usize,
    /// Visits between deadline checks of the mark-grey driver.
    pub grey_visit_bound: usize,
    /// Candidates filtered between deadline checks.
    pub filter_bound: usize,
    /// Entries per queue buffer.
    pub buffer_entries: usize,
}

impl CycleSettings {
    /// Settings derived from a plan configuration.
    #[must_use]
    pub const fn from_config(config: &GcConfig) -> Self {
        Self {
            time_cap: config.gc_time_cap,
            filter_pages: config.cycle_filter_pages,
            detection_pages: config.cycle_detection_pages,
            filter_limit: config.purple_filter_limit(),
            grey_visit_grain: config.grey_visit_grain,
            grey_visit_bound: config.grey_visit_bound,
            filter_bound: config.filter_bound,
            buffer_entries: config.queue_buffer_entries,
        }
    }
}

/// Counters of the most recent increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Candidates examined by the filters.
    pub filtered: usize,
    /// Objects visited by mark grey.
    pub greyed: usize,
    /// Objects freed.
    pub freed: usize,
    /// Candidates put back after an abandoned traversal.
    pub requeued: usize,
    /// Whether detection ran.
    pub detected: bool,
}

fn purple_queue(name: &'static str, entries: usize) -> LocalQueue<ObjectReference> {
    LocalQueue::new(Arc::new(SharedQueue::new(name, entries)))
}

/// Resumable trial-deletion collector. Lives in the plan between
/// collections; only one thread drives it at a time.
#[derive(Debug)]
pub struct CycleCollector {
    settings: CycleSettings,
    unfiltered: LocalQueue<ObjectReference>,
    mature: LocalQueue<ObjectReference>,
    filtered: LocalQueue<ObjectReference>,
    cycle_a: LocalQueue<ObjectReference>,
    cycle_b: LocalQueue<ObjectReference>,
    work: Vec<ObjectReference>,
    black: Vec<ObjectReference>,
    free: Vec<ObjectReference>,
    children: Vec<ObjectReference>,
    phase: CyclePhase,
    visits: usize,
    stats: CycleStats,
}

impl CycleCollector {
    /// Creates a collector with empty queues.
    #[must_use]
    pub fn new(settings: CycleSettings) -> Self {
        let entries = settings.buffer_entries;
        Self {
            settings,
            unfiltered: purple_queue("unfiltered purple", entries),
            mature: purple_queue("mature purple", entries),
            filtered: purple_queue("filtered purple", entries),
            cycle_a: purple_queue("cycle A", entries),
            cycle_b: purple_queue("cycle B", entries),
            work: Vec::new(),
            black: Vec::new(),
            free: Vec::new(),
            children: Vec::new(),
            phase: CyclePhase::Idle,
            visits: 0,
            stats: CycleStats::default(),
        }
    }

    /// Queues a new purple candidate. The caller has set its purple color
    /// and buffered bit.
    pub fn possible_cycle_root(&mut self, object: ObjectReference) {
        debug_assert!(object.header().is_buffered());
        self.unfiltered.insert(object);
    }

    /// Changes the budget later increments are measured against.
    pub fn set_time_cap(&mut self, cap: Duration) {
        self.settings.time_cap = cap;
    }

    /// Current phase; [`CyclePhase::Idle`] between increments.
    #[must_use]
    pub const fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Counters of the last increment.
    #[must_use]
    pub const fn last_stats(&self) -> CycleStats {
        self.stats
    }

    /// Whether any candidate is waiting.
    #[must_use]
    pub fn has_candidates(&self) -> bool {
        !(self.unfiltered.is_empty() && self.mature.is_empty() && self.filtered.is_empty())
    }

    /// Depths of the unfiltered, mature and filtered queues in entries.
    #[must_use]
    pub fn queue_depths(&self) -> [(&'static str, usize); 3] {
        [&self.unfiltered, &self.mature, &self.filtered]
            .map(|q| (q.shared().name(), q.len()))
    }

    /// Runs one increment, stopping by `deadline` (the end of the current
    /// collection's budget).
    pub fn run_until(&mut self, heap: &mut dyn RefCountHeap, deadline: Instant) -> Progress {
        self.stats = CycleStats::default();
        let count = heap.collection_count();
        let available = heap.pages_available();
        let cap = self.settings.time_cap;
        let mut aborted = false;

        if should_act(available, self.settings.filter_pages, count) {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining > cap / FILTER_TIME_FRACTION {
                self.phase = CyclePhase::Filter;
                self.stats.filtered += filter_queue(
                    &mut self.unfiltered,
                    &mut self.mature,
                    &mut self.free,
                    &self.settings,
                    now + remaining / FILTER_TIME_FRACTION,
                );
                self.process_free(heap);

                if should_act(available, self.settings.detection_pages, count) {
                    self.stats.detected = true;
                    while !aborted
                        && !self.mature.is_empty()
                        && deadline.saturating_duration_since(Instant::now())
                            > cap / CYCLE_TIME_FRACTION
                    {
                        aborted = self.collect_some_cycles(heap, deadline);
                    }
                    while let Some(object) = self.filtered.pop() {
                        self.mature.push(object);
                    }
                }
            }
        }

        let progress = if aborted || self.has_candidates() {
            Progress::Partial
        } else {
            Progress::Complete
        };
        if aborted {
            log_cycle_abort(self.stats.requeued);
        }
        log_cycle_increment(
            self.phase.name(),
            self.stats.filtered,
            self.stats.greyed,
            self.stats.freed,
            progress == Progress::Complete,
        );
        self.phase = CyclePhase::Idle;
        progress
    }

    /// One detection round. Returns `true` if mark grey was abandoned.
    fn collect_some_cycles(&mut self, heap: &mut dyn RefCountHeap, deadline: Instant) -> bool {
        self.phase = CyclePhase::MatureFilter;
        if self.filtered.is_empty() {
            self.stats.filtered += filter_queue(
                &mut self.mature,
                &mut self.filtered,
                &mut self.free,
                &self.settings,
                Instant::now(),
            );
        }

        self.phase = CyclePhase::MarkGrey;
        let start = Instant::now();
        let target = start + deadline.saturating_duration_since(start) / MARK_GREY_TIME_FRACTION;
        let aborted = self.mark_grey_phase(heap, target);

        self.phase = CyclePhase::Scan;
        while let Some(object) = self.cycle_a.pop() {
            self.scan(heap, object);
            self.cycle_b.push(object);
        }

        self.phase = CyclePhase::Collect;
        while let Some(object) = self.cycle_b.pop() {
            object.header().clear_buffered();
            self.collect_white(heap, object);
        }

        self.phase = CyclePhase::Free;
        self.process_free(heap);
        aborted
    }

    fn process_free(&mut self, heap: &mut dyn RefCountHeap) {
        while let Some(object) = self.free.pop() {
            heap.free(object);
            self.stats.freed += 1;
        }
    }

    /// Greys filtered candidates until the queue empties, `until` passes,
    /// or a traversal is abandoned. Returns `true` on abandonment.
    fn mark_grey_phase(&mut self, heap: &mut dyn RefCountHeap, until: Instant) -> bool {
        loop {
            self.visits = 0;
            while self.visits < self.settings.grey_visit_bound {
                let Some(object) = self.filtered.pop() else {
                    return false;
                };
                if !self.process_grey_object(heap, object, until) {
                    self.mature.insert(object);
                    self.stats.requeued += 1;
                    return true;
                }
            }
            if Instant::now() >= until {
                return false;
            }
        }
    }

    /// Returns `false` if greying `object` ran out of time; the traversal
    /// has then been undone and `object` is still buffered.
    fn process_grey_object(
        &mut self,
        heap: &mut dyn RefCountHeap,
        object: ObjectReference,
        until: Instant,
    ) -> bool {
        let header = object.header();
        if header.color() == Color::Purple && header.is_live_rc() {
            if !self.mark_grey(heap, object, until) {
                self.scan_black(heap, object);
                // Requeued roots must still pass the mature filter.
                header.set_color(Color::Purple);
                return false;
            }
            self.cycle_a.push(object);
        } else {
            header.clear_buffered();
            // Grey and white objects are settled by scan and collect.
            if !header.is_live_rc() && !matches!(header.color(), Color::Grey | Color::White) {
                self.free.push(object);
            }
        }
        true
    }

    /// Greys the subgraph of `object`, decrementing every internal edge.
    /// Returns `false` if the deadline passed mid-way.
    fn mark_grey(
        &mut self,
        heap: &dyn RefCountHeap,
        object: ObjectReference,
        until: Instant,
    ) -> bool {
        debug_assert!(self.work.is_empty());
        let mut aborted = false;
        let mut next = Some(object);
        while let Some(current) = next {
            self.visits += 1;
            self.stats.greyed += 1;
            if self.visits % self.settings.grey_visit_grain == 0 && Instant::now() > until {
                aborted = true;
            }
            let header = current.header();
            if !aborted && header.color() != Color::Grey {
                header.set_color(Color::Grey);
                self.load_children(heap, current);
                for child in self.children.drain(..) {
                    if heap.is_rc_object(child) && !child.header().is_green() {
                        if child.header().dec_ref_count().is_none() {
                            fatal(
                                format!("reference count underflow on {child} during mark grey"),
                                String::new,
                            );
                        }
                        self.work.push(child);
                    }
                }
            }
            next = self.work.pop();
        }
        !aborted
    }

    fn scan(&mut self, heap: &dyn RefCountHeap, object: ObjectReference) {
        debug_assert!(self.work.is_empty());
        let mut next = Some(object);
        while let Some(current) = next {
            let header = current.header();
            if header.color() == Color::Grey {
                if header.is_live_rc() {
                    self.scan_black(heap, current);
                } else {
                    header.set_color(Color::White);
                    self.load_children(heap, current);
                    for child in self.children.drain(..) {
                        if heap.is_rc_object(child) && !child.header().is_green() {
                            self.work.push(child);
                        }
                    }
                }
            }
            next = self.work.pop();
        }
    }

    /// Re-blackens the grey or white subgraph of `object`, restoring the
    /// counts mark grey removed.
    fn scan_black(&mut self, heap: &dyn RefCountHeap, object: ObjectReference) {
        debug_assert!(self.black.is_empty());
        let mut next = Some(object);
        while let Some(current) = next {
            let header = current.header();
            if matches!(header.color(), Color::Grey | Color::White) {
                header.set_color(Color::Black);
                self.load_children(heap, current);
                for child in self.children.drain(..) {
                    if heap.is_rc_object(child) && !child.header().is_green() {
                        child.header().inc_ref_count();
                        if matches!(child.header().color(), Color::Grey | Color::White) {
                            self.black.push(child);
                        }
                    }
                }
            }
            next = self.black.pop();
        }
    }

    /// Frees the white subgraph of `object`. A white object still sitting
    /// in a candidate queue is blackened and its children are collected,
    /// but the object itself is left for the filter to free.
    fn collect_white(&mut self, heap: &mut dyn RefCountHeap, object: ObjectReference) {
        debug_assert!(self.work.is_empty());
        let mut next = Some(object);
        while let Some(current) = next {
            let header = current.header();
            if header.color() == Color::White {
                header.set_color(Color::Black);
                self.load_children(heap, current);
                for child in self.children.drain(..) {
                    if !heap.is_rc_object(child) {
                        continue;
                    }
                    if child.header().is_green() {
                        heap.defer_decrement(child);
                    } else {
                        self.work.push(child);
                    }
                }
                if !header.is_buffered() {
                    self.free.push(current);
                }
            }
            next = self.work.pop();
        }
    }

    fn load_children(&mut self, heap: &dyn RefCountHeap, object: ObjectReference) {
        self.children.clear();
        let children = &mut self.children;
        heap.enumerate(object, &mut |child| children.push(child));
    }
}

/// Moves live purple entries of `src` to `tgt`, drops non-purple ones and
/// sends dead ones to `free`. Works in batches of `filter_bound` until `src`
/// is empty, `until` passes, or the pass limit is reached.
fn filter_queue(
    src: &mut LocalQueue<ObjectReference>,
    tgt: &mut LocalQueue<ObjectReference>,
    free: &mut Vec<ObjectReference>,
    settings: &CycleSettings,
    until: Instant,
) -> usize {
    let mut filtered = 0;
    loop {
        let mut batch = 0;
        let mut exhausted = false;
        while batch < settings.filter_bound {
            let Some(object) = src.pop() else {
                exhausted = true;
                break;
            };
            debug_assert!(!object.header().is_green());
            let header = object.header();
            if !header.is_live_rc() {
                header.clear_buffered();
                free.push(object);
            } else if header.color() == Color::Purple {
                tgt.insert(object);
            } else {
                header.clear_buffered();
            }
            batch += 1;
        }
        filtered += batch;
        if exhausted || Instant::now() >= until || filtered >= settings.filter_limit {
            return filtered;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::object::initial_status;

    /// Status word, two reference slots.
    type Node = Box<[usize; 3]>;

    #[derive(Default)]
    struct FakeHeap {
        nodes: Vec<Node>,
        freed: Vec<ObjectReference>,
        deferred: Vec<ObjectReference>,
    }

    impl FakeHeap {
        fn node(&mut self, color: Color, rc: usize) -> ObjectReference {
            let mut node: Node = Box::new([initial_status(false, color, rc), 0, 0]);
            let address = Address::from_ptr(node.as_mut_ptr());
            let object = ObjectReference::from_address(address).unwrap();
            self.nodes.push(node);
            object
        }

        fn link(&self, from: ObjectReference, slot: usize, to: ObjectReference) {
            // SAFETY: slots 1 and 2 lie inside the node.
            unsafe {
                from.to_address()
                    .plus((slot + 1) * crate::constants::BYTES_IN_WORD)
                    .store_reference(Some(to));
            }
        }
    }

    impl RefCountHeap for FakeHeap {
        fn is_rc_object(&self, _object: ObjectReference) -> bool {
            true
        }

        fn enumerate(&self, object: ObjectReference, visitor: &mut dyn FnMut(ObjectReference)) {
            for slot in 1..3 {
                let addr = object.to_address().plus(slot * crate::constants::BYTES_IN_WORD);
                // SAFETY: as in `link`.
                if let Some(child) = unsafe { addr.load_reference() } {
                    visitor(child);
                }
            }
        }

        fn free(&mut self, object: ObjectReference) {
            assert!(!self.freed.contains(&object), "double free");
            self.freed.push(object);
        }

        fn defer_decrement(&mut self, object: ObjectReference) {
            self.deferred.push(object);
        }

        fn pages_available(&self) -> usize {
            1
        }

        fn collection_count(&self) -> usize {
            0
        }
    }

    fn settings() -> CycleSettings {
        CycleSettings {
            time_cap: Duration::from_secs(5),
            filter_pages: 0,
            detection_pages: 0,
            filter_limit: 1024,
            grey_visit_grain: 100,
            grey_visit_bound: 10,
            filter_bound: 8192,
            buffer_entries: 16,
        }
    }

    fn candidate(cc: &mut CycleCollector, object: ObjectReference) {
        object.header().set_color(Color::Purple);
        assert!(object.header().set_buffered());
        cc.possible_cycle_root(object);
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn unreferenced_cycle_is_freed() {
        let mut heap = FakeHeap::default();
        let a = heap.node(Color::Black, 1);
        let b = heap.node(Color::Black, 1);
        heap.link(a, 0, b);
        heap.link(b, 0, a);

        let mut cc = CycleCollector::new(settings());
        candidate(&mut cc, a);
        candidate(&mut cc, b);
        assert_eq!(cc.run_until(&mut heap, deadline()), Progress::Complete);

        assert_eq!(heap.freed.len(), 2);
        assert!(heap.freed.contains(&a) && heap.freed.contains(&b));
        assert_eq!(cc.last_stats().freed, 2);
        assert_eq!(cc.phase(), CyclePhase::Idle);
    }

    #[test]
    fn externally_referenced_cycle_survives() {
        let mut heap = FakeHeap::default();
        let a = heap.node(Color::Black, 2);
        let b = heap.node(Color::Black, 1);
        heap.link(a, 0, b);
        heap.link(b, 0, a);

        let mut cc = CycleCollector::new(settings());
        candidate(&mut cc, a);
        candidate(&mut cc, b);
        cc.run_until(&mut heap, deadline());

        assert!(heap.freed.is_empty());
        assert_eq!(a.header().ref_count(), 2);
        assert_eq!(b.header().ref_count(), 1);
        for object in [a, b] {
            assert_eq!(object.header().color(), Color::Black);
            assert!(!object.header().is_buffered());
        }
        assert!(!cc.has_candidates());
    }

    #[test]
    fn dead_candidates_are_freed_by_the_filter() {
        let mut heap = FakeHeap::default();
        let dead = heap.node(Color::Black, 0);
        let live = heap.node(Color::Black, 1);
        let mut cc = CycleCollector::new(settings());
        candidate(&mut cc, dead);
        candidate(&mut cc, live);
        live.header().set_color(Color::Black);

        cc.run_until(&mut heap, deadline());
        assert_eq!(heap.freed, vec![dead]);
        assert!(!dead.header().is_buffered());
        assert!(!live.header().is_buffered());
    }

    #[test]
    fn green_children_of_garbage_are_deferred() {
        let mut heap = FakeHeap::default();
        let a = heap.node(Color::Black, 1);
        let b = heap.node(Color::Black, 1);
        let leaf = heap.node(Color::Green, 1);
        heap.link(a, 0, b);
        heap.link(b, 0, a);
        heap.link(a, 1, leaf);

        let mut cc = CycleCollector::new(settings());
        candidate(&mut cc, a);
        cc.run_until(&mut heap, deadline());

        assert_eq!(heap.deferred, vec![leaf]);
        assert_eq!(leaf.header().ref_count(), 1, "green objects are never trial-decremented");
        assert_eq!(heap.freed.len(), 2);
    }

    #[test]
    fn children_of_a_buffered_white_object_are_collected() {
        let mut heap = FakeHeap::default();
        let a = heap.node(Color::Black, 1);
        let w = heap.node(Color::Black, 1);
        let x = heap.node(Color::Black, 1);
        heap.link(a, 0, w);
        heap.link(w, 0, a);
        heap.link(w, 1, x);

        // One candidate per filter pass: `w` waits in the unfiltered queue
        // while the traversal from `a` whitens it.
        let mut cc = CycleCollector::new(CycleSettings {
            filter_limit: 1,
            filter_bound: 1,
            ..settings()
        });
        candidate(&mut cc, a);
        candidate(&mut cc, w);
        assert_eq!(cc.run_until(&mut heap, deadline()), Progress::Partial);
        assert!(heap.freed.contains(&a) && heap.freed.contains(&x));
        assert!(!heap.freed.contains(&w));
        assert!(w.header().is_buffered());
        assert_eq!(x.header().color(), Color::Black);

        assert_eq!(cc.run_until(&mut heap, deadline()), Progress::Complete);
        assert_eq!(heap.freed.len(), 3);
        assert!(heap.freed.contains(&w));
        assert!(!w.header().is_buffered());
    }

    #[test]
    fn mark_grey_twice_does_not_decrement_again() {
        let mut heap = FakeHeap::default();
        let a = heap.node(Color::Purple, 1);
        let b = heap.node(Color::Black, 2);
        heap.link(a, 0, b);

        let mut cc = CycleCollector::new(settings());
        assert!(cc.mark_grey(&heap, a, deadline()));
        assert_eq!(b.header().ref_count(), 1);
        assert_eq!(a.header().color(), Color::Grey);

        assert!(cc.mark_grey(&heap, a, deadline()));
        assert_eq!(b.header().ref_count(), 1);
    }

    #[test]
    fn abandoned_traversal_restores_counts_and_requeues() {
        let mut heap = FakeHeap::default();
        let a = heap.node(Color::Black, 1);
        let b = heap.node(Color::Black, 1);
        let c = heap.node(Color::Black, 1);
        heap.link(a, 0, b);
        heap.link(b, 0, c);
        heap.link(c, 0, a);

        let mut cc = CycleCollector::new(CycleSettings {
            grey_visit_grain: 2,
            ..settings()
        });
        a.header().set_color(Color::Purple);
        a.header().set_buffered();
        cc.filtered.insert(a);

        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(cc.mark_grey_phase(&mut heap, past));

        for object in [a, b, c] {
            assert_eq!(object.header().ref_count(), 1, "{object}");
            assert_ne!(object.header().color(), Color::Grey);
        }
        assert!(a.header().is_buffered());
        assert_eq!(a.header().color(), Color::Purple);
        assert_eq!(cc.mature.pop(), Some(a));
        assert_eq!(cc.last_stats().requeued, 1);
        assert!(heap.freed.is_empty());
    }
}
