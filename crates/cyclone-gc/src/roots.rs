//! Root enumeration.
//!
//! Roots come from two places: the plan's global reference table, split
//! evenly across collectors, and the stacks of mutator threads as reported
//! by the runtime's [`Scheduler`], dealt out round-robin.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::{Address, ObjectReference};

/// Slice of the global table scanned by collector `ordinal` (1-based) out
/// of `collectors`.
///
/// Every collector but the last gets the same even-sized chunk; the last
/// takes the remainder.
#[must_use]
pub fn partition(refs: usize, collectors: usize, ordinal: usize) -> Range<usize> {
    debug_assert!((1..=collectors).contains(&ordinal));
    let chunk = (refs / collectors) & !1;
    let start = (ordinal - 1) * chunk;
    let end = if ordinal == collectors { refs } else { ordinal * chunk };
    start..end
}

/// Fixed-capacity table of global reference slots.
///
/// The runtime stores references here; collectors treat each slot as a
/// root location and rewrite it when its referent moves.
#[derive(Debug)]
pub struct GlobalRoots {
    slots: Box<[AtomicUsize]>,
}

impl GlobalRoots {
    /// Creates a table of `capacity` null slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reference held in slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ObjectReference> {
        ObjectReference::from_address(Address::from_usize(
            self.slots[index].load(Ordering::Acquire),
        ))
    }

    /// Stores `value` in slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&self, index: usize, value: Option<ObjectReference>) {
        let raw = value.map_or(0, |r| r.to_address().as_usize());
        self.slots[index].store(raw, Ordering::Release);
    }

    /// Address of slot `index`, as handed to the tracer.
    #[must_use]
    pub fn slot_address(&self, index: usize) -> Address {
        Address::from_ptr(std::ptr::from_ref(&self.slots[index]))
    }

    /// Iterates the non-null entries.
    pub fn iter(&self) -> impl Iterator<Item = ObjectReference> + '_ {
        (0..self.capacity()).filter_map(|i| self.get(i))
    }
}

/// Handle of a mutator thread known to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub usize);

/// One root found on a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackRoot {
    /// A stack slot holding a reference; rewritten if the referent moves.
    Location(Address),
    /// A stack slot holding a pointer into the middle of `base`.
    Interior {
        /// Object the interior pointer points into.
        base: ObjectReference,
        /// Slot holding the interior pointer.
        slot: Address,
    },
    /// A reference that cannot be rewritten. Its referent must not live in
    /// a moving space.
    Value(ObjectReference),
}

/// Thread services the runtime provides to the collector.
pub trait Scheduler: Send + Sync {
    /// Mutator threads whose stacks hold roots.
    fn enumerate_threads(&self) -> Vec<ThreadHandle>;

    /// Roots on `thread`'s stack. Only called while the world is stopped.
    fn stack_roots_of(&self, thread: ThreadHandle) -> Vec<StackRoot>;

    /// How many collector threads may take part in a collection.
    fn number_of_collector_threads(&self) -> usize;

    /// Position of `thread` in the round-robin order used to spread stacks
    /// over collectors, starting at 1.
    fn collector_ordinal(&self, thread: ThreadHandle) -> usize {
        thread.0 + 1
    }
}

/// Receives roots as a collector enumerates them.
pub trait RootSink {
    /// A slot holding a reference.
    fn add_location(&mut self, slot: Address);
    /// A slot holding an interior pointer into `base`.
    fn add_interior(&mut self, base: ObjectReference, slot: Address);
    /// A pinned reference.
    fn add_value(&mut self, object: ObjectReference);
}

/// Counts of roots delivered by one [`scan_roots`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootCounts {
    /// Location roots, global slots included.
    pub locations: usize,
    /// Interior roots.
    pub interior: usize,
    /// Value roots.
    pub values: usize,
}

/// Delivers collector `ordinal`'s share of the roots to `sink`.
pub fn scan_roots(
    globals: &GlobalRoots,
    scheduler: &dyn Scheduler,
    ordinal: usize,
    collectors: usize,
    sink: &mut dyn RootSink,
) -> RootCounts {
    let mut counts = RootCounts::default();
    for index in partition(globals.capacity(), collectors, ordinal) {
        sink.add_location(globals.slot_address(index));
        counts.locations += 1;
    }
    for thread in scheduler.enumerate_threads() {
        if (scheduler.collector_ordinal(thread) - 1) % collectors + 1 != ordinal {
            continue;
        }
        for root in scheduler.stack_roots_of(thread) {
            match root {
                StackRoot::Location(slot) => {
                    sink.add_location(slot);
                    counts.locations += 1;
                }
                StackRoot::Interior { base, slot } => {
                    sink.add_interior(base, slot);
                    counts.interior += 1;
                }
                StackRoot::Value(object) => {
                    sink.add_value(object);
                    counts.values += 1;
                }
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_every_slot_once() {
        for refs in [0, 1, 2, 7, 100, 1023, 1024] {
            for collectors in 1..=6 {
                let mut next = 0;
                for ordinal in 1..=collectors {
                    let range = partition(refs, collectors, ordinal);
                    assert_eq!(range.start, next, "refs={refs} n={collectors}");
                    if ordinal < collectors {
                        assert_eq!(range.len() % 2, 0);
                    }
                    next = range.end;
                }
                assert_eq!(next, refs);
            }
        }
    }

    #[test]
    fn partition_chunks_are_even() {
        assert_eq!(partition(10, 3, 1), 0..2);
        assert_eq!(partition(10, 3, 2), 2..4);
        assert_eq!(partition(10, 3, 3), 4..10);
    }

    #[test]
    fn global_slots_round_trip() {
        let globals = GlobalRoots::new(4);
        let object = ObjectReference::from_address(Address::from_usize(0x1000)).unwrap();
        globals.set(2, Some(object));
        assert_eq!(globals.get(2), Some(object));
        // SAFETY: the slot is a live atomic in `globals`.
        assert_eq!(unsafe { globals.slot_address(2).load_reference() }, Some(object));
        assert_eq!(globals.iter().count(), 1);
    }

    struct Recorder(Vec<StackRoot>);

    impl RootSink for Recorder {
        fn add_location(&mut self, slot: Address) {
            self.0.push(StackRoot::Location(slot));
        }
        fn add_interior(&mut self, base: ObjectReference, slot: Address) {
            self.0.push(StackRoot::Interior { base, slot });
        }
        fn add_value(&mut self, object: ObjectReference) {
            self.0.push(StackRoot::Value(object));
        }
    }

    struct Threads(usize);

    impl Scheduler for Threads {
        fn enumerate_threads(&self) -> Vec<ThreadHandle> {
            (0..self.0).map(ThreadHandle).collect()
        }
        fn stack_roots_of(&self, thread: ThreadHandle) -> Vec<StackRoot> {
            vec![StackRoot::Location(Address::from_usize(0x8000 + thread.0 * 8))]
        }
        fn number_of_collector_threads(&self) -> usize {
            2
        }
    }

    #[test]
    fn stacks_are_dealt_round_robin() {
        let globals = GlobalRoots::new(0);
        let scheduler = Threads(5);
        let mut first = Recorder(Vec::new());
        let mut second = Recorder(Vec::new());
        let a = scan_roots(&globals, &scheduler, 1, 2, &mut first);
        let b = scan_roots(&globals, &scheduler, 2, 2, &mut second);
        assert_eq!(a.locations, 3);
        assert_eq!(b.locations, 2);
        assert_eq!(first.0[1], StackRoot::Location(Address::from_usize(0x8010)));
    }
}
