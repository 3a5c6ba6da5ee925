//! Space whose objects are never reclaimed.
//!
//! Immortal objects are still traced so that everything they reach stays
//! alive; the header mark bit, with a polarity flipped every collection,
//! keeps each one from being scanned twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::address::ObjectReference;
use crate::space::Space;

/// The immortal space. Allocation goes through a
/// [`BumpPointer`](crate::policy::BumpPointer) over [`ImmortalSpace::space`].
#[derive(Debug)]
pub struct ImmortalSpace {
    space: Arc<Space>,
    mark_state: AtomicBool,
}

impl ImmortalSpace {
    /// Wraps a block-granular space.
    #[must_use]
    pub fn new(space: Space) -> Self {
        Self {
            space: Arc::new(space),
            mark_state: AtomicBool::new(false),
        }
    }

    /// Shared handle for bump allocators.
    #[must_use]
    pub const fn space(&self) -> &Arc<Space> {
        &self.space
    }

    /// Whether `object` lies in this space.
    #[inline]
    #[must_use]
    pub fn contains(&self, object: ObjectReference) -> bool {
        self.space.contains(object.to_address())
    }

    /// Value a marked object's header bit holds.
    #[must_use]
    pub fn mark_state(&self) -> bool {
        self.mark_state.load(Ordering::Acquire)
    }

    /// Flips the mark polarity, unmarking every object.
    pub fn prepare(&self) {
        self.mark_state.fetch_xor(true, Ordering::AcqRel);
    }

    /// Marks `object`, returning `true` for the first caller only.
    pub fn test_and_mark(&self, object: ObjectReference) -> bool {
        object.header().test_and_mark(self.mark_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BYTES_IN_BLOCK, BYTES_IN_WORD, PAGES_IN_BLOCK};
    use crate::object::{initial_status, Color};
    use crate::policy::{Allocate, BumpPointer};

    #[test]
    fn each_collection_marks_once() {
        let immortal = ImmortalSpace::new(
            Space::reserve("immortal", 4 * BYTES_IN_BLOCK, PAGES_IN_BLOCK).unwrap(),
        );
        let mut bump = BumpPointer::new(Arc::clone(immortal.space()));
        let object = ObjectReference::from_address(bump.alloc(32, BYTES_IN_WORD)).unwrap();
        object
            .header()
            .initialize(initial_status(immortal.mark_state(), Color::Black, 0));
        assert!(immortal.contains(object));

        for _ in 0..3 {
            immortal.prepare();
            assert!(immortal.test_and_mark(object));
            assert!(!immortal.test_and_mark(object));
        }
    }
}
