//! Bump-pointer allocation.
//!
//! The fast path compares the old cursor with the new end by XOR: if they
//! differ in any bit at or above the block size, the allocation would leave
//! the current block (or wrap), and the slow path acquires fresh blocks.

use std::sync::Arc;

use crate::address::Address;
use crate::constants::{BYTES_IN_BLOCK, MIN_ALIGNMENT, PAGES_IN_BLOCK};
use crate::error::fatal_in_space;
use crate::policy::Allocate;
use crate::space::Space;

/// Any allocation whose start and end differ in this bit or above crosses a
/// block boundary.
const TRIGGER: usize = BYTES_IN_BLOCK;
/// A cursor value that forces the first allocation onto the slow path.
const INITIAL_CURSOR: Address = Address::from_usize(TRIGGER - 1);

/// Thread-local bump allocator over a block-granular space.
#[derive(Debug)]
pub struct BumpPointer {
    cursor: Address,
    space: Arc<Space>,
}

impl BumpPointer {
    /// Creates an allocator that has not yet acquired a block.
    #[must_use]
    pub const fn new(space: Arc<Space>) -> Self {
        Self {
            cursor: INITIAL_CURSOR,
            space,
        }
    }

    /// Current cursor, for diagnostics.
    #[must_use]
    pub const fn cursor(&self) -> Address {
        self.cursor
    }

    #[cold]
    fn alloc_slow(&mut self, bytes: usize, align: usize) -> Address {
        let blocks = bytes.div_ceil(BYTES_IN_BLOCK).max(1);
        let start = self.space.acquire(blocks * PAGES_IN_BLOCK).align_up(align);
        let end = start.plus(bytes);
        if end > start.align_down(BYTES_IN_BLOCK).plus(blocks * BYTES_IN_BLOCK) {
            fatal_in_space(self.space.name(), format!("alignment {align} overflows the block"));
        }
        self.park_cursor(end);
        start
    }

    /// Stores `end` as the cursor. A cursor exactly on a block boundary
    /// would let the fast path run into a block this thread does not own, so
    /// it is parked one byte short, where alignment pushes the next request
    /// across the boundary and onto the slow path.
    fn park_cursor(&mut self, end: Address) {
        self.cursor = if end.is_aligned_to(BYTES_IN_BLOCK) {
            end.minus(1)
        } else {
            end
        };
    }
}

impl Allocate for BumpPointer {
    #[inline]
    fn alloc(&mut self, bytes: usize, align: usize) -> Address {
        let align = align.max(MIN_ALIGNMENT);
        let old = self.cursor;
        let start = old.align_up(align);
        let end = start.plus(bytes);
        if (old.as_usize() ^ end.as_usize()) >= TRIGGER {
            return self.alloc_slow(bytes, align);
        }
        self.park_cursor(end);
        start
    }

    fn reset(&mut self) {
        self.cursor = INITIAL_CURSOR;
    }

    fn space(&self) -> &Space {
        &self.space
    }
}
