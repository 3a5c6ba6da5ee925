//! Allocation policies.
//!
//! Each policy pairs a space with a per-thread front end. Front ends form
//! the closed [`Allocator`] enum, chosen per allocation semantics when a
//! mutator is bound, and share one [`Allocate`] interface.

pub mod bump;
pub mod copy;
pub mod immortal;
pub mod large_object;
pub mod mark_sweep;

use crate::address::Address;
use crate::space::Space;

pub use bump::BumpPointer;
pub use copy::CopySpace;
pub use immortal::ImmortalSpace;
pub use large_object::{LargeObjectAllocator, LargeObjectSpace};
pub use mark_sweep::{MarkSweepAllocator, MarkSweepSpace};

/// Where an allocation request should be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationSemantics {
    /// The plan's default space: the nursery (hybrid) or the reference
    /// counted mark-sweep space.
    #[default]
    Default,
    /// Directly into the mark-sweep space.
    Mature,
    /// Into the large-object space regardless of size.
    Large,
    /// Never reclaimed.
    Immortal,
}

/// Per-thread allocation front end.
pub trait Allocate {
    /// Allocates `bytes` bytes aligned to `align`. The memory is zeroed.
    ///
    /// Exhausting the underlying space is fatal.
    fn alloc(&mut self, bytes: usize, align: usize) -> Address;

    /// Drops any thread-local state (cursors, owned blocks) so the space can
    /// be collected.
    fn reset(&mut self);

    /// The space this allocator draws from.
    fn space(&self) -> &Space;
}

/// The allocator variants a mutator or collector may hold.
#[derive(Debug)]
pub enum Allocator {
    /// Monotonic cursor over blocks.
    BumpPointer(BumpPointer),
    /// Size-classed cells with an in-use/mark bitmap.
    MarkSweep(MarkSweepAllocator),
    /// Page-granular chunks on a treadmill.
    LargeObject(LargeObjectAllocator),
}

impl Allocate for Allocator {
    #[inline]
    fn alloc(&mut self, bytes: usize, align: usize) -> Address {
        match self {
            Self::BumpPointer(a) => a.alloc(bytes, align),
            Self::MarkSweep(a) => a.alloc(bytes, align),
            Self::LargeObject(a) => a.alloc(bytes, align),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::BumpPointer(a) => a.reset(),
            Self::MarkSweep(a) => a.reset(),
            Self::LargeObject(a) => a.reset(),
        }
    }

    fn space(&self) -> &Space {
        match self {
            Self::BumpPointer(a) => a.space(),
            Self::MarkSweep(a) => a.space(),
            Self::LargeObject(a) => a.space(),
        }
    }
}
