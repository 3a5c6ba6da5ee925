//! Copying nursery.
//!
//! Survivors are evacuated into the mark-sweep space; after a collection
//! the whole nursery is released at once.

use std::sync::Arc;

use crate::address::{Address, ObjectReference};
use crate::object::{status_for_copy, ForwardingState, ObjectModel};
use crate::space::Space;

/// The nursery space. Allocation goes through a
/// [`BumpPointer`](crate::policy::BumpPointer) over [`CopySpace::space`].
#[derive(Debug)]
pub struct CopySpace {
    space: Arc<Space>,
}

impl CopySpace {
    /// Wraps a block-granular space.
    #[must_use]
    pub fn new(space: Space) -> Self {
        Self {
            space: Arc::new(space),
        }
    }

    /// Shared handle for bump allocators.
    #[must_use]
    pub const fn space(&self) -> &Arc<Space> {
        &self.space
    }

    /// Whether `object` lies in the nursery.
    #[inline]
    #[must_use]
    pub fn contains(&self, object: ObjectReference) -> bool {
        self.space.contains(object.to_address())
    }

    /// Forwards `object`, copying it with `copy` if this call wins the
    /// forwarding race. `copy` receives the object size and returns the
    /// destination.
    ///
    /// Returns the new location and whether this call performed the copy.
    /// Callers that lose the race wait for the winner and get its copy.
    pub fn forward_object(
        &self,
        object: ObjectReference,
        model: &dyn ObjectModel,
        copy: impl FnOnce(usize) -> Address,
    ) -> (ObjectReference, bool) {
        let header = object.header();
        let Some(claimed) = header.try_claim_forwarding() else {
            return (header.spin_and_get_forwarded(), false);
        };
        let bytes = model.size_of(object);
        let to = copy(bytes);
        // SAFETY: `to` is a fresh cell of at least `bytes` bytes and the
        // source is pinned by the forwarding claim.
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.to_address().to_mut_ptr::<u8>(),
                to.to_mut_ptr::<u8>(),
                bytes,
            );
        }
        let Some(new) = ObjectReference::from_address(to) else {
            crate::error::fatal_in_space(self.space.name(), "copy allocator returned null");
        };
        new.header().initialize(status_for_copy(claimed));
        header.set_forwarded(new);
        (new, true)
    }

    /// Whether `object` has been forwarded in the current collection.
    #[must_use]
    pub fn is_forwarded(&self, object: ObjectReference) -> bool {
        matches!(
            object.header().forwarding_state(),
            ForwardingState::Forwarded(_)
        )
    }

    /// Releases every nursery page. All bump allocators over the space must
    /// have been reset.
    pub fn release(&self) {
        self.space.release_all();
    }
}
