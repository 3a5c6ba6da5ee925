//! Mutator contexts.

use std::sync::Arc;

use crate::address::{Address, ObjectReference};
use crate::config::PlanKind;
use crate::error::fatal;
use crate::object::{initial_status, Color, TypeId};
use crate::plan::{Plan, SpaceKind};
use crate::policy::{
    Allocate, AllocationSemantics, Allocator, BumpPointer, LargeObjectAllocator,
    MarkSweepAllocator,
};
use crate::queue::LocalQueue;

/// A mutator thread's allocation and barrier state.
///
/// Bound to one plan by [`Plan::bind_mutator`]. Mutators must be stopped
/// (and handed to [`Plan::collect`]) while a collection runs.
#[derive(Debug)]
pub struct Mutator {
    plan: Arc<Plan>,
    default: Allocator,
    mature: Allocator,
    large: Allocator,
    immortal: Allocator,
    decrements: Option<LocalQueue<ObjectReference>>,
}

impl Mutator {
    pub(crate) fn new(plan: Arc<Plan>) -> Self {
        let mature = || Allocator::MarkSweep(MarkSweepAllocator::new(Arc::clone(plan.mature())));
        let default = match plan.nursery() {
            Some(nursery) => Allocator::BumpPointer(BumpPointer::new(Arc::clone(nursery.space()))),
            None => mature(),
        };
        Self {
            default,
            mature: mature(),
            large: Allocator::LargeObject(LargeObjectAllocator::new(Arc::clone(plan.large()))),
            immortal: Allocator::BumpPointer(BumpPointer::new(Arc::clone(plan.immortal().space()))),
            decrements: plan
                .refcount()
                .map(|rc| LocalQueue::new(Arc::clone(rc.decrements()))),
            plan,
        }
    }

    /// The plan this mutator is bound to.
    #[must_use]
    pub const fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Allocates `bytes` zeroed bytes aligned to `align`.
    ///
    /// Requests above the large-object threshold go to the large-object
    /// space whatever `semantics` asks for, immortal requests aside. The
    /// plan is polled afterwards, so the caller should check
    /// [`Plan::is_collection_requested`] at its next safepoint.
    pub fn alloc(&mut self, bytes: usize, align: usize, semantics: AllocationSemantics) -> Address {
        let semantics = match semantics {
            AllocationSemantics::Default | AllocationSemantics::Mature
                if bytes > self.plan.config().large_object_threshold =>
            {
                AllocationSemantics::Large
            }
            other => other,
        };
        let allocator = match semantics {
            AllocationSemantics::Default => &mut self.default,
            AllocationSemantics::Mature => &mut self.mature,
            AllocationSemantics::Large => &mut self.large,
            AllocationSemantics::Immortal => &mut self.immortal,
        };
        let address = allocator.alloc(bytes, align);
        self.plan.poll(false, allocator.space());
        address
    }

    /// Writes the header of a freshly allocated object.
    ///
    /// Under reference counting, counted objects start with a count of one
    /// and a buffered decrement; acyclic types start green.
    pub fn post_alloc(&mut self, object: ObjectReference, ty: TypeId, length: usize) {
        let plan = &*self.plan;
        let space = plan.space_of(object);
        let mark_state = match space {
            Some(SpaceKind::Large) => plan.large().mark_state(),
            Some(SpaceKind::Immortal) => plan.immortal().mark_state(),
            _ => false,
        };
        let counted = plan.kind() == PlanKind::RefCount
            && matches!(space, Some(SpaceKind::Mature | SpaceKind::Large));
        let color = if counted && plan.model().is_acyclic(ty) {
            Color::Green
        } else {
            Color::Black
        };

        let header = object.header();
        header.initialize(initial_status(mark_state, color, usize::from(counted)));
        header.set_type_id(ty);
        if plan.model().is_array_type(ty) {
            header.set_array_length(length);
        }
        if counted {
            if let Some(buffer) = &mut self.decrements {
                buffer.insert(object);
            }
        }
    }

    /// Allocates and initializes an instance of `ty` (`length` elements for
    /// array types) with the given semantics.
    pub fn new_object_with(
        &mut self,
        ty: TypeId,
        length: usize,
        semantics: AllocationSemantics,
    ) -> ObjectReference {
        let bytes = self.plan.model().bytes_required(ty, length);
        let address = self.alloc(bytes, crate::constants::MIN_ALIGNMENT, semantics);
        let Some(object) = ObjectReference::from_address(address) else {
            let plan = &*self.plan;
            fatal("allocator returned a null address", || plan.dump_state());
        };
        self.post_alloc(object, ty, length);
        object
    }

    /// Allocates an instance of `ty` in the plan's default space.
    pub fn new_object(&mut self, ty: TypeId, length: usize) -> ObjectReference {
        self.new_object_with(ty, length, AllocationSemantics::Default)
    }

    /// Stores `value` into reference field `index` of `object`, applying the
    /// plan's write barrier.
    ///
    /// Under reference counting the new referent is incremented at once and
    /// the old one gets a buffered decrement. An out-of-range index is
    /// fatal.
    pub fn write_reference(
        &mut self,
        object: ObjectReference,
        index: usize,
        value: Option<ObjectReference>,
    ) {
        let plan = &*self.plan;
        let Some(slot) = plan.model().reference_slot(object, index) else {
            fatal(format!("reference index {index} out of range for {object}"), || {
                plan.dump_state()
            });
        };
        if plan.kind() != PlanKind::RefCount {
            // SAFETY: `slot` lies inside the live object.
            unsafe { slot.store_reference(value) };
            return;
        }

        if let Some(new) = value.filter(|&v| plan.is_rc_object(v)) {
            let header = new.header();
            header.inc_ref_count();
            if !header.is_green() {
                header.set_color(Color::Black);
            }
        }
        // SAFETY: as above.
        let old = unsafe { slot.load_reference() };
        unsafe { slot.store_reference(value) };
        if let (Some(old), Some(buffer)) = (old, &mut self.decrements) {
            if plan.is_rc_object(old) {
                buffer.insert(old);
            }
        }
    }

    /// Loads reference field `index` of `object`. An out-of-range index is
    /// fatal.
    #[must_use]
    pub fn read_reference(&self, object: ObjectReference, index: usize) -> Option<ObjectReference> {
        let plan = &*self.plan;
        let Some(slot) = plan.model().reference_slot(object, index) else {
            fatal(format!("reference index {index} out of range for {object}"), || {
                plan.dump_state()
            });
        };
        // SAFETY: `slot` lies inside the live object.
        unsafe { slot.load_reference() }
    }

    /// Asks the plan for a collection if the heap budget is exceeded, or
    /// unconditionally when `must_collect` is set.
    pub fn poll(&self, must_collect: bool) -> bool {
        self.plan.poll(must_collect, self.default.space())
    }

    /// Gives up cursors and owned blocks and publishes buffered decrements,
    /// ahead of a collection.
    pub fn prepare_non_participating(&mut self) {
        self.default.reset();
        self.mature.reset();
        self.large.reset();
        self.immortal.reset();
        if let Some(buffer) = &mut self.decrements {
            buffer.flush_local();
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.default.reset();
        self.mature.reset();
        self.large.reset();
        self.immortal.reset();
    }
}
