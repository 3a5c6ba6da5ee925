//! Whole-heap tracing under the hybrid plan.

mod common;

use std::sync::Arc;

use common::{data, set_data, setup, Slots, NODE_DATA};
use cyclone_gc::policy::MarkSweepAllocator;
use cyclone_gc::trace::{Termination, TraceLocal};
use cyclone_gc::{AllocationSemantics, PlanKind, SpaceKind, StackRoot};

#[test]
fn reachable_nursery_objects_are_evacuated() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();

    let a = mutator.new_object(types.node, 0);
    let b = mutator.new_object(types.node, 0);
    let _garbage = mutator.new_object(types.node, 0);
    set_data(a, NODE_DATA, 11);
    set_data(b, NODE_DATA, 22);
    mutator.write_reference(a, 0, Some(b));
    assert_eq!(plan.space_of(a), Some(SpaceKind::Nursery));
    plan.globals().set(0, Some(a));

    plan.collect(&mut [&mut mutator]);

    let a2 = plan.globals().get(0).expect("root survives");
    assert_ne!(a2, a);
    assert_eq!(plan.space_of(a2), Some(SpaceKind::Mature));
    assert_eq!(data(a2, NODE_DATA), 11);
    let b2 = mutator.read_reference(a2, 0).expect("edge survives");
    assert_eq!(plan.space_of(b2), Some(SpaceKind::Mature));
    assert_eq!(data(b2, NODE_DATA), 22);
    assert!(mutator.read_reference(a2, 1).is_none());

    let metrics = plan.last_metrics();
    assert_eq!(metrics.collection, 1);
    assert_eq!(metrics.objects_copied, 2);
    assert_eq!(plan.nursery().expect("hybrid").space().used_pages(), 0);
}

#[test]
fn survivors_are_copied_once() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let a = mutator.new_object(types.node, 0);
    plan.globals().set(3, Some(a));

    plan.collect(&mut [&mut mutator]);
    let moved = plan.globals().get(3).expect("root");
    plan.collect(&mut [&mut mutator]);

    assert_eq!(plan.globals().get(3), Some(moved));
    assert_eq!(plan.last_metrics().objects_copied, 0);
    assert!(plan.is_allocated(moved));
}

#[test]
fn unreachable_mature_objects_are_swept() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let live = mutator.new_object_with(types.node, 0, AllocationSemantics::Mature);
    let dead = mutator.new_object_with(types.node, 0, AllocationSemantics::Mature);
    let child = mutator.new_object_with(types.leaf, 0, AllocationSemantics::Mature);
    mutator.write_reference(live, 1, Some(child));
    plan.globals().set(0, Some(live));

    plan.collect(&mut [&mut mutator]);

    assert!(plan.is_allocated(live));
    assert!(plan.is_allocated(child));
    assert!(!plan.is_allocated(dead));
    assert_eq!(plan.last_metrics().objects_freed, 1);
}

#[test]
fn large_objects_live_and_die_with_their_roots() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let kept = mutator.new_object(types.refs, 2000);
    let dropped = mutator.new_object(types.bytes, 20_000);
    assert_eq!(plan.space_of(kept), Some(SpaceKind::Large));
    assert_eq!(plan.space_of(dropped), Some(SpaceKind::Large));

    let element = mutator.new_object(types.leaf, 0);
    mutator.write_reference(kept, 1999, Some(element));
    plan.globals().set(1, Some(kept));

    plan.collect(&mut [&mut mutator]);

    assert_eq!(plan.large().object_count(), 1);
    assert!(plan.is_allocated(kept));
    assert!(!plan.is_allocated(dropped));
    let moved = mutator.read_reference(kept, 1999).expect("element survives");
    assert_eq!(plan.space_of(moved), Some(SpaceKind::Mature));

    plan.globals().set(1, None);
    plan.collect(&mut [&mut mutator]);
    assert_eq!(plan.large().object_count(), 0);
}

#[test]
fn stack_roots_are_rewritten() {
    let (plan, vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let slots = Slots::new(2);

    let a = mutator.new_object(types.node, 0);
    let b = mutator.new_object(types.node, 0);
    set_data(b, NODE_DATA, 7);
    slots.set(0, Some(a));
    let offset = 16;
    slots.set_raw(1, b.to_address().as_usize() + offset);
    let pinned = mutator.new_object_with(types.leaf, 0, AllocationSemantics::Mature);
    vm.add_thread(vec![
        StackRoot::Location(slots.address(0)),
        StackRoot::Interior {
            base: b,
            slot: slots.address(1),
        },
        StackRoot::Value(pinned),
    ]);

    plan.collect(&mut [&mut mutator]);

    let a2 = slots.get(0).expect("location root");
    assert_eq!(plan.space_of(a2), Some(SpaceKind::Mature));
    let interior = slots.raw(1);
    let b2 = cyclone_gc::ObjectReference::from_address(cyclone_gc::Address::from_usize(
        interior - offset,
    ))
    .expect("interior root");
    assert_eq!(plan.space_of(b2), Some(SpaceKind::Mature));
    assert_eq!(data(b2, NODE_DATA), 7);
    assert!(plan.is_allocated(pinned));
    let roots = plan.last_metrics().roots;
    assert_eq!(roots, plan.globals().capacity() + 3);
}

#[test]
fn immortal_objects_keep_their_referents() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let table = mutator.new_object_with(types.node, 0, AllocationSemantics::Immortal);
    assert_eq!(plan.space_of(table), Some(SpaceKind::Immortal));
    let entry = mutator.new_object(types.leaf, 0);
    set_data(entry, 0, 99);
    mutator.write_reference(table, 0, Some(entry));
    plan.globals().set(0, Some(table));

    plan.collect(&mut [&mut mutator]);
    plan.collect(&mut [&mut mutator]);

    assert_eq!(plan.globals().get(0), Some(table));
    let moved = mutator.read_reference(table, 0).expect("entry");
    assert_eq!(data(moved, 0), 99);
}

#[test]
fn only_forwarded_nursery_objects_count_as_moved() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let young = mutator.new_object(types.node, 0);
    let old = mutator.new_object_with(types.node, 0, AllocationSemantics::Mature);
    let pinned = mutator.new_object_with(types.node, 0, AllocationSemantics::Immortal);
    set_data(young, NODE_DATA, 42);

    let termination = Termination::new(1);
    let mut copy = MarkSweepAllocator::new(Arc::clone(plan.mature()));
    let mut trace = TraceLocal::new(&plan, 1, &termination, Some(&mut copy));
    assert!(!trace.has_moved(young));
    assert!(trace.has_moved(old));
    assert!(trace.has_moved(pinned));

    let moved = trace.trace_object(young);
    assert_ne!(moved, young);
    assert!(trace.has_moved(young));
    assert!(trace.has_moved(moved));
    assert_eq!(trace.trace_object(young), moved);
    assert_eq!(data(moved, NODE_DATA), 42);

    trace.process_all_work();
    let stats = trace.finish();
    assert_eq!(stats.copied, 1);
    assert_eq!(stats.scanned, 1);
}
