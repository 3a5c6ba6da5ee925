//! Deferred reference counting and trial-deletion cycle collection.

mod common;

use std::time::Duration;

use common::{setup, setup_with, small_config, Slots};
use cyclone_gc::{AllocationSemantics, Color, ObjectReference, PlanKind, Progress, StackRoot};

#[test]
fn unreachable_chain_is_freed_by_counting() {
    let (plan, _vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let a = mutator.new_object(types.node, 0);
    let b = mutator.new_object(types.node, 0);
    let c = mutator.new_object(types.node, 0);
    mutator.write_reference(a, 0, Some(b));
    mutator.write_reference(b, 0, Some(c));
    plan.globals().set(0, Some(a));

    plan.collect(&mut [&mut mutator]);
    for object in [a, b, c] {
        assert!(plan.is_allocated(object));
        assert_eq!(object.header().ref_count(), 1);
    }

    plan.globals().set(0, None);
    plan.collect(&mut [&mut mutator]);
    for object in [a, b, c] {
        assert!(!plan.is_allocated(object));
    }
    assert_eq!(plan.last_metrics().objects_freed, 3);
    assert_eq!(plan.last_metrics().cycles.freed, 0);
}

#[test]
fn rooted_cycle_survives_until_unrooted() {
    let (plan, _vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let a = mutator.new_object(types.node, 0);
    let b = mutator.new_object(types.node, 0);
    mutator.write_reference(a, 0, Some(b));
    mutator.write_reference(b, 0, Some(a));
    plan.globals().set(0, Some(a));

    plan.collect(&mut [&mut mutator]);
    assert!(plan.is_allocated(a) && plan.is_allocated(b));
    // One count from the cycle edge plus the root increment.
    assert_eq!(a.header().ref_count(), 2);
    assert_eq!(b.header().ref_count(), 1);
    assert_eq!(a.header().color(), Color::Black);

    plan.globals().set(0, None);
    plan.collect(&mut [&mut mutator]);
    assert!(!plan.is_allocated(a));
    assert!(!plan.is_allocated(b));
    assert_eq!(plan.last_metrics().cycles.freed, 2);
    assert_eq!(plan.cumulative_metrics().total_cycle_objects_freed(), 2);
}

#[test]
fn unrooted_cycle_is_freed_in_one_collection() {
    let (plan, _vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let a = mutator.new_object(types.node, 0);
    let b = mutator.new_object(types.node, 0);
    let c = mutator.new_object(types.node, 0);
    mutator.write_reference(a, 0, Some(b));
    mutator.write_reference(b, 0, Some(c));
    mutator.write_reference(c, 0, Some(a));

    plan.collect(&mut [&mut mutator]);

    for object in [a, b, c] {
        assert!(!plan.is_allocated(object));
    }
    assert_eq!(plan.last_metrics().cycles.freed, 3);
}

#[test]
fn acyclic_children_of_a_garbage_cycle_are_released() {
    let (plan, _vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let a = mutator.new_object(types.node, 0);
    let b = mutator.new_object(types.node, 0);
    let leaf = mutator.new_object(types.leaf, 0);
    assert_eq!(leaf.header().color(), Color::Green);
    mutator.write_reference(a, 0, Some(b));
    mutator.write_reference(b, 0, Some(a));
    mutator.write_reference(a, 1, Some(leaf));

    plan.collect(&mut [&mut mutator]);

    assert!(!plan.is_allocated(a));
    assert!(!plan.is_allocated(b));
    assert!(!plan.is_allocated(leaf));
}

#[test]
fn overwritten_references_are_decremented() {
    let (plan, vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let slots = Slots::new(1);
    let holder = mutator.new_object(types.node, 0);
    let first = mutator.new_object(types.leaf, 0);
    let second = mutator.new_object(types.leaf, 0);
    slots.set(0, Some(holder));
    vm.add_thread(vec![StackRoot::Location(slots.address(0))]);

    mutator.write_reference(holder, 0, Some(first));
    mutator.write_reference(holder, 0, Some(second));
    plan.collect(&mut [&mut mutator]);

    assert!(plan.is_allocated(holder));
    assert!(!plan.is_allocated(first));
    assert!(plan.is_allocated(second));
    assert_eq!(second.header().ref_count(), 1);
}

#[test]
fn large_objects_are_counted() {
    let (plan, _vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let array = mutator.new_object(types.refs, 4096);
    let element = mutator.new_object(types.node, 0);
    mutator.write_reference(array, 4095, Some(element));
    mutator.write_reference(element, 0, Some(array));
    assert!(plan.is_rc_object(array));

    plan.collect(&mut [&mut mutator]);

    assert!(!plan.is_allocated(array));
    assert!(!plan.is_allocated(element));
    assert_eq!(plan.large().object_count(), 0);
}

#[test]
fn immortal_objects_are_not_counted() {
    let (plan, _vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let table = mutator.new_object_with(types.node, 0, AllocationSemantics::Immortal);
    let entry = mutator.new_object(types.node, 0);
    mutator.write_reference(table, 0, Some(entry));
    assert!(!plan.is_rc_object(table));
    assert!(!plan.enqueue_for_cycle_check(table));

    plan.collect(&mut [&mut mutator]);
    plan.collect(&mut [&mut mutator]);

    assert!(plan.is_allocated(entry));
    assert_eq!(entry.header().ref_count(), 1);
}

#[test]
fn explicit_cycle_candidates() {
    let (plan, _vm, types) = setup(PlanKind::RefCount, 1);
    let mut mutator = plan.bind_mutator();
    let leaf = mutator.new_object(types.leaf, 0);
    let node = mutator.new_object(types.node, 0);
    assert!(!plan.enqueue_for_cycle_check(leaf));
    assert!(plan.enqueue_for_cycle_check(node));
    assert!(!plan.enqueue_for_cycle_check(node));
    assert_eq!(node.header().color(), Color::Purple);

    plan.collect(&mut [&mut mutator]);
    assert!(!plan.is_allocated(node));
    assert!(!plan.is_allocated(leaf));
}

#[test]
fn hybrid_plan_refuses_cycle_candidates() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let node = mutator.new_object_with(types.node, 0, AllocationSemantics::Mature);
    assert!(!plan.is_rc_object(node));
    assert!(!plan.enqueue_for_cycle_check(node));
}

#[test]
fn garbage_split_across_filter_batches_is_fully_reclaimed() {
    const CHAINS: usize = 400;
    let mut config = small_config(PlanKind::RefCount, 1);
    config.set_eager_cycle_collection();
    // 256 candidates per filter pass, checked every 16.
    config.cycle_metadata_pages = 1;
    config.filter_bound = 16;
    let (plan, _vm, types) = setup_with(config);
    let mut mutator = plan.bind_mutator();

    // A chain of two-node rings. Each ring hangs a tail node that links to
    // the next ring, so a traversal from one ring reaches candidates that
    // are still waiting in later filter batches.
    let holder = mutator.new_object_with(types.refs, CHAINS, AllocationSemantics::Immortal);
    let mut objects: Vec<ObjectReference> = Vec::with_capacity(3 * CHAINS);
    let mut previous_tail: Option<ObjectReference> = None;
    for i in 0..CHAINS {
        let head = mutator.new_object(types.node, 0);
        let second = mutator.new_object(types.node, 0);
        let tail = mutator.new_object(types.node, 0);
        mutator.write_reference(head, 0, Some(second));
        mutator.write_reference(second, 0, Some(head));
        mutator.write_reference(second, 1, Some(tail));
        if let Some(previous) = previous_tail {
            mutator.write_reference(previous, 0, Some(head));
        }
        mutator.write_reference(holder, i, Some(head));
        previous_tail = Some(tail);
        objects.extend([head, second, tail]);
    }

    for _ in 0..4 {
        plan.collect(&mut [&mut mutator]);
    }
    assert!(objects.iter().all(|&o| plan.is_allocated(o)));

    for i in 0..CHAINS {
        mutator.write_reference(holder, i, None);
    }
    for _ in 0..40 {
        plan.collect(&mut [&mut mutator]);
        if objects.iter().all(|&o| !plan.is_allocated(o)) {
            break;
        }
    }

    let stuck: Vec<_> = objects.iter().filter(|&&o| plan.is_allocated(o)).collect();
    assert!(stuck.is_empty(), "{} objects never freed", stuck.len());
    assert_eq!(plan.mature().block_count(), 0);
}

#[test]
fn abandoned_increment_resumes_in_a_later_collection() {
    const RING: usize = 200_000;
    let mut config = small_config(PlanKind::RefCount, 1);
    config.set_eager_cycle_collection();
    config.mature_bytes = 32 << 20;
    config.cycle_metadata_pages = 1024;
    config.grey_visit_grain = 1;
    let (plan, _vm, types) = setup_with(config);
    let mut mutator = plan.bind_mutator();

    let holder = mutator.new_object_with(types.node, 0, AllocationSemantics::Immortal);
    let ring: Vec<ObjectReference> =
        (0..RING).map(|_| mutator.new_object(types.node, 0)).collect();
    for (i, &node) in ring.iter().enumerate() {
        mutator.write_reference(node, 0, Some(ring[(i + 1) % RING]));
    }
    mutator.write_reference(holder, 0, Some(ring[0]));

    // Settle while the ring is referenced: every candidate is filtered out.
    for _ in 0..40 {
        plan.collect(&mut [&mut mutator]);
        if plan.last_metrics().cycle_progress == Some(Progress::Complete) {
            break;
        }
    }
    assert_eq!(plan.last_metrics().cycle_progress, Some(Progress::Complete));
    assert!(ring.iter().all(|o| !o.header().is_buffered()));

    // Far too little time to grey the ring: the traversal is abandoned.
    let aborts = plan.cumulative_metrics().total_cycle_aborts();
    plan.set_gc_time_cap(Duration::from_millis(5));
    mutator.write_reference(holder, 0, None);
    plan.collect(&mut [&mut mutator]);

    let metrics = plan.last_metrics();
    assert_eq!(metrics.cycle_progress, Some(Progress::Partial));
    assert_eq!(metrics.cycles.requeued, 1);
    assert_eq!(metrics.cycles.freed, 0);
    assert_eq!(plan.cumulative_metrics().total_cycle_aborts(), aborts + 1);
    let root = ring[0].header();
    assert!(root.is_buffered());
    assert_eq!(root.color(), Color::Purple);
    for &node in &ring {
        assert!(plan.is_allocated(node));
        assert_eq!(node.header().ref_count(), 1, "{node}");
        assert!(!matches!(node.header().color(), Color::Grey | Color::White), "{node}");
    }
    assert!(ring[1..].iter().all(|o| !o.header().is_buffered()));

    plan.set_gc_time_cap(Duration::from_secs(30));
    plan.collect(&mut [&mut mutator]);

    let metrics = plan.last_metrics();
    assert_eq!(metrics.cycle_progress, Some(Progress::Complete));
    assert_eq!(metrics.cycles.freed, RING);
    assert!(ring.iter().all(|&o| !plan.is_allocated(o)));
    assert_eq!(plan.mature().block_count(), 0);
}
