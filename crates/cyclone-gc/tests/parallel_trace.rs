//! Closures run by several collector threads.

mod common;

use common::{data, set_data, setup, Slots, NODE_DATA};
use cyclone_gc::{Mutator, ObjectReference, PlanKind, SpaceKind, StackRoot, TypeId};

/// Builds a complete binary tree of `depth` levels whose data words number
/// the nodes in preorder starting at `*next`.
fn build_tree(
    mutator: &mut Mutator,
    node: TypeId,
    depth: usize,
    next: &mut usize,
) -> ObjectReference {
    let object = mutator.new_object(node, 0);
    set_data(object, NODE_DATA, *next);
    *next += 1;
    if depth > 1 {
        let left = build_tree(mutator, node, depth - 1, next);
        let right = build_tree(mutator, node, depth - 1, next);
        mutator.write_reference(object, 0, Some(left));
        mutator.write_reference(object, 1, Some(right));
    }
    object
}

fn checksum(mutator: &Mutator, object: ObjectReference, count: &mut usize) -> usize {
    *count += 1;
    let mut sum = data(object, NODE_DATA);
    for field in 0..2 {
        if let Some(child) = mutator.read_reference(object, field) {
            sum += checksum(mutator, child, count);
        }
    }
    sum
}

#[test]
fn four_collectors_preserve_a_large_graph() {
    let (plan, vm, types) = setup(PlanKind::Hybrid, 4);
    let mut mutator = plan.bind_mutator();
    let slots = Slots::new(3);

    let mut next = 0;
    let trees: Vec<_> = (0..3)
        .map(|_| build_tree(&mut mutator, types.node, 12, &mut next))
        .collect();
    let mut expected = Vec::new();
    for tree in &trees {
        let mut count = 0;
        expected.push((checksum(&mutator, *tree, &mut count), count));
    }
    for (i, tree) in trees.iter().enumerate() {
        slots.set(i, Some(*tree));
        vm.add_thread(vec![StackRoot::Location(slots.address(i))]);
    }

    plan.collect(&mut [&mut mutator]);

    let metrics = plan.last_metrics();
    assert_eq!(metrics.participants, 4);
    assert_eq!(metrics.objects_copied, next);
    for (i, (sum, count)) in expected.into_iter().enumerate() {
        let root = slots.get(i).expect("tree root");
        assert_eq!(plan.space_of(root), Some(SpaceKind::Mature));
        let mut seen = 0;
        assert_eq!(checksum(&mutator, root, &mut seen), sum);
        assert_eq!(seen, count);
    }
}

#[test]
fn shared_subgraphs_are_copied_once() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 4);
    let mut mutator = plan.bind_mutator();
    let shared = mutator.new_object(types.leaf, 0);
    set_data(shared, 0, 5);
    for slot in 0..plan.globals().capacity() {
        let holder = mutator.new_object(types.node, 0);
        mutator.write_reference(holder, 0, Some(shared));
        plan.globals().set(slot, Some(holder));
    }

    plan.collect(&mut [&mut mutator]);

    let first = plan.globals().get(0).expect("holder");
    let target = mutator.read_reference(first, 0).expect("shared");
    for slot in 0..plan.globals().capacity() {
        let holder = plan.globals().get(slot).expect("holder");
        assert_eq!(mutator.read_reference(holder, 0), Some(target));
    }
    assert_eq!(data(target, 0), 5);
    assert_eq!(plan.last_metrics().objects_copied, plan.globals().capacity() + 1);
}

#[test]
fn idle_collectors_sit_out() {
    let (plan, _vm, types) = setup(PlanKind::Hybrid, 1);
    let mut mutator = plan.bind_mutator();
    let a = mutator.new_object(types.node, 0);
    plan.globals().set(0, Some(a));
    plan.collect(&mut [&mut mutator]);
    assert_eq!(plan.last_metrics().participants, 1);
    assert!(plan.globals().get(0).is_some());
}
