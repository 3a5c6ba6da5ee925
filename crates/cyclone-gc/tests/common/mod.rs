//! Shared fixtures: a scheduler with scripted stacks and a small type table.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cyclone_gc::constants::BYTES_IN_WORD;
use cyclone_gc::object::SCALAR_HEADER_BYTES;
use cyclone_gc::{
    Address, GcConfig, ObjectReference, Plan, PlanKind, Scheduler, StackRoot, ThreadHandle,
    TypeId, TypeRegistry,
};
use parking_lot::Mutex;

/// Type ids registered by [`setup`].
#[derive(Debug, Clone, Copy)]
pub struct Types {
    /// Two reference fields followed by one data word.
    pub node: TypeId,
    /// One data word, no references (acyclic).
    pub leaf: TypeId,
    /// Array of references.
    pub refs: TypeId,
    /// Array of bytes.
    pub bytes: TypeId,
}

/// Index of the data word of a `node`.
pub const NODE_DATA: usize = 2;

pub fn types() -> (TypeRegistry, Types) {
    let mut registry = TypeRegistry::new();
    let types = Types {
        node: registry.register_scalar("node", 3, &[0, 1]),
        leaf: registry.register_scalar("leaf", 1, &[]),
        refs: registry.register_reference_array("refs"),
        bytes: registry.register_primitive_array("bytes", 1),
    };
    (registry, types)
}

/// Scheduler whose threads and stack roots are set by the test.
#[derive(Debug, Default)]
pub struct TestVm {
    threads: Mutex<Vec<Vec<StackRoot>>>,
    collectors: usize,
}

impl TestVm {
    pub fn new(collectors: usize) -> Arc<Self> {
        Arc::new(Self {
            threads: Mutex::new(Vec::new()),
            collectors,
        })
    }

    pub fn add_thread(&self, roots: Vec<StackRoot>) -> ThreadHandle {
        let mut threads = self.threads.lock();
        threads.push(roots);
        ThreadHandle(threads.len() - 1)
    }

    pub fn set_roots(&self, thread: ThreadHandle, roots: Vec<StackRoot>) {
        self.threads.lock()[thread.0] = roots;
    }
}

impl Scheduler for TestVm {
    fn enumerate_threads(&self) -> Vec<ThreadHandle> {
        (0..self.threads.lock().len()).map(ThreadHandle).collect()
    }

    fn stack_roots_of(&self, thread: ThreadHandle) -> Vec<StackRoot> {
        self.threads.lock()[thread.0].clone()
    }

    fn number_of_collector_threads(&self) -> usize {
        self.collectors
    }
}

/// A configuration with small extents.
pub fn small_config(kind: PlanKind, collectors: usize) -> GcConfig {
    let mut config = GcConfig::new(kind);
    config.nursery_bytes = 4 << 20;
    config.mature_bytes = 8 << 20;
    config.large_bytes = 16 << 20;
    config.immortal_bytes = 1 << 20;
    config.global_root_slots = 16;
    config.set_collector_threads(collectors);
    config
}

pub fn setup_with(config: GcConfig) -> (Arc<Plan>, Arc<TestVm>, Types) {
    let (registry, types) = types();
    let vm = TestVm::new(config.collector_threads);
    let plan = Plan::new(config, Arc::new(registry), Arc::clone(&vm) as Arc<dyn Scheduler>)
        .expect("plan");
    (plan, vm, types)
}

pub fn setup(kind: PlanKind, collectors: usize) -> (Arc<Plan>, Arc<TestVm>, Types) {
    let mut config = small_config(kind, collectors);
    config.set_eager_cycle_collection();
    setup_with(config)
}

/// Stack slots with stable addresses, for `StackRoot::Location` roots.
#[derive(Debug)]
pub struct Slots(Box<[AtomicUsize]>);

impl Slots {
    pub fn new(count: usize) -> Self {
        Self((0..count).map(|_| AtomicUsize::new(0)).collect())
    }

    pub fn address(&self, index: usize) -> Address {
        Address::from_ptr(std::ptr::from_ref(&self.0[index]))
    }

    pub fn set(&self, index: usize, value: Option<ObjectReference>) {
        let raw = value.map_or(0, |o| o.to_address().as_usize());
        self.0[index].store(raw, Ordering::SeqCst);
    }

    pub fn get(&self, index: usize) -> Option<ObjectReference> {
        ObjectReference::from_address(Address::from_usize(self.0[index].load(Ordering::SeqCst)))
    }

    pub fn raw(&self, index: usize) -> usize {
        self.0[index].load(Ordering::SeqCst)
    }

    pub fn set_raw(&self, index: usize, value: usize) {
        self.0[index].store(value, Ordering::SeqCst);
    }
}

/// Writes the data word of a `node` or `leaf`.
pub fn set_data(object: ObjectReference, field: usize, value: usize) {
    let slot = object.to_address().plus(SCALAR_HEADER_BYTES + field * BYTES_IN_WORD);
    unsafe { slot.store_word(value) };
}

/// Reads the data word of a `node` or `leaf`.
pub fn data(object: ObjectReference, field: usize) -> usize {
    let slot = object.to_address().plus(SCALAR_HEADER_BYTES + field * BYTES_IN_WORD);
    unsafe { slot.load_word() }
}
