//! A memory-management engine for managed-language runtimes.
//!
//! `cyclone-gc` provides the collector half of a runtime: spaces that
//! reserve address ranges, per-thread allocators, a parallel tracing
//! closure built on buffered work queues, and a deferred reference-counting
//! plan whose garbage cycles are reclaimed by a time-capped trial-deletion
//! cycle collector.
//!
//! # Architecture
//!
//! - [`space::Space`]: a reserved, block-aligned virtual range with page
//!   accounting.
//! - [`policy`]: bump-pointer, mark-sweep and large-object allocation plus
//!   the copying nursery and immortal space.
//! - [`queue`]: shared chains of fixed-size buffers with per-thread
//!   [`LocalQueue`] ends.
//! - [`roots`]: global slots and stack roots, partitioned across collectors.
//! - [`trace`]: the per-collector closure and its termination protocol.
//! - [`cycle`]: trial-deletion cycle collection.
//! - [`plan`]: ties the pieces into a collection policy.
//!
//! The runtime supplies type information through [`ObjectModel`] and its
//! threads through [`Scheduler`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use cyclone_gc::{GcConfig, Plan, PlanKind, Scheduler, StackRoot, ThreadHandle, TypeRegistry};
//!
//! struct NoThreads;
//!
//! impl Scheduler for NoThreads {
//!     fn enumerate_threads(&self) -> Vec<ThreadHandle> {
//!         Vec::new()
//!     }
//!     fn stack_roots_of(&self, _thread: ThreadHandle) -> Vec<StackRoot> {
//!         Vec::new()
//!     }
//!     fn number_of_collector_threads(&self) -> usize {
//!         1
//!     }
//! }
//!
//! let mut types = TypeRegistry::new();
//! let pair = types.register_scalar("pair", 2, &[0, 1]);
//!
//! let mut config = GcConfig::new(PlanKind::RefCount);
//! config.set_collector_threads(1);
//! config.set_eager_cycle_collection();
//! let plan = Plan::new(config, Arc::new(types), Arc::new(NoThreads)).unwrap();
//! let mut mutator = plan.bind_mutator();
//!
//! let a = mutator.new_object(pair, 0);
//! plan.globals().set(0, Some(a));
//! plan.collect(&mut [&mut mutator]);
//! assert!(plan.is_allocated(a));
//!
//! plan.globals().set(0, None);
//! plan.collect(&mut [&mut mutator]);
//! assert!(!plan.is_allocated(a));
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod config;
pub mod constants;
pub mod cycle;
pub mod error;
pub mod metrics;
pub mod object;
pub mod plan;
pub mod policy;
pub mod queue;
pub mod roots;
pub mod space;
pub mod trace;
pub mod tracing;

use std::num::NonZeroUsize;

pub use address::{Address, ObjectReference};
pub use config::{GcConfig, PlanKind};
pub use cycle::{CycleCollector, CyclePhase, CycleStats, Progress, RefCountHeap};
pub use error::{GcError, GcResult};
pub use metrics::{CumulativeMetrics, GcMetrics};
pub use object::{Color, ElementType, ObjectModel, TypeId, TypeRegistry};
pub use plan::{Mutator, Plan, SpaceKind};
pub use policy::AllocationSemantics;
pub use queue::{LocalQueue, SharedQueue};
pub use roots::{GlobalRoots, Scheduler, StackRoot, ThreadHandle};

/// Number of CPUs available to the process, at least one.
#[must_use]
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
