//! Collector contexts and the parallel closure driver.

use std::sync::Arc;

use crate::config::PlanKind;
use crate::error::fatal;
use crate::plan::Plan;
use crate::policy::{Allocate, MarkSweepAllocator, MarkSweepSpace};
use crate::trace::{Termination, TraceLocal, TraceStats};

/// Per-collector state kept by the plan between collections.
#[derive(Debug)]
pub struct CollectorContext {
    ordinal: usize,
    copy: MarkSweepAllocator,
}

impl CollectorContext {
    pub(crate) const fn new(ordinal: usize, mature: Arc<MarkSweepSpace>) -> Self {
        Self {
            ordinal,
            copy: MarkSweepAllocator::new(mature),
        }
    }

    /// Position of this collector, starting at 1.
    #[must_use]
    pub const fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Puts a collector that sits this collection out into a consistent
    /// state: it must own no blocks the release phase is about to sweep.
    pub fn prepare_non_participating(&mut self) {
        self.copy.reset();
    }

    pub(crate) fn release(&mut self) {
        self.copy.reset();
    }

    fn trace(&mut self, plan: &Plan, termination: &Termination) -> TraceStats {
        let copy = (plan.kind() == PlanKind::Hybrid).then_some(&mut self.copy);
        let mut trace = TraceLocal::new(plan, self.ordinal, termination, copy);
        trace.compute_roots();
        trace.process_all_work();
        trace.finish()
    }
}

/// Runs the closure on the first `participants` contexts and returns their
/// combined statistics. The remaining contexts are prepared as
/// non-participating.
pub(crate) fn run_closure(
    plan: &Plan,
    contexts: &mut [CollectorContext],
    participants: usize,
) -> TraceStats {
    let (active, idle) = contexts.split_at_mut(participants);
    for context in idle {
        context.prepare_non_participating();
    }
    let termination = Termination::new(participants);

    if let [only] = active {
        return only.trace(plan, &termination);
    }

    let result = crossbeam::scope(|scope| {
        let handles: Vec<_> = active
            .iter_mut()
            .map(|context| {
                let termination = &termination;
                scope.spawn(move |_| context.trace(plan, termination))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Result<Vec<_>, _>>()
    });

    match result {
        Ok(Ok(per_thread)) => per_thread.into_iter().fold(TraceStats::default(), |mut acc, s| {
            acc += s;
            acc
        }),
        _ => fatal("collector thread panicked during the closure", || {
            plan.dump_state()
        }),
    }
}
