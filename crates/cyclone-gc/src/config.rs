//! Collector configuration.
//!
//! [`GcConfig`] is built once at startup and handed to
//! [`Plan::new`](crate::plan::Plan::new), which validates it before any
//! address space is reserved.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{BYTES_IN_BLOCK, BYTES_IN_PAGE, BYTES_IN_WORD};
use crate::error::{GcError, GcResult};
use crate::policy::mark_sweep::MAX_CELL_BYTES;

/// Default heap budget in pages (64 MiB).
pub const DEFAULT_HEAP_PAGES: usize = 16 * 1024;
/// Default virtual extent of the nursery.
pub const DEFAULT_NURSERY_BYTES: usize = 32 << 20;
/// Default virtual extent of the mark-sweep space.
pub const DEFAULT_MATURE_BYTES: usize = 256 << 20;
/// Default virtual extent of the large-object space.
pub const DEFAULT_LARGE_BYTES: usize = 256 << 20;
/// Default virtual extent of the immortal space.
pub const DEFAULT_IMMORTAL_BYTES: usize = 32 << 20;
/// Default number of entries per work-queue buffer: one page less a word.
pub const DEFAULT_QUEUE_BUFFER_ENTRIES: usize = BYTES_IN_PAGE / BYTES_IN_WORD - 1;
/// Default number of global reference slots.
pub const DEFAULT_GLOBAL_ROOT_SLOTS: usize = 1024;
/// Default size above which requests go to the large-object space.
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: usize = MAX_CELL_BYTES;
/// Default wall-clock budget of one collection's cycle-collector increment.
pub const DEFAULT_GC_TIME_CAP_MS: u64 = 1000;
/// Default headroom (pages) under which purple filtering always runs.
pub const DEFAULT_CYCLE_FILTER_PAGES: usize = 512;
/// Default headroom (pages) under which cycle detection always runs.
pub const DEFAULT_CYCLE_DETECTION_PAGES: usize = 1024;
/// Default metadata pages that bound one filter pass.
pub const DEFAULT_CYCLE_METADATA_PAGES: usize = 64;
/// Mark-grey checks the clock every this many visits.
pub const DEFAULT_GREY_VISIT_GRAIN: usize = 100;
/// Mark-grey visits per inner loop before re-checking the deadline.
pub const DEFAULT_GREY_VISIT_BOUND: usize = 10;
/// Purple entries filtered per inner loop before re-checking the deadline.
pub const DEFAULT_FILTER_BOUND: usize = 8192;

/// Which collection policy a plan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanKind {
    /// Copying nursery, mark-sweep mature space, large objects, immortal
    /// space; every collection traces the whole heap.
    #[default]
    Hybrid,
    /// Deferred reference counting over mark-sweep and large objects with
    /// trial-deletion cycle collection.
    RefCount,
}

impl PlanKind {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::RefCount => "refcount",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlanKind {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hybrid" | "tracing" => Ok(Self::Hybrid),
            "refcount" | "rc" => Ok(Self::RefCount),
            _ => Err(GcError::UnsupportedPlan(s.to_owned())),
        }
    }
}

/// Configuration for a [`Plan`](crate::plan::Plan).
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Collection policy.
    pub plan: PlanKind,
    /// Total page budget; `poll` requests a collection once reserved pages
    /// exceed it.
    pub heap_pages: usize,
    /// Virtual extent of the nursery in bytes (hybrid plan only).
    pub nursery_bytes: usize,
    /// Virtual extent of the mark-sweep space in bytes.
    pub mature_bytes: usize,
    /// Virtual extent of the large-object space in bytes.
    pub large_bytes: usize,
    /// Virtual extent of the immortal space in bytes.
    pub immortal_bytes: usize,
    /// Number of collector threads kept by the plan.
    pub collector_threads: usize,
    /// Entries per work-queue buffer.
    pub queue_buffer_entries: usize,
    /// Capacity of the global reference table.
    pub global_root_slots: usize,
    /// Requests larger than this many bytes go to the large-object space.
    pub large_object_threshold: usize,
    /// Wall-clock budget for a collection's cycle-collector increment.
    pub gc_time_cap: Duration,
    /// Purple filtering runs unconditionally below this much headroom.
    pub cycle_filter_pages: usize,
    /// Cycle detection runs unconditionally below this much headroom.
    pub cycle_detection_pages: usize,
    /// Metadata pages bounding one purple filter pass.
    pub cycle_metadata_pages: usize,
    /// Mark-grey checks the clock every this many visits.
    pub grey_visit_grain: usize,
    /// Mark-grey visits per inner loop.
    pub grey_visit_bound: usize,
    /// Purple entries filtered per inner loop.
    pub filter_bound: usize,
    /// Emit per-queue diagnostics during collections.
    pub verbose: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            plan: PlanKind::default(),
            heap_pages: DEFAULT_HEAP_PAGES,
            nursery_bytes: DEFAULT_NURSERY_BYTES,
            mature_bytes: DEFAULT_MATURE_BYTES,
            large_bytes: DEFAULT_LARGE_BYTES,
            immortal_bytes: DEFAULT_IMMORTAL_BYTES,
            collector_threads: crate::available_parallelism().min(4),
            queue_buffer_entries: DEFAULT_QUEUE_BUFFER_ENTRIES,
            global_root_slots: DEFAULT_GLOBAL_ROOT_SLOTS,
            large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
            gc_time_cap: Duration::from_millis(DEFAULT_GC_TIME_CAP_MS),
            cycle_filter_pages: DEFAULT_CYCLE_FILTER_PAGES,
            cycle_detection_pages: DEFAULT_CYCLE_DETECTION_PAGES,
            cycle_metadata_pages: DEFAULT_CYCLE_METADATA_PAGES,
            grey_visit_grain: DEFAULT_GREY_VISIT_GRAIN,
            grey_visit_bound: DEFAULT_GREY_VISIT_BOUND,
            filter_bound: DEFAULT_FILTER_BOUND,
            verbose: false,
        }
    }
}

impl GcConfig {
    /// Default configuration for the given plan.
    #[must_use]
    pub fn new(plan: PlanKind) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    /// Set the number of collector threads (at least one).
    pub const fn set_collector_threads(&mut self, threads: usize) {
        self.collector_threads = if threads < 1 { 1 } else { threads };
    }

    /// Set the heap budget in pages.
    pub const fn set_heap_pages(&mut self, pages: usize) {
        self.heap_pages = pages;
    }

    /// Set the cycle-collector time cap.
    pub const fn set_gc_time_cap(&mut self, cap: Duration) {
        self.gc_time_cap = cap;
    }

    /// Make the cycle collector filter and detect on every collection.
    pub const fn set_eager_cycle_collection(&mut self) {
        self.cycle_filter_pages = 0;
        self.cycle_detection_pages = 0;
    }

    /// Enable or disable verbose queue diagnostics.
    pub const fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Maximum number of purple entries one filter pass may move.
    #[must_use]
    pub const fn purple_filter_limit(&self) -> usize {
        // Half a page's worth of entries per metadata page.
        self.cycle_metadata_pages * (BYTES_IN_PAGE / BYTES_IN_WORD / 2)
    }

    /// Checks every field for a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] naming the first rejected field.
    pub fn validate(&self) -> GcResult<()> {
        if self.heap_pages == 0 {
            return Err(GcError::invalid("heap_pages", "must be greater than zero"));
        }
        for (field, bytes) in [
            ("nursery_bytes", self.nursery_bytes),
            ("mature_bytes", self.mature_bytes),
            ("large_bytes", self.large_bytes),
            ("immortal_bytes", self.immortal_bytes),
        ] {
            if bytes < BYTES_IN_BLOCK || bytes % BYTES_IN_BLOCK != 0 {
                return Err(GcError::invalid(
                    field,
                    format!("must be a non-zero multiple of {BYTES_IN_BLOCK} bytes"),
                ));
            }
        }
        if self.collector_threads == 0 {
            return Err(GcError::invalid("collector_threads", "must be at least 1"));
        }
        if self.queue_buffer_entries < 2 {
            return Err(GcError::invalid("queue_buffer_entries", "must be at least 2"));
        }
        if self.large_object_threshold == 0 || self.large_object_threshold > MAX_CELL_BYTES {
            return Err(GcError::invalid(
                "large_object_threshold",
                format!("must lie in 1..={MAX_CELL_BYTES}"),
            ));
        }
        if self.gc_time_cap.is_zero() {
            return Err(GcError::invalid("gc_time_cap", "must be greater than zero"));
        }
        if self.grey_visit_grain == 0 || self.grey_visit_bound == 0 || self.filter_bound == 0 {
            return Err(GcError::invalid(
                "grey_visit_grain",
                "visit grain and loop bounds must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        GcConfig::default().validate().unwrap();
        GcConfig::new(PlanKind::RefCount).validate().unwrap();
    }

    #[test]
    fn plan_kind_parses_known_names() {
        assert_eq!("hybrid".parse::<PlanKind>().unwrap(), PlanKind::Hybrid);
        assert_eq!("RC".parse::<PlanKind>().unwrap(), PlanKind::RefCount);
        assert!(matches!(
            "semispace".parse::<PlanKind>(),
            Err(GcError::UnsupportedPlan(name)) if name == "semispace"
        ));
    }

    #[test]
    fn rejects_unaligned_extent() {
        let config = GcConfig {
            mature_bytes: BYTES_IN_BLOCK + 1,
            ..GcConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GcError::InvalidConfig { field: "mature_bytes", .. })
        ));
    }

    #[test]
    fn rejects_oversized_small_object_threshold() {
        let config = GcConfig {
            large_object_threshold: MAX_CELL_BYTES + 1,
            ..GcConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn setters_clamp() {
        let mut config = GcConfig::default();
        config.set_collector_threads(0);
        assert_eq!(config.collector_threads, 1);
        config.set_eager_cycle_collection();
        assert_eq!(config.cycle_filter_pages, 0);
        assert_eq!(config.cycle_detection_pages, 0);
    }

    #[test]
    fn purple_filter_limit_scales_with_metadata_pages() {
        let mut config = GcConfig::default();
        config.cycle_metadata_pages = 2;
        assert_eq!(config.purple_filter_limit(), 2 * BYTES_IN_PAGE / BYTES_IN_WORD / 2);
    }
}
