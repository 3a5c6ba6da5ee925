//! Increment bookkeeping for the cycle collector.

use std::fmt;

/// Stage the cycle collector is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    /// Between increments.
    #[default]
    Idle,
    /// Moving new purple candidates into the mature queue.
    Filter,
    /// Moving mature candidates into the filtered queue.
    MatureFilter,
    /// Trial deletion from the filtered candidates.
    MarkGrey,
    /// Restoring counts of externally referenced subgraphs.
    Scan,
    /// Freeing white subgraphs.
    Collect,
    /// Returning objects on the free list to their spaces.
    Free,
}

impl CyclePhase {
    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Filter => "filter",
            Self::MatureFilter => "mature_filter",
            Self::MarkGrey => "mark_grey",
            Self::Scan => "scan",
            Self::Collect => "collect",
            Self::Free => "free",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No candidate work is left over.
    Complete,
    /// Candidates remain, either because the deadline hit or because a
    /// mark-grey traversal was abandoned and requeued.
    Partial,
}

const LOG_WRIGGLE: u32 = 2;

/// Probabilistic trigger based on headroom.
///
/// With plenty of room relative to `threshold_pages` this acts on no
/// collection; as headroom shrinks it acts on every fourth, every second,
/// then every collection. Zero headroom or a zero threshold always act.
#[must_use]
pub fn should_act(pages_available: usize, threshold_pages: usize, collection_count: usize) -> bool {
    if pages_available == 0 || threshold_pages == 0 {
        return true;
    }
    let slack = log2_ceil(pages_available / threshold_pages);
    if slack > LOG_WRIGGLE {
        return false;
    }
    let mask = (1usize << slack) - 1;
    collection_count & mask == mask
}

/// Smallest `r` with `value <= 2^r`.
const fn log2_ceil(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}
