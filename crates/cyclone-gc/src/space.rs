//! Spaces: reserved virtual ranges with page accounting.
//!
//! A [`Space`] reserves its whole extent up front (block aligned, without
//! backing storage) and hands out page runs in multiples of its allocation
//! unit. Runs are committed when acquired and decommitted when released, so
//! every acquired run reads as zero. Ownership of an object is decided by
//! [`Space::contains`] alone.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::address::Address;
use crate::constants::{pages_to_bytes, BYTES_IN_BLOCK, BYTES_IN_PAGE, LOG_BYTES_IN_PAGE};
use crate::error::{fatal_in_space, GcError, GcResult};

#[derive(Debug, Default)]
struct SpaceState {
    /// Pages below this index have been handed out at least once.
    high_water: usize,
    /// Released runs as `(first_page, pages)`, sorted by `first_page`.
    free_runs: Vec<(usize, usize)>,
}

/// A reserved, block-aligned virtual address range.
pub struct Space {
    name: &'static str,
    mmap: Mmap,
    start: Address,
    extent: usize,
    unit_pages: usize,
    state: Mutex<SpaceState>,
    used_pages: AtomicUsize,
    mapped_pages: AtomicUsize,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("extent", &self.extent)
            .field("used_pages", &self.used_pages())
            .finish_non_exhaustive()
    }
}

impl Space {
    /// Reserves `bytes` of address space. Acquisitions are rounded up to
    /// `unit_pages` pages, and every run handed out is aligned to the unit
    /// (the start of the space is block aligned).
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Reservation`] if the OS refuses the reservation.
    pub fn reserve(name: &'static str, bytes: usize, unit_pages: usize) -> GcResult<Self> {
        debug_assert!(unit_pages.is_power_of_two());
        let extent = bytes.next_multiple_of(BYTES_IN_BLOCK);
        // SAFETY: the mapping is only touched through committed runs below.
        let mmap = unsafe {
            MmapOptions::new()
                .len(extent)
                .alignment(BYTES_IN_BLOCK)
                .reserve_only(true)
                .no_reserve(true)
                .map_anon()
        }
        .map_err(|source| GcError::Reservation {
            space: name,
            source,
        })?;
        let start = Address::from_ptr(mmap.ptr());
        Ok(Self {
            name,
            mmap,
            start,
            extent,
            unit_pages,
            state: Mutex::new(SpaceState::default()),
            used_pages: AtomicUsize::new(0),
            mapped_pages: AtomicUsize::new(0),
        })
    }

    /// Name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// First address of the space.
    #[must_use]
    pub const fn start(&self) -> Address {
        self.start
    }

    /// One past the last address of the space.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.start.plus(self.extent)
    }

    /// Size of the reservation in bytes.
    #[must_use]
    pub const fn extent(&self) -> usize {
        self.extent
    }

    /// Whether `addr` lies inside this space.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    /// Pages ever committed (high-water mark).
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.mapped_pages.load(Ordering::Relaxed)
    }

    /// Pages of the extent not currently handed out.
    #[must_use]
    pub fn available_pages(&self) -> usize {
        (self.extent >> LOG_BYTES_IN_PAGE).saturating_sub(self.used_pages())
    }

    /// Rounds a page count up to the allocation unit.
    #[must_use]
    pub const fn round_pages(&self, pages: usize) -> usize {
        pages.next_multiple_of(self.unit_pages)
    }

    /// Acquires a zeroed, committed run of at least `pages` pages.
    ///
    /// Exhausting the virtual range is fatal.
    pub fn acquire(&self, pages: usize) -> Address {
        let pages = self.round_pages(pages.max(1));
        let first = {
            let mut state = self.state.lock();
            if let Some(i) = state.free_runs.iter().position(|&(_, len)| len >= pages) {
                let (first, len) = state.free_runs[i];
                if len == pages {
                    state.free_runs.remove(i);
                } else {
                    state.free_runs[i] = (first + pages, len - pages);
                }
                first
            } else {
                let first = state.high_water;
                if pages_to_bytes(first + pages) > self.extent {
                    drop(state);
                    fatal_in_space(
                        self.name,
                        format!(
                            "space `{}` exhausted: {pages} pages requested, {} of {} in use",
                            self.name,
                            self.used_pages(),
                            self.extent >> LOG_BYTES_IN_PAGE
                        ),
                    );
                }
                state.high_water = first + pages;
                self.mapped_pages.store(state.high_water, Ordering::Relaxed);
                first
            }
        };
        self.map_pages(first, pages);
        self.used_pages.fetch_add(pages, Ordering::Relaxed);
        self.start.plus(pages_to_bytes(first))
    }

    /// Commits `pages` pages starting at page index `first`, widened to OS
    /// page boundaries.
    fn map_pages(&self, first: usize, pages: usize) {
        let os_page = sys_alloc::page_size().max(BYTES_IN_PAGE);
        let begin = pages_to_bytes(first) / os_page * os_page;
        let end = pages_to_bytes(first + pages).next_multiple_of(os_page).min(self.mmap.len());
        if let Err(e) = self.mmap.commit(begin, end - begin) {
            fatal_in_space(self.name, format!("failed to commit {pages} pages: {e}"));
        }
    }

    /// Returns a run previously obtained from [`Space::acquire`].
    pub fn release(&self, start: Address, pages: usize) {
        debug_assert!(self.contains(start));
        let pages = self.round_pages(pages.max(1));
        let first = start.diff(self.start) >> LOG_BYTES_IN_PAGE;
        self.discard(first, pages);

        let mut state = self.state.lock();
        let at = state.free_runs.partition_point(|&(f, _)| f < first);
        state.free_runs.insert(at, (first, pages));
        // Merge with the following and preceding runs.
        if at + 1 < state.free_runs.len() {
            let (next_first, next_len) = state.free_runs[at + 1];
            if first + pages == next_first {
                state.free_runs[at].1 += next_len;
                state.free_runs.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_first, prev_len) = state.free_runs[at - 1];
            if prev_first + prev_len == first {
                state.free_runs[at - 1].1 += state.free_runs[at].1;
                state.free_runs.remove(at);
            }
        }
        drop(state);
        self.used_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    /// Releases every run at once.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        if state.high_water > 0 {
            self.discard(0, state.high_water);
        }
        state.high_water = 0;
        state.free_runs.clear();
        drop(state);
        self.used_pages.store(0, Ordering::Relaxed);
    }

    /// Drops the contents of a run so it reads as zero when reacquired.
    fn discard(&self, first: usize, pages: usize) {
        let os_page = sys_alloc::page_size();
        let offset = pages_to_bytes(first);
        let len = pages_to_bytes(pages);
        if offset % os_page == 0 && len % os_page == 0 {
            if let Err(e) = self.mmap.decommit(offset, len) {
                fatal_in_space(self.name, format!("failed to decommit {pages} pages: {e}"));
            }
        } else {
            // SAFETY: the run is committed and no longer handed out.
            unsafe { self.start.plus(offset).zero(len) };
        }
    }
}
