//! Virtual-memory primitives for the collector's spaces.
//!
//! A [`Mmap`] is an anonymous mapping that may be reserved without backing
//! storage and committed page run by page run. Released runs are decommitted,
//! which hands the physical pages back to the OS and guarantees the next
//! commit observes zeroed memory.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to a reserved region of address space.
///
/// The region is released when this handle is dropped. When an alignment was
/// requested, [`Mmap::ptr`] returns the aligned start inside a larger
/// underlying mapping.
pub struct Mmap {
    inner: os::MmapInner,
    offset: usize,
    len: usize,
}

impl Mmap {
    /// Returns a pointer to the (aligned) start of the region.
    pub fn ptr(&self) -> *mut u8 {
        // SAFETY: `offset + len` never exceeds the underlying mapping.
        unsafe { self.inner.ptr().add(self.offset) }
    }

    /// Returns the usable length of the region in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region is empty. Mappings are never empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Makes `[offset, offset + len)` readable and writable.
    ///
    /// Committing pages that are already committed is allowed.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range lies inside the mapping owned by `self`.
        unsafe { self.inner.commit(self.offset + offset, len) }
    }

    /// Returns the physical pages behind `[offset, offset + len)` to the OS.
    ///
    /// The range reads as zero once committed again.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range lies inside the mapping owned by `self`.
        unsafe { self.inner.decommit(self.offset + offset, len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        let in_bounds = offset.checked_add(len).is_some_and(|end| end <= self.len);
        if !in_bounds || offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page aligned and inside the mapping",
            ));
        }
        Ok(())
    }
}

// SAFETY: the mapping is plain memory; callers synchronise access to its contents.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    reserve_only: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            reserve_only: false,
            no_reserve: false,
        }
    }

    /// Sets the usable length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests that the start of the mapping be aligned to `align` bytes.
    ///
    /// `align` must be a power of two. Alignments up to the allocation
    /// granularity are free; larger ones over-reserve by `align` bytes.
    #[must_use]
    pub const fn alignment(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Reserves address space only. Pages must be committed with
    /// [`Mmap::commit`] before they are touched.
    #[must_use]
    pub const fn reserve_only(mut self, reserve_only: bool) -> Self {
        self.reserve_only = reserve_only;
        self
    }

    /// Skips swap reservation for the mapping (`MAP_NORESERVE` on Linux).
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous mapping.
    ///
    /// # Safety
    ///
    /// The returned region is raw memory. Pointers derived from it must not
    /// outlive the [`Mmap`], and reserve-only regions must be committed before
    /// being accessed.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let align = self.align.max(1);
        if !align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let padding = if align > allocation_granularity() { align } else { 0 };
        let total = self
            .len
            .checked_add(padding)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        let inner = unsafe { os::MmapInner::map_anon(total, self.reserve_only, self.no_reserve)? };
        let base = inner.ptr() as usize;
        let offset = base.next_multiple_of(align) - base;

        Ok(Mmap {
            inner,
            offset,
            len: self.len,
        })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
