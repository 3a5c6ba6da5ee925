//! Unit constants shared by every space and allocator.
//!
//! The engine's page is a fixed 4 KiB accounting unit. Commit and decommit
//! requests are widened to the OS page size by [`crate::space::Space`].

/// log2 of the machine word size in bytes.
pub const LOG_BYTES_IN_WORD: usize = std::mem::size_of::<usize>().trailing_zeros() as usize;
/// Machine word size in bytes.
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// Bits in a machine word.
pub const BITS_IN_WORD: usize = usize::BITS as usize;

/// log2 of the accounting page size.
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// Accounting page size in bytes.
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the number of pages per block.
pub const LOG_PAGES_IN_BLOCK: usize = 3;
/// Pages per block.
pub const PAGES_IN_BLOCK: usize = 1 << LOG_PAGES_IN_BLOCK;
/// log2 of the block size in bytes.
pub const LOG_BYTES_IN_BLOCK: usize = LOG_BYTES_IN_PAGE + LOG_PAGES_IN_BLOCK;
/// Block size in bytes. Bump pointers never allocate across a block boundary
/// without taking the slow path.
pub const BYTES_IN_BLOCK: usize = 1 << LOG_BYTES_IN_BLOCK;

/// log2 of the mark-sweep bitmap granule.
pub const LOG_BYTES_IN_GRANULE: usize = 3;
/// Mark-sweep bitmap granule in bytes.
pub const BYTES_IN_GRANULE: usize = 1 << LOG_BYTES_IN_GRANULE;

/// Minimum alignment of every object start.
pub const MIN_ALIGNMENT: usize = BYTES_IN_WORD;

/// Rounds a byte count up to whole pages.
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    bytes.div_ceil(BYTES_IN_PAGE)
}

/// Converts pages to bytes.
#[inline]
#[must_use]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}
