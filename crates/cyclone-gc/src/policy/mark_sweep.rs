//! Mark-sweep space with size-classed cells.
//!
//! Each block holds cells of one size class. The block header carries a
//! bitmap with two bits per 8-byte granule: bit `2i` is the in-use bit and
//! bit `2i + 1` the mark bit of the cell starting at granule `i`. Sweeping a
//! bitmap word keeps exactly the in-use bits whose mark bit is set and
//! clears every mark.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, ObjectReference};
use crate::constants::{
    pages_to_bytes, BITS_IN_WORD, BYTES_IN_BLOCK, LOG_BYTES_IN_GRANULE, MIN_ALIGNMENT,
    PAGES_IN_BLOCK,
};
use crate::error::fatal_in_space;
use crate::policy::Allocate;
use crate::space::Space;

/// Cell sizes, in bytes, of each size class.
pub const SIZE_CLASSES: [usize; 19] = [
    16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 6144,
    8192,
];
/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();
/// Largest request the mark-sweep space serves.
pub const MAX_CELL_BYTES: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

const GRANULES_IN_BLOCK: usize = BYTES_IN_BLOCK >> LOG_BYTES_IN_GRANULE;
const SLOTS_PER_WORD: usize = BITS_IN_WORD / 2;
const BITMAP_WORDS: usize = GRANULES_IN_BLOCK / SLOTS_PER_WORD;
const IN_USE_MASK: usize = usize::MAX / 3;
const MARK_MASK: usize = IN_USE_MASK << 1;

#[repr(C)]
struct BlockHeader {
    size_class: usize,
    cell_bytes: usize,
    cell_count: usize,
    first_cell: usize,
    bitmap: [AtomicUsize; BITMAP_WORDS],
}

const FIRST_CELL_OFFSET: usize = std::mem::size_of::<BlockHeader>().next_multiple_of(16);

/// Returns the size class serving `bytes`, if any.
#[must_use]
pub fn size_class_for(bytes: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&cell| cell >= bytes)
}

/// A block of the mark-sweep space, identified by its aligned start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block(Address);

impl Block {
    fn of(addr: Address) -> Self {
        Self(addr.align_down(BYTES_IN_BLOCK))
    }

    fn header(self) -> &'static BlockHeader {
        // SAFETY: blocks are committed for as long as they are listed in the space.
        unsafe { &*self.0.to_mut_ptr::<BlockHeader>() }
    }

    /// Writes the header of a freshly acquired (zeroed) block.
    fn initialize(self, size_class: usize) {
        let cell_bytes = SIZE_CLASSES[size_class];
        let header = self.0.to_mut_ptr::<BlockHeader>();
        // SAFETY: the block is committed, zeroed and exclusively ours; the
        // bitmap is already all-zero, so only the scalar fields are written.
        unsafe {
            (*header).size_class = size_class;
            (*header).cell_bytes = cell_bytes;
            (*header).cell_count = (BYTES_IN_BLOCK - FIRST_CELL_OFFSET) / cell_bytes;
            (*header).first_cell = FIRST_CELL_OFFSET;
        }
    }

    fn size_class(self) -> usize {
        self.header().size_class
    }

    fn cell_count(self) -> usize {
        self.header().cell_count
    }

    fn cell(self, index: usize) -> Address {
        let header = self.header();
        self.0.plus(header.first_cell + index * header.cell_bytes)
    }

    /// Bitmap word and in-use bit for the cell starting at `addr`.
    fn slot(self, addr: Address) -> (&'static AtomicUsize, usize) {
        let granule = addr.diff(self.0) >> LOG_BYTES_IN_GRANULE;
        let word = &self.header().bitmap[granule / SLOTS_PER_WORD];
        (word, 1 << ((granule % SLOTS_PER_WORD) * 2))
    }

    fn is_in_use(self, addr: Address) -> bool {
        let (word, bit) = self.slot(addr);
        word.load(Ordering::Acquire) & bit != 0
    }

    /// Sets the in-use bit, returning `true` if it was clear.
    fn set_in_use(self, addr: Address) -> bool {
        let (word, bit) = self.slot(addr);
        word.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Clears the in-use and mark bits, returning `true` if the cell was in use.
    fn clear_in_use(self, addr: Address) -> bool {
        let (word, bit) = self.slot(addr);
        word.fetch_and(!(bit | bit << 1), Ordering::AcqRel) & bit != 0
    }

    /// Sets the mark bit, returning `true` if this call set it.
    fn test_and_mark(self, addr: Address) -> bool {
        let (word, bit) = self.slot(addr);
        let mark = bit << 1;
        word.fetch_or(mark, Ordering::AcqRel) & mark == 0
    }

    fn is_marked(self, addr: Address) -> bool {
        let (word, bit) = self.slot(addr);
        word.load(Ordering::Acquire) & (bit << 1) != 0
    }

    /// Keeps marked cells, frees the rest, clears marks. Returns
    /// `(live, freed)` cell counts.
    fn sweep(self) -> (usize, usize) {
        let mut live = 0;
        let mut freed = 0;
        for word in &self.header().bitmap {
            let bits = word.load(Ordering::Relaxed);
            if bits == 0 {
                continue;
            }
            let survivors = bits & (bits >> 1) & IN_USE_MASK;
            freed += (bits & IN_USE_MASK & !survivors).count_ones() as usize;
            live += survivors.count_ones() as usize;
            word.store(survivors, Ordering::Relaxed);
        }
        (live, freed)
    }

    fn live_cells(self) -> usize {
        self.header()
            .bitmap
            .iter()
            .map(|w| (w.load(Ordering::Relaxed) & IN_USE_MASK).count_ones() as usize)
            .sum()
    }

    fn clear_marks(self) {
        for word in &self.header().bitmap {
            word.fetch_and(!MARK_MASK, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct BlockLists {
    /// Every block of each class.
    all: [Vec<Block>; NUM_SIZE_CLASSES],
    /// Unowned blocks with at least one free cell.
    available: [Vec<Block>; NUM_SIZE_CLASSES],
}

/// Outcome of a sweep or reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Cells still in use.
    pub live_cells: usize,
    /// Cells freed by this pass.
    pub freed_cells: usize,
    /// Empty blocks returned to the space.
    pub blocks_released: usize,
}

/// The mark-sweep space.
#[derive(Debug)]
pub struct MarkSweepSpace {
    space: Space,
    blocks: Mutex<BlockLists>,
    cells_freed: AtomicUsize,
}

impl MarkSweepSpace {
    /// Wraps a block-granular space.
    #[must_use]
    pub fn new(space: Space) -> Self {
        Self {
            space,
            blocks: Mutex::new(BlockLists {
                all: std::array::from_fn(|_| Vec::new()),
                available: std::array::from_fn(|_| Vec::new()),
            }),
            cells_freed: AtomicUsize::new(0),
        }
    }

    /// Underlying space.
    #[must_use]
    pub const fn space(&self) -> &Space {
        &self.space
    }

    /// Whether `object` lies in this space.
    #[inline]
    #[must_use]
    pub fn contains(&self, object: ObjectReference) -> bool {
        self.space.contains(object.to_address())
    }

    fn acquire_block(&self, size_class: usize) -> Block {
        let mut lists = self.blocks.lock();
        if let Some(block) = lists.available[size_class].pop() {
            return block;
        }
        let block = Block(self.space.acquire(PAGES_IN_BLOCK));
        block.initialize(size_class);
        lists.all[size_class].push(block);
        block
    }

    fn return_block(&self, block: Block) {
        self.blocks.lock().available[block.size_class()].push(block);
    }

    /// Sets the mark bit of `object`, returning `true` if it was unmarked.
    pub fn test_and_mark(&self, object: ObjectReference) -> bool {
        let addr = object.to_address();
        Block::of(addr).test_and_mark(addr)
    }

    /// Whether `object` is marked in the current collection.
    #[must_use]
    pub fn is_marked(&self, object: ObjectReference) -> bool {
        let addr = object.to_address();
        Block::of(addr).is_marked(addr)
    }

    /// Whether `object`'s cell is in use.
    #[must_use]
    pub fn is_allocated(&self, object: ObjectReference) -> bool {
        let addr = object.to_address();
        // Pages past the high-water mark have never been committed.
        let mapped = self.space.start().plus(pages_to_bytes(self.space.mapped_pages()));
        self.contains(object) && addr < mapped && Block::of(addr).is_in_use(addr)
    }

    /// Frees `object`'s cell immediately. Freeing a free cell is fatal.
    pub fn free(&self, object: ObjectReference) {
        let addr = object.to_address();
        if !Block::of(addr).clear_in_use(addr) {
            fatal_in_space(self.space.name(), format!("double free of {object}"));
        }
        self.cells_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Cells freed through [`MarkSweepSpace::free`] since creation.
    #[must_use]
    pub fn cells_freed(&self) -> usize {
        self.cells_freed.load(Ordering::Relaxed)
    }

    /// Frees unmarked cells after a trace and clears all marks.
    ///
    /// Every allocator over this space must have been reset.
    pub fn sweep(&self) -> SweepStats {
        self.rebuild(Block::sweep)
    }

    /// Returns blocks emptied by explicit frees to the space and rebuilds
    /// the available lists. Mark bits are ignored and cleared.
    ///
    /// Every allocator over this space must have been reset.
    pub fn reclaim(&self) -> SweepStats {
        self.rebuild(|block| {
            block.clear_marks();
            (block.live_cells(), 0)
        })
    }

    fn rebuild(&self, mut visit: impl FnMut(Block) -> (usize, usize)) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut lists = self.blocks.lock();
        let lists = &mut *lists;
        for (all, available) in lists.all.iter_mut().zip(lists.available.iter_mut()) {
            available.clear();
            all.retain(|&block| {
                let (live, freed) = visit(block);
                stats.live_cells += live;
                stats.freed_cells += freed;
                if live == 0 {
                    self.space.release(block.0, PAGES_IN_BLOCK);
                    stats.blocks_released += 1;
                    false
                } else {
                    if live < block.cell_count() {
                        available.push(block);
                    }
                    true
                }
            });
        }
        stats
    }

    /// Number of blocks currently held.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().all.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    block: Block,
    next: usize,
}

/// Thread-local front end over a [`MarkSweepSpace`].
///
/// Owns at most one block per size class and scans its bitmap for free
/// cells.
#[derive(Debug)]
pub struct MarkSweepAllocator {
    space: Arc<MarkSweepSpace>,
    current: [Option<Cursor>; NUM_SIZE_CLASSES],
}

impl MarkSweepAllocator {
    /// Creates an allocator owning no blocks.
    #[must_use]
    pub const fn new(space: Arc<MarkSweepSpace>) -> Self {
        Self {
            space,
            current: [None; NUM_SIZE_CLASSES],
        }
    }

    /// The space this allocator draws from.
    #[must_use]
    pub const fn mark_sweep(&self) -> &Arc<MarkSweepSpace> {
        &self.space
    }

    /// Allocates a cell for an object copied during a trace. The cell is
    /// born marked so the following sweep keeps it.
    pub fn alloc_copy(&mut self, bytes: usize) -> Address {
        let cell = self.alloc_cell(bytes, MIN_ALIGNMENT);
        Block::of(cell).test_and_mark(cell);
        cell
    }

    fn alloc_cell(&mut self, bytes: usize, align: usize) -> Address {
        if align > MIN_ALIGNMENT {
            fatal_in_space(
                self.space.space().name(),
                format!("unsupported alignment {align}"),
            );
        }
        let Some(class) = size_class_for(bytes) else {
            fatal_in_space(
                self.space.space().name(),
                format!("request of {bytes} bytes exceeds the largest cell"),
            );
        };
        loop {
            let cursor = match self.current[class] {
                Some(cursor) => cursor,
                None => Cursor {
                    block: self.space.acquire_block(class),
                    next: 0,
                },
            };
            let block = cursor.block;
            let found = (cursor.next..block.cell_count())
                .find(|&i| !block.is_in_use(block.cell(i)) && block.set_in_use(block.cell(i)));
            match found {
                Some(i) => {
                    self.current[class] = Some(Cursor { block, next: i + 1 });
                    let cell = block.cell(i);
                    // SAFETY: the cell is committed and now exclusively ours.
                    unsafe { cell.zero(SIZE_CLASSES[class]) };
                    return cell;
                }
                None => self.current[class] = None,
            }
        }
    }
}

impl Allocate for MarkSweepAllocator {
    fn alloc(&mut self, bytes: usize, align: usize) -> Address {
        self.alloc_cell(bytes, align)
    }

    fn reset(&mut self) {
        for cursor in self.current.iter_mut().filter_map(Option::take) {
            if cursor.next < cursor.block.cell_count() {
                self.space.return_block(cursor.block);
            }
        }
    }

    fn space(&self) -> &Space {
        self.space.space()
    }
}
