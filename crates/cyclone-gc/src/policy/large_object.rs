//! Large-object space managed as a treadmill.
//!
//! Every large object gets its own page-granular chunk. A chunk starts with
//! a small header linking it into one of two lists: `from` holds chunks not
//! yet reached in the current trace, `to` holds chunks that were. Release
//! frees whatever is left in `from` and the lists swap roles.
//!
//! Each header records which list holds the chunk as a tag compared against
//! the treadmill's current `to` tag, so swapping the lists is a tag flip.
//! Live chunk addresses are also kept in a set outside the chunks, which
//! answers membership and double-free checks without reading released
//! memory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, ObjectReference};
use crate::constants::{bytes_to_pages, BYTES_IN_WORD};
use crate::error::fatal_in_space;
use crate::policy::Allocate;
use crate::space::Space;

/// Bytes reserved at the start of every chunk.
pub const CHUNK_HEADER_BYTES: usize = 4 * BYTES_IN_WORD;

const PREV: usize = 0;
const NEXT: usize = BYTES_IN_WORD;
const PAGES: usize = 2 * BYTES_IN_WORD;
const LIST: usize = 3 * BYTES_IN_WORD;

#[derive(Debug, Clone, Copy)]
struct Chunk(Address);

impl Chunk {
    fn of(object: ObjectReference) -> Self {
        Self(object.to_address().minus(CHUNK_HEADER_BYTES))
    }

    fn object(self) -> Address {
        self.0.plus(CHUNK_HEADER_BYTES)
    }

    fn field(self, offset: usize) -> usize {
        // SAFETY: chunk headers stay committed while the chunk is listed.
        unsafe { self.0.plus(offset).load_word() }
    }

    fn set_field(self, offset: usize, value: usize) {
        // SAFETY: as above; list surgery happens under the treadmill lock.
        unsafe { self.0.plus(offset).store_word(value) }
    }

    fn prev(self) -> Address {
        Address::from_usize(self.field(PREV))
    }

    fn next(self) -> Address {
        Address::from_usize(self.field(NEXT))
    }

    fn pages(self) -> usize {
        self.field(PAGES)
    }

    fn list_tag(self) -> usize {
        self.field(LIST)
    }
}

/// Intrusive doubly linked list of chunks.
#[derive(Debug, Default)]
struct ChunkList {
    head: Address,
    len: usize,
}

impl ChunkList {
    fn push(&mut self, chunk: Chunk) {
        chunk.set_field(PREV, 0);
        chunk.set_field(NEXT, self.head.as_usize());
        if !self.head.is_zero() {
            Chunk(self.head).set_field(PREV, chunk.0.as_usize());
        }
        self.head = chunk.0;
        self.len += 1;
    }

    fn unlink(&mut self, chunk: Chunk) {
        let (prev, next) = (chunk.prev(), chunk.next());
        if prev.is_zero() {
            self.head = next;
        } else {
            Chunk(prev).set_field(NEXT, next.as_usize());
        }
        if !next.is_zero() {
            Chunk(next).set_field(PREV, prev.as_usize());
        }
        self.len -= 1;
    }

    fn iter(&self) -> impl Iterator<Item = Chunk> + '_ {
        std::iter::successors((!self.head.is_zero()).then_some(Chunk(self.head)), |c| {
            let next = c.next();
            (!next.is_zero()).then_some(Chunk(next))
        })
    }
}

#[derive(Debug, Default)]
struct Treadmill {
    from: ChunkList,
    to: ChunkList,
    /// Tag of chunks on `to`; chunks on `from` carry the other value.
    to_tag: usize,
    live: HashSet<Address>,
}

impl Treadmill {
    fn push_from(&mut self, chunk: Chunk) {
        chunk.set_field(LIST, self.to_tag ^ 1);
        self.from.push(chunk);
    }

    fn move_to(&mut self, chunk: Chunk) {
        self.from.unlink(chunk);
        chunk.set_field(LIST, self.to_tag);
        self.to.push(chunk);
    }

    fn unlink(&mut self, chunk: Chunk) {
        if chunk.list_tag() == self.to_tag {
            self.to.unlink(chunk);
        } else {
            self.from.unlink(chunk);
        }
    }
}

/// The large-object space.
#[derive(Debug)]
pub struct LargeObjectSpace {
    space: Space,
    treadmill: Mutex<Treadmill>,
    mark_state: AtomicBool,
}

impl LargeObjectSpace {
    /// Wraps a page-granular space.
    #[must_use]
    pub fn new(space: Space) -> Self {
        Self {
            space,
            treadmill: Mutex::new(Treadmill::default()),
            mark_state: AtomicBool::new(false),
        }
    }

    /// Underlying space.
    #[must_use]
    pub const fn space(&self) -> &Space {
        &self.space
    }

    /// Value a header's mark bit holds once the object is marked in the
    /// current (or most recent) collection.
    #[must_use]
    pub fn mark_state(&self) -> bool {
        self.mark_state.load(Ordering::Acquire)
    }

    /// Whether `object` lies in this space.
    #[inline]
    #[must_use]
    pub fn contains(&self, object: ObjectReference) -> bool {
        self.space.contains(object.to_address())
    }

    /// Whether `object` is the start of a live chunk.
    #[must_use]
    pub fn contains_object(&self, object: ObjectReference) -> bool {
        if !self.contains(object) {
            return false;
        }
        self.treadmill.lock().live.contains(&Chunk::of(object).0)
    }

    /// Allocates a chunk for `bytes` bytes and returns the object address.
    pub fn alloc(&self, bytes: usize, align: usize) -> Address {
        if align > CHUNK_HEADER_BYTES {
            fatal_in_space(self.space.name(), format!("unsupported alignment {align}"));
        }
        let pages = bytes_to_pages(bytes + CHUNK_HEADER_BYTES);
        let chunk = Chunk(self.space.acquire(pages));
        chunk.set_field(PAGES, pages);
        let mut treadmill = self.treadmill.lock();
        treadmill.live.insert(chunk.0);
        treadmill.push_from(chunk);
        chunk.object()
    }

    /// Starts a collection: flips the mark polarity so every object is
    /// unmarked.
    pub fn prepare(&self) {
        self.mark_state.fetch_xor(true, Ordering::AcqRel);
    }

    /// Marks `object` and moves its chunk to the `to` list. Returns `true`
    /// for the first caller only.
    pub fn test_and_mark(&self, object: ObjectReference) -> bool {
        if !object.header().test_and_mark(self.mark_state()) {
            return false;
        }
        let chunk = Chunk::of(object);
        self.treadmill.lock().move_to(chunk);
        true
    }

    /// Whether `object` is marked in the current collection.
    #[must_use]
    pub fn is_marked(&self, object: ObjectReference) -> bool {
        object.header().is_marked(self.mark_state())
    }

    /// Frees every chunk left unreached and makes the reached chunks the new
    /// `from` list. Returns the number of objects freed.
    pub fn release(&self) -> usize {
        let mut treadmill = self.treadmill.lock();
        let dead = std::mem::take(&mut treadmill.from);
        let freed = dead.len;
        let chunks: Vec<Chunk> = dead.iter().collect();
        for chunk in chunks {
            treadmill.live.remove(&chunk.0);
            self.space.release(chunk.0, chunk.pages());
        }
        treadmill.from = std::mem::take(&mut treadmill.to);
        treadmill.to_tag ^= 1;
        freed
    }

    /// Frees `object` immediately. Freeing a chunk twice is fatal.
    pub fn free(&self, object: ObjectReference) {
        let chunk = Chunk::of(object);
        let mut treadmill = self.treadmill.lock();
        if !treadmill.live.remove(&chunk.0) {
            drop(treadmill);
            fatal_in_space(self.space.name(), format!("double free of {object}"));
        }
        let pages = chunk.pages();
        treadmill.unlink(chunk);
        drop(treadmill);
        self.space.release(chunk.0, pages);
    }

    /// Number of live chunks.
    #[must_use]
    pub fn object_count(&self) -> usize {
        let treadmill = self.treadmill.lock();
        treadmill.from.len + treadmill.to.len
    }
}

/// Stateless front end over a [`LargeObjectSpace`].
#[derive(Debug, Clone)]
pub struct LargeObjectAllocator {
    space: Arc<LargeObjectSpace>,
}

impl LargeObjectAllocator {
    /// Creates a front end.
    #[must_use]
    pub const fn new(space: Arc<LargeObjectSpace>) -> Self {
        Self { space }
    }
}

impl Allocate for LargeObjectAllocator {
    fn alloc(&mut self, bytes: usize, align: usize) -> Address {
        self.space.alloc(bytes, align)
    }

    fn reset(&mut self) {}

    fn space(&self) -> &Space {
        self.space.space()
    }
}
