//! Header accessors.
//!
//! Every object starts with a status word, followed by a type word and, for
//! arrays, a length word. This module is the only place that knows the bit
//! layout of the status word:
//!
//! | bits  | meaning                                        |
//! |-------|------------------------------------------------|
//! | 0-1   | forwarding state (none, being forwarded, done) |
//! | 2     | mark bit, polarity flipped per collection      |
//! | 3-5   | trial-deletion color                           |
//! | 6     | buffered in a purple-stage queue               |
//! | 8..   | reference count                                |
//!
//! A forwarded object's status word holds the new address with the low two
//! bits set.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use crate::address::{Address, ObjectReference};
use crate::constants::BYTES_IN_WORD;
use crate::object::TypeId;

const FORWARDING_MASK: usize = 0b11;
const BEING_FORWARDED: usize = 0b01;
const FORWARDED: usize = 0b11;
const MARK_BIT: usize = 1 << 2;
const COLOR_SHIFT: usize = 3;
const COLOR_MASK: usize = 0b111 << COLOR_SHIFT;
const BUFFERED_BIT: usize = 1 << 6;
const RC_SHIFT: usize = 8;
const RC_UNIT: usize = 1 << RC_SHIFT;

pub(crate) const TYPE_OFFSET: usize = BYTES_IN_WORD;
pub(crate) const LENGTH_OFFSET: usize = 2 * BYTES_IN_WORD;

/// Trial-deletion color of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Color {
    /// In use or proven live.
    Black = 0,
    /// Tentatively dead during mark-grey.
    Grey = 1,
    /// Proven dead, waiting to be collected.
    White = 2,
    /// Candidate root of a garbage cycle.
    Purple = 3,
    /// Acyclic; never considered for cycle detection.
    Green = 4,
}

impl Color {
    const fn from_status(status: usize) -> Self {
        match (status & COLOR_MASK) >> COLOR_SHIFT {
            0 => Self::Black,
            1 => Self::Grey,
            2 => Self::White,
            3 => Self::Purple,
            _ => Self::Green,
        }
    }

    const fn bits(self) -> usize {
        (self as usize) << COLOR_SHIFT
    }
}

/// Forwarding state of an object in a copying space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingState {
    /// Not yet claimed by any collector.
    Unforwarded,
    /// A collector is copying the object.
    BeingForwarded,
    /// Copied; the status word holds the new address.
    Forwarded(ObjectReference),
}

/// Handle to an object's header words.
///
/// The referenced object must have been allocated by a plan and not yet
/// freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRef(ObjectReference);

impl ObjectReference {
    /// Returns the header accessor for this object.
    #[inline]
    #[must_use]
    pub const fn header(self) -> HeaderRef {
        HeaderRef(self)
    }
}

/// Builds the status word of a freshly allocated object.
#[must_use]
pub const fn initial_status(mark_state: bool, color: Color, ref_count: usize) -> usize {
    let mark = if mark_state { MARK_BIT } else { 0 };
    mark | color.bits() | (ref_count << RC_SHIFT)
}

impl HeaderRef {
    #[inline]
    fn status_word(self) -> &'static AtomicUsize {
        // SAFETY: the object is live, so its status word is committed and word aligned.
        unsafe { self.0.to_address().as_atomic() }
    }

    #[inline]
    fn word(self, offset: usize) -> Address {
        self.0.to_address().plus(offset)
    }

    #[inline]
    fn update(self, f: impl Fn(usize) -> usize) -> usize {
        let word = self.status_word();
        let mut old = word.load(Ordering::Relaxed);
        loop {
            match word.compare_exchange_weak(old, f(old), Ordering::AcqRel, Ordering::Relaxed) {
                Ok(prev) => return prev,
                Err(actual) => old = actual,
            }
        }
    }

    /// The object this header belongs to.
    #[must_use]
    pub const fn object(self) -> ObjectReference {
        self.0
    }

    /// Overwrites the whole status word.
    pub fn initialize(self, status: usize) {
        self.status_word().store(status, Ordering::Release);
    }

    /// Raw status word, for copying.
    #[must_use]
    pub fn status(self) -> usize {
        self.status_word().load(Ordering::Acquire)
    }

    /// Type identifier stored in the type word.
    #[must_use]
    pub fn type_id(self) -> TypeId {
        // SAFETY: the type word is the object's second word.
        TypeId(unsafe { self.word(TYPE_OFFSET).load_word() } as u32)
    }

    /// Writes the type word.
    pub fn set_type_id(self, ty: TypeId) {
        // SAFETY: as in `type_id`.
        unsafe { self.word(TYPE_OFFSET).store_word(ty.0 as usize) };
    }

    /// Element count of an array object.
    #[must_use]
    pub fn array_length(self) -> usize {
        // SAFETY: callers only ask arrays, whose third word is the length.
        unsafe { self.word(LENGTH_OFFSET).load_word() }
    }

    /// Writes the element count of an array object.
    pub fn set_array_length(self, length: usize) {
        // SAFETY: as in `array_length`.
        unsafe { self.word(LENGTH_OFFSET).store_word(length) };
    }

    // Color

    /// Current color.
    #[must_use]
    pub fn color(self) -> Color {
        Color::from_status(self.status_word().load(Ordering::Acquire))
    }

    /// Replaces the color, leaving every other field untouched.
    pub fn set_color(self, color: Color) {
        self.update(|s| (s & !COLOR_MASK) | color.bits());
    }

    /// `color() == Color::Green`.
    #[must_use]
    pub fn is_green(self) -> bool {
        self.color() == Color::Green
    }

    // Reference count

    /// Current reference count.
    #[must_use]
    pub fn ref_count(self) -> usize {
        self.status_word().load(Ordering::Acquire) >> RC_SHIFT
    }

    /// `ref_count() > 0`.
    #[must_use]
    pub fn is_live_rc(self) -> bool {
        self.ref_count() > 0
    }

    /// Increments the reference count, returning the new count.
    pub fn inc_ref_count(self) -> usize {
        (self.status_word().fetch_add(RC_UNIT, Ordering::AcqRel) >> RC_SHIFT) + 1
    }

    /// Decrements the reference count, returning the new count, or `None`
    /// when the count was already zero (the word is left unchanged).
    pub fn dec_ref_count(self) -> Option<usize> {
        let word = self.status_word();
        word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s >> RC_SHIFT > 0).then(|| s - RC_UNIT)
        })
        .ok()
        .map(|prev| (prev >> RC_SHIFT) - 1)
    }

    // Buffered flag

    /// Whether the object sits in a purple-stage queue.
    #[must_use]
    pub fn is_buffered(self) -> bool {
        self.status_word().load(Ordering::Acquire) & BUFFERED_BIT != 0
    }

    /// Sets the buffered flag, returning `true` if it was previously clear.
    pub fn set_buffered(self) -> bool {
        self.status_word().fetch_or(BUFFERED_BIT, Ordering::AcqRel) & BUFFERED_BIT == 0
    }

    /// Clears the buffered flag.
    pub fn clear_buffered(self) {
        self.status_word().fetch_and(!BUFFERED_BIT, Ordering::AcqRel);
    }

    // Mark bit

    /// Whether the mark bit equals `mark_state`.
    #[must_use]
    pub fn is_marked(self, mark_state: bool) -> bool {
        (self.status_word().load(Ordering::Acquire) & MARK_BIT != 0) == mark_state
    }

    /// Sets the mark bit to `mark_state`, returning `true` if this call
    /// changed it. Exactly one of several racing callers wins.
    pub fn test_and_mark(self, mark_state: bool) -> bool {
        let word = self.status_word();
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if (old & MARK_BIT != 0) == mark_state {
                return false;
            }
            let new = old ^ MARK_BIT;
            match word.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    // Forwarding

    /// Current forwarding state.
    #[must_use]
    pub fn forwarding_state(self) -> ForwardingState {
        decode_forwarding(self.status_word().load(Ordering::Acquire))
    }

    /// Claims the object for copying. Returns the status word as it was
    /// before the claim, or `None` if another collector got there first.
    pub fn try_claim_forwarding(self) -> Option<usize> {
        let word = self.status_word();
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if old & FORWARDING_MASK != 0 {
                return None;
            }
            match word.compare_exchange_weak(
                old,
                old | BEING_FORWARDED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return Some(prev),
                Err(actual) => old = actual,
            }
        }
    }

    /// Publishes the new location of a claimed object.
    pub fn set_forwarded(self, to: ObjectReference) {
        debug_assert_eq!(self.status() & FORWARDING_MASK, BEING_FORWARDED);
        self.status_word()
            .store(to.to_address().as_usize() | FORWARDED, Ordering::Release);
    }

    /// Waits for a racing collector to finish copying and returns the copy.
    #[must_use]
    pub fn spin_and_get_forwarded(self) -> ObjectReference {
        let backoff = Backoff::new();
        loop {
            if let ForwardingState::Forwarded(to) = self.forwarding_state() {
                return to;
            }
            backoff.snooze();
        }
    }
}

/// Strips the forwarding bits from a status word claimed for copying, giving
/// the status word of the copy.
#[must_use]
pub const fn status_for_copy(claimed: usize) -> usize {
    claimed & !FORWARDING_MASK
}

const fn decode_forwarding(status: usize) -> ForwardingState {
    match status & FORWARDING_MASK {
        0 => ForwardingState::Unforwarded,
        FORWARDED => match ObjectReference::from_address(Address::from_usize(
            status & !FORWARDING_MASK,
        )) {
            Some(to) => ForwardingState::Forwarded(to),
            None => ForwardingState::BeingForwarded,
        },
        _ => ForwardingState::BeingForwarded,
    }
}
