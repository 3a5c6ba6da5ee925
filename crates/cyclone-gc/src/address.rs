//! Raw addresses and object references.
//!
//! [`Address`] is an untyped machine address used for slots, cells and
//! blocks. [`ObjectReference`] is a non-null address known to be the start
//! of an object. Which space owns an object is decided purely by address
//! range, never by a tag stored in the reference.

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicUsize, Ordering};

/// An untyped machine address.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw integer address.
    #[inline]
    #[must_use]
    pub const fn from_usize(raw: usize) -> Self {
        Self(raw)
    }

    /// Wraps a raw pointer.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the raw integer value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the address as a mutable pointer.
    #[inline]
    #[must_use]
    pub const fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` for the null address.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns `self + bytes`.
    #[inline]
    #[must_use]
    pub const fn plus(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Returns `self - bytes`.
    #[inline]
    #[must_use]
    pub const fn minus(self, bytes: usize) -> Self {
        Self(self.0 - bytes)
    }

    /// Returns the distance in bytes from `base` up to `self`.
    #[inline]
    #[must_use]
    pub const fn diff(self, base: Self) -> usize {
        self.0 - base.0
    }

    /// Rounds up to a power-of-two alignment.
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Rounds down to a power-of-two alignment.
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Self(self.0 & !(align - 1))
    }

    /// Returns `true` if the address is a multiple of `align`.
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Views the word at this address as an atomic.
    ///
    /// # Safety
    ///
    /// The address must be word aligned, committed, and stay valid for `'a`.
    #[inline]
    #[must_use]
    pub unsafe fn as_atomic<'a>(self) -> &'a AtomicUsize {
        debug_assert!(self.is_aligned_to(std::mem::align_of::<AtomicUsize>()));
        unsafe { &*self.to_mut_ptr::<AtomicUsize>() }
    }

    /// Reads a word.
    ///
    /// # Safety
    ///
    /// See [`Address::as_atomic`].
    #[inline]
    #[must_use]
    pub unsafe fn load_word(self) -> usize {
        unsafe { self.as_atomic() }.load(Ordering::Relaxed)
    }

    /// Writes a word.
    ///
    /// # Safety
    ///
    /// See [`Address::as_atomic`].
    #[inline]
    pub unsafe fn store_word(self, value: usize) {
        unsafe { self.as_atomic() }.store(value, Ordering::Relaxed);
    }

    /// Reads the reference held in the slot at this address.
    ///
    /// # Safety
    ///
    /// See [`Address::as_atomic`].
    #[inline]
    #[must_use]
    pub unsafe fn load_reference(self) -> Option<ObjectReference> {
        ObjectReference::from_address(Self(unsafe { self.load_word() }))
    }

    /// Stores a reference (or null) into the slot at this address.
    ///
    /// # Safety
    ///
    /// See [`Address::as_atomic`].
    #[inline]
    pub unsafe fn store_reference(self, value: Option<ObjectReference>) {
        unsafe { self.store_word(value.map_or(0, |r| r.to_address().as_usize())) };
    }

    /// Zeroes `bytes` bytes starting at this address.
    ///
    /// # Safety
    ///
    /// The range must be committed and owned by the caller.
    #[inline]
    pub unsafe fn zero(self, bytes: usize) {
        unsafe { std::ptr::write_bytes(self.to_mut_ptr::<u8>(), 0, bytes) };
    }
}

impl Add<usize> for Address {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        self.plus(rhs)
    }
}

impl Sub<usize> for Address {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self {
        self.minus(rhs)
    }
}

impl Sub<Self> for Address {
    type Output = usize;

    fn sub(self, rhs: Self) -> usize {
        self.diff(rhs)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The start address of a heap object. Never null.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    /// Converts an address into a reference, mapping null to `None`.
    #[inline]
    #[must_use]
    pub const fn from_address(addr: Address) -> Option<Self> {
        match NonZeroUsize::new(addr.as_usize()) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the object's start address.
    #[inline]
    #[must_use]
    pub const fn to_address(self) -> Address {
        Address::from_usize(self.0.get())
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectReference({:#x})", self.0)
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
