//! Object model.
//!
//! The engine fixes one object layout: a status word, a type word and, for
//! arrays, a length word, followed by the payload. Everything type-specific
//! (which payload words hold references, element kinds, acyclicity) comes
//! from the runtime through [`ObjectModel`]. [`TypeRegistry`] is a ready-made
//! implementation backed by a table of registered types.

mod header;
mod registry;

pub use header::{initial_status, status_for_copy, Color, ForwardingState, HeaderRef};
pub use registry::TypeRegistry;

use crate::address::{Address, ObjectReference};
use crate::constants::BYTES_IN_WORD;

/// Header size of scalar objects.
pub const SCALAR_HEADER_BYTES: usize = 2 * BYTES_IN_WORD;
/// Header size of array objects.
pub const ARRAY_HEADER_BYTES: usize = 3 * BYTES_IN_WORD;

/// Index of a type in the runtime's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Element kind of an array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// Each element is a reference slot.
    Reference,
    /// Each element is plain data of the given width in bytes.
    Primitive {
        /// Width of one element.
        bytes: usize,
    },
}

impl ElementType {
    /// Width of one element in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Reference => BYTES_IN_WORD,
            Self::Primitive { bytes } => bytes,
        }
    }
}

/// Type information the engine needs from the runtime.
///
/// Implementors describe types; the provided methods turn that description
/// into slot enumeration and sizing for the fixed layout.
pub trait ObjectModel: Send + Sync {
    /// Byte offsets, from the object start, of every reference field of a
    /// scalar type. Arrays return an empty slice.
    fn reference_offsets(&self, ty: TypeId) -> &[usize];

    /// Whether `ty` is an array type.
    fn is_array_type(&self, ty: TypeId) -> bool;

    /// Element kind of an array type, `None` for scalars.
    fn element_type(&self, ty: TypeId) -> Option<ElementType>;

    /// Whether instances can never take part in a reference cycle.
    fn is_acyclic(&self, ty: TypeId) -> bool;

    /// Size in bytes of a scalar instance including its header.
    fn scalar_bytes(&self, ty: TypeId) -> usize;

    /// Bytes needed for an instance of `ty` with `length` elements (ignored
    /// for scalars), rounded up to whole words.
    fn bytes_required(&self, ty: TypeId, length: usize) -> usize {
        match self.element_type(ty) {
            Some(element) => {
                (ARRAY_HEADER_BYTES + length * element.bytes()).next_multiple_of(BYTES_IN_WORD)
            }
            None => self.scalar_bytes(ty).next_multiple_of(BYTES_IN_WORD),
        }
    }

    /// Current size of `object` in bytes.
    fn size_of(&self, object: ObjectReference) -> usize {
        let header = object.header();
        let ty = header.type_id();
        let length = if self.is_array_type(ty) {
            header.array_length()
        } else {
            0
        };
        self.bytes_required(ty, length)
    }

    /// Address of the `index`th reference slot of `object`, or `None` when
    /// out of range.
    fn reference_slot(&self, object: ObjectReference, index: usize) -> Option<Address> {
        let header = object.header();
        let ty = header.type_id();
        let base = object.to_address();
        match self.element_type(ty) {
            Some(ElementType::Reference) => (index < header.array_length())
                .then(|| base.plus(ARRAY_HEADER_BYTES + index * BYTES_IN_WORD)),
            Some(ElementType::Primitive { .. }) => None,
            None => self
                .reference_offsets(ty)
                .get(index)
                .map(|offset| base.plus(*offset)),
        }
    }

    /// Calls `visitor` with the address of every reference slot of `object`,
    /// null or not.
    fn scan_object(&self, object: ObjectReference, visitor: &mut dyn FnMut(Address)) {
        let header = object.header();
        let ty = header.type_id();
        let base = object.to_address();
        match self.element_type(ty) {
            Some(ElementType::Reference) => {
                let first = base.plus(ARRAY_HEADER_BYTES);
                for i in 0..header.array_length() {
                    visitor(first.plus(i * BYTES_IN_WORD));
                }
            }
            Some(ElementType::Primitive { .. }) => {}
            None => {
                for offset in self.reference_offsets(ty) {
                    visitor(base.plus(*offset));
                }
            }
        }
    }

    /// Calls `visitor` with every non-null reference held by `object`.
    fn enumerate_references(
        &self,
        object: ObjectReference,
        visitor: &mut dyn FnMut(ObjectReference),
    ) {
        self.scan_object(object, &mut |slot| {
            // SAFETY: slots produced by `scan_object` lie inside the live object.
            if let Some(child) = unsafe { slot.load_reference() } {
                visitor(child);
            }
        });
    }
}
