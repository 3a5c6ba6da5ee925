use crate::constants::BYTES_IN_WORD;
use crate::error::fatal;
use crate::object::{ElementType, ObjectModel, TypeId, SCALAR_HEADER_BYTES};

#[derive(Debug, Clone)]
struct TypeInfo {
    name: String,
    element: Option<ElementType>,
    reference_offsets: Vec<usize>,
    scalar_bytes: usize,
    acyclic: bool,
}

/// Table-driven [`ObjectModel`].
///
/// Types are registered up front; the registry is then shared read-only
/// with the plan. Types without reference fields are acyclic automatically.
///
/// ```
/// use cyclone_gc::object::{ObjectModel, TypeRegistry};
///
/// let mut types = TypeRegistry::new();
/// // Two payload words; the second holds a reference.
/// let pair = types.register_scalar("Pair", 2, &[1]);
/// assert_eq!(types.reference_offsets(pair).len(), 1);
/// assert!(!types.is_acyclic(pair));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self { types: Vec::new() }
    }

    fn push(&mut self, info: TypeInfo) -> TypeId {
        let id = u32::try_from(self.types.len()).unwrap_or_else(|_| {
            fatal("type table overflow", || format!("{} types", self.types.len()))
        });
        self.types.push(info);
        TypeId(id)
    }

    /// Registers a scalar type with `payload_words` payload words, of which
    /// the ones listed in `reference_fields` (payload word indices) hold
    /// references.
    ///
    /// # Panics
    ///
    /// Panics if a listed field lies outside the payload.
    pub fn register_scalar(
        &mut self,
        name: impl Into<String>,
        payload_words: usize,
        reference_fields: &[usize],
    ) -> TypeId {
        let reference_offsets: Vec<usize> = reference_fields
            .iter()
            .inspect(|&&field| assert!(field < payload_words, "reference field out of range"))
            .map(|field| SCALAR_HEADER_BYTES + field * BYTES_IN_WORD)
            .collect();
        let acyclic = reference_offsets.is_empty();
        self.push(TypeInfo {
            name: name.into(),
            element: None,
            reference_offsets,
            scalar_bytes: SCALAR_HEADER_BYTES + payload_words * BYTES_IN_WORD,
            acyclic,
        })
    }

    /// Registers an array of references.
    pub fn register_reference_array(&mut self, name: impl Into<String>) -> TypeId {
        self.push(TypeInfo {
            name: name.into(),
            element: Some(ElementType::Reference),
            reference_offsets: Vec::new(),
            scalar_bytes: 0,
            acyclic: false,
        })
    }

    /// Registers an array of `element_bytes`-wide plain data.
    pub fn register_primitive_array(
        &mut self,
        name: impl Into<String>,
        element_bytes: usize,
    ) -> TypeId {
        self.push(TypeInfo {
            name: name.into(),
            element: Some(ElementType::Primitive {
                bytes: element_bytes,
            }),
            reference_offsets: Vec::new(),
            scalar_bytes: 0,
            acyclic: true,
        })
    }

    /// Declares instances of `ty` acyclic (for example immutable types whose
    /// references always point to older objects).
    pub fn set_acyclic(&mut self, ty: TypeId, acyclic: bool) {
        self.info_mut(ty).acyclic = acyclic;
    }

    /// Name a type was registered under.
    #[must_use]
    pub fn name(&self, ty: TypeId) -> &str {
        &self.info(ty).name
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no type is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn info(&self, ty: TypeId) -> &TypeInfo {
        self.types
            .get(ty.0 as usize)
            .unwrap_or_else(|| fatal(format!("unknown type id {}", ty.0), || self.describe()))
    }

    fn info_mut(&mut self, ty: TypeId) -> &mut TypeInfo {
        let len = self.types.len();
        self.types
            .get_mut(ty.0 as usize)
            .unwrap_or_else(|| {
                fatal(format!("unknown type id {}", ty.0), || format!("{len} types"))
            })
    }

    fn describe(&self) -> String {
        format!("[GC] type table: {} types", self.types.len())
    }
}

impl ObjectModel for TypeRegistry {
    fn reference_offsets(&self, ty: TypeId) -> &[usize] {
        &self.info(ty).reference_offsets
    }

    fn is_array_type(&self, ty: TypeId) -> bool {
        self.info(ty).element.is_some()
    }

    fn element_type(&self, ty: TypeId) -> Option<ElementType> {
        self.info(ty).element
    }

    fn is_acyclic(&self, ty: TypeId) -> bool {
        self.info(ty).acyclic
    }

    fn scalar_bytes(&self, ty: TypeId) -> usize {
        self.info(ty).scalar_bytes
    }
}
