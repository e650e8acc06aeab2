//! Type identities and the layout facts the marshaler consults.
//!
//! The engine only talks to [`TypeInfoProvider`]; [`TypeRegistry`] is an in-memory
//! provider whose types are declared up front with [`TypeDecl`].
use crate::{
    error::{LayoutError, MarshalError, MarshalResult},
    layout::{FieldLayoutManager, HasLayout, LayoutManager, Scalar},
};
use dashmap::{mapref::entry::Entry, DashMap};
use dotnetdll::prelude::Layout;
use std::{
    fmt::{Debug, Formatter},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Struct,
    Class,
    Enum,
    Interface,
    Delegate,
    Array,
    Text,
    TextBuilder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenericState {
    NonGeneric,
    /// An open definition such as `Pair<T>`.
    Definition,
    /// A closed instantiation such as `Pair<int>`.
    Instantiation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayoutClass {
    Blittable,
    CustomLayout,
    Invalid,
}

pub struct TypeDefinition {
    pub id: usize,
    pub name: String,
    pub kind: TypeKind,
    pub generics: GenericState,
    pub layout_class: LayoutClass,
    pub layout: FieldLayoutManager,
}

/// Identity of a type. Equality and hashing are by definition address, so two handles
/// compare equal only when they come from the same declaration.
#[derive(Clone)]
pub struct TypeHandle(Arc<TypeDefinition>);

impl TypeHandle {
    pub fn definition(&self) -> &TypeDefinition {
        &self.0
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Value written into the hidden header word of boxed instances.
    pub fn type_id(&self) -> usize {
        self.0.id
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.0.kind, TypeKind::Struct | TypeKind::Enum)
    }
}

impl Debug for TypeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeHandle {}

impl Hash for TypeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const TypeDefinition).hash(state);
    }
}

/// Answers layout questions about types.
pub trait TypeInfoProvider: Send + Sync {
    fn kind(&self, t: &TypeHandle) -> TypeKind;
    fn generic_state(&self, t: &TypeHandle) -> GenericState;
    fn layout_class(&self, t: &TypeHandle) -> LayoutClass;
    fn native_size(&self, t: &TypeHandle) -> MarshalResult<usize>;
    fn field_offset(&self, t: &TypeHandle, name: &str) -> MarshalResult<usize>;

    /// Alignment the native buffer should have; only used for diagnostics.
    fn native_alignment(&self, _t: &TypeHandle) -> usize {
        1
    }

    fn is_blittable(&self, t: &TypeHandle) -> bool {
        self.layout_class(t) == LayoutClass::Blittable
    }

    fn is_value_type(&self, t: &TypeHandle) -> bool {
        matches!(self.kind(t), TypeKind::Struct | TypeKind::Enum)
    }

    fn is_generic(&self, t: &TypeHandle) -> bool {
        self.generic_state(t) != GenericState::NonGeneric
    }

    fn is_enum(&self, t: &TypeHandle) -> bool {
        self.kind(t) == TypeKind::Enum
    }

    fn is_interface(&self, t: &TypeHandle) -> bool {
        self.kind(t) == TypeKind::Interface
    }

    fn is_delegate(&self, t: &TypeHandle) -> bool {
        self.kind(t) == TypeKind::Delegate
    }
}

#[derive(Clone, Debug)]
pub enum FieldKind {
    Scalar(Scalar),
    /// Managed string reference; native side holds a pointer to a marshaled copy.
    Text,
    /// Managed interface reference; native side holds an interface pointer.
    Interface,
    /// Inline value type.
    Nested(TypeHandle),
}

impl FieldKind {
    fn is_blittable(&self) -> bool {
        match self {
            FieldKind::Scalar(_) => true,
            FieldKind::Text | FieldKind::Interface => false,
            FieldKind::Nested(t) => t.definition().layout_class == LayoutClass::Blittable,
        }
    }
}

struct FieldDecl {
    name: String,
    offset: Option<usize>,
    kind: FieldKind,
}

/// Declaration of a type, turned into a [`TypeHandle`] by [`TypeRegistry::define`].
pub struct TypeDecl {
    name: String,
    kind: TypeKind,
    generics: GenericState,
    layout: Layout,
    fields: Vec<FieldDecl>,
}

impl TypeDecl {
    fn new(name: impl Into<String>, kind: TypeKind, layout: Layout) -> Self {
        Self {
            name: name.into(),
            kind,
            generics: GenericState::NonGeneric,
            layout,
            fields: vec![],
        }
    }

    /// A value type with sequential layout.
    pub fn structure(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Struct, Layout::Sequential(None))
    }

    /// A reference type with sequential layout.
    pub fn class(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Class, Layout::Sequential(None))
    }

    pub fn enumeration(name: impl Into<String>, underlying: Scalar) -> Self {
        Self::new(name, TypeKind::Enum, Layout::Sequential(None))
            .field("value__", FieldKind::Scalar(underlying))
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Interface, Layout::Automatic)
    }

    pub fn delegate(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Delegate, Layout::Automatic)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Array, Layout::Automatic)
    }

    pub fn text() -> Self {
        Self::new("System.String", TypeKind::Text, Layout::Automatic)
    }

    pub fn text_builder() -> Self {
        Self::new("System.Text.StringBuilder", TypeKind::TextBuilder, Layout::Automatic)
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn generic_definition(mut self) -> Self {
        self.generics = GenericState::Definition;
        self
    }

    pub fn generic_instantiation(mut self) -> Self {
        self.generics = GenericState::Instantiation;
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            offset: None,
            kind,
        });
        self
    }

    pub fn field_at(mut self, name: impl Into<String>, offset: usize, kind: FieldKind) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            offset: Some(offset),
            kind,
        });
        self
    }
}

pub struct TypeRegistry {
    types: DashMap<String, TypeHandle>,
    next_id: AtomicUsize,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
            // zero is never a valid header value
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn get(&self, name: &str) -> Option<TypeHandle> {
        self.types.get(name).map(|t| t.clone())
    }

    pub fn define(&self, decl: TypeDecl) -> Result<TypeHandle, LayoutError> {
        if self.types.contains_key(&decl.name) {
            return Err(LayoutError::AlreadyDefined(decl.name));
        }

        let mut all_blittable = true;
        let mut field_layouts = Vec::with_capacity(decl.fields.len());
        for f in &decl.fields {
            let layout = match &f.kind {
                FieldKind::Scalar(s) => LayoutManager::from(*s),
                FieldKind::Text | FieldKind::Interface => LayoutManager::from(Scalar::NativeInt),
                FieldKind::Nested(t) => {
                    let nested = t.definition();
                    if nested.layout_class == LayoutClass::Invalid {
                        return Err(LayoutError::NestedWithoutLayout {
                            type_name: decl.name.clone(),
                            field: f.name.clone(),
                            nested: nested.name.clone(),
                        });
                    }
                    LayoutManager::from(nested.layout.clone())
                }
            };
            all_blittable &= f.kind.is_blittable();
            field_layouts.push((f.name.as_str(), f.offset, layout));
        }

        let has_layout_metadata = !matches!(decl.layout, Layout::Automatic);
        let layout_class = match decl.kind {
            TypeKind::Enum => LayoutClass::Blittable,
            _ if !has_layout_metadata => LayoutClass::Invalid,
            _ if all_blittable => LayoutClass::Blittable,
            _ => LayoutClass::CustomLayout,
        };

        let layout = FieldLayoutManager::new(&decl.name, field_layouts, decl.layout)?;

        let handle = TypeHandle(Arc::new(TypeDefinition {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: decl.name.clone(),
            kind: decl.kind,
            generics: decl.generics,
            layout_class,
            layout,
        }));
        tracing::debug!(
            "defined type {} ({:?}, {:?}, {} bytes)",
            decl.name,
            handle.definition().kind,
            layout_class,
            handle.definition().layout.size()
        );
        match self.types.entry(decl.name) {
            Entry::Occupied(o) => Err(LayoutError::AlreadyDefined(o.key().clone())),
            Entry::Vacant(v) => {
                v.insert(handle.clone());
                Ok(handle)
            }
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeInfoProvider for TypeRegistry {
    fn kind(&self, t: &TypeHandle) -> TypeKind {
        t.definition().kind
    }

    fn generic_state(&self, t: &TypeHandle) -> GenericState {
        t.definition().generics
    }

    fn layout_class(&self, t: &TypeHandle) -> LayoutClass {
        t.definition().layout_class
    }

    fn native_size(&self, t: &TypeHandle) -> MarshalResult<usize> {
        let def = t.definition();
        match def.layout_class {
            LayoutClass::Invalid => Err(MarshalError::missing_layout("t", &def.name)),
            _ => Ok(def.layout.size()),
        }
    }

    fn native_alignment(&self, t: &TypeHandle) -> usize {
        t.definition().layout.alignment()
    }

    fn field_offset(&self, t: &TypeHandle, name: &str) -> MarshalResult<usize> {
        let def = t.definition();
        if def.layout_class == LayoutClass::Invalid {
            return Err(MarshalError::missing_layout("t", &def.name));
        }
        def.layout
            .get_field(name)
            .map(|f| f.position)
            .ok_or_else(|| {
                MarshalError::invalid_argument(
                    "fieldName",
                    format!("Field '{}' is not a field of type '{}'.", name, def.name),
                )
            })
    }
}
