//! The type graph.
//!
//! Types live in an arena owned by [`TypeTable`] and refer to each other by
//! [`TypeId`]. Self-referential types (a linked list node pointing at
//! itself) are built by reserving an id first and defining it afterwards.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

/// Handle to a type in a [`TypeTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

/// One member of a record-shaped type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField
{
    pub name: String,
    pub ty: TypeId,
    pub byte_offset: i64,
    /// Anonymous field whose members are promoted into the parent
    pub embedded: bool,
}

impl StructField
{
    pub fn new(name: impl Into<String>, ty: TypeId, byte_offset: i64) -> Self
    {
        Self {
            name: name.into(),
            ty,
            byte_offset,
            embedded: false,
        }
    }

    #[must_use]
    pub fn embedded(mut self) -> Self
    {
        self.embedded = true;
        self
    }
}

/// Shape of a type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind
{
    Int,
    Uint,
    Float,
    Complex,
    Bool,
    /// Pointer to the given type; a pointer to `Void` is `unsafe.Pointer`
    Pointer(TypeId),
    Struct(Vec<StructField>),
    /// `count` elements, `stride` bytes apart
    Array
    {
        elem: TypeId,
        count: i64,
        stride: i64,
    },
    /// Slice header `{array, len, cap}`
    Slice(Vec<StructField>),
    /// String header `{str, len}`
    String(Vec<StructField>),
    /// Interface; the id names the runtime `iface`/`eface` record
    Interface(TypeId),
    /// Map; `header` is the pointer-to-`hmap` type the variable holds
    Map
    {
        header: TypeId,
        key: TypeId,
        value: TypeId,
    },
    /// Channel; `header` is the pointer-to-`hchan` type the variable holds
    Chan
    {
        header: TypeId,
        elem: TypeId,
    },
    Func,
    /// Named alias of another type
    Typedef(TypeId),
    Void,
    Unspecified,
}

/// A node of the type graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type
{
    pub name: String,
    /// Size in bytes
    pub size: i64,
    pub kind: TypeKind,
}

impl Type
{
    pub fn new(name: impl Into<String>, size: i64, kind: TypeKind) -> Self
    {
        Self {
            name: name.into(),
            size,
            kind,
        }
    }

    /// Fields of record-shaped kinds, empty for the rest.
    pub fn fields(&self) -> &[StructField]
    {
        match &self.kind {
            TypeKind::Struct(fields) | TypeKind::Slice(fields) | TypeKind::String(fields) => fields,
            _ => &[],
        }
    }

    pub fn field(&self, name: &str) -> Option<&StructField>
    {
        self.fields().iter().find(|field| field.name == name)
    }
}

static UNSPECIFIED: Lazy<Arc<Type>> = Lazy::new(|| Arc::new(Type::new("", 0, TypeKind::Unspecified)));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Derived
{
    PointerTo(TypeId),
    ArrayOf(TypeId, i64),
    ChanBuffer(TypeId, i64),
}

/// Arena of every type known to one binary
///
/// Safe to share: derived types (`*T`, `[n]T`) created while loading values
/// are interned behind a lock, so asking twice yields the same id.
#[derive(Debug)]
pub struct TypeTable
{
    types: RwLock<Vec<Arc<Type>>>,
    names: RwLock<HashMap<String, TypeId>>,
    derived: RwLock<HashMap<Derived, TypeId>>,
    pointer_size: i64,
}

impl TypeTable
{
    pub fn new(pointer_size: u8) -> Self
    {
        Self {
            types: RwLock::new(Vec::new()),
            names: RwLock::new(HashMap::new()),
            derived: RwLock::new(HashMap::new()),
            pointer_size: i64::from(pointer_size),
        }
    }

    pub fn pointer_size(&self) -> i64
    {
        self.pointer_size
    }

    /// Add a type. Named types become reachable through [`TypeTable::by_name`];
    /// the first definition of a name wins.
    pub fn add(&self, ty: Type) -> TypeId
    {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let id = TypeId(types.len() as u32);
        if !ty.name.is_empty() {
            self.names
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(ty.name.clone())
                .or_insert(id);
        }
        types.push(Arc::new(ty));
        id
    }

    /// Reserve an id for a type that refers to itself. Define it with
    /// [`TypeTable::define`] before use.
    pub fn reserve(&self, name: &str) -> TypeId
    {
        self.add(Type::new(name, 0, TypeKind::Unspecified))
    }

    /// Give a reserved id its definition.
    pub fn define(&self, id: TypeId, ty: Type)
    {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = types.get_mut(id.0 as usize) {
            *slot = Arc::new(ty);
        }
    }

    /// The type behind `id`. Ids from another table resolve to an
    /// unspecified type.
    pub fn get(&self, id: TypeId) -> Arc<Type>
    {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types
            .get(id.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&UNSPECIFIED))
    }

    pub fn by_name(&self, name: &str) -> Option<TypeId>
    {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    pub fn size(&self, id: TypeId) -> i64
    {
        self.get(id).size
    }

    pub fn name(&self, id: TypeId) -> String
    {
        self.get(id).name.clone()
    }

    /// Strip typedefs. Cycles stop after a bounded number of hops.
    pub fn resolve_typedef(&self, mut id: TypeId) -> TypeId
    {
        for _ in 0..64 {
            match self.get(id).kind {
                TypeKind::Typedef(target) => id = target,
                _ => break,
            }
        }
        id
    }

    fn derive(&self, key: Derived, make: impl FnOnce() -> Type) -> TypeId
    {
        if let Some(id) = self.derived.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return *id;
        }
        let mut derived = self.derived.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = derived.get(&key) {
            return *id;
        }
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let id = TypeId(types.len() as u32);
        types.push(Arc::new(make()));
        derived.insert(key, id);
        id
    }

    /// `*T`
    pub fn pointer_to(&self, id: TypeId) -> TypeId
    {
        let name = format!("*{}", self.name(id));
        let size = self.pointer_size;
        self.derive(Derived::PointerTo(id), || Type::new(name, size, TypeKind::Pointer(id)))
    }

    /// `[count]T`
    pub fn array_of(&self, elem: TypeId, count: i64) -> TypeId
    {
        let elem_type = self.get(elem);
        let name = format!("[{count}]{}", elem_type.name);
        let stride = elem_type.size;
        self.derive(Derived::ArrayOf(elem, count), || {
            Type::new(name, stride * count, TypeKind::Array { elem, count, stride })
        })
    }

    /// A copy of the `hchan` record whose `buf` field is typed
    /// `*[capacity]elem`.
    pub(crate) fn chan_buffer_view(&self, hchan: TypeId, elem: TypeId, capacity: i64) -> TypeId
    {
        let buffer = self.pointer_to(self.array_of(elem, capacity));
        let base = self.get(hchan);
        self.derive(Derived::ChanBuffer(hchan, capacity), || {
            let fields = base
                .fields()
                .iter()
                .map(|field| {
                    if field.name == "buf" {
                        StructField::new("buf", buffer, field.byte_offset)
                    } else {
                        field.clone()
                    }
                })
                .collect();
            Type::new(base.name.clone(), base.size, TypeKind::Struct(fields))
        })
    }
}
