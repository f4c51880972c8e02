//! Runtime type registry: dense indices, sizes, and layout metadata.
//!
//! Every component, array-element, and tag type used in a world must be
//! registered in a [`Schema`] first. Registration assigns a small dense index
//! within the type's kind; those indices are what [`BitMask`](crate::mask::BitMask)
//! bits and chunk columns are keyed on. A type's identity across processes is
//! its *fingerprint* -- a blake3 hash of the fully qualified type name and its
//! declared size -- so a schema written by one build can be checked against a
//! schema registered by another.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::EcsError;

/// Maximum number of registered types per kind.
pub const MAX_TYPES: usize = 256;

// ---------------------------------------------------------------------------
// TypeKind
// ---------------------------------------------------------------------------

/// The three registration kinds a schema tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    /// Fixed-size per-entity value stored in chunk columns.
    Component,
    /// Element type of a per-entity dynamic array.
    ArrayElement,
    /// Zero-size marker bit stored in the entity's slot.
    Tag,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Component => write!(f, "component"),
            TypeKind::ArrayElement => write!(f, "array element"),
            TypeKind::Tag => write!(f, "tag"),
        }
    }
}

// ---------------------------------------------------------------------------
// Type ids
// ---------------------------------------------------------------------------

/// Dense index of a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentTypeId(pub(crate) u8);

/// Dense index of a registered array-element type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArrayTypeId(pub(crate) u8);

/// Dense index of a registered tag type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagTypeId(pub(crate) u8);

impl ComponentTypeId {
    /// The dense index within the component kind.
    #[inline]
    pub fn index(self) -> u8 {
        self.0
    }
}

impl ArrayTypeId {
    /// The dense index within the array-element kind.
    #[inline]
    pub fn index(self) -> u8 {
        self.0
    }
}

impl TagTypeId {
    /// The dense index within the tag kind.
    #[inline]
    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

impl fmt::Debug for ArrayTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayTypeId({})", self.0)
    }
}

impl fmt::Debug for TagTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Layout metadata
// ---------------------------------------------------------------------------

/// Optional structural description of a registered type, field by field.
///
/// Layouts are carried through the schema stream so external tooling can
/// interpret component blobs without the Rust type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeLayout {
    /// Fields in declaration order.
    pub fields: Vec<FieldLayout>,
}

/// One field of a [`TypeLayout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    /// Field name.
    pub name: String,
    /// Field size in bytes.
    pub size: u16,
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Stable fingerprint for a type: blake3 of the fully qualified type name and
/// the declared size, truncated to 64 bits.
pub(crate) fn type_fingerprint(name: &str, size: usize) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&(size as u64).to_le_bytes());
    let hash = hasher.finalize();
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("blake3 output is 32 bytes"))
}

// ---------------------------------------------------------------------------
// KindTable -- registration records for one kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct KindTable {
    by_fingerprint: HashMap<u64, u8>,
    names: Vec<String>,
    sizes: Vec<u16>,
    aligns: Vec<u16>,
    layouts: Vec<Option<TypeLayout>>,
}

impl KindTable {
    fn len(&self) -> usize {
        self.sizes.len()
    }

    fn register(
        &mut self,
        kind: TypeKind,
        name: &str,
        fingerprint: u64,
        size: u16,
        align: u16,
        layout: Option<TypeLayout>,
    ) -> Result<u8, EcsError> {
        if self.by_fingerprint.contains_key(&fingerprint) {
            return Err(EcsError::AlreadyRegistered {
                name: name.to_owned(),
            });
        }
        if self.len() >= MAX_TYPES {
            return Err(EcsError::SchemaCapacityExceeded { kind });
        }
        let index = self.len() as u8;
        self.by_fingerprint.insert(fingerprint, index);
        self.names.push(name.to_owned());
        self.sizes.push(size);
        self.aligns.push(align);
        self.layouts.push(layout);
        Ok(index)
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Per-world registry assigning dense indices, sizes, and layouts to types.
///
/// Indices are assigned in registration order and never reused. Registering
/// the same type twice is an error, as is exceeding [`MAX_TYPES`] per kind.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    components: KindTable,
    arrays: KindTable,
    tags: KindTable,
    /// Cached per-Rust-type lookup so typed access never re-hashes names.
    by_rust_type: HashMap<TypeId, (TypeKind, u8)>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    // -- registration -------------------------------------------------------

    /// Register `T` as a component type.
    pub fn register_component<T>(&mut self) -> Result<ComponentTypeId, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        self.register_component_with_layout::<T>(None)
    }

    /// Register `T` as a component type with an explicit field layout.
    pub fn register_component_with_layout<T>(
        &mut self,
        layout: Option<TypeLayout>,
    ) -> Result<ComponentTypeId, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let name = std::any::type_name::<T>();
        let size = std::mem::size_of::<T>();
        assert!(size <= u16::MAX as usize, "component type too large: {name}");
        let fingerprint = type_fingerprint(name, size);
        let index = self.components.register(
            TypeKind::Component,
            name,
            fingerprint,
            size as u16,
            std::mem::align_of::<T>() as u16,
            layout,
        )?;
        self.by_rust_type
            .insert(TypeId::of::<T>(), (TypeKind::Component, index));
        Ok(ComponentTypeId(index))
    }

    /// Register `T` as an array-element type.
    pub fn register_array<T>(&mut self) -> Result<ArrayTypeId, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        self.register_array_with_layout::<T>(None)
    }

    /// Register `T` as an array-element type with an explicit field layout.
    pub fn register_array_with_layout<T>(
        &mut self,
        layout: Option<TypeLayout>,
    ) -> Result<ArrayTypeId, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let name = std::any::type_name::<T>();
        let size = std::mem::size_of::<T>();
        assert!(size <= u16::MAX as usize, "array element type too large: {name}");
        let fingerprint = type_fingerprint(name, size);
        let index = self.arrays.register(
            TypeKind::ArrayElement,
            name,
            fingerprint,
            size as u16,
            std::mem::align_of::<T>() as u16,
            layout,
        )?;
        self.by_rust_type
            .insert(TypeId::of::<T>(), (TypeKind::ArrayElement, index));
        Ok(ArrayTypeId(index))
    }

    /// Register `T` as a tag type. Tags carry no data; the recorded size is 0.
    pub fn register_tag<T>(&mut self) -> Result<TagTypeId, EcsError>
    where
        T: Send + Sync + 'static,
    {
        let name = std::any::type_name::<T>();
        let fingerprint = type_fingerprint(name, 0);
        let index = self
            .tags
            .register(TypeKind::Tag, name, fingerprint, 0, 0, None)?;
        self.by_rust_type
            .insert(TypeId::of::<T>(), (TypeKind::Tag, index));
        Ok(TagTypeId(index))
    }

    /// Raw registration with no Rust type binding. Used when decoding a
    /// schema stream, where only sizes and layouts are known.
    pub(crate) fn register_raw(&mut self, kind: TypeKind, size: u16, layout: Option<TypeLayout>) -> u8 {
        let table = match kind {
            TypeKind::Component => &mut self.components,
            TypeKind::ArrayElement => &mut self.arrays,
            TypeKind::Tag => &mut self.tags,
        };
        debug_assert!(table.len() < MAX_TYPES);
        let index = table.len() as u8;
        table.names.push(String::new());
        table.sizes.push(size);
        // Alignment is not part of the stream; decoded schemas are only used
        // for structural inspection and compatibility checks.
        table.aligns.push(1);
        table.layouts.push(layout);
        index
    }

    // -- typed lookup -------------------------------------------------------

    /// The component index previously assigned to `T`.
    pub fn component_index_of<T: 'static>(&self) -> Result<ComponentTypeId, EcsError> {
        match self.by_rust_type.get(&TypeId::of::<T>()) {
            Some(&(TypeKind::Component, index)) => Ok(ComponentTypeId(index)),
            _ => Err(EcsError::TypeNotRegistered {
                name: std::any::type_name::<T>().to_owned(),
            }),
        }
    }

    /// The array-element index previously assigned to `T`.
    pub fn array_index_of<T: 'static>(&self) -> Result<ArrayTypeId, EcsError> {
        match self.by_rust_type.get(&TypeId::of::<T>()) {
            Some(&(TypeKind::ArrayElement, index)) => Ok(ArrayTypeId(index)),
            _ => Err(EcsError::TypeNotRegistered {
                name: std::any::type_name::<T>().to_owned(),
            }),
        }
    }

    /// The tag index previously assigned to `T`.
    pub fn tag_index_of<T: 'static>(&self) -> Result<TagTypeId, EcsError> {
        match self.by_rust_type.get(&TypeId::of::<T>()) {
            Some(&(TypeKind::Tag, index)) => Ok(TagTypeId(index)),
            _ => Err(EcsError::TypeNotRegistered {
                name: std::any::type_name::<T>().to_owned(),
            }),
        }
    }

    // -- index-based lookup -------------------------------------------------

    /// Number of registered component types.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Number of registered array-element types.
    pub fn array_count(&self) -> usize {
        self.arrays.len()
    }

    /// Number of registered tag types.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Whether `id` names a registered component type.
    pub fn contains_component(&self, id: ComponentTypeId) -> bool {
        (id.0 as usize) < self.components.len()
    }

    /// Whether `id` names a registered array-element type.
    pub fn contains_array(&self, id: ArrayTypeId) -> bool {
        (id.0 as usize) < self.arrays.len()
    }

    /// Whether `id` names a registered tag type.
    pub fn contains_tag(&self, id: TagTypeId) -> bool {
        (id.0 as usize) < self.tags.len()
    }

    /// Element size in bytes of a registered component type.
    ///
    /// `id` must name a registered type.
    pub fn component_size(&self, id: ComponentTypeId) -> usize {
        self.components.sizes[id.0 as usize] as usize
    }

    /// Natural alignment of a registered component type.
    pub(crate) fn component_align(&self, id: ComponentTypeId) -> usize {
        (self.components.aligns[id.0 as usize] as usize).max(1)
    }

    /// Element size in bytes of a registered array-element type.
    pub fn array_size(&self, id: ArrayTypeId) -> usize {
        self.arrays.sizes[id.0 as usize] as usize
    }

    /// Natural alignment of a registered array-element type.
    pub(crate) fn array_align(&self, id: ArrayTypeId) -> usize {
        (self.arrays.aligns[id.0 as usize] as usize).max(1)
    }

    /// Registered name of a component type (empty for decoded schemas).
    pub fn component_name(&self, id: ComponentTypeId) -> &str {
        &self.components.names[id.0 as usize]
    }

    /// Layout metadata of a component type, if any was supplied.
    pub fn component_layout(&self, id: ComponentTypeId) -> Option<&TypeLayout> {
        self.components.layouts[id.0 as usize].as_ref()
    }

    /// Layout metadata of an array-element type, if any was supplied.
    pub fn array_layout(&self, id: ArrayTypeId) -> Option<&TypeLayout> {
        self.arrays.layouts[id.0 as usize].as_ref()
    }

    pub(crate) fn kind_sizes(&self, kind: TypeKind) -> &[u16] {
        match kind {
            TypeKind::Component => &self.components.sizes,
            TypeKind::ArrayElement => &self.arrays.sizes,
            TypeKind::Tag => &self.tags.sizes,
        }
    }

    pub(crate) fn kind_layouts(&self, kind: TypeKind) -> &[Option<TypeLayout>] {
        match kind {
            TypeKind::Component => &self.components.layouts,
            TypeKind::ArrayElement => &self.arrays.layouts,
            TypeKind::Tag => &self.tags.layouts,
        }
    }

    // -- copying ------------------------------------------------------------

    /// Deep-copy this schema into `other`, clearing its previous state.
    pub fn clone_into(&self, other: &mut Schema) {
        *other = self.clone();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Pos {
        x: i32,
        y: i32,
    }

    #[derive(Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Vel {
        dx: i32,
        dy: i32,
    }

    struct Frozen;

    #[test]
    fn register_and_lookup() {
        let mut schema = Schema::new();
        let pos = schema.register_component::<Pos>().unwrap();
        assert_eq!(schema.component_index_of::<Pos>().unwrap(), pos);
        assert_eq!(schema.component_size(pos), 8);
        assert_eq!(schema.component_count(), 1);
    }

    #[test]
    fn indices_assigned_in_registration_order() {
        let mut schema = Schema::new();
        let pos = schema.register_component::<Pos>().unwrap();
        let vel = schema.register_component::<Vel>().unwrap();
        assert_eq!(pos.index(), 0);
        assert_eq!(vel.index(), 1);
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut schema = Schema::new();
        schema.register_component::<Pos>().unwrap();
        let err = schema.register_component::<Pos>().unwrap_err();
        assert!(matches!(err, EcsError::AlreadyRegistered { .. }));
    }

    #[test]
    fn kinds_are_independent_namespaces() {
        let mut schema = Schema::new();
        let comp = schema.register_component::<Pos>().unwrap();
        let arr = schema.register_array::<Vel>().unwrap();
        let tag = schema.register_tag::<Frozen>().unwrap();
        assert_eq!(comp.index(), 0);
        assert_eq!(arr.index(), 0);
        assert_eq!(tag.index(), 0);
        // A type registered as an array is not a component.
        assert!(schema.component_index_of::<Vel>().is_err());
    }

    #[test]
    fn tags_record_size_zero() {
        let mut schema = Schema::new();
        let tag = schema.register_tag::<Frozen>().unwrap();
        assert!(schema.contains_tag(tag));
        assert_eq!(schema.tag_count(), 1);
    }

    #[test]
    fn layout_is_recorded() {
        let mut schema = Schema::new();
        let layout = TypeLayout {
            fields: vec![
                FieldLayout {
                    name: "x".to_owned(),
                    size: 4,
                },
                FieldLayout {
                    name: "y".to_owned(),
                    size: 4,
                },
            ],
        };
        let pos = schema
            .register_component_with_layout::<Pos>(Some(layout.clone()))
            .unwrap();
        assert_eq!(schema.component_layout(pos), Some(&layout));
    }

    #[test]
    fn clone_into_replaces_target_state() {
        let mut a = Schema::new();
        a.register_component::<Pos>().unwrap();
        a.register_tag::<Frozen>().unwrap();

        let mut b = Schema::new();
        b.register_component::<Vel>().unwrap();

        a.clone_into(&mut b);
        assert_eq!(b.component_count(), 1);
        assert!(b.component_index_of::<Pos>().is_ok());
        assert!(b.component_index_of::<Vel>().is_err());
        assert!(b.tag_index_of::<Frozen>().is_ok());
    }

    #[test]
    fn fingerprint_stable_for_same_name_and_size() {
        assert_eq!(type_fingerprint("a::B", 8), type_fingerprint("a::B", 8));
        assert_ne!(type_fingerprint("a::B", 8), type_fingerprint("a::B", 4));
        assert_ne!(type_fingerprint("a::B", 8), type_fingerprint("a::C", 8));
    }
}
