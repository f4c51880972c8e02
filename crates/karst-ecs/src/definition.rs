//! Chunk shape identity.
//!
//! A [`Definition`] is the pair of masks -- component types and array types --
//! that identifies which chunk an entity belongs to. Two definitions are equal
//! iff their masks are equal; the hash is derived from the masks, so a
//! definition can key the world's chunk index directly.

use crate::mask::BitMask;
use crate::schema::{ArrayTypeId, ComponentTypeId};

/// The exact set of component and array types attached to an entity.
///
/// Value type: cheap to copy, hash, and compare. The empty definition is
/// valid and identifies the chunk holding entities with no components.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Definition {
    components: BitMask,
    arrays: BitMask,
}

impl Definition {
    /// The empty definition (no components, no arrays).
    pub fn new() -> Self {
        Self::default()
    }

    /// The component mask.
    #[inline]
    pub fn components(&self) -> &BitMask {
        &self.components
    }

    /// The array mask.
    #[inline]
    pub fn arrays(&self) -> &BitMask {
        &self.arrays
    }

    /// Build a definition directly from its masks.
    pub fn from_masks(components: BitMask, arrays: BitMask) -> Self {
        Self { components, arrays }
    }

    /// Number of component types in this definition.
    pub fn component_count(&self) -> u32 {
        self.components.count()
    }

    /// Number of array types in this definition.
    pub fn array_count(&self) -> u32 {
        self.arrays.count()
    }

    /// Whether this is the empty definition.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty() && self.arrays.is_empty()
    }

    /// Whether the component type `id` is part of this definition.
    #[inline]
    pub fn has_component(&self, id: ComponentTypeId) -> bool {
        self.components.test(id.index())
    }

    /// Whether the array type `id` is part of this definition.
    #[inline]
    pub fn has_array(&self, id: ArrayTypeId) -> bool {
        self.arrays.test(id.index())
    }

    /// This definition plus the component type `id`.
    pub fn with_component(mut self, id: ComponentTypeId) -> Self {
        self.components.set(id.index());
        self
    }

    /// This definition minus the component type `id`.
    pub fn without_component(mut self, id: ComponentTypeId) -> Self {
        self.components.clear(id.index());
        self
    }

    /// This definition plus the array type `id`.
    pub fn with_array(mut self, id: ArrayTypeId) -> Self {
        self.arrays.set(id.index());
        self
    }

    /// This definition minus the array type `id`.
    pub fn without_array(mut self, id: ArrayTypeId) -> Self {
        self.arrays.clear(id.index());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
