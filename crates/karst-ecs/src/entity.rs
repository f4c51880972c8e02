//! Entity identifiers, reference handles, and per-entity slot bookkeeping.
//!
//! An [`Entity`] is a 32-bit id; id 0 is reserved as the null entity. Ids are
//! allocated monotonically and recycled LIFO through the world's free list.
//! Each slot carries a version counter that is bumped when the slot is
//! reused, so a caller that remembers `(entity, version)` can detect that a
//! recycled id no longer names the object it used to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkKey;
use crate::mask::BitMask;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A 32-bit entity identifier. Id 0 is the null entity and is never alive.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Entity(u32);

impl Entity {
    /// The reserved null entity (id 0).
    pub const NULL: Entity = Entity(0);

    /// Reconstruct an entity from its raw id.
    #[inline]
    pub fn from_id(id: u32) -> Self {
        Self(id)
    }

    /// The raw 32-bit id.
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }

    /// Whether this is the null entity.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The entity occupying slot `index`.
    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    /// The slot index this entity occupies. Must not be called on the null
    /// entity.
    #[inline]
    pub(crate) fn slot_index(self) -> usize {
        debug_assert!(!self.is_null());
        (self.0 - 1) as usize
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Rint
// ---------------------------------------------------------------------------

/// Handle addressing one entry of an entity's reference list.
///
/// Handles are 1-based; [`Rint::NONE`] (0) means "no reference". Removing a
/// reference clears its entry without shifting later entries, so outstanding
/// handles stay valid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rint(u32);

impl Rint {
    /// The null reference handle.
    pub const NONE: Rint = Rint(0);

    /// The raw 1-based handle value.
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the null handle.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    /// The zero-based list index. Must not be called on the null handle.
    #[inline]
    pub(crate) fn list_index(self) -> usize {
        debug_assert!(!self.is_none());
        (self.0 - 1) as usize
    }
}

impl fmt::Debug for Rint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rint({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// Per-entity directory record: where the entity's data lives plus the state
/// that is not part of its chunk (enabled flag, parent link, tag mask).
///
/// Children, reference lists, and array buffers live in side tables on the
/// world, keyed by entity, so this hot record stays small.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    /// Bumped every time the slot is reused. 0 means "never allocated".
    pub version: u32,
    pub alive: bool,
    pub enabled: bool,
    /// The chunk holding this entity's components while alive.
    pub chunk: ChunkKey,
    /// Row within that chunk.
    pub row: u32,
    /// Parent entity, or null.
    pub parent: Entity,
    /// Tag bits; slot-local, never part of the chunk key.
    pub tags: BitMask,
}

impl Slot {
    /// A freshly allocated, alive slot with no attachments.
    pub fn fresh() -> Self {
        Self {
            version: 1,
            alive: true,
            enabled: true,
            chunk: ChunkKey(0),
            row: 0,
            parent: Entity::NULL,
            tags: BitMask::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_mapping() {
        let e = Entity::from_index(0);
        assert_eq!(e.id(), 1);
        assert_eq!(e.slot_index(), 0);
        assert!(!e.is_null());
        assert!(Entity::NULL.is_null());
        assert_eq!(Entity::from_id(7).id(), 7);
    }

    #[test]
    fn rint_is_one_based() {
        let r = Rint::from_index(0);
        assert_eq!(r.get(), 1);
        assert_eq!(r.list_index(), 0);
        assert!(Rint::NONE.is_none());
        assert!(!r.is_none());
    }
}
