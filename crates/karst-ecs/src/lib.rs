//! Karst ECS -- archetype-based entity storage with chunked SoA columns.
//!
//! Entities are grouped by the exact set of data attached to them: every
//! unique combination of component and array types (a [`Definition`]) gets
//! one [`Chunk`] storing those entities column by column, so component access
//! is O(1) and iteration is cache-friendly. Adding or removing data migrates
//! the entity between chunks transparently. Tags, parent/child links,
//! reference lists, and per-entity dynamic arrays round out the model, and a
//! deferred [`Operation`] buffer makes structural changes replayable and safe
//! to record while a query is running.
//!
//! # Quick Start
//!
//! ```
//! use karst_ecs::prelude::*;
//! use bytemuck_derive::{Pod, Zeroable};
//!
//! #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
//! #[repr(C)]
//! struct Position { x: i32, y: i32 }
//!
//! #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
//! #[repr(C)]
//! struct Velocity { dx: i32, dy: i32 }
//!
//! # fn main() -> Result<(), EcsError> {
//! let mut world = World::new();
//! world.register_component::<Position>()?;
//! world.register_component::<Velocity>()?;
//!
//! let entity = world.create_entity()?;
//! world.add_component(entity, Position { x: 1, y: 2 })?;
//! world.add_component(entity, Velocity { dx: 3, dy: 4 })?;
//!
//! for (_entity, (position, velocity)) in world.query_mut::<(&mut Position, &Velocity)>() {
//!     position.x += velocity.dx;
//!     position.y += velocity.dy;
//! }
//!
//! assert_eq!(world.get_component::<Position>(entity)?, &Position { x: 4, y: 6 });
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod chunk;
pub mod definition;
pub mod entity;
pub mod mask;
pub mod operation;
#[allow(unsafe_code)]
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod world;

use crate::entity::Entity;
use crate::schema::TypeKind;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (destroyed, recycled, or never created).
    #[error("entity {entity} does not exist")]
    EntityNotFound {
        /// The offending id.
        entity: Entity,
    },

    /// A type was used that has not been registered in the schema.
    #[error("type '{name}' is not registered in the schema")]
    TypeNotRegistered {
        /// Type name (or kind + index for untyped access).
        name: String,
    },

    /// The same type was registered twice.
    #[error("type '{name}' is already registered in the schema")]
    AlreadyRegistered {
        /// The duplicate type's name.
        name: String,
    },

    /// A kind's registration limit (256 types) was reached.
    #[error("schema capacity exceeded: too many {kind} types registered")]
    SchemaCapacityExceeded {
        /// Which kind ran out of indices.
        kind: TypeKind,
    },

    /// `add_component` / `create_array` on an entity that already has the
    /// type.
    #[error("entity {entity} already has {kind} type {index}")]
    AlreadyPresent {
        entity: Entity,
        kind: TypeKind,
        index: u8,
    },

    /// Set / get / remove of a type the entity does not have.
    #[error("entity {entity} does not have {kind} type {index}")]
    NotPresent {
        entity: Entity,
        kind: TypeKind,
        index: u8,
    },

    /// A structural mutation was attempted while a query iterator is live.
    #[error("{operation} is a structural mutation and a query iterator is still live")]
    StructuralMutationDuringQuery {
        /// The rejected operation.
        operation: &'static str,
    },

    /// An operation command that requires a selection reached an empty one.
    #[error("operation command '{command}' requires a non-empty selection")]
    EmptySelection {
        /// The offending command.
        command: &'static str,
    },

    /// An index, handle, offset, or payload length was out of bounds.
    #[error("value {index} out of range (limit {len})")]
    OutOfRange { index: usize, len: usize },

    /// A snapshot stream failed to decode.
    #[error("invalid snapshot stream at byte {offset}: {detail}")]
    InvalidStream { offset: usize, detail: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::chunk::{Chunk, ChunkKey};
    pub use crate::definition::Definition;
    pub use crate::entity::{Entity, Rint};
    pub use crate::mask::BitMask;
    pub use crate::operation::{Command, Operation};
    pub use crate::query::{Fetch, Filter, Query, QueryIter, QueryIterMut};
    pub use crate::schema::{
        ArrayTypeId, ComponentTypeId, FieldLayout, Schema, TagTypeId, TypeKind, TypeLayout,
    };
    pub use crate::world::World;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    // -- test component types -----------------------------------------------

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Position {
        x: i32,
        y: i32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Velocity {
        dx: i32,
        dy: i32,
    }

    struct Frozen;

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Position>().unwrap();
        world.register_component::<Velocity>().unwrap();
        world.register_array::<u32>().unwrap();
        world.register_tag::<Frozen>().unwrap();
        world
    }

    // -- creation and component access --------------------------------------

    #[test]
    fn create_then_add_then_read_back() {
        let mut world = setup_world();
        let entity = world.create_entity().unwrap();
        world.add_component(entity, Position { x: 1, y: 2 }).unwrap();

        assert_eq!(
            world.get_component::<Position>(entity).unwrap(),
            &Position { x: 1, y: 2 }
        );

        // The entity lives in the chunk keyed by exactly {Position}.
        let pos = world.schema().component_index_of::<Position>().unwrap();
        let definition = world.definition_of(entity).unwrap();
        assert!(definition.has_component(pos));
        assert_eq!(definition.component_count(), 1);
        let chunk = world.chunk_for(&definition).unwrap();
        assert_eq!(chunk.entities(), &[entity]);
    }

    // -- migration via add ---------------------------------------------------

    #[test]
    fn adding_a_component_migrates_between_chunks() {
        let mut world = setup_world();
        let entity = world.create_entity().unwrap();
        world.add_component(entity, Position { x: 1, y: 2 }).unwrap();
        let old_definition = world.definition_of(entity).unwrap();

        world.add_component(entity, Velocity { dx: 3, dy: 4 }).unwrap();

        let new_definition = world.definition_of(entity).unwrap();
        assert_ne!(old_definition, new_definition);
        assert_eq!(new_definition.component_count(), 2);

        // The new chunk contains exactly this entity; the old one is empty.
        assert_eq!(world.chunk_for(&new_definition).unwrap().entities(), &[entity]);
        assert!(world.chunk_for(&old_definition).unwrap().is_empty());

        // Both values read back as stored.
        assert_eq!(
            world.get_component::<Position>(entity).unwrap(),
            &Position { x: 1, y: 2 }
        );
        assert_eq!(
            world.get_component::<Velocity>(entity).unwrap(),
            &Velocity { dx: 3, dy: 4 }
        );
    }

    // -- swap-remove ----------------------------------------------------------

    #[test]
    fn destroying_a_middle_entity_preserves_survivors() {
        let mut world = setup_world();
        let e1 = world.create_entity().unwrap();
        let e2 = world.create_entity().unwrap();
        let e3 = world.create_entity().unwrap();
        for (e, v) in [(e1, 10), (e2, 20), (e3, 30)] {
            world.add_component(e, Position { x: v, y: 0 }).unwrap();
        }

        world.destroy_entity(e2, false).unwrap();

        assert!(world.contains_entity(e1));
        assert!(!world.contains_entity(e2));
        assert!(world.contains_entity(e3));
        assert_eq!(
            world.get_component::<Position>(e1).unwrap(),
            &Position { x: 10, y: 0 }
        );
        assert_eq!(
            world.get_component::<Position>(e3).unwrap(),
            &Position { x: 30, y: 0 }
        );
    }

    // -- query iteration ------------------------------------------------------

    #[test]
    fn queries_select_by_component_set() {
        let mut world = setup_world();
        let e1 = world.create_entity().unwrap();
        let e3 = world.create_entity().unwrap();
        world.add_component(e1, Position { x: 10, y: 0 }).unwrap();
        world.add_component(e3, Position { x: 30, y: 0 }).unwrap();
        world.add_component(e3, Velocity { dx: 1, dy: 1 }).unwrap();

        let both: Vec<_> = world.query::<(&Position, &Velocity)>().collect();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].0, e3);
        assert_eq!(both[0].1 .0, &Position { x: 30, y: 0 });
        assert_eq!(both[0].1 .1, &Velocity { dx: 1, dy: 1 });

        let mut pos_entities: Vec<_> = world.query::<(&Position,)>().map(|(e, _)| e).collect();
        pos_entities.sort();
        assert_eq!(pos_entities, vec![e1, e3]);
    }

    // -- deferred operation replay -------------------------------------------

    #[test]
    fn operation_replay_builds_the_expected_world() {
        let mut world = setup_world();

        let mut op = Operation::new();
        op.create_entity();
        op.add_component(world.schema(), Position { x: 5, y: 6 }).unwrap();
        op.create_entity();
        op.set_parent_to_created(1);
        op.add_component(world.schema(), Velocity { dx: 7, dy: 8 }).unwrap();

        let created = op.replay(&mut world).unwrap();
        assert_eq!(created.len(), 2);
        let (first, second) = (created[0], created[1]);

        assert_eq!(
            world.get_component::<Position>(first).unwrap(),
            &Position { x: 5, y: 6 }
        );
        assert!(!world.has_component::<Velocity>(first));
        assert_eq!(world.parent_of(first).unwrap(), Entity::NULL);

        assert_eq!(
            world.get_component::<Velocity>(second).unwrap(),
            &Velocity { dx: 7, dy: 8 }
        );
        assert!(!world.has_component::<Position>(second));
        assert_eq!(world.parent_of(second).unwrap(), first);
        assert_eq!(world.children_of(first).unwrap(), &[second]);
    }

    // -- structural mutation during iteration ---------------------------------

    #[test]
    fn structural_changes_during_iteration_go_through_an_operation() {
        let mut world = setup_world();
        for v in [1, 2, 3] {
            let e = world.create_entity().unwrap();
            world.add_component(e, Position { x: v, y: 0 }).unwrap();
        }

        // Mutating the world structurally inside the loop would not borrow
        // check; the supported pattern is to record an operation and replay
        // it once iteration is over.
        let mut op = Operation::new();
        for (entity, (position,)) in world.query::<(&Position,)>() {
            if position.x >= 2 {
                op.select_entity(entity);
            }
        }
        op.add_component(world.schema(), Velocity { dx: 0, dy: 9 }).unwrap();
        op.replay(&mut world).unwrap();

        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 2);
    }

    // -- slot recycling --------------------------------------------------------

    #[test]
    fn recreate_after_destroy_changes_version() {
        let mut world = setup_world();
        let first = world.create_entity().unwrap();
        let v1 = world.entity_version(first).unwrap();
        world.destroy_entity(first, false).unwrap();
        let second = world.create_entity().unwrap();

        assert_eq!(first, second, "freed ids are reused LIFO");
        assert_ne!(world.entity_version(second).unwrap(), v1);
    }

    // -- add/remove restores prior state --------------------------------------

    #[test]
    fn remove_component_restores_prior_definition_and_attachments() {
        let mut world = setup_world();
        let entity = world.create_entity().unwrap();
        let other = world.create_entity().unwrap();
        world.add_component(entity, Position { x: 1, y: 1 }).unwrap();
        world.add_tag::<Frozen>(entity).unwrap();
        world.create_array_from::<u32>(entity, &[1, 2]).unwrap();
        world.set_parent(entity, other).unwrap();
        let rint = world.add_reference(entity, other).unwrap();
        let before = world.definition_of(entity).unwrap();

        world.add_component(entity, Velocity { dx: 0, dy: 0 }).unwrap();
        world.remove_component::<Velocity>(entity).unwrap();

        assert_eq!(world.definition_of(entity).unwrap(), before);
        assert!(world.has_tag::<Frozen>(entity));
        assert_eq!(world.parent_of(entity).unwrap(), other);
        assert_eq!(world.get_reference(entity, rint).unwrap(), other);
        assert_eq!(world.get_array::<u32>(entity).unwrap(), &[1, 2]);
    }

    // -- per-chunk column length invariant -------------------------------------

    #[test]
    fn column_lengths_match_entity_counts() {
        let mut world = setup_world();
        for v in 0..5 {
            let e = world.create_entity().unwrap();
            world.add_component(e, Position { x: v, y: v }).unwrap();
        }
        let pos = world.schema().component_index_of::<Position>().unwrap();
        let definition = Definition::new().with_component(pos);
        let chunk = world.chunk_for(&definition).unwrap();
        assert_eq!(
            chunk.column_bytes(pos).unwrap().len(),
            chunk.len() * world.schema().component_size(pos)
        );
    }
}
