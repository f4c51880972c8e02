//! Query engine: iterate entities by component set.
//!
//! A query selects the chunks whose component mask is a superset of the
//! requested types (minus an optional exclude mask), then walks rows in
//! chunk-creation order, yielding `(Entity, (&C1, &C2, ...))` tuples whose
//! references point directly into chunk columns. Per-row filtering covers the
//! required tag mask and the enabled flag.
//!
//! ## Soundness
//!
//! Read-only queries (`&T`) use [`World::query`] which takes `&self`.
//! Mutable queries (`&mut T`) use [`World::query_mut`] which takes
//! `&mut self`, guaranteeing exclusive access to the world and preventing
//! aliasing UB. On top of the borrow rules, every live iterator holds a guard
//! that bumps the world's live-query counter; structural mutations check the
//! counter so that even an iterator leaked with `mem::forget` cannot be
//! followed by a chunk-moving operation.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::cell::Cell;
use std::marker::PhantomData;

use crate::chunk::ChunkKey;
use crate::entity::Entity;
use crate::mask::BitMask;
use crate::schema::{ComponentTypeId, Schema, TagTypeId};
use crate::world::World;

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Chunk- and row-level filters applied on top of a query's component types.
///
/// `exclude` removes chunks whose mask intersects it; `tags` and
/// `only_enabled` filter individual rows by slot state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Filter {
    pub(crate) exclude: BitMask,
    pub(crate) tags: BitMask,
    pub(crate) only_enabled: bool,
}

impl Filter {
    /// An empty filter (matches everything the query types match).
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude chunks containing the component type `id`.
    pub fn without(mut self, id: ComponentTypeId) -> Self {
        self.exclude.set(id.index());
        self
    }

    /// Only yield rows whose entity carries the tag `id`.
    pub fn with_tag(mut self, id: TagTypeId) -> Self {
        self.tags.set(id.index());
        self
    }

    /// Only yield rows whose entity is enabled.
    pub fn only_enabled(mut self) -> Self {
        self.only_enabled = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Fetch trait -- one element of a query tuple
// ---------------------------------------------------------------------------

/// A single element of a query fetch: `&T` (read) or `&mut T` (write).
pub trait Fetch {
    /// The output type yielded per row.
    type Item<'w>;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;
    /// The component type id, if `T` is registered.
    fn component_id(schema: &Schema) -> Option<ComponentTypeId>;
    /// Fetch one item from a chunk row.
    fn fetch(world: &World, chunk: ChunkKey, row: usize) -> Self::Item<'_>;
}

impl<T> Fetch for &T
where
    T: bytemuck::Pod + Send + Sync + 'static,
{
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn component_id(schema: &Schema) -> Option<ComponentTypeId> {
        schema.component_index_of::<T>().ok()
    }

    fn fetch(world: &World, chunk: ChunkKey, row: usize) -> Self::Item<'_> {
        let id = Self::component_id(&world.schema).expect("query type registered");
        world.chunks[chunk.0 as usize]
            .get::<T>(row, id)
            .expect("query row within chunk")
    }
}

// Safety: only reachable through `World::query_mut(&mut self)`, which holds
// exclusive access to the world for the iterator's lifetime. No other
// references can exist, so the `*const -> *mut` cast is sound, and the
// access-conflict validation rejects tuples that would alias the same column.
impl<T> Fetch for &mut T
where
    T: bytemuck::Pod + Send + Sync + 'static,
{
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn component_id(schema: &Schema) -> Option<ComponentTypeId> {
        schema.component_index_of::<T>().ok()
    }

    fn fetch(world: &World, chunk: ChunkKey, row: usize) -> Self::Item<'_> {
        let id = Self::component_id(&world.schema).expect("query type registered");
        unsafe {
            let world_ptr = world as *const World as *mut World;
            (&mut (*world_ptr).chunks)[chunk.0 as usize]
                .get_mut::<T>(row, id)
                .expect("query row within chunk")
        }
    }
}

// ---------------------------------------------------------------------------
// Query trait -- a tuple of Fetch items
// ---------------------------------------------------------------------------

/// A tuple of query items: `(&A, &B)`, `(&mut A, &B)`, etc.
pub trait Query {
    /// The per-row output type.
    type Item<'w>;
    /// Whether any item borrows mutably.
    const HAS_MUTABLE: bool;
    /// The combined required component mask, or `None` if any item's type is
    /// not registered (in which case nothing can match).
    fn required_mask(schema: &Schema) -> Option<BitMask>;
    /// Panic if the tuple would alias the same component type mutably.
    fn validate_access(schema: &Schema);
    /// Fetch one row.
    fn fetch_row(world: &World, chunk: ChunkKey, row: usize) -> Self::Item<'_>;
}

/// Reject tuples with overlapping mutable access to one component type.
fn validate_no_access_conflicts(items: &[(bool, Option<ComponentTypeId>)]) {
    let mut mutable_ids: Vec<ComponentTypeId> = Vec::new();
    let mut read_ids: Vec<ComponentTypeId> = Vec::new();
    for &(is_mutable, id) in items {
        let Some(id) = id else { continue };
        if is_mutable {
            if mutable_ids.contains(&id) {
                panic!("query contains duplicate mutable access to the same component type");
            }
            if read_ids.contains(&id) {
                panic!("query contains overlapping read and mutable access to the same component type");
            }
            mutable_ids.push(id);
        } else {
            if mutable_ids.contains(&id) {
                panic!("query contains overlapping read and mutable access to the same component type");
            }
            read_ids.push(id);
        }
    }
}

macro_rules! impl_query_tuple {
    ($($name:ident),+) => {
        impl<$($name: Fetch),+> Query for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);
            const HAS_MUTABLE: bool = $($name::MUTABLE)||+;

            fn required_mask(schema: &Schema) -> Option<BitMask> {
                let mut mask = BitMask::new();
                $(mask.set($name::component_id(schema)?.index());)+
                Some(mask)
            }

            fn validate_access(schema: &Schema) {
                let items = [$(($name::MUTABLE, $name::component_id(schema))),+];
                validate_no_access_conflicts(&items);
            }

            fn fetch_row(world: &World, chunk: ChunkKey, row: usize) -> Self::Item<'_> {
                ($($name::fetch(world, chunk, row),)+)
            }
        }
    };
}

impl_query_tuple!(A);
impl_query_tuple!(A, B);
impl_query_tuple!(A, B, C);
impl_query_tuple!(A, B, C, D);

// ---------------------------------------------------------------------------
// Live-query guard
// ---------------------------------------------------------------------------

/// Increments the world's live-query counter for the iterator's lifetime.
pub(crate) struct LiveQueryGuard<'w> {
    counter: &'w Cell<u32>,
}

impl<'w> LiveQueryGuard<'w> {
    fn new(counter: &'w Cell<u32>) -> Self {
        counter.set(counter.get() + 1);
        Self { counter }
    }
}

impl Drop for LiveQueryGuard<'_> {
    fn drop(&mut self) {
        self.counter.set(self.counter.get() - 1);
    }
}

// ---------------------------------------------------------------------------
// QueryIter (read-only)
// ---------------------------------------------------------------------------

/// Iterator yielding `(Entity, Q::Item)` for all matching rows.
/// Produced by [`World::query`] / [`World::query_filtered`].
pub struct QueryIter<'w, Q: Query> {
    world: &'w World,
    chunks: Vec<ChunkKey>,
    filter: Filter,
    chunk_cursor: usize,
    row_cursor: usize,
    _guard: LiveQueryGuard<'w>,
    _marker: PhantomData<Q>,
}

impl<'w, Q: Query> QueryIter<'w, Q> {
    fn new(world: &'w World, chunks: Vec<ChunkKey>, filter: Filter) -> Self {
        Self {
            world,
            chunks,
            filter,
            chunk_cursor: 0,
            row_cursor: 0,
            _guard: LiveQueryGuard::new(world.live_query_counter()),
            _marker: PhantomData,
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let &key = self.chunks.get(self.chunk_cursor)?;
            let chunk = &self.world.chunks[key.0 as usize];
            if self.row_cursor < chunk.len() {
                let row = self.row_cursor;
                self.row_cursor += 1;
                let entity = chunk.entities()[row];
                let slot = &self.world.slots[entity.slot_index()];
                if self.filter.only_enabled && !slot.enabled {
                    continue;
                }
                if !slot.tags.contains_all(&self.filter.tags) {
                    continue;
                }
                return Some((entity, Q::fetch_row(self.world, key, row)));
            }
            self.chunk_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// QueryIterMut (mutable)
// ---------------------------------------------------------------------------

/// Iterator yielding `(Entity, Q::Item)` for all matching rows.
/// Produced by [`World::query_mut`] / [`World::query_mut_filtered`].
///
/// The lifetime `'w` is tied to the exclusive `&mut World` borrow taken at
/// construction, which is what makes yielding `&mut T` items sound.
pub struct QueryIterMut<'w, Q: Query> {
    world: &'w World,
    chunks: Vec<ChunkKey>,
    filter: Filter,
    chunk_cursor: usize,
    row_cursor: usize,
    _guard: LiveQueryGuard<'w>,
    _marker: PhantomData<Q>,
}

impl<'w, Q: Query> QueryIterMut<'w, Q> {
    fn new(world: &'w World, chunks: Vec<ChunkKey>, filter: Filter) -> Self {
        Self {
            world,
            chunks,
            filter,
            chunk_cursor: 0,
            row_cursor: 0,
            _guard: LiveQueryGuard::new(world.live_query_counter()),
            _marker: PhantomData,
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIterMut<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let &key = self.chunks.get(self.chunk_cursor)?;
            let chunk = &self.world.chunks[key.0 as usize];
            if self.row_cursor < chunk.len() {
                let row = self.row_cursor;
                self.row_cursor += 1;
                let entity = chunk.entities()[row];
                let slot = &self.world.slots[entity.slot_index()];
                if self.filter.only_enabled && !slot.enabled {
                    continue;
                }
                if !slot.tags.contains_all(&self.filter.tags) {
                    continue;
                }
                return Some((entity, Q::fetch_row(self.world, key, row)));
            }
            self.chunk_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// World query methods
// ---------------------------------------------------------------------------

impl World {
    /// Run a read-only query over all matching entities.
    ///
    /// # Panics
    ///
    /// Panics if the query contains mutable items; use
    /// [`query_mut`](Self::query_mut) instead.
    pub fn query<Q: Query>(&self) -> QueryIter<'_, Q> {
        self.query_filtered(Filter::new())
    }

    /// Read-only query with an additional [`Filter`].
    pub fn query_filtered<Q: Query>(&self, filter: Filter) -> QueryIter<'_, Q> {
        assert!(
            !Q::HAS_MUTABLE,
            "World::query() cannot be used with mutable query items (&mut T). \
             Use World::query_mut() instead, which requires &mut self."
        );
        let chunks = match Q::required_mask(&self.schema) {
            Some(required) => self.matching_chunks(&required, &filter.exclude),
            // An unregistered type can exist on no chunk: match nothing.
            None => Vec::new(),
        };
        QueryIter::new(self, chunks, filter)
    }

    /// Run a mutable query over all matching entities.
    ///
    /// Takes `&mut self`, guaranteeing exclusive world access, which is what
    /// makes `&mut T` items sound.
    ///
    /// # Panics
    ///
    /// Panics if the tuple aliases the same component type mutably.
    pub fn query_mut<Q: Query>(&mut self) -> QueryIterMut<'_, Q> {
        self.query_mut_filtered(Filter::new())
    }

    /// Mutable query with an additional [`Filter`].
    pub fn query_mut_filtered<Q: Query>(&mut self, filter: Filter) -> QueryIterMut<'_, Q> {
        Q::validate_access(&self.schema);
        let chunks = match Q::required_mask(&self.schema) {
            Some(required) => self.matching_chunks(&required, &filter.exclude),
            None => Vec::new(),
        };
        QueryIterMut::new(self, chunks, filter)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
