//! The [`World`] is the top-level container: entity directory, owner of all
//! chunks, and the single entry point for structural mutation.
//!
//! Every entity lives in exactly one chunk, at the row recorded in its slot.
//! Adding or removing a component (or creating/destroying a per-entity array)
//! changes the entity's [`Definition`], which migrates it to the chunk for the
//! new definition via [`chunk::move_row`]. Children, reference lists, and
//! array buffers are kept in side tables keyed by entity so the hot slot
//! record stays small.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::chunk::{self, Chunk, ChunkKey, Column};
use crate::definition::Definition;
use crate::entity::{Entity, Rint, Slot};
use crate::mask::BitMask;
use crate::schema::{ArrayTypeId, ComponentTypeId, Schema, TagTypeId, TypeKind};
use crate::EcsError;

/// The chunk for the empty definition, created when the world is built.
pub(crate) const EMPTY_CHUNK: ChunkKey = ChunkKey(0);

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The top-level ECS container.
///
/// Owns the schema, the slot table and free list, all chunks, and the
/// per-entity side tables (children, references, dynamic arrays).
pub struct World {
    pub(crate) schema: Schema,
    pub(crate) slots: Vec<Slot>,
    /// Recycled slot indices, reused LIFO.
    pub(crate) free_slots: Vec<u32>,
    /// All chunks in creation order, indexed by `ChunkKey`.
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) chunk_index: HashMap<Definition, ChunkKey>,
    /// Child lists, insertion-ordered.
    pub(crate) children: HashMap<Entity, Vec<Entity>>,
    /// Reference lists; removed entries are cleared to null, not compacted,
    /// so outstanding `Rint` handles stay stable.
    pub(crate) references: HashMap<Entity, Vec<Entity>>,
    /// Per-entity dynamic array buffers, keyed by array type index.
    pub(crate) arrays: HashMap<Entity, BTreeMap<ArrayTypeId, Column>>,
    pub(crate) alive_count: usize,
    /// Number of live query iterators. Structural mutation is rejected while
    /// this is nonzero; the borrow checker is the primary enforcement, this
    /// counter catches iterators that escape drop.
    live_queries: Cell<u32>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.alive_count)
            .field("chunk_count", &self.chunks.len())
            .finish()
    }
}

impl World {
    /// Create a new, empty world with an empty schema.
    pub fn new() -> Self {
        Self::with_schema(Schema::new())
    }

    /// Create a new, empty world using an existing schema (for example one
    /// copied from another world via [`Schema::clone_into`]).
    pub fn with_schema(schema: Schema) -> Self {
        let mut world = Self {
            schema,
            slots: Vec::new(),
            free_slots: Vec::new(),
            chunks: Vec::new(),
            chunk_index: HashMap::new(),
            children: HashMap::new(),
            references: HashMap::new(),
            arrays: HashMap::new(),
            alive_count: 0,
            live_queries: Cell::new(0),
        };
        // Bootstrap the empty-definition chunk so create_entity always has a
        // home; it is always at key 0.
        world.get_or_create_chunk(Definition::new());
        world
    }

    /// Read-only access to the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Register a component type. Convenience wrapper over the schema.
    pub fn register_component<T>(&mut self) -> Result<ComponentTypeId, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        self.schema.register_component::<T>()
    }

    /// Register an array-element type. Convenience wrapper over the schema.
    pub fn register_array<T>(&mut self) -> Result<ArrayTypeId, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        self.schema.register_array::<T>()
    }

    /// Register a tag type. Convenience wrapper over the schema.
    pub fn register_tag<T>(&mut self) -> Result<TagTypeId, EcsError>
    where
        T: Send + Sync + 'static,
    {
        self.schema.register_tag::<T>()
    }

    // -- slot helpers -------------------------------------------------------

    fn slot(&self, entity: Entity) -> Result<&Slot, EcsError> {
        if entity.is_null() {
            return Err(EcsError::EntityNotFound { entity });
        }
        match self.slots.get(entity.slot_index()) {
            Some(slot) if slot.alive => Ok(slot),
            _ => Err(EcsError::EntityNotFound { entity }),
        }
    }

    fn slot_mut(&mut self, entity: Entity) -> Result<&mut Slot, EcsError> {
        if entity.is_null() {
            return Err(EcsError::EntityNotFound { entity });
        }
        match self.slots.get_mut(entity.slot_index()) {
            Some(slot) if slot.alive => Ok(slot),
            _ => Err(EcsError::EntityNotFound { entity }),
        }
    }

    fn is_alive(&self, entity: Entity) -> bool {
        !entity.is_null()
            && self
                .slots
                .get(entity.slot_index())
                .is_some_and(|slot| slot.alive)
    }

    pub(crate) fn guard_structural(&self, operation: &'static str) -> Result<(), EcsError> {
        if self.live_queries.get() > 0 {
            return Err(EcsError::StructuralMutationDuringQuery { operation });
        }
        Ok(())
    }

    pub(crate) fn live_query_counter(&self) -> &Cell<u32> {
        &self.live_queries
    }

    // -- chunk management ---------------------------------------------------

    /// Find or create the chunk for `definition`.
    pub(crate) fn get_or_create_chunk(&mut self, definition: Definition) -> ChunkKey {
        if let Some(&key) = self.chunk_index.get(&definition) {
            return key;
        }
        let key = ChunkKey(self.chunks.len() as u32);
        self.chunks.push(Chunk::new(definition, &self.schema));
        self.chunk_index.insert(definition, key);
        debug!(
            chunk = key.0,
            components = definition.component_count(),
            arrays = definition.array_count(),
            "created chunk for new definition"
        );
        key
    }

    /// Borrow two distinct chunks mutably.
    fn two_chunks(chunks: &mut [Chunk], a: ChunkKey, b: ChunkKey) -> (&mut Chunk, &mut Chunk) {
        let (ai, bi) = (a.0 as usize, b.0 as usize);
        debug_assert_ne!(ai, bi);
        if ai < bi {
            let (left, right) = chunks.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = chunks.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }

    /// Move `entity` to the chunk for `new_definition`, patching the slot of
    /// whichever entity was swapped into its old row.
    fn migrate(&mut self, entity: Entity, new_definition: Definition) {
        let slot_index = entity.slot_index();
        let src_key = self.slots[slot_index].chunk;
        let dst_key = self.get_or_create_chunk(new_definition);
        if dst_key == src_key {
            return;
        }
        let row = self.slots[slot_index].row as usize;
        let (src, dst) = Self::two_chunks(&mut self.chunks, src_key, dst_key);
        let (dst_row, swapped) = chunk::move_row(src, row, dst);
        if let Some(moved) = swapped {
            self.slots[moved.slot_index()].row = row as u32;
        }
        let slot = &mut self.slots[slot_index];
        slot.chunk = dst_key;
        slot.row = dst_row as u32;
        trace!(entity = %entity, from = src_key.0, to = dst_key.0, "migrated entity");
    }

    /// The chunk currently storing `definition`, if one was ever created.
    pub fn chunk_for(&self, definition: &Definition) -> Option<&Chunk> {
        self.chunk_index
            .get(definition)
            .map(|key| &self.chunks[key.0 as usize])
    }

    /// Number of chunks (including empty ones).
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// All chunks whose component mask is a superset of `required` and
    /// disjoint from `exclude`, in chunk creation order.
    pub(crate) fn matching_chunks(&self, required: &BitMask, exclude: &BitMask) -> Vec<ChunkKey> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| {
                chunk.definition().components().contains_all(required)
                    && !chunk.definition().components().intersects(exclude)
            })
            .map(|(index, _)| ChunkKey(index as u32))
            .collect()
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create a new entity with the empty definition.
    ///
    /// Recycles the most recently freed slot if any, bumping its version.
    pub fn create_entity(&mut self) -> Result<Entity, EcsError> {
        self.guard_structural("create_entity")?;
        let slot_index = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.version += 1;
                slot.alive = true;
                slot.enabled = true;
                slot.parent = Entity::NULL;
                slot.tags = BitMask::new();
                index as usize
            }
            None => {
                self.slots.push(Slot::fresh());
                self.slots.len() - 1
            }
        };
        let entity = Entity::from_index(slot_index);
        let row = self.chunks[EMPTY_CHUNK.0 as usize].append(entity);
        let slot = &mut self.slots[slot_index];
        slot.chunk = EMPTY_CHUNK;
        slot.row = row as u32;
        self.alive_count += 1;
        Ok(entity)
    }

    /// Create `count` entities at once.
    pub fn create_entities(&mut self, count: usize) -> Result<Vec<Entity>, EcsError> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            created.push(self.create_entity()?);
        }
        Ok(created)
    }

    /// Destroy an entity, freeing its slot for reuse.
    ///
    /// With `destroy_children` the whole subtree is destroyed post-order,
    /// each entity at most once; otherwise the children are detached and
    /// survive with no parent.
    pub fn destroy_entity(&mut self, entity: Entity, destroy_children: bool) -> Result<(), EcsError> {
        self.guard_structural("destroy_entity")?;
        self.slot(entity)?;

        if destroy_children {
            let mut doomed = HashSet::new();
            let mut order = Vec::new();
            self.collect_post_order(entity, &mut doomed, &mut order);
            for &target in &order {
                self.destroy_one(target, &doomed);
            }
        } else {
            if let Some(children) = self.children.remove(&entity) {
                for child in children {
                    if self.is_alive(child) {
                        self.slots[child.slot_index()].parent = Entity::NULL;
                    }
                }
            }
            let doomed: HashSet<Entity> = std::iter::once(entity).collect();
            self.destroy_one(entity, &doomed);
        }
        Ok(())
    }

    /// Post-order traversal of the live subtree under `entity`; every entity
    /// is visited at most once even if the hierarchy is malformed.
    fn collect_post_order(
        &self,
        entity: Entity,
        visited: &mut HashSet<Entity>,
        order: &mut Vec<Entity>,
    ) {
        if !visited.insert(entity) {
            return;
        }
        if let Some(children) = self.children.get(&entity) {
            for &child in children {
                if self.is_alive(child) {
                    self.collect_post_order(child, visited, order);
                }
            }
        }
        order.push(entity);
    }

    /// Tear down one entity. `doomed` is the set being destroyed in the same
    /// call, so we only detach from parents that survive.
    fn destroy_one(&mut self, entity: Entity, doomed: &HashSet<Entity>) {
        let slot_index = entity.slot_index();

        let parent = self.slots[slot_index].parent;
        if !parent.is_null() && !doomed.contains(&parent) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|&c| c != entity);
            }
        }

        self.children.remove(&entity);
        self.references.remove(&entity);
        self.arrays.remove(&entity);

        let (chunk_key, row) = {
            let slot = &self.slots[slot_index];
            (slot.chunk, slot.row as usize)
        };
        if let Some(moved) = self.chunks[chunk_key.0 as usize].remove(row) {
            self.slots[moved.slot_index()].row = row as u32;
        }

        let slot = &mut self.slots[slot_index];
        slot.alive = false;
        slot.enabled = false;
        slot.parent = Entity::NULL;
        slot.tags = BitMask::new();
        self.free_slots.push(slot_index as u32);
        self.alive_count -= 1;
    }

    /// Whether `entity` names a currently live entity.
    pub fn contains_entity(&self, entity: Entity) -> bool {
        self.is_alive(entity)
    }

    /// The slot version for `entity`'s slot, or `None` if the slot was never
    /// allocated. Versions are bumped on slot reuse, so callers that remember
    /// `(entity, version)` can detect recycling.
    pub fn entity_version(&self, entity: Entity) -> Option<u32> {
        if entity.is_null() {
            return None;
        }
        self.slots.get(entity.slot_index()).map(|slot| slot.version)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.alive_count
    }

    /// Iterate all live entities in ascending id order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.alive)
            .map(|(index, _)| Entity::from_index(index))
    }

    /// The definition currently attached to `entity`.
    pub fn definition_of(&self, entity: Entity) -> Result<Definition, EcsError> {
        let slot = self.slot(entity)?;
        Ok(*self.chunks[slot.chunk.0 as usize].definition())
    }

    // -- components ---------------------------------------------------------

    /// Attach a component to an entity. Fails with `AlreadyPresent` if the
    /// entity already has one of this type; use
    /// [`set_or_add_component`](Self::set_or_add_component) for overwrite
    /// semantics.
    pub fn add_component<T>(&mut self, entity: Entity, value: T) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.component_index_of::<T>()?;
        self.add_component_bytes(entity, id, bytemuck::bytes_of(&value))
    }

    /// Untyped form of [`add_component`](Self::add_component): the payload is
    /// the component's raw bytes, sized per the schema.
    pub fn add_component_bytes(
        &mut self,
        entity: Entity,
        id: ComponentTypeId,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        self.guard_structural("add_component")?;
        if !self.schema.contains_component(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("component #{}", id.index()),
            });
        }
        let expected = self.schema.component_size(id);
        if bytes.len() != expected {
            return Err(EcsError::OutOfRange {
                index: bytes.len(),
                len: expected,
            });
        }
        let definition = self.definition_of(entity)?;
        if definition.has_component(id) {
            return Err(EcsError::AlreadyPresent {
                entity,
                kind: TypeKind::Component,
                index: id.index(),
            });
        }
        self.migrate(entity, definition.with_component(id));
        let slot = &self.slots[entity.slot_index()];
        let (chunk_key, row) = (slot.chunk, slot.row as usize);
        self.chunks[chunk_key.0 as usize].write_component(row, id, bytes);
        Ok(())
    }

    /// Overwrite an existing component value. Fails with `NotPresent` if the
    /// entity does not have a component of this type.
    pub fn set_component<T>(&mut self, entity: Entity, value: T) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.component_index_of::<T>()?;
        self.set_component_bytes(entity, id, bytemuck::bytes_of(&value))
    }

    /// Untyped form of [`set_component`](Self::set_component).
    pub fn set_component_bytes(
        &mut self,
        entity: Entity,
        id: ComponentTypeId,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        if !self.schema.contains_component(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("component #{}", id.index()),
            });
        }
        let expected = self.schema.component_size(id);
        if bytes.len() != expected {
            return Err(EcsError::OutOfRange {
                index: bytes.len(),
                len: expected,
            });
        }
        let definition = self.definition_of(entity)?;
        if !definition.has_component(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::Component,
                index: id.index(),
            });
        }
        let slot = &self.slots[entity.slot_index()];
        let (chunk_key, row) = (slot.chunk, slot.row as usize);
        self.chunks[chunk_key.0 as usize].write_component(row, id, bytes);
        Ok(())
    }

    /// Overwrite the component if present, attach it otherwise.
    pub fn set_or_add_component<T>(&mut self, entity: Entity, value: T) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.component_index_of::<T>()?;
        if self.definition_of(entity)?.has_component(id) {
            self.set_component_bytes(entity, id, bytemuck::bytes_of(&value))
        } else {
            self.add_component_bytes(entity, id, bytemuck::bytes_of(&value))
        }
    }

    /// Detach a component from an entity, migrating it to the chunk without
    /// that column. The value is dropped with the migration.
    pub fn remove_component<T>(&mut self, entity: Entity) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.component_index_of::<T>()?;
        self.remove_component_by_id(entity, id)
    }

    /// Untyped form of [`remove_component`](Self::remove_component).
    pub fn remove_component_by_id(
        &mut self,
        entity: Entity,
        id: ComponentTypeId,
    ) -> Result<(), EcsError> {
        self.guard_structural("remove_component")?;
        if !self.schema.contains_component(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("component #{}", id.index()),
            });
        }
        let definition = self.definition_of(entity)?;
        if !definition.has_component(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::Component,
                index: id.index(),
            });
        }
        self.migrate(entity, definition.without_component(id));
        Ok(())
    }

    /// Read a component value.
    pub fn get_component<T>(&self, entity: Entity) -> Result<&T, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.component_index_of::<T>()?;
        let slot = self.slot(entity)?;
        let chunk = &self.chunks[slot.chunk.0 as usize];
        if !chunk.definition().has_component(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::Component,
                index: id.index(),
            });
        }
        Ok(chunk
            .get::<T>(slot.row as usize, id)
            .expect("slot row within chunk"))
    }

    /// Read-write access to a component value.
    ///
    /// The returned reference is invalidated by any structural mutation of
    /// the world, since the entity's chunk or row may move.
    pub fn get_component_mut<T>(&mut self, entity: Entity) -> Result<&mut T, EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.component_index_of::<T>()?;
        let (chunk_key, row) = {
            let slot = self.slot(entity)?;
            (slot.chunk, slot.row as usize)
        };
        let chunk = &mut self.chunks[chunk_key.0 as usize];
        if !chunk.definition().has_component(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::Component,
                index: id.index(),
            });
        }
        Ok(chunk.get_mut::<T>(row, id).expect("slot row within chunk"))
    }

    /// Raw bytes of a component value, sized per the schema.
    pub fn component_bytes(&self, entity: Entity, id: ComponentTypeId) -> Result<&[u8], EcsError> {
        if !self.schema.contains_component(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("component #{}", id.index()),
            });
        }
        let slot = self.slot(entity)?;
        let chunk = &self.chunks[slot.chunk.0 as usize];
        if !chunk.definition().has_component(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::Component,
                index: id.index(),
            });
        }
        Ok(chunk.component_bytes(slot.row as usize, id))
    }

    /// Whether the entity has a component of type `T`. Returns `false` for
    /// dead entities and unregistered types.
    pub fn has_component<T>(&self, entity: Entity) -> bool
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let Ok(id) = self.schema.component_index_of::<T>() else {
            return false;
        };
        self.definition_of(entity)
            .map(|definition| definition.has_component(id))
            .unwrap_or(false)
    }

    // -- tags ---------------------------------------------------------------

    /// Set a tag bit on an entity. Tags are slot-local; no chunk migration.
    pub fn add_tag<T: Send + Sync + 'static>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let id = self.schema.tag_index_of::<T>()?;
        self.add_tag_by_id(entity, id)
    }

    /// Untyped form of [`add_tag`](Self::add_tag). Idempotent.
    pub fn add_tag_by_id(&mut self, entity: Entity, id: TagTypeId) -> Result<(), EcsError> {
        if !self.schema.contains_tag(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("tag #{}", id.index()),
            });
        }
        self.slot_mut(entity)?.tags.set(id.index());
        Ok(())
    }

    /// Clear a tag bit on an entity. Idempotent.
    pub fn remove_tag<T: Send + Sync + 'static>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let id = self.schema.tag_index_of::<T>()?;
        self.remove_tag_by_id(entity, id)
    }

    /// Untyped form of [`remove_tag`](Self::remove_tag).
    pub fn remove_tag_by_id(&mut self, entity: Entity, id: TagTypeId) -> Result<(), EcsError> {
        if !self.schema.contains_tag(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("tag #{}", id.index()),
            });
        }
        self.slot_mut(entity)?.tags.clear(id.index());
        Ok(())
    }

    /// Whether the tag bit is set. Returns `false` for dead entities.
    pub fn has_tag<T: Send + Sync + 'static>(&self, entity: Entity) -> bool {
        let Ok(id) = self.schema.tag_index_of::<T>() else {
            return false;
        };
        self.slot(entity)
            .map(|slot| slot.tags.test(id.index()))
            .unwrap_or(false)
    }

    /// The entity's full tag mask.
    pub fn tags_of(&self, entity: Entity) -> Result<BitMask, EcsError> {
        Ok(self.slot(entity)?.tags)
    }

    // -- per-entity dynamic arrays ------------------------------------------

    /// Create a zero-initialized dynamic array of `len` elements on an
    /// entity. The array type becomes part of the entity's definition, so
    /// this migrates its chunk; the buffer itself lives in the world's side
    /// table and is untouched by later migrations.
    pub fn create_array<T>(&mut self, entity: Entity, len: usize) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.array_index_of::<T>()?;
        self.create_array_by_id(entity, id, len, None)
    }

    /// Create a dynamic array initialized from `values`.
    pub fn create_array_from<T>(&mut self, entity: Entity, values: &[T]) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.array_index_of::<T>()?;
        self.create_array_by_id(entity, id, values.len(), Some(bytemuck::cast_slice(values)))
    }

    /// Untyped array creation; `values`, when given, must be exactly
    /// `len * element_size` bytes.
    pub fn create_array_by_id(
        &mut self,
        entity: Entity,
        id: ArrayTypeId,
        len: usize,
        values: Option<&[u8]>,
    ) -> Result<(), EcsError> {
        self.guard_structural("create_array")?;
        if !self.schema.contains_array(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("array #{}", id.index()),
            });
        }
        let size = self.schema.array_size(id);
        if let Some(bytes) = values {
            if bytes.len() != len * size {
                return Err(EcsError::OutOfRange {
                    index: bytes.len(),
                    len: len * size,
                });
            }
        }
        let definition = self.definition_of(entity)?;
        if definition.has_array(id) {
            return Err(EcsError::AlreadyPresent {
                entity,
                kind: TypeKind::ArrayElement,
                index: id.index(),
            });
        }
        self.migrate(entity, definition.with_array(id));
        let mut column = Column::with_len(size, self.schema.array_align(id), len);
        if let Some(bytes) = values {
            column.as_bytes_mut().copy_from_slice(bytes);
        }
        self.arrays.entry(entity).or_default().insert(id, column);
        Ok(())
    }

    /// Resize a dynamic array, zero-filling any new elements.
    pub fn resize_array<T>(&mut self, entity: Entity, new_len: usize) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.array_index_of::<T>()?;
        self.resize_array_by_id(entity, id, new_len)
    }

    /// Untyped form of [`resize_array`](Self::resize_array).
    pub fn resize_array_by_id(
        &mut self,
        entity: Entity,
        id: ArrayTypeId,
        new_len: usize,
    ) -> Result<(), EcsError> {
        self.array_column_mut(entity, id)?.resize_zeroed(new_len);
        Ok(())
    }

    /// Destroy a dynamic array, removing the type from the entity's
    /// definition (chunk migration) and freeing the buffer.
    pub fn destroy_array<T>(&mut self, entity: Entity) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.array_index_of::<T>()?;
        self.destroy_array_by_id(entity, id)
    }

    /// Untyped form of [`destroy_array`](Self::destroy_array).
    pub fn destroy_array_by_id(&mut self, entity: Entity, id: ArrayTypeId) -> Result<(), EcsError> {
        self.guard_structural("destroy_array")?;
        if !self.schema.contains_array(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("array #{}", id.index()),
            });
        }
        let definition = self.definition_of(entity)?;
        if !definition.has_array(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::ArrayElement,
                index: id.index(),
            });
        }
        self.migrate(entity, definition.without_array(id));
        let buffers = self.arrays.get_mut(&entity).expect("array table entry");
        buffers.remove(&id);
        if buffers.is_empty() {
            self.arrays.remove(&entity);
        }
        Ok(())
    }

    /// Read a dynamic array as a typed slice.
    pub fn get_array<T>(&self, entity: Entity) -> Result<&[T], EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.array_index_of::<T>()?;
        Ok(self.array_column(entity, id)?.as_slice::<T>())
    }

    /// Read-write access to a dynamic array.
    pub fn get_array_mut<T>(&mut self, entity: Entity) -> Result<&mut [T], EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.array_index_of::<T>()?;
        Ok(self.array_column_mut(entity, id)?.as_mut_slice::<T>())
    }

    /// Overwrite one element of a dynamic array.
    pub fn set_array_element<T>(
        &mut self,
        entity: Entity,
        index: usize,
        value: T,
    ) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let id = self.schema.array_index_of::<T>()?;
        self.set_array_element_by_id(entity, id, index, bytemuck::bytes_of(&value))
    }

    /// Untyped form of [`set_array_element`](Self::set_array_element).
    pub fn set_array_element_by_id(
        &mut self,
        entity: Entity,
        id: ArrayTypeId,
        index: usize,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        let size = if self.schema.contains_array(id) {
            self.schema.array_size(id)
        } else {
            return Err(EcsError::TypeNotRegistered {
                name: format!("array #{}", id.index()),
            });
        };
        if bytes.len() != size {
            return Err(EcsError::OutOfRange {
                index: bytes.len(),
                len: size,
            });
        }
        let column = self.array_column_mut(entity, id)?;
        if index >= column.len() {
            return Err(EcsError::OutOfRange {
                index,
                len: column.len(),
            });
        }
        column.write(index, bytes);
        Ok(())
    }

    /// Number of elements in a dynamic array.
    pub fn array_len(&self, entity: Entity, id: ArrayTypeId) -> Result<usize, EcsError> {
        Ok(self.array_column(entity, id)?.len())
    }

    /// Raw bytes of a dynamic array (`len * element_size`).
    pub fn array_bytes(&self, entity: Entity, id: ArrayTypeId) -> Result<&[u8], EcsError> {
        Ok(self.array_column(entity, id)?.as_bytes())
    }

    fn array_column(&self, entity: Entity, id: ArrayTypeId) -> Result<&Column, EcsError> {
        if !self.schema.contains_array(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("array #{}", id.index()),
            });
        }
        let definition = self.definition_of(entity)?;
        if !definition.has_array(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::ArrayElement,
                index: id.index(),
            });
        }
        Ok(self
            .arrays
            .get(&entity)
            .and_then(|buffers| buffers.get(&id))
            .expect("array buffer present for definition bit"))
    }

    fn array_column_mut(&mut self, entity: Entity, id: ArrayTypeId) -> Result<&mut Column, EcsError> {
        if !self.schema.contains_array(id) {
            return Err(EcsError::TypeNotRegistered {
                name: format!("array #{}", id.index()),
            });
        }
        let definition = self.definition_of(entity)?;
        if !definition.has_array(id) {
            return Err(EcsError::NotPresent {
                entity,
                kind: TypeKind::ArrayElement,
                index: id.index(),
            });
        }
        Ok(self
            .arrays
            .get_mut(&entity)
            .and_then(|buffers| buffers.get_mut(&id))
            .expect("array buffer present for definition bit"))
    }

    // -- parent / children --------------------------------------------------

    /// Set or change an entity's parent; `Entity::NULL` detaches. Cycle
    /// prevention is the caller's responsibility.
    pub fn set_parent(&mut self, child: Entity, parent: Entity) -> Result<(), EcsError> {
        self.slot(child)?;
        if !parent.is_null() {
            self.slot(parent)?;
        }
        let old = self.slots[child.slot_index()].parent;
        if old == parent {
            return Ok(());
        }
        if !old.is_null() {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.retain(|&c| c != child);
            }
        }
        self.slots[child.slot_index()].parent = parent;
        if !parent.is_null() {
            self.children.entry(parent).or_default().push(child);
        }
        Ok(())
    }

    /// An entity's parent, or null.
    pub fn parent_of(&self, entity: Entity) -> Result<Entity, EcsError> {
        Ok(self.slot(entity)?.parent)
    }

    /// An entity's children in attachment order.
    pub fn children_of(&self, entity: Entity) -> Result<&[Entity], EcsError> {
        self.slot(entity)?;
        Ok(self
            .children
            .get(&entity)
            .map_or(&[][..], |children| children.as_slice()))
    }

    // -- references ---------------------------------------------------------

    /// Append `to` to `from`'s reference list and return its handle.
    ///
    /// References are never fixed up when `to` is later destroyed; callers
    /// observe the stale id and can detect its death via
    /// [`contains_entity`](Self::contains_entity).
    pub fn add_reference(&mut self, from: Entity, to: Entity) -> Result<Rint, EcsError> {
        self.slot(from)?;
        self.slot(to)?;
        let references = self.references.entry(from).or_default();
        references.push(to);
        Ok(Rint::from_index(references.len() - 1))
    }

    /// Clear the referenced entity behind `rint` to null. The list is not
    /// compacted, so later handles stay valid.
    pub fn remove_reference(&mut self, from: Entity, rint: Rint) -> Result<(), EcsError> {
        self.slot(from)?;
        let len = self.references.get(&from).map_or(0, |r| r.len());
        if rint.is_none() || rint.list_index() >= len {
            return Err(EcsError::OutOfRange {
                index: rint.get() as usize,
                len,
            });
        }
        self.references.get_mut(&from).expect("reference list")[rint.list_index()] = Entity::NULL;
        Ok(())
    }

    /// The entity stored behind `rint` (null if the entry was removed).
    pub fn get_reference(&self, from: Entity, rint: Rint) -> Result<Entity, EcsError> {
        self.slot(from)?;
        let len = self.references.get(&from).map_or(0, |r| r.len());
        if rint.is_none() || rint.list_index() >= len {
            return Err(EcsError::OutOfRange {
                index: rint.get() as usize,
                len,
            });
        }
        Ok(self.references.get(&from).expect("reference list")[rint.list_index()])
    }

    /// Number of reference entries (including cleared ones).
    pub fn reference_count(&self, entity: Entity) -> Result<usize, EcsError> {
        self.slot(entity)?;
        Ok(self.references.get(&entity).map_or(0, |r| r.len()))
    }

    // -- enabled flag -------------------------------------------------------

    /// Whether the entity is enabled (included in `only_enabled` queries).
    pub fn is_enabled(&self, entity: Entity) -> Result<bool, EcsError> {
        Ok(self.slot(entity)?.enabled)
    }

    /// Enable or disable an entity. Idempotent.
    pub fn set_enabled(&mut self, entity: Entity, enabled: bool) -> Result<(), EcsError> {
        self.slot_mut(entity)?.enabled = enabled;
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Pos {
        x: i32,
        y: i32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Vel {
        dx: i32,
        dy: i32,
    }

    struct Frozen;

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Pos>().unwrap();
        world.register_component::<Vel>().unwrap();
        world.register_array::<u32>().unwrap();
        world.register_tag::<Frozen>().unwrap();
        world
    }

    #[test]
    fn create_and_destroy() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        assert!(world.contains_entity(e));
        assert_eq!(world.entity_count(), 1);
        world.destroy_entity(e, false).unwrap();
        assert!(!world.contains_entity(e));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn recycled_slot_bumps_version() {
        let mut world = setup_world();
        let e1 = world.create_entity().unwrap();
        let v1 = world.entity_version(e1).unwrap();
        world.destroy_entity(e1, false).unwrap();
        let e2 = world.create_entity().unwrap();
        // LIFO reuse: same id, fresh version.
        assert_eq!(e1, e2);
        assert_eq!(world.entity_version(e2).unwrap(), v1 + 1);
    }

    #[test]
    fn free_list_is_lifo() {
        let mut world = setup_world();
        let e1 = world.create_entity().unwrap();
        let e2 = world.create_entity().unwrap();
        world.destroy_entity(e1, false).unwrap();
        world.destroy_entity(e2, false).unwrap();
        // e2 was freed last, so it is reused first.
        assert_eq!(world.create_entity().unwrap(), e2);
        assert_eq!(world.create_entity().unwrap(), e1);
    }

    #[test]
    fn add_get_set_remove_component() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();

        world.add_component(e, Pos { x: 1, y: 2 }).unwrap();
        assert_eq!(world.get_component::<Pos>(e).unwrap(), &Pos { x: 1, y: 2 });
        assert!(world.has_component::<Pos>(e));

        world.set_component(e, Pos { x: 5, y: 6 }).unwrap();
        assert_eq!(world.get_component::<Pos>(e).unwrap(), &Pos { x: 5, y: 6 });

        world.remove_component::<Pos>(e).unwrap();
        assert!(!world.has_component::<Pos>(e));
        assert!(matches!(
            world.get_component::<Pos>(e),
            Err(EcsError::NotPresent { .. })
        ));
    }

    #[test]
    fn add_twice_is_already_present() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        world.add_component(e, Pos { x: 1, y: 2 }).unwrap();
        assert!(matches!(
            world.add_component(e, Pos { x: 3, y: 4 }),
            Err(EcsError::AlreadyPresent { .. })
        ));
        // set_or_add overwrites instead.
        world.set_or_add_component(e, Pos { x: 3, y: 4 }).unwrap();
        assert_eq!(world.get_component::<Pos>(e).unwrap(), &Pos { x: 3, y: 4 });
    }

    #[test]
    fn set_component_is_idempotent() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        world.add_component(e, Pos { x: 9, y: 9 }).unwrap();
        world.set_component(e, Pos { x: 4, y: 4 }).unwrap();
        world.set_component(e, Pos { x: 4, y: 4 }).unwrap();
        assert_eq!(world.get_component::<Pos>(e).unwrap(), &Pos { x: 4, y: 4 });
    }

    #[test]
    fn remove_returns_entity_to_prior_definition() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        world.add_component(e, Pos { x: 1, y: 1 }).unwrap();
        world.add_tag::<Frozen>(e).unwrap();
        world.create_array::<u32>(e, 3).unwrap();
        let before = world.definition_of(e).unwrap();

        world.add_component(e, Vel { dx: 2, dy: 2 }).unwrap();
        world.remove_component::<Vel>(e).unwrap();

        assert_eq!(world.definition_of(e).unwrap(), before);
        assert!(world.has_tag::<Frozen>(e));
        assert_eq!(world.get_array::<u32>(e).unwrap().len(), 3);
        assert_eq!(world.get_component::<Pos>(e).unwrap(), &Pos { x: 1, y: 1 });
    }

    #[test]
    fn stale_entity_is_rejected() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        world.destroy_entity(e, false).unwrap();
        assert!(matches!(
            world.add_component(e, Pos { x: 0, y: 0 }),
            Err(EcsError::EntityNotFound { .. })
        ));
        assert!(matches!(
            world.get_component::<Pos>(e),
            Err(EcsError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        assert!(matches!(
            world.add_component(e, Pos { x: 0, y: 0 }),
            Err(EcsError::TypeNotRegistered { .. })
        ));
    }

    #[test]
    fn tags_do_not_migrate_chunks() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        world.add_component(e, Pos { x: 0, y: 0 }).unwrap();
        let definition = world.definition_of(e).unwrap();
        world.add_tag::<Frozen>(e).unwrap();
        assert!(world.has_tag::<Frozen>(e));
        assert_eq!(world.definition_of(e).unwrap(), definition);
        world.remove_tag::<Frozen>(e).unwrap();
        assert!(!world.has_tag::<Frozen>(e));
    }

    #[test]
    fn arrays_survive_chunk_migration() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        world.create_array_from::<u32>(e, &[1, 2, 3]).unwrap();
        // Adding a component migrates the entity; the buffer must be intact.
        world.add_component(e, Pos { x: 0, y: 0 }).unwrap();
        assert_eq!(world.get_array::<u32>(e).unwrap(), &[1, 2, 3]);

        world.resize_array::<u32>(e, 5).unwrap();
        assert_eq!(world.get_array::<u32>(e).unwrap(), &[1, 2, 3, 0, 0]);

        world.set_array_element::<u32>(e, 4, 9).unwrap();
        assert_eq!(world.get_array::<u32>(e).unwrap(), &[1, 2, 3, 0, 9]);

        assert!(matches!(
            world.set_array_element::<u32>(e, 5, 1),
            Err(EcsError::OutOfRange { .. })
        ));

        world.destroy_array::<u32>(e).unwrap();
        assert!(matches!(
            world.get_array::<u32>(e),
            Err(EcsError::NotPresent { .. })
        ));
    }

    #[test]
    fn parent_and_children_links() {
        let mut world = setup_world();
        let parent = world.create_entity().unwrap();
        let a = world.create_entity().unwrap();
        let b = world.create_entity().unwrap();

        world.set_parent(a, parent).unwrap();
        world.set_parent(b, parent).unwrap();
        assert_eq!(world.parent_of(a).unwrap(), parent);
        assert_eq!(world.children_of(parent).unwrap(), &[a, b]);

        world.set_parent(a, Entity::NULL).unwrap();
        assert_eq!(world.parent_of(a).unwrap(), Entity::NULL);
        assert_eq!(world.children_of(parent).unwrap(), &[b]);
    }

    #[test]
    fn destroy_with_children_is_recursive() {
        let mut world = setup_world();
        let root = world.create_entity().unwrap();
        let child = world.create_entity().unwrap();
        let grandchild = world.create_entity().unwrap();
        world.set_parent(child, root).unwrap();
        world.set_parent(grandchild, child).unwrap();

        world.destroy_entity(root, true).unwrap();
        assert!(!world.contains_entity(root));
        assert!(!world.contains_entity(child));
        assert!(!world.contains_entity(grandchild));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn destroy_without_children_detaches() {
        let mut world = setup_world();
        let root = world.create_entity().unwrap();
        let child = world.create_entity().unwrap();
        world.set_parent(child, root).unwrap();

        world.destroy_entity(root, false).unwrap();
        assert!(world.contains_entity(child));
        assert_eq!(world.parent_of(child).unwrap(), Entity::NULL);
    }

    #[test]
    fn references_keep_stable_handles() {
        let mut world = setup_world();
        let a = world.create_entity().unwrap();
        let b = world.create_entity().unwrap();
        let c = world.create_entity().unwrap();

        let r1 = world.add_reference(a, b).unwrap();
        let r2 = world.add_reference(a, c).unwrap();
        assert_eq!(world.get_reference(a, r1).unwrap(), b);
        assert_eq!(world.get_reference(a, r2).unwrap(), c);
        assert_eq!(world.reference_count(a).unwrap(), 2);

        // Removing the first entry leaves the second handle valid.
        world.remove_reference(a, r1).unwrap();
        assert_eq!(world.get_reference(a, r1).unwrap(), Entity::NULL);
        assert_eq!(world.get_reference(a, r2).unwrap(), c);

        // A destroyed target is observed as a stale id, not fixed up.
        world.destroy_entity(c, false).unwrap();
        assert_eq!(world.get_reference(a, r2).unwrap(), c);
        assert!(!world.contains_entity(c));
    }

    #[test]
    fn reference_handle_out_of_range() {
        let mut world = setup_world();
        let a = world.create_entity().unwrap();
        assert!(matches!(
            world.get_reference(a, Rint::NONE),
            Err(EcsError::OutOfRange { .. })
        ));
    }

    #[test]
    fn enabled_flag_is_idempotent() {
        let mut world = setup_world();
        let e = world.create_entity().unwrap();
        assert!(world.is_enabled(e).unwrap());
        world.set_enabled(e, false).unwrap();
        world.set_enabled(e, false).unwrap();
        assert!(!world.is_enabled(e).unwrap());
        world.set_enabled(e, true).unwrap();
        assert!(world.is_enabled(e).unwrap());
    }

    #[test]
    fn swap_remove_patches_displaced_slot() {
        let mut world = setup_world();
        let e1 = world.create_entity().unwrap();
        let e2 = world.create_entity().unwrap();
        let e3 = world.create_entity().unwrap();
        for (e, v) in [(e1, 10), (e2, 20), (e3, 30)] {
            world.add_component(e, Pos { x: v, y: 0 }).unwrap();
        }

        world.destroy_entity(e2, false).unwrap();

        // The survivors still resolve to their own values.
        assert_eq!(world.get_component::<Pos>(e1).unwrap(), &Pos { x: 10, y: 0 });
        assert_eq!(world.get_component::<Pos>(e3).unwrap(), &Pos { x: 30, y: 0 });
        let chunk = world
            .chunk_for(&world.definition_of(e1).unwrap())
            .unwrap();
        assert_eq!(chunk.len(), 2);
    }
}
