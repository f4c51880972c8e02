//! Deferred, replayable structural mutation.
//!
//! An [`Operation`] records a sequence of [`Command`]s against a cursor-based
//! *selection*: `CreateEntities` selects the entities it just created,
//! `SelectEntity`/`SelectCreated` add to the selection, and every other
//! command applies to each selected entity in order. Commands that target
//! entities created earlier in the same operation address them through the
//! created-history (`offset` 0 = most recently created).
//!
//! Recording is cheap and owns its payload bytes; nothing touches a world
//! until [`Operation::replay`]. Replay validates the whole command list
//! first -- an operation that would apply a selection-scoped command to an
//! empty selection, or address a not-yet-created entity, fails before any
//! mutation occurs. This is what makes operations safe to build inside query
//! iteration and apply after it ends.
//!
//! Commands serialize with serde, so recorded batches can be persisted and
//! replayed elsewhere; replay is deterministic given equivalent worlds.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Rint};
use crate::schema::{ArrayTypeId, ComponentTypeId, Schema};
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// One recorded structural command.
///
/// Component and array payloads are raw POD bytes sized per the schema the
/// operation was recorded against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Allocate `count` fresh entities; they become the new selection and are
    /// appended to the created-history.
    CreateEntities { count: u32 },
    /// Destroy every selected entity (children included), then clear the
    /// selection.
    DestroySelection,
    /// Destroy the selection sub-range `[start, start + len)` and remove it
    /// from the selection.
    DestroySelectionRange { start: u32, len: u32 },
    /// Append an existing entity to the selection.
    SelectEntity { entity: Entity },
    /// Append an entity from the created-history to the selection;
    /// `offset` 0 is the most recently created.
    SelectCreated { offset: u32 },
    /// Empty the selection.
    ClearSelection,
    /// Set the parent of every selected entity.
    SetParent { parent: Entity },
    /// Set the parent of every selected entity to a created-history entry.
    SetParentToCreated { offset: u32 },
    /// Add a reference from every selected entity to `target`.
    AddReference { target: Entity },
    /// Add a reference from every selected entity to a created-history entry.
    AddReferenceToCreated { offset: u32 },
    /// Remove the reference behind `rint` on every selected entity.
    RemoveReference { rint: Rint },
    /// Attach a component to every selected entity.
    AddComponent {
        component: ComponentTypeId,
        bytes: Vec<u8>,
    },
    /// Overwrite a component on every selected entity.
    SetComponent {
        component: ComponentTypeId,
        bytes: Vec<u8>,
    },
    /// Detach a component from every selected entity.
    RemoveComponent { component: ComponentTypeId },
    /// Create a dynamic array on every selected entity, zeroed or from
    /// `values` (exactly `len * element_size` bytes when present).
    CreateArray {
        array: ArrayTypeId,
        len: u32,
        values: Option<Vec<u8>>,
    },
    /// Destroy a dynamic array on every selected entity.
    DestroyArray { array: ArrayTypeId },
    /// Resize a dynamic array on every selected entity.
    ResizeArray { array: ArrayTypeId, len: u32 },
    /// Overwrite one array element on every selected entity.
    SetArrayElement {
        array: ArrayTypeId,
        index: u32,
        bytes: Vec<u8>,
    },
}

impl Command {
    /// Whether this command applies to the entities in the selection.
    fn needs_selection(&self) -> bool {
        !matches!(
            self,
            Command::CreateEntities { .. }
                | Command::SelectEntity { .. }
                | Command::SelectCreated { .. }
                | Command::ClearSelection
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Command::CreateEntities { .. } => "CreateEntities",
            Command::DestroySelection => "DestroySelection",
            Command::DestroySelectionRange { .. } => "DestroySelectionRange",
            Command::SelectEntity { .. } => "SelectEntity",
            Command::SelectCreated { .. } => "SelectCreated",
            Command::ClearSelection => "ClearSelection",
            Command::SetParent { .. } => "SetParent",
            Command::SetParentToCreated { .. } => "SetParentToCreated",
            Command::AddReference { .. } => "AddReference",
            Command::AddReferenceToCreated { .. } => "AddReferenceToCreated",
            Command::RemoveReference { .. } => "RemoveReference",
            Command::AddComponent { .. } => "AddComponent",
            Command::SetComponent { .. } => "SetComponent",
            Command::RemoveComponent { .. } => "RemoveComponent",
            Command::CreateArray { .. } => "CreateArray",
            Command::DestroyArray { .. } => "DestroyArray",
            Command::ResizeArray { .. } => "ResizeArray",
            Command::SetArrayElement { .. } => "SetArrayElement",
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A buffered sequence of structural commands, replayed atomically against a
/// world.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    commands: Vec<Command>,
}

impl Operation {
    /// Create an empty operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded commands in order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Discard all recorded commands (and their payloads).
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Append a pre-built command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    // -- recording ----------------------------------------------------------

    /// Record creating one entity; it becomes the selection.
    pub fn create_entity(&mut self) {
        self.create_entities(1);
    }

    /// Record creating `count` entities; they become the selection.
    pub fn create_entities(&mut self, count: u32) {
        self.push(Command::CreateEntities { count });
    }

    /// Record destroying the selection (children included).
    pub fn destroy_selection(&mut self) {
        self.push(Command::DestroySelection);
    }

    /// Record destroying the selection sub-range `[start, start + len)`.
    pub fn destroy_selection_range(&mut self, start: u32, len: u32) {
        self.push(Command::DestroySelectionRange { start, len });
    }

    /// Record appending an existing entity to the selection.
    pub fn select_entity(&mut self, entity: Entity) {
        self.push(Command::SelectEntity { entity });
    }

    /// Record selecting a previously created entity (`offset` 0 = last).
    pub fn select_created(&mut self, offset: u32) {
        self.push(Command::SelectCreated { offset });
    }

    /// Record emptying the selection.
    pub fn clear_selection(&mut self) {
        self.push(Command::ClearSelection);
    }

    /// Record parenting the selection to `parent`.
    pub fn set_parent(&mut self, parent: Entity) {
        self.push(Command::SetParent { parent });
    }

    /// Record parenting the selection to a previously created entity.
    pub fn set_parent_to_created(&mut self, offset: u32) {
        self.push(Command::SetParentToCreated { offset });
    }

    /// Record referencing `target` from the selection.
    pub fn add_reference(&mut self, target: Entity) {
        self.push(Command::AddReference { target });
    }

    /// Record referencing a previously created entity from the selection.
    pub fn add_reference_to_created(&mut self, offset: u32) {
        self.push(Command::AddReferenceToCreated { offset });
    }

    /// Record removing the reference behind `rint` on the selection.
    pub fn remove_reference(&mut self, rint: Rint) {
        self.push(Command::RemoveReference { rint });
    }

    /// Record attaching a component value to the selection.
    pub fn add_component<T>(&mut self, schema: &Schema, value: T) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let component = schema.component_index_of::<T>()?;
        self.push(Command::AddComponent {
            component,
            bytes: bytemuck::bytes_of(&value).to_vec(),
        });
        Ok(())
    }

    /// Record overwriting a component value on the selection.
    pub fn set_component<T>(&mut self, schema: &Schema, value: T) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let component = schema.component_index_of::<T>()?;
        self.push(Command::SetComponent {
            component,
            bytes: bytemuck::bytes_of(&value).to_vec(),
        });
        Ok(())
    }

    /// Record detaching a component from the selection.
    pub fn remove_component<T>(&mut self, schema: &Schema) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let component = schema.component_index_of::<T>()?;
        self.push(Command::RemoveComponent { component });
        Ok(())
    }

    /// Record creating a zeroed dynamic array of `len` elements.
    pub fn create_array<T>(&mut self, schema: &Schema, len: u32) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let array = schema.array_index_of::<T>()?;
        self.push(Command::CreateArray {
            array,
            len,
            values: None,
        });
        Ok(())
    }

    /// Record creating a dynamic array initialized from `values`.
    pub fn create_array_from<T>(&mut self, schema: &Schema, values: &[T]) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let array = schema.array_index_of::<T>()?;
        self.push(Command::CreateArray {
            array,
            len: values.len() as u32,
            values: Some(bytemuck::cast_slice(values).to_vec()),
        });
        Ok(())
    }

    /// Record destroying a dynamic array.
    pub fn destroy_array<T>(&mut self, schema: &Schema) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let array = schema.array_index_of::<T>()?;
        self.push(Command::DestroyArray { array });
        Ok(())
    }

    /// Record resizing a dynamic array.
    pub fn resize_array<T>(&mut self, schema: &Schema, len: u32) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let array = schema.array_index_of::<T>()?;
        self.push(Command::ResizeArray { array, len });
        Ok(())
    }

    /// Record overwriting one element of a dynamic array.
    pub fn set_array_element<T>(
        &mut self,
        schema: &Schema,
        index: u32,
        value: T,
    ) -> Result<(), EcsError>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let array = schema.array_index_of::<T>()?;
        self.push(Command::SetArrayElement {
            array,
            index,
            bytes: bytemuck::bytes_of(&value).to_vec(),
        });
        Ok(())
    }

    // -- replay -------------------------------------------------------------

    /// Check the command list without touching any world: selection-scoped
    /// commands must reach a non-empty selection, created-history offsets and
    /// selection ranges must be in bounds.
    fn validate(&self) -> Result<(), EcsError> {
        let mut selection_len = 0usize;
        let mut created = 0usize;
        for command in &self.commands {
            if command.needs_selection() && selection_len == 0 {
                return Err(EcsError::EmptySelection {
                    command: command.name(),
                });
            }
            match command {
                Command::CreateEntities { count } => {
                    selection_len = *count as usize;
                    created += *count as usize;
                }
                Command::SelectEntity { .. } => selection_len += 1,
                Command::SelectCreated { offset } => {
                    if *offset as usize >= created {
                        return Err(EcsError::OutOfRange {
                            index: *offset as usize,
                            len: created,
                        });
                    }
                    selection_len += 1;
                }
                Command::ClearSelection | Command::DestroySelection => selection_len = 0,
                Command::DestroySelectionRange { start, len } => {
                    let (start, len) = (*start as usize, *len as usize);
                    if start + len > selection_len {
                        return Err(EcsError::OutOfRange {
                            index: start + len,
                            len: selection_len,
                        });
                    }
                    selection_len -= len;
                }
                Command::SetParentToCreated { offset }
                | Command::AddReferenceToCreated { offset } => {
                    if *offset as usize >= created {
                        return Err(EcsError::OutOfRange {
                            index: *offset as usize,
                            len: created,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replay the recorded commands against `world` in order.
    ///
    /// The whole operation is validated first; a validation failure leaves
    /// the world untouched. Returns the entities created by this replay, in
    /// creation order. The operation is not consumed -- payload bytes are
    /// copied into the world -- so the same operation can be replayed against
    /// several worlds.
    pub fn replay(&self, world: &mut World) -> Result<Vec<Entity>, EcsError> {
        self.validate()?;
        world.guard_structural("operation replay")?;

        let mut selection: Vec<Entity> = Vec::new();
        let mut created: Vec<Entity> = Vec::new();

        // Resolve a created-history offset; bounds were checked by validate.
        let resolve = |created: &[Entity], offset: u32| created[created.len() - 1 - offset as usize];

        for command in &self.commands {
            match command {
                Command::CreateEntities { count } => {
                    selection.clear();
                    for _ in 0..*count {
                        let entity = world.create_entity()?;
                        selection.push(entity);
                        created.push(entity);
                    }
                }
                Command::DestroySelection => {
                    for &entity in &selection {
                        if world.contains_entity(entity) {
                            world.destroy_entity(entity, true)?;
                        }
                    }
                    selection.clear();
                }
                Command::DestroySelectionRange { start, len } => {
                    let (start, len) = (*start as usize, *len as usize);
                    for &entity in &selection[start..start + len] {
                        if world.contains_entity(entity) {
                            world.destroy_entity(entity, true)?;
                        }
                    }
                    selection.drain(start..start + len);
                }
                Command::SelectEntity { entity } => {
                    if !world.contains_entity(*entity) {
                        return Err(EcsError::EntityNotFound { entity: *entity });
                    }
                    selection.push(*entity);
                }
                Command::SelectCreated { offset } => {
                    selection.push(resolve(&created, *offset));
                }
                Command::ClearSelection => selection.clear(),
                Command::SetParent { parent } => {
                    for &entity in &selection {
                        world.set_parent(entity, *parent)?;
                    }
                }
                Command::SetParentToCreated { offset } => {
                    let parent = resolve(&created, *offset);
                    for &entity in &selection {
                        world.set_parent(entity, parent)?;
                    }
                }
                Command::AddReference { target } => {
                    for &entity in &selection {
                        world.add_reference(entity, *target)?;
                    }
                }
                Command::AddReferenceToCreated { offset } => {
                    let target = resolve(&created, *offset);
                    for &entity in &selection {
                        world.add_reference(entity, target)?;
                    }
                }
                Command::RemoveReference { rint } => {
                    for &entity in &selection {
                        world.remove_reference(entity, *rint)?;
                    }
                }
                Command::AddComponent { component, bytes } => {
                    for &entity in &selection {
                        world.add_component_bytes(entity, *component, bytes)?;
                    }
                }
                Command::SetComponent { component, bytes } => {
                    for &entity in &selection {
                        world.set_component_bytes(entity, *component, bytes)?;
                    }
                }
                Command::RemoveComponent { component } => {
                    for &entity in &selection {
                        world.remove_component_by_id(entity, *component)?;
                    }
                }
                Command::CreateArray { array, len, values } => {
                    for &entity in &selection {
                        world.create_array_by_id(entity, *array, *len as usize, values.as_deref())?;
                    }
                }
                Command::DestroyArray { array } => {
                    for &entity in &selection {
                        world.destroy_array_by_id(entity, *array)?;
                    }
                }
                Command::ResizeArray { array, len } => {
                    for &entity in &selection {
                        world.resize_array_by_id(entity, *array, *len as usize)?;
                    }
                }
                Command::SetArrayElement {
                    array,
                    index,
                    bytes,
                } => {
                    for &entity in &selection {
                        world.set_array_element_by_id(entity, *array, *index as usize, bytes)?;
                    }
                }
            }
        }
        Ok(created)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
