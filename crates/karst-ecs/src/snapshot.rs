//! World snapshot streams.
//!
//! This module implements the byte-level persistence interface: a canonical
//! little-endian encoding of the schema ([`Schema::encode`]/[`Schema::decode`])
//! and of a whole world ([`World::capture_snapshot`]/
//! [`World::restore_from_snapshot`]).
//!
//! Layout of the world stream:
//!
//! 1. Schema stream: u8 counts per kind, then per kind x ascending index a
//!    present byte, u16 size, and the layout blob.
//! 2. u32 live-entity count.
//! 3. Per live entity in ascending id order: u32 id, u32 parent, u8 enabled,
//!    the component / array / tag masks (32 bytes each), the reference list
//!    (u32 count + u32 ids, cleared holes included so `Rint` handles survive
//!    a round trip), one value blob per present component, and per present
//!    array a u32 length plus the element bytes.
//!
//! Restore pre-validates the entire stream -- schema compatibility, id order,
//! mask bits, parent liveness, exact lengths -- before clearing any world
//! state, so a malformed stream never leaves a half-restored world. The
//! round-trip law holds: capture, restore, capture yields identical bytes
//! when type registration order is preserved.

use std::collections::HashSet;

use tracing::debug;

use crate::chunk::Column;
use crate::definition::Definition;
use crate::entity::{Entity, Slot};
use crate::mask::BitMask;
use crate::schema::{ArrayTypeId, ComponentTypeId, FieldLayout, Schema, TypeKind, TypeLayout};
use crate::world::World;
use crate::EcsError;

const KINDS: [TypeKind; 3] = [TypeKind::Component, TypeKind::ArrayElement, TypeKind::Tag];

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Bounds-checked cursor over an input stream.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn error(&self, detail: impl Into<String>) -> EcsError {
        EcsError::InvalidStream {
            offset: self.offset,
            detail: detail.into(),
        }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], EcsError> {
        if self.offset + count > self.bytes.len() {
            return Err(self.error(format!(
                "unexpected end of stream (wanted {count} bytes, {} left)",
                self.bytes.len() - self.offset
            )));
        }
        let slice = &self.bytes[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EcsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EcsError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32, EcsError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn mask(&mut self) -> Result<BitMask, EcsError> {
        let bytes = self.take(32)?;
        Ok(BitMask::from_bytes(bytes.try_into().expect("32 bytes")))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

// ---------------------------------------------------------------------------
// Schema stream
// ---------------------------------------------------------------------------

fn encode_layout(out: &mut Vec<u8>, layout: Option<&TypeLayout>) {
    match layout {
        None => out.push(0),
        Some(layout) => {
            assert!(layout.fields.len() <= u8::MAX as usize, "too many layout fields");
            out.push(layout.fields.len() as u8);
            for field in &layout.fields {
                assert!(field.name.len() <= u8::MAX as usize, "layout field name too long");
                out.push(field.name.len() as u8);
                out.extend_from_slice(field.name.as_bytes());
                push_u16(out, field.size);
            }
        }
    }
}

fn decode_layout(reader: &mut Reader<'_>) -> Result<Option<TypeLayout>, EcsError> {
    let field_count = reader.u8()?;
    if field_count == 0 {
        return Ok(None);
    }
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let name_len = reader.u8()? as usize;
        let name = std::str::from_utf8(reader.take(name_len)?)
            .map_err(|_| reader.error("layout field name is not UTF-8"))?
            .to_owned();
        let size = reader.u16()?;
        fields.push(FieldLayout { name, size });
    }
    Ok(Some(TypeLayout { fields }))
}

fn decode_schema(reader: &mut Reader<'_>) -> Result<Schema, EcsError> {
    let component_count = reader.u8()? as usize;
    let array_count = reader.u8()? as usize;
    let tag_count = reader.u8()? as usize;
    let mut schema = Schema::new();
    for (kind, count) in [
        (TypeKind::Component, component_count),
        (TypeKind::ArrayElement, array_count),
        (TypeKind::Tag, tag_count),
    ] {
        for _ in 0..count {
            if reader.u8()? == 0 {
                // Absent index: keep the dense numbering with a placeholder.
                schema.register_raw(kind, 0, None);
                continue;
            }
            let size = reader.u16()?;
            let layout = decode_layout(reader)?;
            schema.register_raw(kind, size, layout);
        }
    }
    Ok(schema)
}

impl Schema {
    /// Append the canonical schema stream to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        for count in [self.component_count(), self.array_count(), self.tag_count()] {
            assert!(
                count <= u8::MAX as usize,
                "schema stream supports at most 255 types per kind"
            );
        }
        out.push(self.component_count() as u8);
        out.push(self.array_count() as u8);
        out.push(self.tag_count() as u8);
        for kind in KINDS {
            let sizes = self.kind_sizes(kind);
            let layouts = self.kind_layouts(kind);
            for index in 0..sizes.len() {
                out.push(1);
                push_u16(out, sizes[index]);
                encode_layout(out, layouts[index].as_ref());
            }
        }
    }

    /// Decode a schema stream. Returns the schema and the number of bytes
    /// consumed.
    ///
    /// The decoded schema carries sizes and layouts but no Rust type
    /// bindings; it is meant for structural inspection and compatibility
    /// checks, not for registering further types.
    pub fn decode(bytes: &[u8]) -> Result<(Schema, usize), EcsError> {
        let mut reader = Reader::new(bytes);
        let schema = decode_schema(&mut reader)?;
        Ok((schema, reader.offset))
    }
}

// ---------------------------------------------------------------------------
// World stream
// ---------------------------------------------------------------------------

/// One parsed entity record, borrowing value blobs from the input stream.
struct EntityRecord<'a> {
    entity: Entity,
    parent: Entity,
    enabled: bool,
    components: BitMask,
    arrays: BitMask,
    tags: BitMask,
    references: Vec<Entity>,
    component_values: Vec<(ComponentTypeId, &'a [u8])>,
    array_values: Vec<(ArrayTypeId, u32, &'a [u8])>,
}

impl World {
    /// Serialize the whole world into the canonical snapshot stream.
    pub fn capture_snapshot(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.schema.encode(&mut out);

        let live: Vec<Entity> = self.entities().collect();
        push_u32(&mut out, live.len() as u32);
        for entity in live {
            let slot = &self.slots[entity.slot_index()];
            let chunk = &self.chunks[slot.chunk.0 as usize];
            let definition = *chunk.definition();
            let row = slot.row as usize;

            push_u32(&mut out, entity.id());
            push_u32(&mut out, slot.parent.id());
            out.push(slot.enabled as u8);
            out.extend_from_slice(&definition.components().to_bytes());
            out.extend_from_slice(&definition.arrays().to_bytes());
            out.extend_from_slice(&slot.tags.to_bytes());

            let references = self
                .references
                .get(&entity)
                .map_or(&[][..], |references| references.as_slice());
            push_u32(&mut out, references.len() as u32);
            for reference in references {
                push_u32(&mut out, reference.id());
            }

            for bit in definition.components().ones() {
                out.extend_from_slice(chunk.component_bytes(row, ComponentTypeId(bit)));
            }
            for bit in definition.arrays().ones() {
                let id = ArrayTypeId(bit);
                let column = self
                    .arrays
                    .get(&entity)
                    .and_then(|buffers| buffers.get(&id))
                    .expect("array buffer present for definition bit");
                push_u32(&mut out, column.len() as u32);
                out.extend_from_slice(column.as_bytes());
            }
        }
        out
    }

    /// Rebuild this world from a snapshot stream.
    ///
    /// The stream's schema must match the world's registered schema (same
    /// counts and sizes per kind); registration itself is not restored.
    /// The whole stream is validated before any existing state is cleared.
    pub fn restore_from_snapshot(&mut self, bytes: &[u8]) -> Result<(), EcsError> {
        self.guard_structural("restore_from_snapshot")?;
        let mut reader = Reader::new(bytes);

        // 1. Schema compatibility.
        let stream_schema = decode_schema(&mut reader)?;
        for kind in KINDS {
            let ours = self.schema.kind_sizes(kind);
            let theirs = stream_schema.kind_sizes(kind);
            if ours.len() != theirs.len() {
                return Err(reader.error(format!(
                    "schema mismatch: stream has {} {kind} types, world has {}",
                    theirs.len(),
                    ours.len()
                )));
            }
            if ours != theirs {
                return Err(reader.error(format!("schema mismatch: {kind} sizes differ")));
            }
        }

        // 2. Parse and validate every entity record before mutating anything.
        let entity_count = reader.u32()? as usize;
        let mut records: Vec<EntityRecord<'_>> = Vec::with_capacity(entity_count);
        let mut previous_id = 0u32;
        for _ in 0..entity_count {
            let id = reader.u32()?;
            if id <= previous_id {
                return Err(reader.error("entity ids must be nonzero and strictly ascending"));
            }
            previous_id = id;
            let parent = Entity::from_id(reader.u32()?);
            let enabled = reader.u8()? != 0;
            let components = reader.mask()?;
            let arrays = reader.mask()?;
            let tags = reader.mask()?;
            if components
                .ones()
                .any(|bit| bit as usize >= self.schema.component_count())
            {
                return Err(reader.error("component mask names an unregistered type"));
            }
            if arrays
                .ones()
                .any(|bit| bit as usize >= self.schema.array_count())
            {
                return Err(reader.error("array mask names an unregistered type"));
            }
            if tags.ones().any(|bit| bit as usize >= self.schema.tag_count()) {
                return Err(reader.error("tag mask names an unregistered type"));
            }

            let reference_count = reader.u32()? as usize;
            let mut references = Vec::with_capacity(reference_count);
            for _ in 0..reference_count {
                references.push(Entity::from_id(reader.u32()?));
            }

            let mut component_values = Vec::new();
            for bit in components.ones() {
                let component = ComponentTypeId(bit);
                let size = self.schema.component_size(component);
                component_values.push((component, reader.take(size)?));
            }
            let mut array_values = Vec::new();
            for bit in arrays.ones() {
                let array = ArrayTypeId(bit);
                let len = reader.u32()?;
                let bytes = reader.take(len as usize * self.schema.array_size(array))?;
                array_values.push((array, len, bytes));
            }

            records.push(EntityRecord {
                entity: Entity::from_id(id),
                parent,
                enabled,
                components,
                arrays,
                tags,
                references,
                component_values,
                array_values,
            });
        }
        if reader.remaining() != 0 {
            return Err(reader.error("trailing bytes after last entity record"));
        }
        let live: HashSet<Entity> = records.iter().map(|record| record.entity).collect();
        for record in &records {
            if !record.parent.is_null() && !live.contains(&record.parent) {
                return Err(EcsError::InvalidStream {
                    offset: bytes.len(),
                    detail: format!("entity {} has dead parent {}", record.entity, record.parent),
                });
            }
        }

        // 3. Clear and rebuild.
        self.slots.clear();
        self.free_slots.clear();
        self.chunks.clear();
        self.chunk_index.clear();
        self.children.clear();
        self.references.clear();
        self.arrays.clear();
        self.alive_count = 0;
        self.get_or_create_chunk(Definition::new());

        for record in &records {
            let slot_index = record.entity.slot_index();
            while self.slots.len() <= slot_index {
                // Gap slots were freed before the snapshot was taken; they
                // rejoin the free list below with a nonzero version.
                let mut dead = Slot::fresh();
                dead.alive = false;
                dead.enabled = false;
                self.slots.push(dead);
            }

            let definition = Definition::from_masks(record.components, record.arrays);
            let chunk_key = self.get_or_create_chunk(definition);
            let row = self.chunks[chunk_key.0 as usize].append(record.entity);
            for (component, value) in &record.component_values {
                self.chunks[chunk_key.0 as usize].write_component(row, *component, value);
            }

            let slot = &mut self.slots[slot_index];
            slot.alive = true;
            slot.enabled = record.enabled;
            slot.chunk = chunk_key;
            slot.row = row as u32;
            slot.parent = record.parent;
            slot.tags = record.tags;
            self.alive_count += 1;

            if !record.references.is_empty() {
                self.references
                    .insert(record.entity, record.references.clone());
            }
            for (array, len, value_bytes) in &record.array_values {
                let mut column = Column::with_len(
                    self.schema.array_size(*array),
                    self.schema.array_align(*array),
                    *len as usize,
                );
                column.as_bytes_mut().copy_from_slice(value_bytes);
                self.arrays
                    .entry(record.entity)
                    .or_default()
                    .insert(*array, column);
            }
            if !record.parent.is_null() {
                self.children
                    .entry(record.parent)
                    .or_default()
                    .push(record.entity);
            }
        }

        // Free list: dead slots, descending, so the lowest index is reused
        // first.
        let mut free: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.alive)
            .map(|(index, _)| index as u32)
            .collect();
        free.sort_unstable_by(|a, b| b.cmp(a));
        self.free_slots = free;

        debug!(entities = records.len(), chunks = self.chunks.len(), "restored world from snapshot");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
