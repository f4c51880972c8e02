//! Columnar (SoA) storage for all entities sharing one definition.
//!
//! A [`Chunk`] holds one [`Column`] per component type in its definition's
//! component mask, plus a parallel entity-id vector. Removal is swap-remove so
//! columns stay dense; moving an entity to another chunk copies the byte
//! ranges of the component types both chunks share.
//!
//! # Safety
//!
//! Columns are manually managed byte buffers allocated with each component
//! type's size and natural alignment. Component values are plain old data
//! (`bytemuck::Pod`): any bit pattern is valid, nothing is dropped, and
//! zero-initialization produces a valid value. Typed accessors verify size
//! and alignment against the column before casting, which keeps the public
//! surface of this module safe.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{self, Layout};
use std::ptr;

use crate::definition::Definition;
use crate::entity::Entity;
use crate::schema::{ComponentTypeId, Schema};

// ---------------------------------------------------------------------------
// ChunkKey
// ---------------------------------------------------------------------------

/// Identifies a chunk within the world. Indices into `World::chunks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey(pub(crate) u32);

// ---------------------------------------------------------------------------
// Column -- type-erased element storage
// ---------------------------------------------------------------------------

/// A densely packed, type-erased array of fixed-size elements.
///
/// Backs both chunk component columns and per-entity dynamic arrays; the two
/// uses share the same requirements (aligned storage, zero-fill on growth,
/// raw byte access for migration and snapshots).
pub(crate) struct Column {
    /// Pointer to the heap allocation (null while capacity == 0).
    data: *mut u8,
    /// Number of live elements.
    len: usize,
    /// Number of elements the current allocation can hold.
    capacity: usize,
    /// Size of a single element.
    item_size: usize,
    /// Alignment of a single element.
    item_align: usize,
}

// Columns only store raw POD bytes; element types are Send + Sync by the
// schema registration bounds.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    /// Create a new, empty column for elements of `item_size` bytes aligned
    /// to `item_align`.
    pub fn new(item_size: usize, item_align: usize) -> Self {
        debug_assert!(item_align >= 1);
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            item_size,
            item_align,
        }
    }

    /// Create a column pre-sized to `len` zero-initialized elements.
    pub fn with_len(item_size: usize, item_align: usize, len: usize) -> Self {
        let mut column = Self::new(item_size, item_align);
        column.resize_zeroed(len);
        column
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    // -- internal helpers ---------------------------------------------------

    fn reserve(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity {
            return;
        }
        if self.item_size == 0 {
            // ZST: no allocation, capacity is purely bookkeeping.
            self.capacity = min_capacity;
            return;
        }
        let new_cap = min_capacity.max(self.capacity * 2).max(4);
        let new_layout = Layout::from_size_align(self.item_size * new_cap, self.item_align)
            .expect("column layout overflow");
        unsafe {
            let new_data = if self.capacity == 0 {
                alloc::alloc(new_layout)
            } else {
                let old_layout = Layout::from_size_align(self.item_size * self.capacity, self.item_align)
                    .expect("old layout must be valid");
                alloc::realloc(self.data, old_layout, new_layout.size())
            };
            assert!(!new_data.is_null(), "allocation failed");
            self.data = new_data;
        }
        self.capacity = new_cap;
    }

    #[inline]
    fn ptr_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        if self.item_size == 0 {
            // ZST -- dangling but aligned.
            return self.item_align as *mut u8;
        }
        unsafe { self.data.add(index * self.item_size) }
    }

    // -- element operations -------------------------------------------------

    /// Append one zero-initialized element and return its index.
    pub fn push_zeroed(&mut self) -> usize {
        self.reserve(self.len + 1);
        let index = self.len;
        self.len += 1;
        if self.item_size > 0 {
            unsafe {
                ptr::write_bytes(self.ptr_at(index), 0, self.item_size);
            }
        }
        index
    }

    /// Grow or shrink to `new_len`, zero-filling any new elements.
    pub fn resize_zeroed(&mut self, new_len: usize) {
        if self.item_size == 0 {
            self.len = new_len;
            return;
        }
        self.reserve(new_len);
        if new_len > self.len {
            unsafe {
                ptr::write_bytes(
                    self.data.add(self.len * self.item_size),
                    0,
                    (new_len - self.len) * self.item_size,
                );
            }
        }
        self.len = new_len;
    }

    /// Overwrite the element at `index` with `bytes`.
    pub fn write(&mut self, index: usize, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.item_size);
        debug_assert!(index < self.len);
        if self.item_size > 0 {
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr_at(index), self.item_size);
            }
        }
    }

    /// The raw bytes of the element at `index`.
    pub fn read(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.len);
        if self.item_size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr_at(index), self.item_size) }
    }

    /// The whole column as one contiguous byte slice (`len * item_size`).
    pub fn as_bytes(&self) -> &[u8] {
        if self.item_size == 0 || self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.len * self.item_size) }
    }

    /// The whole column as one contiguous mutable byte slice.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.item_size == 0 || self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len * self.item_size) }
    }

    /// Remove the element at `index` by moving the last element into its
    /// place. Elements are POD, so nothing is dropped.
    pub fn swap_remove(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let last = self.len - 1;
        if self.item_size > 0 && index != last {
            unsafe {
                ptr::copy_nonoverlapping(
                    self.data.add(last * self.item_size),
                    self.data.add(index * self.item_size),
                    self.item_size,
                );
            }
        }
        self.len -= 1;
    }

    // -- typed access -------------------------------------------------------

    /// Typed reference to the element at `index`. Returns `None` if the index
    /// is out of range or `T`'s layout does not match the column.
    pub fn get<T: bytemuck::Pod>(&self, index: usize) -> Option<&T> {
        if index >= self.len
            || std::mem::size_of::<T>() != self.item_size
            || std::mem::align_of::<T>() != self.item_align
        {
            return None;
        }
        // Safety: the allocation matches T's size and alignment, the element
        // is initialized (zeroed at minimum), and any bit pattern is a valid
        // Pod value.
        Some(unsafe { &*(self.ptr_at(index) as *const T) })
    }

    /// Typed mutable reference to the element at `index`.
    pub fn get_mut<T: bytemuck::Pod>(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len
            || std::mem::size_of::<T>() != self.item_size
            || std::mem::align_of::<T>() != self.item_align
        {
            return None;
        }
        // Safety: as in `get`, plus &mut self guarantees exclusivity.
        Some(unsafe { &mut *(self.ptr_at(index) as *mut T) })
    }

    /// View the whole column as a typed slice.
    pub fn as_slice<T: bytemuck::Pod>(&self) -> &[T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.item_size);
        debug_assert_eq!(std::mem::align_of::<T>(), self.item_align);
        if self.item_size == 0 {
            // Safety: dangling pointers are valid for ZST slices.
            return unsafe {
                std::slice::from_raw_parts(ptr::NonNull::<T>::dangling().as_ptr(), self.len)
            };
        }
        if self.len == 0 {
            return &[];
        }
        // Safety: layout verified above; POD elements are always initialized.
        unsafe { std::slice::from_raw_parts(self.data as *const T, self.len) }
    }

    /// View the whole column as a mutable typed slice.
    pub fn as_mut_slice<T: bytemuck::Pod>(&mut self) -> &mut [T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.item_size);
        debug_assert_eq!(std::mem::align_of::<T>(), self.item_align);
        if self.item_size == 0 {
            return unsafe {
                std::slice::from_raw_parts_mut(ptr::NonNull::<T>::dangling().as_ptr(), self.len)
            };
        }
        if self.len == 0 {
            return &mut [];
        }
        // Safety: as in `as_slice`, plus &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.data as *mut T, self.len) }
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        if self.item_size > 0 && self.capacity > 0 {
            let layout = Layout::from_size_align(self.item_size * self.capacity, self.item_align)
                .expect("layout must be valid");
            unsafe {
                alloc::dealloc(self.data, layout);
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("item_size", &self.item_size)
            .field("item_align", &self.item_align)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Storage for all entities sharing one [`Definition`]: one column per
/// component type plus a parallel entity-id vector.
///
/// Columns are kept sorted by [`ComponentTypeId`] for deterministic order and
/// binary-search lookups. A definition with no components produces a valid
/// chunk whose only per-row state is the entity id.
#[derive(Debug)]
pub struct Chunk {
    definition: Definition,
    entities: Vec<Entity>,
    /// Invariant: sorted by type id; exactly the set bits of
    /// `definition.components()`.
    columns: Vec<(ComponentTypeId, Column)>,
}

impl Chunk {
    /// Create an empty chunk for `definition`, sizing one column per
    /// component type from the schema.
    pub(crate) fn new(definition: Definition, schema: &Schema) -> Self {
        let columns = definition
            .components()
            .ones()
            .map(|bit| {
                let id = ComponentTypeId(bit);
                (
                    id,
                    Column::new(schema.component_size(id), schema.component_align(id)),
                )
            })
            .collect();
        Self {
            definition,
            entities: Vec::new(),
            columns,
        }
    }

    /// The definition this chunk stores.
    #[inline]
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Number of entities stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the chunk holds no entities.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// The entity ids in row order.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Binary search for a column by type id.
    #[inline]
    fn column_index(&self, id: ComponentTypeId) -> Option<usize> {
        self.columns.binary_search_by_key(&id, |(id, _)| *id).ok()
    }

    /// Whether this chunk has a column for `id`.
    #[inline]
    pub fn has_component(&self, id: ComponentTypeId) -> bool {
        self.column_index(id).is_some()
    }

    /// Append `entity` with zero-initialized components. Returns the new row.
    pub(crate) fn append(&mut self, entity: Entity) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for (_, column) in &mut self.columns {
            column.push_zeroed();
        }
        row
    }

    /// Swap-remove the entity at `row`. Returns the entity that was moved
    /// into `row` if a swap occurred (the caller patches its slot), or `None`
    /// if the removed row was the last.
    pub(crate) fn remove(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for (_, column) in &mut self.columns {
            column.swap_remove(row);
        }
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Overwrite one component value. The type must be part of this chunk's
    /// definition; passing one that isn't is a caller contract violation.
    pub(crate) fn write_component(&mut self, row: usize, id: ComponentTypeId, bytes: &[u8]) {
        let index = self
            .column_index(id)
            .expect("component type not in chunk definition");
        self.columns[index].1.write(row, bytes);
    }

    /// The raw bytes of one component value.
    pub(crate) fn component_bytes(&self, row: usize, id: ComponentTypeId) -> &[u8] {
        let index = self
            .column_index(id)
            .expect("component type not in chunk definition");
        self.columns[index].1.read(row)
    }

    /// The whole column for `id` as a contiguous byte slice of length
    /// `len() * size`, for direct scans by dynamic consumers.
    pub fn column_bytes(&self, id: ComponentTypeId) -> Option<&[u8]> {
        let index = self.column_index(id)?;
        Some(self.columns[index].1.as_bytes())
    }

    /// Mutable variant of [`column_bytes`](Self::column_bytes).
    pub fn column_bytes_mut(&mut self, id: ComponentTypeId) -> Option<&mut [u8]> {
        let index = self.column_index(id)?;
        Some(self.columns[index].1.as_bytes_mut())
    }

    /// Typed reference to one component value.
    pub fn get<T>(&self, row: usize, id: ComponentTypeId) -> Option<&T>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let index = self.column_index(id)?;
        self.columns[index].1.get::<T>(row)
    }

    /// Typed mutable reference to one component value.
    pub fn get_mut<T>(&mut self, row: usize, id: ComponentTypeId) -> Option<&mut T>
    where
        T: bytemuck::Pod + Send + Sync + 'static,
    {
        let index = self.column_index(id)?;
        self.columns[index].1.get_mut::<T>(row)
    }
}

/// Move the entity at `row` from `src` to `dst`.
///
/// Component types present in both chunks have their bytes copied; types only
/// in `dst` stay zero-initialized; types only in `src` are dropped with the
/// source row. Returns the destination row and the entity swapped into the
/// vacated source row, if any. This is the single migration mechanism behind
/// add/remove component and array create/destroy.
pub(crate) fn move_row(src: &mut Chunk, row: usize, dst: &mut Chunk) -> (usize, Option<Entity>) {
    let entity = src.entities[row];
    let dst_row = dst.append(entity);
    for (id, src_column) in src.columns.iter() {
        if let Some(dst_index) = dst.column_index(*id) {
            dst.columns[dst_index].1.write(dst_row, src_column.read(row));
        }
    }
    let swapped = src.remove(row);
    (dst_row, swapped)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
