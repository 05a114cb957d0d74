//! Storage pages: fixed-capacity struct-of-arrays blocks of rows for one archetype.
//!
//! A page buffer holds, at offsets computed once per table:
//! one column per component type in signature order,
//! one nullable entity slot per row,
//! and one [`comp::Functions`] pair per (column, row).
//!
//! A row is live iff its entity slot is non-null.
//! Every column cell of a live row is initialized and its function pair is recorded.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::alloc::PageAllocator;
use crate::util::align_up;
use crate::{comp, Entity, Signature};

/// Identifies a page within its table.
///
/// Identifiers of freed pages may be reused by later pages of the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub(crate) usize);

impl PageId {
    /// The raw index of the page in its table.
    pub fn index(self) -> usize { self.0 }
}

/// Parameters that determine the byte size of the pages of a table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sizing {
    /// The target page footprint, including allocator overhead.
    pub(crate) page_size: usize,
    /// The minimum number of rows in each page.
    pub(crate) min_rows:  usize,
}

/// The geometry shared by all pages of one table.
#[derive(Debug)]
pub(crate) struct PageLayout {
    /// Size and column stride of each component type, in signature order.
    strides:    Box<[usize]>,
    /// Offset of each column from the aligned base.
    columns:    Box<[usize]>,
    /// Offset of the entity slots from the aligned base.
    entities:   usize,
    /// Offset of the function pairs from the aligned base.
    functions:  usize,
    /// Alignment of the base pointer.
    base_align: usize,
    /// Number of rows per page.
    capacity:   usize,
    /// Number of bytes requested from the allocator per page.
    size:       usize,
}

const ENTITY_SIZE: usize = mem::size_of::<Option<Entity>>();
const FUNCTIONS_SIZE: usize = mem::size_of::<comp::Functions>();
const ALLOCATOR_ALIGN: usize = mem::align_of::<usize>();

impl PageLayout {
    /// Computes the page geometry for `signature`.
    ///
    /// The page size is the larger of the target footprint and the minimum row count,
    /// rounded by the allocator; the capacity fills the rounded size.
    pub(crate) fn new(signature: &Signature, allocator: &dyn PageAllocator, sizing: Sizing) -> Self {
        let types = signature.as_slice();

        let base_align = types
            .iter()
            .map(|desc| desc.align())
            .chain([mem::align_of::<Option<Entity>>(), mem::align_of::<comp::Functions>()])
            .max()
            .unwrap_or(ALLOCATOR_ALIGN);

        let row_size = types.iter().map(|desc| desc.size()).sum::<usize>()
            + ENTITY_SIZE
            + FUNCTIONS_SIZE * types.len();

        // upper bound of all padding between regions plus the base alignment shift
        let fixed = types.iter().map(|desc| desc.align() - 1).sum::<usize>()
            + (mem::align_of::<Option<Entity>>() - 1)
            + (mem::align_of::<comp::Functions>() - 1)
            + base_align.saturating_sub(ALLOCATOR_ALIGN);

        let min_rows = sizing.min_rows.max(1);
        let size = (fixed + row_size * min_rows).max(sizing.page_size.saturating_sub(allocator.reserved_size()));
        let size = allocator.pre_calculate_size(size);
        let capacity = (size - fixed) / row_size;

        let mut offset = 0;
        let mut strides = Vec::with_capacity(types.len());
        let mut columns = Vec::with_capacity(types.len());
        for desc in types {
            offset = align_up(offset, desc.align());
            columns.push(offset);
            strides.push(desc.size());
            offset += desc.size() * capacity;
        }

        let entities = align_up(offset, mem::align_of::<Option<Entity>>());
        offset = entities + ENTITY_SIZE * capacity;

        let functions = align_up(offset, mem::align_of::<comp::Functions>());
        offset = functions + FUNCTIONS_SIZE * capacity * types.len();

        assert!(
            offset + base_align.saturating_sub(ALLOCATOR_ALIGN) <= size,
            "page layout of {signature:?} needs {offset} bytes but pages only have {size} bytes"
        );

        Self {
            strides: strides.into_boxed_slice(),
            columns: columns.into_boxed_slice(),
            entities,
            functions,
            base_align,
            capacity,
            size,
        }
    }

    pub(crate) fn capacity(&self) -> usize { self.capacity }

    pub(crate) fn size(&self) -> usize { self.size }

    pub(crate) fn column_count(&self) -> usize { self.columns.len() }
}

/// One page of rows. The page does not free itself on drop;
/// its owning table must call [`Page::free`].
pub(crate) struct Page {
    layout:          Arc<PageLayout>,
    /// The pointer returned by the allocator.
    raw:             NonNull<u8>,
    /// `raw` aligned up to the base alignment of the layout.
    base:            NonNull<u8>,
    /// The live-row boundary. Rows at or beyond `len` are never live.
    pub(crate) len:  usize,
    pub(crate) prev: Option<PageId>,
    pub(crate) next: Option<PageId>,
}

// Safety: the page exclusively owns its buffer,
// and the components and entities stored in it are `Send + Sync`.
unsafe impl Send for Page {}
// Safety: see above.
unsafe impl Sync for Page {}

impl Page {
    /// Allocates an empty page with all entity slots null.
    ///
    /// # Panics
    /// Panics if the allocator cannot provide the precomputed page size.
    pub(crate) fn create(layout: Arc<PageLayout>, allocator: &dyn PageAllocator) -> Self {
        let (raw, actual) = match allocator.allocate(layout.size) {
            Some(pair) => pair,
            None => panic!("page allocator cannot provide {} bytes", layout.size),
        };
        assert!(actual >= layout.size, "page allocator returned {actual} bytes for a {} byte request", layout.size);

        let shift = align_up(raw.as_ptr() as usize, layout.base_align) - raw.as_ptr() as usize;
        // Safety: the layout reserved `base_align - ALLOCATOR_ALIGN >= shift` bytes for alignment.
        let base = unsafe { NonNull::new_unchecked(raw.as_ptr().add(shift)) };

        let page = Self { layout, raw, base, len: 0, prev: None, next: None };
        for row in 0..page.layout.capacity {
            // Safety: the entity slot is within the buffer and aligned.
            unsafe { page.entity_slot(row).as_ptr().write(None) };
        }
        page
    }

    /// Returns the cell of `column` at `row`.
    pub(crate) fn cell(&self, column: usize, row: usize) -> NonNull<u8> {
        assert!(column < self.layout.columns.len(), "column {column} out of bounds");
        assert!(row < self.layout.capacity, "row {row} out of bounds");

        let offset = self.layout.columns[column] + self.layout.strides[column] * row;
        // Safety: the offset is within the buffer for in-bounds column and row.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    fn entity_slot(&self, row: usize) -> NonNull<Option<Entity>> {
        assert!(row < self.layout.capacity, "row {row} out of bounds");

        let offset = self.layout.entities + ENTITY_SIZE * row;
        // Safety: the offset is within the buffer for an in-bounds row.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset).cast()) }
    }

    fn functions_slot(&self, column: usize, row: usize) -> NonNull<comp::Functions> {
        assert!(column < self.layout.columns.len(), "column {column} out of bounds");
        assert!(row < self.layout.capacity, "row {row} out of bounds");

        let offset = self.layout.functions + FUNCTIONS_SIZE * (column * self.layout.capacity + row);
        // Safety: the offset is within the buffer for in-bounds column and row.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset).cast()) }
    }

    /// Returns the entity occupying `row`, if the row is live.
    pub(crate) fn entity(&self, row: usize) -> Option<&Entity> {
        // Safety: entity slots are always initialized.
        unsafe { (*self.entity_slot(row).as_ptr()).as_ref() }
    }

    /// Returns the entity slots of rows `0..len`.
    pub(crate) fn entities(&self) -> &[Option<Entity>] {
        // Safety: entity slots are contiguous and always initialized.
        unsafe { std::slice::from_raw_parts(self.entity_slot(0).as_ptr(), self.len) }
    }

    pub(crate) fn is_vacant(&self, row: usize) -> bool { self.entity(row).is_none() }

    /// Clears the entity slot of `row` and returns the reference it held.
    pub(crate) fn take_entity(&mut self, row: usize) -> Option<Entity> {
        // Safety: entity slots are always initialized.
        unsafe { ptr::replace(self.entity_slot(row).as_ptr(), None) }
    }

    /// Stores `entity` into the vacant `row`.
    pub(crate) fn put_entity(&mut self, row: usize, entity: Entity) {
        // Safety: entity slots are always initialized.
        let old = unsafe { ptr::replace(self.entity_slot(row).as_ptr(), Some(entity)) };
        assert!(old.is_none(), "row {row} is already occupied by {old:?}");
    }

    /// Returns the function pair recorded for `column` at `row`.
    ///
    /// # Safety
    /// The function pair must have been recorded with [`set_functions`](Self::set_functions).
    pub(crate) unsafe fn functions(&self, column: usize, row: usize) -> comp::Functions {
        self.functions_slot(column, row).as_ptr().read()
    }

    pub(crate) fn set_functions(&mut self, column: usize, row: usize, functions: comp::Functions) {
        // Safety: the slot is within the buffer and aligned; `Functions` is `Copy`.
        unsafe { self.functions_slot(column, row).as_ptr().write(functions) }
    }

    /// Drops every component of the live `row`, then clears the entity slot.
    ///
    /// The entity back-reference is cleared and the stored reference is released.
    pub(crate) fn release_row(&mut self, row: usize) {
        let entity = self.take_entity(row).expect("cannot release a vacant row");
        for column in 0..self.layout.columns.len() {
            // Safety: the row was live, so every cell is initialized with its functions recorded.
            unsafe { self.functions(column, row).drop_in_place(self.cell(column, row)) };
        }
        entity.set_location(None);
    }

    /// Returns the index of the first vacant row in `from..to`, or `to` if there is none.
    pub(crate) fn first_vacant(&self, from: usize, to: usize) -> usize {
        (from..to).find(|&row| self.is_vacant(row)).unwrap_or(to)
    }

    /// Returns one past the index of the last live row in `to..from`, or `to` if there is none.
    pub(crate) fn live_end(&self, from: usize, to: usize) -> usize {
        (to..from).rev().find(|&row| !self.is_vacant(row)).map_or(to, |row| row + 1)
    }

    /// Drops every live row below the boundary and returns the buffer to the allocator.
    pub(crate) fn free(mut self, allocator: &dyn PageAllocator) {
        for row in 0..self.len {
            if !self.is_vacant(row) {
                self.release_row(row);
            }
        }

        // Safety: `raw` was returned by `allocate` on the same allocator and is not used again.
        unsafe { allocator.release(self.raw) };
    }
}
