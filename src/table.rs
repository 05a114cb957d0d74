//! Archetype tables: the pages of all entities that own exactly one set of component types.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::{fmt, mem, slice};

use crate::alloc::PageAllocator;
use crate::entity::Location;
use crate::page::{Page, PageId, PageLayout, Sizing};
use crate::{comp, Entity, Signature};

/// Identifies an archetype table within its pool.
///
/// Table identifiers are assigned in creation order and never reused until the pool is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub(crate) usize);

impl TableId {
    /// The raw index of the table in its pool.
    pub fn index(self) -> usize { self.0 }
}

/// The outcome of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Compaction {
    /// The number of rows relocated to fill holes.
    pub moved_rows:  usize,
    /// The number of pages freed because they became empty.
    pub freed_pages: usize,
}

/// Stores the entities of one archetype in a linked list of pages.
///
/// Outside a commit, every page in the list is packed:
/// rows below its boundary are all live, and only the tail page may be partially filled.
pub struct Table {
    id:        TableId,
    signature: Signature,
    layout:    Arc<PageLayout>,
    allocator: Arc<dyn PageAllocator>,

    /// Page slab indexed by [`PageId`].
    pages:  Vec<Option<Page>>,
    vacant: Vec<PageId>,
    head:   Option<PageId>,
    tail:   Option<PageId>,

    /// Number of live rows across all pages.
    live:  usize,
    /// Hole counts of pages that contain vacant rows below their boundary.
    holes: BTreeMap<PageId, usize>,
}

impl Table {
    pub(crate) fn new(
        id: TableId,
        signature: Signature,
        allocator: Arc<dyn PageAllocator>,
        sizing: Sizing,
    ) -> Self {
        let layout = Arc::new(PageLayout::new(&signature, &*allocator, sizing));
        log::trace!(
            "Table {id:?} for {signature:?} uses {} byte pages with {} rows",
            layout.size(),
            layout.capacity()
        );

        Self {
            id,
            signature,
            layout,
            allocator,
            pages: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            live: 0,
            holes: BTreeMap::new(),
        }
    }

    /// The identifier of this table.
    pub fn id(&self) -> TableId { self.id }

    /// The component types stored in this table, in column order.
    pub fn signature(&self) -> &Signature { &self.signature }

    /// The number of rows in each page.
    pub fn capacity(&self) -> usize { self.layout.capacity() }

    /// The number of live rows.
    pub fn len(&self) -> usize { self.live }

    /// Whether the table has no live rows.
    pub fn is_empty(&self) -> bool { self.live == 0 }

    /// The first page in the list. `None` if the table has no pages.
    pub fn head(&self) -> Option<PageId> { self.head }

    /// The number of allocated pages, including pages detached during a commit.
    pub fn page_count(&self) -> usize { self.pages.len() - self.vacant.len() }

    /// Returns a view of the page `id`.
    pub fn page(&self, id: PageId) -> Option<PageView<'_>> {
        let page = self.pages.get(id.0)?.as_ref()?;
        Some(PageView { table: self, id, page })
    }

    /// Iterates over the pages in list order.
    pub fn pages(&self) -> impl Iterator<Item = PageView<'_>> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            let view = self.page(id).expect("page list refers to a freed page");
            cursor = view.next();
            Some(view)
        })
    }

    /// Returns the packed cells of `column` in the page `id`.
    ///
    /// # Panics
    /// Panics if the page does not exist, the column is out of bounds,
    /// or `T` is not the component type of the column.
    pub fn column_mut<T: comp::Component>(&mut self, id: PageId, column: usize) -> &mut [T] {
        self.assert_column_type::<T>(column);
        debug_assert!(self.holes.is_empty(), "columns are not packed during a commit");

        let page = self.page_ref(id);
        let len = page.len;
        // Safety: rows below the boundary are live because the table is packed outside commits,
        // and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(page.cell(column, 0).cast::<T>().as_ptr(), len) }
    }

    fn assert_column_type<T: comp::Component>(&self, column: usize) {
        let desc = self.signature.as_slice().get(column).unwrap_or_else(|| {
            panic!("column {column} out of bounds for {:?}", self.signature);
        });
        assert!(desc.is::<T>(), "TypeId mismatch: column {column} is {desc:?}, not {}", std::any::type_name::<T>());
    }

    pub(crate) fn page_ref(&self, id: PageId) -> &Page {
        match self.pages.get(id.0) {
            Some(Some(page)) => page,
            _ => panic!("{id:?} is not a page of table {:?}", self.id),
        }
    }

    pub(crate) fn page_mut(&mut self, id: PageId) -> &mut Page {
        match self.pages.get_mut(id.0) {
            Some(Some(page)) => page,
            _ => panic!("{id:?} is not a page of table {:?}", self.id),
        }
    }

    fn location(&self, page: PageId, row: usize) -> Location { Location { table: self.id, page, row } }

    fn create_page(&mut self) -> PageId {
        let page = Page::create(Arc::clone(&self.layout), &*self.allocator);
        match self.vacant.pop() {
            Some(id) => {
                self.pages[id.0] = Some(page);
                id
            }
            None => {
                self.pages.push(Some(page));
                PageId(self.pages.len() - 1)
            }
        }
    }

    fn free_page(&mut self, id: PageId) {
        let page = self.pages[id.0].take().expect("freeing a page twice");
        page.free(&*self.allocator);
        self.vacant.push(id);
    }

    fn link_back(&mut self, id: PageId) {
        let tail = self.tail;
        {
            let page = self.page_mut(id);
            page.prev = tail;
            page.next = None;
        }
        match tail {
            Some(tail) => self.page_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn unlink(&mut self, id: PageId) {
        let (prev, next) = {
            let page = self.page_mut(id);
            (page.prev.take(), page.next.take())
        };
        match prev {
            Some(prev) => self.page_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.page_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Reserves a vacant row for a new entity.
    ///
    /// Prefers the hole-bearing page with the fewest holes,
    /// and otherwise appends to the tail page, creating a new tail if it is full.
    /// The caller must move all columns into the row and then [`install`](Self::install) an entity
    /// before reserving another row.
    pub(crate) fn allocate_slot(&mut self) -> (PageId, usize) {
        self.live += 1;

        let fewest = self.holes.iter().min_by_key(|&(_, &holes)| holes).map(|(&id, &holes)| (id, holes));
        if let Some((id, holes)) = fewest {
            if holes > 1 {
                self.holes.insert(id, holes - 1);
            } else {
                self.holes.remove(&id);
            }

            let page = self.page_ref(id);
            let row = page.first_vacant(0, page.len);
            assert!(row < page.len, "{id:?} of table {:?} has recorded holes but no vacant row", self.id);
            return (id, row);
        }

        let tail = match self.tail {
            Some(tail) if self.page_ref(tail).len < self.capacity() => tail,
            _ => {
                let id = self.create_page();
                self.link_back(id);
                id
            }
        };
        let page = self.page_mut(tail);
        let row = page.len;
        page.len += 1;
        (tail, row)
    }

    /// Returns the cell of `column` at the given row.
    pub(crate) fn cell(&self, page: PageId, column: usize, row: usize) -> std::ptr::NonNull<u8> {
        self.page_ref(page).cell(column, row)
    }

    /// Returns the function pair recorded for `column` at the given row.
    ///
    /// # Safety
    /// The row must be live, or its cell of `column` must have been initialized.
    pub(crate) unsafe fn functions(&self, page: PageId, column: usize, row: usize) -> comp::Functions {
        self.page_ref(page).functions(column, row)
    }

    pub(crate) fn set_functions(&mut self, page: PageId, column: usize, row: usize, functions: comp::Functions) {
        self.page_mut(page).set_functions(column, row, functions);
    }

    /// Stores `entity` into a row whose columns have all been initialized,
    /// and points its back-reference at the row.
    pub(crate) fn install(&mut self, page: PageId, row: usize, entity: Entity) {
        entity.set_location(Some(self.location(page, row)));
        self.page_mut(page).put_entity(row, entity);
    }

    /// Drops the components of a live row and releases its entity reference.
    pub(crate) fn release_slot(&mut self, page: PageId, row: usize) {
        self.page_mut(page).release_row(row);
        self.retire_slot(page);
    }

    /// Clears a live row whose components have already been moved out,
    /// returning the entity reference it held.
    ///
    /// The entity back-reference is left untouched.
    ///
    /// # Safety
    /// Every cell of the row must be logically uninitialized.
    pub(crate) unsafe fn vacate_slot(&mut self, page: PageId, row: usize) -> Entity {
        let entity = self.page_mut(page).take_entity(row).expect("cannot vacate a vacant row");
        self.retire_slot(page);
        entity
    }

    fn retire_slot(&mut self, id: PageId) {
        self.live -= 1;

        let holes = self.holes.entry(id).or_insert(0);
        *holes += 1;
        let holes = *holes;

        if holes == self.page_ref(id).len {
            self.holes.remove(&id);
            self.unlink(id);
            self.page_mut(id).len = 0;
            self.free_page(id);
        }
    }

    /// Moves the live row `from` into the vacant row `to`.
    ///
    /// The rows may be in the same page or in different pages of this table.
    fn migrate_row(&mut self, to: (PageId, usize), from: (PageId, usize)) {
        assert!(self.page_ref(to.0).is_vacant(to.1), "migration target {to:?} is live");

        for column in 0..self.layout.column_count() {
            // Safety: `from` is live, so every cell is initialized with its functions recorded.
            let functions = unsafe { self.functions(from.0, column, from.1) };
            self.set_functions(to.0, column, to.1, functions);

            let dst = self.cell(to.0, column, to.1);
            let src = self.cell(from.0, column, from.1);
            // Safety: `src` is initialized and `dst` is a vacant cell of the same type.
            unsafe { functions.relocate(dst, src) };
        }

        let entity = self.page_mut(from.0).take_entity(from.1).expect("migration source is vacant");
        self.install(to.0, to.1, entity);
    }

    /// Eliminates every hole, relocating as few rows as possible and freeing emptied pages.
    ///
    /// Returns `None` if there were no holes.
    pub(crate) fn compact(&mut self) -> Option<Compaction> {
        if self.holes.is_empty() {
            return None;
        }

        let capacity = self.capacity();
        let tail = self.tail.expect("a table with holes must have pages");
        let mut stats = Compaction::default();

        // Detach every hole-bearing page from the list.
        // Rows past the tail boundary count as holes of the tail.
        let mut candidates = Vec::new();
        let mut tail_holes = 0;
        for (id, holes) in mem::take(&mut self.holes) {
            if id == tail {
                tail_holes = holes;
            } else {
                self.unlink(id);
                candidates.push((id, holes));
            }
        }
        {
            let tail_page = self.page_mut(tail);
            tail_holes += capacity - tail_page.len;
            tail_page.len = capacity;
        }
        if tail_holes != 0 {
            self.unlink(tail);
            candidates.push((tail, tail_holes));
        }

        candidates.sort_by_key(|&(_, holes)| holes);
        let mut candidates: VecDeque<_> = candidates.into_iter().map(|(id, _)| id).collect();

        // Fill the page with the fewest holes from the back of the page with the most holes.
        let (mut fill_row, mut donor_end) = (0, capacity);
        while candidates.len() > 1 {
            let fill = *candidates.front().expect("checked length");
            let donor = *candidates.back().expect("checked length");

            loop {
                fill_row = self.page_ref(fill).first_vacant(fill_row, capacity);
                if fill_row == capacity {
                    fill_row = 0;
                    self.link_back(fill);
                    candidates.pop_front();
                    break;
                }

                donor_end = self.page_ref(donor).live_end(donor_end, 0);
                if donor_end == 0 {
                    donor_end = capacity;
                    self.page_mut(donor).len = 0;
                    self.free_page(donor);
                    stats.freed_pages += 1;
                    candidates.pop_back();
                    break;
                }

                self.migrate_row((fill, fill_row), (donor, donor_end - 1));
                stats.moved_rows += 1;
            }
        }

        // Pack the last page within itself.
        let last = candidates.pop_front().expect("compaction must keep one candidate");
        loop {
            fill_row = self.page_ref(last).first_vacant(fill_row, donor_end);
            donor_end = self.page_ref(last).live_end(donor_end, fill_row);
            if fill_row + 1 < donor_end {
                self.migrate_row((last, fill_row), (last, donor_end - 1));
                stats.moved_rows += 1;
            } else {
                break;
            }
        }

        self.page_mut(last).len = fill_row;
        if fill_row != 0 {
            self.link_back(last);
        } else {
            self.free_page(last);
            stats.freed_pages += 1;
        }

        log::trace!("Compacted table {:?}: {stats:?}", self.id);
        Some(stats)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        for slot in &mut self.pages {
            if let Some(page) = slot.take() {
                page.free(&*self.allocator);
            }
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .field("live", &self.live)
            .field("pages", &self.page_count())
            .finish()
    }
}

/// A read-only view of one page of a [`Table`].
#[derive(Clone, Copy)]
pub struct PageView<'t> {
    table: &'t Table,
    id:    PageId,
    page:  &'t Page,
}

impl<'t> PageView<'t> {
    /// The identifier of this page.
    pub fn id(&self) -> PageId { self.id }

    /// The number of rows below the boundary, all of which are live outside a commit.
    pub fn len(&self) -> usize { self.page.len }

    /// Whether the page has no rows.
    pub fn is_empty(&self) -> bool { self.page.len == 0 }

    /// The next page in the list.
    pub fn next(&self) -> Option<PageId> { self.page.next }

    /// The entities of the rows below the boundary.
    pub fn entities(&self) -> &'t [Option<Entity>] { self.page.entities() }

    /// Returns the packed cells of `column`.
    ///
    /// # Panics
    /// Panics if the column is out of bounds or `T` is not the component type of the column.
    pub fn column<T: comp::Component>(&self, column: usize) -> &'t [T] {
        self.table.assert_column_type::<T>(column);
        debug_assert!(self.table.holes.is_empty(), "columns are not packed during a commit");

        // Safety: rows below the boundary are live because the table is packed outside commits.
        unsafe { slice::from_raw_parts(self.page.cell(column, 0).cast::<T>().as_ptr(), self.page.len) }
    }
}

impl<'t> fmt::Debug for PageView<'t> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageView").field("id", &self.id).field("len", &self.page.len).finish()
    }
}
