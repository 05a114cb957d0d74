//! The storage engine that owns every archetype table and the staging log.
//!
//! Structural changes are staged concurrently through `&self`
//! and applied by [`Pool::commit`], which also compacts every table.

use std::collections::BTreeMap;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitvec::vec::BitVec;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;

use crate::alloc::PageAllocator;
use crate::entity::Location;
use crate::page::{PageId, Sizing};
use crate::stage::{Op, Staged, Staging};
use crate::table::{Table, TableId};
use crate::tracer::Tracer;
use crate::{comp, Entity, Signature};

mod builder;
pub use builder::Builder;

/// Identifies a pool for the ownership check of entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolId(usize);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Stores the components of entities in archetype tables.
pub struct Pool {
    staging:             Mutex<Staging>,
    archetypes:          RwLock<Archetypes>,
    parallel_compaction: bool,
}

static_assertions::assert_impl_all!(Pool: Send, Sync);

impl Default for Pool {
    fn default() -> Self { Self::new() }
}

impl Pool {
    /// Creates a pool with the default configuration.
    pub fn new() -> Self { Builder::default().build() }

    /// Starts configuring a new pool.
    pub fn builder() -> Builder { Builder::default() }

    /// Stages the construction of a component.
    ///
    /// `construct` is called immediately with uninitialized staging memory for one value of `desc`.
    /// The value replaces any existing component of the same type when the next commit applies it.
    ///
    /// # Safety
    /// `construct` must initialize a valid value of the type described by `desc`,
    /// and `functions` must drop and relocate that value correctly.
    /// The type must be `Send + Sync`.
    pub unsafe fn stage_construct(
        &self,
        entity: &Entity,
        desc: comp::Descriptor,
        functions: comp::Functions,
        construct: impl FnOnce(NonNull<u8>),
    ) {
        self.staging.lock().push_construct(entity, desc, functions, construct);
    }

    /// Stages the insertion of `value` into the components of `entity`.
    pub fn insert<T: comp::Component>(&self, entity: &Entity, value: T) {
        // Safety: the constructor writes a valid `T` and the functions are those of `T`.
        unsafe {
            self.stage_construct(entity, comp::Descriptor::of::<T>(), comp::Functions::of::<T>(), |ptr| {
                ptr.cast::<T>().as_ptr().write(value)
            });
        }
    }

    /// Stages the removal of the component described by `desc`.
    ///
    /// Removing a component the entity does not own has no effect.
    pub fn stage_destruct(&self, entity: &Entity, desc: comp::Descriptor) {
        self.staging.lock().push(entity, Op::Destruct(desc));
    }

    /// Stages the removal of the `T` component of `entity`.
    pub fn remove<T: comp::Component>(&self, entity: &Entity) {
        self.stage_destruct(entity, comp::Descriptor::of::<T>());
    }

    /// Stages the destruction of `entity`.
    ///
    /// All components are removed and operations staged later in the same cycle are ignored.
    pub fn stage_destroy(&self, entity: &Entity) { self.staging.lock().push(entity, Op::Destroy); }

    /// Stages the removal of all components of `entity`.
    ///
    /// Unlike [`stage_destroy`](Self::stage_destroy),
    /// operations staged later in the same cycle still apply.
    pub fn stage_delete_all(&self, entity: &Entity) { self.staging.lock().push(entity, Op::DeleteAll); }

    /// The number of entities with staged operations.
    pub fn pending(&self) -> usize { self.staging.lock().ops.len() }

    /// Applies all staged operations and compacts every table.
    ///
    /// Staging calls from other threads block until the commit completes.
    /// Returns whether any new table was created.
    ///
    /// # Panics
    /// Panics if a staged entity is stored in another pool.
    pub fn commit(&self, tracer: &impl Tracer) -> bool {
        let mut archetypes = self.archetypes.write();
        let mut staging = self.staging.lock();
        let archetypes = &mut *archetypes;

        let mut ops = mem::take(&mut staging.ops);
        tracer.start_commit(ops.len());

        let mut new_tables = false;
        for (entity, ops) in &mut ops {
            new_tables |= archetypes.apply(entity, ops, tracer);
        }
        let entities = ops.len();
        drop(ops);
        staging.clear();

        let compact = |table: &mut Table| {
            if let Some(stats) = table.compact() {
                tracer.compact_table(table.id(), stats.moved_rows, stats.freed_pages);
            }
        };
        if self.parallel_compaction {
            archetypes.tables.par_iter_mut().for_each(compact);
        } else {
            archetypes.tables.iter_mut().for_each(compact);
        }

        log::debug!(
            "Committed {entities} entities into {} tables ({})",
            archetypes.tables.len(),
            if new_tables { "new tables created" } else { "no new tables" },
        );
        tracer.end_commit(new_tables);
        new_tables
    }

    /// Locks the tables for reading.
    ///
    /// Staging while holding the guard is allowed,
    /// but [`commit`](Self::commit) on the same thread deadlocks.
    pub fn read(&self) -> RwLockReadGuard<'_, Archetypes> { self.archetypes.read() }

    /// Locks the tables for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Archetypes> { self.archetypes.write() }

    /// The number of tables.
    pub fn table_count(&self) -> usize { self.read().len() }

    /// See [`Archetypes::resolve_tables`].
    pub fn resolve_tables(&self, required: &[comp::Descriptor]) -> Resolution {
        self.read().resolve_tables(required)
    }

    /// See [`Archetypes::find_live_pages`].
    pub fn find_live_pages(&self, tables: &[Option<TableId>], output: &mut Vec<Option<PageId>>) -> usize {
        self.read().find_live_pages(tables, output)
    }

    /// See [`Archetypes::live_tables`].
    pub fn live_tables(&self) -> BitVec { self.read().live_tables() }

    /// Calls `f` with the committed `T` component of `entity`.
    ///
    /// Returns `None` if the entity has no committed `T` component.
    pub fn get_with<T: comp::Component, R>(&self, entity: &Entity, f: impl FnOnce(&T) -> R) -> Option<R> {
        let archetypes = self.read();
        let location = entity.location_in(archetypes.id)?;
        let table = archetypes.get(location.table)?;
        let column = table.signature().locate(&comp::Descriptor::of::<T>())?;
        let page = table.page(location.page)?;
        Some(f(&page.column::<T>(column)[location.row]))
    }

    /// Returns a clone of the committed `T` component of `entity`.
    pub fn get_cloned<T: comp::Component + Clone>(&self, entity: &Entity) -> Option<T> {
        self.get_with(entity, T::clone)
    }

    /// Discards all staged operations and all tables.
    ///
    /// Staged payloads and stored components are dropped,
    /// and every entity reference held by the pool is released.
    pub fn clear(&self) {
        self.staging.lock().clear();

        let mut archetypes = self.archetypes.write();
        archetypes.index.clear();
        for table in archetypes.tables.drain(..) {
            log::trace!("Dropping {table:?}");
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) { self.clear() }
}

/// Where a column of the destination row comes from during a commit.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// The column at this index of the current row.
    Stored(usize),
    /// The construct operation at this index of the staging log.
    Staged(usize),
}

fn staged_mut(ops: &mut [Op], index: usize) -> &mut Staged {
    match &mut ops[index] {
        Op::Construct(staged) => staged,
        _ => panic!("operation {index} is not a construct operation"),
    }
}

/// The tables of a pool, indexed by [`TableId`] and by [`Signature`].
pub struct Archetypes {
    id:        PoolId,
    index:     BTreeMap<Signature, TableId>,
    tables:    Vec<Table>,
    allocator: Arc<dyn PageAllocator>,
    sizing:    Sizing,
}

impl Archetypes {
    fn new(allocator: Arc<dyn PageAllocator>, sizing: Sizing) -> Self {
        Self { id: PoolId::next(), index: BTreeMap::new(), tables: Vec::new(), allocator, sizing }
    }

    /// The number of tables.
    pub fn len(&self) -> usize { self.tables.len() }

    /// Whether there are no tables.
    pub fn is_empty(&self) -> bool { self.tables.is_empty() }

    /// Returns the table `id`.
    pub fn get(&self, id: TableId) -> Option<&Table> { self.tables.get(id.0) }

    /// Returns the table `id`.
    ///
    /// # Panics
    /// Panics if the table does not exist.
    pub fn table(&self, id: TableId) -> &Table {
        self.tables.get(id.0).unwrap_or_else(|| panic!("{id:?} does not exist"))
    }

    /// Returns the table `id` for mutable column access.
    ///
    /// # Panics
    /// Panics if the table does not exist.
    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        self.tables.get_mut(id.0).unwrap_or_else(|| panic!("{id:?} does not exist"))
    }

    /// Returns the table of the archetype `signature`.
    pub fn find(&self, signature: &Signature) -> Option<TableId> { self.index.get(signature).copied() }

    /// Iterates over all tables in [`TableId`] order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> + '_ { self.tables.iter() }

    /// Finds the tables whose signatures contain every type in `required`.
    ///
    /// The result has one entry per table in [`TableId`] order.
    pub fn resolve_tables(&self, required: &[comp::Descriptor]) -> Resolution {
        let width = required.len();
        let mut columns = vec![0; width * self.tables.len()];

        let mut tables = Vec::with_capacity(self.tables.len());
        for (index, table) in self.tables.iter().enumerate() {
            let output = &mut columns[index * width..(index + 1) * width];
            tables.push(table.signature().locate_unordered(required, Some(output)).then(|| table.id()));
        }

        Resolution { tables, columns, width }
    }

    /// Writes the head page of each table in `tables` to `output`,
    /// returning the total number of live rows in those tables.
    ///
    /// # Panics
    /// Panics if `tables` does not have one entry per table.
    pub fn find_live_pages(&self, tables: &[Option<TableId>], output: &mut Vec<Option<PageId>>) -> usize {
        assert_eq!(tables.len(), self.tables.len(), "table list does not cover every table");

        output.clear();
        let mut total = 0;
        for &id in tables {
            match id {
                Some(id) => {
                    let table = self.table(id);
                    output.push(table.head());
                    total += table.len();
                }
                None => output.push(None),
            }
        }
        total
    }

    /// Returns whether each table currently has a live page, in [`TableId`] order.
    pub fn live_tables(&self) -> BitVec { self.tables.iter().map(|table| table.head().is_some()).collect() }

    fn get_or_create(&mut self, signature: Signature, tracer: &impl Tracer) -> (TableId, bool) {
        if let Some(&id) = self.index.get(&signature) {
            return (id, false);
        }

        let id = TableId(self.tables.len());
        tracer.create_table(id, &signature);
        self.tables.push(Table::new(id, signature.clone(), Arc::clone(&self.allocator), self.sizing));
        self.index.insert(signature, id);
        (id, true)
    }

    /// Applies the staged operations of one entity.
    ///
    /// Returns whether a new table was created.
    fn apply(&mut self, entity: &Entity, ops: &mut [Op], tracer: &impl Tracer) -> bool {
        let current = entity.claim(self.id);

        let mut working = BTreeMap::new();
        if let Some(location) = current {
            for (column, &desc) in self.table(location.table).signature().iter().enumerate() {
                working.insert(desc, Source::Stored(column));
            }
        }

        for (index, op) in ops.iter().enumerate() {
            match op {
                Op::Construct(staged) => {
                    working.insert(staged.desc, Source::Staged(index));
                }
                Op::Destruct(desc) => {
                    working.remove(desc);
                }
                Op::DeleteAll => working.clear(),
                Op::Destroy => {
                    working.clear();
                    break;
                }
            }
        }

        if working.is_empty() {
            match current {
                Some(location) => {
                    self.tables[location.table.0].release_slot(location.page, location.row);
                    tracer.release_entity(entity, location);
                }
                None => entity.set_location(None),
            }
            return false;
        }

        let (dest, created) = self.get_or_create(Signature::from_sorted(working.keys().copied()), tracer);

        match current {
            Some(location) if location.table == dest => {
                let table = &mut self.tables[dest.0];
                let mut overwritten = 0;
                for (column, source) in working.values().enumerate() {
                    if let Source::Staged(index) = *source {
                        let staged = staged_mut(ops, index);
                        let cell = table.cell(location.page, column, location.row);
                        // Safety: the row is live, so the cell is initialized with its functions recorded,
                        // and the staged value has the type of the column.
                        unsafe {
                            table.functions(location.page, column, location.row).drop_in_place(cell);
                            staged.take(cell);
                        }
                        table.set_functions(location.page, column, location.row, staged.functions);
                        overwritten += 1;
                    }
                }
                tracer.overwrite_entity(entity, location, overwritten);
            }
            _ => {
                let (page, row) = self.tables[dest.0].allocate_slot();
                let mut moved = BitVec::<usize>::repeat(false, current.map_or(0, |location| {
                    self.table(location.table).signature().len()
                }));

                for (column, source) in working.values().enumerate() {
                    let dst = self.tables[dest.0].cell(page, column, row);
                    let functions = match *source {
                        Source::Stored(src_column) => {
                            let location = current.expect("stored columns imply a current row");
                            let src_table = &self.tables[location.table.0];
                            // Safety: the source row is live and the destination cell is vacant.
                            unsafe {
                                let functions = src_table.functions(location.page, src_column, location.row);
                                functions.relocate(dst, src_table.cell(location.page, src_column, location.row));
                                moved.set(src_column, true);
                                functions
                            }
                        }
                        Source::Staged(index) => {
                            let staged = staged_mut(ops, index);
                            // Safety: the destination cell is vacant and has the type of the staged value.
                            unsafe { staged.take(dst) };
                            staged.functions
                        }
                    };
                    self.tables[dest.0].set_functions(page, column, row, functions);
                }

                let stored = match current {
                    Some(location) => {
                        let src_table = &mut self.tables[location.table.0];
                        for column in moved.iter_zeros() {
                            // Safety: columns that were not moved are still initialized.
                            unsafe {
                                src_table
                                    .functions(location.page, column, location.row)
                                    .drop_in_place(src_table.cell(location.page, column, location.row));
                            }
                        }
                        // Safety: every column of the row has been moved out or dropped.
                        unsafe { src_table.vacate_slot(location.page, location.row) }
                    }
                    None => entity.clone(),
                };

                let to = Location { table: dest, page, row };
                self.tables[dest.0].install(page, row, stored);
                tracer.migrate_entity(entity, current, to);
            }
        }

        created
    }
}

/// The tables that contain a set of required component types.
///
/// Produced by [`Archetypes::resolve_tables`].
#[derive(Debug, Clone)]
pub struct Resolution {
    tables:  Vec<Option<TableId>>,
    columns: Vec<usize>,
    width:   usize,
}

impl Resolution {
    /// One entry per table in [`TableId`] order, `None` if the table does not match.
    pub fn tables(&self) -> &[Option<TableId>] { &self.tables }

    /// The column index of each required type in the table `id`,
    /// in the order the types were required.
    ///
    /// Returns `None` if the table does not match.
    pub fn columns(&self, id: TableId) -> Option<&[usize]> {
        self.tables.get(id.0).copied().flatten()?;
        Some(&self.columns[id.0 * self.width..(id.0 + 1) * self.width])
    }

    /// Iterates over the matching tables and their column indices.
    pub fn matches(&self) -> impl Iterator<Item = (TableId, &[usize])> + '_ {
        self.tables.iter().flatten().map(move |&id| (id, &self.columns[id.0 * self.width..(id.0 + 1) * self.width]))
    }
}
