#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, Once};

use crate::comp::Descriptor;
use crate::entity::Location;
use crate::table::{Compaction, TableId};
use crate::{tracer, Entity, Signature};

pub(crate) fn init() {
    static SET_LOGGER_ONCE: Once = Once::new();
    SET_LOGGER_ONCE.call_once(env_logger::init);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position(pub f32, pub f32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity(pub f32, pub f32);

/// A component with a stricter alignment than the entity slots.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(align(32))]
pub struct Aligned(pub u8);

/// A generic component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompN<const N: usize>(pub i32);

/// Descriptors of sixteen distinct component types.
pub fn descriptors() -> Vec<Descriptor> {
    macro_rules! of {
        ($($n:literal)*) => { vec![$(Descriptor::of::<CompN<$n>>()),*] }
    }
    of!(0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15)
}

/// Counts how many times values sharing the same counter are dropped.
#[derive(Debug)]
pub struct Tracked {
    pub value: usize,
    drops:     Arc<AtomicUsize>,
}

impl Tracked {
    pub fn new(value: usize, drops: &Arc<AtomicUsize>) -> Self { Self { value, drops: Arc::clone(drops) } }
}

impl Drop for Tracked {
    fn drop(&mut self) { self.drops.fetch_add(1, Ordering::SeqCst); }
}

pub fn drop_counter() -> Arc<AtomicUsize> { Arc::new(AtomicUsize::new(0)) }

pub fn drops(counter: &Arc<AtomicUsize>) -> usize { counter.load(Ordering::SeqCst) }

/// A commit event observed by [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartCommit(usize),
    CreateTable(TableId, Signature),
    Migrate { from: Option<Location>, to: Location },
    Overwrite { location: Location, components: usize },
    Release(Location),
    Compact(TableId, Compaction),
    EndCommit(bool),
}

/// Records every commit event in order.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> { self.events.lock().clone() }

    fn push(&self, event: Event) { self.events.lock().push(event) }
}

impl tracer::Tracer for Recorder {
    fn start_commit(&self, entities: usize) { self.push(Event::StartCommit(entities)) }

    fn create_table(&self, table: TableId, signature: &Signature) {
        self.push(Event::CreateTable(table, signature.clone()))
    }

    fn migrate_entity(&self, _: &Entity, from: Option<Location>, to: Location) {
        self.push(Event::Migrate { from, to })
    }

    fn overwrite_entity(&self, _: &Entity, location: Location, components: usize) {
        self.push(Event::Overwrite { location, components })
    }

    fn release_entity(&self, _: &Entity, from: Location) { self.push(Event::Release(from)) }

    fn compact_table(&self, table: TableId, moved_rows: usize, freed_pages: usize) {
        self.push(Event::Compact(table, Compaction { moved_rows, freed_pages }))
    }

    fn end_commit(&self, new_tables: bool) { self.push(Event::EndCommit(new_tables)) }
}
