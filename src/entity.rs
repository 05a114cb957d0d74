//! Reference-counted entity handles.
//!
//! An entity is a shared handle that the user creates and passes to the staging APIs.
//! The pool never allocates entity identities.
//! While an entity occupies a row, the pool holds one counted reference to it
//! and keeps the handle's back-reference pointing at that row.

use std::sync::Arc;
use std::{cmp, fmt, hash};

use parking_lot::Mutex;

use crate::pool::PoolId;
use crate::{page, table};

/// The storage position of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// The archetype table that stores the entity.
    pub table: table::TableId,
    /// The page within the table.
    pub page:  page::PageId,
    /// The row within the page.
    pub row:   usize,
}

/// A counted reference to an entity.
///
/// Cloning the handle adds a reference and dropping it removes one.
/// Handles compare, order and hash by identity, not by location.
///
/// An entity belongs to at most one pool at a time.
/// Committing an entity into a pool while another pool stores it panics.
pub struct Entity {
    inner: Arc<Inner>,
}

struct Inner {
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    /// The pool that claimed the entity in its current commit or stores it.
    owner:    Option<PoolId>,
    location: Option<Location>,
}

impl Entity {
    /// Creates a new entity that is not stored anywhere yet.
    pub fn new() -> Self { Self { inner: Arc::new(Inner { slot: Mutex::new(Slot::default()) }) } }

    /// The current storage location of the entity.
    ///
    /// Returns `None` if the entity owns no components.
    /// Staged operations are not reflected until the next commit.
    pub fn location(&self) -> Option<Location> { self.inner.slot.lock().location }

    /// The location of the entity if it is stored in `pool`.
    pub(crate) fn location_in(&self, pool: PoolId) -> Option<Location> {
        let slot = self.inner.slot.lock();
        if slot.owner == Some(pool) {
            slot.location
        } else {
            None
        }
    }

    /// Marks the entity as owned by `pool` and returns its location in that pool.
    ///
    /// # Panics
    /// Panics if the entity is owned by another pool.
    pub(crate) fn claim(&self, pool: PoolId) -> Option<Location> {
        let mut slot = self.inner.slot.lock();
        match slot.owner {
            Some(owner) if owner != pool => {
                panic!("Entity({:#x}) is stored in {owner:?} and cannot be committed into {pool:?}", self.addr())
            }
            _ => {
                slot.owner = Some(pool);
                slot.location
            }
        }
    }

    /// Updates the back-reference. Only called by the pool during commit.
    ///
    /// Clearing the location also releases the ownership of the pool.
    pub(crate) fn set_location(&self, location: Option<Location>) {
        let mut slot = self.inner.slot.lock();
        if location.is_none() {
            slot.owner = None;
        }
        slot.location = location;
    }

    /// The number of counted references to this entity, including this one.
    pub fn ref_count(&self) -> usize { Arc::strong_count(&self.inner) }

    /// Whether two handles refer to the same entity.
    pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    fn addr(&self) -> usize { Arc::as_ptr(&self.inner) as usize }
}

impl Default for Entity {
    fn default() -> Self { Self::new() }
}

impl Clone for Entity {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Entity({:#x})", self.addr())?;
        if let Some(location) = self.location() {
            write!(f, "@{}:{}:{}", location.table.0, location.page.0, location.row)?;
        }
        Ok(())
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool { self.ptr_eq(other) }
}

impl Eq for Entity {}

impl PartialOrd for Entity {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for Entity {
    fn cmp(&self, other: &Self) -> cmp::Ordering { self.addr().cmp(&other.addr()) }
}

impl hash::Hash for Entity {
    fn hash<H: hash::Hasher>(&self, state: &mut H) { self.addr().hash(state) }
}

static_assertions::assert_impl_all!(Entity: Send, Sync);

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{Entity, Location};
    use crate::page::PageId;
    use crate::pool::PoolId;
    use crate::table::TableId;

    #[test]
    fn test_identity() {
        let a = Entity::new();
        let b = Entity::new();
        let a2 = a.clone();

        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert!((a < b) ^ (b < a));

        let set: HashSet<_> = [a.clone(), a2, b.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_ref_count() {
        let a = Entity::new();
        assert_eq!(a.ref_count(), 1);
        let a2 = a.clone();
        assert_eq!(a.ref_count(), 2);
        drop(a2);
        assert_eq!(a.ref_count(), 1);
    }

    #[test]
    fn test_location_is_shared() {
        let a = Entity::new();
        let a2 = a.clone();
        assert_eq!(a.location(), None);

        let location = Location { table: TableId(1), page: PageId(2), row: 3 };
        a.set_location(Some(location));
        assert_eq!(a2.location(), Some(location));
        assert!(format!("{a2:?}").ends_with("@1:2:3"));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let a = Entity::new();
        let (first, second) = (PoolId::next(), PoolId::next());

        assert_eq!(a.claim(first), None);
        assert_eq!(a.claim(first), None);

        let location = Location { table: TableId(0), page: PageId(0), row: 0 };
        a.set_location(Some(location));
        assert_eq!(a.location_in(first), Some(location));
        assert_eq!(a.location_in(second), None);

        a.set_location(None);
        assert_eq!(a.claim(second), None);
    }

    #[test]
    #[should_panic = "cannot be committed into"]
    fn test_claim_by_other_pool_panics() {
        let a = Entity::new();
        a.claim(PoolId::next());
        a.claim(PoolId::next());
    }
}
