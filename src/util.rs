//! Miscellaneous helpers shared across the crate.

use std::any::{self, TypeId};
use std::{cmp, fmt, hash};

/// A [`TypeId`] that remembers the name of the type it was created from.
///
/// Equality, ordering and hashing only consider the [`TypeId`].
#[derive(Clone, Copy)]
pub struct DbgTypeId {
    /// The underlying type ID.
    pub id:   TypeId,
    /// The type name, only used for diagnostics.
    pub name: &'static str,
}

impl DbgTypeId {
    /// Creates the ID of `T`.
    pub fn of<T: ?Sized + 'static>() -> Self { Self { id: TypeId::of::<T>(), name: any::type_name::<T>() } }
}

impl fmt::Debug for DbgTypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{}", self.name) }
}

impl PartialEq for DbgTypeId {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}

impl PartialEq<TypeId> for DbgTypeId {
    fn eq(&self, other: &TypeId) -> bool { self.id == *other }
}

impl Eq for DbgTypeId {}

impl PartialOrd for DbgTypeId {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for DbgTypeId {
    fn cmp(&self, other: &Self) -> cmp::Ordering { self.id.cmp(&other.id) }
}

impl hash::Hash for DbgTypeId {
    fn hash<H: hash::Hasher>(&self, state: &mut H) { self.id.hash(state) }
}

/// Rounds `offset` up to the next multiple of `align`, which must be a power of two.
pub(crate) fn align_up(offset: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::{align_up, DbgTypeId};

    #[test]
    fn test_dbg_type_id_identity() {
        assert_eq!(DbgTypeId::of::<u32>(), DbgTypeId::of::<u32>());
        assert_ne!(DbgTypeId::of::<u32>(), DbgTypeId::of::<i32>());
        assert_eq!(format!("{:?}", DbgTypeId::of::<u32>()), "u32");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 4), 12);
    }
}
