//! Type-erased component metadata.
//!
//! The storage engine never knows component types statically.
//! Each component type is identified by a [`Descriptor`],
//! which carries the identity and memory layout of the type,
//! and each stored component instance is accompanied by a [`Functions`] pair
//! that knows how to drop and relocate that instance.

use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::{cmp, fmt, hash};

use crate::util::DbgTypeId;

/// Types that can be stored as components.
///
/// Components are moved between threads and between pages,
/// so they must be `Send + Sync + 'static`.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// Describes the identity and memory layout of a component type.
///
/// Descriptors are totally ordered by type identity,
/// which is the order used to sort the columns of a [`Signature`](crate::Signature).
#[derive(Clone, Copy)]
pub struct Descriptor {
    id:     DbgTypeId,
    layout: Layout,
}

impl Descriptor {
    /// Creates the descriptor of `T`.
    pub fn of<T: 'static>() -> Self { Self { id: DbgTypeId::of::<T>(), layout: Layout::new::<T>() } }

    /// The type identity of the component.
    pub fn id(&self) -> DbgTypeId { self.id }

    /// The name of the component type, for diagnostics only.
    pub fn name(&self) -> &'static str { self.id.name }

    /// The memory layout of one component instance.
    pub fn layout(&self) -> Layout { self.layout }

    /// The size of one component instance in bytes.
    pub fn size(&self) -> usize { self.layout.size() }

    /// The alignment of one component instance in bytes.
    pub fn align(&self) -> usize { self.layout.align() }

    /// Whether this descriptor was created from `T`.
    pub fn is<T: 'static>(&self) -> bool { self.id == DbgTypeId::of::<T>() }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{}", self.id.name) }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}

impl Eq for Descriptor {}

impl PartialOrd for Descriptor {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for Descriptor {
    fn cmp(&self, other: &Self) -> cmp::Ordering { self.id.cmp(&other.id) }
}

impl hash::Hash for Descriptor {
    fn hash<H: hash::Hasher>(&self, state: &mut H) { self.id.hash(state) }
}

/// The drop and relocate operations of one stored component instance.
///
/// A pair is recorded for every (column, row) slot of a page,
/// so instances of the same type may carry different functions
/// if they were staged through the raw API with different ones.
#[derive(Debug, Clone, Copy)]
pub struct Functions {
    drop:     unsafe fn(NonNull<u8>),
    relocate: unsafe fn(NonNull<u8>, NonNull<u8>),
}

impl Functions {
    /// The functions that drop and move a `T`.
    pub fn of<T: 'static>() -> Self { Self { drop: drop_erased::<T>, relocate: relocate_erased::<T> } }

    /// Creates a function pair from raw functions.
    ///
    /// # Safety
    /// For every component instance recorded with this pair,
    /// `drop(ptr)` must drop the instance at `ptr` in place,
    /// and `relocate(dst, src)` must move the instance at `src` into the uninitialized `dst`,
    /// leaving `src` logically uninitialized.
    pub unsafe fn from_raw(
        drop: unsafe fn(NonNull<u8>),
        relocate: unsafe fn(NonNull<u8>, NonNull<u8>),
    ) -> Self {
        Self { drop, relocate }
    }

    /// Drops the instance at `ptr` in place.
    ///
    /// # Safety
    /// `ptr` must point to an initialized instance that this pair was recorded for.
    pub(crate) unsafe fn drop_in_place(self, ptr: NonNull<u8>) { (self.drop)(ptr) }

    /// Moves the instance at `src` into `dst`.
    ///
    /// # Safety
    /// `src` must point to an initialized instance that this pair was recorded for,
    /// and `dst` must be valid for writes of the same layout.
    /// `src` is logically uninitialized after the call.
    pub(crate) unsafe fn relocate(self, dst: NonNull<u8>, src: NonNull<u8>) { (self.relocate)(dst, src) }
}

unsafe fn drop_erased<T>(ptr: NonNull<u8>) { ptr::drop_in_place(ptr.cast::<T>().as_ptr()) }

unsafe fn relocate_erased<T>(dst: NonNull<u8>, src: NonNull<u8>) {
    ptr::copy_nonoverlapping(src.cast::<T>().as_ptr(), dst.cast::<T>().as_ptr(), 1)
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{Descriptor, Functions};

    #[test]
    fn test_descriptor_layout() {
        let desc = Descriptor::of::<[u64; 3]>();
        assert_eq!(desc.size(), 24);
        assert_eq!(desc.align(), 8);
        assert!(desc.is::<[u64; 3]>());
        assert!(!desc.is::<[u32; 6]>());
    }

    #[test]
    fn test_descriptor_order_is_total() {
        let a = Descriptor::of::<u8>();
        let b = Descriptor::of::<u16>();
        assert_eq!(a, Descriptor::of::<u8>());
        assert_ne!(a, b);
        assert!((a < b) ^ (b < a));
    }

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    #[test]
    fn test_relocate_then_drop_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let functions = Functions::of::<Counted>();

        let mut src = MaybeUninit::new(Counted(Arc::clone(&drops)));
        let mut dst = MaybeUninit::<Counted>::uninit();
        unsafe {
            functions.relocate(
                NonNull::from(&mut dst).cast::<u8>(),
                NonNull::from(&mut src).cast::<u8>(),
            );
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        unsafe { functions.drop_in_place(NonNull::from(&mut dst).cast::<u8>()) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
