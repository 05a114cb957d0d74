//! The page allocator that supplies raw memory to pages and the staging arena.

use std::alloc::{self as std_alloc, Layout};
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::align_up;

/// Supplies raw memory pages.
///
/// # Safety
/// Implementors must ensure that
/// a successful [`allocate`](Self::allocate) returns a pointer
/// aligned to at least `align_of::<usize>()`
/// and valid for reads and writes of the returned size (which is at least `min_size`),
/// and that the memory stays valid and unaliased until it is passed to [`release`](Self::release).
/// [`pre_calculate_size`](Self::pre_calculate_size) must never return less than its input.
pub unsafe trait PageAllocator: Send + Sync {
    /// Allocates at least `min_size` bytes.
    ///
    /// Returns the buffer and its actual usable size,
    /// or `None` if the memory cannot be provided.
    fn allocate(&self, min_size: usize) -> Option<(NonNull<u8>, usize)>;

    /// Returns a buffer obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on the same allocator
    /// and must not be used after this call.
    unsafe fn release(&self, ptr: NonNull<u8>);

    /// The bookkeeping overhead of each allocation in bytes.
    ///
    /// Callers that target a specific total footprint subtract this from their request.
    fn reserved_size(&self) -> usize;

    /// Returns the usable size that a request of `requested` bytes would actually receive.
    fn pre_calculate_size(&self, requested: usize) -> usize;
}

/// The default [`PageAllocator`] backed by the global allocator.
///
/// Each allocation is prefixed with a header word recording its total size,
/// and total sizes are rounded up to a multiple of the granularity.
#[derive(Debug)]
pub struct SystemPages {
    granularity: usize,
    live:        AtomicUsize,
}

impl SystemPages {
    /// The default granularity, matching the common OS page size.
    pub const DEFAULT_GRANULARITY: usize = 4096;

    const HEADER: usize = mem::size_of::<usize>();
    const ALIGN: usize = mem::align_of::<usize>();

    /// Creates an allocator that rounds total allocation sizes up to a multiple of `granularity`.
    ///
    /// # Panics
    /// Panics if `granularity` is zero.
    pub fn with_granularity(granularity: usize) -> Self {
        assert!(granularity > 0, "page granularity must be nonzero");
        Self { granularity, live: AtomicUsize::new(0) }
    }

    /// The rounding granularity of total allocation sizes.
    pub fn granularity(&self) -> usize { self.granularity }

    /// The number of allocations that have not been released yet.
    pub fn live_allocations(&self) -> usize { self.live.load(Ordering::Acquire) }

    fn total_size(&self, requested: usize) -> usize {
        let total = requested.checked_add(Self::HEADER).expect("page size overflow");
        let total = total.div_ceil(self.granularity).checked_mul(self.granularity).expect("page size overflow");
        align_up(total, Self::ALIGN)
    }
}

impl Default for SystemPages {
    fn default() -> Self { Self::with_granularity(Self::DEFAULT_GRANULARITY) }
}

// Safety: every buffer is a fresh global allocation aligned to `usize`,
// usable for `total - HEADER` bytes after the header.
unsafe impl PageAllocator for SystemPages {
    fn allocate(&self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let total = self.total_size(min_size);
        let layout = Layout::from_size_align(total, Self::ALIGN).ok()?;

        // Safety: `total` includes the header, so the layout is never zero-sized.
        let base = NonNull::new(unsafe { std_alloc::alloc(layout) })?;

        // Safety: the header word is within the allocation and aligned to `usize`.
        unsafe {
            base.as_ptr().cast::<usize>().write(total);
        }
        self.live.fetch_add(1, Ordering::AcqRel);

        // Safety: HEADER < total, so the offset stays within the allocation.
        let buffer = unsafe { NonNull::new_unchecked(base.as_ptr().add(Self::HEADER)) };
        Some((buffer, total - Self::HEADER))
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        let base = ptr.as_ptr().sub(Self::HEADER);
        let total = base.cast::<usize>().read();
        self.live.fetch_sub(1, Ordering::AcqRel);

        // Safety: the same layout was used in `allocate` and recorded in the header.
        std_alloc::dealloc(base, Layout::from_size_align_unchecked(total, Self::ALIGN));
    }

    fn reserved_size(&self) -> usize { Self::HEADER }

    fn pre_calculate_size(&self, requested: usize) -> usize { self.total_size(requested) - Self::HEADER }
}
