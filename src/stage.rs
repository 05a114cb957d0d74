//! Staged structural changes awaiting the next commit.

use std::ptr::NonNull;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::alloc::PageAllocator;
use crate::util::align_up;
use crate::{comp, Entity};

/// A bump allocator for staged component payloads.
///
/// Blocks are requested from the page allocator and only returned on [`clear`](Self::clear).
pub(crate) struct Arena {
    allocator:  Arc<dyn PageAllocator>,
    block_size: usize,
    blocks:     Vec<NonNull<u8>>,
    /// Address of the next free byte in the last block.
    cursor:     usize,
    /// Address one past the last block.
    end:        usize,
}

// Safety: the arena exclusively owns its blocks.
unsafe impl Send for Arena {}

impl Arena {
    pub(crate) fn new(allocator: Arc<dyn PageAllocator>, block_size: usize) -> Self {
        Self { allocator, block_size, blocks: Vec::new(), cursor: 0, end: 0 }
    }

    /// Reserves uninitialized space for one value of `desc`.
    pub(crate) fn alloc(&mut self, desc: comp::Descriptor) -> NonNull<u8> {
        let start = align_up(self.cursor, desc.align());
        if self.blocks.is_empty() || start + desc.size() > self.end {
            self.grow(desc);
        }

        let start = align_up(self.cursor, desc.align());
        assert!(start + desc.size() <= self.end, "arena block cannot hold {desc:?}");
        self.cursor = start + desc.size();
        NonNull::new(start as *mut u8).expect("arena cursor is never null")
    }

    fn grow(&mut self, desc: comp::Descriptor) {
        let padded = desc.size() + desc.align().saturating_sub(std::mem::align_of::<usize>());
        let size = self.block_size.saturating_sub(self.allocator.reserved_size()).max(padded);

        let (block, actual) = match self.allocator.allocate(size) {
            Some(pair) => pair,
            None => panic!("page allocator cannot provide a {size} byte staging block"),
        };
        log::trace!("Allocated a {actual} byte staging block for {desc:?}");

        self.blocks.push(block);
        self.cursor = block.as_ptr() as usize;
        self.end = self.cursor + actual;
    }

    #[cfg(test)]
    pub(crate) fn block_count(&self) -> usize { self.blocks.len() }

    /// Returns every block to the allocator.
    ///
    /// All payloads in the arena must have been moved out or dropped.
    pub(crate) fn clear(&mut self) {
        for block in self.blocks.drain(..) {
            // Safety: `block` was returned by `allocate` on the same allocator and is no longer referenced.
            unsafe { self.allocator.release(block) };
        }
        self.cursor = 0;
        self.end = 0;
    }
}

impl Drop for Arena {
    fn drop(&mut self) { self.clear() }
}

/// A component value constructed in the arena.
///
/// The payload is dropped with the value unless it has been [taken](Self::take).
pub(crate) struct Staged {
    pub(crate) desc:      comp::Descriptor,
    pub(crate) functions: comp::Functions,
    payload:              NonNull<u8>,
    taken:                bool,
}

// Safety: the payload is a component, which is `Send`.
unsafe impl Send for Staged {}

impl Staged {
    /// Moves the payload into `dst`, after which the payload is not dropped.
    ///
    /// # Safety
    /// `dst` must be valid for writes of the layout of `desc`.
    ///
    /// # Panics
    /// Panics if the payload has already been taken.
    pub(crate) unsafe fn take(&mut self, dst: NonNull<u8>) {
        assert!(!self.taken, "staged {:?} was taken twice", self.desc);
        self.functions.relocate(dst, self.payload);
        self.taken = true;
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.taken {
            // Safety: the payload was initialized on staging and has not been moved out.
            unsafe { self.functions.drop_in_place(self.payload) };
        }
    }
}

/// A staged structural change of one entity.
pub(crate) enum Op {
    /// Adds or replaces a component.
    Construct(Staged),
    /// Removes a component if present.
    Destruct(comp::Descriptor),
    /// Removes all components and ignores later operations of the same cycle.
    Destroy,
    /// Removes all components.
    DeleteAll,
}

/// The staging log and the arena holding its payloads.
pub(crate) struct Staging {
    // declared before `arena` so that payloads are dropped before their blocks are released
    pub(crate) ops: IndexMap<Entity, Vec<Op>>,
    arena:          Arena,
}

impl Staging {
    pub(crate) fn new(allocator: Arc<dyn PageAllocator>, block_size: usize) -> Self {
        Self { ops: IndexMap::new(), arena: Arena::new(allocator, block_size) }
    }

    pub(crate) fn push(&mut self, entity: &Entity, op: Op) {
        match self.ops.get_mut(entity) {
            Some(ops) => ops.push(op),
            None => {
                self.ops.insert(entity.clone(), vec![op]);
            }
        }
    }

    /// Constructs a payload in the arena and stages it.
    ///
    /// # Safety
    /// `construct` must initialize a valid value of `desc` at the pointer passed to it,
    /// and `functions` must be valid for that value.
    pub(crate) unsafe fn push_construct(
        &mut self,
        entity: &Entity,
        desc: comp::Descriptor,
        functions: comp::Functions,
        construct: impl FnOnce(NonNull<u8>),
    ) {
        let payload = self.arena.alloc(desc);
        construct(payload);
        self.push(entity, Op::Construct(Staged { desc, functions, payload, taken: false }));
    }

    #[cfg(test)]
    pub(crate) fn arena(&self) -> &Arena { &self.arena }

    /// Drops every staged operation, including untaken payloads, and releases the arena.
    pub(crate) fn clear(&mut self) {
        self.ops.clear();
        self.arena.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Op, Staging};
    use crate::alloc::{PageAllocator, SystemPages};
    use crate::comp::{Descriptor, Functions};
    use crate::test_util::{self, Aligned, Tracked};
    use crate::Entity;

    fn staging(block_size: usize) -> (Arc<SystemPages>, Staging) {
        let allocator = Arc::new(SystemPages::with_granularity(1));
        let staging = Staging::new(Arc::clone(&allocator) as Arc<dyn PageAllocator>, block_size);
        (allocator, staging)
    }

    unsafe fn stage<T: Send + Sync + 'static>(staging: &mut Staging, entity: &Entity, value: T) {
        staging.push_construct(entity, Descriptor::of::<T>(), Functions::of::<T>(), |ptr| {
            ptr.cast::<T>().as_ptr().write(value)
        });
    }

    #[test]
    fn test_payloads_are_aligned() {
        let (_allocator, mut staging) = staging(1024);
        let entity = Entity::new();
        for i in 0..100 {
            unsafe {
                stage(&mut staging, &entity, i);
                stage(&mut staging, &entity, Aligned(i));
            }
        }

        for op in &staging.ops[&entity] {
            if let Op::Construct(staged) = op {
                assert_eq!(staged.payload.as_ptr() as usize % staged.desc.align(), 0);
            }
        }
        assert!(staging.arena().block_count() > 1);
    }

    #[test]
    fn test_oversized_payload_gets_own_block() {
        let (allocator, mut staging) = staging(64);
        let entity = Entity::new();
        unsafe { stage(&mut staging, &entity, [7u64; 100]) };

        assert_eq!(staging.arena().block_count(), 1);
        match &staging.ops[&entity][0] {
            Op::Construct(staged) => {
                assert_eq!(unsafe { staged.payload.cast::<[u64; 100]>().as_ptr().read() }, [7; 100]);
            }
            _ => unreachable!(),
        }

        staging.clear();
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn test_clear_drops_untaken_payloads() {
        let drops = test_util::drop_counter();
        let (allocator, mut staging) = staging(1024);
        let entities: Vec<_> = (0..3).map(|_| Entity::new()).collect();

        for (i, entity) in entities.iter().enumerate() {
            unsafe { stage(&mut staging, entity, Tracked::new(i, &drops)) };
            staging.push(entity, Op::Destroy);
        }
        assert_eq!(staging.ops.len(), 3);
        assert_eq!(entities[0].ref_count(), 2);

        staging.clear();
        assert_eq!(test_util::drops(&drops), 3);
        assert_eq!(entities[0].ref_count(), 1);
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn test_taken_payload_is_not_dropped() {
        let drops = test_util::drop_counter();
        let (_allocator, mut staging) = staging(1024);
        let entity = Entity::new();
        unsafe { stage(&mut staging, &entity, Tracked::new(5, &drops)) };

        let mut slot = std::mem::MaybeUninit::<Tracked>::uninit();
        match &mut staging.ops.get_mut(&entity).expect("entity is staged")[0] {
            Op::Construct(staged) => unsafe { staged.take(std::ptr::NonNull::from(&mut slot).cast()) },
            _ => unreachable!(),
        }
        staging.clear();
        assert_eq!(test_util::drops(&drops), 0);

        let value = unsafe { slot.assume_init() };
        assert_eq!(value.value, 5);
        drop(value);
        assert_eq!(test_util::drops(&drops), 1);
    }
}
