use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Archetypes, Pool};
use crate::alloc::{PageAllocator, SystemPages};
use crate::page::Sizing;
use crate::stage::Staging;

/// This type is used to configure a [`Pool`].
pub struct Builder {
    page_size:           usize,
    min_rows_per_page:   usize,
    arena_block_size:    usize,
    allocator:           Option<Arc<dyn PageAllocator>>,
    parallel_compaction: bool,
}

impl Builder {
    /// The default target footprint of a page.
    pub const DEFAULT_PAGE_SIZE: usize = 8 * 1024;
    /// The default minimum number of rows per page.
    pub const DEFAULT_MIN_ROWS_PER_PAGE: usize = 32;
    /// The default footprint of a staging arena block.
    pub const DEFAULT_ARENA_BLOCK_SIZE: usize = 16 * 1024;

    /// Sets the target footprint of each page, including allocator overhead.
    ///
    /// Pages are larger if the minimum row count does not fit.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the minimum number of rows in each page.
    pub fn min_rows_per_page(mut self, rows: usize) -> Self {
        self.min_rows_per_page = rows;
        self
    }

    /// Sets the footprint of each staging arena block, including allocator overhead.
    ///
    /// Values larger than a block still get a dedicated block.
    pub fn arena_block_size(mut self, bytes: usize) -> Self {
        self.arena_block_size = bytes;
        self
    }

    /// Sets the allocator that supplies pages and arena blocks.
    pub fn allocator(mut self, allocator: Arc<dyn PageAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Sets whether tables are compacted on the rayon thread pool.
    pub fn parallel_compaction(mut self, parallel: bool) -> Self {
        self.parallel_compaction = parallel;
        self
    }

    /// Creates the pool.
    pub fn build(self) -> Pool {
        let allocator = self.allocator.unwrap_or_else(|| Arc::new(SystemPages::default()));
        let sizing = Sizing { page_size: self.page_size, min_rows: self.min_rows_per_page };

        Pool {
            staging:             Mutex::new(Staging::new(Arc::clone(&allocator), self.arena_block_size)),
            archetypes:          RwLock::new(Archetypes::new(allocator, sizing)),
            parallel_compaction: self.parallel_compaction,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            page_size:           Self::DEFAULT_PAGE_SIZE,
            min_rows_per_page:   Self::DEFAULT_MIN_ROWS_PER_PAGE,
            arena_block_size:    Self::DEFAULT_ARENA_BLOCK_SIZE,
            allocator:           None,
            parallel_compaction: true,
        }
    }
}
