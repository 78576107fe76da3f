//! Block-caching allocators.
//!
//! A cache keeps a small set of pools, each a free list of blocks sharing one
//! size class. Steady-state message traffic strikes a stable set of envelope
//! sizes, so after warm-up almost every allocation is a free-list pop. Each
//! successful hit promotes its pool one step toward the front of the set, a
//! least-recently-requested ordering that keeps the hottest size classes
//! first. The final pool slot is reserved: when promotion claims it, its
//! contents are drained back to the wrapped allocator.

use std::alloc::Layout;
use std::cell::RefCell;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::sync::SpinLock;

use super::Allocator;

pub(crate) const DEFAULT_MAX_POOLS: usize = 8;
pub(crate) const DEFAULT_MAX_BLOCKS: u32 = 16;

/// Free blocks must be able to hold a `FreeNode`.
const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeNode>();

/// Header written into each cached free block.
///
/// Blocks within a pool share a size but not necessarily an alignment, so
/// every node remembers the alignment its block was allocated with. Reads and
/// writes are unaligned because a block's alignment may be smaller than the
/// node's.
#[derive(Clone, Copy)]
struct FreeNode {
    next: *mut u8,
    align: usize,
}

struct Pool {
    head: *mut u8,
    count: u32,
}

unsafe impl Send for Pool {}

impl Pool {
    fn new() -> Self {
        Pool {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Caches a block, unless the pool is already full.
    fn push(&mut self, block: NonNull<u8>, align: usize, max_blocks: u32) -> bool {
        if self.count >= max_blocks {
            return false;
        }

        let node = FreeNode {
            next: self.head,
            align,
        };
        unsafe { ptr::write_unaligned(block.as_ptr().cast::<FreeNode>(), node) };

        self.head = block.as_ptr();
        self.count += 1;
        true
    }

    /// Walks the free list for a block allocated with exactly the requested
    /// alignment. O(block count), which is bounded by `max_blocks`.
    fn fetch_aligned(&mut self, align: usize) -> Option<NonNull<u8>> {
        let mut previous: *mut u8 = ptr::null_mut();
        let mut current = self.head;

        while !current.is_null() {
            let node = unsafe { ptr::read_unaligned(current.cast::<FreeNode>()) };

            if node.align == align {
                if previous.is_null() {
                    self.head = node.next;
                } else {
                    let mut previous_node =
                        unsafe { ptr::read_unaligned(previous.cast::<FreeNode>()) };
                    previous_node.next = node.next;
                    unsafe { ptr::write_unaligned(previous.cast::<FreeNode>(), previous_node) };
                }

                self.count -= 1;
                return NonNull::new(current);
            }

            previous = current;
            current = node.next;
        }

        None
    }

    /// Pops the first block regardless of alignment, reporting the alignment
    /// it was allocated with. Used when draining a pool.
    fn fetch_any(&mut self) -> Option<(NonNull<u8>, usize)> {
        let block = NonNull::new(self.head)?;
        let node = unsafe { ptr::read_unaligned(self.head.cast::<FreeNode>()) };

        self.head = node.next;
        self.count -= 1;
        Some((block, node.align))
    }
}

struct PoolEntry {
    block_size: usize,
    pool: Pool,
}

/// The pool array plus the scan/promote/claim policy, shared by both cache
/// flavors. All methods expect layouts already normalized by
/// `effective_layout`.
struct PoolSet {
    entries: Vec<PoolEntry>,
    max_blocks: u32,
}

impl PoolSet {
    fn new(max_pools: usize, max_blocks: u32) -> Self {
        let max_pools = max_pools.max(2);
        let entries = (0..max_pools)
            .map(|_| PoolEntry {
                block_size: 0,
                pool: Pool::new(),
            })
            .collect();

        PoolSet {
            entries,
            max_blocks,
        }
    }

    fn allocate(&mut self, upstream: &dyn Allocator, layout: Layout) -> Option<NonNull<u8>> {
        let last = self.entries.len() - 1;

        // The last pool is reserved and always left unused.
        debug_assert_eq!(self.entries[last].block_size, 0);
        debug_assert!(self.entries[last].pool.is_empty());

        // Scan for a pool of this size class, claiming the first unused
        // entry if there is none. The reserved last entry is always unused,
        // so the scan always terminates with a break.
        let mut block = None;
        let mut index = 0;
        while index <= last {
            let entry = &mut self.entries[index];

            if entry.block_size == layout.size() {
                block = entry.pool.fetch_aligned(layout.align());
                break;
            }

            if entry.block_size == 0 {
                entry.block_size = layout.size();
                break;
            }

            index += 1;
        }

        // Promote the touched pool one step toward the front.
        if index > 0 {
            self.entries.swap(index, index - 1);
        }

        // If promotion consumed the reserved entry, drain the pool that was
        // swapped into its place so it is available again next time.
        if index == last {
            let entry = &mut self.entries[last];
            let size = mem::replace(&mut entry.block_size, 0);

            while let Some((block, align)) = entry.pool.fetch_any() {
                let layout = Layout::from_size_align(size, align).expect("cached block layout");
                unsafe { upstream.deallocate(block, layout) };
            }
        }

        block
    }

    /// Caches the block if a matching, non-full pool exists. Returns false if
    /// the caller should free the block upstream instead.
    fn free(&mut self, block: NonNull<u8>, layout: Layout) -> bool {
        // Stop at the first unused entry; the reserved last entry never
        // receives blocks.
        for entry in &mut self.entries {
            if entry.block_size == 0 {
                break;
            }

            if entry.block_size == layout.size() {
                return entry.pool.push(block, layout.align(), self.max_blocks);
            }
        }

        false
    }

    fn clear(&mut self, upstream: &dyn Allocator) {
        for entry in &mut self.entries {
            while let Some((block, align)) = entry.pool.fetch_any() {
                let layout =
                    Layout::from_size_align(entry.block_size, align).expect("cached block layout");
                unsafe { upstream.deallocate(block, layout) };
            }
            entry.block_size = 0;
        }
    }
}

/// Normalizes a layout so blocks can hold a free-list node. Applied
/// consistently on both the allocate and free paths, so the layout handed to
/// the upstream allocator always matches.
fn effective_layout(layout: Layout) -> Layout {
    let size = layout.size().max(MIN_BLOCK_SIZE);
    Layout::from_size_align(size, layout.align()).expect("normalized layout")
}

/// Thread-safe block cache: pool access is serialized by a spin lock.
///
/// One instance serves each framework (for envelopes allocated outside worker
/// context) and one serves the runtime as a whole.
pub struct SharedCache {
    upstream: Arc<dyn Allocator + Send + Sync>,
    pools: SpinLock<PoolSet>,
}

impl SharedCache {
    pub fn new(upstream: Arc<dyn Allocator + Send + Sync>) -> Self {
        SharedCache::with_geometry(upstream, DEFAULT_MAX_POOLS, DEFAULT_MAX_BLOCKS)
    }

    pub fn with_geometry(
        upstream: Arc<dyn Allocator + Send + Sync>,
        max_pools: usize,
        max_blocks: u32,
    ) -> Self {
        SharedCache {
            upstream,
            pools: SpinLock::new(PoolSet::new(max_pools, max_blocks)),
        }
    }
}

impl Allocator for SharedCache {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let layout = effective_layout(layout);

        if let Some(block) = self.pools.lock().allocate(&*self.upstream, layout) {
            return Some(block);
        }

        self.upstream.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let layout = effective_layout(layout);

        if !self.pools.lock().free(ptr, layout) {
            self.upstream.deallocate(ptr, layout);
        }
    }
}

impl Drop for SharedCache {
    fn drop(&mut self) {
        self.pools.lock().clear(&*self.upstream);
    }
}

/// Worker-thread block cache: no locking at all, because each worker owns its
/// cache outright and nothing else ever touches it.
pub struct LocalCache {
    upstream: Arc<dyn Allocator + Send + Sync>,
    pools: RefCell<PoolSet>,
}

impl LocalCache {
    pub fn new(upstream: Arc<dyn Allocator + Send + Sync>) -> Self {
        LocalCache {
            upstream,
            pools: RefCell::new(PoolSet::new(DEFAULT_MAX_POOLS, DEFAULT_MAX_BLOCKS)),
        }
    }
}

impl Allocator for LocalCache {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let layout = effective_layout(layout);

        if let Some(block) = self.pools.borrow_mut().allocate(&*self.upstream, layout) {
            return Some(block);
        }

        self.upstream.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let layout = effective_layout(layout);

        if !self.pools.borrow_mut().free(ptr, layout) {
            self.upstream.deallocate(ptr, layout);
        }
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        self.pools.borrow_mut().clear(&*self.upstream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::DefaultAllocator;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn reuses_freed_blocks() {
        let upstream = Arc::new(DefaultAllocator::new());
        let cache = SharedCache::new(upstream.clone());
        let layout = layout(64, 8);

        let block = cache.allocate(layout).unwrap();
        unsafe { cache.deallocate(block, layout) };

        let upstream_count = upstream.allocation_count();
        let again = cache.allocate(layout).unwrap();
        assert_eq!(again, block);
        assert_eq!(upstream.allocation_count(), upstream_count);

        unsafe { cache.deallocate(again, layout) };
    }

    #[test]
    fn alignment_mismatch_misses_the_pool() {
        let upstream = Arc::new(DefaultAllocator::new());
        let cache = SharedCache::new(upstream.clone());

        let loose = cache.allocate(layout(64, 8)).unwrap();
        unsafe { cache.deallocate(loose, layout(64, 8)) };

        // Same size class, stricter alignment: must come from upstream.
        let strict = cache.allocate(layout(64, 64)).unwrap();
        assert_eq!(strict.as_ptr() as usize % 64, 0);

        unsafe {
            cache.deallocate(strict, layout(64, 64));
        }
    }

    #[test]
    fn pool_capacity_is_bounded() {
        let upstream = Arc::new(DefaultAllocator::new());
        let cache = SharedCache::with_geometry(upstream.clone(), 4, 2);
        let layout = layout(32, 8);

        let blocks: Vec<_> = (0..4).map(|_| cache.allocate(layout).unwrap()).collect();
        for block in blocks {
            unsafe { cache.deallocate(block, layout) };
        }

        // Only two blocks fit in the pool; the other two went straight back.
        assert_eq!(upstream.bytes_allocated(), 64);
    }

    #[test]
    fn drop_returns_everything_upstream() {
        let upstream = Arc::new(DefaultAllocator::new());
        {
            let cache = SharedCache::new(upstream.clone());
            for size in [24usize, 48, 96] {
                let l = layout(size, 8);
                let block = cache.allocate(l).unwrap();
                unsafe { cache.deallocate(block, l) };
            }
            assert!(upstream.bytes_allocated() > 0);
        }
        assert_eq!(upstream.bytes_allocated(), 0);
    }

    #[test]
    fn many_size_classes_rotate_through_the_reserved_pool() {
        let upstream = Arc::new(DefaultAllocator::new());
        let cache = SharedCache::with_geometry(upstream.clone(), 4, 8);

        // More live size classes than pools; every allocation must still be
        // served and every free accounted for.
        let mut blocks = Vec::new();
        for size in (16..16 + 64).step_by(8) {
            let l = layout(size, 8);
            blocks.push((cache.allocate(l).unwrap(), l));
        }
        for (block, l) in blocks {
            unsafe { cache.deallocate(block, l) };
        }

        drop(cache);
        assert_eq!(upstream.bytes_allocated(), 0);
    }

    #[test]
    fn local_cache_round_trip() {
        let upstream = Arc::new(DefaultAllocator::new());
        {
            let cache = LocalCache::new(upstream.clone());
            let l = layout(40, 8);
            let block = cache.allocate(l).unwrap();
            unsafe { cache.deallocate(block, l) };
            let again = cache.allocate(l).unwrap();
            assert_eq!(again, block);
            unsafe { cache.deallocate(again, l) };
        }
        assert_eq!(upstream.bytes_allocated(), 0);
    }
}
