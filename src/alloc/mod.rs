//! Memory allocation substrate.
//!
//! Every message envelope in the runtime is allocated through an [`Allocator`]
//! and, in steady state, through one of the block caches in [`cache`]. The
//! caches chain: each worker thread owns a lock-free cache over its
//! framework's spin-locked cache, which sits over the runtime-wide cache,
//! which sits over the user allocator supplied at runtime construction.

pub(crate) mod cache;

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use cache::{LocalCache, SharedCache};

/// A general-purpose allocator the runtime draws memory from.
///
/// Implementations must hand back blocks matching the requested layout.
/// Returning `None` signals exhaustion; the runtime treats envelope
/// allocation failure as a failed send rather than attempting recovery.
pub trait Allocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on the same allocator with
    /// the same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The stock allocator: the global heap plus live-allocation accounting.
///
/// The counters exist so that tests (and suspicious applications) can assert
/// that everything allocated through the runtime was returned by the time the
/// runtime is gone.
#[derive(Default)]
pub struct DefaultAllocator {
    bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicUsize,
}

impl DefaultAllocator {
    pub fn new() -> Self {
        DefaultAllocator::default()
    }

    /// Bytes currently allocated and not yet freed.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// High-water mark of `bytes_allocated`.
    pub fn peak_bytes_allocated(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Total number of allocations served.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }

        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;

        let bytes = self.bytes.fetch_add(layout.size(), Ordering::Relaxed) + layout.size();
        self.allocations.fetch_add(1, Ordering::Relaxed);

        let mut peak = self.peak_bytes.load(Ordering::Relaxed);
        while bytes > peak {
            match self.peak_bytes.compare_exchange_weak(
                peak,
                bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }

        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.bytes.fetch_sub(layout.size(), Ordering::Relaxed);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_live_bytes() {
        let allocator = DefaultAllocator::new();
        let layout = Layout::from_size_align(64, 8).unwrap();

        let a = allocator.allocate(layout).unwrap();
        let b = allocator.allocate(layout).unwrap();
        assert_eq!(allocator.bytes_allocated(), 128);
        assert_eq!(allocator.allocation_count(), 2);

        unsafe {
            allocator.deallocate(a, layout);
            allocator.deallocate(b, layout);
        }
        assert_eq!(allocator.bytes_allocated(), 0);
        assert_eq!(allocator.peak_bytes_allocated(), 128);
    }
}
