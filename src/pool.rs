//! Pool facade: one explicit handle bundling the page cache and central
//! cache, plus the per-thread cache slot.
//!
//! A [`MemoryPool`] is constructed once at startup and shared by `Arc`;
//! there is no hidden global state, so tests can run pools side by side.
//! The `allocate`/`deallocate` convenience methods route through a
//! lazily-initialized thread-local [`ThreadCache`] whose destructor drains
//! it at thread exit.

use crate::central_cache::CentralCache;
use crate::error::AllocError;
use crate::page_cache::{HeapSource, PageCache, SystemHeap};
use crate::thread_cache::ThreadCache;

use core::ptr::NonNull;
use std::cell::RefCell;
use std::sync::Arc;

/// Pool construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Bytes requested from the heap source per growth event; rounded up
    /// to whole 128-page chunks. Default 512 KiB.
    pub grow_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            grow_bytes: 512 * 1024,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Heap growth events since construction.
    pub grow_events: u64,
    /// Total bytes obtained from the heap source.
    pub grown_bytes: usize,
    /// Pages currently free in the page cache.
    pub free_pages: usize,
}

/// A three-tier memory pool: thread caches in front of one central cache
/// in front of one page cache.
pub struct MemoryPool {
    page_cache: PageCache,
    central: CentralCache,
}

thread_local! {
    // Dropped at thread exit, draining the cache back to its pool.
    static THREAD_CACHE: RefCell<Option<ThreadCache>> = const { RefCell::new(None) };
}

impl MemoryPool {
    /// Create a pool backed by the operating system ([`SystemHeap`]).
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Self::with_source(config, Box::new(SystemHeap::new()))
    }

    /// Create a pool with a custom heap source (tests cap or fake growth
    /// this way).
    pub fn with_source(config: PoolConfig, source: Box<dyn HeapSource>) -> Arc<Self> {
        Arc::new(Self {
            page_cache: PageCache::new(config.grow_bytes, source),
            central: CentralCache::new(),
        })
    }

    /// Build an explicit per-thread front end for this pool. Most callers
    /// use [`Self::allocate`] instead and let the pool manage the slot.
    pub fn new_thread_cache(self: &Arc<Self>) -> ThreadCache {
        ThreadCache::new(Arc::clone(self))
    }

    /// Allocate at least `size` usable bytes through this thread's cache.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_thread_cache(|cache| cache.allocate(size))
    }

    /// Release a block previously returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// Same contract as [`ThreadCache::deallocate`]: `ptr` came from this
    /// pool's `allocate` with the same `size`, and is not used again.
    pub unsafe fn deallocate(self: &Arc<Self>, ptr: NonNull<u8>, size: usize) {
        self.with_thread_cache(|cache| unsafe { cache.deallocate(ptr, size) })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            grow_events: self.page_cache.grow_events(),
            grown_bytes: self.page_cache.grown_bytes(),
            free_pages: self.page_cache.free_pages(),
        }
    }

    pub(crate) fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    pub(crate) fn central(&self) -> &CentralCache {
        &self.central
    }

    fn with_thread_cache<R>(self: &Arc<Self>, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
        THREAD_CACHE.with(|slot| {
            let mut slot = slot.borrow_mut();
            // A slot bound to another pool is replaced; the old cache
            // drains back to its own pool on drop.
            if !matches!(slot.as_ref(), Some(cache) if cache.pool_matches(self)) {
                *slot = None;
            }
            let cache = slot.get_or_insert_with(|| ThreadCache::new(Arc::clone(self)));
            f(cache)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NPAGES, PAGE_SIZE};

    #[test]
    fn test_request_shape_errors() {
        let pool = MemoryPool::new(PoolConfig::default());
        assert_eq!(pool.allocate(0), Err(AllocError::ZeroSize));
        let big = NPAGES * PAGE_SIZE + 1;
        assert!(matches!(
            pool.allocate(big),
            Err(AllocError::OversizedRequest { size, .. }) if size == big
        ));
    }

    #[test]
    fn test_facade_round_trip_reuses_tls_cache() {
        let pool = MemoryPool::new(PoolConfig::default());
        let a = pool.allocate(100).unwrap();
        unsafe { pool.deallocate(a, 100) };
        let b = pool.allocate(100).unwrap();
        // Same thread, same class: the local list serves the same block.
        assert_eq!(a, b);
        unsafe { pool.deallocate(b, 100) };
    }

    #[test]
    fn test_two_pools_keep_memory_apart() {
        let pool_a = MemoryPool::new(PoolConfig::default());
        let pool_b = MemoryPool::new(PoolConfig::default());

        let a = pool_a.allocate(64).unwrap();
        assert_eq!(pool_a.stats().grow_events, 1);
        // Switching pools rebinds the slot; the old cache drains to A.
        let b = pool_b.allocate(64).unwrap();
        assert_eq!(pool_b.stats().grow_events, 1);
        assert_ne!(a, b);

        unsafe {
            pool_a.deallocate(a, 64);
            pool_b.deallocate(b, 64);
        }
    }

    #[test]
    fn test_stats_track_growth_and_free_pages() {
        let pool = MemoryPool::new(PoolConfig::default());
        let stats = pool.stats();
        assert_eq!(stats.grow_events, 0);
        assert_eq!(stats.free_pages, 0);

        let ptr = pool.allocate(70_000).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.grow_events, 1);
        assert_eq!(stats.grown_bytes, 512 * 1024);
        assert_eq!(stats.free_pages, NPAGES - 70_000usize.div_ceil(PAGE_SIZE));

        unsafe { pool.deallocate(ptr, 70_000) };
        assert_eq!(pool.stats().free_pages, NPAGES);
    }

    #[test]
    fn test_custom_grow_chunk() {
        let pool = MemoryPool::new(PoolConfig {
            grow_bytes: 1024 * 1024,
        });
        let ptr = pool.allocate(16).unwrap();
        assert_eq!(pool.stats().grown_bytes, 1024 * 1024);
        unsafe { pool.deallocate(ptr, 16) };
    }
}
