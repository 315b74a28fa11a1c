//! Thread cache (front end): per-thread free lists for lock-free allocation.
//!
//! Each worker thread owns one `ThreadCache`; nothing here synchronizes,
//! which is sound only because no other thread can observe the instance
//! (raw list pointers keep the type `!Send`). A hit on the local list is
//! the fast path; misses batch-transfer objects from the central cache,
//! overflow trims batch-transfer them back.

use crate::error::AllocError;
use crate::object::ObjectList;
use crate::pool::MemoryPool;
use crate::size_class::{self, MAX_CENTRAL_BYTES, NUM_SIZE_CLASSES};
use crate::span::PageId;
use crate::{MAX_SPAN_BYTES, PAGE_SHIFT, PAGE_SIZE};

use core::ptr::NonNull;
use std::sync::Arc;

/// Per-thread front end of a [`MemoryPool`].
///
/// Dropping the cache (normally at thread exit) drains every local free
/// list back to the central cache; local objects never leak past teardown.
pub struct ThreadCache {
    pool: Arc<MemoryPool>,
    lists: [ObjectList; NUM_SIZE_CLASSES],
}

impl ThreadCache {
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        Self {
            pool,
            lists: [const { ObjectList::new() }; NUM_SIZE_CLASSES],
        }
    }

    pub(crate) fn pool_matches(&self, pool: &Arc<MemoryPool>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    /// Allocate at least `size` usable bytes.
    ///
    /// Anything past the central-cache ceiling but within the span ceiling
    /// bypasses both caches and is served as one whole page-cache span;
    /// such blocks carry no free-list bookkeeping and must come back
    /// through [`Self::deallocate`] with the same size.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if size > MAX_SPAN_BYTES {
            return Err(AllocError::oversized(size));
        }
        if size > MAX_CENTRAL_BYTES {
            let span = self.pool.page_cache().allocate(size.div_ceil(PAGE_SIZE))?;
            return Ok(unsafe { span.base() });
        }

        let size = size_class::round_up(size);
        let index = size_class::class_index(size);
        if let Some(obj) = self.lists[index].pop() {
            return Ok(obj);
        }
        self.refill(index, size)
    }

    /// Release a block previously returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this pool with the
    /// same `size`, and must not be used (or freed) again. The pool keeps
    /// no per-pointer record; a mismatched size or foreign pointer
    /// corrupts free lists undetectably.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size > 0);
        let size = size_class::round_up(size);
        if size > MAX_CENTRAL_BYTES {
            // Whole-span block: hand the span straight back.
            let page_id = (ptr.as_ptr() as usize >> PAGE_SHIFT) as PageId;
            let Some(span) = self.pool.page_cache().page_id_to_span(page_id) else {
                debug_assert!(false, "freed pointer has no owning span");
                return;
            };
            unsafe { self.pool.page_cache().deallocate(span) };
            return;
        }

        let index = size_class::class_index(size);
        unsafe { self.lists[index].push(ptr) };

        // Cap idle memory at two batches per class; trim one batch back.
        let batch = size_class::batch_size(size);
        if self.lists[index].len() > batch * 2 {
            if let Some(trim) = self.lists[index].split_off(batch) {
                self.pool
                    .central()
                    .batch_deallocate(self.pool.page_cache(), trim);
            }
        }
    }

    /// Miss path: pull one batch from the central cache, hand the first
    /// object to the caller, and keep the rest locally.
    #[cold]
    fn refill(&mut self, index: usize, obj_size: usize) -> Result<NonNull<u8>, AllocError> {
        let batch = self
            .pool
            .central()
            .batch_allocate(self.pool.page_cache(), obj_size)?;
        let (first, rest) = batch.split_first();
        if let Some(rest) = rest {
            self.lists[index].push_batch(rest);
        }
        Ok(first)
    }

    #[cfg(test)]
    pub(crate) fn list_len(&self, index: usize) -> usize {
        self.lists[index].len()
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        for list in self.lists.iter_mut() {
            let len = list.len();
            if let Some(batch) = list.split_off(len) {
                self.pool
                    .central()
                    .batch_deallocate(self.pool.page_cache(), batch);
            }
        }
    }
}
