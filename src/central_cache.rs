//! Central cache (middle tier): per-size-class shared span pools.
//!
//! One span list and one independent lock per size class, so unrelated
//! classes make progress in parallel. The cache brokers whole batches of
//! same-size objects between the page cache and many thread caches; it
//! borrows span control blocks from the page cache while they are carved
//! and hands them back once every object has come home.
//!
//! Lock order is fixed: a class lock may be held across a page-cache call,
//! never the reverse.

use crate::error::AllocError;
use crate::object::{self, Batch};
use crate::page_cache::PageCache;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::{PageId, SpanHandle, SpanList};
use crate::{PAGE_SHIFT, PAGE_SIZE};

use parking_lot::Mutex;

pub struct CentralCache {
    classes: [Mutex<SpanList>; NUM_SIZE_CLASSES],
}

impl CentralCache {
    pub fn new() -> Self {
        Self {
            classes: [const { Mutex::new(SpanList::new()) }; NUM_SIZE_CLASSES],
        }
    }

    /// Detach up to one batch of `obj_size` objects for a thread cache.
    ///
    /// `obj_size` must already be rounded to a size class. Returns fewer
    /// objects than the nominal batch when the serving span runs short;
    /// that is not an error. Locks only this class's list.
    pub fn batch_allocate(
        &self,
        page_cache: &PageCache,
        obj_size: usize,
    ) -> Result<Batch, AllocError> {
        debug_assert_eq!(obj_size, size_class::round_up(obj_size));
        let index = size_class::class_index(obj_size);
        let batch = size_class::batch_size(obj_size);

        let mut list = self.classes[index].lock();
        if !unsafe { list.front_has_free() } {
            // Exhausted spans sit at the back, so the whole class is dry.
            let span = Self::fetch_span(page_cache, obj_size)?;
            unsafe { list.push_front(span) };
        }

        // The front span now has free objects; these two lookups cannot
        // miss, but a miss degrades to an error rather than a panic.
        let handle = unsafe { list.pop_front() }.ok_or(AllocError::HeapExhausted)?;
        let span = unsafe { handle.span_mut() };
        let taken = span.free.split_off(batch).ok_or(AllocError::HeapExhausted)?;
        span.use_count += taken.count();

        if span.free.is_empty() {
            unsafe { list.push_back(handle) };
        } else {
            unsafe { list.push_front(handle) };
        }
        Ok(taken)
    }

    /// Take back a chain of freed objects, which may belong to several
    /// spans (and therefore several classes). Spans drained back to zero
    /// outstanding objects are returned to the page cache whole.
    pub fn batch_deallocate(&self, page_cache: &PageCache, batch: Batch) {
        for obj in batch.drain() {
            let page_id = (obj.as_ptr() as usize >> PAGE_SHIFT) as PageId;
            let Some(handle) = page_cache.page_id_to_span(page_id) else {
                // Not our memory; dropping it on the floor beats corrupting
                // a span list.
                debug_assert!(false, "freed pointer has no owning span");
                continue;
            };

            // Outstanding objects pin the span in its class, so obj_size is
            // stable even though we read it before taking the class lock.
            let obj_size = unsafe { handle.span_mut() }.obj_size;
            let index = size_class::class_index(obj_size);
            let mut list = self.classes[index].lock();
            unsafe {
                list.erase(handle);
                let span = handle.span_mut();
                span.free.push(obj);
                span.use_count -= 1;
                if span.use_count == 0 {
                    // Every object is home; give the pages back.
                    page_cache.deallocate(handle);
                } else {
                    list.push_front(handle);
                }
            }
        }
    }

    /// Fetch a fresh span sized for one batch of `obj_size` and carve it
    /// into a free list of contiguous objects.
    fn fetch_span(page_cache: &PageCache, obj_size: usize) -> Result<SpanHandle, AllocError> {
        let handle = page_cache.allocate(size_class::pages_for_batch(obj_size))?;
        let base = unsafe { handle.base() };
        let bytes = unsafe { handle.span_mut() }.npages * PAGE_SIZE;
        let free = unsafe { object::carve(base, bytes, obj_size) };
        let span = unsafe { handle.span_mut() };
        span.obj_size = obj_size;
        span.free = free;
        Ok(handle)
    }
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectList;
    use crate::page_cache::SystemHeap;
    use crate::{MAX_SPAN_BYTES, NPAGES};

    fn env() -> (PageCache, CentralCache) {
        let pc = PageCache::new(MAX_SPAN_BYTES, Box::new(SystemHeap::new()));
        (pc, CentralCache::new())
    }

    #[test]
    fn test_batch_allocate_fills_a_batch() {
        let (pc, cc) = env();
        let batch = cc.batch_allocate(&pc, 16).unwrap();
        assert_eq!(batch.count(), size_class::batch_size(16));
        assert_eq!(pc.grow_events(), 1);

        // Objects are carved contiguously.
        let mut prev = None;
        for obj in batch.drain() {
            if let Some(p) = prev {
                assert_eq!(obj.as_ptr() as usize, p + 16);
            }
            prev = Some(obj.as_ptr() as usize);
        }
    }

    #[test]
    fn test_partial_batch_when_span_runs_short() {
        let (pc, cc) = env();
        let full = cc.batch_allocate(&pc, 16).unwrap();
        assert_eq!(full.count(), 512);

        // Hand 100 objects back: the front span now holds exactly 100.
        let mut stash = ObjectList::new();
        stash.push_batch(full);
        let returned = stash.split_off(100).unwrap();
        cc.batch_deallocate(&pc, returned);

        // The next batch is served from those 100, not a fresh span.
        let partial = cc.batch_allocate(&pc, 16).unwrap();
        assert_eq!(partial.count(), 100);
        assert_eq!(pc.grow_events(), 1);

        // Drain everything so the span goes home.
        stash.push_batch(partial);
        let rest = stash.split_off(stash.len()).unwrap();
        cc.batch_deallocate(&pc, rest);
        assert_eq!(pc.free_pages(), NPAGES);
    }

    #[test]
    fn test_drained_span_returns_to_page_cache() {
        let (pc, cc) = env();
        let batch = cc.batch_allocate(&pc, 1024).unwrap();
        assert_eq!(batch.count(), 64);
        assert_eq!(pc.free_pages(), NPAGES - size_class::pages_for_batch(1024));

        cc.batch_deallocate(&pc, batch);
        assert_eq!(pc.free_pages(), NPAGES, "fully drained span must coalesce home");
        assert_eq!(pc.grow_events(), 1);
    }

    #[test]
    fn test_exhausted_class_carves_new_spans() {
        let (pc, cc) = env();
        let a = cc.batch_allocate(&pc, 16).unwrap();
        let b = cc.batch_allocate(&pc, 16).unwrap();
        assert_eq!(a.count(), 512);
        assert_eq!(b.count(), 512);
        // Second batch came from a second span, same growth chunk.
        assert_eq!(pc.grow_events(), 1);
        assert_eq!(pc.free_pages(), NPAGES - 2 * size_class::pages_for_batch(16));

        cc.batch_deallocate(&pc, a);
        cc.batch_deallocate(&pc, b);
        assert_eq!(pc.free_pages(), NPAGES);
    }

    #[test]
    fn test_classes_are_independent() {
        let (pc, cc) = env();
        let small = cc.batch_allocate(&pc, 8).unwrap();
        let big = cc.batch_allocate(&pc, 65536).unwrap();
        assert_eq!(small.count(), 512);
        assert_eq!(big.count(), 2);

        // Mixed-class chains resolve each object to its own span.
        let mut stash = ObjectList::new();
        stash.push_batch(small);
        stash.push_batch(big);
        let all = stash.split_off(stash.len()).unwrap();
        cc.batch_deallocate(&pc, all);
        assert_eq!(pc.free_pages(), NPAGES);
    }

    #[test]
    fn test_use_count_conservation() {
        let (pc, cc) = env();
        let batch = cc.batch_allocate(&pc, 256).unwrap();
        let taken = batch.count();
        let handle = pc
            .page_id_to_span((batch.head().as_ptr() as usize >> PAGE_SHIFT) as PageId)
            .unwrap();
        let span = unsafe { handle.span_mut() };
        assert_eq!(span.use_count, taken);
        assert_eq!(span.use_count + span.free.len(), span.npages * PAGE_SIZE / 256);
        cc.batch_deallocate(&pc, batch);
    }
}
