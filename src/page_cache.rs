//! Page cache (back end): the sole owner of raw address space.
//!
//! Grows the heap in coarse chunks, hands out page-aligned spans of a
//! requested page count, and coalesces adjacent free spans on release. One
//! instance per pool; a single reader/writer lock guards the per-page-count
//! free lists, the page map, and the span-control-block arena. Lookups take
//! the read lock, everything else the write lock.

use crate::error::AllocError;
use crate::object::ObjectList;
use crate::span::{PageId, SpanArena, SpanHandle, SpanList};
use crate::{MAX_SPAN_BYTES, NPAGES, PAGE_SHIFT, PAGE_SIZE};

use core::ptr::NonNull;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};

/// Source of raw address space for heap growth.
///
/// # Safety
///
/// `grow` must either return `None` or a pointer to `bytes` bytes of
/// writable memory, aligned to [`PAGE_SIZE`], owned exclusively by the
/// caller and valid until the source is dropped.
pub unsafe trait HeapSource: Send + Sync {
    fn grow(&self, bytes: usize) -> Option<NonNull<u8>>;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        unsafe fn os_grow(bytes: usize) -> Option<NonNull<u8>> {
            let ptr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(ptr as *mut u8)
            }
        }

        unsafe fn os_release(addr: usize, bytes: usize) {
            unsafe { libc::munmap(addr as *mut libc::c_void, bytes) };
        }
    } else {
        unsafe fn os_grow(bytes: usize) -> Option<NonNull<u8>> {
            let layout = std::alloc::Layout::from_size_align(bytes, PAGE_SIZE).ok()?;
            NonNull::new(unsafe { std::alloc::alloc(layout) })
        }

        unsafe fn os_release(addr: usize, bytes: usize) {
            let layout = unsafe { std::alloc::Layout::from_size_align_unchecked(bytes, PAGE_SIZE) };
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

/// Default heap source: anonymous private mappings on unix, page-aligned
/// `std::alloc` chunks elsewhere. Mappings are released when the source is
/// dropped, never earlier.
pub struct SystemHeap {
    regions: Mutex<Vec<(usize, usize)>>,
}

impl SystemHeap {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SystemHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl HeapSource for SystemHeap {
    fn grow(&self, bytes: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe { os_grow(bytes) }?;
        self.regions.lock().push((ptr.as_ptr() as usize, bytes));
        Some(ptr)
    }
}

impl Drop for SystemHeap {
    fn drop(&mut self) {
        for (addr, bytes) in self.regions.lock().drain(..) {
            unsafe { os_release(addr, bytes) };
        }
    }
}

struct Inner {
    /// Index `i` only ever holds spans of exactly `i + 1` pages.
    lists: [SpanList; NPAGES],
    /// Every page of every live span maps to its owning span.
    map: HashMap<PageId, SpanHandle>,
    arena: SpanArena,
    source: Box<dyn HeapSource>,
    /// Bytes requested from the source per refill; whole 128-page chunks.
    grow_chunk: usize,
    grow_events: u64,
    grown_bytes: usize,
    /// Pages currently sitting in the free lists.
    free_pages: usize,
}

// Span handles are only dereferenced while holding this lock (or by the
// central cache for spans it owns per the span ownership discipline).
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

pub struct PageCache {
    inner: RwLock<Inner>,
}

impl PageCache {
    /// `grow_chunk` is rounded up to a whole number of 128-page chunks.
    pub fn new(grow_chunk: usize, source: Box<dyn HeapSource>) -> Self {
        let chunks = grow_chunk.div_ceil(MAX_SPAN_BYTES).max(1);
        Self {
            inner: RwLock::new(Inner {
                lists: [const { SpanList::new() }; NPAGES],
                map: HashMap::new(),
                arena: SpanArena::new(),
                source,
                grow_chunk: chunks * MAX_SPAN_BYTES,
                grow_events: 0,
                grown_bytes: 0,
                free_pages: 0,
            }),
        }
    }

    /// Take a span of exactly `npages` pages (clamped to [`NPAGES`]).
    ///
    /// Misses grow the heap at most once and retry once; a failed growth
    /// surfaces as [`AllocError::HeapExhausted`].
    pub fn allocate(&self, npages: usize) -> Result<SpanHandle, AllocError> {
        debug_assert!(npages >= 1);
        let npages = npages.clamp(1, NPAGES);
        let mut inner = self.inner.write();
        for attempt in 0..2 {
            if let Some(span) = inner.take_span(npages) {
                return Ok(span);
            }
            if attempt == 0 {
                inner.refill()?;
            }
        }
        Err(AllocError::HeapExhausted)
    }

    /// Return a span, coalescing it with free neighbors.
    ///
    /// # Safety
    ///
    /// `handle` must have been returned by [`Self::allocate`] on this cache
    /// and must have no objects checked out of it. The caller relinquishes
    /// ownership of the span and of its memory.
    pub unsafe fn deallocate(&self, handle: SpanHandle) {
        let mut inner = self.inner.write();
        unsafe { inner.release_span(handle) };
    }

    /// Resolve a page to the span owning it. Read lock only.
    pub fn page_id_to_span(&self, page_id: PageId) -> Option<SpanHandle> {
        self.inner.read().map.get(&page_id).copied()
    }

    /// Heap growth events so far.
    pub fn grow_events(&self) -> u64 {
        self.inner.read().grow_events
    }

    /// Total bytes obtained from the heap source.
    pub fn grown_bytes(&self) -> usize {
        self.inner.read().grown_bytes
    }

    /// Pages currently free (not handed out), across all free lists.
    pub fn free_pages(&self) -> usize {
        self.inner.read().free_pages
    }
}

impl Inner {
    fn take_span(&mut self, npages: usize) -> Option<SpanHandle> {
        // Exact-size list first.
        if !self.lists[npages - 1].is_empty() {
            let handle = unsafe { self.lists[npages - 1].pop_front() }?;
            unsafe { handle.span_mut() }.obj_size = 1; // allocated, not carved
            self.free_pages -= npages;
            return Some(handle);
        }

        // First fit: scan upward, split the back span of the first
        // non-empty list.
        for i in npages..NPAGES {
            let Some(handle) = (unsafe { self.lists[i].pop_back() }) else {
                continue;
            };
            self.free_pages -= i + 1;

            let (page_id, total) = {
                let span = unsafe { handle.span_mut() };
                debug_assert_eq!(span.npages, i + 1);
                let info = (span.page_id, span.npages);
                span.npages = npages;
                span.obj_size = 1;
                info
            };

            let rest = total - npages;
            if rest > 0 {
                let rest_handle = self.arena.create(page_id + npages as PageId, rest);
                self.map_span(rest_handle);
                unsafe { self.lists[rest - 1].push_front(rest_handle) };
                self.free_pages += rest;
            }
            return Some(handle);
        }
        None
    }

    /// Grow the heap by one configured chunk and shelve it as fresh
    /// 128-page spans. Performs no mutation on failure.
    fn refill(&mut self) -> Result<(), AllocError> {
        let base = self
            .source
            .grow(self.grow_chunk)
            .ok_or(AllocError::HeapExhausted)?;
        debug_assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
        self.grow_events += 1;
        self.grown_bytes += self.grow_chunk;

        let mut page_id = (base.as_ptr() as usize >> PAGE_SHIFT) as PageId;
        for _ in 0..self.grow_chunk / MAX_SPAN_BYTES {
            let handle = self.arena.create(page_id, NPAGES);
            self.map_span(handle);
            unsafe { self.lists[NPAGES - 1].push_front(handle) };
            self.free_pages += NPAGES;
            page_id += NPAGES as PageId;
        }
        Ok(())
    }

    unsafe fn release_span(&mut self, handle: SpanHandle) {
        {
            let span = unsafe { handle.span_mut() };
            span.obj_size = 0;
            span.use_count = 0;
            span.free = ObjectList::new();
        }

        // Merge free predecessors, page id 0 bounding the walk.
        loop {
            let page_id = unsafe { handle.span_mut() }.page_id;
            let Some(prev_id) = page_id.checked_sub(1) else {
                break;
            };
            let Some(&neighbor) = self.map.get(&prev_id) else {
                break;
            };
            let (n_pages, n_page_id) = {
                let n = unsafe { neighbor.span_mut() };
                if n.obj_size != 0 {
                    break;
                }
                (n.npages, n.page_id)
            };
            {
                let span = unsafe { handle.span_mut() };
                if span.npages + n_pages > NPAGES {
                    break;
                }
                span.page_id = n_page_id;
                span.npages += n_pages;
            }
            unsafe { self.lists[n_pages - 1].erase(neighbor) };
            self.free_pages -= n_pages;
            unsafe { self.arena.retire(neighbor) };
        }

        // Merge free successors symmetrically.
        loop {
            let next_id = {
                let span = unsafe { handle.span_mut() };
                span.page_id + span.npages as PageId
            };
            let Some(&neighbor) = self.map.get(&next_id) else {
                break;
            };
            let n_pages = {
                let n = unsafe { neighbor.span_mut() };
                if n.obj_size != 0 {
                    break;
                }
                n.npages
            };
            {
                let span = unsafe { handle.span_mut() };
                if span.npages + n_pages > NPAGES {
                    break;
                }
                span.npages += n_pages;
            }
            unsafe { self.lists[n_pages - 1].erase(neighbor) };
            self.free_pages -= n_pages;
            unsafe { self.arena.retire(neighbor) };
        }

        // Remapping the merged range overwrites every entry that pointed at
        // a retired neighbor.
        self.map_span(handle);
        let npages = unsafe { handle.span_mut() }.npages;
        unsafe { self.lists[npages - 1].push_front(handle) };
        self.free_pages += npages;
    }

    fn map_span(&mut self, handle: SpanHandle) {
        let (page_id, npages) = {
            let span = unsafe { handle.span_mut() };
            (span.page_id, span.npages)
        };
        for i in 0..npages as PageId {
            self.map.insert(page_id + i, handle);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The page map covers every live span; retired blocks are freed by
        // the arena itself.
        let mut seen = HashSet::new();
        for (_, handle) in self.map.drain() {
            if seen.insert(handle.raw_id()) {
                unsafe { SpanArena::dispose(handle) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> PageCache {
        PageCache::new(MAX_SPAN_BYTES, Box::new(SystemHeap::new()))
    }

    fn span_info(handle: SpanHandle) -> (PageId, usize) {
        let span = unsafe { handle.span_mut() };
        (span.page_id, span.npages)
    }

    /// Heap source that refuses to grow past a byte budget.
    struct CappedHeap {
        inner: SystemHeap,
        remaining: Mutex<usize>,
    }

    unsafe impl HeapSource for CappedHeap {
        fn grow(&self, bytes: usize) -> Option<NonNull<u8>> {
            let mut remaining = self.remaining.lock();
            if bytes > *remaining {
                return None;
            }
            let ptr = self.inner.grow(bytes)?;
            *remaining -= bytes;
            Some(ptr)
        }
    }

    #[test]
    fn test_allocate_splits_and_stays_adjacent() {
        let pc = cache();
        let a = pc.allocate(3).unwrap();
        let b = pc.allocate(5).unwrap();
        let (a_id, a_pages) = span_info(a);
        let (b_id, b_pages) = span_info(b);
        assert_eq!(a_pages, 3);
        assert_eq!(b_pages, 5);
        assert_eq!(b_id, a_id + 3);
        assert_eq!(pc.grow_events(), 1);
        assert_eq!(pc.free_pages(), NPAGES - 8);
        unsafe {
            pc.deallocate(b);
            pc.deallocate(a);
        }
    }

    #[test]
    fn test_exact_list_is_preferred() {
        let pc = cache();
        let a = pc.allocate(4).unwrap();
        let (a_id, _) = span_info(a);
        unsafe { pc.deallocate(a) };
        // Freeing merged `a` back; splitting again must reuse the same pages.
        let b = pc.allocate(4).unwrap();
        assert_eq!(span_info(b).0, a_id);
        assert_eq!(pc.grow_events(), 1);
        unsafe { pc.deallocate(b) };
    }

    #[test]
    fn test_coalescing_reassembles_the_chunk() {
        let pc = cache();
        let a = pc.allocate(3).unwrap();
        let b = pc.allocate(5).unwrap();
        let (a_id, _) = span_info(a);
        unsafe {
            pc.deallocate(a);
            pc.deallocate(b);
        }
        // Both spans merged with each other and the trailing remainder.
        assert_eq!(pc.free_pages(), NPAGES);
        let merged = pc.allocate(8).unwrap();
        assert_eq!(span_info(merged), (a_id, 8));
        assert_eq!(pc.grow_events(), 1, "coalesced request must not grow");
        unsafe { pc.deallocate(merged) };
    }

    #[test]
    fn test_oversized_request_is_clamped() {
        let pc = cache();
        let span = pc.allocate(NPAGES + 50).unwrap();
        assert_eq!(span_info(span).1, NPAGES);
        unsafe { pc.deallocate(span) };
    }

    #[test]
    fn test_page_id_to_span_covers_every_page() {
        let pc = cache();
        let span = pc.allocate(6).unwrap();
        let (page_id, npages) = span_info(span);
        for i in 0..npages as PageId {
            assert_eq!(pc.page_id_to_span(page_id + i), Some(span));
        }
        assert_eq!(pc.page_id_to_span(1), None);
        unsafe { pc.deallocate(span) };
    }

    #[test]
    fn test_allocated_spans_do_not_merge() {
        let pc = cache();
        let a = pc.allocate(2).unwrap();
        let b = pc.allocate(2).unwrap();
        let (b_id, _) = span_info(b);
        unsafe { pc.deallocate(a) };
        // `b` is still out; `a` must not have swallowed its pages.
        assert_eq!(span_info(pc.page_id_to_span(b_id).unwrap()), (b_id, 2));
        unsafe { pc.deallocate(b) };
        assert_eq!(pc.free_pages(), NPAGES);
    }

    #[test]
    fn test_exhaustion_fails_cleanly() {
        let pc = PageCache::new(
            MAX_SPAN_BYTES,
            Box::new(CappedHeap {
                inner: SystemHeap::new(),
                remaining: Mutex::new(MAX_SPAN_BYTES),
            }),
        );
        let first = pc.allocate(NPAGES).unwrap();
        assert_eq!(pc.allocate(NPAGES), Err(AllocError::HeapExhausted));
        // The pool stays usable for memory it already owns.
        unsafe { pc.deallocate(first) };
        let again = pc.allocate(NPAGES).unwrap();
        unsafe { pc.deallocate(again) };
        assert_eq!(pc.grow_events(), 1);
    }

    #[test]
    fn test_grow_chunk_rounds_up_to_whole_chunks() {
        let pc = PageCache::new(1, Box::new(SystemHeap::new()));
        let span = pc.allocate(1).unwrap();
        assert_eq!(pc.grown_bytes(), MAX_SPAN_BYTES);
        unsafe { pc.deallocate(span) };

        let pc = PageCache::new(MAX_SPAN_BYTES + 1, Box::new(SystemHeap::new()));
        let span = pc.allocate(1).unwrap();
        assert_eq!(pc.grown_bytes(), 2 * MAX_SPAN_BYTES);
        assert_eq!(pc.free_pages(), 2 * NPAGES - 1);
        unsafe { pc.deallocate(span) };
    }
}
