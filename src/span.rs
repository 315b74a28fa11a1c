//! Span control blocks, the control-block arena, and intrusive span lists.
//!
//! A span describes one contiguous run of pages. Its control block lives
//! outside the managed memory, is created and retired only by the page
//! cache, and is referenced everywhere else through an opaque [`SpanHandle`].
//! At any instant a span sits in exactly one [`SpanList`] (a page-cache
//! free list or a central-cache class list); whichever tier holds that list's
//! lock owns the control block. That ownership discipline is the safety
//! contract of every `unsafe fn` below, and all span-pointer dereferencing
//! in the crate happens in this module and through [`SpanHandle::span_mut`].

use crate::object::ObjectList;
use crate::PAGE_SHIFT;
use core::ptr::{self, NonNull};

/// Pages are identified by `address >> PAGE_SHIFT`.
pub type PageId = u64;

/// Control block for a run of `npages` contiguous pages starting at
/// `page_id`.
pub struct Span {
    pub page_id: PageId,
    pub npages: usize,
    /// 0 while the span is free in the page cache. Set to 1 when handed out
    /// raw ("allocated, not yet carved") and to the object size once the
    /// central cache carves it.
    pub obj_size: usize,
    /// Objects currently checked out of this span.
    pub use_count: usize,
    /// Free objects inside the span, once carved.
    pub free: ObjectList,
    prev: *mut Span,
    next: *mut Span,
}

impl Span {
    fn new(page_id: PageId, npages: usize) -> Self {
        Self {
            page_id,
            npages,
            obj_size: 0,
            use_count: 0,
            free: ObjectList::new(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// Opaque stable handle to a span control block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpanHandle(NonNull<Span>);

impl SpanHandle {
    /// Access the control block.
    ///
    /// # Safety
    ///
    /// The caller must own the span per the ownership discipline above (it
    /// holds the lock of the tier whose list contains the span, or holds a
    /// span freshly popped under that lock), and must not let the reference
    /// outlive that ownership.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn span_mut<'a>(self) -> &'a mut Span {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// Base address of the span's first page.
    ///
    /// # Safety
    ///
    /// Same ownership contract as [`Self::span_mut`].
    #[inline]
    pub unsafe fn base(self) -> NonNull<u8> {
        let addr = (unsafe { self.span_mut().page_id } as usize) << PAGE_SHIFT;
        // Spans always describe mapped, nonzero addresses.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Stable identity for deduplication (the control block address).
    #[inline]
    pub fn raw_id(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Allocator for span control blocks.
///
/// Retired blocks are pooled and reused instead of round-tripping through
/// the heap on every split and merge.
pub struct SpanArena {
    retired: Vec<SpanHandle>,
}

impl SpanArena {
    pub const fn new() -> Self {
        Self { retired: Vec::new() }
    }

    /// Create a control block for a span of `npages` pages at `page_id`.
    pub fn create(&mut self, page_id: PageId, npages: usize) -> SpanHandle {
        match self.retired.pop() {
            Some(handle) => {
                // Retired blocks are not reachable from any list or map.
                let span = unsafe { handle.span_mut() };
                *span = Span::new(page_id, npages);
                handle
            }
            None => SpanHandle(NonNull::from(Box::leak(Box::new(Span::new(
                page_id, npages,
            ))))),
        }
    }

    /// Retire a control block for later reuse.
    ///
    /// # Safety
    ///
    /// The span must be unlinked from every list and unreachable through the
    /// page map (its pages remapped to the surviving span).
    pub unsafe fn retire(&mut self, handle: SpanHandle) {
        self.retired.push(handle);
    }

    /// Free a control block outright. Used during pool teardown for spans
    /// still reachable from the page map.
    ///
    /// # Safety
    ///
    /// `handle` must have come from [`Self::create`] and must not be used
    /// again.
    pub unsafe fn dispose(handle: SpanHandle) {
        drop(unsafe { Box::from_raw(handle.0.as_ptr()) });
    }
}

impl Drop for SpanArena {
    fn drop(&mut self) {
        for handle in self.retired.drain(..) {
            unsafe { Self::dispose(handle) };
        }
    }
}

/// Intrusive doubly-linked list of spans with O(1) push, pop, and erase.
///
/// # Safety
///
/// Every method takes or returns handles under the ownership contract of
/// [`SpanHandle::span_mut`]; a span may be linked into at most one list.
pub struct SpanList {
    head: *mut Span,
    tail: *mut Span,
}

// Raw pointers only; the list is always owned by exactly one lock.
unsafe impl Send for SpanList {}

impl SpanList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub unsafe fn push_front(&mut self, handle: SpanHandle) {
        let span = handle.0.as_ptr();
        unsafe {
            (*span).prev = ptr::null_mut();
            (*span).next = self.head;
            if self.head.is_null() {
                self.tail = span;
            } else {
                (*self.head).prev = span;
            }
        }
        self.head = span;
    }

    pub unsafe fn push_back(&mut self, handle: SpanHandle) {
        let span = handle.0.as_ptr();
        unsafe {
            (*span).next = ptr::null_mut();
            (*span).prev = self.tail;
            if self.tail.is_null() {
                self.head = span;
            } else {
                (*self.tail).next = span;
            }
        }
        self.tail = span;
    }

    pub unsafe fn pop_front(&mut self) -> Option<SpanHandle> {
        let span = NonNull::new(self.head)?;
        unsafe {
            self.head = (*span.as_ptr()).next;
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            } else {
                (*self.head).prev = ptr::null_mut();
            }
            (*span.as_ptr()).next = ptr::null_mut();
        }
        Some(SpanHandle(span))
    }

    pub unsafe fn pop_back(&mut self) -> Option<SpanHandle> {
        let span = NonNull::new(self.tail)?;
        unsafe {
            self.tail = (*span.as_ptr()).prev;
            if self.tail.is_null() {
                self.head = ptr::null_mut();
            } else {
                (*self.tail).next = ptr::null_mut();
            }
            (*span.as_ptr()).prev = ptr::null_mut();
        }
        Some(SpanHandle(span))
    }

    /// Unlink `handle` from anywhere in the list.
    pub unsafe fn erase(&mut self, handle: SpanHandle) {
        let span = handle.0.as_ptr();
        if span == self.head {
            unsafe { self.pop_front() };
            return;
        }
        if span == self.tail {
            unsafe { self.pop_back() };
            return;
        }
        unsafe {
            (*(*span).prev).next = (*span).next;
            (*(*span).next).prev = (*span).prev;
            (*span).prev = ptr::null_mut();
            (*span).next = ptr::null_mut();
        }
    }

    pub unsafe fn front(&self) -> Option<SpanHandle> {
        NonNull::new(self.head).map(SpanHandle)
    }

    /// Whether the front span has free objects left. The central cache keeps
    /// exhausted spans at the back, so a starved front span means the whole
    /// class is starved.
    pub unsafe fn front_has_free(&self) -> bool {
        match NonNull::new(self.head) {
            Some(span) => unsafe { !(*span.as_ptr()).free.is_empty() },
            None => false,
        }
    }
}
