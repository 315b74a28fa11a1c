//! Intrusive object free lists.
//!
//! A freed object stores the address of the next free object in its own
//! first machine word; objects in use store nothing. This module is the one
//! place that casts user memory to and from [`FreeObject`] links — every
//! other module manipulates opaque [`ObjectList`] and [`Batch`] values and
//! stays free of pointer arithmetic.
//!
//! Invariant carried by both types: a chain of `count` nodes is linked
//! `head -> .. -> tail`, the tail's link is null, and every node points at
//! least `size_of::<FreeObject>()` bytes of memory that no caller is using.
//! The invariant is established by the `unsafe` entry points ([`carve`],
//! [`ObjectList::push`]) and preserved by everything else.

use core::mem::size_of;
use core::ptr::{self, NonNull};

/// Link stored in the first word of a free object.
#[repr(C)]
pub struct FreeObject {
    next: *mut FreeObject,
}

/// A detached chain of free objects of one size class: `[head, tail]` plus
/// the node count. Produced when splitting a list, consumed by splicing into
/// another list, always in O(1).
pub struct Batch {
    head: NonNull<FreeObject>,
    tail: NonNull<FreeObject>,
    count: usize,
}

impl Batch {
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Address of the first object in the chain.
    #[inline]
    pub fn head(&self) -> NonNull<u8> {
        self.head.cast()
    }

    /// Detach the first object, returning it and the remainder of the chain.
    pub fn split_first(self) -> (NonNull<u8>, Option<Batch>) {
        let first = self.head;
        if self.count == 1 {
            return (first.cast(), None);
        }
        // Chain invariant: count > 1 implies a non-null second node.
        let next = unsafe { NonNull::new_unchecked((*first.as_ptr()).next) };
        let rest = Batch {
            head: next,
            tail: self.tail,
            count: self.count - 1,
        };
        (first.cast(), Some(rest))
    }

    /// Iterate the chain front to back, consuming it. Each link is read
    /// before its object is yielded, so the consumer may immediately reuse
    /// the object's memory (including its link word).
    pub fn drain(self) -> Drain {
        Drain {
            cur: self.head.as_ptr(),
            remaining: self.count,
        }
    }
}

pub struct Drain {
    cur: *mut FreeObject,
    remaining: usize,
}

impl Iterator for Drain {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        let obj = NonNull::new(self.cur)?;
        self.cur = unsafe { (*obj.as_ptr()).next };
        self.remaining -= 1;
        Some(obj.cast())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// An intrusive singly-linked free list with a tracked length.
///
/// Used both as a thread cache's per-class list and as the free-object list
/// inside a carved span.
pub struct ObjectList {
    head: *mut FreeObject,
    len: usize,
}

impl ObjectList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push one object onto the front of the list.
    ///
    /// # Safety
    ///
    /// `obj` must point to at least `size_of::<FreeObject>()` bytes of
    /// memory that is not in use by any caller and is not already on a free
    /// list. The list takes logical ownership of the memory until the
    /// object is popped again.
    #[inline]
    pub unsafe fn push(&mut self, obj: NonNull<u8>) {
        let obj = obj.cast::<FreeObject>().as_ptr();
        unsafe { (*obj).next = self.head };
        self.head = obj;
        self.len += 1;
    }

    /// Pop one object off the front of the list.
    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let obj = NonNull::new(self.head)?;
        self.head = unsafe { (*obj.as_ptr()).next };
        self.len -= 1;
        Some(obj.cast())
    }

    /// Splice a whole batch onto the front of the list in O(1).
    pub fn push_batch(&mut self, batch: Batch) {
        unsafe { (*batch.tail.as_ptr()).next = self.head };
        self.head = batch.head.as_ptr();
        self.len += batch.count;
    }

    /// Detach up to `max` objects from the front of the list.
    ///
    /// Returns `None` when the list is empty or `max` is zero. O(batch) for
    /// the walk to the split point.
    pub fn split_off(&mut self, max: usize) -> Option<Batch> {
        let take = max.min(self.len);
        if take == 0 {
            return None;
        }
        let head = NonNull::new(self.head)?;
        let mut tail = head;
        for _ in 1..take {
            // Tracked length guarantees `take` reachable nodes.
            tail = unsafe { NonNull::new_unchecked((*tail.as_ptr()).next) };
        }
        self.head = unsafe { (*tail.as_ptr()).next };
        unsafe { (*tail.as_ptr()).next = ptr::null_mut() };
        self.len -= take;
        Some(Batch { head, tail, count: take })
    }
}

/// Carve `bytes` of raw memory at `base` into a free list of contiguous
/// `obj_size`-byte objects. Object `i`'s link points at object `i + 1`; the
/// last link is null. Trailing bytes that do not fit a whole object are
/// left unused.
///
/// # Safety
///
/// `base` must point to at least `bytes` bytes of writable memory that no
/// caller is using, and `obj_size` must be at least one machine word.
pub unsafe fn carve(base: NonNull<u8>, bytes: usize, obj_size: usize) -> ObjectList {
    debug_assert!(obj_size >= size_of::<FreeObject>());
    let count = bytes / obj_size;
    debug_assert!(count > 0);
    let base = base.as_ptr();
    for i in 0..count {
        let obj = unsafe { base.add(i * obj_size) } as *mut FreeObject;
        let next = if i + 1 == count {
            ptr::null_mut()
        } else {
            (unsafe { base.add((i + 1) * obj_size) }) as *mut FreeObject
        };
        unsafe { (*obj).next = next };
    }
    ObjectList {
        head: base as *mut FreeObject,
        len: count,
    }
}
