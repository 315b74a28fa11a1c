//! Size class table and lookup functions.
//!
//! Objects are bucketed into size classes to reduce fragmentation and enable
//! free list management. Classes are laid out in four alignment bands
//! covering sizes from 8 bytes up to 64 KiB:
//!
//! | size range      | granularity | class indices |
//! |-----------------|-------------|---------------|
//! | 1..=128         | 8 B         | 0..=15        |
//! | 129..=1024      | 16 B        | 16..=71       |
//! | 1025..=8192     | 128 B       | 72..=127      |
//! | 8193..=65536    | 1024 B      | 128..=183     |
//!
//! Sizes above [`MAX_CENTRAL_BYTES`] bypass the central cache and are served
//! as whole page-cache spans. All functions here are pure and callable from
//! any thread without synchronization.

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Number of size classes (and of central-cache lists / thread-cache lists).
pub const NUM_SIZE_CLASSES: usize = 184;

/// Largest object size served through size classes (64 KiB). Anything larger
/// is carved directly out of the page cache.
pub const MAX_CENTRAL_BYTES: usize = 65536;

/// Bounds on the number of objects moved per central/thread-cache transfer.
pub const MAX_BATCH: usize = 512;
pub const MIN_BATCH: usize = 2;

/// Round a requested size up to its allocation size.
///
/// Sizes within the size-class range round to the band granularity; sizes
/// above it round to a whole number of pages. `size` must be nonzero.
#[inline]
pub fn round_up(size: usize) -> usize {
    debug_assert!(size > 0);
    if size <= 128 {
        (size + 7) & !7
    } else if size <= 1024 {
        (size + 15) & !15
    } else if size <= 8192 {
        (size + 127) & !127
    } else if size <= MAX_CENTRAL_BYTES {
        (size + 1023) & !1023
    } else {
        (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }
}

/// Map an object size in `1..=MAX_CENTRAL_BYTES` to its dense class index
/// in `0..NUM_SIZE_CLASSES`.
#[inline]
pub fn class_index(size: usize) -> usize {
    debug_assert!(size > 0 && size <= MAX_CENTRAL_BYTES);
    if size <= 128 {
        (size - 1) >> 3
    } else if size <= 1024 {
        16 + ((size - 129) >> 4)
    } else if size <= 8192 {
        72 + ((size - 1025) >> 7)
    } else {
        128 + ((size - 8193) >> 10)
    }
}

/// Number of objects transferred between the central cache and a thread
/// cache per refill or trim: `clamp(65536 / size, 2, 512)`.
///
/// Small objects move in big batches to amortize the class lock; big objects
/// move in pairs so idle per-thread memory stays bounded.
#[inline]
pub fn batch_size(obj_size: usize) -> usize {
    debug_assert!(obj_size > 0);
    (MAX_CENTRAL_BYTES / obj_size).clamp(MIN_BATCH, MAX_BATCH)
}

/// Number of pages the central cache requests from the page cache when it
/// needs a fresh span for `obj_size`: enough to hold one full batch.
#[inline]
pub fn pages_for_batch(obj_size: usize) -> usize {
    (obj_size * batch_size(obj_size) + PAGE_SIZE - 1) >> PAGE_SHIFT
}
