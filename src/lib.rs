//! tcpool: a three-tier, size-class-based memory pool.
//!
//! Architecture (front to back):
//! - Thread caches (fast path, no locks, one per thread)
//! - Central cache (per-size-class locking, brokers object batches)
//! - Page cache (span management, OS interface, one per pool)
//!
//! The pool hands out raw, untyped byte ranges. It is an explicit service
//! with its own `allocate`/`deallocate` entry points, not a `GlobalAlloc`
//! replacement.
//!
//! # Usage
//!
//! ```ignore
//! let pool = tcpool::MemoryPool::new(tcpool::PoolConfig::default());
//! let ptr = pool.allocate(64)?;
//! unsafe { pool.deallocate(ptr, 64) };
//! ```

pub mod central_cache;
pub mod error;
pub mod object;
pub mod page_cache;
pub mod pool;
pub mod size_class;
pub mod span;
pub mod thread_cache;

/// Pages are 4 KiB; page ids are addresses shifted right by this.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest span the page cache tracks, in pages. Requests above
/// `NPAGES * PAGE_SIZE` bytes cannot be served.
pub const NPAGES: usize = 128;

/// Largest single allocation the pool can represent (512 KiB).
pub const MAX_SPAN_BYTES: usize = NPAGES * PAGE_SIZE;

// Re-export the public surface at crate root for convenience
pub use error::AllocError;
pub use page_cache::{HeapSource, SystemHeap};
pub use pool::{MemoryPool, PoolConfig, PoolStats};
pub use thread_cache::ThreadCache;
