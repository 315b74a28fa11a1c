//! Allocation failures reported to callers.
//!
//! Only request-shape and heap-exhaustion failures are reported. Contract
//! violations (freeing with a mismatched size, freeing a foreign pointer,
//! double free) are undefined behavior, documented on the `deallocate`
//! entry points.

use crate::MAX_SPAN_BYTES;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Zero-sized requests are rejected rather than rounded up.
    #[error("zero-sized allocation request")]
    ZeroSize,

    /// The request exceeds the largest span the page cache can represent
    /// ([`MAX_SPAN_BYTES`] bytes).
    #[error("requested {size} bytes exceeds the {max}-byte span ceiling")]
    OversizedRequest { size: usize, max: usize },

    /// The operating system refused to grow the heap. Fatal to this request
    /// only; the pool remains usable.
    #[error("heap growth failed: backing store exhausted")]
    HeapExhausted,
}

impl AllocError {
    pub(crate) fn oversized(size: usize) -> Self {
        AllocError::OversizedRequest {
            size,
            max: MAX_SPAN_BYTES,
        }
    }
}
