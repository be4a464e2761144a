//! Memory barriers.
//!
//! With the `smp` feature disabled there is only one processor to order
//! against, so the barriers only have to stop the compiler from reordering.

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// A compiler barrier.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// A full memory barrier.
///
/// Orders every load and store before the barrier against every load and
/// store after it, as observed from any processor.
#[inline(always)]
pub fn smp_mb() {
    if cfg!(feature = "smp") {
        fence(Ordering::SeqCst);
    } else {
        barrier();
    }
}
