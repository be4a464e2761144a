//! Synchronization primitives: barriers, refcounted handles and membarrier.

pub mod aref;
pub mod barrier;
pub mod membarrier;
