//! Address spaces as seen by kernel threads
//!
//! The page tables behind an address space are owned elsewhere; an
//! [`MmStruct`] here only carries what borrowing needs: the `mm_count`
//! reference count, the translation `token` handed to [`crate::MmuOps`], the
//! RSS counters that borrowers flush into, and the membarrier registration.

mod mm_struct;
mod rss;

pub use mm_struct::MmStruct;
pub use rss::{MmCounter, TaskRssStat};
