//! Task management for kernel threads
//!
//! A [`TaskControlBlock`] here describes a kernel thread: it has a pid, a
//! lock protecting its mutable state, and the two address-space fields that
//! [`KthreadMm`] maintains:
//!
//! - `mm`, the address space the thread is attached to for user accesses,
//!   published so it can be read without the lock;
//! - `active_mm`, the counted reference the thread keeps on the address space
//!   whose translations it last loaded, kept across detach for lazy reuse.

mod kthread;
mod pid;

#[allow(clippy::module_inception)]
mod task;

pub use kthread::{KthreadMm, MmBorrowGuard};
pub use pid::{pid_alloc, PidAllocator, PidHandle};
pub use task::{TaskControlBlock, TaskControlBlockInner, TaskFlags};
