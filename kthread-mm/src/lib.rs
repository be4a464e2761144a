//! Kernel threads borrowing user address spaces.
//!
//! A kernel thread has no address space of its own. When it has to touch user
//! memory on behalf of some process it temporarily takes on that process's
//! [`MmStruct`] with [`KthreadMm::use_mm`] and gives it back with
//! [`KthreadMm::unuse_mm`]. The hardware side of the switch and the other
//! architecture hooks are supplied through the [`MmuOps`] trait.
//!
//! The address space a thread is *attached* to is published through an atomic
//! pointer so that the membarrier scan in [`sync::membarrier`] can read it from
//! other processors without taking the thread's lock.
#![no_std]

extern crate alloc;

#[macro_use]
extern crate bitflags;

#[cfg(test)]
extern crate std;

mod arch;
pub mod config;
pub mod mm;
pub mod sync;
pub mod task;

pub use arch::MmuOps;
pub use mm::{MmCounter, MmStruct, TaskRssStat};
pub use sync::aref::{ARef, AlwaysRefCounted};
pub use sync::membarrier::{Membarrier, MembarrierState};
pub use task::{KthreadMm, MmBorrowGuard, TaskControlBlock, TaskFlags};
