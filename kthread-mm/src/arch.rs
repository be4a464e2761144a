//! Architecture hooks used while a kernel thread switches address spaces.

use crate::mm::{MmStruct, TaskRssStat};
use crate::sync::{barrier, membarrier};
use crate::task::TaskControlBlock;

/// Operations [`crate::KthreadMm`] delegates to the architecture and to the
/// neighbouring subsystems.
///
/// Only [`MmuOps::switch_mm`] has to be provided. Every other hook defaults to
/// what a generic SMP platform does, so test doubles can override exactly the
/// calls they want to observe.
pub trait MmuOps {
    /// Load the translation state of `next` for `tsk`.
    ///
    /// Called with the task lock held. `prev` is the address space `tsk` was
    /// previously running on; it is `next` itself when nothing changes, in
    /// which case the switch may be skipped.
    fn switch_mm(&self, prev: Option<&MmStruct>, next: &MmStruct, tsk: &TaskControlBlock);

    /// Completion step some platforms need after [`MmuOps::switch_mm`].
    ///
    /// Runs after the task lock is released and before user memory is touched.
    fn finish_arch_post_lock_switch(&self) {}

    /// `tsk` stops translating through `mm` but keeps it as its lazy `active_mm`.
    fn enter_lazy_tlb(&self, _mm: &MmStruct, _tsk: &TaskControlBlock) {}

    /// Publish the address space `tsk` now runs on to the membarrier subsystem.
    ///
    /// Called with the task lock held.
    fn membarrier_update_current_mm(&self, tsk: &TaskControlBlock, next_mm: Option<&MmStruct>) {
        membarrier::update_current_mm(tsk, next_mm);
    }

    /// Flush the task's pending RSS counters into `mm`.
    ///
    /// Called with the task lock held while `tsk` is still attached to `mm`.
    fn sync_mm_rss(&self, rss: &mut TaskRssStat, mm: &MmStruct) {
        rss.sync_into(mm);
    }

    /// Full memory barrier.
    fn smp_mb(&self) {
        barrier::smp_mb();
    }
}
