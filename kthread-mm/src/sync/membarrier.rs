//! Expedited membarrier scan.
//!
//! `membarrier` promises a caller that every thread running on a given address
//! space has gone through a full memory barrier before the call returns. The
//! expedited variants find those threads by reading each task's attached mm
//! without taking the task lock, and interrupt the matching ones.
//!
//! That lock-free read is why [`crate::KthreadMm`] issues a full barrier
//! between publishing a task's mm and touching user memory, and between the
//! last user access and clearing it.

use crate::mm::MmStruct;
use crate::sync::barrier::smp_mb;
use crate::task::TaskControlBlock;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::Mutex;

bitflags! {
    /// Membarrier registration of an address space, mirrored into the task
    /// running on it.
    pub struct MembarrierState: u32 {
        const PRIVATE_EXPEDITED_READY = 1 << 0;
        const PRIVATE_EXPEDITED = 1 << 1;
        const GLOBAL_EXPEDITED_READY = 1 << 2;
        const GLOBAL_EXPEDITED = 1 << 3;
    }
}

/// Mirror `next_mm`'s registration into `tsk`, or clear it when `tsk` no
/// longer runs on an address space.
pub fn update_current_mm(tsk: &TaskControlBlock, next_mm: Option<&MmStruct>) {
    let state = next_mm.map_or(0, |mm| mm.membarrier_state.load(Ordering::Relaxed));
    if tsk.membarrier_state.load(Ordering::Relaxed) == state {
        return;
    }
    tsk.membarrier_state.store(state, Ordering::Relaxed);
}

/// The set of tasks an expedited membarrier has to consider.
pub struct Membarrier {
    tasks: Mutex<Vec<Arc<TaskControlBlock>>>,
}

impl Membarrier {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_task(&self, tsk: Arc<TaskControlBlock>) {
        self.tasks.lock().push(tsk);
    }

    /// Remove the task with `pid`, returning it if it was registered.
    pub fn unregister_task(&self, pid: usize) -> Option<Arc<TaskControlBlock>> {
        let mut tasks = self.tasks.lock();
        let idx = tasks.iter().position(|t| t.getpid() == pid)?;
        Some(tasks.swap_remove(idx))
    }

    pub fn register_private_expedited(&self, mm: &MmStruct) {
        mm.membarrier_state.fetch_or(
            (MembarrierState::PRIVATE_EXPEDITED | MembarrierState::PRIVATE_EXPEDITED_READY).bits(),
            Ordering::SeqCst,
        );
    }

    pub fn register_global_expedited(&self, mm: &MmStruct) {
        mm.membarrier_state.fetch_or(
            (MembarrierState::GLOBAL_EXPEDITED | MembarrierState::GLOBAL_EXPEDITED_READY).bits(),
            Ordering::SeqCst,
        );
    }

    /// Signal every task currently attached to `mm`.
    ///
    /// Returns how many tasks were signalled, or `None` when `mm` has not
    /// registered for private expedited barriers.
    pub fn private_expedited(
        &self,
        mm: &MmStruct,
        mut ipi: impl FnMut(&TaskControlBlock),
    ) -> Option<usize> {
        if !mm
            .membarrier_state()
            .contains(MembarrierState::PRIVATE_EXPEDITED_READY)
        {
            return None;
        }
        // 与调用者在进入 membarrier 之前的访存排序
        smp_mb();
        let tasks = self.tasks.lock();
        let mut signalled = 0;
        for tsk in tasks.iter() {
            if tsk.is_using(mm) {
                ipi(tsk);
                signalled += 1;
            }
        }
        drop(tasks);
        smp_mb();
        Some(signalled)
    }

    /// Signal every task running on an address space registered for global
    /// expedited barriers.
    ///
    /// Kernel threads that are not borrowing an mm are skipped.
    pub fn global_expedited(&self, mut ipi: impl FnMut(&TaskControlBlock)) -> usize {
        smp_mb();
        let tasks = self.tasks.lock();
        let mut signalled = 0;
        for tsk in tasks.iter() {
            if !tsk
                .membarrier_state()
                .contains(MembarrierState::GLOBAL_EXPEDITED)
            {
                continue;
            }
            if !tsk.has_mm() {
                continue;
            }
            ipi(tsk);
            signalled += 1;
        }
        drop(tasks);
        smp_mb();
        signalled
    }
}

impl Default for Membarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::MmuOps;
    use crate::task::KthreadMm;

    struct NoSwitch;

    impl MmuOps for NoSwitch {
        fn switch_mm(&self, _prev: Option<&MmStruct>, _next: &MmStruct, _tsk: &TaskControlBlock) {}
    }

    #[test]
    fn private_expedited_needs_registration() {
        let membarrier = Membarrier::new();
        let mm = MmStruct::new(0x1000);
        assert_eq!(membarrier.private_expedited(&mm, |_| {}), None);
        membarrier.register_private_expedited(&mm);
        assert_eq!(membarrier.private_expedited(&mm, |_| {}), Some(0));
    }

    #[test]
    fn private_expedited_signals_attached_kthreads_only() {
        let kmm = KthreadMm::new(NoSwitch);
        let membarrier = Membarrier::new();
        let mm = MmStruct::new(0x1000);
        let other = MmStruct::new(0x2000);
        membarrier.register_private_expedited(&mm);
        let a = Arc::new(TaskControlBlock::new_kthread());
        let b = Arc::new(TaskControlBlock::new_kthread());
        let c = Arc::new(TaskControlBlock::new_kthread());
        membarrier.register_task(a.clone());
        membarrier.register_task(b.clone());
        membarrier.register_task(c.clone());

        kmm.use_mm(&a, &mm);
        kmm.use_mm(&b, &other);
        let mut hit = Vec::new();
        assert_eq!(membarrier.private_expedited(&mm, |t| hit.push(t.getpid())), Some(1));
        assert_eq!(hit, alloc::vec![a.getpid()]);

        // 处于 lazy 状态的线程不会再被 IPI
        kmm.unuse_mm(&a, &mm);
        assert_eq!(membarrier.private_expedited(&mm, |_| {}), Some(0));
        kmm.unuse_mm(&b, &other);
    }

    #[test]
    fn global_expedited_follows_published_state() {
        let kmm = KthreadMm::new(NoSwitch);
        let membarrier = Membarrier::new();
        let mm = MmStruct::new(0x1000);
        membarrier.register_global_expedited(&mm);
        let tsk = Arc::new(TaskControlBlock::new_kthread());
        membarrier.register_task(tsk.clone());

        assert_eq!(membarrier.global_expedited(|_| {}), 0);
        kmm.use_mm(&tsk, &mm);
        assert!(tsk
            .membarrier_state()
            .contains(MembarrierState::GLOBAL_EXPEDITED));
        assert_eq!(membarrier.global_expedited(|_| {}), 1);
        kmm.unuse_mm(&tsk, &mm);
        assert!(tsk.membarrier_state().is_empty());
        assert_eq!(membarrier.global_expedited(|_| {}), 0);
    }

    #[test]
    fn unregister_drops_task() {
        let membarrier = Membarrier::new();
        let tsk = Arc::new(TaskControlBlock::new_kthread());
        let pid = tsk.getpid();
        membarrier.register_task(tsk);
        assert!(membarrier.unregister_task(pid).is_some());
        assert!(membarrier.unregister_task(pid).is_none());
    }
}
