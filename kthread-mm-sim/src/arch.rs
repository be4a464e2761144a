//! Instrumented [`MmuOps`] standing in for the hardware.
//!
//! Every hook bumps a counter and then does what the default hook does, so a
//! stress run can compare the number of barriers and switches with the
//! transitions the workers performed.

use kthread_mm::{MmStruct, MmuOps, TaskControlBlock, TaskRssStat};
use spin::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of the hook counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchStats {
    /// `switch_mm` calls with a different `prev`
    pub switches: usize,
    /// `switch_mm` calls where `prev` was `next`
    pub same_switches: usize,
    pub barriers: usize,
    pub post_lock_switches: usize,
    pub lazy_entries: usize,
    pub membarrier_updates: usize,
    pub rss_syncs: usize,
}

pub struct SimArch {
    switches: AtomicUsize,
    same_switches: AtomicUsize,
    barriers: AtomicUsize,
    post_lock_switches: AtomicUsize,
    lazy_entries: AtomicUsize,
    membarrier_updates: AtomicUsize,
    rss_syncs: AtomicUsize,
    // pid -> 该线程最后装载的页表 token，相当于它所在 CPU 的 satp
    loaded: Mutex<HashMap<usize, usize>>,
}

impl SimArch {
    pub fn new() -> Self {
        Self {
            switches: AtomicUsize::new(0),
            same_switches: AtomicUsize::new(0),
            barriers: AtomicUsize::new(0),
            post_lock_switches: AtomicUsize::new(0),
            lazy_entries: AtomicUsize::new(0),
            membarrier_updates: AtomicUsize::new(0),
            rss_syncs: AtomicUsize::new(0),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Token the task with `pid` last switched to.
    pub fn loaded_token(&self, pid: usize) -> Option<usize> {
        self.loaded.lock().get(&pid).copied()
    }

    pub fn stats(&self) -> ArchStats {
        ArchStats {
            switches: self.switches.load(Ordering::SeqCst),
            same_switches: self.same_switches.load(Ordering::SeqCst),
            barriers: self.barriers.load(Ordering::SeqCst),
            post_lock_switches: self.post_lock_switches.load(Ordering::SeqCst),
            lazy_entries: self.lazy_entries.load(Ordering::SeqCst),
            membarrier_updates: self.membarrier_updates.load(Ordering::SeqCst),
            rss_syncs: self.rss_syncs.load(Ordering::SeqCst),
        }
    }
}

impl MmuOps for SimArch {
    fn switch_mm(&self, prev: Option<&MmStruct>, next: &MmStruct, tsk: &TaskControlBlock) {
        if prev.map_or(false, |prev| std::ptr::eq(prev, next)) {
            self.same_switches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.switches.fetch_add(1, Ordering::Relaxed);
        }
        self.loaded.lock().insert(tsk.getpid(), next.token());
    }

    fn finish_arch_post_lock_switch(&self) {
        self.post_lock_switches.fetch_add(1, Ordering::Relaxed);
    }

    fn enter_lazy_tlb(&self, _mm: &MmStruct, _tsk: &TaskControlBlock) {
        self.lazy_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn membarrier_update_current_mm(&self, tsk: &TaskControlBlock, next_mm: Option<&MmStruct>) {
        self.membarrier_updates.fetch_add(1, Ordering::Relaxed);
        kthread_mm::sync::membarrier::update_current_mm(tsk, next_mm);
    }

    fn sync_mm_rss(&self, rss: &mut TaskRssStat, mm: &MmStruct) {
        self.rss_syncs.fetch_add(1, Ordering::Relaxed);
        rss.sync_into(mm);
    }

    fn smp_mb(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
        kthread_mm::sync::barrier::smp_mb();
    }
}
