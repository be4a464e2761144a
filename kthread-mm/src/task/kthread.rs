//! Kernel threads taking on a user address space.
//!
//! Barrier placement: the membarrier scan reads a task's `mm` without the
//! task lock. After a kernel thread publishes `mm` it must execute a full
//! barrier before touching user memory, and before it clears `mm` it must
//! execute a full barrier after its last user access. Otherwise a concurrent
//! scan can miss the thread, skip its IPI, and let a user access escape the
//! ordering the membarrier caller asked for.

use super::TaskControlBlock;
use crate::arch::MmuOps;
use crate::mm::MmStruct;
use crate::sync::aref::ARef;
use log::{debug, trace};

/// Attaches kernel threads to address spaces through the hooks of `A`.
pub struct KthreadMm<A: MmuOps> {
    arch: A,
}

impl<A: MmuOps> KthreadMm<A> {
    pub fn new(arch: A) -> Self {
        Self { arch }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Make the kernel thread `tsk` take on the address space `mm`.
    ///
    /// The caller must keep `mm` alive for the duration of the call; `tsk`
    /// takes its own reference unless it already holds `mm` as `active_mm`.
    pub fn use_mm(&self, tsk: &TaskControlBlock, mm: &MmStruct) {
        debug_assert!(tsk.is_kthread(), "use_mm from user task {}", tsk.getpid());
        let mut inner = tsk.inner_exclusive_access();
        if tsk.has_mm() && !tsk.is_using(mm) {
            // 未经 unuse_mm 直接换到另一个 mm：攒下的统计属于旧的 mm，先刷回去
            let inner = &mut *inner;
            if let Some(attached) = inner.active_mm.as_deref() {
                self.arch.sync_mm_rss(&mut inner.rss_stat, attached);
            }
        }
        let reuse = inner
            .active_mm
            .as_ref()
            .map_or(false, |active| ARef::is(active, mm));
        // 先拿到 mm 的引用计数，再让 active_mm 指向它；旧的 active_mm 留到解锁之后再释放
        let stale = if reuse {
            trace!("task {} reuses lazy mm {}", tsk.getpid(), mm.id());
            None
        } else {
            inner.active_mm.replace(ARef::from(mm))
        };
        tsk.publish_mm(&inner, Some(mm));
        self.arch.membarrier_update_current_mm(tsk, Some(mm));
        let prev = if reuse { Some(mm) } else { stale.as_deref() };
        self.arch.switch_mm(prev, mm, tsk);
        drop(inner);
        self.arch.finish_arch_post_lock_switch();
        debug!(
            "task {} use mm {} (prev {:?})",
            tsk.getpid(),
            mm.id(),
            stale.as_deref().map(MmStruct::id)
        );

        // mmdrop 本身已隐含一次完整屏障，这里仍然无条件地显式执行 smp_mb
        drop(stale);
        self.arch.smp_mb();
    }

    /// Reverse [`KthreadMm::use_mm`]: `tsk` stops using `mm` for user accesses
    /// but keeps it as its lazy `active_mm`.
    ///
    /// `tsk` must currently be attached to `mm`.
    pub fn unuse_mm(&self, tsk: &TaskControlBlock, mm: &MmStruct) {
        debug_assert!(tsk.is_kthread(), "unuse_mm from user task {}", tsk.getpid());
        let mut inner = tsk.inner_exclusive_access();
        debug_assert!(
            tsk.is_using(mm),
            "task {} unuse_mm on mm {} it is not using",
            tsk.getpid(),
            mm.id()
        );
        // smp_mb__after_spinlock
        self.arch.smp_mb();
        self.arch.sync_mm_rss(&mut inner.rss_stat, mm);
        tsk.publish_mm(&inner, None);
        self.arch.membarrier_update_current_mm(tsk, None);
        // active_mm is still `mm`
        self.arch.enter_lazy_tlb(mm, tsk);
        drop(inner);
        debug!("task {} unuse mm {}", tsk.getpid(), mm.id());
    }

    /// Attach `tsk` to `mm` until the returned guard is dropped.
    pub fn borrow<'a>(&'a self, tsk: &'a TaskControlBlock, mm: &'a MmStruct) -> MmBorrowGuard<'a, A> {
        self.use_mm(tsk, mm);
        MmBorrowGuard { kmm: self, tsk, mm }
    }
}

/// Scoped attachment created by [`KthreadMm::borrow`].
///
/// # Invariants
///
/// `tsk` is attached to `mm` for as long as the guard lives.
pub struct MmBorrowGuard<'a, A: MmuOps> {
    kmm: &'a KthreadMm<A>,
    tsk: &'a TaskControlBlock,
    mm: &'a MmStruct,
}

impl<A: MmuOps> MmBorrowGuard<'_, A> {
    pub fn mm(&self) -> &MmStruct {
        self.mm
    }

    pub fn task(&self) -> &TaskControlBlock {
        self.tsk
    }
}

impl<A: MmuOps> Drop for MmBorrowGuard<'_, A> {
    fn drop(&mut self) {
        self.kmm.unuse_mm(self.tsk, self.mm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{MmCounter, TaskRssStat};
    use crate::sync::membarrier::{self, Membarrier, MembarrierState};
    use crate::task::TaskFlags;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        SwitchMm { prev: Option<usize>, next: usize },
        PostLockSwitch,
        LazyTlb(usize),
        Membarrier(Option<usize>),
        SyncRss(usize),
        Mb,
    }

    /// Records every hook call, forwarding to the default behaviour.
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<Event> {
            core::mem::take(&mut *self.events.lock())
        }

        fn push(&self, ev: Event) {
            self.events.lock().push(ev);
        }
    }

    impl MmuOps for Recorder {
        fn switch_mm(&self, prev: Option<&MmStruct>, next: &MmStruct, _tsk: &TaskControlBlock) {
            self.push(Event::SwitchMm {
                prev: prev.map(MmStruct::id),
                next: next.id(),
            });
        }

        fn finish_arch_post_lock_switch(&self) {
            self.push(Event::PostLockSwitch);
        }

        fn enter_lazy_tlb(&self, mm: &MmStruct, _tsk: &TaskControlBlock) {
            self.push(Event::LazyTlb(mm.id()));
        }

        fn membarrier_update_current_mm(&self, tsk: &TaskControlBlock, next_mm: Option<&MmStruct>) {
            self.push(Event::Membarrier(next_mm.map(MmStruct::id)));
            membarrier::update_current_mm(tsk, next_mm);
        }

        fn sync_mm_rss(&self, rss: &mut TaskRssStat, mm: &MmStruct) {
            self.push(Event::SyncRss(mm.id()));
            rss.sync_into(mm);
        }

        fn smp_mb(&self) {
            self.push(Event::Mb);
            crate::sync::barrier::smp_mb();
        }
    }

    fn setup() -> (KthreadMm<Recorder>, TaskControlBlock) {
        (KthreadMm::new(Recorder::new()), TaskControlBlock::new_kthread())
    }

    #[test]
    fn use_mm_takes_one_reference() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        kmm.use_mm(&tsk, &a);
        assert!(tsk.is_using(&a));
        assert_eq!(tsk.active_mm_id(), Some(a.id()));
        assert_eq!(a.mm_count(), 2);
        assert_eq!(
            kmm.arch().take(),
            alloc::vec![
                Event::Membarrier(Some(a.id())),
                Event::SwitchMm { prev: None, next: a.id() },
                Event::PostLockSwitch,
                Event::Mb,
            ]
        );
        kmm.unuse_mm(&tsk, &a);
    }

    #[test]
    fn use_mm_twice_keeps_count() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        kmm.use_mm(&tsk, &a);
        kmm.arch().take();
        kmm.use_mm(&tsk, &a);
        assert_eq!(a.mm_count(), 2);
        let events = kmm.arch().take();
        assert!(events.contains(&Event::SwitchMm {
            prev: Some(a.id()),
            next: a.id()
        }));
        kmm.unuse_mm(&tsk, &a);
    }

    #[test]
    fn unuse_mm_enters_lazy_state() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        kmm.use_mm(&tsk, &a);
        kmm.arch().take();
        kmm.unuse_mm(&tsk, &a);
        assert!(!tsk.has_mm());
        assert_eq!(tsk.active_mm_id(), Some(a.id()));
        assert_eq!(a.mm_count(), 2);
        assert_eq!(
            kmm.arch().take(),
            alloc::vec![
                Event::Mb,
                Event::SyncRss(a.id()),
                Event::Membarrier(None),
                Event::LazyTlb(a.id()),
            ]
        );
    }

    #[test]
    fn reuse_lazy_mm_without_grab() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        kmm.use_mm(&tsk, &a);
        kmm.unuse_mm(&tsk, &a);
        kmm.arch().take();
        kmm.use_mm(&tsk, &a);
        assert_eq!(a.mm_count(), 2);
        let switches: Vec<_> = kmm
            .arch()
            .take()
            .into_iter()
            .filter(|ev| matches!(ev, Event::SwitchMm { .. }))
            .collect();
        assert_eq!(
            switches,
            alloc::vec![Event::SwitchMm {
                prev: Some(a.id()),
                next: a.id()
            }]
        );
        kmm.unuse_mm(&tsk, &a);
    }

    #[test]
    fn switching_mm_drops_lazy_reference() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        let b = MmStruct::new(0xb000);
        kmm.use_mm(&tsk, &a);
        kmm.unuse_mm(&tsk, &a);
        kmm.arch().take();
        kmm.use_mm(&tsk, &b);
        assert_eq!(a.mm_count(), 1);
        assert_eq!(b.mm_count(), 2);
        assert!(tsk.is_using(&b));
        assert_eq!(tsk.active_mm_id(), Some(b.id()));
        assert!(kmm.arch().take().contains(&Event::SwitchMm {
            prev: Some(a.id()),
            next: b.id()
        }));
        kmm.unuse_mm(&tsk, &b);
    }

    #[test]
    fn lazy_reference_keeps_mm_alive() {
        let (kmm, tsk) = setup();
        let freed = Arc::new(AtomicBool::new(false));
        let hook_freed = freed.clone();
        let a = MmStruct::with_free_hook(0xa000, move |_| hook_freed.store(true, Ordering::SeqCst));
        let b = MmStruct::new(0xb000);
        kmm.use_mm(&tsk, &a);
        kmm.unuse_mm(&tsk, &a);
        drop(a);
        // 只剩 kthread 的 lazy 引用
        assert!(!freed.load(Ordering::SeqCst));
        kmm.use_mm(&tsk, &b);
        assert!(freed.load(Ordering::SeqCst));
        kmm.unuse_mm(&tsk, &b);
    }

    #[test]
    fn count_tracks_retained_reference() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        let b = MmStruct::new(0xb000);
        fn held(mm: &MmStruct) -> usize {
            mm.mm_count() - 1
        }
        for (mm, other) in [(&a, &b), (&b, &a), (&b, &a), (&a, &b)] {
            kmm.use_mm(&tsk, mm);
            assert_eq!(held(mm), 1);
            assert_eq!(held(other), 0);
            kmm.unuse_mm(&tsk, mm);
            assert_eq!(held(mm), 1);
            assert_eq!(held(other), 0);
        }
        drop(tsk);
        assert_eq!(held(&a), 0);
        assert_eq!(held(&b), 0);
    }

    #[test]
    fn full_barrier_on_every_transition() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        let b = MmStruct::new(0xb000);
        let mut transitions = 0;
        for mm in [&a, &a, &b, &a, &b, &b] {
            kmm.use_mm(&tsk, mm);
            kmm.unuse_mm(&tsk, mm);
            transitions += 2;
        }
        let events = kmm.arch().take();
        let barriers = events.iter().filter(|ev| **ev == Event::Mb).count();
        assert_eq!(barriers, transitions);

        // attach：屏障在发布之后；detach：屏障在统计刷新与清除 mm 之前
        for (i, ev) in events.iter().enumerate() {
            match ev {
                Event::Membarrier(Some(_)) => assert!(events[i..].contains(&Event::Mb)),
                Event::SyncRss(_) => assert_eq!(events[i - 1], Event::Mb),
                _ => {}
            }
        }
    }

    #[test]
    fn detach_flushes_pending_rss() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        kmm.use_mm(&tsk, &a);
        tsk.add_mm_counter_fast(&a, MmCounter::AnonPages, 5);
        tsk.add_mm_counter_fast(&a, MmCounter::FilePages, 2);
        assert_eq!(a.get_mm_rss(), 0);
        kmm.unuse_mm(&tsk, &a);
        assert_eq!(a.get_mm_counter(MmCounter::AnonPages), 5);
        assert_eq!(a.get_mm_counter(MmCounter::FilePages), 2);
        assert!(tsk.inner_exclusive_access().rss_stat().is_empty());
    }

    #[test]
    fn borrow_guard_detaches_on_drop() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        {
            let guard = kmm.borrow(&tsk, &a);
            assert!(guard.task().is_using(guard.mm()));
        }
        assert!(!tsk.has_mm());
        assert_eq!(tsk.active_mm_id(), Some(a.id()));
    }

    #[test]
    fn membarrier_state_follows_attachment() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        Membarrier::new().register_private_expedited(&a);
        kmm.use_mm(&tsk, &a);
        assert!(tsk
            .membarrier_state()
            .contains(MembarrierState::PRIVATE_EXPEDITED));
        kmm.unuse_mm(&tsk, &a);
        assert!(tsk.membarrier_state().is_empty());
    }

    #[test]
    fn attach_elsewhere_returns_pending_rss() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        let b = MmStruct::new(0xb000);
        kmm.use_mm(&tsk, &a);
        tsk.add_mm_counter_fast(&a, MmCounter::AnonPages, 5);
        kmm.arch().take();
        kmm.use_mm(&tsk, &b);
        assert_eq!(a.get_mm_counter(MmCounter::AnonPages), 5);
        assert!(tsk.inner_exclusive_access().rss_stat().is_empty());
        assert!(kmm.arch().take().contains(&Event::SyncRss(a.id())));
        tsk.add_mm_counter_fast(&b, MmCounter::AnonPages, 2);
        kmm.unuse_mm(&tsk, &b);
        assert_eq!(a.get_mm_counter(MmCounter::AnonPages), 5);
        assert_eq!(b.get_mm_counter(MmCounter::AnonPages), 2);
        assert_eq!(a.mm_count(), 1);
        assert_eq!(b.mm_count(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not using")]
    fn unuse_mm_requires_attachment() {
        let (kmm, tsk) = setup();
        let a = MmStruct::new(0xa000);
        kmm.unuse_mm(&tsk, &a);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "use_mm from user task")]
    fn use_mm_requires_kthread() {
        let kmm = KthreadMm::new(Recorder::new());
        let tsk = TaskControlBlock::new(TaskFlags::empty());
        let a = MmStruct::new(0xa000);
        kmm.use_mm(&tsk, &a);
    }

    #[test]
    fn concurrent_kthreads_share_one_mm() {
        const THREADS: usize = 8;
        let kmm = KthreadMm::new(Recorder::new());
        let shared = MmStruct::new(0x5000);
        let tasks: Vec<_> = (0..THREADS).map(|_| TaskControlBlock::new_kthread()).collect();
        let privates: Vec<_> = (0..THREADS).map(|i| MmStruct::new(0x6000 + i)).collect();
        std::thread::scope(|s| {
            for (i, (tsk, own)) in tasks.iter().zip(privates.iter()).enumerate() {
                let kmm = &kmm;
                let shared = &shared;
                s.spawn(move || {
                    for round in 0..500 {
                        let mm: &MmStruct = if (round + i) % 3 == 0 { own } else { shared };
                        kmm.use_mm(tsk, mm);
                        tsk.add_mm_counter_fast(mm, MmCounter::AnonPages, 1);
                        kmm.unuse_mm(tsk, mm);
                    }
                });
            }
        });
        let holders = tasks
            .iter()
            .filter(|t| t.active_mm_id() == Some(shared.id()))
            .count();
        assert_eq!(shared.mm_count(), 1 + holders);
        for (tsk, own) in tasks.iter().zip(privates.iter()) {
            let held = usize::from(tsk.active_mm_id() == Some(own.id()));
            assert_eq!(own.mm_count(), 1 + held);
        }
        let total: usize = privates
            .iter()
            .map(|mm| mm.get_mm_counter(MmCounter::AnonPages))
            .sum::<usize>()
            + shared.get_mm_counter(MmCounter::AnonPages);
        assert_eq!(total, THREADS * 500);
        drop(tasks);
        assert_eq!(shared.mm_count(), 1);
    }
}
