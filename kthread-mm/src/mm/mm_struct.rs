//! Implementation of [`MmStruct`]

use super::MmCounter;
use crate::config::{MM_COUNT_MAX, NR_MM_COUNTERS};
use crate::sync::aref::{ARef, AlwaysRefCounted};
use crate::sync::barrier::smp_mb;
use crate::sync::membarrier::MembarrierState;
use alloc::boxed::Box;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use log::debug;

static NEXT_MM_ID: AtomicUsize = AtomicUsize::new(1);

type FreeHook = Box<dyn FnOnce(usize) + Send + Sync>;

/// An address space that kernel threads can borrow.
///
/// Always handled through [`ARef<MmStruct>`], which owns one `mm_count`
/// reference. The object is destroyed when the last reference is dropped.
pub struct MmStruct {
    id: usize,
    // 页表根的标识，相当于 satp 中的内容，由 MmuOps::switch_mm 装载
    token: usize,
    mm_count: AtomicUsize,
    rss_stat: [AtomicIsize; NR_MM_COUNTERS],
    pub(crate) membarrier_state: AtomicU32,
    free_hook: Option<FreeHook>,
}

impl MmStruct {
    /// Create an address space whose page table is identified by `token`.
    ///
    /// The returned handle holds the only reference.
    pub fn new(token: usize) -> ARef<Self> {
        Self::build(token, None)
    }

    /// Like [`MmStruct::new`], but `hook` runs with the mm id right before the
    /// object is freed.
    pub fn with_free_hook(token: usize, hook: impl FnOnce(usize) + Send + Sync + 'static) -> ARef<Self> {
        Self::build(token, Some(Box::new(hook)))
    }

    fn build(token: usize, free_hook: Option<FreeHook>) -> ARef<Self> {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicIsize = AtomicIsize::new(0);
        let mm = Box::new(MmStruct {
            id: NEXT_MM_ID.fetch_add(1, Ordering::Relaxed),
            token,
            mm_count: AtomicUsize::new(1),
            rss_stat: [ZERO; NR_MM_COUNTERS],
            membarrier_state: AtomicU32::new(0),
            free_hook,
        });
        debug!("new mm {} token {:#x}", mm.id, token);
        // SAFETY: the box is leaked into the handle, which owns the initial count.
        unsafe { ARef::from_raw(NonNull::from(Box::leak(mm))) }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn token(&self) -> usize {
        self.token
    }

    /// Current value of `mm_count`. Only a snapshot when other threads grab or drop.
    pub fn mm_count(&self) -> usize {
        self.mm_count.load(Ordering::Acquire)
    }

    /// Add `value` pages to an RSS counter.
    pub fn add_mm_counter(&self, member: MmCounter, value: isize) {
        self.rss_stat[member as usize].fetch_add(value, Ordering::Relaxed);
    }

    /// Read an RSS counter.
    ///
    /// Pending per-task deltas can make the shared counter briefly negative;
    /// such values read as zero.
    pub fn get_mm_counter(&self, member: MmCounter) -> usize {
        let val = self.rss_stat[member as usize].load(Ordering::Relaxed);
        if val < 0 {
            0
        } else {
            val as usize
        }
    }

    /// Resident pages: file, anonymous and shared memory.
    pub fn get_mm_rss(&self) -> usize {
        self.get_mm_counter(MmCounter::FilePages)
            + self.get_mm_counter(MmCounter::AnonPages)
            + self.get_mm_counter(MmCounter::ShmemPages)
    }

    pub fn membarrier_state(&self) -> MembarrierState {
        MembarrierState::from_bits_truncate(self.membarrier_state.load(Ordering::Relaxed))
    }
}

impl fmt::Debug for MmStruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmStruct")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("mm_count", &self.mm_count())
            .finish()
    }
}

// SAFETY: `mm_count` is only released through `dec_ref`, which frees the
// object exactly when the last increment goes away.
unsafe impl AlwaysRefCounted for MmStruct {
    // mmgrab
    fn inc_ref(&self) {
        let old = self.mm_count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old != 0, "mmgrab on freed mm {}", self.id);
        if old > MM_COUNT_MAX {
            panic!("mm {} mm_count overflow", self.id);
        }
    }

    // mmdrop
    unsafe fn dec_ref(obj: NonNull<Self>) {
        // SAFETY: the caller owns an increment, so the object is still alive.
        let mm = unsafe { obj.as_ref() };
        let id = mm.id;
        let old = mm.mm_count.fetch_sub(1, Ordering::Release);
        assert!(old != 0, "mm {} mm_count underflow", id);
        // 释放引用本身充当一次完整的内存屏障，use_mm 依赖于此
        smp_mb();
        if old == 1 {
            // SAFETY: that was the last reference; nobody else can reach the box.
            let mut mm = unsafe { Box::from_raw(obj.as_ptr()) };
            debug!("free mm {}", id);
            if let Some(hook) = mm.free_hook.take() {
                hook(id);
            }
        }
    }
}
