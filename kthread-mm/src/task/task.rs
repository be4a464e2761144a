//!Implementation of [`TaskControlBlock`]
use super::{pid_alloc, PidHandle};
use crate::mm::{MmCounter, MmStruct, TaskRssStat};
use crate::sync::aref::ARef;
use crate::sync::membarrier::MembarrierState;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use log::{debug, warn};
use spin::{Mutex, MutexGuard};

bitflags! {
    /// Per-task flags fixed at creation.
    pub struct TaskFlags: u32 {
        /// the task is a kernel thread and has no address space of its own
        const KTHREAD = 1 << 21;
    }
}

pub struct TaskControlBlock {
    // 在初始化之后就不再变化的元数据
    // immutable
    pub pid: PidHandle,
    pub flags: TaskFlags,
    // 其他处理器上的 membarrier 扫描不持锁读取 mm，所以用原子指针发布；只在持有 inner 锁时写入
    mm: AtomicPtr<MmStruct>,
    pub(crate) membarrier_state: AtomicU32,
    // mutable
    inner: Mutex<TaskControlBlockInner>,
}

/// State guarded by the task lock.
pub struct TaskControlBlockInner {
    // 持有一份 mm_count 引用；线程 detach 之后仍然保留，供下一次 use_mm 复用
    pub(crate) active_mm: Option<ARef<MmStruct>>,
    pub(crate) rss_stat: TaskRssStat,
}

impl TaskControlBlockInner {
    /// The address space whose translations the task last loaded.
    pub fn active_mm(&self) -> Option<&MmStruct> {
        self.active_mm.as_deref()
    }

    pub fn rss_stat(&self) -> &TaskRssStat {
        &self.rss_stat
    }
}

impl TaskControlBlock {
    pub fn new(flags: TaskFlags) -> Self {
        Self {
            pid: pid_alloc(),
            flags,
            mm: AtomicPtr::new(ptr::null_mut()),
            membarrier_state: AtomicU32::new(0),
            inner: Mutex::new(TaskControlBlockInner {
                active_mm: None,
                rss_stat: TaskRssStat::new(),
            }),
        }
    }

    pub fn new_kthread() -> Self {
        Self::new(TaskFlags::KTHREAD)
    }

    pub fn getpid(&self) -> usize {
        self.pid.0
    }

    pub fn is_kthread(&self) -> bool {
        self.flags.contains(TaskFlags::KTHREAD)
    }

    /// Take the task lock.
    pub fn inner_exclusive_access(&self) -> MutexGuard<'_, TaskControlBlockInner> {
        self.inner.lock()
    }

    /// The address space the task is attached to, read without the task lock.
    ///
    /// Only the pointer value is meaningful to such readers; the mm may be
    /// detached and freed right after the load.
    pub fn mm(&self) -> Option<NonNull<MmStruct>> {
        NonNull::new(self.mm.load(Ordering::Acquire))
    }

    pub fn has_mm(&self) -> bool {
        self.mm().is_some()
    }

    /// Whether the task is attached to `mm`, read without the task lock.
    pub fn is_using(&self, mm: &MmStruct) -> bool {
        ptr::eq(self.mm.load(Ordering::Acquire), mm)
    }

    /// Publish the attached address space.
    ///
    /// `locked` is the task's own inner state: the store must happen with the
    /// task lock held.
    pub(crate) fn publish_mm(&self, locked: &TaskControlBlockInner, mm: Option<&MmStruct>) {
        debug_assert!(
            self.inner.is_locked() && self.owns_inner(locked),
            "publish_mm without the lock of task {}",
            self.pid.0
        );
        let raw = mm.map_or(ptr::null_mut(), |mm| mm as *const MmStruct as *mut MmStruct);
        self.mm.store(raw, Ordering::Release);
    }

    // inner 数据就在 self.inner 这把锁里面，按地址范围判断
    fn owns_inner(&self, inner: &TaskControlBlockInner) -> bool {
        let start = &self.inner as *const Mutex<TaskControlBlockInner> as usize;
        let end = start + core::mem::size_of::<Mutex<TaskControlBlockInner>>();
        let addr = inner as *const TaskControlBlockInner as usize;
        addr >= start && addr + core::mem::size_of::<TaskControlBlockInner>() <= end
    }

    /// Registration state published by the last attach or detach.
    pub fn membarrier_state(&self) -> MembarrierState {
        MembarrierState::from_bits_truncate(self.membarrier_state.load(Ordering::Relaxed))
    }

    /// Id of the lazily kept `active_mm`, if any.
    pub fn active_mm_id(&self) -> Option<usize> {
        self.inner_exclusive_access().active_mm().map(MmStruct::id)
    }

    /// Account `value` pages to `mm`.
    ///
    /// While the task is attached to `mm` the delta is kept in the task and
    /// folded in on detach, or earlier once enough events accumulate.
    pub fn add_mm_counter_fast(&self, mm: &MmStruct, member: MmCounter, value: isize) {
        let mut inner = self.inner_exclusive_access();
        if self.is_using(mm) {
            if inner.rss_stat.add(member, value) {
                inner.rss_stat.sync_into(mm);
            }
        } else {
            mm.add_mm_counter(member, value);
        }
    }
}

impl Drop for TaskControlBlock {
    fn drop(&mut self) {
        if self.has_mm() {
            warn!("task {} exits while still using an mm", self.pid.0);
        }
        // 线程退出时才真正释放 lazy 保留的 active_mm
        if let Some(mm) = self.inner.get_mut().active_mm.take() {
            debug!("task {} drops lazy mm {}", self.pid.0, mm.id());
        }
    }
}
