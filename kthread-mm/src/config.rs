//! Constants used in kthread-mm

/// number of per-mm RSS counters, see [`crate::MmCounter`]
pub const NR_MM_COUNTERS: usize = 4;
// 线程本地累计的 RSS 事件超过这个数目后立即同步到 mm 上
/// pending RSS events a task may accumulate before they are synced into the mm
pub const TASK_RSS_EVENTS_THRESH: u32 = 64;
/// upper bound of `mm_count`; grabbing past it is treated as a leak
pub const MM_COUNT_MAX: usize = isize::MAX as usize;
