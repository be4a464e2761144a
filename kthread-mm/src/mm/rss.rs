//! RSS accounting split between tasks and address spaces.
//!
//! A task attached to an mm accumulates counter deltas locally and folds them
//! into the mm later, either when too many events pile up or when it detaches.

use super::MmStruct;
use crate::config::{NR_MM_COUNTERS, TASK_RSS_EVENTS_THRESH};

/// RSS counters kept per address space.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum MmCounter {
    /// resident file mapping pages
    FilePages = 0,
    /// resident anonymous pages
    AnonPages = 1,
    /// anonymous swap entries
    SwapEnts = 2,
    /// resident shared memory pages
    ShmemPages = 3,
}

/// Counter deltas a task has not yet folded into its mm.
#[derive(Clone, Debug, Default)]
pub struct TaskRssStat {
    events: u32,
    count: [isize; NR_MM_COUNTERS],
}

impl TaskRssStat {
    pub const fn new() -> Self {
        Self {
            events: 0,
            count: [0; NR_MM_COUNTERS],
        }
    }

    /// Record a delta, returning `true` once enough events piled up that the
    /// caller should sync.
    pub fn add(&mut self, member: MmCounter, value: isize) -> bool {
        self.count[member as usize] += value;
        self.events += 1;
        self.events > TASK_RSS_EVENTS_THRESH
    }

    pub fn pending(&self, member: MmCounter) -> isize {
        self.count[member as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.count.iter().all(|c| *c == 0)
    }

    /// Fold every pending delta into `mm` and reset.
    pub fn sync_into(&mut self, mm: &MmStruct) {
        for (i, member) in [
            MmCounter::FilePages,
            MmCounter::AnonPages,
            MmCounter::SwapEnts,
            MmCounter::ShmemPages,
        ]
        .into_iter()
        .enumerate()
        {
            if self.count[i] != 0 {
                mm.add_mm_counter(member, self.count[i]);
                self.count[i] = 0;
            }
        }
        self.events = 0;
    }
}
