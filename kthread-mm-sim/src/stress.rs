//! Randomised attach/detach runs over shared address spaces.
//!
//! Each worker thread drives its own kernel thread through a seeded random
//! walk of `use_mm`, repeated `use_mm`, user accesses and `unuse_mm`, while a
//! scanner thread keeps issuing private expedited membarriers against the
//! same address spaces. Once the workers finish, the reference counts, RSS
//! counters and hook counters are checked against what the workers did.

use crate::arch::{ArchStats, SimArch};
use kthread_mm::{ARef, KthreadMm, Membarrier, MmCounter, MmStruct, TaskControlBlock};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const TOKEN_BASE: usize = 0x8000_0000;
const PAGE_SIZE: usize = 0x1000;
const SCAN_SALT: u64 = 0x6d65_6d62;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub threads: usize,
    pub spaces: usize,
    pub iterations: usize,
    pub seed: u64,
    /// run the membarrier scanner next to the workers
    pub scan: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            spaces: 3,
            iterations: 10_000,
            seed: 0,
            scan: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Report {
    pub attaches: usize,
    pub detaches: usize,
    pub touches: usize,
    pub scans: usize,
    pub ipis: usize,
    pub freed: usize,
    pub arch: ArchStats,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "attach {} detach {} touch {}",
            self.attaches, self.detaches, self.touches
        )?;
        writeln!(f, "membarrier scans {} ipis {}", self.scans, self.ipis)?;
        writeln!(
            f,
            "switch_mm {} (same {}) smp_mb {} lazy {} rss sync {}",
            self.arch.switches,
            self.arch.same_switches,
            self.arch.barriers,
            self.arch.lazy_entries,
            self.arch.rss_syncs
        )?;
        write!(f, "freed {} address spaces", self.freed)
    }
}

/// An invariant the run found broken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// `mm_count` differs from one plus the number of lazy holders
    MmCount { mm: usize, expected: usize, found: usize },
    /// a task did not end up on the page table of the mm it attached to
    WrongToken { pid: usize, expected: usize, found: Option<usize> },
    /// a task is still attached after its worker finished
    StillAttached { pid: usize },
    BarrierCount { transitions: usize, barriers: usize },
    RssMismatch { touches: usize, accounted: usize },
    Leak { spaces: usize, freed: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MmCount { mm, expected, found } => {
                write!(f, "mm {}: mm_count {} but expected {}", mm, found, expected)
            }
            Violation::WrongToken { pid, expected, found } => write!(
                f,
                "task {}: loaded token {:?} but expected {:#x}",
                pid, found, expected
            ),
            Violation::StillAttached { pid } => write!(f, "task {} is still attached", pid),
            Violation::BarrierCount {
                transitions,
                barriers,
            } => write!(
                f,
                "{} attach/detach transitions but {} full barriers",
                transitions, barriers
            ),
            Violation::RssMismatch { touches, accounted } => write!(
                f,
                "{} pages touched but {} accounted",
                touches, accounted
            ),
            Violation::Leak { spaces, freed } => {
                write!(f, "{} address spaces but {} freed", spaces, freed)
            }
        }
    }
}

#[derive(Default)]
struct WorkerStats {
    attaches: usize,
    detaches: usize,
    touches: usize,
}

fn worker(
    kmm: &KthreadMm<SimArch>,
    tsk: &TaskControlBlock,
    spaces: &[ARef<MmStruct>],
    seed: u64,
    iterations: usize,
) -> Result<WorkerStats, Violation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut stats = WorkerStats::default();
    let mut attached: Option<&MmStruct> = None;
    for _ in 0..iterations {
        let mm = match attached {
            Some(mm) => match rng.gen_range(0..8) {
                0..=3 => {
                    // 访问用户内存，缺页计入线程本地的 RSS
                    tsk.add_mm_counter_fast(mm, MmCounter::AnonPages, 1);
                    stats.touches += 1;
                    continue;
                }
                4 => mm,
                _ => {
                    kmm.unuse_mm(tsk, mm);
                    attached = None;
                    stats.detaches += 1;
                    continue;
                }
            },
            None => &*spaces[rng.gen_range(0..spaces.len())],
        };
        kmm.use_mm(tsk, mm);
        stats.attaches += 1;
        let found = kmm.arch().loaded_token(tsk.getpid());
        if found != Some(mm.token()) {
            return Err(Violation::WrongToken {
                pid: tsk.getpid(),
                expected: mm.token(),
                found,
            });
        }
        attached = Some(mm);
    }
    if let Some(mm) = attached {
        kmm.unuse_mm(tsk, mm);
        stats.detaches += 1;
    }
    Ok(stats)
}

/// Run one stress round described by `cfg`.
///
/// `cfg.threads` and `cfg.spaces` must be non-zero.
pub fn run(cfg: &SimConfig) -> Result<Report, Violation> {
    assert!(cfg.threads > 0 && cfg.spaces > 0);
    info!(
        "stress: {} threads, {} spaces, {} iterations, seed {}",
        cfg.threads, cfg.spaces, cfg.iterations, cfg.seed
    );
    let kmm = KthreadMm::new(SimArch::new());
    let membarrier = Membarrier::new();
    let freed = Arc::new(AtomicUsize::new(0));
    let spaces: Vec<ARef<MmStruct>> = (0..cfg.spaces)
        .map(|i| {
            let freed = freed.clone();
            MmStruct::with_free_hook(TOKEN_BASE + i * PAGE_SIZE, move |_| {
                freed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for mm in spaces.iter() {
        membarrier.register_private_expedited(mm);
    }
    let tasks: Vec<Arc<TaskControlBlock>> = (0..cfg.threads)
        .map(|_| Arc::new(TaskControlBlock::new_kthread()))
        .collect();
    for tsk in tasks.iter() {
        membarrier.register_task(tsk.clone());
    }

    let mut report = Report::default();
    let done = AtomicBool::new(false);
    let scans = AtomicUsize::new(0);
    let ipis = AtomicUsize::new(0);
    let results: Vec<Result<WorkerStats, Violation>> = thread::scope(|s| {
        if cfg.scan {
            s.spawn(|| {
                let mut rng = StdRng::seed_from_u64(cfg.seed ^ SCAN_SALT);
                while !done.load(Ordering::Acquire) {
                    let mm = &spaces[rng.gen_range(0..spaces.len())];
                    if let Some(n) = membarrier.private_expedited(mm, |_| {}) {
                        ipis.fetch_add(n, Ordering::Relaxed);
                    }
                    scans.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                }
            });
        }
        let workers: Vec<_> = tasks
            .iter()
            .enumerate()
            .map(|(i, tsk)| {
                let (kmm, spaces) = (&kmm, &spaces);
                let seed = cfg.seed.wrapping_add(i as u64);
                s.spawn(move || worker(kmm, tsk, spaces, seed, cfg.iterations))
            })
            .collect();
        let results: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect();
        done.store(true, Ordering::Release);
        results
    });
    for stats in results {
        let stats = stats?;
        report.attaches += stats.attaches;
        report.detaches += stats.detaches;
        report.touches += stats.touches;
    }
    report.scans = scans.load(Ordering::Relaxed);
    report.ipis = ipis.load(Ordering::Relaxed);
    report.arch = kmm.arch().stats();

    check(&report, &spaces, &tasks)?;

    // 线程退出释放 lazy 引用，随后丢弃创建者的引用，每个地址空间都应恰好被释放一次
    drop(membarrier);
    drop(tasks);
    let spaces_len = spaces.len();
    drop(spaces);
    report.freed = freed.load(Ordering::SeqCst);
    if report.freed != spaces_len {
        return Err(Violation::Leak {
            spaces: spaces_len,
            freed: report.freed,
        });
    }
    debug!("stress report: {:?}", report);
    Ok(report)
}

fn check(
    report: &Report,
    spaces: &[ARef<MmStruct>],
    tasks: &[Arc<TaskControlBlock>],
) -> Result<(), Violation> {
    if let Some(tsk) = tasks.iter().find(|t| t.has_mm()) {
        return Err(Violation::StillAttached { pid: tsk.getpid() });
    }
    let transitions = report.attaches + report.detaches;
    if report.arch.barriers != transitions {
        return Err(Violation::BarrierCount {
            transitions,
            barriers: report.arch.barriers,
        });
    }
    for mm in spaces.iter() {
        let holders = tasks
            .iter()
            .filter(|t| t.active_mm_id() == Some(mm.id()))
            .count();
        if mm.mm_count() != 1 + holders {
            return Err(Violation::MmCount {
                mm: mm.id(),
                expected: 1 + holders,
                found: mm.mm_count(),
            });
        }
    }
    let accounted: usize = spaces
        .iter()
        .map(|mm| mm.get_mm_counter(MmCounter::AnonPages))
        .sum();
    if accounted != report.touches {
        return Err(Violation::RssMismatch {
            touches: report.touches,
            accounted,
        });
    }
    Ok(())
}
