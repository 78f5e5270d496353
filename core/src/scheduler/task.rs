//! The scheduler-owned fields of a task (§3) and the per-task flags the
//! dispatcher and tick handler set and clear.
//!
//! Everything a caller outside the scheduler needs to *name* a task or
//! describe how it should be scheduled lives in `bfs_abi::task`; this is
//! the kernel-internal bookkeeping layered on top — deadline, timeslice,
//! run-list linkage — the same split the teacher draws between
//! `slopos_abi::task` and its own `task_struct.rs`.

use bfs_abi::cpu::{CpuId, CpuMask};
use bfs_abi::task::{Nice, Policy, TaskId, TaskState};

bitflags::bitflags! {
    /// Per-task flags the dispatcher and tick handler communicate through.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// TIF_NEED_RESCHED: checked at preemption points; sets up the next
        /// return from interrupt (or `preempt_enable`) to re-enter `schedule()`.
        const NEED_RESCHED = 1 << 0;
        /// Task was created with `RESET_ON_FORK`: a child forked from it
        /// drops any RT/ISO policy and priority-inheritance boost back to
        /// plain `Normal` at nice 0.
        const RESET_ON_FORK = 1 << 1;
        /// Task is in the process of exiting; excluded from IDLEPRIO
        /// suitability and from ISO accounting.
        const EXITING = 1 << 2;
        /// Task is being frozen for a system suspend; excluded from
        /// IDLEPRIO suitability (§4.2's `effective_prio`).
        const FREEZING = 1 << 3;
        /// Task currently contributes to `nr_uninterruptible` load
        /// accounting (set while blocked in `Uninterruptible`).
        const CONTRIBUTES_TO_LOAD = 1 << 4;
        /// A signal is pending for this task (checked by
        /// `signal_pending_state` at sleep/wake boundaries).
        const SIGNAL_PENDING = 1 << 5;
        /// Blocked specifically on I/O completion, set by the caller before
        /// deactivating — distinguishes `nr_iowait` from general
        /// `nr_uninterruptible` load accounting.
        const IO_WAITING = 1 << 6;
    }
}

/// The scheduler's view of one task: everything needed to place it in a GRQ
/// band, compare it against others for selection, and account for its CPU
/// use. Deliberately `Copy` — the whole record lives in a fixed-size arena
/// ([`super::grq::TaskTable`]) indexed by [`TaskId`], never behind a
/// pointer, so there is nothing here for `unsafe` pointer surgery to do.
#[derive(Clone, Copy, Debug)]
pub struct Task {
    pub policy: Policy,
    pub nice: Nice,
    /// Static priority before any RT/ISO/IDLEPRIO override or
    /// priority-inheritance boost — `normal_prio` in §4.2's vocabulary.
    pub normal_prio: u8,
    /// Effective priority: the GRQ band this task is queued in (or was last
    /// queued in, while running). May be boosted above `normal_prio` by
    /// priority inheritance, which sets it directly per §4.2.
    pub prio: u8,
    /// Virtual deadline in niffies-nanoseconds; the scheduling key for
    /// every non-RT band.
    pub deadline: u64,
    /// Remaining quantum, in microseconds.
    pub time_slice_us: u32,
    /// `niffies` snapshot from the last time this task started running.
    pub last_ran: u64,
    pub cpus_allowed: CpuMask,
    pub state: TaskState,
    /// True from `take()` until the matching `return_task()`/`deactivate()`
    /// — i.e. while some CPU is actually executing this task.
    pub on_cpu: bool,
    /// CPU this task last ran on (or is currently on, while `on_cpu`).
    /// `None` only for a task that has never run.
    pub last_cpu: Option<CpuId>,
    pub flags: TaskFlags,

    /// The GRQ band this task is linked into, or `None` if not queued.
    pub(super) band: Option<u8>,
    pub(super) prev: Option<TaskId>,
    pub(super) next: Option<TaskId>,
}

impl Task {
    /// A blank slot: `TaskState::Invalid`, unqueued, and chained into the
    /// arena's free list via `next` (see [`super::grq::TaskTable`]).
    pub const fn invalid() -> Self {
        Self {
            policy: Policy::Normal,
            nice: Nice::new(0),
            normal_prio: 0,
            prio: 0,
            deadline: 0,
            time_slice_us: 0,
            last_ran: 0,
            cpus_allowed: CpuMask::EMPTY,
            state: TaskState::Invalid,
            on_cpu: false,
            last_cpu: None,
            flags: TaskFlags::empty(),
            band: None,
            prev: None,
            next: None,
        }
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.band.is_some()
    }

    /// Whether this task is presently eligible for `IDLEPRIO` treatment:
    /// not freezing, no pending signal, not contributing to load, not
    /// exiting (§4.2's `effective_prio` IDLEPRIO suitability test).
    #[inline]
    pub fn idleprio_suitable(&self) -> bool {
        !self.flags.intersects(
            TaskFlags::FREEZING
                | TaskFlags::SIGNAL_PENDING
                | TaskFlags::CONTRIBUTES_TO_LOAD
                | TaskFlags::EXITING,
        )
    }
}
