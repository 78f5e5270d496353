//! Per-CPU runqueue projection (§2, §4.6, §4.7).
//!
//! BFS has no per-CPU runqueue in the data-structure sense — every runnable
//! task lives in the one GRQ — but each CPU still needs a small cached
//! "what am I doing right now" projection: which task it's running, its
//! scheduling key (so `try_preempt` can compare against a remote CPU without
//! taking the GRQ lock first), and its own idle task. This mirrors the
//! teacher's per-CPU state array, just sized to what BFS actually needs
//! instead of a full intrusive runqueue.

use bfs_abi::cpu::{CpuId, CpuMask, MAX_CPUS};
use bfs_abi::task::TaskId;

use super::clock::ClockState;

/// One CPU's cached view of what it's currently running.
#[derive(Clone, Copy, Debug)]
pub struct CpuRq {
    pub cpu: CpuId,
    /// The task presently executing here, or `idle` if nothing else is.
    pub curr: TaskId,
    /// This CPU's dedicated idle task, set once at init.
    pub idle: TaskId,
    /// `curr`'s scheduling key, cached so a remote CPU's `try_preempt` can
    /// compare against it without taking the GRQ lock.
    pub proj_deadline: u64,
    pub proj_prio: u8,
    pub clock: ClockState,
    /// Set by `schedule()` on dispatch entry (§4.6): true when niffies has
    /// advanced by no more than half a jiffy since this CPU's last tick,
    /// i.e. the tick handler already ran recently enough that it should
    /// hold off requesting another reschedule on a borderline timeslice.
    pub dither: bool,
    /// `niffies` as of this CPU's last `scheduler_tick`, compared against
    /// the current niffies to derive `dither` on the next dispatch entry.
    pub last_tick: u64,
}

impl CpuRq {
    const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            curr: TaskId::INVALID,
            idle: TaskId::INVALID,
            proj_deadline: u64::MAX,
            proj_prio: u8::MAX,
            clock: ClockState {
                clock: 0,
                old_clock: 0,
                last_niffy: 0,
            },
            dither: false,
            last_tick: 0,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.curr == self.idle
    }
}

/// The set of all per-CPU projections plus the idle-CPU bitmap
/// `resched_best_idle` scans.
pub struct CpuRqSet {
    rqs: [CpuRq; MAX_CPUS],
    cpu_count: u32,
    idle_mask: CpuMask,
}

impl CpuRqSet {
    pub fn new(cpu_count: u32) -> Self {
        let mut rqs = [CpuRq::new(CpuId::new(0)); MAX_CPUS];
        for (i, rq) in rqs.iter_mut().enumerate() {
            *rq = CpuRq::new(CpuId::new(i as u32));
        }
        Self {
            rqs,
            cpu_count,
            idle_mask: CpuMask::empty(),
        }
    }

    #[inline]
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    #[inline]
    pub fn get(&self, cpu: CpuId) -> &CpuRq {
        &self.rqs[cpu.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, cpu: CpuId) -> &mut CpuRq {
        &mut self.rqs[cpu.index()]
    }

    /// Called once per CPU at init, before it ever schedules.
    pub fn set_idle_task(&mut self, cpu: CpuId, idle: TaskId) {
        let rq = self.get_mut(cpu);
        rq.idle = idle;
        rq.curr = idle;
        self.idle_mask.insert(cpu);
    }

    /// Record that `cpu` is now running `task` with the given scheduling
    /// key, updating the idle bitmap to match.
    pub fn set_curr(&mut self, cpu: CpuId, task: TaskId, deadline: u64, prio: u8) {
        let idle = self.get(cpu).idle;
        {
            let rq = self.get_mut(cpu);
            rq.curr = task;
            rq.proj_deadline = deadline;
            rq.proj_prio = prio;
        }
        if task == idle {
            self.idle_mask.insert(cpu);
        } else {
            self.idle_mask.remove(cpu);
        }
    }

    #[inline]
    pub fn is_idle(&self, cpu: CpuId) -> bool {
        self.idle_mask.contains(cpu)
    }

    #[inline]
    pub fn idle_mask(&self) -> CpuMask {
        self.idle_mask
    }

    #[inline]
    pub fn any_idle(&self) -> bool {
        !self.idle_mask.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_after_init() {
        let mut rqs = CpuRqSet::new(4);
        let idle = TaskId::new(0);
        rqs.set_idle_task(CpuId::new(0), idle);
        assert!(rqs.is_idle(CpuId::new(0)));
        assert!(rqs.any_idle());
    }

    #[test]
    fn set_curr_clears_idle_bit_until_idle_resumes() {
        let mut rqs = CpuRqSet::new(2);
        let idle = TaskId::new(0);
        let real = TaskId::new(1);
        rqs.set_idle_task(CpuId::new(0), idle);
        rqs.set_curr(CpuId::new(0), real, 500, 101);
        assert!(!rqs.is_idle(CpuId::new(0)));
        assert_eq!(rqs.get(CpuId::new(0)).proj_deadline, 500);
        rqs.set_curr(CpuId::new(0), idle, u64::MAX, u8::MAX);
        assert!(rqs.is_idle(CpuId::new(0)));
    }

    #[test]
    fn idle_mask_tracks_multiple_cpus() {
        let mut rqs = CpuRqSet::new(3);
        for i in 0..3 {
            rqs.set_idle_task(CpuId::new(i), TaskId::new(i));
        }
        rqs.set_curr(CpuId::new(1), TaskId::new(9), 10, 101);
        assert_eq!(rqs.idle_mask().count(), 2);
    }
}
