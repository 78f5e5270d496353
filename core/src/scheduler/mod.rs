//! The BFS scheduler: a single global runqueue shared by every CPU,
//! selecting the runnable task with the earliest virtual deadline (§1).
//!
//! Module layout mirrors the lock-ordering contract in §5 (`pi_lock` →
//! `grq.lock` → `iso_lock`, leaf last): [`Grq`] and [`CpuRqSet`] live behind
//! one [`IrqMutex`], [`IsoController`] behind its own, and every operation
//! that needs both always takes the GRQ lock first.

pub mod clock;
pub mod dispatch;
pub mod grq;
pub mod iso;
pub mod lifecycle;
pub mod locality;
pub mod per_cpu;
pub mod preempt;
pub mod selector;
pub mod task;
pub mod tunables;
pub mod wait;

use bfs_abi::cpu::{CpuId, CpuMask};
use bfs_abi::error::SchedResult;
use bfs_abi::task::{Nice, Policy, TaskId, TaskState};
use bfs_lib::IrqMutex;

use dispatch::ScheduleDecision;
use grq::Grq;
use iso::IsoController;
use locality::LocalityMatrix;
use per_cpu::CpuRqSet;
use tunables::Tunables;
use wait::{Completion, WaitQueue};

/// Configuration fixed for the lifetime of a [`Scheduler`]: how many CPUs it
/// addresses, the tick rate, and the two tunables §6 exposes.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub cpu_count: u32,
    pub hz: u32,
    pub base_rr_interval_ms: u32,
    pub sched_iso_cpu: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            hz: 1000,
            base_rr_interval_ms: 6,
            sched_iso_cpu: 25,
        }
    }
}

/// The scheduler as a whole: the GRQ and per-CPU projections behind one
/// lock, the ISO quota controller behind its own leaf lock, and the
/// read-mostly locality matrix and tunables neither lock protects (the
/// matrix never changes after init; the tunables are individually atomic).
pub struct Scheduler {
    grq: IrqMutex<(Grq, CpuRqSet)>,
    iso: IrqMutex<IsoController>,
    locality: LocalityMatrix,
    tunables: Tunables,
    cpu_count: u32,
}

impl Scheduler {
    pub fn new(config: Config, locality: LocalityMatrix) -> Self {
        let tunables = Tunables::new(config.hz, config.cpu_count, config.base_rr_interval_ms, config.sched_iso_cpu);
        let iso = IsoController::new(config.hz, config.cpu_count);
        Self {
            grq: IrqMutex::new((Grq::new(), CpuRqSet::new(config.cpu_count))),
            iso: IrqMutex::new(iso),
            locality,
            tunables,
            cpu_count: config.cpu_count,
        }
    }

    #[inline]
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    #[inline]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Register `cpu`'s dedicated idle task. Must be called once per CPU
    /// before that CPU's first `schedule()`.
    pub fn set_idle_task(&self, cpu: CpuId, idle: TaskId) {
        let mut guard = self.grq.lock(cpu);
        let (_, cpu_rqs) = &mut *guard;
        cpu_rqs.set_idle_task(cpu, idle);
    }

    /// Allocate a new task in `Invalid` state, ready for the caller to
    /// populate before its first activation. Used for the very first tasks
    /// in the system (idle tasks, init) that have no BFS-tracked parent to
    /// fork from.
    pub fn alloc_task(&self, cpu: CpuId, policy: Policy, nice: Nice, cpus_allowed: CpuMask) -> SchedResult<TaskId> {
        let mut guard = self.grq.lock(cpu);
        let (grq, _) = &mut *guard;
        let id = grq.tasks.alloc().ok_or(bfs_abi::error::SchedError::OutOfMemory)?;
        let t = grq.tasks.get_mut(id);
        t.policy = policy;
        t.nice = nice;
        t.cpus_allowed = cpus_allowed;
        t.normal_prio = lifecycle::normal_prio_for(policy);
        t.prio = t.normal_prio;
        Ok(id)
    }

    /// Activate a task for the very first time (no deadline yet assigned).
    pub fn wake_up_new_task(&self, cpu: CpuId, child: TaskId) -> SchedResult<()> {
        let mut grq_guard = self.grq.lock(cpu);
        let (grq, _) = &mut *grq_guard;
        let iso_guard = self.iso.lock(cpu);
        lifecycle::wake_up_new_task(grq, &self.tunables, iso_guard.is_refractory(), child)
    }

    pub fn sched_fork(&self, cpu: CpuId, parent: TaskId) -> SchedResult<TaskId> {
        let mut guard = self.grq.lock(cpu);
        let (grq, _) = &mut *guard;
        lifecycle::sched_fork(grq, &self.tunables, parent)
    }

    pub fn wake_up_process(&self, cpu: CpuId, task: TaskId) -> SchedResult<bool> {
        let mut grq_guard = self.grq.lock(cpu);
        let (grq, cpu_rqs) = &mut *grq_guard;
        let iso_guard = self.iso.lock(cpu);
        let woke = lifecycle::wake_up_process(grq, iso_guard.is_refractory(), task)?;
        if woke {
            self.post_wake(grq, cpu_rqs, task, cpu);
        }
        Ok(woke)
    }

    pub fn wake_up_state(&self, cpu: CpuId, task: TaskId, state: TaskState) -> SchedResult<bool> {
        let mut grq_guard = self.grq.lock(cpu);
        let (grq, cpu_rqs) = &mut *grq_guard;
        let iso_guard = self.iso.lock(cpu);
        let woke = lifecycle::wake_up_state(grq, iso_guard.is_refractory(), task, state)?;
        if woke {
            self.post_wake(grq, cpu_rqs, task, cpu);
        }
        Ok(woke)
    }

    /// After activating a woken task, decide whether it should preempt a
    /// currently-running task or wake an idle CPU (§4.5). This only sets
    /// `NEED_RESCHED`-equivalent intent via the returned `Option<CpuId>` —
    /// actually raising the IPI/reschedule is the embedding kernel's job.
    ///
    /// Step order matches §4.5 exactly: an idle CPU in affinity always wins
    /// (step 1) and is ranked by [`preempt::resched_best_idle`]'s own
    /// locality rules, never by [`preempt::try_preempt`]'s busy-incumbent
    /// ranking; only once no idle CPU is available does an IDLEPRIO task
    /// bail out (step 2) or a busy CPU get considered for preemption
    /// (steps 3-4).
    fn post_wake(&self, grq: &Grq, cpu_rqs: &CpuRqSet, task: TaskId, waking_cpu: CpuId) -> Option<CpuId> {
        let t = grq.tasks.get(task);
        let allowed = t.cpus_allowed;
        if !cpu_rqs.idle_mask().intersection(allowed).is_empty() {
            return preempt::resched_best_idle(cpu_rqs, allowed, waking_cpu);
        }
        if t.policy.is_idleprio() {
            return None;
        }
        preempt::try_preempt(grq, cpu_rqs, &self.locality, task, waking_cpu)
    }

    pub fn sched_exit(&self, cpu: CpuId, task: TaskId) -> SchedResult<()> {
        let mut guard = self.grq.lock(cpu);
        let (grq, _) = &mut *guard;
        lifecycle::sched_exit(grq, task)
    }

    pub fn set_user_nice(&self, cpu: CpuId, task: TaskId, nice: Nice) -> SchedResult<()> {
        let mut guard = self.grq.lock(cpu);
        let (grq, _) = &mut *guard;
        let iso_guard = self.iso.lock(cpu);
        lifecycle::set_user_nice(grq, iso_guard.is_refractory(), task, nice)
    }

    pub fn sched_setscheduler(&self, cpu: CpuId, task: TaskId, policy: Policy) -> SchedResult<()> {
        let mut guard = self.grq.lock(cpu);
        let (grq, _) = &mut *guard;
        let iso_guard = self.iso.lock(cpu);
        lifecycle::sched_setscheduler(grq, iso_guard.is_refractory(), task, policy)
    }

    pub fn set_cpus_allowed_ptr(&self, cpu: CpuId, task: TaskId, mask: CpuMask) -> SchedResult<()> {
        let mut guard = self.grq.lock(cpu);
        let (grq, _) = &mut *guard;
        lifecycle::set_cpus_allowed_ptr(grq, task, mask)
    }

    pub fn rt_mutex_setprio(&self, cpu: CpuId, task: TaskId, prio: u8) -> SchedResult<()> {
        let mut guard = self.grq.lock(cpu);
        let (grq, _) = &mut *guard;
        lifecycle::rt_mutex_setprio(grq, task, prio)
    }

    pub fn task_prio(&self, cpu: CpuId, task: TaskId) -> SchedResult<u8> {
        let guard = self.grq.lock(cpu);
        lifecycle::task_prio(&guard.0, task)
    }

    pub fn task_nice(&self, cpu: CpuId, task: TaskId) -> SchedResult<i32> {
        let guard = self.grq.lock(cpu);
        lifecycle::task_nice(&guard.0, task)
    }

    pub fn idle_cpu(&self, cpu: CpuId, query: CpuId) -> bool {
        let guard = self.grq.lock(cpu);
        lifecycle::idle_cpu(&guard.1, query)
    }

    pub fn nr_running(&self, cpu: CpuId) -> u32 {
        lifecycle::nr_running(&self.grq.lock(cpu).0)
    }

    pub fn nr_iowait(&self, cpu: CpuId) -> u32 {
        lifecycle::nr_iowait(&self.grq.lock(cpu).0)
    }

    pub fn nr_context_switches(&self, cpu: CpuId) -> u64 {
        lifecycle::nr_context_switches(&self.grq.lock(cpu).0)
    }

    /// Re-evaluate what `cpu` should run, per [`dispatch::schedule`].
    pub fn schedule(&self, cpu: CpuId, now_ns: u64, deactivate_current: bool) -> ScheduleDecision {
        let mut guard = self.grq.lock(cpu);
        let (grq, cpu_rqs) = &mut *guard;
        dispatch::schedule(grq, cpu_rqs, &self.tunables, &self.locality, cpu, now_ns, deactivate_current)
    }

    /// The periodic tick handler, per [`dispatch::scheduler_tick`].
    pub fn scheduler_tick(&self, cpu: CpuId) -> bool {
        let mut grq_guard = self.grq.lock(cpu);
        let (grq, cpu_rqs) = &mut *grq_guard;
        let mut iso_guard = self.iso.lock(cpu);
        dispatch::scheduler_tick(grq, cpu_rqs, &mut iso_guard, &self.tunables, cpu)
    }

    pub fn new_wait_queue(&self) -> WaitQueue {
        WaitQueue::new()
    }

    pub fn new_completion(&self) -> Completion {
        Completion::new()
    }

    /// Wake every task `select_wake` chose, via the same path
    /// `wake_up_process` uses (state check, activation, preemption).
    pub fn wake_selected(&self, cpu: CpuId, woken: &[TaskId]) {
        for &task in woken {
            let _ = self.wake_up_process(cpu, task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(cpu_count: u32) -> Scheduler {
        Scheduler::new(
            Config {
                cpu_count,
                hz: 1000,
                base_rr_interval_ms: 6,
                sched_iso_cpu: 25,
            },
            LocalityMatrix::new(cpu_count),
        )
    }

    #[test]
    fn idle_then_new_task_switches_in() {
        let sched = scheduler(1);
        let cpu = CpuId::new(0);
        let idle = sched.alloc_task(cpu, Policy::IdlePrio, Nice::new(0), CpuMask::all(1)).unwrap();
        sched.set_idle_task(cpu, idle);
        assert_eq!(sched.schedule(cpu, 0, false), ScheduleDecision::KeepRunning);

        let id = sched.alloc_task(cpu, Policy::Normal, Nice::new(0), CpuMask::all(1)).unwrap();
        sched.wake_up_new_task(cpu, id).unwrap();

        let decision = sched.schedule(cpu, 1_000, false);
        assert_eq!(decision, ScheduleDecision::SwitchTo { from: idle, to: id });
    }

    #[test]
    fn fork_then_wake_then_exit_round_trips_through_the_arena() {
        let sched = scheduler(1);
        let cpu = CpuId::new(0);
        let idle = sched.alloc_task(cpu, Policy::IdlePrio, Nice::new(0), CpuMask::all(1)).unwrap();
        sched.set_idle_task(cpu, idle);

        let init = sched.alloc_task(cpu, Policy::Normal, Nice::new(0), CpuMask::all(1)).unwrap();
        sched.wake_up_new_task(cpu, init).unwrap();
        let child = sched.sched_fork(cpu, init).unwrap();
        sched.wake_up_new_task(cpu, child).unwrap();
        assert_eq!(sched.nr_running(cpu), 2);

        sched.schedule(cpu, 0, false);
        sched.sched_exit(cpu, child).unwrap();
        assert_eq!(sched.nr_running(cpu), 1);
    }

    #[test]
    fn nice_and_priority_setters_round_trip() {
        let sched = scheduler(1);
        let cpu = CpuId::new(0);
        let id = sched.alloc_task(cpu, Policy::Normal, Nice::new(0), CpuMask::all(1)).unwrap();
        sched.wake_up_new_task(cpu, id).unwrap();
        sched.set_user_nice(cpu, id, Nice::new(15)).unwrap();
        assert_eq!(sched.task_nice(cpu, id).unwrap(), 15);
        sched.rt_mutex_setprio(cpu, id, 10).unwrap();
        assert_eq!(sched.task_prio(cpu, id).unwrap(), 10);
    }
}
