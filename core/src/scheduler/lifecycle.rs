//! Task lifecycle and the operations §6 lists as exposed to the rest of the
//! kernel: fork, wake, exit, and the priority/affinity/policy setters.
//!
//! Every fallible entry point here returns [`SchedResult`], mapping onto
//! the `-EINVAL`/`-EPERM`/`-ESRCH`/`-ENOMEM` family per §7 via
//! [`SchedError::errno`].

use bfs_abi::cpu::{CpuId, CpuMask};
use bfs_abi::error::{SchedError, SchedResult};
use bfs_abi::task::{IDLE_PRIO, ISO_PRIO, NORMAL_PRIO, Nice, Policy, TaskId, TaskState};

use super::grq::{Grq, effective_prio, refill_deadline};
use super::per_cpu::CpuRqSet;
use super::task::TaskFlags;
use super::tunables::{RESCHED_US, Tunables};

fn ensure_live(grq: &Grq, task: TaskId) -> SchedResult<()> {
    if grq.tasks.get(task).state == TaskState::Invalid {
        Err(SchedError::NoSuchTask)
    } else {
        Ok(())
    }
}

/// The static priority band a task's policy and nice imply, ignoring every
/// transient override (`effective_prio` applies those at queue time).
pub(super) fn normal_prio_for(policy: Policy) -> u8 {
    match policy {
        Policy::Fifo(rt) | Policy::RoundRobin(rt) => rt.sched_prio(),
        Policy::IdlePrio => IDLE_PRIO,
        Policy::Iso => ISO_PRIO,
        Policy::Normal | Policy::Batch => NORMAL_PRIO,
    }
}

/// Create a child task's scheduling state from its parent's, honouring
/// `RESET_ON_FORK` (§3). The child starts in `TaskState::Invalid` — not yet
/// runnable — until [`wake_up_new_task`] places it on the GRQ.
///
/// Shares the parent's remaining timeslice with the child rather than
/// handing the child a full fresh quantum, the same "don't let fork()
/// manufacture CPU time" rule `sched_fork` enforces in the original: a
/// `SCHED_FIFO` child skips the split entirely (FIFO has no timeslice to
/// share), everything else either splits what the parent has left 50/50 or,
/// if there isn't enough left to bother splitting, takes a fresh refill
/// itself and leaves the parent needing a reschedule.
pub fn sched_fork(grq: &mut Grq, tunables: &Tunables, parent: TaskId) -> SchedResult<TaskId> {
    ensure_live(grq, parent)?;
    let parent_snapshot = *grq.tasks.get(parent);
    let child_id = grq.tasks.alloc().ok_or(SchedError::OutOfMemory)?;

    let reset_on_fork = parent_snapshot.flags.contains(TaskFlags::RESET_ON_FORK);
    let child_policy = if reset_on_fork { Policy::Normal } else { parent_snapshot.policy };
    {
        let child = grq.tasks.get_mut(child_id);
        if reset_on_fork {
            child.policy = Policy::Normal;
            child.nice = Nice::new(0);
        } else {
            child.policy = parent_snapshot.policy;
            child.nice = parent_snapshot.nice;
        }
        child.cpus_allowed = parent_snapshot.cpus_allowed;
        child.normal_prio = normal_prio_for(child.policy);
        child.prio = child.normal_prio;
        child.state = TaskState::Invalid;
    }

    if !matches!(child_policy, Policy::Fifo(_)) {
        if parent_snapshot.time_slice_us >= RESCHED_US * 2 {
            let half = parent_snapshot.time_slice_us / 2;
            grq.tasks.get_mut(parent).time_slice_us = half;
            let child = grq.tasks.get_mut(child_id);
            child.time_slice_us = half;
            child.deadline = parent_snapshot.deadline.saturating_sub(1);
        } else {
            grq.tasks.get_mut(parent).time_slice_us = 0;
            grq.tasks.get_mut(parent).flags.insert(TaskFlags::NEED_RESCHED);
            let niffies = grq.niffies;
            refill_deadline(grq.tasks.get_mut(child_id), niffies, tunables);
        }
    }

    Ok(child_id)
}

/// Place a freshly-forked child onto the GRQ for the first time and
/// activate it. `sched_fork` already assigned the child a deadline and
/// timeslice (split from the parent's, or freshly refilled); this only
/// fills in a fresh deadline/slice for a child that bypassed that split
/// entirely (`SCHED_FIFO`, whose `time_slice_us` is never touched by fork).
pub fn wake_up_new_task(grq: &mut Grq, tunables: &Tunables, iso_refractory: bool, child: TaskId) -> SchedResult<()> {
    ensure_live(grq, child)?;
    if grq.tasks.get(child).time_slice_us == 0 {
        let niffies = grq.niffies;
        refill_deadline(grq.tasks.get_mut(child), niffies, tunables);
    }
    grq.tasks.get_mut(child).state = TaskState::Runnable;
    grq.activate(child, iso_refractory);
    Ok(())
}

/// Wake `task` if it is currently blocked in one of `allowed_states`,
/// returning whether a wakeup actually happened (a no-op wake — the task
/// was already runnable or running — returns `false`, matching
/// `try_to_wake_up`'s real return convention).
pub fn try_to_wake_up(grq: &mut Grq, iso_refractory: bool, task: TaskId, allowed_states: &[TaskState]) -> SchedResult<bool> {
    ensure_live(grq, task)?;
    let current_state = grq.tasks.get(task).state;
    if !allowed_states.contains(&current_state) {
        return Ok(false);
    }
    if !current_state.can_transition_to(TaskState::Runnable) {
        return Ok(false);
    }
    grq.tasks.get_mut(task).state = TaskState::Runnable;
    grq.activate(task, iso_refractory);
    Ok(true)
}

/// Wake a task from any blocked state (`Interruptible`, `Uninterruptible`,
/// or `Stopped`).
pub fn wake_up_process(grq: &mut Grq, iso_refractory: bool, task: TaskId) -> SchedResult<bool> {
    try_to_wake_up(
        grq,
        iso_refractory,
        task,
        &[TaskState::Interruptible, TaskState::Uninterruptible, TaskState::Stopped],
    )
}

/// Wake a task only if it is blocked in exactly `state`.
pub fn wake_up_state(grq: &mut Grq, iso_refractory: bool, task: TaskId, state: TaskState) -> SchedResult<bool> {
    try_to_wake_up(grq, iso_refractory, task, &[state])
}

/// Tear down a task's scheduling state and return its arena slot to the
/// free list. Caller must have already taken it off whatever CPU was
/// running it (`Grq::return_task` with `should_deactivate = true`).
pub fn sched_exit(grq: &mut Grq, task: TaskId) -> SchedResult<()> {
    ensure_live(grq, task)?;
    // Runnable/Running tasks still count toward nr_running; already-blocked
    // tasks were excluded from it back when they were deactivated.
    let was_counted = !grq.tasks.get(task).state.is_blocked();
    let t = grq.tasks.get_mut(task);
    if !t.state.can_transition_to(TaskState::Dead) {
        return Err(SchedError::InvalidArgument);
    }
    t.state = TaskState::Dead;
    t.flags.insert(TaskFlags::EXITING);
    if t.is_queued() {
        grq.dequeue(task);
        // `activate` incremented qnr when this task was queued; dequeuing it
        // here (rather than through `Grq::take`) must undo that too, or a
        // task that exits before ever being taken leaks qnr (§3.5).
        grq.qnr = grq.qnr.saturating_sub(1);
    }
    if was_counted {
        grq.nr_running = grq.nr_running.saturating_sub(1);
    }
    grq.tasks.free(task);
    Ok(())
}

/// Change a task's nice value, recomputing its static priority and, if
/// queued, its effective priority and band.
pub fn set_user_nice(grq: &mut Grq, iso_refractory: bool, task: TaskId, nice: Nice) -> SchedResult<()> {
    ensure_live(grq, task)?;
    let was_queued = grq.tasks.get(task).is_queued();
    if was_queued {
        grq.dequeue(task);
    }
    {
        let t = grq.tasks.get_mut(task);
        t.nice = nice;
        t.normal_prio = normal_prio_for(t.policy);
    }
    if was_queued {
        let prio = effective_prio(grq.tasks.get(task), iso_refractory);
        grq.tasks.get_mut(task).prio = prio;
        grq.enqueue(task, prio);
    }
    Ok(())
}

/// Change a task's scheduling policy (`SCHED_FIFO`/`RR`/`NORMAL`/`BATCH`/
/// `ISO`/`IDLEPRIO`), recomputing priority and requeueing if necessary.
pub fn sched_setscheduler(grq: &mut Grq, iso_refractory: bool, task: TaskId, policy: Policy) -> SchedResult<()> {
    ensure_live(grq, task)?;
    let was_queued = grq.tasks.get(task).is_queued();
    if was_queued {
        grq.dequeue(task);
    }
    {
        let t = grq.tasks.get_mut(task);
        t.policy = policy;
        t.normal_prio = normal_prio_for(policy);
    }
    if was_queued {
        let prio = effective_prio(grq.tasks.get(task), iso_refractory);
        grq.tasks.get_mut(task).prio = prio;
        grq.enqueue(task, prio);
    }
    Ok(())
}

/// Narrow (or widen) the set of CPUs `task` may run on. Migrating a task
/// presently running outside the new mask onto an allowed CPU is a
/// load-balancer concern and out of scope (§1 Non-goals) — the next
/// `schedule()` on its current CPU naturally excludes it once its affinity
/// no longer matches.
pub fn set_cpus_allowed_ptr(grq: &mut Grq, task: TaskId, mask: CpuMask) -> SchedResult<()> {
    ensure_live(grq, task)?;
    if mask.is_empty() {
        return Err(SchedError::InvalidArgument);
    }
    grq.tasks.get_mut(task).cpus_allowed = mask;
    Ok(())
}

/// Apply a priority-inheritance boost (or release one), setting `prio`
/// directly rather than through `effective_prio` — this is the one place a
/// task's queued band can diverge from what its policy/nice would imply.
pub fn rt_mutex_setprio(grq: &mut Grq, task: TaskId, prio: u8) -> SchedResult<()> {
    ensure_live(grq, task)?;
    if prio > IDLE_PRIO {
        return Err(SchedError::InvalidArgument);
    }
    let was_queued = grq.tasks.get(task).is_queued();
    if was_queued {
        grq.dequeue(task);
    }
    grq.tasks.get_mut(task).prio = prio;
    if was_queued {
        grq.enqueue(task, prio);
    }
    Ok(())
}

pub fn task_prio(grq: &Grq, task: TaskId) -> SchedResult<u8> {
    ensure_live(grq, task)?;
    Ok(grq.tasks.get(task).prio)
}

pub fn task_nice(grq: &Grq, task: TaskId) -> SchedResult<i32> {
    ensure_live(grq, task)?;
    Ok(grq.tasks.get(task).nice.value())
}

#[inline]
pub fn idle_cpu(cpu_rqs: &CpuRqSet, cpu: CpuId) -> bool {
    cpu_rqs.is_idle(cpu)
}

#[inline]
pub fn nr_running(grq: &Grq) -> u32 {
    grq.nr_running
}

#[inline]
pub fn nr_iowait(grq: &Grq) -> u32 {
    grq.nr_iowait
}

#[inline]
pub fn nr_context_switches(grq: &Grq) -> u64 {
    grq.switches
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_abi::task::RtPriority;

    fn runnable_parent(grq: &mut Grq) -> TaskId {
        let id = grq.tasks.alloc().unwrap();
        let t = grq.tasks.get_mut(id);
        t.policy = Policy::Normal;
        t.cpus_allowed = CpuMask::all(4);
        t.state = TaskState::Runnable;
        id
    }

    fn tunables() -> Tunables {
        Tunables::new(1000, 1, 6, 25)
    }

    #[test]
    fn fork_resets_policy_when_flagged() {
        let mut grq = Grq::new();
        let parent = runnable_parent(&mut grq);
        grq.tasks.get_mut(parent).policy = Policy::Fifo(RtPriority::new(10).unwrap());
        grq.tasks.get_mut(parent).flags.insert(TaskFlags::RESET_ON_FORK);

        let child = sched_fork(&mut grq, &tunables(), parent).unwrap();
        assert_eq!(grq.tasks.get(child).policy, Policy::Normal);
        assert_eq!(grq.tasks.get(child).state, TaskState::Invalid);
    }

    #[test]
    fn fork_inherits_policy_without_reset_flag() {
        let mut grq = Grq::new();
        let parent = runnable_parent(&mut grq);
        let rt = Policy::Fifo(RtPriority::new(10).unwrap());
        grq.tasks.get_mut(parent).policy = rt;

        let child = sched_fork(&mut grq, &tunables(), parent).unwrap();
        assert_eq!(grq.tasks.get(child).policy, rt);
    }

    #[test]
    fn fifo_child_skips_the_timeslice_split_entirely() {
        let mut grq = Grq::new();
        let parent = runnable_parent(&mut grq);
        grq.tasks.get_mut(parent).policy = Policy::Fifo(RtPriority::new(10).unwrap());
        grq.tasks.get_mut(parent).time_slice_us = 5000;

        let child = sched_fork(&mut grq, &tunables(), parent).unwrap();
        assert_eq!(grq.tasks.get(parent).time_slice_us, 5000);
        assert_eq!(grq.tasks.get(child).time_slice_us, 0);
    }

    #[test]
    fn fork_splits_parents_timeslice_and_gives_child_the_earlier_deadline() {
        let mut grq = Grq::new();
        let parent = runnable_parent(&mut grq);
        grq.tasks.get_mut(parent).time_slice_us = 5000;
        grq.tasks.get_mut(parent).deadline = 10_000;

        let child = sched_fork(&mut grq, &tunables(), parent).unwrap();
        assert_eq!(grq.tasks.get(parent).time_slice_us, 2500);
        assert_eq!(grq.tasks.get(child).time_slice_us, 2500);
        assert_eq!(grq.tasks.get(child).deadline, 9_999);
        assert!(!grq.tasks.get(parent).flags.contains(TaskFlags::NEED_RESCHED));
    }

    #[test]
    fn fork_with_too_little_parent_slice_refills_child_and_flags_parent_for_resched() {
        let mut grq = Grq::new();
        grq.niffies = 1_000_000;
        let tunables = tunables();
        let parent = runnable_parent(&mut grq);
        grq.tasks.get_mut(parent).time_slice_us = 50;

        let child = sched_fork(&mut grq, &tunables, parent).unwrap();
        assert_eq!(grq.tasks.get(parent).time_slice_us, 0);
        assert!(grq.tasks.get(parent).flags.contains(TaskFlags::NEED_RESCHED));
        assert_eq!(grq.tasks.get(child).time_slice_us, tunables.fresh_time_slice_us());
        assert!(grq.tasks.get(child).deadline > grq.niffies);
    }

    #[test]
    fn wake_up_new_task_activates_child() {
        let mut grq = Grq::new();
        let tunables = tunables();
        let parent = runnable_parent(&mut grq);
        let child = sched_fork(&mut grq, &tunables, parent).unwrap();
        wake_up_new_task(&mut grq, &tunables, false, child).unwrap();
        assert_eq!(grq.tasks.get(child).state, TaskState::Runnable);
        assert!(grq.tasks.get(child).is_queued());
        assert_eq!(grq.nr_running, 2);
    }

    #[test]
    fn wake_up_process_only_wakes_blocked_tasks() {
        let mut grq = Grq::new();
        let id = runnable_parent(&mut grq);
        grq.tasks.get_mut(id).state = TaskState::Interruptible;
        assert!(wake_up_process(&mut grq, false, id).unwrap());
        assert_eq!(grq.tasks.get(id).state, TaskState::Runnable);
        // Already runnable: waking again is a no-op.
        assert!(!wake_up_process(&mut grq, false, id).unwrap());
    }

    #[test]
    fn sched_exit_frees_the_slot() {
        let mut grq = Grq::new();
        let id = runnable_parent(&mut grq);
        grq.tasks.get_mut(id).state = TaskState::Dead;
        sched_exit(&mut grq, id).unwrap();
        assert_eq!(grq.tasks.live_count(), 0);
    }

    #[test]
    fn set_user_nice_requeues_into_new_deadline_band_position() {
        let mut grq = Grq::new();
        let id = runnable_parent(&mut grq);
        grq.activate(id, false);
        set_user_nice(&mut grq, false, id, Nice::new(10)).unwrap();
        assert_eq!(grq.tasks.get(id).nice.value(), 10);
        assert!(grq.tasks.get(id).is_queued());
    }

    #[test]
    fn cpus_allowed_rejects_empty_mask() {
        let mut grq = Grq::new();
        let id = runnable_parent(&mut grq);
        assert_eq!(set_cpus_allowed_ptr(&mut grq, id, CpuMask::empty()), Err(SchedError::InvalidArgument));
    }

    #[test]
    fn unknown_task_is_no_such_task() {
        let grq = Grq::new();
        assert_eq!(task_prio(&grq, TaskId::new(0)), Err(SchedError::NoSuchTask));
    }

    #[test]
    fn rt_mutex_setprio_boosts_above_normal_prio() {
        let mut grq = Grq::new();
        let id = runnable_parent(&mut grq);
        grq.activate(id, false);
        rt_mutex_setprio(&mut grq, id, 5).unwrap();
        assert_eq!(grq.tasks.get(id).prio, 5);
        assert!(grq.band_head(5) == Some(id));
    }
}
