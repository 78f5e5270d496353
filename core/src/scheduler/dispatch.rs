//! `schedule()` and `scheduler_tick()` (§4.6, §4.7): the dispatcher state
//! machine and the periodic tick handler.
//!
//! `schedule()` deliberately never performs a context switch itself — per
//! §1's scoping, the actual register/stack handoff belongs to the embedding
//! kernel. Instead it returns a [`ScheduleDecision`] describing what the
//! caller should do, the same control-inversion the teacher's own
//! `context_switch` boundary documents.

use bfs_abi::cpu::CpuId;
use bfs_abi::task::TaskId;

use super::clock::update_clocks;
use super::grq::{Grq, refill_deadline};
use super::iso::IsoController;
use super::locality::LocalityMatrix;
use super::per_cpu::CpuRqSet;
use super::selector::earliest_deadline_task;
use super::tunables::{RESCHED_US, Tunables};

/// What the caller of `schedule()` must do next. No variant carries a
/// context — the caller already knows which CPU it asked about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// The task already running should keep running; no switch needed.
    KeepRunning,
    /// Nothing is runnable for this CPU; switch to (or stay on) its idle
    /// task.
    Idle,
    /// Perform a context switch away from `from` and into `to`.
    SwitchTo { from: TaskId, to: TaskId },
}

/// Re-evaluate what `cpu` should be running right now. Callers invoke this
/// whenever the currently-running task can no longer continue as-is: its
/// timeslice ran out (`NEED_RESCHED` was set by [`scheduler_tick`]), it
/// blocked, or it exited. `deactivate_current` tells the GRQ whether the
/// outgoing task should leave the runnable set entirely (blocking, exiting)
/// rather than simply go back on the queue.
pub fn schedule(
    grq: &mut Grq,
    cpu_rqs: &mut CpuRqSet,
    tunables: &Tunables,
    locality: &LocalityMatrix,
    cpu: CpuId,
    now_ns: u64,
    deactivate_current: bool,
) -> ScheduleDecision {
    {
        let rq = cpu_rqs.get_mut(cpu);
        grq.niffies = update_clocks(&mut rq.clock, grq.niffies, now_ns, tunables.jiffy_ns());
    }

    {
        // rq.dither = (clock - last_tick > HALF_JIFFY_NS) ? 0 : 1 (§4.6):
        // suppress the tick handler's resched request when it fires close
        // enough on the heels of this dispatch entry.
        let half_jiffy_ns = tunables.jiffy_ns() / 2;
        let niffies = grq.niffies;
        let rq = cpu_rqs.get_mut(cpu);
        rq.dither = niffies.saturating_sub(rq.last_tick) <= half_jiffy_ns;
    }

    let rq = *cpu_rqs.get(cpu);
    let current = rq.curr;
    let was_idle = rq.is_idle();

    if !was_idle {
        let niffies = grq.niffies;
        let task = grq.tasks.get_mut(current);
        if task.time_slice_us < RESCHED_US || task.policy.is_batch() {
            refill_deadline(task, niffies, tunables);
        }
        grq.return_task(current, deactivate_current);
    }

    match earliest_deadline_task(grq, locality, cpu) {
        None => {
            let idle = rq.idle;
            cpu_rqs.set_curr(cpu, idle, u64::MAX, u8::MAX);
            if was_idle && current == idle {
                ScheduleDecision::KeepRunning
            } else {
                grq.switches += 1;
                ScheduleDecision::SwitchTo { from: current, to: idle }
            }
        }
        Some(next) => {
            grq.take(next, cpu);
            let (deadline, prio) = {
                let t = grq.tasks.get(next);
                (t.deadline, t.prio)
            };
            cpu_rqs.set_curr(cpu, next, deadline, prio);
            if next == current && !was_idle && !deactivate_current {
                ScheduleDecision::KeepRunning
            } else {
                grq.switches += 1;
                ScheduleDecision::SwitchTo { from: current, to: next }
            }
        }
    }
}

/// Called from the external timer-tick collaborator once per jiffy for
/// `cpu`. Feeds the ISO quota controller and decrements the running task's
/// timeslice, returning whether it has fallen at or below `RESCHED_US` and
/// the caller should therefore set `NEED_RESCHED` and eventually call
/// [`schedule`].
pub fn scheduler_tick(grq: &mut Grq, cpu_rqs: &mut CpuRqSet, iso: &mut IsoController, tunables: &Tunables, cpu: CpuId) -> bool {
    let rq = *cpu_rqs.get(cpu);
    if rq.is_idle() {
        iso.tick_other(tunables.sched_iso_cpu());
        return false;
    }

    let current = rq.curr;
    let policy = grq.tasks.get(current).policy;
    let was_refractory = iso.is_refractory();
    if policy.is_realtime() || (policy.is_iso() && !iso.is_refractory()) {
        iso.tick_rt_or_iso(tunables.sched_iso_cpu());
    } else {
        iso.tick_other(tunables.sched_iso_cpu());
    }

    // §4.7 step 3c: an ISO task running pseudo-RT when the controller flips
    // refractory mid-flight no longer qualifies for that treatment — zero
    // its timeslice outright to force it through the dispatcher rather than
    // let it ride out whatever quantum it was given under the old rule.
    if policy.is_iso() && !was_refractory && iso.is_refractory() {
        grq.tasks.get_mut(current).time_slice_us = 0;
        cpu_rqs.get_mut(cpu).last_tick = grq.niffies;
        return true;
    }

    if policy.is_realtime() && !policy.is_round_robin() {
        return false;
    }

    let jiffy_us = (tunables.jiffy_ns() / 1_000).max(1) as u32;
    let half_jiffy_us = (jiffy_us / 2).max(1);
    let new_slice = {
        let task = grq.tasks.get_mut(current);
        task.time_slice_us = task.time_slice_us.saturating_sub(jiffy_us);
        task.time_slice_us
    };

    let niffies = grq.niffies;
    let rq = cpu_rqs.get_mut(cpu);
    let dither = rq.dither;
    rq.last_tick = niffies;

    // §4.7 step 3d: dithering holds off the resched request while there's
    // still more than half a jiffy left, even if below RESCHED_US, so a
    // tick that landed right after a fresh dispatch doesn't immediately
    // bounce back into the dispatcher.
    if dither && new_slice > half_jiffy_us {
        false
    } else {
        new_slice <= RESCHED_US
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_abi::cpu::CpuMask;
    use bfs_abi::task::{NORMAL_PRIO, Policy, TaskState};

    fn setup(cpu_count: u32) -> (Grq, CpuRqSet, Tunables, LocalityMatrix) {
        let grq = Grq::new();
        let cpu_rqs = CpuRqSet::new(cpu_count);
        let tunables = Tunables::new(1000, cpu_count, 6, 25);
        let locality = LocalityMatrix::new(cpu_count);
        (grq, cpu_rqs, tunables, locality)
    }

    #[test]
    fn schedules_first_runnable_task_from_idle() {
        let (mut grq, mut rqs, tunables, locality) = setup(1);
        let idle = grq.tasks.alloc().unwrap();
        rqs.set_idle_task(CpuId::new(0), idle);

        let id = grq.tasks.alloc().unwrap();
        {
            let t = grq.tasks.get_mut(id);
            t.policy = Policy::Normal;
            t.deadline = 10;
            t.cpus_allowed = CpuMask::all(1);
            t.state = TaskState::Runnable;
        }
        grq.enqueue(id, NORMAL_PRIO);

        let decision = schedule(&mut grq, &mut rqs, &tunables, &locality, CpuId::new(0), 1_000, false);
        assert_eq!(decision, ScheduleDecision::SwitchTo { from: idle, to: id });
    }

    #[test]
    fn stays_idle_when_nothing_runnable() {
        let (mut grq, mut rqs, tunables, locality) = setup(1);
        let idle = grq.tasks.alloc().unwrap();
        rqs.set_idle_task(CpuId::new(0), idle);

        let decision = schedule(&mut grq, &mut rqs, &tunables, &locality, CpuId::new(0), 1_000, false);
        assert_eq!(decision, ScheduleDecision::KeepRunning);
    }

    #[test]
    fn tick_signals_resched_once_timeslice_exhausted() {
        let (mut grq, mut rqs, tunables, locality) = setup(1);
        let mut iso = IsoController::new(1000, 1);
        let idle = grq.tasks.alloc().unwrap();
        rqs.set_idle_task(CpuId::new(0), idle);

        let id = grq.tasks.alloc().unwrap();
        {
            let t = grq.tasks.get_mut(id);
            t.policy = Policy::Normal;
            t.deadline = 10;
            t.time_slice_us = 50;
            t.cpus_allowed = CpuMask::all(1);
            t.state = TaskState::Runnable;
        }
        grq.enqueue(id, NORMAL_PRIO);
        schedule(&mut grq, &mut rqs, &tunables, &locality, CpuId::new(0), 0, false);

        let needs_resched = scheduler_tick(&mut grq, &mut rqs, &mut iso, &tunables, CpuId::new(0));
        assert!(needs_resched, "50us slice should not survive a 1ms jiffy tick");
    }

    #[test]
    fn refills_outgoing_tasks_deadline_when_its_slice_is_nearly_spent() {
        let (mut grq, mut rqs, tunables, locality) = setup(1);
        let idle = grq.tasks.alloc().unwrap();
        rqs.set_idle_task(CpuId::new(0), idle);

        let id = grq.tasks.alloc().unwrap();
        {
            let t = grq.tasks.get_mut(id);
            t.policy = Policy::Normal;
            t.deadline = 10;
            t.time_slice_us = 50;
            t.cpus_allowed = CpuMask::all(1);
            t.state = TaskState::Runnable;
        }
        grq.enqueue(id, NORMAL_PRIO);
        schedule(&mut grq, &mut rqs, &tunables, &locality, CpuId::new(0), 0, false);

        // Re-enter schedule() with the same task still current: its slice
        // (50us) is below RESCHED_US, so it should be refilled rather than
        // carried forward toward a stale, already-expired deadline.
        schedule(&mut grq, &mut rqs, &tunables, &locality, CpuId::new(0), 1_000, false);
        let t = grq.tasks.get(id);
        assert_eq!(t.time_slice_us, tunables.fresh_time_slice_us());
    }
}
