//! `try_preempt` and `resched_best_idle` (§4.5): deciding whether a
//! newly-runnable task should interrupt a CPU that's already running
//! something, and which idle CPU to wake otherwise.

use bfs_abi::cpu::{CpuId, CpuMask};
use bfs_abi::task::TaskId;

use super::grq::Grq;
use super::locality::{LocalityMatrix, cache_distance};
use super::per_cpu::CpuRqSet;

/// Whether a task at `(candidate_prio, candidate_deadline)` should displace
/// one running at `(curr_prio, curr_deadline)`. A strictly lower priority
/// number always wins (this is what lets RT bands preempt NORMAL/ISO/IDLE
/// outright); within the same band the earlier deadline wins. Exact ties —
/// same band, same deadline — favour the incumbent, so a preemption only
/// ever happens when it's a genuine improvement.
#[inline]
pub fn can_preempt(candidate_prio: u8, candidate_deadline: u64, curr_prio: u8, curr_deadline: u64) -> bool {
    if candidate_prio != curr_prio {
        candidate_prio < curr_prio
    } else {
        candidate_deadline < curr_deadline
    }
}

/// Find the worst-ranked busy CPU (among `task`'s affinity) and, if `task`
/// can displace what it's running, return it (§4.5 steps 3-4). "Worst" is
/// the highest (numerically) running priority, ties broken by the latest
/// `offset_deadline = rq_deadline − cache_distance(waker_cpu, c, task)` —
/// an incumbent far from the waking CPU is treated as comparatively more
/// urgent, biasing the pick toward a CPU close to where the task will
/// actually land — and a remaining tie keeps the *higher* CPU index (§8
/// Scenario 3). Idle CPUs are never candidates here: step 1 already routes
/// those through [`resched_best_idle`] before this function is ever
/// called. `can_preempt` is tested exactly once, against the worst CPU's
/// own (unadjusted) priority and deadline — the cache-distance penalty
/// only ever influences which busy CPU is picked, not whether the winner
/// is actually preemptable.
pub fn try_preempt(grq: &Grq, cpu_rqs: &CpuRqSet, locality: &LocalityMatrix, task: TaskId, waker_cpu: CpuId) -> Option<CpuId> {
    let t = grq.tasks.get(task);
    let mut worst: Option<(CpuId, u8, u64)> = None;
    for cpu in t.cpus_allowed.iter() {
        if cpu.index() as u32 >= cpu_rqs.cpu_count() || cpu_rqs.is_idle(cpu) {
            continue;
        }
        let rq = cpu_rqs.get(cpu);
        let penalty = cache_distance(locality, waker_cpu, cpu, t.time_slice_us);
        let offset_deadline = rq.proj_deadline.saturating_sub(penalty);
        let is_worse = match worst {
            None => true,
            Some((_, worst_prio, worst_offset)) => {
                if rq.proj_prio != worst_prio {
                    rq.proj_prio > worst_prio
                } else {
                    offset_deadline >= worst_offset
                }
            }
        };
        if is_worse {
            worst = Some((cpu, rq.proj_prio, offset_deadline));
        }
    }
    let (worst_cpu, worst_prio, _) = worst?;
    let worst_deadline = cpu_rqs.get(worst_cpu).proj_deadline;
    if can_preempt(t.prio, t.deadline, worst_prio, worst_deadline) {
        Some(worst_cpu)
    } else {
        None
    }
}

/// Pick an idle CPU within `affinity` to wake, scanning from one before
/// `from_cpu` with wraparound — the same start point [`CpuId::wrapping_pred`]
/// documents — so repeated wakeups from the same waking CPU fan out across
/// idle CPUs rather than always picking the first one.
pub fn resched_best_idle(cpu_rqs: &CpuRqSet, affinity: CpuMask, from_cpu: CpuId) -> Option<CpuId> {
    let count = cpu_rqs.cpu_count();
    if count == 0 {
        return None;
    }
    let idle = cpu_rqs.idle_mask().intersection(affinity);
    if idle.is_empty() {
        return None;
    }
    let start = from_cpu.wrapping_pred(count).as_u32();
    idle.next_from(start)
}
