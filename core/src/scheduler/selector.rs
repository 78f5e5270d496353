//! `earliest_deadline_task` (§4.4): pick the best runnable task for a given
//! CPU, honouring affinity and the RT-vs-deadline selection split between
//! bands.

use bfs_abi::cpu::CpuId;
use bfs_abi::task::{MAX_RT_PRIO, PRIO_LIMIT, TaskId};

use super::grq::Grq;
use super::locality::{LocalityMatrix, cache_distance};
use super::task::Task;

/// Scan bands from highest priority (lowest index) to lowest, returning the
/// first affinity-eligible task. RT bands (`< MAX_RT_PRIO`) are plain FIFO:
/// the first eligible task queued wins outright. Every other band orders by
/// cache-distance-adjusted deadline (§4.4 step 3): the eligible task with
/// the smallest `deadline + cache_distance(last_cpu, cpu)` wins, ties broken
/// by queue order (first found, since a strict `<` comparison only ever
/// replaces the incumbent).
///
/// A band whose only occupants fail the affinity filter does not stop the
/// scan — `bitmap.find_first_from` is re-queried one bit past it, so the
/// scan always terminates (the bitmap is finite) and never returns a task
/// the caller cannot actually run. Returns `None` only when every band is
/// either empty or entirely affinity-excluded, i.e. the caller should run
/// its idle task.
pub fn earliest_deadline_task(grq: &Grq, locality: &LocalityMatrix, cpu: CpuId) -> Option<TaskId> {
    let mut idx = grq.bitmap.find_first_from(0)?;
    loop {
        if idx >= PRIO_LIMIT as u16 {
            return None;
        }
        let prio = idx as u8;
        if let Some(candidate) = select_within_band(grq, locality, prio, cpu) {
            return Some(candidate);
        }
        idx = grq.bitmap.find_first_from(idx + 1)?;
    }
}

/// `t.deadline + cache_distance(t.last_cpu, cpu, t)`. A task that has never
/// run anywhere (`last_cpu == None`) carries no locality preference, so it
/// is compared on its raw deadline regardless of `cpu`.
fn adjusted_deadline(task: &Task, locality: &LocalityMatrix, cpu: CpuId) -> u64 {
    match task.last_cpu {
        Some(home) => task.deadline.saturating_add(cache_distance(locality, home, cpu, task.time_slice_us)),
        None => task.deadline,
    }
}

fn select_within_band(grq: &Grq, locality: &LocalityMatrix, prio: u8, cpu: CpuId) -> Option<TaskId> {
    let mut cur = grq.band_head(prio);
    if prio < MAX_RT_PRIO {
        while let Some(id) = cur {
            if grq.tasks.get(id).cpus_allowed.contains(cpu) {
                return Some(id);
            }
            cur = grq.next_in_band(id);
        }
        return None;
    }

    let mut best: Option<(TaskId, u64)> = None;
    while let Some(id) = cur {
        let task = grq.tasks.get(id);
        if task.cpus_allowed.contains(cpu) {
            let deadline = adjusted_deadline(task, locality, cpu);
            let better = match best {
                Some((_, best_deadline)) => deadline < best_deadline,
                None => true,
            };
            if better {
                best = Some((id, deadline));
            }
        }
        cur = grq.next_in_band(id);
    }
    best.map(|(id, _)| id)
}
