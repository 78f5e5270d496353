//! Per-CPU bookkeeping, indexed explicitly by [`CpuId`] rather than by any
//! implicit "current CPU" register lookup.
//!
//! Real kernels typically resolve "the current CPU" through a segment
//! register or equivalent; that plumbing is owned by the surrounding kernel,
//! not by this crate. Every call site here already knows which CPU it is
//! acting on — callers running on a CPU's own behalf pass their own id,
//! callers steering another CPU pass that CPU's id explicitly.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bfs_abi::cpu::{CpuId, MAX_CPUS};

struct Slot {
    preempt_count: AtomicU32,
    reschedule_pending: AtomicBool,
    online: AtomicBool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            preempt_count: AtomicU32::new(0),
            reschedule_pending: AtomicBool::new(false),
            online: AtomicBool::new(false),
        }
    }
}

const SLOT_INIT: Slot = Slot::new();

/// One [`Slot`] per addressable CPU, filled in lazily as CPUs come online.
static SLOTS: [Slot; MAX_CPUS] = [SLOT_INIT; MAX_CPUS];

/// Mark a CPU as online and participating in scheduling decisions.
pub fn mark_online(cpu: CpuId) {
    SLOTS[cpu.index()].online.store(true, Ordering::Release);
}

/// Mark a CPU as offline (not a target for wakeups or preemption).
pub fn mark_offline(cpu: CpuId) {
    SLOTS[cpu.index()].online.store(false, Ordering::Release);
}

pub fn is_online(cpu: CpuId) -> bool {
    SLOTS[cpu.index()].online.load(Ordering::Acquire)
}

/// RAII guard that disables preemption on `cpu` while held. Nestable —
/// preemption re-enables only once every guard on that CPU has dropped.
#[must_use = "if unused, preemption will be immediately re-enabled"]
pub struct PreemptGuard {
    cpu: CpuId,
}

impl PreemptGuard {
    #[inline]
    pub fn new(cpu: CpuId) -> Self {
        SLOTS[cpu.index()]
            .preempt_count
            .fetch_add(1, Ordering::Relaxed);
        Self { cpu }
    }

    #[inline]
    pub fn is_active(cpu: CpuId) -> bool {
        SLOTS[cpu.index()].preempt_count.load(Ordering::Relaxed) > 0
    }

    #[inline]
    pub fn count(cpu: CpuId) -> u32 {
        SLOTS[cpu.index()].preempt_count.load(Ordering::Relaxed)
    }

    /// Record that a reschedule is owed to `cpu` once preemption there
    /// becomes enabled again.
    #[inline]
    pub fn set_reschedule_pending(cpu: CpuId) {
        SLOTS[cpu.index()]
            .reschedule_pending
            .store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_reschedule_pending(cpu: CpuId) -> bool {
        SLOTS[cpu.index()]
            .reschedule_pending
            .load(Ordering::Acquire)
    }

    #[inline]
    pub fn clear_reschedule_pending(cpu: CpuId) {
        SLOTS[cpu.index()]
            .reschedule_pending
            .store(false, Ordering::Release);
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        let slot = &SLOTS[self.cpu.index()];
        let prev = slot.preempt_count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "preempt_count underflow");
        // The caller is responsible for observing `is_reschedule_pending`
        // once nesting reaches zero and invoking the scheduler's own
        // reschedule path; this crate has no scheduler of its own to call
        // back into.
    }
}
