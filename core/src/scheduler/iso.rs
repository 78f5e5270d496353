//! The SCHED_ISO quota controller (§4.8).
//!
//! Guards its own leaf spinlock in the real kernel, separate from the GRQ
//! lock — here that's modelled by giving [`IsoController`] its own
//! [`bfs_lib::IrqMutex`] at the [`super::Scheduler`] level rather than
//! nesting it inside the GRQ-locked state, preserving the lock-ordering
//! contract from §5 (`pi_lock` → `grq.lock` → `iso_lock`, leaf last).

use bfs_lib::klog_info;

/// `iso_ticks` is scaled in increments of 100 per tick (§4.8) so that the
/// refractory threshold comparison stays in integer arithmetic without
/// dividing by the tick's fractional share up front.
const ISO_TICK_CREDIT: u32 = 100;

pub struct IsoController {
    iso_ticks: u32,
    refractory: bool,
    /// `5 * HZ * online_cpus + 1`, fixed at construction.
    period: u32,
}

impl IsoController {
    pub fn new(hz: u32, cpu_count: u32) -> Self {
        let period = 5u32
            .saturating_mul(hz)
            .saturating_mul(cpu_count.max(1))
            .saturating_add(1);
        Self {
            iso_ticks: 0,
            refractory: false,
            period,
        }
    }

    #[inline]
    pub fn is_refractory(&self) -> bool {
        self.refractory
    }

    #[inline]
    pub fn period(&self) -> u32 {
        self.period
    }

    #[inline]
    pub fn iso_ticks(&self) -> u32 {
        self.iso_ticks
    }

    /// Called from the tick handler when the running task is RT, or ISO and
    /// not currently refractory. Capped at `period * 100`, not `period` —
    /// the engage threshold is `period * sched_iso_cpu` (up to `period *
    /// 100`), so capping any lower would make refractory unreachable.
    pub fn tick_rt_or_iso(&mut self, sched_iso_cpu: u8) {
        self.iso_ticks = (self.iso_ticks + ISO_TICK_CREDIT).min(self.period.saturating_mul(100));
        self.update_refractory(sched_iso_cpu);
    }

    /// Called from the tick handler for every other running task, gently
    /// decaying the accumulated ISO share back toward zero.
    pub fn tick_other(&mut self, sched_iso_cpu: u8) {
        let decay = self.iso_ticks / self.period.max(1) + 1;
        self.iso_ticks = self.iso_ticks.saturating_sub(decay);
        self.update_refractory(sched_iso_cpu);
    }

    fn update_refractory(&mut self, sched_iso_cpu: u8) {
        let period = self.period as u64;
        let ticks = self.iso_ticks as u64;
        let pct = sched_iso_cpu as u64;

        if !self.refractory && ticks > period * pct {
            self.refractory = true;
            klog_info!(
                "SCHED: ISO refractory engaged (iso_ticks={} > period*pct={})",
                self.iso_ticks,
                period * pct
            );
        } else if self.refractory && ticks * 128 < period * pct * 115 {
            self.refractory = false;
            klog_info!("SCHED: ISO refractory cleared (10% hysteresis)");
        }
    }
}
