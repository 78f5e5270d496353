//! Scheduler-wide tunables and the nice-to-deadline conversion table.
//!
//! `rr_interval` and `sched_iso_cpu` are the two knobs the external
//! interface exposes (§6). They live as atomic cells on [`Tunables`] rather
//! than as `__read_mostly` module statics, per the teacher's "encapsulate
//! globals as one top-level scheduler value" pattern generalized from its
//! per-CPU-scheduler globals to this crate's single [`super::Scheduler`].

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bfs_abi::task::NICE_WIDTH;

/// `RESCHED_US` — below this many microseconds of timeslice remaining, the
/// dispatcher refills rather than lets the task keep running.
pub const RESCHED_US: u32 = 100;

/// Geometric nice-to-deadline-ratio table: `ratio[0] = 128`,
/// `ratio[i] = ratio[i-1] * 11 / 10`. Index 0 is nice -20 (fastest-advancing
/// deadline among non-RT tasks, i.e. best-treated), index 39 is nice +19.
pub const fn prio_ratios() -> [u32; NICE_WIDTH] {
    let mut table = [0u32; NICE_WIDTH];
    table[0] = 128;
    let mut i = 1;
    while i < NICE_WIDTH {
        table[i] = table[i - 1] * 11 / 10;
        i += 1;
    }
    table
}

/// Scheduler tunables, constructed once and shared by reference.
pub struct Tunables {
    /// Tick rate of the external timer source, in Hz. Consumed, never
    /// derived — the real tick source is out of this crate's scope.
    hz: u32,
    /// Round-robin base quantum in milliseconds, CPU-count scaled at
    /// construction time (§4.3) and adjustable via
    /// [`Tunables::rescale_rr_interval`] if the online CPU count changes.
    rr_interval_ms: AtomicU32,
    /// Percentage of aggregate CPU time SCHED_ISO may consume before the
    /// ISO controller goes refractory (§4.8). Default 25.
    sched_iso_cpu: AtomicU8,
    ratios: [u32; NICE_WIDTH],
}

impl Tunables {
    /// `base_rr_interval_ms` is the configured base (default 6ms per the
    /// spec); it is immediately scaled by `cpu_count` per §4.3:
    /// `rr_interval * (4*cpus + 4) / (cpus + 6)`.
    pub fn new(hz: u32, cpu_count: u32, base_rr_interval_ms: u32, sched_iso_cpu: u8) -> Self {
        let scaled = scale_rr_interval(base_rr_interval_ms, cpu_count);
        Self {
            hz,
            rr_interval_ms: AtomicU32::new(scaled),
            sched_iso_cpu: AtomicU8::new(sched_iso_cpu),
            ratios: prio_ratios(),
        }
    }

    #[inline]
    pub fn hz(&self) -> u32 {
        self.hz
    }

    #[inline]
    pub fn jiffy_ns(&self) -> u64 {
        1_000_000_000u64 / self.hz.max(1) as u64
    }

    #[inline]
    pub fn rr_interval_ms(&self) -> u32 {
        self.rr_interval_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sched_iso_cpu(&self) -> u8 {
        self.sched_iso_cpu.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_sched_iso_cpu(&self, pct: u8) {
        self.sched_iso_cpu.store(pct, Ordering::Relaxed);
    }

    /// Re-derive `rr_interval` from `base_rr_interval_ms` for a new online
    /// CPU count. Hotplug itself is out of scope; this just keeps the
    /// formula re-appliable if the caller's CPU count changes.
    pub fn rescale_rr_interval(&self, base_rr_interval_ms: u32, cpu_count: u32) {
        self.rr_interval_ms.store(
            scale_rr_interval(base_rr_interval_ms, cpu_count),
            Ordering::Relaxed,
        );
    }

    /// `prio_deadline_diff`: nanoseconds a non-RT task's deadline is placed
    /// ahead of `niffies` on refill, keyed by nice-table index (0..=39).
    pub fn deadline_diff_ns(&self, nice_index: usize) -> u64 {
        let ratio = self.ratios[nice_index.min(NICE_WIDTH - 1)] as u64;
        let rr_interval_ms = self.rr_interval_ms() as u64;
        // Deliberately matches the original's exact order of operations:
        // `ratio * rr_interval * (1_000_000 / 128)`, integer division first.
        ratio * rr_interval_ms * (1_000_000u64 / 128)
    }

    /// Fresh timeslice length in microseconds on refill: `rr_interval * 1000`.
    #[inline]
    pub fn fresh_time_slice_us(&self) -> u32 {
        self.rr_interval_ms() * 1000
    }
}

fn scale_rr_interval(base_ms: u32, cpu_count: u32) -> u32 {
    let cpus = cpu_count.max(1) as u64;
    let base = base_ms as u64;
    ((base * (4 * cpus + 4)) / (cpus + 6)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_table_is_geometric() {
        let table = prio_ratios();
        assert_eq!(table[0], 128);
        assert_eq!(table[1], 140);
        assert!(table[39] > table[0] * 30);
    }

    #[test]
    fn rr_interval_scales_with_cpu_count() {
        let one = scale_rr_interval(6, 1);
        let four = scale_rr_interval(6, 4);
        let many = scale_rr_interval(6, 64);
        assert!(one < four);
        assert!(four < many);
    }

    #[test]
    fn nice_19_deadline_diff_is_roughly_33x_nice_0() {
        let t = Tunables::new(1000, 1, 6, 25);
        let d0 = t.deadline_diff_ns(0);
        let d39 = t.deadline_diff_ns(39);
        let ratio = d39 as f64 / d0 as f64;
        // ratio[39]/ratio[0] ~= 1.1^39 ~= 34.4; squared elsewhere for the
        // wait-time ratio boundary property, but the raw deadline-diff
        // ratio itself should already be well above an order of magnitude.
        assert!(ratio > 30.0 && ratio < 40.0, "ratio was {ratio}");
    }

    #[test]
    fn fresh_time_slice_matches_rr_interval() {
        let t = Tunables::new(1000, 1, 6, 25);
        assert_eq!(t.fresh_time_slice_us(), t.rr_interval_ms() * 1000);
    }
}
