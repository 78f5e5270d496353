//! The global monotonic nanosecond clock ("niffies").
//!
//! Deadlines are compared across CPUs, so a single global clock is needed
//! even though each CPU has its own (possibly drifting, possibly
//! jump-capable) hardware clock source. `niffies` only ever advances while
//! the GRQ lock is held, and only the CPU currently holding the lock may
//! advance it, folding in the delta its own clock has accumulated since it
//! last did so.

/// One jiffy's worth of nanoseconds for a 1000Hz tick, used only to sanity
/// bound a single clock update; the real jiffy duration is `1_000_000_000 /
/// hz` and is threaded through from [`super::tunables::Tunables`].
const MIN_NDIFF_NS: u64 = 1_000;

/// Per-CPU bookkeeping needed to fold a CPU's own clock reading into the
/// shared `niffies` counter. Lives inside the per-CPU projection
/// ([`super::per_cpu::CpuRq`]); single-writer except for the brief window
/// where the GRQ lock is held by that same CPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClockState {
    /// This CPU's own monotonic clock, as last observed.
    pub clock: u64,
    /// `clock` as of the previous `update_clocks` call.
    pub old_clock: u64,
    /// `niffies` as of the previous `update_clocks` call by this CPU.
    pub last_niffy: u64,
}

/// Fold `now_ns` (this CPU's own clock reading, an external collaborator
/// value — `sched_clock_cpu(cpu)` per the scheduler's external interface)
/// into the shared `niffies` counter, returning the new value.
///
/// `jiffy_ns` bounds the sanity clamp: a per-CPU clock source is allowed to
/// jump (some platforms' TSC-like sources do across deep sleep states), so
/// a nonsensical delta is clamped to a single microsecond rather than
/// propagated into every deadline comparison on the system.
pub fn update_clocks(state: &mut ClockState, niffies: u64, now_ns: u64, jiffy_ns: u64) -> u64 {
    state.clock = now_ns;
    let raw = state.clock.wrapping_sub(state.old_clock);
    let accounted = niffies.wrapping_sub(state.last_niffy);
    let ndiff = raw.saturating_sub(accounted);

    let max_ndiff = jiffy_ns.saturating_add(jiffy_ns);
    let ndiff = if ndiff < MIN_NDIFF_NS || ndiff > max_ndiff {
        MIN_NDIFF_NS
    } else {
        ndiff
    };

    let next = niffies.saturating_add(ndiff);
    state.old_clock = state.clock;
    state.last_niffy = next;
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_delta_passes_through() {
        let mut st = ClockState::default();
        let n0 = update_clocks(&mut st, 0, 5_000, 1_000_000);
        assert_eq!(n0, 5_000);
        let n1 = update_clocks(&mut st, n0, 15_000, 1_000_000);
        assert_eq!(n1, 15_000);
    }

    #[test]
    fn clamps_negative_or_huge_jump() {
        let mut st = ClockState {
            clock: 10_000,
            old_clock: 10_000,
            last_niffy: 10_000,
        };
        // Backwards jump (e.g. TSC reset) clamps to MIN_NDIFF_NS.
        let n = update_clocks(&mut st, 10_000, 9_000, 1_000_000);
        assert_eq!(n, 10_000 + MIN_NDIFF_NS);

        let mut st2 = ClockState {
            clock: 0,
            old_clock: 0,
            last_niffy: 0,
        };
        // Huge forward jump clamps too.
        let n2 = update_clocks(&mut st2, 0, 10_000_000_000, 1_000_000);
        assert_eq!(n2, MIN_NDIFF_NS);
    }

    #[test]
    fn monotonic_across_many_updates() {
        let mut st = ClockState::default();
        let mut niffies = 0u64;
        let mut now = 0u64;
        for step in 1..=100u64 {
            now += step * 1000;
            let next = update_clocks(&mut st, niffies, now, 1_000_000);
            assert!(next >= niffies);
            niffies = next;
        }
    }
}
