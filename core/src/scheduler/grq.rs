//! The global runqueue: the task arena, the priority-band lists, the
//! priority bitmap, and the operations §4.2 requires callers to hold the
//! GRQ lock for.
//!
//! Bands are modelled as an intrusive doubly-linked list per §9's design
//! note — "represent tasks by stable IDs into an arena rather than raw
//! aliased pointers, so removal from a band does not require unsafe pointer
//! surgery" — with `prev`/`next` stored on [`Task`] itself and each
//! [`Band`] holding only its head/tail.

use alloc::boxed::Box;
use alloc::vec;

use bfs_abi::cpu::CpuId;
use bfs_abi::task::{IDLE_PRIO, ISO_PRIO, MAX_TASKS, NORMAL_PRIO, Policy, PRIO_LIMIT, TaskId, TaskState};

use super::task::{Task, TaskFlags};
use super::tunables::Tunables;

/// Number of real, queueable bands: `0..=IDLE_PRIO`, i.e. `0..PRIO_LIMIT`.
const BAND_COUNT: usize = PRIO_LIMIT as usize;

#[derive(Clone, Copy, Default)]
struct Band {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: u32,
}

/// A fixed-capacity free-list arena of [`Task`] records indexed by
/// [`TaskId`]. `MAX_TASKS` slots are allocated once; a slot in
/// [`TaskState::Invalid`] is free and chained into the free list via its
/// `next` field (the same field used for band linkage, since a free slot is
/// never queued).
pub struct TaskTable {
    /// Boxed slice rather than `Box<[Task; MAX_TASKS]>` — `vec![x; N]`
    /// writes the arena directly into its heap allocation one slot at a
    /// time instead of building a `MAX_TASKS`-element array on the stack
    /// first, which a kernel-sized stack cannot necessarily absorb.
    slots: Box<[Task]>,
    free_head: Option<TaskId>,
    live_count: u32,
}

impl TaskTable {
    pub fn new() -> Self {
        let mut slots = vec![Task::invalid(); MAX_TASKS].into_boxed_slice();
        for i in 0..MAX_TASKS - 1 {
            slots[i].next = Some(TaskId::new(i as u32 + 1));
        }
        slots[MAX_TASKS - 1].next = None;
        Self {
            slots,
            free_head: Some(TaskId::new(0)),
            live_count: 0,
        }
    }

    /// Claim a free slot, returning its id, or `None` if the arena is full
    /// (the external interface surfaces this as `-ENOMEM`).
    pub fn alloc(&mut self) -> Option<TaskId> {
        let id = self.free_head?;
        self.free_head = self.slots[id.index()].next;
        let slot = &mut self.slots[id.index()];
        slot.next = None;
        slot.prev = None;
        slot.band = None;
        self.live_count += 1;
        Some(id)
    }

    /// Return a slot to the free list. Caller must have already dequeued
    /// the task (it must not be `is_queued()`).
    pub fn free(&mut self, id: TaskId) {
        debug_assert!(!self.slots[id.index()].is_queued());
        self.slots[id.index()] = Task::invalid();
        self.slots[id.index()].next = self.free_head;
        self.free_head = Some(id);
        self.live_count = self.live_count.saturating_sub(1);
    }

    #[inline]
    pub fn live_count(&self) -> u32 {
        self.live_count
    }

    #[inline]
    pub fn get(&self, id: TaskId) -> &Task {
        &self.slots[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.slots[id.index()]
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A 128-bit priority bitmap spanning bands `0..=PRIO_LIMIT`; bit
/// `PRIO_LIMIT` is permanently set as the "nothing else queued, run idle"
/// sentinel and is never cleared.
#[derive(Clone, Copy)]
pub struct PrioBitmap([u64; 2]);

impl PrioBitmap {
    fn new() -> Self {
        let mut bm = Self([0, 0]);
        bm.set(PRIO_LIMIT);
        bm
    }

    #[inline]
    fn set(&mut self, bit: u8) {
        self.0[bit as usize / 64] |= 1u64 << (bit as usize % 64);
    }

    #[inline]
    fn clear(&mut self, bit: u8) {
        self.0[bit as usize / 64] &= !(1u64 << (bit as usize % 64));
    }

    #[inline]
    pub fn is_set(&self, bit: u8) -> bool {
        self.0[bit as usize / 64] & (1u64 << (bit as usize % 64)) != 0
    }

    /// Lowest set bit at or after `start`, scanning up through `PRIO_LIMIT`.
    pub fn find_first_from(&self, start: u16) -> Option<u16> {
        let mut word = (start / 64) as usize;
        let mut shift = (start % 64) as u32;
        while word < self.0.len() {
            let masked = self.0[word] >> shift;
            if masked != 0 {
                return Some((word as u16) * 64 + shift as u16 + masked.trailing_zeros() as u16);
            }
            word += 1;
            shift = 0;
        }
        None
    }
}

impl Default for PrioBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// §4.3 "on refill": give `task` a fresh quantum and push its virtual
/// deadline `prio_deadline_diff(nice)` niffies-nanoseconds past `niffies`.
/// Called by the dispatcher when the outgoing task's timeslice has all but
/// run out (or it's `BATCH`), and by fork when a child needs a deadline of
/// its own rather than a half-share of its parent's.
pub fn refill_deadline(task: &mut Task, niffies: u64, tunables: &Tunables) {
    task.time_slice_us = tunables.fresh_time_slice_us();
    task.deadline = niffies + tunables.deadline_diff_ns(task.nice.table_index());
}

/// Effective-priority rule (§4.2): RT maps to its fixed RT band; IDLEPRIO
/// maps to `IDLE_PRIO` only while the task is presently suitable for it;
/// ISO maps to `ISO_PRIO` unless the quota controller is refractory;
/// everything else (including ISO while refractory, and BATCH) runs at
/// `NORMAL_PRIO`. Priority-inheritance boosts are applied by the caller
/// afterward by setting `prio` directly — this function never sees them.
pub fn effective_prio(task: &Task, iso_refractory: bool) -> u8 {
    match task.policy {
        Policy::Fifo(rt) | Policy::RoundRobin(rt) => rt.sched_prio(),
        Policy::IdlePrio if task.idleprio_suitable() => IDLE_PRIO,
        Policy::Iso if !iso_refractory => ISO_PRIO,
        _ => NORMAL_PRIO,
    }
}

/// The global runqueue: the task arena, its priority bands, and the
/// counters §3's invariants are stated over. Every method here requires
/// the caller to already hold the GRQ lock (modelled by requiring `&mut
/// self`, obtained only through [`super::Scheduler`]'s single
/// `IrqMutex<Grq>`).
pub struct Grq {
    pub tasks: TaskTable,
    bands: [Band; BAND_COUNT],
    pub bitmap: PrioBitmap,
    pub niffies: u64,
    /// Tasks queued in GRQ, not currently running anywhere.
    pub nr_running: u32,
    pub nr_uninterruptible: u32,
    pub nr_iowait: u32,
    /// "Queued not running" — tasks linked in a band right now.
    pub qnr: u32,
    pub switches: u64,
}

impl Grq {
    pub fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            bands: [Band::default(); BAND_COUNT],
            bitmap: PrioBitmap::new(),
            niffies: 0,
            nr_running: 0,
            nr_uninterruptible: 0,
            nr_iowait: 0,
            qnr: 0,
            switches: 0,
        }
    }

    fn band_mut(&mut self, prio: u8) -> &mut Band {
        &mut self.bands[prio as usize]
    }

    #[inline]
    pub fn band_len(&self, prio: u8) -> u32 {
        self.bands[prio as usize].len
    }

    #[inline]
    pub fn band_head(&self, prio: u8) -> Option<TaskId> {
        self.bands[prio as usize].head
    }

    pub fn next_in_band(&self, id: TaskId) -> Option<TaskId> {
        self.tasks.get(id).next
    }

    /// Append `id` to the tail of band `prio`.
    pub fn enqueue(&mut self, id: TaskId, prio: u8) {
        debug_assert!(!self.tasks.get(id).is_queued());
        let old_tail = self.bands[prio as usize].tail;
        {
            let task = self.tasks.get_mut(id);
            task.band = Some(prio);
            task.prev = old_tail;
            task.next = None;
        }
        if let Some(tail) = old_tail {
            self.tasks.get_mut(tail).next = Some(id);
        } else {
            self.band_mut(prio).head = Some(id);
        }
        self.band_mut(prio).tail = Some(id);
        self.band_mut(prio).len += 1;
        self.bitmap.set(prio);
    }

    /// Push `id` to the front of band `prio` — used only to activate the
    /// idle task, which must always win ties at the head of its band.
    pub fn enqueue_head(&mut self, id: TaskId, prio: u8) {
        debug_assert!(!self.tasks.get(id).is_queued());
        let old_head = self.bands[prio as usize].head;
        {
            let task = self.tasks.get_mut(id);
            task.band = Some(prio);
            task.prev = None;
            task.next = old_head;
        }
        if let Some(head) = old_head {
            self.tasks.get_mut(head).prev = Some(id);
        } else {
            self.band_mut(prio).tail = Some(id);
        }
        self.band_mut(prio).head = Some(id);
        self.band_mut(prio).len += 1;
        self.bitmap.set(prio);
    }

    /// Unlink `id` from its band, clearing the band's bitmap bit if it is
    /// now empty.
    pub fn dequeue(&mut self, id: TaskId) {
        let Some(prio) = self.tasks.get(id).band else {
            return;
        };
        let (prev, next) = {
            let task = self.tasks.get(id);
            (task.prev, task.next)
        };
        match prev {
            Some(p) => self.tasks.get_mut(p).next = next,
            None => self.band_mut(prio).head = next,
        }
        match next {
            Some(n) => self.tasks.get_mut(n).prev = prev,
            None => self.band_mut(prio).tail = prev,
        }
        {
            let task = self.tasks.get_mut(id);
            task.band = None;
            task.prev = None;
            task.next = None;
        }
        let band = self.band_mut(prio);
        band.len = band.len.saturating_sub(1);
        if band.len == 0 {
            self.bitmap.clear(prio);
        }
    }

    /// Bookkeeping-only touch for a task that stays exactly where it is.
    /// BFS never needs to physically move a task within its band to keep
    /// deadline ordering correct — the selector re-derives the winner by
    /// direct deadline comparison at every `schedule()`, not by list
    /// position — so this is intentionally a no-op.
    #[inline]
    pub fn requeue(&mut self, _id: TaskId) {}

    /// Place a freshly-runnable task onto the GRQ: recompute its effective
    /// priority and link it into that band. Caller has already set
    /// `task.state = Runnable`.
    pub fn activate(&mut self, id: TaskId, iso_refractory: bool) {
        {
            let task = self.tasks.get_mut(id);
            if task.flags.contains(TaskFlags::CONTRIBUTES_TO_LOAD) {
                task.flags.remove(TaskFlags::CONTRIBUTES_TO_LOAD);
                self.nr_uninterruptible = self.nr_uninterruptible.saturating_sub(1);
            }
            if task.flags.contains(TaskFlags::IO_WAITING) {
                task.flags.remove(TaskFlags::IO_WAITING);
                self.nr_iowait = self.nr_iowait.saturating_sub(1);
            }
        }
        let prio = effective_prio(self.tasks.get(id), iso_refractory);
        self.tasks.get_mut(id).prio = prio;
        self.enqueue(id, prio);
        self.nr_running += 1;
        self.qnr += 1;
    }

    /// Remove a task from the runnable count because it is blocking.
    /// Caller ensures the task is not presently queued.
    pub fn deactivate(&mut self, id: TaskId) {
        let task = self.tasks.get_mut(id);
        if task.state.is_blocked() && task.state == TaskState::Uninterruptible {
            task.flags.insert(TaskFlags::CONTRIBUTES_TO_LOAD);
            self.nr_uninterruptible += 1;
        }
        if task.flags.contains(TaskFlags::IO_WAITING) {
            self.nr_iowait += 1;
        }
        self.nr_running = self.nr_running.saturating_sub(1);
    }

    /// A CPU has chosen to run `id`: record which CPU, unlink it from the
    /// GRQ, and drop it from the queued-not-running count.
    pub fn take(&mut self, id: TaskId, cpu: CpuId) {
        let task = self.tasks.get_mut(id);
        task.last_cpu = Some(cpu);
        task.on_cpu = true;
        self.dequeue(id);
        self.qnr = self.qnr.saturating_sub(1);
    }

    /// A CPU is done running `id` for now: either it deactivates (blocks or
    /// exits) or it goes back onto the GRQ at its (possibly just-refilled)
    /// priority.
    pub fn return_task(&mut self, id: TaskId, should_deactivate: bool) {
        self.tasks.get_mut(id).on_cpu = false;
        if should_deactivate {
            self.deactivate(id);
        } else {
            self.qnr += 1;
            let prio = self.tasks.get(id).prio;
            self.enqueue(id, prio);
        }
    }
}

impl Default for Grq {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_abi::cpu::CpuMask;
    use bfs_abi::task::NORMAL_PRIO;

    fn fresh_task(grq: &mut Grq) -> TaskId {
        let id = grq.tasks.alloc().unwrap();
        let t = grq.tasks.get_mut(id);
        t.policy = Policy::Normal;
        t.cpus_allowed = CpuMask::all(4);
        t.state = TaskState::Runnable;
        id
    }

    #[test]
    fn enqueue_sets_bitmap_dequeue_clears_it() {
        let mut grq = Grq::new();
        let id = fresh_task(&mut grq);
        assert!(!grq.bitmap.is_set(NORMAL_PRIO));
        grq.enqueue(id, NORMAL_PRIO);
        assert!(grq.bitmap.is_set(NORMAL_PRIO));
        assert_eq!(grq.band_len(NORMAL_PRIO), 1);
        grq.dequeue(id);
        assert!(!grq.bitmap.is_set(NORMAL_PRIO));
        assert_eq!(grq.band_len(NORMAL_PRIO), 0);
    }

    #[test]
    fn enqueue_dequeue_restores_prior_structural_state() {
        let mut grq = Grq::new();
        let a = fresh_task(&mut grq);
        let b = fresh_task(&mut grq);
        grq.enqueue(a, NORMAL_PRIO);
        grq.enqueue(b, NORMAL_PRIO);
        assert_eq!(grq.band_head(NORMAL_PRIO), Some(a));
        grq.dequeue(b);
        assert_eq!(grq.band_len(NORMAL_PRIO), 1);
        assert_eq!(grq.band_head(NORMAL_PRIO), Some(a));
        grq.dequeue(a);
        assert_eq!(grq.band_len(NORMAL_PRIO), 0);
        assert!(grq.band_head(NORMAL_PRIO).is_none());
    }

    #[test]
    fn fifo_order_within_a_band() {
        let mut grq = Grq::new();
        let a = fresh_task(&mut grq);
        let b = fresh_task(&mut grq);
        let c = fresh_task(&mut grq);
        grq.enqueue(a, NORMAL_PRIO);
        grq.enqueue(b, NORMAL_PRIO);
        grq.enqueue(c, NORMAL_PRIO);
        assert_eq!(grq.band_head(NORMAL_PRIO), Some(a));
        assert_eq!(grq.next_in_band(a), Some(b));
        assert_eq!(grq.next_in_band(b), Some(c));
    }

    #[test]
    fn activate_deactivate_track_nr_running() {
        let mut grq = Grq::new();
        let id = fresh_task(&mut grq);
        grq.activate(id, false);
        assert_eq!(grq.nr_running, 1);
        assert_eq!(grq.qnr, 1);
        grq.take(id, CpuId::new(0));
        assert_eq!(grq.qnr, 0);
        grq.tasks.get_mut(id).state = TaskState::Uninterruptible;
        grq.return_task(id, true);
        assert_eq!(grq.nr_running, 0);
        assert_eq!(grq.nr_uninterruptible, 1);
    }

    #[test]
    fn free_slot_is_reused() {
        let mut grq = Grq::new();
        let a = grq.tasks.alloc().unwrap();
        assert_eq!(grq.tasks.live_count(), 1);
        grq.tasks.free(a);
        assert_eq!(grq.tasks.live_count(), 0);
        let b = grq.tasks.alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn arena_exhausts_cleanly() {
        let mut grq = Grq::new();
        for _ in 0..MAX_TASKS {
            assert!(grq.tasks.alloc().is_some());
        }
        assert!(grq.tasks.alloc().is_none());
    }

    #[test]
    fn refill_deadline_grants_a_fresh_slice_and_pushes_the_deadline_out() {
        let mut grq = Grq::new();
        grq.niffies = 1_000_000;
        let tunables = Tunables::new(1000, 1, 6, 25);
        let id = fresh_task(&mut grq);
        grq.tasks.get_mut(id).time_slice_us = 10;
        grq.tasks.get_mut(id).deadline = 500;
        refill_deadline(grq.tasks.get_mut(id), grq.niffies, &tunables);
        let t = grq.tasks.get(id);
        assert_eq!(t.time_slice_us, tunables.fresh_time_slice_us());
        assert!(t.deadline > grq.niffies);
    }
}
