//! A ticket-lock mutex with panic-recovery poisoning semantics.
//!
//! Masking real interrupts while a lock is held is the owning kernel's job —
//! this crate only disables preemption (via [`crate::percpu::PreemptGuard`])
//! for the duration of the critical section and leaves interrupt control to
//! whatever external collaborator owns the interrupt controller. Callers
//! that also need interrupts masked should do so around `lock()` themselves.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use bfs_abi::cpu::CpuId;

use crate::percpu::PreemptGuard;

/// Mutex using a **ticket lock** internally for FIFO fairness: each acquirer
/// takes a monotonically-increasing ticket and spins until `now_serving`
/// matches. This guarantees CPUs acquire the lock in the order they
/// requested it, eliminating starvation under SMP contention.
///
/// Supports poisoning semantics for panic recovery: after a panic-time
/// force-unlock via `poison_unlock()`, the mutex is marked poisoned.
/// Callers can check `is_poisoned()` to determine if the protected data
/// may be in an inconsistent state and needs reinitialization.
pub struct IrqMutex<T> {
    next_ticket: AtomicU16,
    now_serving: AtomicU16,
    poisoned: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex provides exclusive access through ticket-lock acquisition,
// making it safe to share across contexts.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    _preempt: PreemptGuard,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            poisoned: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Force unlock the mutex without proper guard handling.
    ///
    /// # Safety
    /// Only safe to call when the caller knows no code is currently
    /// executing with this lock held (e.g. panic recovery) and the
    /// protected data is either consistent or will be reinitialized.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        self.now_serving
            .store(self.next_ticket.load(Ordering::Relaxed), Ordering::Release);
    }

    /// Force unlock the mutex AND mark it as poisoned.
    ///
    /// # Safety
    /// Same requirements as [`force_unlock`](Self::force_unlock).
    #[inline]
    pub unsafe fn poison_unlock(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.now_serving
            .store(self.next_ticket.load(Ordering::Relaxed), Ordering::Release);
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Clear the poisoned state after the protected data has been
    /// reinitialized and its invariants restored.
    #[inline]
    pub fn clear_poison(&self) {
        self.poisoned.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self, cpu: CpuId) -> IrqMutexGuard<'_, T> {
        let preempt = PreemptGuard::new(cpu);
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            // Proportional backoff: pause once per ticket of distance, capped.
            let distance = my_ticket.wrapping_sub(serving) as u32;
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }

        IrqMutexGuard {
            mutex: self,
            _preempt: preempt,
        }
    }

    #[inline]
    pub fn try_lock(&self, cpu: CpuId) -> Option<IrqMutexGuard<'_, T>> {
        let preempt = PreemptGuard::new(cpu);
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                _preempt: preempt,
            })
        } else {
            drop(preempt);
            None
        }
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        // _preempt drops after this, potentially leaving a reschedule owed.
    }
}

// =============================================================================
// IrqRwLock - writer-preferring reader-writer lock
// =============================================================================

/// Multiple readers can hold this lock simultaneously, but a writer gets
/// exclusive access and new readers yield once a writer is waiting, to
/// prevent writer starvation under continuous read traffic.
pub struct IrqRwLock<T> {
    /// 0 = unlocked, -1 = write-locked, >0 = reader count.
    state: core::sync::atomic::AtomicI32,
    writer_waiting: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for IrqRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for IrqRwLock<T> {}

pub struct IrqRwLockReadGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    _preempt: PreemptGuard,
}

pub struct IrqRwLockWriteGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    _preempt: PreemptGuard,
}

impl<T> IrqRwLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            state: core::sync::atomic::AtomicI32::new(0),
            writer_waiting: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn read(&self, cpu: CpuId) -> IrqRwLockReadGuard<'_, T> {
        let preempt = PreemptGuard::new(cpu);
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state >= 0 && self.writer_waiting.load(Ordering::Relaxed) == 0 {
                if self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return IrqRwLockReadGuard {
                        lock: self,
                        _preempt: preempt,
                    };
                }
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn write(&self, cpu: CpuId) -> IrqRwLockWriteGuard<'_, T> {
        let preempt = PreemptGuard::new(cpu);
        self.writer_waiting.fetch_add(1, Ordering::Relaxed);
        loop {
            if self
                .state
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writer_waiting.fetch_sub(1, Ordering::Relaxed);
                return IrqRwLockWriteGuard {
                    lock: self,
                    _preempt: preempt,
                };
            }
            spin_loop();
        }
    }
}

impl<'a, T> Deref for IrqRwLockReadGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<'a, T> Deref for IrqRwLockWriteGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_excludes_and_releases() {
        let cpu = CpuId::new(0);
        let m = IrqMutex::new(0u32);
        {
            let mut g = m.lock(cpu);
            *g += 1;
        }
        assert!(!m.is_locked());
        assert_eq!(*m.lock(cpu), 1);
    }

    #[test]
    fn poison_round_trips() {
        let m = IrqMutex::new(());
        assert!(!m.is_poisoned());
        unsafe { m.poison_unlock() };
        assert!(m.is_poisoned());
        m.clear_poison();
        assert!(!m.is_poisoned());
    }

    #[test]
    fn rwlock_allows_concurrent_reads() {
        let cpu = CpuId::new(0);
        let l = IrqRwLock::new(5u32);
        let r1 = l.read(cpu);
        let r2 = l.read(cpu);
        assert_eq!(*r1, 5);
        assert_eq!(*r2, 5);
        drop(r1);
        drop(r2);
        let mut w = l.write(cpu);
        *w = 6;
        drop(w);
        assert_eq!(*l.read(cpu), 6);
    }
}
