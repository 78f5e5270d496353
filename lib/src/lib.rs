#![cfg_attr(not(test), no_std)]

//! Ambient services the scheduler core is built on: locking, logging,
//! one-shot initialization and per-CPU preemption bookkeeping. None of this
//! is scheduling policy — it is the substrate `bfs-core` assumes is already
//! there, the same way the teacher's `lib` crate underpins its own
//! `core` scheduler.

pub mod klog;
pub mod once_lock;
pub mod percpu;
pub mod spinlock;

pub use klog::{KlogLevel, klog_get_level, klog_is_enabled, klog_register_backend, klog_set_level};
pub use once_lock::OnceLock;
pub use percpu::PreemptGuard;
pub use spinlock::{IrqMutex, IrqMutexGuard, IrqRwLock, IrqRwLockReadGuard, IrqRwLockWriteGuard};
