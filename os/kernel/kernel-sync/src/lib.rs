//! # Kernel synchronization primitives
//!
//! The memory manager runs on a single logical CPU with cooperative task
//! switching, so a lock is either free or held by a task that will give the CPU
//! back eventually. [`SpinLock`] therefore offers two ways to wait:
//!
//! * [`SpinLock::lock`] busy-waits with [`core::hint::spin_loop`], for callers
//!   that cannot be descheduled (interrupt context, early boot).
//! * [`SpinLock::lock_yielding`] runs a caller-supplied `relax` hook between
//!   attempts, typically the scheduler's yield.
//!
//! None of the locks are re-entrant: acquiring a lock the current task already
//! holds spins forever.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
