// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Locking and thread signaling.
//!
//! [`Lock`] is a two-variant lock selected at construction: a userspace
//! spin lock for short in-process critical sections, or an OS mutex for
//! anything that may hold the lock across a blocking call. Both hand out
//! the same RAII guard. [`Signal`] is a latched condition: a signal
//! delivered before the wait is not lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Which locking strategy a [`Lock`] uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    /// Busy-wait on an atomic flag. Cheap when contention is short.
    Spin,
    /// OS mutex (parking_lot). Sleeps the thread under contention.
    Native,
}

enum Inner {
    Spin(AtomicBool),
    Native(Mutex<()>),
}

/// Lock with a construction-time strategy choice.
pub struct Lock {
    inner: Inner,
}

impl Lock {
    pub fn new(kind: LockKind) -> Self {
        let inner = match kind {
            LockKind::Spin => Inner::Spin(AtomicBool::new(false)),
            LockKind::Native => Inner::Native(Mutex::new(())),
        };
        Self { inner }
    }

    pub fn kind(&self) -> LockKind {
        match &self.inner {
            Inner::Spin(_) => LockKind::Spin,
            Inner::Native(_) => LockKind::Native,
        }
    }

    /// Acquire, blocking (or spinning) until the lock is free.
    pub fn lock(&self) -> LockGuard<'_> {
        match &self.inner {
            Inner::Spin(flag) => {
                while flag
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::hint::spin_loop();
                }
                LockGuard {
                    held: Held::Spin(flag),
                }
            }
            Inner::Native(mutex) => LockGuard {
                held: Held::Native(mutex.lock()),
            },
        }
    }

    /// Acquire without waiting; `None` if the lock is held.
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        match &self.inner {
            Inner::Spin(flag) => flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
                .then_some(LockGuard {
                    held: Held::Spin(flag),
                }),
            Inner::Native(mutex) => mutex.try_lock().map(|guard| LockGuard {
                held: Held::Native(guard),
            }),
        }
    }
}

enum Held<'a> {
    Spin(&'a AtomicBool),
    // held only for its Drop
    Native(#[allow(dead_code)] MutexGuard<'a, ()>),
}

/// RAII guard; dropping it releases the [`Lock`].
pub struct LockGuard<'a> {
    held: Held<'a>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Held::Spin(flag) = &self.held {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Outcome of [`Signal::wait_timeout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// Latched one-shot signal between threads.
///
/// `signal` sets the latch and wakes one waiter; a wait observing a set
/// latch clears it and returns immediately, so signal-before-wait never
/// blocks the waiter.
pub struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Set the latch and wake one waiter.
    pub fn signal(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_one();
    }

    /// Wait until signaled, consuming the latch.
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
        *set = false;
    }

    /// Wait until signaled or `timeout` elapses, consuming the latch if
    /// it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                return WaitOutcome::TimedOut;
            }
        }
        *set = false;
        WaitOutcome::Signaled
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
