//! Blocking primitives the engine sleeps on.
//!
//! - [`Rendez`]: sleep until a predicate holds (optionally with a timeout),
//!   woken by whoever changed the predicate's inputs.
//! - [`Completion`]: counting completion. Signallers bump the count, a waiter
//!   consumes N signals.
//!
//! Both sit on `parking_lot::{Mutex, Condvar}`. The predicate of a
//! [`Rendez`] is evaluated with the rendezvous lock held and wakers take that
//! lock before notifying, so a wakeup cannot fall between the check and the
//! sleep.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Sleep-until-predicate / wake rendezvous.
#[derive(Debug, Default)]
pub struct Rendez {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Rendez {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Block until `cond` is true. Returns the final value of `cond`, which is
    /// `false` only if `timeout` elapsed first.
    pub fn sleep_timeout(&self, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while !cond() {
            if self.cv.wait_until(&mut guard, deadline).timed_out() {
                return cond();
            }
        }
        true
    }

    /// Block until `cond` is true, however long that takes.
    pub fn sleep(&self, mut cond: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while !cond() {
            self.cv.wait(&mut guard);
        }
    }

    pub fn wakeup(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }
}

/// Counting completion: `signal` N times, `wait(N)` once.
#[derive(Debug, Default)]
pub struct Completion {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Completion {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Post one signal.
    ///
    /// The notify happens with the lock held: a waiter cannot observe the new
    /// count and free the completion until this call has stopped touching it.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_all();
    }

    /// Consume `n` signals, blocking until all have arrived.
    pub fn wait(&self, n: usize) {
        let mut count = self.count.lock();
        while *count < n {
            self.cv.wait(&mut count);
        }
        *count -= n;
    }

    /// Consume `n` signals if they arrive within `timeout`. Nothing is
    /// consumed on timeout.
    pub fn wait_timeout(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count < n {
            if self.cv.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count < n {
            return false;
        }
        *count -= n;
        true
    }

    /// Signals posted but not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.count.lock()
    }
}
