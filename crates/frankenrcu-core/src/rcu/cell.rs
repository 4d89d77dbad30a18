//! RCU-protected pointer cell.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::{Rcu, rcu_read_lock, rcu_read_unlock};

/// A heap value that readers access without locks and writers replace
/// wholesale. Old versions are freed after a grace period.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
    rcu: Arc<Rcu>,
}

// SAFETY: the cell hands out `&T` to many threads and drops `T` on a runner
// thread, so it needs exactly what `Arc<T>` needs.
unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

impl<T: Send + Sync + 'static> RcuCell<T> {
    pub fn new(rcu: Arc<Rcu>, value: T) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            rcu,
        }
    }

    /// Run `f` on the current version inside a read-side section.
    ///
    /// # Safety
    ///
    /// The calling thread's core must not pass through a quiescent state
    /// while `f` runs: no `report_qs()` for it, and the topology must not
    /// describe it as idle or in user mode.
    pub unsafe fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        rcu_read_lock();
        // SeqCst pairs with the coordinator's GP-start store: a reader that
        // started after the hint was sampled sees the newest pointer.
        let cur = self.ptr.load(Ordering::SeqCst);
        // SAFETY: never null; the version is only reclaimed after a GP, and
        // the caller guarantees no GP can end while `f` runs.
        let out = f(unsafe { &*cur });
        rcu_read_unlock();
        out
    }

    /// Publish `value`; the previous version is dropped after a grace period.
    pub fn replace(&self, value: T) {
        let old = Retired(self.ptr.swap(Box::into_raw(Box::new(value)), Ordering::AcqRel));
        self.rcu.call_rcu_fn(move || old.reclaim());
    }

    /// Publish `value` and wait out a grace period, returning the old version.
    ///
    /// # Panics
    ///
    /// When called from an RCU thread.
    pub fn replace_sync(&self, value: T) -> T {
        let old = self.ptr.swap(Box::into_raw(Box::new(value)), Ordering::AcqRel);
        self.rcu.synchronize_rcu();
        // SAFETY: unreachable for new readers, and every reader that could
        // have seen it finished during the grace period.
        *unsafe { Box::from_raw(old) }
    }

    #[must_use]
    pub fn rcu(&self) -> &Arc<Rcu> {
        &self.rcu
    }
}

/// Unpublished version waiting for its grace period.
struct Retired<T>(*mut T);

// SAFETY: the pointee is `Send` and nobody else owns it once unpublished.
unsafe impl<T: Send> Send for Retired<T> {}

impl<T> Retired<T> {
    fn reclaim(self) {
        // SAFETY: came from `Box::into_raw`; runs after the grace period, so
        // no reader still holds a reference.
        drop(unsafe { Box::from_raw(self.0) });
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out readers of the current version.
        drop(unsafe { Box::from_raw(*self.ptr.get_mut()) });
    }
}
