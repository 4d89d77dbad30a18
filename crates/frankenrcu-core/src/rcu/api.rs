//! Writer-side and reporting API.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};

use serde::Serialize;

use crate::events::RcuEvent;
use crate::sync::Completion;

use super::head::boxed_callback;
use super::{Rcu, RcuCallback, RcuHead, assert_not_rcu_thread, gp_lt};

/// Snapshot from [`Rcu::get_state_synchronize_rcu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GpCookie(u64);

impl GpCookie {
    #[must_use]
    pub fn gpnum(self) -> u64 {
        self.0
    }
}

/// Stack (or barrier-array) record a blocked caller waits on.
#[repr(C)]
struct SyncBlob {
    head: RcuHead,
    done: *const Completion,
}

impl SyncBlob {
    fn new(done: &Completion) -> Self {
        Self {
            head: RcuHead::new(),
            done,
        }
    }
}

unsafe fn signal_blob(head: NonNull<RcuHead>) {
    // SAFETY: only queued with heads that start a live `SyncBlob`.
    let done = unsafe { (*head.cast::<SyncBlob>().as_ptr()).done };
    // The waiter may free the blob and the completion as soon as this lands.
    // SAFETY: the waiter keeps the completion alive until it saw the signal.
    unsafe { (*done).signal() };
}

// ---------------------------------------------------------------------------
// Deferred reclamation
// ---------------------------------------------------------------------------

impl Rcu {
    /// Queue `func(head)` to run after a grace period, on the calling core.
    ///
    /// Never blocks. Past the configured threshold of queued callbacks on this
    /// core, the coordinator is poked to start a GP early.
    ///
    /// # Safety
    ///
    /// - `head` must point to a valid, unqueued [`RcuHead`] that stays at the
    ///   same address until `func` has been called with it.
    /// - `func` must be safe to call with `head` from another thread once the
    ///   grace period is over.
    pub unsafe fn call_rcu(&self, head: NonNull<RcuHead>, func: RcuCallback) {
        let core = self.topology.current_core();
        // SAFETY: forwarded caller contract.
        let queued = unsafe { self.enqueue(core, head, func) };
        if queued > self.config.cb_threshold {
            self.wake_gp(false);
        }
    }

    /// [`call_rcu`](Self::call_rcu) onto a specific core's queue.
    ///
    /// # Panics
    ///
    /// If `core` is not a physical core.
    ///
    /// # Safety
    ///
    /// Same as [`call_rcu`](Self::call_rcu).
    pub unsafe fn call_rcu_on(&self, core: usize, head: NonNull<RcuHead>, func: RcuCallback) {
        assert!(core < self.cores.len(), "core {core} out of range");
        // SAFETY: forwarded caller contract.
        let queued = unsafe { self.enqueue(core, head, func) };
        if queued > self.config.cb_threshold {
            self.wake_gp(false);
        }
    }

    /// Run `f` after a grace period. The closure is boxed by the engine.
    pub fn call_rcu_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (head, func) = boxed_callback(f);
        // SAFETY: the boxed record is leaked until `func` reclaims it.
        unsafe { self.call_rcu(head, func) };
    }

    /// Drop `value` after a grace period.
    pub fn defer_drop<T: Send + 'static>(&self, value: Box<T>) {
        self.call_rcu_fn(move || drop(value));
    }

    /// Tag and append. Returns the core's queue length afterwards.
    ///
    /// # Safety
    ///
    /// Same as [`call_rcu`](Self::call_rcu).
    unsafe fn enqueue(&self, core: usize, head: NonNull<RcuHead>, func: RcuCallback) -> usize {
        let pc = &self.cores[core];
        // The caller's unpublish must be ordered before the GP snapshot.
        fence(Ordering::SeqCst);
        // One past the current number: if a GP is running it may already be
        // past this core, so wait for the next full one.
        let tag = self.gpnum.load(Ordering::Acquire).wrapping_add(1);
        // SAFETY: caller guarantees `head` is valid and not queued.
        unsafe { (*head.as_ptr()).arm(func, tag) };
        let mut queue = pc.queue.lock();
        // SAFETY: armed above; validity is the caller's contract.
        unsafe { queue.push_back(head) };
        let queued = pc.nr_cbs.fetch_add(1, Ordering::Release) + 1;
        debug_assert_eq!(queued, queue.len());
        drop(queue);
        self.counters.callbacks_queued.fetch_add(1, Ordering::Relaxed);
        queued
    }

    // -----------------------------------------------------------------------
    // Blocking waits
    // -----------------------------------------------------------------------

    /// Block until a full grace period has elapsed since the call.
    ///
    /// While blocked, the caller reports quiescent states for the core it is
    /// bound to ([`bound_core`](crate::topology::CoreTopology::bound_core));
    /// an unbound caller reports none.
    ///
    /// # Panics
    ///
    /// When called from an RCU thread (including any callback).
    pub fn synchronize_rcu(&self) {
        assert_not_rcu_thread("synchronize_rcu");
        let done = Completion::new();
        let mut blob = SyncBlob::new(&done);
        let head = NonNull::from(&mut blob).cast::<RcuHead>();
        // SAFETY: `blob` stays put until `done` has been signalled, which is
        // the callback's last access.
        unsafe { self.call_rcu(head, signal_blob) };
        self.wake_gp(true);
        self.wait_for_signals(&done, 1);
    }

    /// Block until every callback queued before the call has run.
    ///
    /// Reports quiescent states for the caller's bound core while blocked, as
    /// [`synchronize_rcu`](Self::synchronize_rcu) does.
    ///
    /// # Panics
    ///
    /// When called from an RCU thread, or if the per-core completion records
    /// cannot be allocated.
    pub fn rcu_barrier(&self) {
        assert_not_rcu_thread("rcu_barrier");
        let ncores = self.cores.len();
        let done = Completion::new();
        let mut blobs: Vec<SyncBlob> = Vec::new();
        if blobs.try_reserve_exact(ncores).is_err() {
            panic!("rcu_barrier: cannot allocate {ncores} completion records");
        }
        blobs.extend((0..ncores).map(|_| SyncBlob::new(&done)));
        // No pushes after this point: the records must not move.
        let base = blobs.as_mut_ptr();

        fence(Ordering::SeqCst);
        let mut sent = 0;
        for (core, pc) in self.cores.iter().enumerate() {
            if pc.nr_cbs.load(Ordering::Acquire) == 0 {
                continue;
            }
            // SAFETY: `core < ncores == blobs.len()`.
            let head = unsafe { NonNull::new_unchecked(base.add(core)) }.cast::<RcuHead>();
            // SAFETY: `blobs` outlives every queued record: we wait for all
            // `sent` signals before it is dropped.
            unsafe { self.enqueue(core, head, signal_blob) };
            sent += 1;
        }
        if sent == 0 {
            return;
        }
        self.counters.barriers.fetch_add(1, Ordering::Relaxed);
        self.events.emit(RcuEvent::BarrierIssued { cores: sent });
        self.wake_gp(true);
        self.wait_for_signals(&done, sent);
        drop(blobs);
    }

    /// Wait for `n` signals. A blocked caller is a quiescent state for the
    /// core it owns, so it keeps reporting one while it waits. Without an
    /// exclusive binding another thread may be reading on that core.
    fn wait_for_signals(&self, done: &Completion, n: usize) {
        let own_core = self.topology.bound_core();
        loop {
            if let Some(core) = own_core {
                self.report_qs_on(core);
            }
            if done.wait_timeout(n, self.config.gp_tardy_period) {
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Quiescent states
    // -----------------------------------------------------------------------

    /// The calling core passed through a quiescent state.
    ///
    /// Cheap when there is nothing to report: one load and compare.
    #[inline]
    pub fn report_qs(&self) {
        self.report_qs_on(self.topology.current_core());
    }

    /// `core` passed through a quiescent state. The caller vouches that no
    /// read-side section is running on it.
    ///
    /// # Panics
    ///
    /// If `core` is not a physical core.
    pub fn report_qs_on(&self, core: usize) {
        assert!(core < self.cores.len(), "core {core} out of range");
        if self.report_qs_core(core) {
            self.counters.self_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Start a GP now if none is running.
    pub fn force_quiescent_state(&self) {
        self.wake_gp(true);
    }

    // -----------------------------------------------------------------------
    // Polled grace periods
    // -----------------------------------------------------------------------

    /// Snapshot the GP state; pass it to
    /// [`poll_state_synchronize_rcu`](Self::poll_state_synchronize_rcu) or
    /// [`cond_synchronize_rcu`](Self::cond_synchronize_rcu) later.
    #[must_use]
    pub fn get_state_synchronize_rcu(&self) -> GpCookie {
        fence(Ordering::SeqCst);
        GpCookie(self.gpnum.load(Ordering::Acquire))
    }

    /// True once a full GP has elapsed since `cookie` was taken.
    #[must_use]
    pub fn poll_state_synchronize_rcu(&self, cookie: GpCookie) -> bool {
        let done = gp_lt(cookie.0, self.completed.load(Ordering::Acquire));
        if done {
            fence(Ordering::SeqCst);
        }
        done
    }

    /// [`synchronize_rcu`](Self::synchronize_rcu) unless a full GP already
    /// elapsed since `cookie`.
    pub fn cond_synchronize_rcu(&self, cookie: GpCookie) {
        if !self.poll_state_synchronize_rcu(cookie) {
            self.synchronize_rcu();
        }
    }
}
