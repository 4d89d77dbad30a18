//! Callback records and the per-core callback list.
//!
//! An [`RcuHead`] is embedded in caller-owned memory (usually as the first
//! field of a `#[repr(C)]` struct) and linked into a core's FIFO without any
//! allocation by the engine. The callback receives the head back and recovers
//! its container from it.

#![allow(unsafe_code)]

use core::marker::PhantomPinned;
use core::ptr::NonNull;

use super::gp_lt;

/// Deferred function. Receives the head it was queued with.
///
/// # Safety
///
/// Called exactly once, after a grace period, from a runner thread. The head
/// is no longer linked anywhere, so the callback may free its container.
pub type RcuCallback = unsafe fn(NonNull<RcuHead>);

/// Intrusive callback record.
///
/// Must stay at a fixed address from `call_rcu` until its callback runs.
#[repr(C)]
#[derive(Debug)]
pub struct RcuHead {
    next: Option<NonNull<RcuHead>>,
    func: Option<RcuCallback>,
    /// Grace period that must complete before `func` may run.
    gpnum: u64,
    _pin: PhantomPinned,
}

impl RcuHead {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: None,
            func: None,
            gpnum: 0,
            _pin: PhantomPinned,
        }
    }

    /// Grace period this record waits for (valid once queued).
    #[must_use]
    pub fn gpnum(&self) -> u64 {
        self.gpnum
    }

    pub(crate) fn arm(&mut self, func: RcuCallback, gpnum: u64) {
        self.func = Some(func);
        self.gpnum = gpnum;
        self.next = None;
    }
}

impl Default for RcuHead {
    fn default() -> Self {
        Self::new()
    }
}

/// Singly linked FIFO of queued heads. Lives under a per-core lock.
#[derive(Debug)]
pub(crate) struct CbList {
    head: Option<NonNull<RcuHead>>,
    tail: Option<NonNull<RcuHead>>,
    len: usize,
}

// SAFETY: the list only holds pointers to records whose owners handed them
// over through `call_rcu`, which requires them to be usable from any thread.
unsafe impl Send for CbList {}

impl CbList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append an armed record.
    ///
    /// # Safety
    ///
    /// `node` must be valid, not linked into any list, and stay valid until
    /// its callback runs.
    pub(crate) unsafe fn push_back(&mut self, node: NonNull<RcuHead>) {
        // SAFETY: caller guarantees `node` is valid and exclusively ours.
        unsafe { (*node.as_ptr()).next = None };
        match self.tail {
            // SAFETY: `tail` is a live queued record.
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    /// Detach the longest prefix whose records wait for a GP `<= completed`.
    ///
    /// The scan stops at the first record that is not ready, even if later
    /// ones are: that keeps execution FIFO per core.
    pub(crate) fn take_ready(&mut self, completed: u64) -> CbList {
        let mut last = None;
        let mut count = 0;
        let mut cur = self.head;
        while let Some(node) = cur {
            // SAFETY: queued records stay valid until executed.
            let rec = unsafe { node.as_ref() };
            if gp_lt(completed, rec.gpnum) {
                break;
            }
            last = Some(node);
            count += 1;
            cur = rec.next;
        }
        let Some(last) = last else {
            return CbList::new();
        };
        let ready = CbList {
            head: self.head,
            tail: Some(last),
            len: count,
        };
        // SAFETY: `last` is a live queued record; cutting after it.
        self.head = unsafe { (*last.as_ptr()).next.take() };
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= count;
        ready
    }

    /// Invoke every record in order, consuming the list. Returns the count.
    ///
    /// # Safety
    ///
    /// Every record must still be valid and its callback safe to call now.
    pub(crate) unsafe fn run_all(self) -> usize {
        let mut ran = 0;
        let mut cur = self.head;
        while let Some(node) = cur {
            // The callback may free the record: read it out first.
            // SAFETY: the record is valid until its callback runs.
            let (next, func) = unsafe {
                let rec = &mut *node.as_ptr();
                (rec.next.take(), rec.func.take())
            };
            cur = next;
            if let Some(func) = func {
                // SAFETY: the enqueuer paired `func` with this record.
                unsafe { func(node) };
            }
            ran += 1;
        }
        ran
    }
}

/// Heap record for closure callbacks; `head` must stay first.
#[repr(C)]
struct BoxedCallback<F> {
    head: RcuHead,
    f: F,
}

unsafe fn run_boxed<F: FnOnce()>(head: NonNull<RcuHead>) {
    // SAFETY: `head` came from `boxed_callback::<F>`, which leaked a
    // `BoxedCallback<F>` whose first field is the head.
    let boxed = unsafe { Box::from_raw(head.cast::<BoxedCallback<F>>().as_ptr()) };
    let BoxedCallback { f, .. } = *boxed;
    f();
}

/// Leak a closure into a heap record the engine can queue.
pub(crate) fn boxed_callback<F>(f: F) -> (NonNull<RcuHead>, RcuCallback)
where
    F: FnOnce() + Send + 'static,
{
    let leaked = Box::leak(Box::new(BoxedCallback {
        head: RcuHead::new(),
        f,
    }));
    (NonNull::from(leaked).cast::<RcuHead>(), run_boxed::<F>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[repr(C)]
    struct Tagged {
        head: RcuHead,
        id: usize,
        log: *const parking_lot::Mutex<Vec<usize>>,
    }

    unsafe fn log_id(head: NonNull<RcuHead>) {
        let rec = unsafe { head.cast::<Tagged>().as_ref() };
        unsafe { (*rec.log).lock().push(rec.id) };
    }

    fn make(ids: &[(usize, u64)], log: &parking_lot::Mutex<Vec<usize>>) -> Vec<Box<Tagged>> {
        ids.iter()
            .map(|&(id, gp)| {
                let mut t = Box::new(Tagged {
                    head: RcuHead::new(),
                    id,
                    log,
                });
                t.head.arm(log_id, gp);
                t
            })
            .collect()
    }

    #[test]
    fn take_ready_cuts_fifo_prefix() {
        let log = parking_lot::Mutex::new(Vec::new());
        let mut recs = make(&[(1, 3), (2, 3), (3, 4), (4, 3)], &log);
        let mut list = CbList::new();
        for r in &mut recs {
            unsafe { list.push_back(NonNull::from(&mut r.head)) };
        }
        assert_eq!(list.len(), 4);

        assert!(list.take_ready(2).is_empty());
        let ready = list.take_ready(3);
        assert_eq!(ready.len(), 2);
        // Record 4 is ready too but sits behind record 3.
        assert_eq!(list.len(), 2);
        assert_eq!(unsafe { ready.run_all() }, 2);
        assert_eq!(*log.lock(), vec![1, 2]);

        let ready = list.take_ready(4);
        assert_eq!(ready.len(), 2);
        assert!(list.is_empty());
        unsafe { ready.run_all() };
        assert_eq!(*log.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn take_ready_handles_wrapped_counters() {
        let log = parking_lot::Mutex::new(Vec::new());
        let mut recs = make(&[(1, u64::MAX), (2, 0), (3, 1)], &log);
        let mut list = CbList::new();
        for r in &mut recs {
            unsafe { list.push_back(NonNull::from(&mut r.head)) };
        }
        let ready = list.take_ready(0);
        assert_eq!(ready.len(), 2);
        unsafe { ready.run_all() };
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn boxed_callback_runs_and_frees() {
        let hits = Arc::new(AtomicUsize::new(0));
        let payload = Arc::new(());
        let (node, func) = {
            let hits = Arc::clone(&hits);
            let payload = Arc::clone(&payload);
            boxed_callback(move || {
                let _keep = payload;
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        unsafe { (*node.as_ptr()).arm(func, 1) };
        let mut list = CbList::new();
        unsafe { list.push_back(node) };
        let ready = list.take_ready(1);
        assert_eq!(unsafe { ready.run_all() }, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The closure and its captures were dropped with the record.
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
