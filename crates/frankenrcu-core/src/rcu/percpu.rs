//! Per-core RCU context.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::head::CbList;

/// One physical core's callback queue and GP acknowledgement.
///
/// Aligned to a cache line: cores hammer their own context and nobody
/// else's on the fast path.
#[repr(C, align(64))]
#[derive(Debug)]
pub(crate) struct PerCore {
    core_id: usize,
    /// Queued callbacks, oldest first. Also serializes QS reports for this core.
    pub(crate) queue: Mutex<CbList>,
    /// Mirrors `queue.len()`; readable without the lock.
    pub(crate) nr_cbs: AtomicUsize,
    /// Last GP this core reported a quiescent state for.
    pub(crate) gp_acked: AtomicU64,
    /// Leaf node index and this core's bit in it.
    pub(crate) leaf: usize,
    pub(crate) grpmask: u64,
}

impl PerCore {
    pub(crate) fn new(core_id: usize, leaf: usize, grpmask: u64, gpnum: u64) -> Self {
        Self {
            core_id,
            queue: Mutex::new(CbList::new()),
            nr_cbs: AtomicUsize::new(0),
            gp_acked: AtomicU64::new(gpnum),
            leaf,
            grpmask,
        }
    }

    pub(crate) fn core_id(&self) -> usize {
        self.core_id
    }

    pub(crate) fn pending(&self) -> usize {
        self.nr_cbs.load(Ordering::Acquire)
    }
}
