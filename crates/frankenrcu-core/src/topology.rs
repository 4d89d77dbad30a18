//! Core identity and scheduling-state hints.
//!
//! The engine never asks the scheduler anything directly. It needs three
//! answers, all behind [`CoreTopology`]:
//! - how many cores exist,
//! - which core the calling thread runs on,
//! - a best-effort, possibly stale hint of what a *remote* core was last seen
//!   doing. The hint only lets the coordinator report a quiescent state on a
//!   core's behalf; an implementation may always answer
//!   [`CoreState::Unknown`] and the engine then relies purely on explicit
//!   `report_qs()` calls.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};

/// Last observed scheduling mode of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreState {
    Unknown = 0,
    /// Idle loop: cannot hold RCU references.
    Idle = 1,
    /// Running user code: cannot hold kernel RCU references.
    User = 2,
    /// Running kernel code, possibly inside a read-side section.
    Kernel = 3,
}

impl CoreState {
    /// States the coordinator may treat as a quiescent state.
    #[must_use]
    pub const fn is_quiescent(self) -> bool {
        matches!(self, Self::Idle | Self::User)
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Idle,
            2 => Self::User,
            3 => Self::Kernel,
            _ => Self::Unknown,
        }
    }
}

pub trait CoreTopology: Send + Sync {
    fn num_cores(&self) -> usize;

    /// Core the calling thread is running on.
    fn current_core(&self) -> usize;

    /// Core the calling thread exclusively owns, if any.
    ///
    /// `Some(core)` is a promise that no other thread runs read-side sections
    /// on `core`, so a blocked caller may report a quiescent state for it.
    /// The default answers `None` and blocked callers then report nothing.
    fn bound_core(&self) -> Option<usize> {
        None
    }

    /// Best-effort hint for `core`. Stale answers are allowed.
    fn core_state(&self, _core: usize) -> CoreState {
        CoreState::Unknown
    }
}

thread_local! {
    static BOUND_CORE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Topology where threads declare their core and publish their own state.
///
/// A thread binds itself with [`bind_current_thread`](Self::bind_current_thread);
/// unbound threads queue callbacks on core 0 but own no core, so blocking
/// calls from them never report on core 0's behalf. Every core starts out
/// [`CoreState::Idle`]: a core with no thread bound to it cannot be inside a
/// read-side section.
#[derive(Debug)]
pub struct ThreadBoundTopology {
    states: Box<[AtomicU8]>,
}

impl ThreadBoundTopology {
    #[must_use]
    pub fn new(num_cores: usize) -> Self {
        let states: Vec<AtomicU8> = (0..num_cores)
            .map(|_| AtomicU8::new(CoreState::Idle as u8))
            .collect();
        Self {
            states: states.into_boxed_slice(),
        }
    }

    /// Bind the calling thread to `core` for every `ThreadBoundTopology`.
    ///
    /// The binding is exclusive: while bound, this thread is the only one
    /// that may run read-side sections on `core`. Blocking calls made from a
    /// bound thread report quiescent states for its core.
    pub fn bind_current_thread(&self, core: usize) {
        assert!(
            core < self.states.len(),
            "core {core} out of range for {} cores",
            self.states.len()
        );
        BOUND_CORE.with(|c| c.set(Some(core)));
    }

    pub fn unbind_current_thread(&self) {
        BOUND_CORE.with(|c| c.set(None));
    }

    pub fn set_state(&self, core: usize, state: CoreState) {
        self.states[core].store(state as u8, Ordering::SeqCst);
    }

    /// Set the state of the core the calling thread is bound to.
    pub fn set_current_state(&self, state: CoreState) {
        self.set_state(self.current_core(), state);
    }
}

impl CoreTopology for ThreadBoundTopology {
    fn num_cores(&self) -> usize {
        self.states.len()
    }

    fn current_core(&self) -> usize {
        self.bound_core().unwrap_or(0)
    }

    fn bound_core(&self) -> Option<usize> {
        BOUND_CORE.with(Cell::get).filter(|&c| c < self.states.len())
    }

    fn core_state(&self, core: usize) -> CoreState {
        CoreState::from_u8(self.states[core].load(Ordering::SeqCst))
    }
}

/// Topology with no remote visibility at all.
///
/// Every grace period then depends on each core calling `report_qs()`.
#[derive(Debug)]
pub struct OpaqueTopology {
    inner: ThreadBoundTopology,
}

impl OpaqueTopology {
    #[must_use]
    pub fn new(num_cores: usize) -> Self {
        Self {
            inner: ThreadBoundTopology::new(num_cores),
        }
    }

    /// Exclusive binding, see [`ThreadBoundTopology::bind_current_thread`].
    pub fn bind_current_thread(&self, core: usize) {
        self.inner.bind_current_thread(core);
    }
}

impl CoreTopology for OpaqueTopology {
    fn num_cores(&self) -> usize {
        self.inner.num_cores()
    }

    fn current_core(&self) -> usize {
        self.inner.current_core()
    }

    fn bound_core(&self) -> Option<usize> {
        self.inner.bound_core()
    }
}
