//! Structured engine events.
//!
//! The engine reports what it does as [`RcuEvent`] values handed to an
//! [`EventSink`]. Sinks must be cheap and must not block on RCU: they are
//! called from the coordinator and runner threads. The default sink is an
//! [`EventRing`], a bounded overwrite-oldest buffer that tooling drains and
//! turns into JSONL.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

/// Severity attached to each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RcuEvent {
    TreeBuilt {
        physical_cores: usize,
        logical_cores: usize,
        levels: usize,
        nodes: usize,
        fanout_leaf: usize,
        layout: String,
    },
    GpStarted {
        gpnum: u64,
    },
    GpCompleted {
        gpnum: u64,
        duration_us: u64,
        tardy_scans: u32,
    },
    /// The current GP has been open longer than the stall threshold.
    GpStall {
        gpnum: u64,
        open_ms: u64,
        root_qsmask: u64,
    },
    CallbacksInvoked {
        core: usize,
        count: usize,
        completed: u64,
    },
    BarrierIssued {
        cores: usize,
    },
}

impl RcuEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TreeBuilt { .. } => "tree_built",
            Self::GpStarted { .. } => "gp_started",
            Self::GpCompleted { .. } => "gp_completed",
            Self::GpStall { .. } => "gp_stall",
            Self::CallbacksInvoked { .. } => "callbacks_invoked",
            Self::BarrierIssued { .. } => "barrier_issued",
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::TreeBuilt { .. } | Self::BarrierIssued { .. } => Severity::Info,
            Self::GpStall { .. } => Severity::Warn,
            _ => Severity::Debug,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: RcuEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: RcuEvent) {}
}

/// Default ring capacity.
pub const EVENT_RING_CAPACITY: usize = 1024;

/// Bounded event buffer; the oldest event is dropped when full.
#[derive(Debug)]
pub struct EventRing {
    inner: Mutex<RingInner>,
    capacity: usize,
}

#[derive(Debug)]
struct RingInner {
    events: VecDeque<RcuEvent>,
    dropped: u64,
}

impl EventRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(RingInner {
                events: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Take every buffered event, oldest first.
    pub fn drain(&self) -> Vec<RcuEvent> {
        self.inner.lock().events.drain(..).collect()
    }

    /// Copy of the buffered events without consuming them.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RcuEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// Events overwritten because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new(EVENT_RING_CAPACITY)
    }
}

impl EventSink for EventRing {
    fn emit(&self, event: RcuEvent) {
        let mut inner = self.inner.lock();
        if inner.events.len() == self.capacity {
            inner.events.pop_front();
            inner.dropped += 1;
        }
        inner.events.push_back(event);
    }
}
