//! Tree-based quiescent-state RCU engine.
//!
//! Readers are free: `rcu_read_lock()`/`rcu_read_unlock()` compile to
//! nothing. A reader is protected simply because its core does not report a
//! quiescent state (QS) while it is inside a read-side section. Writers
//! publish a new version, then either block in [`Rcu::synchronize_rcu`] or
//! hand the old version to [`Rcu::call_rcu`] for deferred reclamation.
//!
//! # Design
//!
//! - A quiescence tree ([`RcuTree`]) of bitmasks tracks which cores still owe
//!   a QS for the current grace period (GP). The last report at each level
//!   propagates upward; the one that empties the root wakes the coordinator.
//! - One coordinator thread (`rcu_gp`) runs GPs back to back: it resets the
//!   tree, publishes `gpnum`, reports on behalf of cores hinted idle or in
//!   user mode, then re-polls tardy cores until the root empties and finally
//!   publishes `completed`.
//! - Runner threads (`rcu_mgmt_N`) execute callbacks whose GP completed, in
//!   FIFO order per core. Each runner owns the cores `core % runners == N`.
//! - Background threads only hold a `Weak` reference to the engine. Once the
//!   last [`Arc<Rcu>`] is dropped they exit at their next periodic wakeup.
//!   There is no explicit shutdown; callbacks still queued at that point are
//!   never run.
//!
//! # Counters
//!
//! `gpnum` is the last GP started and `completed` the last GP finished;
//! `gpnum == completed` means no GP is in flight, otherwise
//! `gpnum == completed + 1`. Both wrap, and every comparison goes through
//! [`gp_ge`]/[`gp_lt`].

mod api;
mod cell;
mod coordinator;
pub(crate) mod head;
mod percpu;
mod runner;
pub mod tree;

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::RcuConfig;
use crate::error::RcuError;
use crate::events::{EventRing, EventSink, NullSink, RcuEvent};
use crate::sync::Rendez;
use crate::topology::CoreTopology;

pub use api::GpCookie;
pub use cell::RcuCell;
pub use head::{RcuCallback, RcuHead};
pub use tree::{NodeLayout, RcuNode, RcuTree};

use percpu::PerCore;

// ---------------------------------------------------------------------------
// Wrap-safe GP number comparison
// ---------------------------------------------------------------------------

/// `a >= b` for counters that wrap: true when `a` is at most half the
/// number space ahead of `b`.
#[inline]
#[must_use]
pub const fn gp_ge(a: u64, b: u64) -> bool {
    a.wrapping_sub(b) <= u64::MAX / 2
}

/// `a < b` for counters that wrap.
#[inline]
#[must_use]
pub const fn gp_lt(a: u64, b: u64) -> bool {
    !gp_ge(a, b)
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Enter a read-side critical section. A no-op: the section lasts until the
/// core next reports a quiescent state.
#[inline(always)]
pub fn rcu_read_lock() {}

/// Leave a read-side critical section. A no-op, see [`rcu_read_lock`].
#[inline(always)]
pub fn rcu_read_unlock() {}

// ---------------------------------------------------------------------------
// RCU thread marker
// ---------------------------------------------------------------------------

thread_local! {
    static RCU_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// True on the coordinator and runner threads, i.e. inside any callback.
///
/// Those threads must never block on a grace period: the GP they would wait
/// for needs them to make progress.
#[must_use]
pub fn in_rcu_callback_context() -> bool {
    RCU_THREAD.with(Cell::get)
}

fn mark_rcu_thread() {
    RCU_THREAD.with(|flag| flag.set(true));
}

fn assert_not_rcu_thread(op: &str) {
    if in_rcu_callback_context() {
        panic!("{op}() called from an RCU callback thread; it would deadlock");
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Wakeup flag plus the rendezvous to sleep on it.
///
/// Background threads own an `Arc` of their bell, not of the engine, so a
/// sleeping thread does not keep the engine alive.
#[derive(Debug, Default)]
struct Doorbell {
    rendez: Rendez,
    rung: AtomicBool,
}

impl Doorbell {
    fn ring(&self) {
        self.rung.store(true, Ordering::SeqCst);
        self.rendez.wakeup();
    }

    /// Sleep until rung or `timeout`. A ring is consumed under the
    /// rendezvous lock by the wait that observes it; rings arriving after
    /// that are kept for the next wait.
    fn wait(&self, timeout: Duration) {
        self.rendez
            .sleep_timeout(timeout, || self.rung.swap(false, Ordering::AcqRel));
    }
}

#[derive(Debug, Default)]
struct Counters {
    gps_completed: AtomicU64,
    callbacks_queued: AtomicU64,
    callbacks_invoked: AtomicU64,
    self_reports: AtomicU64,
    remote_reports: AtomicU64,
    tardy_scans: AtomicU64,
    barriers: AtomicU64,
    stalls: AtomicU64,
}

/// Point-in-time counters. Fields are read independently, so a snapshot taken
/// while the engine runs is only approximately consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RcuStats {
    pub gpnum: u64,
    pub completed: u64,
    pub gps_completed: u64,
    pub callbacks_queued: u64,
    pub callbacks_invoked: u64,
    pub callbacks_pending: u64,
    /// QS reports made by cores themselves.
    pub self_reports: u64,
    /// QS reports the coordinator made for cores hinted idle or in user mode.
    pub remote_reports: u64,
    pub tardy_scans: u64,
    pub barriers: u64,
    pub stalls: u64,
}

/// The RCU engine. Always handled through an `Arc`.
pub struct Rcu {
    config: RcuConfig,
    tree: RcuTree,
    cores: Box<[PerCore]>,
    /// Last GP started.
    gpnum: AtomicU64,
    /// Last GP completed.
    completed: AtomicU64,
    /// Rung to ask for a GP now; its rendezvous is also woken when the
    /// root empties.
    gp_bell: Arc<Doorbell>,
    runners: Box<[Arc<Doorbell>]>,
    topology: Arc<dyn CoreTopology>,
    events: Arc<dyn EventSink>,
    epoch: Instant,
    /// Nanoseconds after `epoch` at which the current GP started.
    gp_started_ns: AtomicU64,
    counters: Counters,
}

impl std::fmt::Debug for Rcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rcu")
            .field("config", &self.config)
            .field("gpnum", &self.gpnum.load(Ordering::Relaxed))
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Rcu {
    /// Build the tree and per-core contexts, then spawn the coordinator and
    /// the runner threads. Events are discarded.
    pub fn start(config: RcuConfig, topology: Arc<dyn CoreTopology>) -> Result<Arc<Self>, RcuError> {
        Self::start_with_sink(config, topology, Arc::new(NullSink))
    }

    /// Like [`start`](Self::start), reporting into a fresh [`EventRing`].
    pub fn start_with_ring(
        config: RcuConfig,
        topology: Arc<dyn CoreTopology>,
    ) -> Result<(Arc<Self>, Arc<EventRing>), RcuError> {
        let ring = Arc::new(EventRing::default());
        let rcu = Self::start_with_sink(config, topology, Arc::clone(&ring) as Arc<dyn EventSink>)?;
        Ok((rcu, ring))
    }

    pub fn start_with_sink(
        config: RcuConfig,
        topology: Arc<dyn CoreTopology>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, RcuError> {
        let rcu = Arc::new(Self::build(config, topology, events)?);
        rcu.events.emit(RcuEvent::TreeBuilt {
            physical_cores: rcu.config.num_cores,
            logical_cores: rcu.config.logical_cores,
            levels: rcu.tree.num_levels(),
            nodes: rcu.tree.nodes().len(),
            fanout_leaf: rcu.tree.fanout_leaf(),
            layout: rcu.tree.to_string(),
        });
        // Threads spawned before a failure hold only a Weak and wind down
        // once `rcu` is dropped here.
        coordinator::spawn(&rcu)?;
        runner::spawn_all(&rcu)?;
        Ok(rcu)
    }

    fn build(
        config: RcuConfig,
        topology: Arc<dyn CoreTopology>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, RcuError> {
        config.validate()?;
        if topology.num_cores() != config.num_cores {
            return Err(RcuError::TopologyMismatch {
                topology: topology.num_cores(),
                config: config.num_cores,
            });
        }
        let tree = RcuTree::build(config.logical_cores, config.fanout_leaf)?;
        let gpnum = config.initial_gpnum;
        let cores: Box<[PerCore]> = (0..config.num_cores)
            .map(|core| {
                let (leaf, grpmask) = tree.leaf_for(core);
                PerCore::new(core, leaf, grpmask, gpnum)
            })
            .collect();
        let runners: Box<[Arc<Doorbell>]> = (0..config.runner_threads)
            .map(|_| Arc::new(Doorbell::default()))
            .collect();
        Ok(Self {
            config,
            tree,
            cores,
            gpnum: AtomicU64::new(gpnum),
            completed: AtomicU64::new(gpnum),
            gp_bell: Arc::new(Doorbell::default()),
            runners,
            topology,
            events,
            epoch: Instant::now(),
            gp_started_ns: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RcuConfig {
        &self.config
    }

    #[must_use]
    pub fn tree(&self) -> &RcuTree {
        &self.tree
    }

    /// Physical cores.
    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    #[must_use]
    pub fn gpnum(&self) -> u64 {
        self.gpnum.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn gp_in_progress(&self) -> bool {
        self.completed() != self.gpnum()
    }

    /// How long the current GP has been open, `None` when idle.
    #[must_use]
    pub fn gp_age(&self) -> Option<Duration> {
        if !self.gp_in_progress() {
            return None;
        }
        let started = self.gp_started_ns.load(Ordering::Acquire);
        Some(Duration::from_nanos(self.now_ns().saturating_sub(started)))
    }

    /// Callbacks queued on `core` and not yet executed.
    ///
    /// # Panics
    ///
    /// If `core` is not a physical core.
    #[must_use]
    pub fn pending_callbacks(&self, core: usize) -> usize {
        assert!(core < self.cores.len(), "core {core} out of range");
        self.cores[core].pending()
    }

    #[must_use]
    pub fn stats(&self) -> RcuStats {
        let c = &self.counters;
        RcuStats {
            gpnum: self.gpnum(),
            completed: self.completed(),
            gps_completed: c.gps_completed.load(Ordering::Relaxed),
            callbacks_queued: c.callbacks_queued.load(Ordering::Relaxed),
            callbacks_invoked: c.callbacks_invoked.load(Ordering::Relaxed),
            callbacks_pending: self.cores.iter().map(|pc| pc.pending() as u64).sum(),
            self_reports: c.self_reports.load(Ordering::Relaxed),
            remote_reports: c.remote_reports.load(Ordering::Relaxed),
            tardy_scans: c.tardy_scans.load(Ordering::Relaxed),
            barriers: c.barriers.load(Ordering::Relaxed),
            stalls: c.stalls.load(Ordering::Relaxed),
        }
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Record a QS for physical `core` in the current GP. Returns whether
    /// this call was the one that reported it.
    ///
    /// Serialized per core by the queue lock, so a core's bit is cleared at
    /// most once per GP no matter how many threads report for it.
    fn report_qs_core(&self, core: usize) -> bool {
        let pc = &self.cores[core];
        if pc.gp_acked.load(Ordering::Acquire) == self.gpnum.load(Ordering::Acquire) {
            return false;
        }
        let guard = pc.queue.lock();
        let gpnum = self.gpnum.load(Ordering::Acquire);
        let acked = pc.gp_acked.load(Ordering::Relaxed);
        if acked == gpnum {
            return false;
        }
        debug_assert_eq!(acked.wrapping_add(1), gpnum, "core {} skipped a GP", pc.core_id());
        pc.gp_acked.store(gpnum, Ordering::Release);
        drop(guard);
        self.mark_tree(pc.leaf, pc.grpmask);
        true
    }

    /// Clear `mask` in `node`; wake the coordinator if that emptied the root.
    fn mark_tree(&self, node: usize, mask: u64) {
        if self.tree.mark_quiescent(node, mask) {
            self.gp_bell.rendez.wakeup();
        }
    }

    fn wake_runners(&self) {
        for bell in &*self.runners {
            bell.ring();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ThreadBoundTopology;

    #[test]
    fn gp_compare_wraps() {
        assert!(gp_ge(5, 5));
        assert!(gp_ge(6, 5));
        assert!(gp_lt(5, 6));
        assert!(gp_ge(0, u64::MAX));
        assert!(gp_ge(3, u64::MAX - 3));
        assert!(gp_lt(u64::MAX, 0));
        assert!(gp_lt(u64::MAX - 10, 2));
    }

    #[test]
    fn start_rejects_topology_mismatch() {
        let err = Rcu::start(RcuConfig::new(4), Arc::new(ThreadBoundTopology::new(2))).unwrap_err();
        assert!(matches!(
            err,
            RcuError::TopologyMismatch {
                topology: 2,
                config: 4
            }
        ));
    }

    #[test]
    fn start_rejects_bad_config() {
        let cfg = RcuConfig::new(4).with_fanout_leaf(1);
        let err = Rcu::start(cfg, Arc::new(ThreadBoundTopology::new(4))).unwrap_err();
        assert!(matches!(err, RcuError::FanoutOutOfRange { fanout: 1 }));
    }

    #[test]
    fn fresh_engine_is_idle() {
        let cfg = RcuConfig::new(3).with_initial_gpnum(40);
        let (rcu, ring) = Rcu::start_with_ring(cfg, Arc::new(ThreadBoundTopology::new(3))).unwrap();
        assert_eq!(rcu.num_cores(), 3);
        assert!(gp_ge(rcu.completed(), 40));
        assert!(gp_ge(rcu.gpnum(), rcu.completed()));
        assert_eq!(rcu.stats().callbacks_pending, 0);
        let first = ring.snapshot().into_iter().next().unwrap();
        assert_eq!(first.name(), "tree_built");
    }

    #[test]
    fn doorbell_keeps_a_ring_for_the_next_wait() {
        let bell = Doorbell::default();
        bell.ring();
        let start = Instant::now();
        bell.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
        // Consumed by the wait above.
        assert!(!bell.rung.load(Ordering::SeqCst));

        bell.ring();
        let start = Instant::now();
        bell.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));

        let start = Instant::now();
        bell.wait(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    #[should_panic(expected = "core 7 out of range")]
    fn pending_callbacks_rejects_unknown_core() {
        let rcu = Rcu::build(
            RcuConfig::new(2),
            Arc::new(ThreadBoundTopology::new(2)),
            Arc::new(NullSink),
        )
        .unwrap();
        let _ = rcu.pending_callbacks(7);
    }

    #[test]
    #[should_panic(expected = "core 2 out of range")]
    fn report_qs_on_rejects_unknown_core() {
        let rcu = Rcu::build(
            RcuConfig::new(2),
            Arc::new(ThreadBoundTopology::new(2)),
            Arc::new(NullSink),
        )
        .unwrap();
        rcu.report_qs_on(2);
    }

    #[test]
    #[should_panic(expected = "RCU callback thread")]
    fn blocking_from_rcu_thread_panics() {
        mark_rcu_thread();
        assert_not_rcu_thread("synchronize_rcu");
    }

    #[test]
    fn report_for_the_same_gp_counts_once() {
        // Built but not started: no coordinator interferes.
        let rcu = Rcu::build(
            RcuConfig::new(2),
            Arc::new(ThreadBoundTopology::new(2)),
            Arc::new(NullSink),
        )
        .unwrap();
        assert!(!rcu.report_qs_core(0), "no GP in flight");
        rcu.tree.reset_for_new_gp();
        rcu.gpnum.store(1, Ordering::SeqCst);
        assert!(rcu.report_qs_core(0));
        assert!(!rcu.report_qs_core(0));
        assert!(!rcu.tree.root_empty());
        assert!(rcu.report_qs_core(1));
        assert!(rcu.tree.root_empty());
    }
}
