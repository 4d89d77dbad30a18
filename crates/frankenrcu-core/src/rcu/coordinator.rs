//! Grace-period coordinator thread.

use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::error::RcuError;
use crate::events::RcuEvent;

use super::{Doorbell, Rcu, mark_rcu_thread};

pub(super) const GP_THREAD_NAME: &str = "rcu_gp";

pub(super) fn spawn(rcu: &Arc<Rcu>) -> Result<(), RcuError> {
    let weak = Arc::downgrade(rcu);
    let bell = Arc::clone(&rcu.gp_bell);
    let period = rcu.config.gp_min_period;
    thread::Builder::new()
        .name(GP_THREAD_NAME.to_string())
        .spawn(move || gp_thread(&weak, &bell, period))
        .map_err(|source| RcuError::Spawn {
            name: GP_THREAD_NAME.to_string(),
            source,
        })?;
    Ok(())
}

fn gp_thread(weak: &Weak<Rcu>, bell: &Doorbell, period: Duration) {
    mark_rcu_thread();
    loop {
        // Requests ringing after this returns get a GP that starts after them.
        bell.wait(period);
        let Some(rcu) = weak.upgrade() else {
            break;
        };
        rcu.run_gp();
        rcu.wake_runners();
    }
}

impl Rcu {
    /// Run one complete grace period.
    fn run_gp(&self) {
        let prev = self.gpnum.load(Ordering::Relaxed);
        assert_eq!(
            prev,
            self.completed.load(Ordering::Relaxed),
            "grace period {prev} still in flight"
        );
        self.tree.reset_for_new_gp();
        let gpnum = prev.wrapping_add(1);
        let started = self.now_ns();
        self.gp_started_ns.store(started, Ordering::Release);
        // Cores that see the new number must see a fully reset tree; the
        // topology hints read below must be newer than this store.
        self.gpnum.store(gpnum, Ordering::SeqCst);
        self.events.emit(RcuEvent::GpStarted { gpnum });

        self.report_synthetic_cores();
        self.expedite_remote_cores();

        let mut tardy_scans = 0u32;
        let mut stall_reported = false;
        loop {
            self.gp_bell
                .rendez
                .sleep_timeout(self.config.gp_tardy_period, || self.tree.root_empty());
            if self.tree.root_empty() {
                break;
            }
            tardy_scans = tardy_scans.saturating_add(1);
            self.counters.tardy_scans.fetch_add(1, Ordering::Relaxed);
            self.poll_tardy_cores();
            if self.tree.root_empty() {
                break;
            }
            if !stall_reported {
                stall_reported = self.check_stall(gpnum);
            }
        }

        fence(Ordering::SeqCst);
        self.completed.store(gpnum, Ordering::Release);
        self.counters.gps_completed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(RcuEvent::GpCompleted {
            gpnum,
            duration_us: self.now_ns().saturating_sub(started) / 1_000,
            tardy_scans,
        });
    }

    /// Cores in the tree beyond the physical ones never run anything.
    fn report_synthetic_cores(&self) {
        for core in self.cores.len()..self.tree.num_cores() {
            if self.skipped_for_debug(core) {
                continue;
            }
            let (leaf, bit) = self.tree.leaf_for(core);
            self.mark_tree(leaf, bit);
        }
    }

    /// Report for every core whose last observed state is quiescent.
    fn expedite_remote_cores(&self) {
        for core in 0..self.cores.len() {
            if self.skipped_for_debug(core) {
                continue;
            }
            self.report_qs_remote(core);
        }
    }

    /// Re-poll only the cores whose leaf bit is still set.
    fn poll_tardy_cores(&self) {
        for leaf in self.tree.leaves() {
            let node = self.tree.node(leaf);
            let mut pending = node.qsmask();
            while pending != 0 {
                let bit = pending.trailing_zeros();
                pending &= pending - 1;
                let core = node.grplo() + bit as usize;
                if core < self.cores.len() {
                    self.report_qs_remote(core);
                } else {
                    self.mark_tree(leaf, 1 << bit);
                }
            }
        }
    }

    fn report_qs_remote(&self, core: usize) {
        if self.topology.core_state(core).is_quiescent() && self.report_qs_core(core) {
            self.counters.remote_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Emit a stall event once the GP is older than the configured limit.
    fn check_stall(&self, gpnum: u64) -> bool {
        let (Some(limit), Some(age)) = (self.config.stall_warn_after, self.gp_age()) else {
            return false;
        };
        if age < limit {
            return false;
        }
        self.counters.stalls.fetch_add(1, Ordering::Relaxed);
        self.events.emit(RcuEvent::GpStall {
            gpnum,
            open_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
            root_qsmask: self.tree.root_qsmask(),
        });
        true
    }

    fn skipped_for_debug(&self, core: usize) -> bool {
        self.config.debug_tardy && core % 2 == 1
    }

    /// Ask the coordinator for a GP. Unless `force`, this is a no-op while a
    /// GP is already running; the periodic GP will pick the callbacks up.
    pub(super) fn wake_gp(&self, force: bool) {
        if !force && self.gp_in_progress() {
            return;
        }
        self.gp_bell.ring();
    }
}
