//! Engine configuration.
//!
//! An [`RcuConfig`] is built by the embedding code and handed to
//! [`Rcu::start`](crate::Rcu::start). The defaults match the tuning the
//! engine was designed around:
//! - a GP is started at least every 25ms even without callers,
//! - tardy cores are re-polled every 1ms while a GP is open,
//! - a core with more than 10 queued callbacks pokes the coordinator.
//!
//! [`RcuConfig::from_env`] layers `FRANKENRCU_*` overrides on top of the
//! defaults for tooling and tests. Unparsable values fall back to the default
//! rather than failing.

use std::time::Duration;

use crate::error::RcuError;
use crate::rcu::tree::{MAX_LEAF_FANOUT, MIN_LEAF_FANOUT, tree_capacity};

/// How many queued callbacks on one core trigger an early GP.
pub const DEFAULT_CB_THRESHOLD: usize = 10;
/// Upper bound between GPs when nobody asks for one.
pub const DEFAULT_GP_MIN_PERIOD: Duration = Duration::from_micros(25_000);
/// How long the coordinator waits for cores to check in before re-polling.
pub const DEFAULT_GP_TARDY_PERIOD: Duration = Duration::from_micros(1_000);
/// Children per leaf node.
pub const DEFAULT_LEAF_FANOUT: usize = 16;
/// A GP open this long is reported as stalled.
pub const DEFAULT_STALL_WARN_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcuConfig {
    /// Physical cores: each gets a per-core context and callback queue.
    pub num_cores: usize,
    /// Cores covered by the quiescence tree. Anything above `num_cores` is a
    /// synthetic core that the coordinator reports for itself.
    pub logical_cores: usize,
    pub fanout_leaf: usize,
    pub cb_threshold: usize,
    pub gp_min_period: Duration,
    pub gp_tardy_period: Duration,
    /// `None` disables stall reporting.
    pub stall_warn_after: Option<Duration>,
    pub runner_threads: usize,
    /// Skip odd cores in the initial expedite so they are found as tardy.
    pub debug_tardy: bool,
    /// Starting value for both `gpnum` and `completed`.
    pub initial_gpnum: u64,
}

impl RcuConfig {
    #[must_use]
    pub fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            logical_cores: num_cores,
            fanout_leaf: DEFAULT_LEAF_FANOUT,
            cb_threshold: DEFAULT_CB_THRESHOLD,
            gp_min_period: DEFAULT_GP_MIN_PERIOD,
            gp_tardy_period: DEFAULT_GP_TARDY_PERIOD,
            stall_warn_after: Some(DEFAULT_STALL_WARN_AFTER),
            runner_threads: 1,
            debug_tardy: false,
            initial_gpnum: 0,
        }
    }

    /// Defaults for `num_cores`, overridden by any `FRANKENRCU_*` variables.
    #[must_use]
    pub fn from_env(num_cores: usize) -> Self {
        Self::from_lookup(num_cores, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    #[must_use]
    pub fn from_lookup(num_cores: usize, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::new(num_cores);
        if let Some(v) = lookup("FRANKENRCU_FANOUT_LEAF").and_then(|v| parse_usize(&v)) {
            cfg.fanout_leaf = v;
        }
        if let Some(v) = lookup("FRANKENRCU_LOGICAL_CORES").and_then(|v| parse_usize(&v)) {
            cfg.logical_cores = v.max(num_cores);
        }
        if let Some(v) = lookup("FRANKENRCU_GP_PERIOD_US").and_then(|v| parse_usize(&v)) {
            cfg.gp_min_period = Duration::from_micros(v as u64);
        }
        if let Some(v) = lookup("FRANKENRCU_TARDY_US").and_then(|v| parse_usize(&v)) {
            cfg.gp_tardy_period = Duration::from_micros(v as u64);
        }
        if let Some(v) = lookup("FRANKENRCU_CB_THRESH").and_then(|v| parse_usize(&v)) {
            cfg.cb_threshold = v;
        }
        if let Some(v) = lookup("FRANKENRCU_RUNNERS").and_then(|v| parse_usize(&v)) {
            cfg.runner_threads = v;
        }
        if let Some(v) = lookup("FRANKENRCU_DEBUG_TARDY") {
            cfg.debug_tardy = parse_flag_loose(&v);
        }
        cfg
    }

    #[must_use]
    pub fn with_logical_cores(mut self, logical_cores: usize) -> Self {
        self.logical_cores = logical_cores;
        self
    }

    #[must_use]
    pub fn with_fanout_leaf(mut self, fanout_leaf: usize) -> Self {
        self.fanout_leaf = fanout_leaf;
        self
    }

    #[must_use]
    pub fn with_cb_threshold(mut self, cb_threshold: usize) -> Self {
        self.cb_threshold = cb_threshold;
        self
    }

    #[must_use]
    pub fn with_gp_min_period(mut self, period: Duration) -> Self {
        self.gp_min_period = period;
        self
    }

    #[must_use]
    pub fn with_gp_tardy_period(mut self, period: Duration) -> Self {
        self.gp_tardy_period = period;
        self
    }

    #[must_use]
    pub fn with_stall_warn_after(mut self, after: Option<Duration>) -> Self {
        self.stall_warn_after = after;
        self
    }

    #[must_use]
    pub fn with_runner_threads(mut self, runner_threads: usize) -> Self {
        self.runner_threads = runner_threads;
        self
    }

    #[must_use]
    pub fn with_debug_tardy(mut self, debug_tardy: bool) -> Self {
        self.debug_tardy = debug_tardy;
        self
    }

    #[must_use]
    pub fn with_initial_gpnum(mut self, gpnum: u64) -> Self {
        self.initial_gpnum = gpnum;
        self
    }

    /// Reject configurations the tree or the thread layout cannot honor.
    pub fn validate(&self) -> Result<(), RcuError> {
        if self.num_cores == 0 {
            return Err(RcuError::NoCores);
        }
        if !(MIN_LEAF_FANOUT..=MAX_LEAF_FANOUT).contains(&self.fanout_leaf) {
            return Err(RcuError::FanoutOutOfRange {
                fanout: self.fanout_leaf,
            });
        }
        if self.logical_cores < self.num_cores {
            return Err(RcuError::LogicalBelowPhysical {
                logical: self.logical_cores,
                physical: self.num_cores,
            });
        }
        let capacity = tree_capacity(self.fanout_leaf);
        if self.logical_cores > capacity {
            return Err(RcuError::TooManyCores {
                cores: self.logical_cores,
                capacity,
            });
        }
        if self.runner_threads == 0 {
            return Err(RcuError::NoRunners);
        }
        Ok(())
    }
}

fn parse_usize(raw: &str) -> Option<usize> {
    raw.trim().parse().ok()
}

fn parse_flag_loose(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_tuning() {
        let cfg = RcuConfig::new(4);
        assert_eq!(cfg.logical_cores, 4);
        assert_eq!(cfg.cb_threshold, 10);
        assert_eq!(cfg.gp_min_period, Duration::from_millis(25));
        assert_eq!(cfg.gp_tardy_period, Duration::from_millis(1));
        assert_eq!(cfg.runner_threads, 1);
        assert!(!cfg.debug_tardy);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = RcuConfig::from_lookup(
            8,
            lookup_from(&[
                ("FRANKENRCU_FANOUT_LEAF", "4"),
                ("FRANKENRCU_LOGICAL_CORES", "200"),
                ("FRANKENRCU_GP_PERIOD_US", "5000"),
                ("FRANKENRCU_TARDY_US", " 250 "),
                ("FRANKENRCU_CB_THRESH", "3"),
                ("FRANKENRCU_RUNNERS", "2"),
                ("FRANKENRCU_DEBUG_TARDY", "ON"),
            ]),
        );
        assert_eq!(cfg.fanout_leaf, 4);
        assert_eq!(cfg.logical_cores, 200);
        assert_eq!(cfg.gp_min_period, Duration::from_millis(5));
        assert_eq!(cfg.gp_tardy_period, Duration::from_micros(250));
        assert_eq!(cfg.cb_threshold, 3);
        assert_eq!(cfg.runner_threads, 2);
        assert!(cfg.debug_tardy);
    }

    #[test]
    fn bogus_env_values_keep_defaults() {
        let cfg = RcuConfig::from_lookup(
            2,
            lookup_from(&[
                ("FRANKENRCU_FANOUT_LEAF", "sixteen"),
                ("FRANKENRCU_LOGICAL_CORES", "1"),
                ("FRANKENRCU_DEBUG_TARDY", "maybe"),
            ]),
        );
        assert_eq!(cfg.fanout_leaf, DEFAULT_LEAF_FANOUT);
        // Never shrinks below the physical count.
        assert_eq!(cfg.logical_cores, 2);
        assert!(!cfg.debug_tardy);
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        assert!(matches!(
            RcuConfig::new(0).validate(),
            Err(RcuError::NoCores)
        ));
        assert!(matches!(
            RcuConfig::new(4).with_fanout_leaf(1).validate(),
            Err(RcuError::FanoutOutOfRange { fanout: 1 })
        ));
        assert!(matches!(
            RcuConfig::new(4).with_fanout_leaf(65).validate(),
            Err(RcuError::FanoutOutOfRange { fanout: 65 })
        ));
        assert!(matches!(
            RcuConfig::new(4).with_logical_cores(3).validate(),
            Err(RcuError::LogicalBelowPhysical { .. })
        ));
        assert!(matches!(
            RcuConfig::new(4).with_runner_threads(0).validate(),
            Err(RcuError::NoRunners)
        ));
        let huge = tree_capacity(2) + 1;
        assert!(matches!(
            RcuConfig::new(huge).with_fanout_leaf(2).validate(),
            Err(RcuError::TooManyCores { .. })
        ));
    }
}
