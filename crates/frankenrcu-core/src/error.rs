//! Construction-time errors.
//!
//! The runtime API never returns errors: `call_rcu` cannot fail and misuse of
//! the blocking primitives is fatal. Everything that *can* be rejected is
//! rejected while the engine is being built.

use thiserror::Error;

use crate::rcu::tree::{MAX_LEVELS, MAX_LEAF_FANOUT, MIN_LEAF_FANOUT};

#[derive(Debug, Error)]
pub enum RcuError {
    #[error("rcu needs at least one core")]
    NoCores,
    #[error("leaf fan-out {fanout} outside {}..={}", MIN_LEAF_FANOUT, MAX_LEAF_FANOUT)]
    FanoutOutOfRange { fanout: usize },
    #[error("{cores} cores exceed the {capacity}-core capacity of a {}-level tree", MAX_LEVELS)]
    TooManyCores { cores: usize, capacity: usize },
    #[error("logical core count {logical} is below the physical core count {physical}")]
    LogicalBelowPhysical { logical: usize, physical: usize },
    #[error("at least one callback runner thread is required")]
    NoRunners,
    #[error("topology reports {topology} cores but the config asks for {config}")]
    TopologyMismatch { topology: usize, config: usize },
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
