//! # frankenrcu-core
//!
//! Tree-based Read-Copy-Update engine with a dedicated grace-period
//! coordinator and callback runner threads.
//!
//! Readers pay nothing. Writers defer reclamation with [`Rcu::call_rcu`] (or
//! the boxed conveniences) or block with [`Rcu::synchronize_rcu`];
//! [`Rcu::rcu_barrier`] drains everything queued so far. The embedding code
//! supplies a [`CoreTopology`] describing its cores and calls
//! [`Rcu::report_qs`] at points where the current core holds no RCU
//! references.
//!
//! Unsafe code is confined to the callback plumbing under `rcu`.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod rcu;
pub mod sync;
pub mod topology;

pub use config::RcuConfig;
pub use error::RcuError;
pub use events::{EventRing, EventSink, NullSink, RcuEvent, Severity};
pub use rcu::{
    GpCookie, Rcu, RcuCallback, RcuCell, RcuHead, RcuStats, gp_ge, gp_lt, in_rcu_callback_context,
    rcu_read_lock, rcu_read_unlock,
};
pub use topology::{CoreState, CoreTopology, OpaqueTopology, ThreadBoundTopology};
