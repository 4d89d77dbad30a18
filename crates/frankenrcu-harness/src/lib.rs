//! Test harness for frankenrcu.
//!
//! This crate provides:
//! - Structured JSONL logging and artifact indexes with content hashes
//! - An [`EventSink`](frankenrcu_core::EventSink) that writes engine events as log lines
//! - A reader/writer torture run over [`RcuCell`](frankenrcu_core::RcuCell)

#![deny(unsafe_code)]

pub mod event_log;
pub mod structured_log;
pub mod torture;

pub use event_log::JsonlSink;
pub use structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome};
pub use torture::{TortureConfig, TortureError, TortureReport};
