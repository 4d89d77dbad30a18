//! Engine events as structured log entries.

use std::sync::atomic::{AtomicU64, Ordering};

use frankenrcu_core::{EventSink, RcuEvent, Severity};
use parking_lot::Mutex;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel};

/// Component name stamped on engine events.
pub const ENGINE_COMPONENT: &str = "engine";

#[must_use]
pub fn level_for(severity: Severity) -> LogLevel {
    match severity {
        Severity::Debug => LogLevel::Debug,
        Severity::Info => LogLevel::Info,
        Severity::Warn => LogLevel::Warn,
    }
}

/// Map an engine event onto a log entry. The trace id is left empty for the
/// emitter to assign.
#[must_use]
pub fn entry_from_event(event: &RcuEvent) -> LogEntry {
    let entry = LogEntry::new(String::new(), level_for(event.severity()), event.name());
    let details = serde_json::to_value(event).ok();
    let entry = match *event {
        RcuEvent::GpStarted { gpnum } | RcuEvent::GpStall { gpnum, .. } => entry.with_gpnum(gpnum),
        RcuEvent::GpCompleted {
            gpnum, duration_us, ..
        } => entry.with_gpnum(gpnum).with_duration_us(duration_us),
        RcuEvent::CallbacksInvoked { core, .. } => entry.with_core(core),
        RcuEvent::TreeBuilt { .. } | RcuEvent::BarrierIssued { .. } => entry,
    };
    match details {
        Some(details) => entry.with_details(details),
        None => entry,
    }
}

/// [`EventSink`] writing every event as one JSONL line.
///
/// Write errors are counted, not propagated: the engine cannot act on them.
pub struct JsonlSink {
    emitter: Mutex<LogEmitter>,
    min_level: LogLevel,
    write_errors: AtomicU64,
}

impl JsonlSink {
    #[must_use]
    pub fn new(emitter: LogEmitter) -> Self {
        Self {
            emitter: Mutex::new(emitter),
            min_level: LogLevel::Trace,
            write_errors: AtomicU64::new(0),
        }
    }

    /// Drop events below `level`.
    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Write a non-engine entry (run summaries and the like) into the same
    /// stream.
    pub fn emit_entry(&self, entry: LogEntry) -> std::io::Result<()> {
        self.emitter.lock().emit_entry(entry)
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.emitter.lock().flush()
    }

    #[must_use]
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitter.lock().emitted()
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: RcuEvent) {
        let entry = entry_from_event(&event);
        if rank(entry.level) < rank(self.min_level) {
            return;
        }
        if self.emitter.lock().emit_entry(entry).is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

const fn rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Trace => 0,
        LogLevel::Debug => 1,
        LogLevel::Info => 2,
        LogLevel::Warn => 3,
        LogLevel::Error => 4,
    }
}
