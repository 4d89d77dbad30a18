//! Reader/writer stress over [`RcuCell`].
//!
//! Core 0 runs the writer, every other core runs one reader. Each published
//! version records its own reclamation in a shared ledger when it is dropped.
//! A reader that finds the version it is looking at already reclaimed has
//! caught a grace period ending under a read-side section.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use frankenrcu_core::{
    CoreState, EventSink, Rcu, RcuCell, RcuConfig, RcuError, RcuStats, ThreadBoundTopology,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TortureError {
    #[error("torture needs at least 2 cores (one writer, one reader), got {cores}")]
    TooFewCores { cores: usize },
    #[error("engine failed to start: {0}")]
    Engine(#[from] RcuError),
    #[error("a torture thread panicked")]
    ThreadPanicked,
}

#[derive(Debug, Clone)]
pub struct TortureConfig {
    pub cores: usize,
    pub updates: u64,
    /// Every this many updates the writer waits synchronously instead of
    /// deferring; 0 never does.
    pub sync_every: u64,
    /// Readers hold each version this long before checking it.
    pub read_hold: Duration,
    pub engine: RcuConfig,
}

impl TortureConfig {
    #[must_use]
    pub fn new(cores: usize, updates: u64) -> Self {
        Self {
            cores,
            updates,
            sync_every: 16,
            read_hold: Duration::from_micros(20),
            engine: RcuConfig::new(cores),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TortureReport {
    pub cores: usize,
    pub readers: usize,
    pub updates: u64,
    pub reads: u64,
    /// Reads that observed a reclaimed version. Must be zero.
    pub violations: u64,
    /// Versions reclaimed by the end of the run (all but the current one).
    pub reclaimed: u64,
    pub duration_ms: u64,
    pub stats: RcuStats,
}

impl TortureReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations == 0 && self.reclaimed == self.updates
    }
}

/// Reclamation flags, one per version number.
struct Ledger {
    reclaimed: Box<[AtomicBool]>,
}

impl Ledger {
    fn new(versions: u64) -> Self {
        Self {
            reclaimed: (0..=versions).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn is_reclaimed(&self, seq: u64) -> bool {
        self.reclaimed[seq as usize].load(Ordering::SeqCst)
    }

    fn count(&self) -> u64 {
        self.reclaimed
            .iter()
            .filter(|r| r.load(Ordering::SeqCst))
            .count() as u64
    }
}

struct Version {
    seq: u64,
    ledger: Arc<Ledger>,
}

impl Drop for Version {
    fn drop(&mut self) {
        self.ledger.reclaimed[self.seq as usize].store(true, Ordering::SeqCst);
    }
}

/// Run the stress and return its report. Events go to `events`.
pub fn run(config: &TortureConfig, events: Arc<dyn EventSink>) -> Result<TortureReport, TortureError> {
    if config.cores < 2 {
        return Err(TortureError::TooFewCores {
            cores: config.cores,
        });
    }
    let topo = Arc::new(ThreadBoundTopology::new(config.cores));
    let engine = config.engine.clone();
    let rcu = Rcu::start_with_sink(engine, Arc::clone(&topo) as _, events)?;
    let ledger = Arc::new(Ledger::new(config.updates));
    let cell = Arc::new(RcuCell::new(
        Arc::clone(&rcu),
        Version {
            seq: 0,
            ledger: Arc::clone(&ledger),
        },
    ));
    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));
    let violations = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let readers: Vec<_> = (1..config.cores)
        .map(|core| {
            let (topo, rcu, cell) = (Arc::clone(&topo), Arc::clone(&rcu), Arc::clone(&cell));
            let (ledger, stop) = (Arc::clone(&ledger), Arc::clone(&stop));
            let (reads, violations) = (Arc::clone(&reads), Arc::clone(&violations));
            let hold = config.read_hold;
            thread::spawn(move || {
                topo.bind_current_thread(core);
                let mut iter = 0u64;
                while !stop.load(Ordering::Acquire) {
                    topo.set_current_state(CoreState::Kernel);
                    // SAFETY: this core is marked busy and reports no QS
                    // until the closure returns.
                    let torn = unsafe {
                        cell.read(|v| {
                            spin_for(hold);
                            ledger.is_reclaimed(v.seq)
                        })
                    };
                    if torn {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    reads.fetch_add(1, Ordering::Relaxed);
                    iter += 1;
                    // Alternate between explicit reports and idle hints so
                    // both paths carry grace periods.
                    if iter % 4 == 0 {
                        topo.set_current_state(CoreState::Idle);
                        thread::yield_now();
                    } else {
                        rcu.report_qs();
                    }
                }
                topo.set_current_state(CoreState::Idle);
            })
        })
        .collect();

    let writer = {
        let (topo, cell, ledger) = (Arc::clone(&topo), Arc::clone(&cell), Arc::clone(&ledger));
        let (updates, sync_every) = (config.updates, config.sync_every);
        thread::spawn(move || {
            topo.bind_current_thread(0);
            for seq in 1..=updates {
                let next = Version {
                    seq,
                    ledger: Arc::clone(&ledger),
                };
                if sync_every != 0 && seq % sync_every == 0 {
                    drop(cell.replace_sync(next));
                } else {
                    cell.replace(next);
                }
                cell.rcu().report_qs();
            }
        })
    };

    let writer_ok = writer.join().is_ok();
    stop.store(true, Ordering::Release);
    let readers_ok = readers.into_iter().all(|r| r.join().is_ok());
    if !(writer_ok && readers_ok) {
        return Err(TortureError::ThreadPanicked);
    }
    rcu.rcu_barrier();

    Ok(TortureReport {
        cores: config.cores,
        readers: config.cores - 1,
        updates: config.updates,
        reads: reads.load(Ordering::Relaxed),
        violations: violations.load(Ordering::Relaxed),
        reclaimed: ledger.count(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        stats: rcu.stats(),
    })
}

fn spin_for(hold: Duration) {
    let until = Instant::now() + hold;
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}
