#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use frankenrcu_core::{Rcu, RcuConfig, RcuHead, ThreadBoundTopology};

/// Caller-owned callback record.
#[repr(C)]
struct Counted {
    head: RcuHead,
    own_hits: AtomicUsize,
    total: *const AtomicUsize,
}

unsafe fn count_hit(head: NonNull<RcuHead>) {
    let rec = unsafe { head.cast::<Counted>().as_ref() };
    rec.own_hits.fetch_add(1, Ordering::SeqCst);
    unsafe { (*rec.total).fetch_add(1, Ordering::SeqCst) };
}

#[test]
fn barrier_over_five_cores_three_callbacks_each() {
    let topo = Arc::new(ThreadBoundTopology::new(5));
    // Keep the threshold out of the way: only the barrier forces GPs.
    let cfg = RcuConfig::new(5).with_cb_threshold(100);
    let rcu = Rcu::start(cfg, topo).unwrap();
    let total = AtomicUsize::new(0);

    let mut records: Vec<Box<Counted>> = (0..15)
        .map(|_| {
            Box::new(Counted {
                head: RcuHead::new(),
                own_hits: AtomicUsize::new(0),
                total: &total,
            })
        })
        .collect();
    for (i, rec) in records.iter_mut().enumerate() {
        let head = NonNull::from(&mut rec.head);
        unsafe { rcu.call_rcu_on(i % 5, head, count_hit) };
    }
    for core in 0..5 {
        assert_eq!(rcu.pending_callbacks(core), 3);
    }

    rcu.rcu_barrier();
    assert_eq!(total.load(Ordering::SeqCst), 15);
    for rec in &records {
        assert_eq!(rec.own_hits.load(Ordering::SeqCst), 1);
    }
    assert_eq!(rcu.stats().barriers, 1);

    thread::sleep(Duration::from_millis(60));
    assert_eq!(total.load(Ordering::SeqCst), 15);
    for core in 0..5 {
        assert_eq!(rcu.pending_callbacks(core), 0);
    }
    drop(records);
}

#[test]
fn barrier_with_nothing_queued_returns_immediately() {
    let topo = Arc::new(ThreadBoundTopology::new(3));
    let rcu = Rcu::start(RcuConfig::new(3), topo).unwrap();
    rcu.rcu_barrier();
    assert_eq!(rcu.stats().barriers, 0);
}

#[test]
fn barrier_skips_empty_cores() {
    let topo = Arc::new(ThreadBoundTopology::new(4));
    let (rcu, ring) = Rcu::start_with_ring(RcuConfig::new(4), Arc::clone(&topo) as _).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    topo.bind_current_thread(2);
    for _ in 0..3 {
        let hits = Arc::clone(&hits);
        rcu.call_rcu_fn(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    topo.unbind_current_thread();
    rcu.rcu_barrier();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let issued: Vec<usize> = ring
        .snapshot()
        .into_iter()
        .filter_map(|e| match e {
            frankenrcu_core::RcuEvent::BarrierIssued { cores } => Some(cores),
            _ => None,
        })
        .collect();
    assert_eq!(issued, vec![1]);
}

#[test]
fn callbacks_run_fifo_per_core() {
    let topo = Arc::new(ThreadBoundTopology::new(6));
    let cfg = RcuConfig::new(6).with_runner_threads(3).with_cb_threshold(5);
    let rcu = Rcu::start(cfg, Arc::clone(&topo) as _).unwrap();
    let logs: Arc<Vec<Mutex<Vec<usize>>>> = Arc::new((0..6).map(|_| Mutex::new(Vec::new())).collect());

    let writers: Vec<_> = (0..6)
        .map(|core| {
            let (topo, rcu, logs) = (Arc::clone(&topo), Arc::clone(&rcu), Arc::clone(&logs));
            thread::spawn(move || {
                topo.bind_current_thread(core);
                for seq in 0..200 {
                    let logs = Arc::clone(&logs);
                    rcu.call_rcu_fn(move || logs[core].lock().push(seq));
                    if seq % 50 == 0 {
                        rcu.report_qs();
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    rcu.rcu_barrier();

    for (core, log) in logs.iter().enumerate() {
        let log = log.lock();
        assert_eq!(log.len(), 200, "core {core}");
        assert!(log.windows(2).all(|w| w[0] < w[1]), "core {core} out of order");
    }
}

#[test]
fn barrier_covers_callbacks_from_concurrent_writers() {
    let topo = Arc::new(ThreadBoundTopology::new(4));
    let rcu = Rcu::start(RcuConfig::new(4), Arc::clone(&topo) as _).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for round in 1..=3 {
        let writers: Vec<_> = (0..4)
            .map(|core| {
                let (topo, rcu, hits) = (Arc::clone(&topo), Arc::clone(&rcu), Arc::clone(&hits));
                thread::spawn(move || {
                    topo.bind_current_thread(core);
                    for _ in 0..25 {
                        let hits = Arc::clone(&hits);
                        rcu.call_rcu_fn(move || {
                            hits.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        rcu.rcu_barrier();
        assert_eq!(hits.load(Ordering::SeqCst), round * 100);
    }
}

#[test]
fn defer_drop_releases_after_grace_period() {
    let topo = Arc::new(ThreadBoundTopology::new(2));
    let rcu = Rcu::start(RcuConfig::new(2), topo).unwrap();
    let marker = Arc::new(());
    rcu.defer_drop(Box::new(Arc::clone(&marker)));
    rcu.rcu_barrier();
    assert_eq!(Arc::strong_count(&marker), 1);
    let stats = rcu.stats();
    assert_eq!(stats.callbacks_queued, stats.callbacks_invoked);
    assert_eq!(stats.callbacks_pending, 0);
}
