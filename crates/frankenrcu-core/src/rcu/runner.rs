//! Callback runner threads.

#![allow(unsafe_code)]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::error::RcuError;
use crate::events::RcuEvent;

use super::{Doorbell, Rcu, mark_rcu_thread};

pub(super) fn spawn_all(rcu: &Arc<Rcu>) -> Result<(), RcuError> {
    for (index, bell) in rcu.runners.iter().enumerate() {
        let weak = Arc::downgrade(rcu);
        let bell = Arc::clone(bell);
        let period = rcu.config.gp_min_period;
        let name = format!("rcu_mgmt_{index}");
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || runner_thread(&weak, &bell, period, index))
            .map_err(|source| RcuError::Spawn { name, source })?;
    }
    Ok(())
}

fn runner_thread(weak: &Weak<Rcu>, bell: &Doorbell, period: Duration, index: usize) {
    mark_rcu_thread();
    loop {
        bell.wait(period);
        let Some(rcu) = weak.upgrade() else {
            break;
        };
        let stride = rcu.runners.len();
        for core in (index..rcu.cores.len()).step_by(stride) {
            rcu.run_callbacks(core);
        }
    }
}

impl Rcu {
    /// Execute the ready prefix of `core`'s queue. Returns how many ran.
    ///
    /// Only the runner owning `core` calls this, so detached batches of one
    /// core never overlap and FIFO order holds across batches.
    fn run_callbacks(&self, core: usize) -> usize {
        let pc = &self.cores[core];
        let completed = self.completed.load(Ordering::Acquire);
        if pc.nr_cbs.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let ready = pc.queue.lock().take_ready(completed);
        if ready.is_empty() {
            return 0;
        }
        // SAFETY: every queued record was handed over by `call_rcu`, whose
        // contract keeps it valid until its callback runs, and its GP is over.
        let ran = unsafe { ready.run_all() };
        {
            // Under the lock so `nr_cbs` never reads lower than the queue.
            let _queue = pc.queue.lock();
            pc.nr_cbs.fetch_sub(ran, Ordering::Release);
        }
        self.counters
            .callbacks_invoked
            .fetch_add(ran as u64, Ordering::Relaxed);
        self.events.emit(RcuEvent::CallbacksInvoked {
            core,
            count: ran,
            completed,
        });
        ran
    }
}
