//! Join barrier over the per-partition executors of one step.

use std::sync::{Arc, Mutex};

use crate::rendezvous::Rendezvous;
use crate::status::{Result, StatusGroup};

pub type DoneCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Owns one token per executor and a reference to the step's rendezvous.
/// Each returning token folds its status into the aggregate; the first
/// failure aborts the rendezvous so sibling partitions fail fast, and the
/// last token fires the completion callback.
pub struct ExecutorBarrier {
    remaining: Mutex<usize>,
    status: Mutex<StatusGroup>,
    rendezvous: Arc<Rendezvous>,
    done: Mutex<Option<DoneCallback>>,
}

impl ExecutorBarrier {
    pub fn new(
        num_executors: usize,
        rendezvous: Arc<Rendezvous>,
        done: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(num_executors),
            status: Mutex::new(StatusGroup::default()),
            rendezvous,
            done: Mutex::new(Some(Box::new(done))),
        })
    }

    /// Hand one completion token to an executor.
    pub fn get(self: &Arc<Self>) -> DoneCallback {
        let barrier = Arc::clone(self);
        Box::new(move |result| barrier.whole_done(result))
    }

    fn whole_done(&self, result: Result<()>) {
        let first_failure = {
            let mut status = self.status.lock().expect("barrier status poisoned");
            let failure = match &result {
                Err(err) if status.is_ok() => Some(err.clone()),
                _ => None,
            };
            status.update(result);
            failure
        };
        if let Some(err) = first_failure {
            crate::trace!("executor failed, aborting step rendezvous: {err}");
            self.rendezvous.start_abort(err);
        }

        let finished = {
            let mut remaining = self.remaining.lock().expect("barrier count poisoned");
            *remaining -= 1;
            *remaining == 0
        };
        if finished {
            let aggregate = self
                .status
                .lock()
                .expect("barrier status poisoned")
                .current();
            let done = self
                .done
                .lock()
                .expect("barrier done poisoned")
                .take();
            if let Some(done) = done {
                done(aggregate);
            }
        }
    }
}
