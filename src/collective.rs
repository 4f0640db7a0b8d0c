//! Per-step collective executor bookkeeping. Created lazily the first time a
//! graph with collective ops runs; steps that participate in the same
//! collective share a graph key so their parameters can be correlated.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::config::NO_COLLECTIVE_GRAPH_KEY;

#[derive(Debug)]
pub struct CollectiveExecutor {
    step_id: i64,
}

impl CollectiveExecutor {
    pub fn step_id(&self) -> i64 {
        self.step_id
    }
}

#[derive(Debug, Default)]
pub struct CollectiveExecutorMgr {
    executors: Mutex<HashMap<i64, Arc<CollectiveExecutor>>>,
}

impl CollectiveExecutorMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_or_create(&self, step_id: i64) -> Arc<CollectiveExecutor> {
        let mut executors = self.executors.lock().expect("collective executors poisoned");
        Arc::clone(
            executors
                .entry(step_id)
                .or_insert_with(|| Arc::new(CollectiveExecutor { step_id })),
        )
    }

    /// Lease the step's executor; the returned handle releases the step's
    /// entry when dropped, so the table stays bounded by in-flight steps.
    pub fn acquire(self: &Arc<Self>, step_id: i64) -> CollectiveExecutorHandle {
        CollectiveExecutorHandle {
            executor: self.find_or_create(step_id),
            mgr: Arc::clone(self),
        }
    }

    pub fn cleanup(&self, step_id: i64) {
        let mut executors = self.executors.lock().expect("collective executors poisoned");
        executors.remove(&step_id);
    }
}

/// One step's lease on the collective executor manager. Held by the run
/// state; executors only borrow the executor through their args.
pub struct CollectiveExecutorHandle {
    executor: Arc<CollectiveExecutor>,
    mgr: Arc<CollectiveExecutorMgr>,
}

impl CollectiveExecutorHandle {
    pub fn get(&self) -> &Arc<CollectiveExecutor> {
        &self.executor
    }
}

impl Drop for CollectiveExecutorHandle {
    fn drop(&mut self) {
        self.mgr.cleanup(self.executor.step_id());
    }
}

/// Derive the correlation key for a client graph from its collective node
/// names; graphs with no collective ops use `NO_COLLECTIVE_GRAPH_KEY`.
pub fn graph_key_for(collective_nodes: &mut Vec<String>) -> i64 {
    if collective_nodes.is_empty() {
        return NO_COLLECTIVE_GRAPH_KEY;
    }
    collective_nodes.sort();
    let mut hasher = DefaultHasher::new();
    for name in collective_nodes.iter() {
        name.hash(&mut hasher);
    }
    let key = (hasher.finish() >> 1) as i64;
    if key == NO_COLLECTIVE_GRAPH_KEY {
        key + 1
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_insensitive_and_nonzero() {
        let mut a = vec!["c2".to_string(), "c1".to_string()];
        let mut b = vec!["c1".to_string(), "c2".to_string()];
        let key_a = graph_key_for(&mut a);
        let key_b = graph_key_for(&mut b);
        assert_eq!(key_a, key_b);
        assert_ne!(key_a, NO_COLLECTIVE_GRAPH_KEY);
        assert_eq!(graph_key_for(&mut Vec::new()), NO_COLLECTIVE_GRAPH_KEY);
    }

    #[test]
    fn per_step_handles_are_shared() {
        let mgr = CollectiveExecutorMgr::new();
        let first = mgr.find_or_create(7);
        let second = mgr.find_or_create(7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.step_id(), 7);
    }

    #[test]
    fn dropping_the_lease_releases_the_step() {
        let mgr = Arc::new(CollectiveExecutorMgr::new());
        let handle = mgr.acquire(3);
        let leased = Arc::clone(handle.get());
        drop(handle);
        // The step's entry is gone; a new request builds a fresh executor.
        let fresh = mgr.find_or_create(3);
        assert!(!Arc::ptr_eq(&leased, &fresh));
        mgr.cleanup(3);
    }
}
