//! Process-wide engine metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

pub const SESSION_RUNS_COUNTER: &str = "/inflow/core/direct_session_runs";

static SESSION_RUNS: AtomicU64 = AtomicU64::new(0);
static GRAPH_EXEC_TIME_USECS: AtomicU64 = AtomicU64::new(0);

const HISTOGRAM_BUCKETS: usize = 32;

#[derive(Debug, Default)]
pub struct ByteHistogram {
    buckets: [u64; HISTOGRAM_BUCKETS],
    total_bytes: u64,
    samples: u64,
}

impl ByteHistogram {
    fn record(&mut self, bytes: u64) {
        let bucket = (64 - bytes.leading_zeros() as usize).min(HISTOGRAM_BUCKETS - 1);
        self.buckets[bucket] += 1;
        self.total_bytes += bytes;
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bucket counts by power-of-two size class.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.buckets
    }
}

static INPUT_BYTES: Lazy<Mutex<ByteHistogram>> =
    Lazy::new(|| Mutex::new(ByteHistogram::default()));
static OUTPUT_BYTES: Lazy<Mutex<ByteHistogram>> =
    Lazy::new(|| Mutex::new(ByteHistogram::default()));

/// Incremented once per `Run`/`RunCallable`.
pub fn increment_session_runs() {
    SESSION_RUNS.fetch_add(1, Ordering::Relaxed);
}

pub fn session_runs() -> u64 {
    SESSION_RUNS.load(Ordering::Relaxed)
}

pub fn record_graph_input_tensors(bytes: usize) {
    INPUT_BYTES
        .lock()
        .expect("input histogram poisoned")
        .record(bytes as u64);
}

pub fn record_graph_output_tensors(bytes: usize) {
    OUTPUT_BYTES
        .lock()
        .expect("output histogram poisoned")
        .record(bytes as u64);
}

pub fn input_bytes_samples() -> u64 {
    INPUT_BYTES.lock().expect("input histogram poisoned").samples()
}

pub fn output_bytes_samples() -> u64 {
    OUTPUT_BYTES
        .lock()
        .expect("output histogram poisoned")
        .samples()
}

/// Wall time of the most recent step, microseconds.
pub fn update_graph_exec_time(usecs: u64) {
    GRAPH_EXEC_TIME_USECS.store(usecs, Ordering::Relaxed);
}

pub fn graph_exec_time_usecs() -> u64 {
    GRAPH_EXEC_TIME_USECS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = session_runs();
        increment_session_runs();
        increment_session_runs();
        assert!(session_runs() >= before + 2);

        let samples_before = input_bytes_samples();
        record_graph_input_tensors(128);
        assert_eq!(input_bytes_samples(), samples_before + 1);
    }
}
