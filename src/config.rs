//! Session, run, and callable option structs.
//!
//! These are plain-data mirrors of the wire-level configuration the engine
//! consumes; every field defaults to the "unset" value so callers build them
//! with struct-update syntax.

use serde::{Deserialize, Serialize};

pub const NO_COLLECTIVE_GRAPH_KEY: i64 = 0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Empty target selects the in-process engine.
    pub target: String,
    pub config: ConfigProto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigProto {
    /// 0 = pick per available parallelism, negative = run in caller thread.
    pub inter_op_parallelism_threads: i32,
    pub intra_op_parallelism_threads: i32,
    pub use_per_session_threads: bool,
    pub session_inter_op_thread_pool: Vec<ThreadPoolOptions>,
    /// 0 = wait forever unless a run overrides it.
    pub operation_timeout_in_ms: i64,
    /// Session groups: one GPU stream (virtual device) per member session.
    pub use_per_session_stream: bool,
    /// Device names this session keeps; empty keeps everything.
    pub per_session_devices: Vec<String>,
    pub log_device_placement: bool,
    pub device_count: DeviceCount,
    pub gpu_options: GpuOptions,
    pub graph_options: GraphOptions,
    pub experimental: ExperimentalConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuOptions {
    pub allow_growth: bool,
    /// One virtual GPU device is materialized per entry; -1 defers sizing.
    pub virtual_device_memory_limit_mb: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCount {
    pub cpu: Option<usize>,
    pub gpu: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadPoolOptions {
    /// 0 = derive from session options.
    pub num_threads: i32,
    /// Non-empty name interns the pool process-wide.
    pub global_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphOptions {
    /// Collect stats and rebuild the cost model every N-th step (0 = never).
    pub build_cost_model: i64,
    /// Skip this many steps before the first cost-model sample.
    pub build_cost_model_after: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorPolicy {
    #[default]
    Normal,
    Inline,
    CostModel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentalConfig {
    pub session_metadata: Option<SessionMetadata>,
    pub executor_policy: ExecutorPolicy,
    pub disable_thread_spinning: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub name: String,
    pub version: i64,
}

impl SessionMetadata {
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum TraceLevel {
    #[default]
    NoTrace,
    SoftwareTrace,
    HardwareTrace,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    pub trace_level: TraceLevel,
    /// Positive values override the session's operation timeout.
    pub timeout_in_ms: i64,
    /// Index into the session's inter-op pool vector; -1 = pool 0.
    pub inter_op_thread_pool: i32,
    pub output_partition_graphs: bool,
    pub report_tensor_allocations_upon_oom: bool,
    pub use_run_handler_pool: bool,
    pub debug_options: DebugOptions,
    pub collective_graph_key: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugOptions {
    pub global_step: i64,
    pub watches: Vec<DebugTensorWatch>,
}

impl DebugOptions {
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Stable one-line summary, part of the executor cache key.
    pub fn summarize(&self) -> String {
        let parts: Vec<String> = self
            .watches
            .iter()
            .map(|watch| format!("{}:{}", watch.node_name, watch.output_slot))
            .collect();
        parts.join("|")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugTensorWatch {
    pub node_name: String,
    pub output_slot: usize,
    pub debug_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallableOptions {
    pub feed: Vec<String>,
    pub fetch: Vec<String>,
    pub target: Vec<String>,
    pub run_options: RunOptions,
}
