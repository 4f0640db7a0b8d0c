//! Per-step and per-cache-entry state owned by a session.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

use crate::cancellation::Notification;
use crate::collective::CollectiveExecutorHandle;
use crate::config::{CallableOptions, DebugOptions};
use crate::device::resource::StepContainer;
use crate::device::Device;
use crate::executor::stats::StepStatsCollector;
use crate::executor::Executor;
use crate::graph::{FunctionLibraryDefinition, Graph};
use crate::rendezvous::Rendezvous;
use crate::status::{Result, Status, StatusGroup};
use crate::tensor::{DType, TensorValue};

/// Container name for tensors addressable through resource handles.
pub const TENSOR_HANDLE_RESOURCE_CONTAINER: &str = "tensor_handle";

/// Session-scoped tensors that survive across steps, addressed by name.
#[derive(Debug, Default)]
pub struct SessionState {
    tensors: Mutex<HashMap<String, TensorValue>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_tensor(&self, name: &str) -> Result<TensorValue> {
        let tensors = self.tensors.lock().expect("session state poisoned");
        tensors.get(name).cloned().ok_or_else(|| {
            Status::invalid_argument(format!(
                "the tensor handle {name} refers to an unconfigured resource container"
            ))
        })
    }

    pub fn save_tensor(&self, name: &str, value: TensorValue) {
        let mut tensors = self.tensors.lock().expect("session state poisoned");
        tensors.insert(name.to_string(), value);
    }
}

/// Tensors a step elects to keep, moved into the session state at step end
/// under their fetch names.
#[derive(Debug, Default)]
pub struct TensorStore {
    tensors: Mutex<HashMap<String, TensorValue>>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(&self, name: &str, value: TensorValue) {
        let mut tensors = self.tensors.lock().expect("tensor store poisoned");
        tensors.insert(name.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.lock().expect("tensor store poisoned").is_empty()
    }

    pub fn save_tensors(&self, names: &[String], session_state: &SessionState) -> Result<()> {
        let mut tensors = self.tensors.lock().expect("tensor store poisoned");
        for name in names {
            if let Some(value) = tensors.remove(name) {
                session_state.save_tensor(name, value);
            }
        }
        Ok(())
    }
}

/// State for one step: the rendezvous, per-step scopes, the join
/// notification, and (for partial runs) the pending feed/fetch maps.
///
/// Pending map entries transition `false -> true` exactly once, under the
/// session's executor lock.
pub struct RunState {
    pub step_id: i64,
    pub rendezvous: Arc<Rendezvous>,
    pub tensor_store: Arc<TensorStore>,
    pub step_container: Arc<StepContainer>,
    pub collector: Option<Arc<StepStatsCollector>>,
    /// Lease on the step's collective executor; released with the state.
    pub collective_executor: Option<CollectiveExecutorHandle>,
    pub executors_done: Arc<Notification>,
    pub status: Arc<Mutex<StatusGroup>>,
    pub pending_inputs: Mutex<HashMap<String, bool>>,
    pub pending_outputs: Mutex<HashMap<String, bool>>,
}

impl RunState {
    pub fn new(
        step_id: i64,
        devices: Vec<Arc<dyn Device>>,
        pending_input_names: &[String],
        pending_output_names: &[String],
    ) -> Self {
        let pending_inputs = pending_input_names
            .iter()
            .map(|name| (name.clone(), false))
            .collect();
        let pending_outputs = pending_output_names
            .iter()
            .map(|name| (name.clone(), false))
            .collect();
        Self {
            step_id,
            rendezvous: Arc::new(Rendezvous::new()),
            tensor_store: Arc::new(TensorStore::new()),
            step_container: Arc::new(StepContainer::new(step_id, devices)),
            collector: None,
            collective_executor: None,
            executors_done: Arc::new(Notification::new()),
            status: Arc::new(Mutex::new(StatusGroup::default())),
            pending_inputs: Mutex::new(pending_inputs),
            pending_outputs: Mutex::new(pending_outputs),
        }
    }

    pub fn update_status(&self, result: Result<()>) {
        self.status
            .lock()
            .expect("run state status poisoned")
            .update(result);
    }

    pub fn current_status(&self) -> Result<()> {
        self.status
            .lock()
            .expect("run state status poisoned")
            .current()
    }

    /// True once every pending feed and fetch has been used.
    pub fn pending_done(&self) -> bool {
        let inputs = self.pending_inputs.lock().expect("pending inputs poisoned");
        let outputs = self
            .pending_outputs
            .lock()
            .expect("pending outputs poisoned");
        inputs.values().all(|done| *done) && outputs.values().all(|done| *done)
    }
}

impl Drop for RunState {
    fn drop(&mut self) {
        // Executors borrow the rendezvous through their args; the state may
        // not go away until they have all signalled completion.
        if !self.executors_done.has_been_notified() {
            self.rendezvous
                .start_abort(Status::cancelled("run state cancellation"));
            self.executors_done.wait();
        }
    }
}

/// One partition of a cached request: the executor, its graph, its device.
pub struct PerPartitionExecutorsAndLib {
    pub executor: Arc<Executor>,
    pub graph: Arc<Graph>,
    pub device: Arc<dyn Device>,
}

/// A prepared `(feeds, fetches, targets)` request. Entries are immutable
/// after insertion except for the step counter.
pub struct ExecutorsAndKeys {
    pub step_count: AtomicI64,
    pub items: Vec<PerPartitionExecutorsAndLib>,
    pub input_types: Vec<DType>,
    pub output_types: Vec<DType>,
    pub input_name_to_index: HashMap<String, usize>,
    pub output_name_to_index: HashMap<String, usize>,
    /// Partial runs: per-name rendezvous keys, client device + frame (0,0).
    pub input_name_to_rendezvous_key: HashMap<String, String>,
    pub output_name_to_rendezvous_key: HashMap<String, String>,
    /// Partial runs: the pre-partition client graph and its name table, used
    /// by the fetch reachability check.
    pub client_graph: Option<Arc<Graph>>,
    pub name_to_node: HashMap<String, usize>,
    pub callable_options: CallableOptions,
    pub collective_graph_key: i64,
}

/// Function-library state backing a set of executors. Held separately so a
/// callable can release executors before the library they consult during
/// kernel teardown.
pub struct FunctionInfo {
    pub flib_def: Arc<FunctionLibraryDefinition>,
}

/// Scratch threaded through executor creation.
#[derive(Debug, Clone, Default)]
pub struct RunStateArgs {
    pub debug_options: DebugOptions,
    pub is_partial_run: bool,
    pub handle: String,
    pub collective_graph_key: i64,
}

impl RunStateArgs {
    pub fn new(debug_options: DebugOptions) -> Self {
        Self {
            debug_options,
            ..Default::default()
        }
    }
}
