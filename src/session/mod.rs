//! The in-process session: graph intake, executor caching, and per-run
//! orchestration across the local device set.

pub mod callable;
pub mod factory;
pub mod group;
pub mod partial;
pub mod run_state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

use crate::callframe::{CallFrame, FunctionCallFrame};
use crate::cancellation::CancellationManager;
use crate::collective::CollectiveExecutorMgr;
use crate::config::{
    CallableOptions, ExecutorPolicy, RunOptions, SessionOptions, TraceLevel,
    NO_COLLECTIVE_GRAPH_KEY,
};
use crate::debug;
use crate::device::{Device, DeviceAttributes, DeviceMgr, DeviceSet};
use crate::executor::run_handler::{self, RunHandler};
use crate::executor::stats::{CostGraphDef, CostModelManager, ProfilerSession, RunMetadata, StepStatsCollector};
use crate::executor::{CostRunner, Executor, ExecutorArgs, ExecutorBarrier, LocalExecutorParams, Runner};
use crate::graph::execution_state::{BuildGraphOptions, GraphExecutionState, GraphExecutionStateOptions};
use crate::graph::{optimizer, partition, FunctionLibraryDefinition, Graph, GraphDef, NodeDef, parse_tensor_name};
use crate::metrics;
use crate::ops;
use crate::rendezvous;
use crate::status::{Result, Status};
use crate::tensor::{DType, ResourceHandle, TensorValue};
use crate::threadpool::{self, Closure, ComputePool, ExternalThreadPools};
use callable::CallableTable;
use run_state::{
    ExecutorsAndKeys, FunctionInfo, PerPartitionExecutorsAndLib, RunState, RunStateArgs,
    SessionState, TENSOR_HANDLE_RESOURCE_CONTAINER,
};

static STEP_ID_COUNTER: AtomicI64 = AtomicI64::new(1);

pub(crate) fn next_step_id() -> i64 {
    STEP_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

struct GraphState {
    execution_state: Option<GraphExecutionState>,
    flib_def: FunctionLibraryDefinition,
    graph_created: bool,
    stateful_placements: HashMap<String, String>,
}

struct ExecutorCache {
    executors: HashMap<String, Arc<ExecutorsAndKeys>>,
    partial_runs: HashMap<String, Arc<RunState>>,
    cost_model_manager: CostModelManager,
}

struct CreatedGraphs {
    partitions: Vec<(String, Graph)>,
    feed_types: Vec<DType>,
    fetch_types: Vec<DType>,
    collective_graph_key: i64,
    /// Partial runs keep a copy of the full graph for the fetch
    /// reachability check, which reasons about the original edges.
    full_graph: Option<Graph>,
    flib_def: Arc<FunctionLibraryDefinition>,
}

/// An in-process session over a fixed local device set.
///
/// Lock order: graph state, executor cache, callables, collective graph key,
/// closed latch, then per-run-state status. No lock is held across executor
/// dispatch or executor builds.
pub struct Session {
    options: SessionOptions,
    device_mgr: Arc<DeviceMgr>,
    devices: Vec<Arc<dyn Device>>,
    device_set: DeviceSet,
    session_handle: String,
    session_state: Arc<SessionState>,
    cancellation_manager: Arc<CancellationManager>,
    thread_pools: Vec<Arc<ComputePool>>,
    graph_state: Mutex<GraphState>,
    executor_cache: Mutex<ExecutorCache>,
    callables: Mutex<CallableTable>,
    collective_graph_key: Mutex<i64>,
    collective_executor_mgr: Mutex<Option<Arc<CollectiveExecutorMgr>>>,
    closed: Mutex<bool>,
    functions: Mutex<Vec<Arc<FunctionInfo>>>,
    operation_timeout_in_ms: i64,
    run_in_caller_thread: bool,
    run_cost_model_executor: bool,
    sync_on_finish: bool,
    init_error: Option<Status>,
    edge_name_counter: AtomicI64,
    visible_cpus: Vec<usize>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_handle", &self.session_handle)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        options: SessionOptions,
        device_mgr: Arc<DeviceMgr>,
        visible_cpus: Vec<usize>,
    ) -> Arc<Self> {
        let mut init_error: Option<Status> = None;
        let mut thread_pools: Vec<Arc<ComputePool>> = Vec::new();
        let mut run_in_caller_thread = false;

        let pool_options = &options.config.session_inter_op_thread_pool;
        if !pool_options.is_empty() {
            for (pool_number, pool_option) in pool_options.iter().enumerate() {
                match threadpool::new_thread_pool_from_pool_options(
                    &options,
                    pool_option,
                    pool_number,
                ) {
                    Ok((pool, _owned)) => thread_pools.push(pool),
                    Err(status) => init_error = init_error.or(Some(status)),
                }
            }
        } else if options.config.use_per_session_threads {
            match threadpool::new_thread_pool_from_session_options(&options, 0) {
                Ok(pool) => thread_pools.push(pool),
                Err(status) => init_error = init_error.or(Some(status)),
            }
        } else {
            match threadpool::global_thread_pool(&options) {
                Ok(pool) => thread_pools.push(pool),
                Err(status) => init_error = init_error.or(Some(status)),
            }
            // Run in the caller thread when both the config and the
            // environment decline inter-op parallelism.
            let env_threads = threadpool::num_inter_op_threads_from_environment();
            if options.config.inter_op_parallelism_threads < 0
                || (options.config.inter_op_parallelism_threads == 0 && env_threads < 0)
            {
                run_in_caller_thread = true;
            }
        }

        let use_cost_model_executor =
            Self::fatal_env_bool("USE_COST_MODEL_EXECUTOR");
        let use_inline_executor = Self::fatal_env_bool("USE_INLINE_EXECUTOR");
        let pin_threadpool_to_cpu_core =
            Self::fatal_env_bool("SET_SESSION_THREAD_POOL_AFFINITY");

        let mut run_cost_model_executor = false;
        match options.config.experimental.executor_policy {
            ExecutorPolicy::CostModel => run_cost_model_executor = true,
            ExecutorPolicy::Inline => run_in_caller_thread = true,
            ExecutorPolicy::Normal => {}
        }
        if use_cost_model_executor {
            run_cost_model_executor = true;
        } else if use_inline_executor {
            run_in_caller_thread = true;
        }

        let sync_on_finish =
            match threadpool::read_bool_from_env_var("TF_SYNC_ON_FINISH", true) {
                Ok(value) => value,
                Err(message) => {
                    crate::error_log!("{message}");
                    true
                }
            };

        let session_handle = format!("direct{:x}", rand::random::<u64>());
        let devices: Vec<Arc<dyn Device>> = device_mgr.list_devices().to_vec();
        if options.config.log_device_placement {
            let mapping = device_mgr.device_mapping_string();
            if mapping.is_empty() {
                crate::log!("Device mapping: no known devices.");
            } else {
                crate::log!("Device mapping:\n{mapping}");
            }
        }
        for device in &devices {
            device.op_segment().add_hold(&session_handle);
        }
        let device_set =
            DeviceSet::new(devices.clone()).expect("session requires at least one device");

        if pin_threadpool_to_cpu_core
            && options.config.use_per_session_threads
            && !visible_cpus.is_empty()
        {
            if thread_pools.len() != 1 {
                crate::critical!(
                    "thread pool count is not 1 with use_per_session_threads"
                );
                panic!("thread pool count is not 1 with use_per_session_threads");
            }
            thread_pools[0].set_affinity(&visible_cpus);
        }

        let operation_timeout_in_ms = options.config.operation_timeout_in_ms;
        Arc::new(Self {
            options,
            device_mgr,
            devices,
            device_set,
            session_handle,
            session_state: Arc::new(SessionState::new()),
            cancellation_manager: Arc::new(CancellationManager::new()),
            thread_pools,
            graph_state: Mutex::new(GraphState {
                execution_state: None,
                flib_def: FunctionLibraryDefinition::default(),
                graph_created: false,
                stateful_placements: HashMap::new(),
            }),
            executor_cache: Mutex::new(ExecutorCache {
                executors: HashMap::new(),
                partial_runs: HashMap::new(),
                cost_model_manager: CostModelManager::new(),
            }),
            callables: Mutex::new(CallableTable::new()),
            collective_graph_key: Mutex::new(NO_COLLECTIVE_GRAPH_KEY),
            collective_executor_mgr: Mutex::new(None),
            closed: Mutex::new(false),
            functions: Mutex::new(Vec::new()),
            operation_timeout_in_ms,
            run_in_caller_thread,
            run_cost_model_executor,
            sync_on_finish,
            init_error,
            edge_name_counter: AtomicI64::new(0),
            visible_cpus,
        })
    }

    fn fatal_env_bool(name: &str) -> bool {
        match threadpool::read_bool_from_env_var(name, false) {
            Ok(value) => value,
            Err(message) => {
                crate::critical!("{message}");
                panic!("{message}");
            }
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn session_handle(&self) -> &str {
        &self.session_handle
    }

    pub fn device_mgr(&self) -> &Arc<DeviceMgr> {
        &self.device_mgr
    }

    /// The CPU slice this session was allotted (session groups on NUMA
    /// hosts partition the visible CPUs across members).
    pub fn visible_cpus(&self) -> &[usize] {
        &self.visible_cpus
    }

    fn check_not_closed(&self) -> Result<()> {
        let closed = self.closed.lock().expect("closed latch poisoned");
        if *closed {
            return Err(Status::cancelled("session has been closed"));
        }
        Ok(())
    }

    fn check_graph_created(&self, operation: &str) -> Result<()> {
        let state = self.graph_state.lock().expect("graph state poisoned");
        if !state.graph_created {
            return Err(Status::failed_precondition(format!(
                "{operation} cannot be called before a graph has been created"
            )));
        }
        Ok(())
    }

    /// Install the initial graph. Valid exactly once per session for a graph
    /// with at least one node.
    pub fn create(&self, graph: GraphDef) -> Result<()> {
        if let Some(status) = &self.init_error {
            return Err(status.clone());
        }
        if graph.node_size() == 0 {
            return Ok(());
        }
        let mut state = self.graph_state.lock().expect("graph state poisoned");
        if state.graph_created {
            return Err(Status::already_exists(
                "a graph has already been created for this session",
            ));
        }
        self.extend_locked(&mut state, graph)
    }

    /// Merge additional nodes and functions into the graph; nodes are only
    /// ever added.
    pub fn extend(&self, graph: GraphDef) -> Result<()> {
        self.check_not_closed()?;
        let mut state = self.graph_state.lock().expect("graph state poisoned");
        self.extend_locked(&mut state, graph)
    }

    fn extend_locked(&self, state: &mut GraphState, graph: GraphDef) -> Result<()> {
        if state.execution_state.is_none() {
            // First intake: the library created here is the authoritative
            // catalog for all subsequent extensions.
            state.flib_def = FunctionLibraryDefinition::new(&graph.library)?;
            let execution_state = GraphExecutionState::make_for_base_graph(
                graph,
                GraphExecutionStateOptions {
                    device_set: self.device_set.clone(),
                    session_handle: self.session_handle.clone(),
                },
            )?;
            state.execution_state = Some(execution_state);
            state.graph_created = true;
        } else {
            state.flib_def.add_library(&graph.library)?;
            let current = state.execution_state.as_ref().expect("state checked above");
            let extended = current.extend(graph)?;
            state.execution_state = Some(extended);
        }
        Ok(())
    }

    /// Execute the graph once with default run options.
    pub fn run(
        &self,
        inputs: &[(String, TensorValue)],
        output_names: &[String],
        target_names: &[String],
        outputs: &mut Vec<TensorValue>,
    ) -> Result<()> {
        let mut run_metadata = RunMetadata::default();
        self.run_with_options(
            &RunOptions::default(),
            inputs,
            output_names,
            target_names,
            outputs,
            &mut run_metadata,
        )
    }

    pub fn run_with_options(
        &self,
        run_options: &RunOptions,
        inputs: &[(String, TensorValue)],
        output_names: &[String],
        target_names: &[String],
        outputs: &mut Vec<TensorValue>,
        run_metadata: &mut RunMetadata,
    ) -> Result<()> {
        self.check_not_closed()?;
        self.check_graph_created("Run()")?;
        metrics::increment_session_runs();

        let input_names: Vec<String> =
            inputs.iter().map(|(name, _)| name.clone()).collect();
        let input_bytes: usize = inputs.iter().map(|(_, value)| value.byte_size()).sum();
        metrics::record_graph_input_tensors(input_bytes);

        let mut run_state_args = RunStateArgs::new(run_options.debug_options.clone());
        run_state_args.collective_graph_key = run_options.collective_graph_key;
        let executors_and_keys = self.get_or_create_executors(
            &input_names,
            output_names,
            target_names,
            &mut run_state_args,
        )?;
        {
            let mut key = self
                .collective_graph_key
                .lock()
                .expect("collective graph key poisoned");
            *key = executors_and_keys.collective_graph_key;
        }

        // The call frame carries feeds in and fetches out of the executors.
        let mut frame = FunctionCallFrame::new(
            executors_and_keys.input_types.clone(),
            executors_and_keys.output_types.clone(),
        );
        let mut feed_args: Vec<Option<TensorValue>> =
            vec![None; executors_and_keys.input_types.len()];
        for (name, value) in inputs {
            let index = *executors_and_keys
                .input_name_to_index
                .get(name)
                .ok_or_else(|| {
                    Status::internal(format!("feed {name} missing from the prepared executors"))
                })?;
            let resolved = if value.dtype() == DType::Resource {
                self.resource_handle_to_input_tensor(value)?
            } else {
                value.clone()
            };
            feed_args[index] = Some(resolved);
        }
        let feed_args: Vec<TensorValue> = feed_args
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                value.ok_or_else(|| {
                    Status::invalid_argument(format!("feed slot {index} was never supplied"))
                })
            })
            .collect::<Result<_>>()?;
        frame.set_args(feed_args).map_err(Status::demote_internal)?;
        let frame = Arc::new(frame);

        let step_id = next_step_id();
        self.run_internal(
            step_id,
            run_options,
            Some(Arc::clone(&frame) as Arc<dyn CallFrame>),
            &executors_and_keys,
            run_metadata,
            &ExternalThreadPools::default(),
        )?;

        let sorted_outputs = frame.consume_retvals().map_err(Status::demote_internal)?;
        outputs.clear();
        let unique_outputs =
            output_names.len() == executors_and_keys.output_name_to_index.len();
        // first_indices[i] = j means j is the first position fetching the
        // same name as position i; duplicates are folded without recompute.
        let mut first_indices: Vec<usize> = Vec::new();
        if !unique_outputs {
            first_indices = (0..output_names.len())
                .map(|i| {
                    (0..=i)
                        .find(|j| output_names[*j] == output_names[i])
                        .expect("index finds itself")
                })
                .collect();
        }
        let mut output_bytes = 0;
        for (i, output_name) in output_names.iter().enumerate() {
            if unique_outputs || first_indices[i] == i {
                let index = *executors_and_keys
                    .output_name_to_index
                    .get(output_name)
                    .ok_or_else(|| {
                        Status::internal(format!(
                            "fetch {output_name} missing from the prepared executors"
                        ))
                    })?;
                outputs.push(sorted_outputs[index].clone());
            } else {
                let prior = outputs[first_indices[i]].clone();
                outputs.push(prior);
            }
            output_bytes += outputs.last().expect("just pushed").byte_size();
        }
        metrics::record_graph_output_tensors(output_bytes);
        Ok(())
    }

    /// Resolve a resource-typed feed through the session tensor store.
    pub(crate) fn resource_handle_to_input_tensor(
        &self,
        value: &TensorValue,
    ) -> Result<TensorValue> {
        let handle: &ResourceHandle = value.as_resource()?;
        if handle.container == TENSOR_HANDLE_RESOURCE_CONTAINER {
            self.session_state.get_tensor(&handle.name)
        } else {
            Err(Status::invalid_argument(format!(
                "invalid resource container {} for handle {}; resource tensors cannot \
                 be fed directly",
                handle.container, handle.name
            )))
        }
    }

    /// Two-phase cache lookup: exact-order key, then the sorted canonical
    /// key. On a miss the lock is dropped while executors are built, and the
    /// loser of a concurrent build discards its work.
    pub(crate) fn get_or_create_executors(
        &self,
        inputs: &[String],
        outputs: &[String],
        targets: &[String],
        run_state_args: &mut RunStateArgs,
    ) -> Result<Arc<ExecutorsAndKeys>> {
        let debug_summary = run_state_args.debug_options.summarize();
        let key = format!(
            "{}->{}/{}/{}/{}",
            inputs.join(","),
            outputs.join(","),
            targets.join(","),
            run_state_args.is_partial_run,
            debug_summary
        );
        let handle_suffix = Uuid::new_v4();
        if run_state_args.is_partial_run {
            run_state_args.handle = format!("{key};{handle_suffix}");
        }
        {
            let cache = self.executor_cache.lock().expect("executor cache poisoned");
            if let Some(entry) = cache.executors.get(&key) {
                return Ok(Arc::clone(entry));
            }
        }

        let mut inputs_sorted: Vec<String> = inputs.to_vec();
        inputs_sorted.sort();
        let mut outputs_sorted: Vec<String> = outputs.to_vec();
        outputs_sorted.sort();
        let mut targets_sorted: Vec<String> = targets.to_vec();
        targets_sorted.sort();
        let sorted_key = format!(
            "{}->{}/{}/{}/{}",
            inputs_sorted.join(","),
            outputs_sorted.join(","),
            targets_sorted.join(","),
            run_state_args.is_partial_run,
            debug_summary
        );
        if run_state_args.is_partial_run {
            run_state_args.handle = format!("{sorted_key};{handle_suffix}");
        }
        {
            let mut cache = self.executor_cache.lock().expect("executor cache poisoned");
            if let Some(entry) = cache.executors.get(&sorted_key).cloned() {
                // Alias the original ordering so the fast path hits next time.
                cache.executors.insert(key, Arc::clone(&entry));
                return Ok(entry);
            }
        }

        // Miss: build outside the lock.
        let callable_options = CallableOptions {
            feed: inputs_sorted,
            fetch: outputs_sorted,
            target: targets_sorted,
            run_options: RunOptions {
                debug_options: run_state_args.debug_options.clone(),
                collective_graph_key: run_state_args.collective_graph_key,
                ..Default::default()
            },
        };
        let (built, function_info) =
            self.create_executors(callable_options, run_state_args)?;

        let mut cache = self.executor_cache.lock().expect("executor cache poisoned");
        let canonical = match cache.executors.get(&sorted_key) {
            // Another thread won the build race; ours is discarded.
            Some(winner) => Arc::clone(winner),
            None => {
                cache
                    .executors
                    .insert(sorted_key.clone(), Arc::clone(&built));
                self.functions
                    .lock()
                    .expect("functions poisoned")
                    .push(function_info);
                built
            }
        };
        cache.executors.insert(key, Arc::clone(&canonical));
        Ok(canonical)
    }

    pub(crate) fn create_executors(
        &self,
        callable_options: CallableOptions,
        run_state_args: &RunStateArgs,
    ) -> Result<(Arc<ExecutorsAndKeys>, Arc<FunctionInfo>)> {
        let build_options = BuildGraphOptions {
            callable_options: callable_options.clone(),
            use_function_convention: !run_state_args.is_partial_run,
            collective_graph_key: run_state_args.collective_graph_key,
        };
        let created = self.create_graphs(&build_options)?;

        let mut items = Vec::with_capacity(created.partitions.len());
        for (partition_name, mut partition_graph) in created.partitions {
            let device = self.device_mgr.lookup(&partition_name)?;
            optimizer::run_post_partitioning(&mut partition_graph, &partition_name)?;
            if !callable_options.run_options.debug_options.is_empty() {
                debug::decorate_and_publish(
                    &callable_options.run_options.debug_options,
                    &mut partition_graph,
                    &partition_name,
                )?;
            }
            partition::ensure_memory_types(&device, &partition_graph)?;
            device.maybe_rewrite_graph(&mut partition_graph)?;

            let session_handle = self.session_handle.clone();
            let segment_device = Arc::clone(&device);
            let create_kernel = Box::new(move |node_def: &NodeDef| {
                let registration = ops::lookup(&node_def.op).ok_or_else(|| {
                    Status::not_found(format!(
                        "op type {} of node {} is not registered",
                        node_def.op, node_def.name
                    ))
                })?;
                if registration.is_stateful {
                    // Stateful kernels are cached in the op-segment so every
                    // executor of this session shares one instance.
                    segment_device.op_segment().find_or_create(
                        &session_handle,
                        &node_def.name,
                        || (registration.factory)(node_def),
                    )
                } else {
                    (registration.factory)(node_def).map_err(Status::from_opaque)
                }
            });
            let executor = Executor::new(
                LocalExecutorParams {
                    device: Arc::clone(&device),
                    session_handle: self.session_handle.clone(),
                    create_kernel,
                },
                partition_graph,
            )?;
            let graph = Arc::clone(executor.graph());
            items.push(PerPartitionExecutorsAndLib {
                executor: Arc::new(executor),
                graph,
                device,
            });
        }

        let mut input_name_to_index = HashMap::new();
        let mut output_name_to_index = HashMap::new();
        let mut input_name_to_rendezvous_key = HashMap::new();
        let mut output_name_to_rendezvous_key = HashMap::new();
        let mut name_to_node = HashMap::new();
        let mut client_graph = None;
        if run_state_args.is_partial_run {
            let client_attrs: DeviceAttributes =
                self.device_set.client_device().attributes().clone();
            for input in &callable_options.feed {
                input_name_to_rendezvous_key.insert(
                    input.clone(),
                    rendezvous::client_key(&client_attrs, input),
                );
            }
            for output in &callable_options.fetch {
                output_name_to_rendezvous_key.insert(
                    output.clone(),
                    rendezvous::client_key(&client_attrs, output),
                );
            }
            let graph = Arc::new(created.full_graph.ok_or_else(|| {
                Status::internal("partial-run build did not produce a full graph copy")
            })?);
            for endpoint in callable_options.feed.iter().chain(&callable_options.fetch) {
                let (node_name, _) = parse_tensor_name(endpoint);
                if let Some(node) = graph.node_by_name(&node_name) {
                    name_to_node.insert(node_name, node.id);
                }
            }
            client_graph = Some(graph);
        } else {
            for (index, input) in callable_options.feed.iter().enumerate() {
                input_name_to_index.insert(input.clone(), index);
            }
            for (index, output) in callable_options.fetch.iter().enumerate() {
                output_name_to_index.insert(output.clone(), index);
            }
        }

        let executors_and_keys = Arc::new(ExecutorsAndKeys {
            step_count: AtomicI64::new(0),
            items,
            input_types: created.feed_types,
            output_types: created.fetch_types,
            input_name_to_index,
            output_name_to_index,
            input_name_to_rendezvous_key,
            output_name_to_rendezvous_key,
            client_graph,
            name_to_node,
            callable_options,
            collective_graph_key: created.collective_graph_key,
        });
        let function_info = Arc::new(FunctionInfo {
            flib_def: created.flib_def,
        });
        Ok((executors_and_keys, function_info))
    }

    /// Build, place, and partition the client graph under the graph-state
    /// lock, remembering stateful placements.
    fn create_graphs(&self, options: &BuildGraphOptions) -> Result<CreatedGraphs> {
        let mut guard = self.graph_state.lock().expect("graph state poisoned");
        let state = &mut *guard;
        let execution_state = state.execution_state.as_ref().ok_or_else(|| {
            Status::failed_precondition("no graph has been created for this session")
        })?;
        let client = execution_state.build_graph(options, &state.stateful_placements)?;

        if client.feed_types.len() != options.callable_options.feed.len() {
            return Err(Status::internal(format!(
                "graph pruning failed: requested number of feed endpoints = {} versus \
                 number of pruned feed endpoints = {}",
                options.callable_options.feed.len(),
                client.feed_types.len()
            )));
        }
        if client.fetch_types.len() != options.callable_options.fetch.len() {
            return Err(Status::internal(format!(
                "graph pruning failed: requested number of fetch endpoints = {} versus \
                 number of pruned fetch endpoints = {}",
                options.callable_options.fetch.len(),
                client.fetch_types.len()
            )));
        }

        // A stateful node that moved since we last saw it is fatal.
        for (node_name, placement) in &client.stateful_placements {
            match state.stateful_placements.get(node_name) {
                Some(existing) if existing != placement => {
                    return Err(Status::internal(format!(
                        "stateful placement mismatch: current assignment of {node_name} \
                         to {existing} does not match {placement}"
                    )));
                }
                Some(_) => {}
                None => {
                    state
                        .stateful_placements
                        .insert(node_name.clone(), placement.clone());
                }
            }
        }

        let mut new_name = |prefix: &str| {
            format!(
                "{prefix}/_{}",
                self.edge_name_counter.fetch_add(1, Ordering::Relaxed)
            )
        };
        let partition_defs = partition::partition(
            &client.graph,
            &mut partition::PartitionOptions {
                device_set: &self.device_set,
                new_name: &mut new_name,
            },
        )?;
        let mut partitions = Vec::with_capacity(partition_defs.len());
        for (partition_name, def) in partition_defs {
            crate::trace!(
                "created partition with {} nodes for {partition_name}",
                def.node_size()
            );
            partitions.push((partition_name, Graph::from_graph_def(&def, true)?));
        }
        partitions.sort_by(|a, b| a.0.cmp(&b.0));

        let full_graph = if options.use_function_convention {
            None
        } else {
            Some(execution_state.full_graph()?)
        };
        Ok(CreatedGraphs {
            partitions,
            feed_types: client.feed_types,
            fetch_types: client.fetch_types,
            collective_graph_key: client.collective_graph_key,
            full_graph,
            flib_def: Arc::new(state.flib_def.clone()),
        })
    }

    fn should_use_run_handler_pool(&self, run_options: &RunOptions) -> bool {
        if self.options.config.use_per_session_threads {
            return false;
        }
        if !self.options.config.session_inter_op_thread_pool.is_empty()
            && run_options.inter_op_thread_pool > 0
        {
            return false;
        }
        true
    }

    /// Dispatch all partitions of a step and join them. Every early return
    /// before dispatch notifies the done condition so the run state can be
    /// torn down without blocking.
    pub(crate) fn run_internal(
        &self,
        step_id: i64,
        run_options: &RunOptions,
        call_frame: Option<Arc<dyn CallFrame>>,
        executors_and_keys: &Arc<ExecutorsAndKeys>,
        run_metadata: &mut RunMetadata,
        external_pools: &ExternalThreadPools,
    ) -> Result<()> {
        let start = Instant::now();
        let executor_step_count = executors_and_keys
            .step_count
            .fetch_add(1, Ordering::Relaxed);
        let mut run_state = RunState::new(step_id, self.devices.clone(), &[], &[]);
        crate::trace!(
            "session run #id={step_id}# dispatching {} partitions",
            executors_and_keys.items.len()
        );

        if !run_options.debug_options.is_empty() {
            let published = debug::create_debugger_state(&run_options.debug_options)
                .and_then(|debugger| {
                    debugger.publish_debug_metadata(
                        run_options.debug_options.global_step,
                        step_id,
                        executor_step_count,
                        &executors_and_keys.callable_options.feed,
                        &executors_and_keys.callable_options.fetch,
                        &executors_and_keys.callable_options.target,
                    )
                });
            if let Err(status) = published {
                run_state.executors_done.notify();
                return Err(status);
            }
        }

        // Collectives: the per-run key, if supplied, must agree with the key
        // the optimized graph produced. The run state leases the step's
        // executor and releases it on teardown.
        if executors_and_keys.collective_graph_key != NO_COLLECTIVE_GRAPH_KEY {
            if run_options.collective_graph_key != NO_COLLECTIVE_GRAPH_KEY
                && run_options.collective_graph_key != executors_and_keys.collective_graph_key
            {
                run_state.executors_done.notify();
                return Err(Status::internal(format!(
                    "collective_graph_key in run options {} should match \
                     collective_graph_key from optimized graph {}",
                    run_options.collective_graph_key,
                    executors_and_keys.collective_graph_key
                )));
            }
            let mgr = {
                let mut guard = self
                    .collective_executor_mgr
                    .lock()
                    .expect("collective mgr poisoned");
                Arc::clone(
                    guard.get_or_insert_with(|| Arc::new(CollectiveExecutorMgr::new())),
                )
            };
            run_state.collective_executor = Some(mgr.acquire(step_id));
        }

        let policy = if self.run_in_caller_thread {
            ExecutorPolicy::Inline
        } else if self.run_cost_model_executor {
            ExecutorPolicy::CostModel
        } else {
            ExecutorPolicy::Normal
        };

        let do_trace = run_options.trace_level > TraceLevel::NoTrace;
        let mut update_cost_model = false;
        let build_cost_model = self.options.config.graph_options.build_cost_model;
        if build_cost_model > 0 {
            let after = self.options.config.graph_options.build_cost_model_after;
            let measure_step_count = executor_step_count - after;
            if measure_step_count >= 0 {
                update_cost_model = (measure_step_count + 1) % build_cost_model == 0;
            }
        }
        if do_trace || update_cost_model || run_options.report_tensor_allocations_upon_oom
        {
            run_state.collector = Some(Arc::new(StepStatsCollector::new()));
        }
        let profiler = if run_options.trace_level >= TraceLevel::HardwareTrace {
            Some(ProfilerSession::create())
        } else {
            None
        };

        if run_options.inter_op_thread_pool < -1
            || run_options.inter_op_thread_pool >= self.thread_pools.len() as i32
        {
            run_state.executors_done.notify();
            return Err(Status::invalid_argument(format!(
                "invalid inter_op_thread_pool: {}",
                run_options.inter_op_thread_pool
            )));
        }

        // Register the step so Close() cancels it.
        let step_cancellation = Arc::new(CancellationManager::new());
        let cancellation_token = self.cancellation_manager.get_cancellation_token();
        let registered = {
            let step_cancellation = Arc::clone(&step_cancellation);
            self.cancellation_manager.register_callback(
                cancellation_token,
                Box::new(move || step_cancellation.start_cancel()),
            )
        };
        if !registered {
            run_state.executors_done.notify();
            return Err(Status::cancelled("run call was cancelled"));
        }

        // Inter-op pool: external > selected session pool > pool 0; nil pool
        // runs inline, which is only allowed for single-partition requests.
        let mut pool: Option<Arc<ComputePool>> = if self.run_in_caller_thread {
            None
        } else if let Some(external) = &external_pools.inter_op {
            Some(Arc::clone(external))
        } else {
            let index = if run_options.inter_op_thread_pool >= 0 {
                run_options.inter_op_thread_pool as usize
            } else {
                0
            };
            Some(Arc::clone(&self.thread_pools[index]))
        };
        if pool.is_none() && executors_and_keys.items.len() > 1 {
            pool = Some(Arc::clone(&self.thread_pools[0]));
        }
        if pool.is_none() {
            crate::trace!("executing session run synchronously");
        }

        let handler: Option<Arc<RunHandler>> = if self
            .should_use_run_handler_pool(run_options)
            && run_options.use_run_handler_pool
        {
            match run_handler::get_or_create_run_handler_pool(&self.options) {
                Ok(handler_pool) => Some(Arc::new(handler_pool.get(step_id))),
                Err(status) => {
                    self.cancellation_manager
                        .deregister_callback(cancellation_token);
                    run_state.executors_done.notify();
                    return Err(status);
                }
            }
        } else {
            None
        };

        let (default_runner, default_cost_runner): (Runner, CostRunner) =
            match (&pool, &handler) {
                (None, _) => (
                    Arc::new(|closure: Closure| closure()),
                    Arc::new(|closure: Closure, _cost: i64| closure()),
                ),
                (Some(_), Some(handler)) => {
                    let inter = Arc::clone(handler);
                    let cost = Arc::clone(handler);
                    (
                        Arc::new(move |closure| inter.schedule_inter_op_closure(closure)),
                        Arc::new(move |closure, _cost| {
                            cost.schedule_inter_op_closure(closure)
                        }),
                    )
                }
                (Some(pool), None) => {
                    let inter = Arc::clone(pool);
                    let cost = Arc::clone(pool);
                    (
                        Arc::new(move |closure| inter.schedule_boxed(closure)),
                        Arc::new(move |closure, _cost| cost.schedule_boxed(closure)),
                    )
                }
            };

        let barrier = {
            let status = Arc::clone(&run_state.status);
            let executors_done = Arc::clone(&run_state.executors_done);
            ExecutorBarrier::new(
                executors_and_keys.items.len(),
                Arc::clone(&run_state.rendezvous),
                move |aggregate| {
                    status
                        .lock()
                        .expect("run state status poisoned")
                        .update(aggregate);
                    executors_done.notify();
                },
            )
        };

        let base_args = ExecutorArgs {
            step_id,
            session_handle: self.session_handle.clone(),
            call_frame,
            rendezvous: Arc::clone(&run_state.rendezvous),
            collective_executor: run_state
                .collective_executor
                .as_ref()
                .map(|handle| Arc::clone(handle.get())),
            cancellation_manager: Arc::clone(&step_cancellation),
            session_state: Arc::clone(&self.session_state),
            tensor_store: Arc::clone(&run_state.tensor_store),
            step_container: Arc::clone(&run_state.step_container),
            sync_on_finish: self.sync_on_finish,
            policy,
            runner: default_runner,
            cost_runner: default_cost_runner,
            stats_collector: run_state.collector.clone(),
            user_intra_op_pool: external_pools.intra_op.clone(),
        };

        for item in &executors_and_keys.items {
            let mut args = base_args.clone();
            if let Some(device_pool) = item.device.device_thread_pool() {
                let inter = Arc::clone(&device_pool);
                let cost = device_pool;
                args.runner = Arc::new(move |closure| inter.schedule_boxed(closure));
                args.cost_runner =
                    Arc::new(move |closure, _cost| cost.schedule_boxed(closure));
            }
            if let Some(handler) = &handler {
                args.user_intra_op_pool = Some(handler.as_intra_thread_pool());
            }
            item.executor.run_async(args, barrier.get());
        }

        let timeout_in_ms = if run_options.timeout_in_ms > 0 {
            run_options.timeout_in_ms
        } else {
            self.operation_timeout_in_ms
        };
        wait_for_notification(&run_state, &step_cancellation, timeout_in_ms);

        if !self
            .cancellation_manager
            .deregister_callback(cancellation_token)
        {
            // The step was cancelled while we were waiting.
            run_state.update_status(Err(Status::cancelled("run call was cancelled")));
        }

        if let Some(profiler) = &profiler {
            profiler.collect_data(run_metadata)?;
        }
        run_state.current_status()?;

        if !run_state.tensor_store.is_empty() {
            run_state
                .tensor_store
                .save_tensors(&executors_and_keys.callable_options.fetch, &self.session_state)?;
        }

        if let Some(collector) = &run_state.collector {
            let step_stats = collector.finalize();
            if update_cost_model {
                let cache = self.executor_cache.lock().expect("executor cache poisoned");
                cache.cost_model_manager.merge_stats(&step_stats);
                let mut cost_graph = CostGraphDef::default();
                for item in &executors_and_keys.items {
                    cache.cost_model_manager.add_to_cost_graph(
                        &item.graph,
                        item.device.name(),
                        &mut cost_graph,
                    )?;
                }
                run_metadata.cost_graph = Some(cost_graph);
            }
            run_metadata.step_stats = Some(step_stats);
        }

        if run_options.output_partition_graphs {
            run_metadata.partition_graphs = executors_and_keys
                .items
                .iter()
                .map(|item| item.graph.to_graph_def())
                .collect();
        }
        metrics::update_graph_exec_time(start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Enumerate local device attributes.
    pub fn list_devices(&self) -> Vec<DeviceAttributes> {
        self.devices
            .iter()
            .map(|device| device.attributes().clone())
            .collect()
    }

    /// Clear the named resource containers on every device.
    pub fn reset(&self, containers: &[String]) -> Result<()> {
        self.device_mgr.clear_containers(containers);
        Ok(())
    }

    /// Cancel in-flight steps and latch the session closed. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.cancellation_manager.start_cancel();
        {
            let mut closed = self.closed.lock().expect("closed latch poisoned");
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        factory::global().deregister(self);
        Ok(())
    }

    pub(crate) fn operation_timeout_in_ms(&self) -> i64 {
        self.operation_timeout_in_ms
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
        {
            let mut cache = self.executor_cache.lock().expect("executor cache poisoned");
            // Dropping a partial-run state aborts its rendezvous and waits
            // for the executors to drain.
            cache.partial_runs.clear();
            cache.executors.clear();
        }
        self.callables.lock().expect("callables poisoned").clear();
        for device in &self.devices {
            device.op_segment().remove_hold(&self.session_handle);
        }
    }
}

/// Wait for the step's executors with an optional timeout; on expiry record
/// *deadline-exceeded*, cancel the step, and wait again for the drain.
fn wait_for_notification(
    run_state: &RunState,
    cancellation: &CancellationManager,
    timeout_in_ms: i64,
) {
    if timeout_in_ms > 0 {
        let notified = run_state
            .executors_done
            .wait_for(std::time::Duration::from_millis(timeout_in_ms as u64));
        if !notified {
            run_state.update_status(Err(Status::deadline_exceeded(
                "timed out waiting for notification",
            )));
            cancellation.start_cancel();
            // Executors borrowed per-step state; the drain must finish
            // before the step can be cleaned up.
            run_state.executors_done.wait();
        }
    } else {
        run_state.executors_done.wait();
    }
}
