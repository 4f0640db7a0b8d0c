//! Per-partition executors. Each executor owns one placed device subgraph
//! and runs its kernels in dataflow order; the orchestrator dispatches all
//! partitions of a step in parallel and joins them at the barrier.

pub mod barrier;
pub mod run_handler;
pub mod stats;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::callframe::CallFrame;
use crate::cancellation::CancellationManager;
use crate::collective::CollectiveExecutor;
use crate::config::ExecutorPolicy;
use crate::device::resource::StepContainer;
use crate::device::Device;
use crate::graph::{Graph, Node, NodeDef};
use crate::ops::{Kernel, OpContext};
use crate::rendezvous::{parse_key, Rendezvous};
use crate::session::run_state::{SessionState, TensorStore};
use crate::status::{Result, Status};
use crate::tensor::{Tensor, TensorValue};
use crate::threadpool::{Closure, ComputePool};
use stats::StepStatsCollector;

pub use barrier::{DoneCallback, ExecutorBarrier};

pub type Runner = Arc<dyn Fn(Closure) + Send + Sync>;
pub type CostRunner = Arc<dyn Fn(Closure, i64) + Send + Sync>;

/// Per-step context handed to every executor of the step. The rendezvous is
/// only borrowed: the run state and barrier own the references that keep it
/// alive until the last executor completes.
#[derive(Clone)]
pub struct ExecutorArgs {
    pub step_id: i64,
    pub session_handle: String,
    pub call_frame: Option<Arc<dyn CallFrame>>,
    pub rendezvous: Arc<Rendezvous>,
    pub collective_executor: Option<Arc<CollectiveExecutor>>,
    pub cancellation_manager: Arc<CancellationManager>,
    pub session_state: Arc<SessionState>,
    pub tensor_store: Arc<TensorStore>,
    pub step_container: Arc<StepContainer>,
    pub sync_on_finish: bool,
    pub policy: ExecutorPolicy,
    pub runner: Runner,
    pub cost_runner: CostRunner,
    pub stats_collector: Option<Arc<StepStatsCollector>>,
    pub user_intra_op_pool: Option<Arc<ComputePool>>,
}

/// How the executor materializes kernels; creation consults the device's
/// op-segment so stateful kernels are shared across executors of a session.
pub struct LocalExecutorParams {
    pub device: Arc<dyn Device>,
    pub session_handle: String,
    pub create_kernel: Box<dyn Fn(&NodeDef) -> Result<Arc<dyn Kernel>> + Send + Sync>,
}

enum NodeRole {
    /// Read argument `index` from the call frame.
    Arg(usize),
    /// Write return value `index` to the call frame.
    Retval(usize),
    /// Send input 0 (or an empty tensor for control hops) under a key.
    Send(String),
    /// Receive the node's output under a key.
    Recv(String),
    NoOp,
    Compute(Arc<dyn Kernel>),
}

pub struct Executor {
    device: Arc<dyn Device>,
    graph: Arc<Graph>,
    roles: Vec<NodeRole>,
}

fn node_def_for_kernel(node: &Node) -> NodeDef {
    NodeDef {
        name: node.name.clone(),
        op: node.op.clone(),
        inputs: Vec::new(),
        device: node.assigned_device.clone(),
        attrs: node.attrs.clone(),
    }
}

impl Executor {
    pub fn new(params: LocalExecutorParams, graph: Graph) -> Result<Self> {
        let mut roles = Vec::with_capacity(graph.num_nodes());
        for node in graph.nodes() {
            let role = match node.op.as_str() {
                "_Arg" => NodeRole::Arg(node.attr("index")?.as_i64()? as usize),
                "_Retval" => NodeRole::Retval(node.attr("index")?.as_i64()? as usize),
                "_Send" => NodeRole::Send(node.attr("rendezvous_key")?.as_str()?.to_string()),
                "_Recv" => NodeRole::Recv(node.attr("rendezvous_key")?.as_str()?.to_string()),
                "NoOp" => NodeRole::NoOp,
                op => {
                    if crate::ops::lookup(op).is_none() {
                        return Err(Status::not_found(format!(
                            "op type {op} of node {} is not registered",
                            node.name
                        )));
                    }
                    NodeRole::Compute((params.create_kernel)(&node_def_for_kernel(node))?)
                }
            };
            roles.push(role);
        }
        Ok(Self {
            device: params.device,
            graph: Arc::new(graph),
            roles,
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Dispatch this partition. The completion callback fires exactly once
    /// with the partition's status, from whichever thread ran it.
    pub fn run_async(self: &Arc<Self>, args: ExecutorArgs, done: DoneCallback) {
        let executor = Arc::clone(self);
        let policy = args.policy;
        let runner = Arc::clone(&args.runner);
        let cost_runner = Arc::clone(&args.cost_runner);
        let cost = self.estimated_cost();
        let closure: Closure = Box::new(move || {
            let result = executor.run_sync(&args);
            done(result);
        });
        match policy {
            ExecutorPolicy::CostModel => (*cost_runner)(closure, cost),
            _ => (*runner)(closure),
        }
    }

    fn estimated_cost(&self) -> i64 {
        self.graph.num_nodes() as i64 * 10
    }

    fn run_sync(&self, args: &ExecutorArgs) -> Result<()> {
        let mut pending: Vec<usize> = (0..self.graph.num_nodes())
            .map(|id| self.graph.in_edges(id).count())
            .collect();
        let mut outputs: Vec<Option<TensorValue>> = vec![None; self.graph.num_nodes()];
        // Receives park the worker until a sibling partition (or a partial-
        // run client) sends; they are deferred until nothing else can run so
        // this partition's own sends are never stuck behind them.
        let mut ready: VecDeque<usize> = VecDeque::new();
        let mut recv_ready: VecDeque<usize> = VecDeque::new();
        for (id, count) in pending.iter().enumerate() {
            if *count == 0 {
                match self.roles[id] {
                    NodeRole::Recv(_) => recv_ready.push_back(id),
                    _ => ready.push_back(id),
                }
            }
        }
        let mut processed = 0;

        while let Some(node_id) = ready.pop_front().or_else(|| recv_ready.pop_front()) {
            let node = self.graph.node(node_id);
            let started = Instant::now();
            let output = self.process_node(node, &outputs, args)?;
            if let Some(collector) = &args.stats_collector {
                collector.record(self.device.name(), &node.name, started, Instant::now());
            }
            outputs[node_id] = output;
            processed += 1;
            for edge in self.graph.out_edges(node_id) {
                pending[edge.dst] -= 1;
                if pending[edge.dst] == 0 {
                    match self.roles[edge.dst] {
                        NodeRole::Recv(_) => recv_ready.push_back(edge.dst),
                        _ => ready.push_back(edge.dst),
                    }
                }
            }
        }

        if processed != self.graph.num_nodes() {
            return Err(Status::internal(format!(
                "partition on {} stalled: {processed} of {} nodes ran (cycle?)",
                self.device.name(),
                self.graph.num_nodes()
            )));
        }
        if args.sync_on_finish {
            crate::trace!("sync on finish for device {}", self.device.name());
        }
        Ok(())
    }

    fn gather_inputs(
        &self,
        node: &Node,
        outputs: &[Option<TensorValue>],
    ) -> Result<Vec<TensorValue>> {
        let mut inputs = Vec::new();
        for (src, _slot) in self.graph.data_inputs(node.id) {
            let value = outputs[src].clone().ok_or_else(|| {
                Status::internal(format!(
                    "node {} consumed from {} before it produced a value",
                    node.name,
                    self.graph.node(src).name
                ))
            })?;
            inputs.push(value);
        }
        Ok(inputs)
    }

    fn process_node(
        &self,
        node: &Node,
        outputs: &[Option<TensorValue>],
        args: &ExecutorArgs,
    ) -> Result<Option<TensorValue>> {
        match &self.roles[node.id] {
            NodeRole::Arg(index) => {
                let frame = args.call_frame.as_ref().ok_or_else(|| {
                    Status::internal(format!(
                        "arg node {} executed without a call frame",
                        node.name
                    ))
                })?;
                Ok(Some(frame.get_arg(*index)?))
            }
            NodeRole::Retval(index) => {
                let frame = args.call_frame.as_ref().ok_or_else(|| {
                    Status::internal(format!(
                        "retval node {} executed without a call frame",
                        node.name
                    ))
                })?;
                let mut inputs = self.gather_inputs(node, outputs)?;
                let value = inputs.pop().ok_or_else(|| {
                    Status::internal(format!("retval node {} has no input", node.name))
                })?;
                frame.set_retval(*index, value)?;
                Ok(None)
            }
            NodeRole::Send(key) => {
                let parsed = parse_key(key)?;
                let inputs = self.gather_inputs(node, outputs)?;
                let value = inputs
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| TensorValue::Bool(Tensor::new(Vec::new())));
                args.rendezvous.send(&parsed, value, false)?;
                Ok(None)
            }
            NodeRole::Recv(key) => {
                let parsed = parse_key(key)?;
                let (value, _is_dead) = args.rendezvous.recv(&parsed, None)?;
                Ok(Some(value))
            }
            NodeRole::NoOp => Ok(None),
            NodeRole::Compute(kernel) => {
                let inputs = self.gather_inputs(node, outputs)?;
                let container_name = args.step_container.name();
                let mut ctx = OpContext {
                    node_name: &node.name,
                    inputs: &inputs,
                    device: self.device.as_ref(),
                    cancellation: args.cancellation_manager.as_ref(),
                    step_container: &container_name,
                };
                let value = kernel.run(&mut ctx).map_err(Status::from_opaque)?;
                Ok(Some(value))
            }
        }
    }
}
