//! Authoritative graph state: holds the merged full graph, extends it with
//! new nodes, and builds pruned + placed client graphs for specific
//! feed/fetch/target requests.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::collective;
use crate::config::CallableOptions;
use crate::device::DeviceSet;
use crate::graph::{
    parse_tensor_name, AttrValue, Graph, GraphDef, NodeDef, CONTROL_SLOT,
};
use crate::ops;
use crate::rendezvous;
use crate::status::{Result, Status};
use crate::tensor::DType;

pub struct GraphExecutionStateOptions {
    pub device_set: DeviceSet,
    pub session_handle: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildGraphOptions {
    pub callable_options: CallableOptions,
    /// `Run` binds feeds/fetches to call-frame slots; partial runs use the
    /// rendezvous calling convention instead.
    pub use_function_convention: bool,
    pub collective_graph_key: i64,
}

/// A pruned, placed graph ready to be partitioned, with the dtype vectors
/// and collective key the cached executors carry.
pub struct ClientGraph {
    pub graph: Graph,
    pub feed_types: Vec<DType>,
    pub fetch_types: Vec<DType>,
    pub collective_graph_key: i64,
    /// Device assignments of stateful nodes in this client graph.
    pub stateful_placements: HashMap<String, String>,
}

pub struct GraphExecutionState {
    graph_def: GraphDef,
    device_set: DeviceSet,
    session_handle: String,
}

fn sanitize(name: &str) -> String {
    name.replace([':', '/'], "_")
}

fn def_output_dtype(def: &NodeDef) -> DType {
    for key in ["dtype", "T"] {
        if let Some(AttrValue::Type(dtype)) = def.attrs.get(key) {
            return *dtype;
        }
    }
    DType::F32
}

impl GraphExecutionState {
    pub fn make_for_base_graph(
        graph: GraphDef,
        options: GraphExecutionStateOptions,
    ) -> Result<Self> {
        // Validate node uniqueness and input resolution up front.
        Graph::from_graph_def(&graph, false)?;
        Ok(Self {
            graph_def: graph,
            device_set: options.device_set,
            session_handle: options.session_handle,
        })
    }

    /// Produce a new state whose graph is this one plus the extension.
    /// Nodes are only ever added.
    pub fn extend(&self, extension: GraphDef) -> Result<Self> {
        let existing: HashSet<&str> = self
            .graph_def
            .nodes
            .iter()
            .map(|node| node.name.as_str())
            .collect();
        for node in &extension.nodes {
            if existing.contains(node.name.as_str()) {
                return Err(Status::invalid_argument(format!(
                    "graph extension includes node {}, which was created by a previous call",
                    node.name
                )));
            }
        }
        let mut merged = self.graph_def.clone();
        merged.nodes.extend(extension.nodes);
        merged.version = merged.version.max(extension.version);
        Graph::from_graph_def(&merged, false)?;
        Ok(Self {
            graph_def: merged,
            device_set: self.device_set.clone(),
            session_handle: self.session_handle.clone(),
        })
    }

    pub fn graph_def(&self) -> &GraphDef {
        &self.graph_def
    }

    pub fn full_graph(&self) -> Result<Graph> {
        Graph::from_graph_def(&self.graph_def, false)
    }

    pub fn session_handle(&self) -> &str {
        &self.session_handle
    }

    /// Prune the full graph to the request's feeds/fetches/targets, rewrite
    /// the endpoints for the chosen calling convention, and place every
    /// surviving node. `stateful_placements` carries assignments remembered
    /// from earlier builds; they win over requested devices.
    pub fn build_graph(
        &self,
        options: &BuildGraphOptions,
        stateful_placements: &HashMap<String, String>,
    ) -> Result<ClientGraph> {
        let feeds = &options.callable_options.feed;
        let fetches = &options.callable_options.fetch;
        let targets = &options.callable_options.target;
        if fetches.is_empty() && targets.is_empty() {
            return Err(Status::invalid_argument(
                "must specify at least one target to fetch or execute",
            ));
        }

        let mut def = self.graph_def.clone();
        let name_set: HashSet<String> =
            def.nodes.iter().map(|node| node.name.clone()).collect();
        let dtype_by_name: HashMap<String, DType> = def
            .nodes
            .iter()
            .map(|node| (node.name.clone(), def_output_dtype(node)))
            .collect();
        let client_attrs = self.device_set.client_device().attributes().clone();

        // Feed rewrite: each fed endpoint becomes an `_Arg` (function
        // convention) or a client-keyed `_Recv` (partial run), and every
        // consumer is redirected to it.
        let mut feed_types = Vec::with_capacity(feeds.len());
        let mut feed_replacement: HashMap<(String, i32), String> = HashMap::new();
        let mut feed_node_names: HashSet<String> = HashSet::new();
        for (index, feed) in feeds.iter().enumerate() {
            let (node_name, slot) = parse_tensor_name(feed);
            if !name_set.contains(&node_name) {
                return Err(Status::not_found(format!("feed {feed}: not found")));
            }
            if feed_replacement.contains_key(&(node_name.clone(), slot)) {
                return Err(Status::invalid_argument(format!(
                    "endpoint {feed} is fed more than once"
                )));
            }
            let dtype = dtype_by_name[&node_name];
            feed_types.push(dtype);
            let feed_node_name = if options.use_function_convention {
                format!("_arg_{}_{}_{}", sanitize(&node_name), slot, index)
            } else {
                format!("_recv_{}_{}_{}", sanitize(&node_name), slot, index)
            };
            let mut feed_node =
                NodeDef::new(&feed_node_name, if options.use_function_convention {
                    "_Arg"
                } else {
                    "_Recv"
                })
                .with_device(client_attrs.name.clone())
                .with_attr("dtype", AttrValue::Type(dtype));
            if options.use_function_convention {
                feed_node = feed_node.with_attr("index", AttrValue::I(index as i64));
            } else {
                feed_node = feed_node
                    .with_attr("tensor_name", AttrValue::S(feed.clone()))
                    .with_attr(
                        "rendezvous_key",
                        AttrValue::S(rendezvous::client_key(&client_attrs, feed)),
                    );
            }
            def.nodes.push(feed_node);
            feed_replacement.insert((node_name, slot), feed_node_name.clone());
            feed_node_names.insert(feed_node_name);
        }

        // Redirect consumers of fed endpoints (data and control alike).
        for node in def.nodes.iter_mut() {
            if feed_node_names.contains(&node.name) {
                continue;
            }
            for input in node.inputs.iter_mut() {
                let (src, slot) = parse_tensor_name(input);
                if slot == CONTROL_SLOT {
                    if let Some(replacement) = feed_replacement.get(&(src.clone(), 0)) {
                        *input = format!("^{replacement}");
                    }
                } else if let Some(replacement) = feed_replacement.get(&(src, slot)) {
                    *input = replacement.clone();
                }
            }
        }

        // Fetch rewrite: `_Retval` slots or client-keyed `_Send` nodes.
        let mut fetch_types = Vec::with_capacity(fetches.len());
        let mut root_names: Vec<String> = Vec::new();
        for (index, fetch) in fetches.iter().enumerate() {
            let (node_name, slot) = parse_tensor_name(fetch);
            if !name_set.contains(&node_name) {
                return Err(Status::not_found(format!("fetch {fetch}: not found")));
            }
            let dtype = dtype_by_name[&node_name];
            fetch_types.push(dtype);
            let input_spec = match feed_replacement.get(&(node_name.clone(), slot)) {
                Some(replacement) => replacement.clone(),
                None if slot == 0 => node_name.clone(),
                None => format!("{node_name}:{slot}"),
            };
            let fetch_node_name = if options.use_function_convention {
                format!("_retval_{}_{}_{}", sanitize(&node_name), slot, index)
            } else {
                format!("_send_{}_{}_{}", sanitize(&node_name), slot, index)
            };
            let mut fetch_node =
                NodeDef::new(&fetch_node_name, if options.use_function_convention {
                    "_Retval"
                } else {
                    "_Send"
                })
                .with_inputs(vec![input_spec])
                .with_device(client_attrs.name.clone())
                .with_attr("dtype", AttrValue::Type(dtype));
            if options.use_function_convention {
                fetch_node = fetch_node.with_attr("index", AttrValue::I(index as i64));
            } else {
                fetch_node = fetch_node
                    .with_attr("tensor_name", AttrValue::S(fetch.clone()))
                    .with_attr(
                        "rendezvous_key",
                        AttrValue::S(rendezvous::client_key(&client_attrs, fetch)),
                    );
            }
            def.nodes.push(fetch_node);
            root_names.push(fetch_node_name);
        }

        for target in targets {
            let (node_name, _) = parse_tensor_name(target);
            if !name_set.contains(&node_name) {
                return Err(Status::not_found(format!(
                    "target node {target}: not found"
                )));
            }
            root_names.push(node_name);
        }

        let pruned = prune_reachable(&def, &root_names)?;

        let kept_feeds = pruned
            .nodes
            .iter()
            .filter(|node| feed_node_names.contains(&node.name))
            .count();
        if kept_feeds != feeds.len() {
            return Err(Status::internal(format!(
                "graph pruning failed: requested number of feed endpoints = {} versus \
                 number of pruned feed endpoints = {kept_feeds}",
                feeds.len()
            )));
        }

        let (placed, current_stateful) =
            self.place(pruned, stateful_placements)?;

        let mut collective_nodes: Vec<String> = placed
            .nodes()
            .iter()
            .filter(|node| ops::is_collective(&node.op))
            .map(|node| node.name.clone())
            .collect();
        let mut collective_graph_key = collective::graph_key_for(&mut collective_nodes);
        if !collective_nodes.is_empty()
            && options.collective_graph_key != crate::config::NO_COLLECTIVE_GRAPH_KEY
        {
            collective_graph_key = options.collective_graph_key;
        }

        Ok(ClientGraph {
            graph: placed,
            feed_types,
            fetch_types,
            collective_graph_key,
            stateful_placements: current_stateful,
        })
    }

    /// Assign every node a device: remembered stateful placement first, then
    /// the requested device, then the client device.
    fn place(
        &self,
        mut def: GraphDef,
        stateful_placements: &HashMap<String, String>,
    ) -> Result<(Graph, HashMap<String, String>)> {
        let mut current_stateful = HashMap::new();
        for node in def.nodes.iter_mut() {
            let assigned = if let Some(placement) = stateful_placements
                .get(&node.name)
                .filter(|_| ops::is_stateful(&node.op))
            {
                placement.clone()
            } else if !node.device.is_empty() {
                match self.device_set.find(&node.device) {
                    Some(device) => device.name().to_string(),
                    None => {
                        return Err(Status::invalid_argument(format!(
                            "node {} requests device {}, which doesn't exist in the list \
                             of available devices",
                            node.name, node.device
                        )))
                    }
                }
            } else {
                self.device_set.client_device().name().to_string()
            };
            if ops::is_stateful(&node.op) {
                current_stateful.insert(node.name.clone(), assigned.clone());
            }
            node.device = assigned;
        }
        let graph = Graph::from_graph_def(&def, true)?;
        Ok((graph, current_stateful))
    }
}

/// Keep only nodes backward-reachable from the given roots.
fn prune_reachable(def: &GraphDef, roots: &[String]) -> Result<GraphDef> {
    let index: HashMap<&str, usize> = def
        .nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.name.as_str(), idx))
        .collect();
    let mut keep: HashSet<usize> = HashSet::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    for root in roots {
        let idx = *index.get(root.as_str()).ok_or_else(|| {
            Status::internal(format!("pruning root {root} missing from graph"))
        })?;
        if keep.insert(idx) {
            queue.push_back(idx);
        }
    }
    while let Some(idx) = queue.pop_front() {
        for input in &def.nodes[idx].inputs {
            let (src, _) = parse_tensor_name(input);
            let src_idx = *index.get(src.as_str()).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "node {} references unknown input {input}",
                    def.nodes[idx].name
                ))
            })?;
            if keep.insert(src_idx) {
                queue.push_back(src_idx);
            }
        }
    }
    let nodes = def
        .nodes
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep.contains(idx))
        .map(|(_, node)| node.clone())
        .collect();
    Ok(GraphDef {
        nodes,
        library: def.library.clone(),
        version: def.version,
    })
}
