//! Graph data model: the serialized `GraphDef`/`NodeDef` form exchanged with
//! clients, and the in-memory `Graph` the engine places, partitions, and
//! executes.

pub mod execution_state;
pub mod optimizer;
pub mod partition;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::status::{Result, Status};
use crate::tensor::DType;

pub const CONTROL_SLOT: i32 = -1;

pub type AttrMap = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    I(i64),
    F(f64),
    B(bool),
    S(String),
    Type(DType),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Bools(Vec<bool>),
}

impl AttrValue {
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            AttrValue::I(value) => Ok(*value),
            other => Err(Status::invalid_argument(format!(
                "expected integer attr, got {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            AttrValue::S(value) => Ok(value),
            other => Err(Status::invalid_argument(format!(
                "expected string attr, got {other:?}"
            ))),
        }
    }

    pub fn as_type(&self) -> Result<DType> {
        match self {
            AttrValue::Type(value) => Ok(*value),
            other => Err(Status::invalid_argument(format!(
                "expected type attr, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    /// Data inputs as `"node"` / `"node:slot"`, control inputs as `"^node"`.
    pub inputs: Vec<String>,
    /// Requested device; may be a suffix of a full device name.
    pub device: String,
    pub attrs: AttrMap,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionLibraryDef {
    pub functions: Vec<FunctionDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub nodes: Vec<NodeDef>,
    pub library: FunctionLibraryDef,
    pub version: i32,
}

impl GraphDef {
    pub fn node_size(&self) -> usize {
        self.nodes.len()
    }
}

/// The monotonically growing catalog of functions known to a session.
#[derive(Debug, Clone, Default)]
pub struct FunctionLibraryDefinition {
    functions: HashMap<String, FunctionDef>,
}

impl FunctionLibraryDefinition {
    pub fn new(library: &FunctionLibraryDef) -> Result<Self> {
        let mut def = Self::default();
        def.add_library(library)?;
        Ok(def)
    }

    pub fn add_library(&mut self, library: &FunctionLibraryDef) -> Result<()> {
        for function in &library.functions {
            match self.functions.get(&function.name) {
                Some(existing) if existing != function => {
                    return Err(Status::invalid_argument(format!(
                        "Cannot add function '{}': a different function with the same name \
                         already exists",
                        function.name
                    )));
                }
                Some(_) => {}
                None => {
                    self.functions.insert(function.name.clone(), function.clone());
                }
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// `"x"` -> `("x", 0)`, `"x:2"` -> `("x", 2)`, `"^x"` -> `("x", CONTROL_SLOT)`.
pub fn parse_tensor_name(name: &str) -> (String, i32) {
    if let Some(stripped) = name.strip_prefix('^') {
        return (stripped.to_string(), CONTROL_SLOT);
    }
    match name.rsplit_once(':') {
        Some((node, slot)) => match slot.parse::<i32>() {
            Ok(slot) if slot >= 0 => (node.to_string(), slot),
            _ => (name.to_string(), 0),
        },
        None => (name.to_string(), 0),
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: usize,
    pub name: String,
    pub op: String,
    pub requested_device: String,
    pub assigned_device: String,
    pub attrs: AttrMap,
}

impl Node {
    pub fn attr(&self, key: &str) -> Result<&AttrValue> {
        self.attrs.get(key).ok_or_else(|| {
            Status::invalid_argument(format!("node {} is missing attr {key}", self.name))
        })
    }

    /// Declared output dtype, where the node carries one.
    pub fn output_dtype(&self) -> Option<DType> {
        for key in ["dtype", "T"] {
            if let Some(AttrValue::Type(dtype)) = self.attrs.get(key) {
                return Some(*dtype);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub src: usize,
    /// `CONTROL_SLOT` for control edges.
    pub src_output: i32,
    pub dst: usize,
    /// Position among the destination's data inputs; `CONTROL_SLOT` for control.
    pub dst_input: i32,
}

impl Edge {
    pub fn is_control(&self) -> bool {
        self.src_output == CONTROL_SLOT
    }
}

/// In-memory graph with name and adjacency indexes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    name_index: HashMap<String, usize>,
    in_edges: Vec<Vec<usize>>,
    out_edges: Vec<Vec<usize>>,
    pub version: i32,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `GraphDef`. With `expect_device_spec` the def's device
    /// strings are treated as assigned placements (partition graphs).
    pub fn from_graph_def(def: &GraphDef, expect_device_spec: bool) -> Result<Self> {
        let mut graph = Graph {
            version: def.version,
            ..Default::default()
        };
        for node_def in &def.nodes {
            graph.add_node(node_def, expect_device_spec)?;
        }
        for node_def in &def.nodes {
            let dst = graph.name_index[&node_def.name];
            graph.connect_inputs(dst, node_def)?;
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, def: &NodeDef, expect_device_spec: bool) -> Result<usize> {
        if self.name_index.contains_key(&def.name) {
            return Err(Status::invalid_argument(format!(
                "node name {} is not unique",
                def.name
            )));
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            name: def.name.clone(),
            op: def.op.clone(),
            requested_device: if expect_device_spec {
                String::new()
            } else {
                def.device.clone()
            },
            assigned_device: if expect_device_spec {
                def.device.clone()
            } else {
                String::new()
            },
            attrs: def.attrs.clone(),
        });
        self.name_index.insert(def.name.clone(), id);
        self.in_edges.push(Vec::new());
        self.out_edges.push(Vec::new());
        Ok(id)
    }

    pub fn connect_inputs(&mut self, dst: usize, def: &NodeDef) -> Result<()> {
        let mut data_input = 0;
        for input in &def.inputs {
            let (src_name, slot) = parse_tensor_name(input);
            let src = *self.name_index.get(&src_name).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "node {} references unknown input {}",
                    def.name, input
                ))
            })?;
            let dst_input = if slot == CONTROL_SLOT {
                CONTROL_SLOT
            } else {
                let current = data_input;
                data_input += 1;
                current
            };
            self.add_edge(Edge {
                src,
                src_output: slot,
                dst,
                dst_input,
            });
        }
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) {
        let id = self.edges.len();
        self.in_edges[edge.dst].push(id);
        self.out_edges[edge.src].push(id);
        self.edges.push(edge);
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: usize) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.name_index.get(name).map(|id| &self.nodes[*id])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: usize) -> &Edge {
        &self.edges[id]
    }

    pub fn in_edges(&self, node: usize) -> impl Iterator<Item = &Edge> {
        self.in_edges[node].iter().map(|id| &self.edges[*id])
    }

    pub fn out_edges(&self, node: usize) -> impl Iterator<Item = &Edge> {
        self.out_edges[node].iter().map(|id| &self.edges[*id])
    }

    /// Data inputs of a node ordered by input position.
    pub fn data_inputs(&self, node: usize) -> Vec<(usize, i32)> {
        let mut inputs: Vec<&Edge> = self
            .in_edges(node)
            .filter(|edge| !edge.is_control())
            .collect();
        inputs.sort_by_key(|edge| edge.dst_input);
        inputs
            .iter()
            .map(|edge| (edge.src, edge.src_output))
            .collect()
    }

    pub fn to_graph_def(&self) -> GraphDef {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut inputs: Vec<(i32, String)> = Vec::new();
            for edge in self.in_edges(node.id) {
                let src_name = &self.nodes[edge.src].name;
                let spec = if edge.is_control() {
                    format!("^{src_name}")
                } else if edge.src_output == 0 {
                    src_name.clone()
                } else {
                    format!("{src_name}:{}", edge.src_output)
                };
                let order = if edge.is_control() {
                    i32::MAX
                } else {
                    edge.dst_input
                };
                inputs.push((order, spec));
            }
            inputs.sort();
            nodes.push(NodeDef {
                name: node.name.clone(),
                op: node.op.clone(),
                inputs: inputs.into_iter().map(|(_, spec)| spec).collect(),
                device: if node.assigned_device.is_empty() {
                    node.requested_device.clone()
                } else {
                    node.assigned_device.clone()
                },
                attrs: node.attrs.clone(),
            });
        }
        GraphDef {
            nodes,
            library: FunctionLibraryDef::default(),
            version: self.version,
        }
    }
}

pub fn describe_node(node: &Node) -> String {
    format!("{}({}) on {}", node.name, node.op, node.assigned_device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_name_parsing() {
        assert_eq!(parse_tensor_name("x"), ("x".to_string(), 0));
        assert_eq!(parse_tensor_name("x:2"), ("x".to_string(), 2));
        assert_eq!(parse_tensor_name("^x"), ("x".to_string(), CONTROL_SLOT));
    }

    #[test]
    fn duplicate_node_rejected() {
        let def = GraphDef {
            nodes: vec![NodeDef::new("a", "NoOp"), NodeDef::new("a", "NoOp")],
            ..Default::default()
        };
        let err = Graph::from_graph_def(&def, false).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::InvalidArgument);
    }

    #[test]
    fn edges_follow_input_specs() {
        let def = GraphDef {
            nodes: vec![
                NodeDef::new("a", "Const"),
                NodeDef::new("b", "Identity").with_inputs(vec!["a".into()]),
                NodeDef::new("c", "NoOp").with_inputs(vec!["^b".into()]),
            ],
            ..Default::default()
        };
        let graph = Graph::from_graph_def(&def, false).unwrap();
        assert_eq!(graph.num_nodes(), 3);
        assert_eq!(graph.data_inputs(1), vec![(0, 0)]);
        let control: Vec<&Edge> = graph.in_edges(2).collect();
        assert!(control[0].is_control());
    }
}
