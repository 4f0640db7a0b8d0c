//! Partition a placed client graph into one subgraph per device, inserting
//! `_Send`/`_Recv` pairs for every edge that crosses a device boundary.

use std::collections::HashMap;

use crate::device::DeviceSet;
use crate::graph::{AttrValue, Graph, GraphDef, NodeDef};
use crate::rendezvous;
use crate::status::{Result, Status};

pub struct PartitionOptions<'a> {
    pub device_set: &'a DeviceSet,
    /// Produces unique names for cross-device transfer tags.
    pub new_name: &'a mut dyn FnMut(&str) -> String,
}

/// One `GraphDef` per device. Cross-device tensors flow through the step's
/// rendezvous under keys computed here, bit-exact with the client key format.
pub fn partition(
    graph: &Graph,
    options: &mut PartitionOptions<'_>,
) -> Result<HashMap<String, GraphDef>> {
    let mut node_inputs: HashMap<usize, Vec<(i32, String)>> = HashMap::new();
    let mut extra_nodes: HashMap<String, Vec<NodeDef>> = HashMap::new();
    // (src, slot, dst device) -> recv node name, so one transfer feeds every
    // consumer on that device.
    let mut transfers: HashMap<(usize, i32, String), String> = HashMap::new();

    for node in graph.nodes() {
        if node.assigned_device.is_empty() {
            return Err(Status::internal(format!(
                "node {} was never assigned a device",
                node.name
            )));
        }
    }

    for edge in graph.edges() {
        let src = graph.node(edge.src);
        let dst = graph.node(edge.dst);
        let inputs = node_inputs.entry(edge.dst).or_default();
        if src.assigned_device == dst.assigned_device {
            let spec = if edge.is_control() {
                format!("^{}", src.name)
            } else if edge.src_output == 0 {
                src.name.clone()
            } else {
                format!("{}:{}", src.name, edge.src_output)
            };
            let order = if edge.is_control() { i32::MAX } else { edge.dst_input };
            inputs.push((order, spec));
            continue;
        }

        // Cross-device hop.
        let transfer_key = (edge.src, edge.src_output, dst.assigned_device.clone());
        let recv_name = match transfers.get(&transfer_key) {
            Some(existing) => existing.clone(),
            None => {
                let tag = (options.new_name)(&src.name);
                let src_device = options
                    .device_set
                    .find(&src.assigned_device)
                    .ok_or_else(|| partition_device_error(options.device_set, src))?;
                let key = rendezvous::compose_key(
                    src_device.attributes(),
                    &dst.assigned_device,
                    &tag,
                    0,
                    0,
                );

                let send_name = format!("{tag}/send");
                let send_input = if edge.is_control() {
                    format!("^{}", src.name)
                } else if edge.src_output == 0 {
                    src.name.clone()
                } else {
                    format!("{}:{}", src.name, edge.src_output)
                };
                let mut send = NodeDef::new(&send_name, "_Send")
                    .with_inputs(vec![send_input])
                    .with_device(src.assigned_device.clone())
                    .with_attr("tensor_name", AttrValue::S(tag.clone()))
                    .with_attr("rendezvous_key", AttrValue::S(key.clone()));
                if let Some(dtype) = src.output_dtype() {
                    send = send.with_attr("dtype", AttrValue::Type(dtype));
                }
                extra_nodes
                    .entry(src.assigned_device.clone())
                    .or_default()
                    .push(send);

                let recv_name = format!("{tag}/recv");
                let mut recv = NodeDef::new(&recv_name, "_Recv")
                    .with_device(dst.assigned_device.clone())
                    .with_attr("tensor_name", AttrValue::S(tag))
                    .with_attr("rendezvous_key", AttrValue::S(key));
                if let Some(dtype) = src.output_dtype() {
                    recv = recv.with_attr("dtype", AttrValue::Type(dtype));
                }
                extra_nodes
                    .entry(dst.assigned_device.clone())
                    .or_default()
                    .push(recv);

                transfers.insert(transfer_key, recv_name.clone());
                recv_name
            }
        };
        if edge.is_control() {
            inputs.push((i32::MAX, format!("^{recv_name}")));
        } else {
            inputs.push((edge.dst_input, recv_name));
        }
    }

    let mut partitions: HashMap<String, Vec<NodeDef>> = HashMap::new();
    for node in graph.nodes() {
        let mut inputs = node_inputs.remove(&node.id).unwrap_or_default();
        inputs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        partitions
            .entry(node.assigned_device.clone())
            .or_default()
            .push(NodeDef {
                name: node.name.clone(),
                op: node.op.clone(),
                inputs: inputs.into_iter().map(|(_, spec)| spec).collect(),
                device: node.assigned_device.clone(),
                attrs: node.attrs.clone(),
            });
    }
    for (device, nodes) in extra_nodes {
        partitions.entry(device).or_default().extend(nodes);
    }

    // Every partition must land on a known device.
    let mut result = HashMap::new();
    for (device_name, nodes) in partitions {
        if options.device_set.find(&device_name).is_none() {
            let available: Vec<String> = options
                .device_set
                .devices()
                .iter()
                .map(|device| device.name().to_string())
                .collect();
            return Err(Status::invalid_argument(format!(
                "creating a partition for {device_name}, which doesn't exist in the list \
                 of available devices. Available devices: {}",
                available.join(",")
            )));
        }
        result.insert(
            device_name,
            GraphDef {
                nodes,
                library: Default::default(),
                version: graph.version,
            },
        );
    }
    Ok(result)
}

fn partition_device_error(device_set: &DeviceSet, node: &crate::graph::Node) -> Status {
    let available: Vec<String> = device_set
        .devices()
        .iter()
        .map(|device| device.name().to_string())
        .collect();
    Status::invalid_argument(format!(
        "node {} assigned to unknown device {}. Available devices: {}",
        node.name,
        node.assigned_device,
        available.join(",")
    ))
}

/// Call-frame endpoints must stay in host memory; a partition whose device
/// keeps them in device memory cannot feed or fetch directly.
pub fn ensure_memory_types(
    device: &std::sync::Arc<dyn crate::device::Device>,
    graph: &Graph,
) -> Result<()> {
    for node in graph.nodes() {
        if node.op == "_Arg" || node.op == "_Retval" {
            if let Some(dtype) = node.output_dtype() {
                if device.memory_type(dtype) == crate::device::MemoryType::Device {
                    return Err(Status::internal(format!(
                        "call-frame endpoint {} requires host memory on device {}",
                        node.name,
                        device.name()
                    )));
                }
            }
        }
    }
    Ok(())
}

