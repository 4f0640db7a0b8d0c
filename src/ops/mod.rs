//! Kernel registry. Kernels are external collaborators: the engine only
//! needs a handful of real ops to exercise its own plumbing, and a registry
//! seam through which everything else would arrive.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;

use crate::cancellation::{CancellationManager, Notification};
use crate::device::resource::DEFAULT_CONTAINER;
use crate::device::Device;
use crate::graph::{AttrValue, NodeDef};
use crate::status::Status;
use crate::tensor::{DType, Tensor, TensorValue};

/// Everything a kernel may touch while computing one node.
pub struct OpContext<'a> {
    pub node_name: &'a str,
    pub inputs: &'a [TensorValue],
    pub device: &'a dyn Device,
    pub cancellation: &'a CancellationManager,
    pub step_container: &'a str,
}

pub trait Kernel: Send + Sync {
    fn run(&self, ctx: &mut OpContext<'_>) -> Result<TensorValue>;
}

pub type KernelFactory = fn(&NodeDef) -> Result<Arc<dyn Kernel>>;

pub struct OpRegistration {
    pub name: &'static str,
    pub is_stateful: bool,
    pub is_collective: bool,
    pub factory: KernelFactory,
}

macro_rules! register_op {
    ($map:ident, $name:literal, $factory:expr) => {
        register_op!($map, $name, $factory, stateful = false, collective = false)
    };
    ($map:ident, $name:literal, $factory:expr, stateful = $stateful:literal, collective = $collective:literal) => {
        $map.insert(
            $name,
            OpRegistration {
                name: $name,
                is_stateful: $stateful,
                is_collective: $collective,
                factory: $factory,
            },
        )
    };
}

static REGISTRY: Lazy<HashMap<&'static str, OpRegistration>> = Lazy::new(|| {
    let mut map = HashMap::new();
    register_op!(map, "Placeholder", placeholder_kernel);
    register_op!(map, "Const", const_kernel);
    register_op!(map, "Identity", identity_kernel);
    register_op!(map, "Add", add_kernel);
    register_op!(map, "Mul", mul_kernel);
    register_op!(map, "Variable", variable_kernel, stateful = true, collective = false);
    register_op!(map, "BlockForever", block_kernel, stateful = true, collective = false);
    register_op!(
        map,
        "CollectiveReduce",
        collective_reduce_kernel,
        stateful = false,
        collective = true
    );
    map
});

pub fn lookup(op: &str) -> Option<&'static OpRegistration> {
    REGISTRY.get(op)
}

pub fn is_stateful(op: &str) -> bool {
    REGISTRY.get(op).map(|reg| reg.is_stateful).unwrap_or(false)
}

pub fn is_collective(op: &str) -> bool {
    REGISTRY
        .get(op)
        .map(|reg| reg.is_collective)
        .unwrap_or(false)
}

fn attr_tensor(def: &NodeDef) -> Result<TensorValue> {
    let dtype = match def.attrs.get("dtype") {
        Some(AttrValue::Type(dtype)) => *dtype,
        _ => bail!("node {} is missing a dtype attr", def.name),
    };
    let value = def
        .attrs
        .get("value")
        .ok_or_else(|| anyhow!("node {} is missing a value attr", def.name))?;
    match (dtype, value) {
        (DType::I32, AttrValue::Ints(values)) => Ok(TensorValue::I32(Tensor::new(
            values.iter().map(|v| *v as i32).collect(),
        ))),
        (DType::I64, AttrValue::Ints(values)) => {
            Ok(TensorValue::I64(Tensor::new(values.clone())))
        }
        (DType::F32, AttrValue::Floats(values)) => Ok(TensorValue::F32(Tensor::new(
            values.iter().map(|v| *v as f32).collect(),
        ))),
        (DType::F64, AttrValue::Floats(values)) => {
            Ok(TensorValue::F64(Tensor::new(values.clone())))
        }
        (DType::Bool, AttrValue::Bools(values)) => {
            Ok(TensorValue::Bool(Tensor::new(values.clone())))
        }
        _ => bail!(
            "node {} has a value attr incompatible with dtype {:?}",
            def.name,
            dtype
        ),
    }
}

struct PlaceholderKernel {
    name: String,
}

impl Kernel for PlaceholderKernel {
    fn run(&self, _ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        Err(Status::invalid_argument(format!(
            "placeholder {} must be fed a value",
            self.name
        ))
        .into())
    }
}

fn placeholder_kernel(def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(PlaceholderKernel {
        name: def.name.clone(),
    }))
}

struct ConstKernel {
    value: TensorValue,
}

impl Kernel for ConstKernel {
    fn run(&self, _ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        Ok(self.value.clone())
    }
}

fn const_kernel(def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(ConstKernel {
        value: attr_tensor(def)?,
    }))
}

struct IdentityKernel;

impl Kernel for IdentityKernel {
    fn run(&self, ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        match ctx.inputs.first() {
            Some(value) => Ok(value.clone()),
            None => bail!("identity node {} has no input", ctx.node_name),
        }
    }
}

fn identity_kernel(_def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(IdentityKernel))
}

fn broadcast_pair<'a, T: Clone>(
    lhs: &'a [T],
    rhs: &'a [T],
    node: &str,
) -> Result<Vec<(T, T)>> {
    if lhs.len() == rhs.len() {
        return Ok(lhs.iter().cloned().zip(rhs.iter().cloned()).collect());
    }
    if lhs.len() == 1 {
        return Ok(rhs.iter().map(|r| (lhs[0].clone(), r.clone())).collect());
    }
    if rhs.len() == 1 {
        return Ok(lhs.iter().map(|l| (l.clone(), rhs[0].clone())).collect());
    }
    bail!(
        "node {node}: operand lengths {} and {} are incompatible",
        lhs.len(),
        rhs.len()
    )
}

macro_rules! binary_elementwise {
    ($name:ident, $op:tt) => {
        fn $name(
            lhs: &TensorValue,
            rhs: &TensorValue,
            node: &str,
        ) -> Result<TensorValue> {
            match (lhs, rhs) {
                (TensorValue::I32(a), TensorValue::I32(b)) => Ok(TensorValue::I32(
                    Tensor::new(
                        broadcast_pair(&a.data, &b.data, node)?
                            .into_iter()
                            .map(|(x, y)| x $op y)
                            .collect(),
                    ),
                )),
                (TensorValue::I64(a), TensorValue::I64(b)) => Ok(TensorValue::I64(
                    Tensor::new(
                        broadcast_pair(&a.data, &b.data, node)?
                            .into_iter()
                            .map(|(x, y)| x $op y)
                            .collect(),
                    ),
                )),
                (TensorValue::F32(a), TensorValue::F32(b)) => Ok(TensorValue::F32(
                    Tensor::new(
                        broadcast_pair(&a.data, &b.data, node)?
                            .into_iter()
                            .map(|(x, y)| x $op y)
                            .collect(),
                    ),
                )),
                (TensorValue::F64(a), TensorValue::F64(b)) => Ok(TensorValue::F64(
                    Tensor::new(
                        broadcast_pair(&a.data, &b.data, node)?
                            .into_iter()
                            .map(|(x, y)| x $op y)
                            .collect(),
                    ),
                )),
                (lhs, rhs) => bail!(
                    "node {node}: dtype mismatch {:?} vs {:?}",
                    lhs.dtype(),
                    rhs.dtype()
                ),
            }
        }
    };
}

binary_elementwise!(elementwise_add, +);
binary_elementwise!(elementwise_mul, *);

struct AddKernel;

impl Kernel for AddKernel {
    fn run(&self, ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        match ctx.inputs {
            [lhs, rhs] => elementwise_add(lhs, rhs, ctx.node_name),
            other => bail!(
                "add node {} expects 2 inputs, got {}",
                ctx.node_name,
                other.len()
            ),
        }
    }
}

fn add_kernel(_def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(AddKernel))
}

struct MulKernel;

impl Kernel for MulKernel {
    fn run(&self, ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        match ctx.inputs {
            [lhs, rhs] => elementwise_mul(lhs, rhs, ctx.node_name),
            other => bail!(
                "mul node {} expects 2 inputs, got {}",
                ctx.node_name,
                other.len()
            ),
        }
    }
}

fn mul_kernel(_def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(MulKernel))
}

/// Reads (creating on first use) a tensor in the device's resource manager.
/// Stateful: placement is remembered across executor rebuilds.
struct VariableKernel {
    name: String,
    container: String,
    init: TensorValue,
}

impl Kernel for VariableKernel {
    fn run(&self, ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        let value = ctx
            .device
            .resource_manager()
            .lookup_or_create(&self.container, &self.name, || Ok(self.init.clone()))?;
        Ok(value)
    }
}

fn variable_kernel(def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    let container = match def.attrs.get("container") {
        Some(AttrValue::S(container)) if !container.is_empty() => container.clone(),
        _ => DEFAULT_CONTAINER.to_string(),
    };
    Ok(Arc::new(VariableKernel {
        name: def.name.clone(),
        container,
        init: attr_tensor(def)?,
    }))
}

/// Parks until the step is cancelled, then fails with *cancelled*. Exists so
/// the engine's timeout and close paths can be exercised end to end.
struct BlockKernel;

impl Kernel for BlockKernel {
    fn run(&self, ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        let note = Arc::new(Notification::new());
        let token = ctx.cancellation.get_cancellation_token();
        let registered = {
            let note = Arc::clone(&note);
            ctx.cancellation
                .register_callback(token, Box::new(move || note.notify()))
        };
        if registered {
            note.wait();
        }
        Err(Status::cancelled(format!(
            "blocking node {} was cancelled",
            ctx.node_name
        ))
        .into())
    }
}

fn block_kernel(_def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(BlockKernel))
}

/// Single-process stand-in: with one participant the reduction is identity.
struct CollectiveReduceKernel;

impl Kernel for CollectiveReduceKernel {
    fn run(&self, ctx: &mut OpContext<'_>) -> Result<TensorValue> {
        match ctx.inputs.first() {
            Some(value) => Ok(value.clone()),
            None => bail!("collective node {} has no input", ctx.node_name),
        }
    }
}

fn collective_reduce_kernel(_def: &NodeDef) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(CollectiveReduceKernel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_broadcast_in_binary_ops() {
        let lhs = TensorValue::I32(Tensor::new(vec![1, 2, 3]));
        let rhs = TensorValue::I32(Tensor::scalar(2));
        let out = elementwise_mul(&lhs, &rhs, "m").unwrap();
        assert_eq!(out, TensorValue::I32(Tensor::new(vec![2, 4, 6])));
    }

    #[test]
    fn registry_flags() {
        assert!(is_stateful("Variable"));
        assert!(!is_stateful("Add"));
        assert!(is_collective("CollectiveReduce"));
        assert!(lookup("NoSuchOp").is_none());
    }
}
