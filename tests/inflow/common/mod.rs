use std::sync::Arc;

use anyhow::{anyhow, Result};
use inflow::{
    new_session, AttrValue, DType, GraphDef, NodeDef, Session, SessionOptions,
    TensorValue,
};

/// `x` (placeholder) -> `y` (identity).
pub fn identity_graph() -> GraphDef {
    GraphDef {
        nodes: vec![
            NodeDef::new("x", "Placeholder").with_attr("dtype", AttrValue::Type(DType::I32)),
            NodeDef::new("y", "Identity")
                .with_inputs(vec!["x".into()])
                .with_attr("T", AttrValue::Type(DType::I32)),
        ],
        ..Default::default()
    }
}

/// `a + b = s`, `s * 2 = t`.
pub fn add_mul_graph() -> GraphDef {
    GraphDef {
        nodes: vec![
            NodeDef::new("a", "Placeholder").with_attr("dtype", AttrValue::Type(DType::I32)),
            NodeDef::new("b", "Placeholder").with_attr("dtype", AttrValue::Type(DType::I32)),
            NodeDef::new("s", "Add")
                .with_inputs(vec!["a".into(), "b".into()])
                .with_attr("T", AttrValue::Type(DType::I32)),
            NodeDef::new("two", "Const")
                .with_attr("dtype", AttrValue::Type(DType::I32))
                .with_attr("value", AttrValue::Ints(vec![2])),
            NodeDef::new("t", "Mul")
                .with_inputs(vec!["s".into(), "two".into()])
                .with_attr("T", AttrValue::Type(DType::I32)),
        ],
        ..Default::default()
    }
}

/// A single node that parks until its step is cancelled.
pub fn blocking_graph() -> GraphDef {
    GraphDef {
        nodes: vec![NodeDef::new("block", "BlockForever")],
        ..Default::default()
    }
}

/// A CPU-only session with a private inter-op pool, so parked partial-run
/// executors in one test cannot starve another.
pub fn new_cpu_session() -> Result<Arc<Session>> {
    let options = SessionOptions {
        config: inflow::ConfigProto {
            use_per_session_threads: true,
            inter_op_parallelism_threads: 4,
            ..Default::default()
        },
        ..Default::default()
    };
    Ok(new_session(options)?)
}

pub fn new_session_with(options: SessionOptions) -> Result<Arc<Session>> {
    Ok(new_session(options)?)
}

pub fn feed(name: &str, value: i32) -> (String, TensorValue) {
    (name.to_string(), TensorValue::from(value))
}

pub fn names(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|name| name.to_string()).collect()
}

pub fn scalar_i32(value: &TensorValue) -> Result<i32> {
    let tensor = value
        .as_i32()
        .map_err(|status| anyhow!("expected i32 tensor: {status}"))?;
    if tensor.len() != 1 {
        return Err(anyhow!("expected a scalar, got {} elements", tensor.len()));
    }
    Ok(tensor.data[0])
}
