use anyhow::Result;
use inflow::{
    AttrValue, Code, ConfigProto, DType, DeviceCount, GraphDef, NodeDef,
    RunMetadata, RunOptions, SessionOptions, TensorValue, TraceLevel,
};

use crate::common;

#[test]
fn identity_run_returns_fed_value() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("x:0", 7)],
        &common::names(&["y:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(common::scalar_i32(&outputs[0])?, 7);
    Ok(())
}

#[test]
fn duplicate_fetches_are_folded() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("x:0", 9)],
        &common::names(&["y:0", "y:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(outputs.len(), 2);
    assert_eq!(common::scalar_i32(&outputs[0])?, 9);
    assert_eq!(common::scalar_i32(&outputs[1])?, 9);
    Ok(())
}

#[test]
fn add_mul_chain() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("a:0", 3), common::feed("b:0", 4)],
        &common::names(&["s:0", "t:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 7);
    assert_eq!(common::scalar_i32(&outputs[1])?, 14);
    Ok(())
}

#[test]
fn target_only_run_produces_no_outputs() -> Result<()> {
    let session = common::new_cpu_session()?;
    let graph = GraphDef {
        nodes: vec![NodeDef::new("c", "Const")
            .with_attr("dtype", AttrValue::Type(DType::I32))
            .with_attr("value", AttrValue::Ints(vec![1]))],
        ..Default::default()
    };
    session.create(graph)?;

    let mut outputs = Vec::new();
    session.run(&[], &[], &common::names(&["c"]), &mut outputs)?;
    assert!(outputs.is_empty());
    Ok(())
}

#[test]
fn empty_request_is_invalid_argument() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    let err = session
        .run(&[common::feed("x:0", 1)], &[], &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn unknown_feed_and_fetch_are_not_found() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    let err = session
        .run(
            &[common::feed("nope:0", 1)],
            &common::names(&["y:0"]),
            &[],
            &mut outputs,
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = session
        .run(
            &[common::feed("x:0", 1)],
            &common::names(&["ghost:0"]),
            &[],
            &mut outputs,
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    Ok(())
}

#[test]
fn unfed_placeholder_fails() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    let err = session
        .run(&[], &common::names(&["y:0"]), &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn metadata_reports_partition_graphs_and_stats() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let run_options = RunOptions {
        trace_level: TraceLevel::SoftwareTrace,
        output_partition_graphs: true,
        ..Default::default()
    };
    let mut outputs = Vec::new();
    let mut metadata = RunMetadata::default();
    session.run_with_options(
        &run_options,
        &[common::feed("x:0", 5)],
        &common::names(&["y:0"]),
        &[],
        &mut outputs,
        &mut metadata,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 5);
    assert!(!metadata.partition_graphs.is_empty());
    let step_stats = metadata.step_stats.expect("tracing was requested");
    assert!(!step_stats.dev_stats.is_empty());
    assert!(step_stats
        .dev_stats
        .iter()
        .any(|dev| !dev.node_stats.is_empty()));
    Ok(())
}

#[test]
fn cross_device_run_moves_tensors_through_rendezvous() -> Result<()> {
    let options = SessionOptions {
        config: ConfigProto {
            use_per_session_threads: true,
            inter_op_parallelism_threads: 4,
            device_count: DeviceCount {
                cpu: Some(1),
                gpu: Some(1),
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let session = common::new_session_with(options)?;
    let graph = GraphDef {
        nodes: vec![
            NodeDef::new("x", "Placeholder").with_attr("dtype", AttrValue::Type(DType::I32)),
            NodeDef::new("y", "Identity")
                .with_inputs(vec!["x".into()])
                .with_device("/device:GPU:0")
                .with_attr("T", AttrValue::Type(DType::I32)),
        ],
        ..Default::default()
    };
    session.create(graph)?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("x:0", 21)],
        &common::names(&["y:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 21);
    Ok(())
}

#[test]
fn collective_ops_acquire_a_graph_key() -> Result<()> {
    let session = common::new_cpu_session()?;
    let graph = GraphDef {
        nodes: vec![
            NodeDef::new("x", "Placeholder").with_attr("dtype", AttrValue::Type(DType::I32)),
            NodeDef::new("c", "CollectiveReduce")
                .with_inputs(vec!["x".into()])
                .with_attr("T", AttrValue::Type(DType::I32)),
        ],
        ..Default::default()
    };
    session.create(graph)?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("x:0", 13)],
        &common::names(&["c:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 13);
    Ok(())
}

#[test]
fn vector_values_round_trip() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let mut outputs = Vec::new();
    session.run(
        &[
            ("a:0".to_string(), TensorValue::from(vec![1, 2, 3])),
            ("b:0".to_string(), TensorValue::from(vec![10, 20, 30])),
        ],
        &common::names(&["t:0"]),
        &[],
        &mut outputs,
    )?;
    let tensor = outputs[0].as_i32().expect("i32 output");
    assert_eq!(tensor.data, vec![22, 44, 66]);
    Ok(())
}
