use anyhow::Result;
use inflow::{AttrValue, DType, GraphDef, NodeDef};

use crate::common;

fn two_identity_graph() -> GraphDef {
    GraphDef {
        nodes: vec![
            NodeDef::new("a", "Placeholder").with_attr("dtype", AttrValue::Type(DType::I32)),
            NodeDef::new("b", "Placeholder").with_attr("dtype", AttrValue::Type(DType::I32)),
            NodeDef::new("ia", "Identity")
                .with_inputs(vec!["a".into()])
                .with_attr("T", AttrValue::Type(DType::I32)),
            NodeDef::new("ib", "Identity")
                .with_inputs(vec!["b".into()])
                .with_attr("T", AttrValue::Type(DType::I32)),
        ],
        ..Default::default()
    }
}

#[test]
fn permuted_feeds_and_fetches_stay_consistent() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(two_identity_graph())?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("a:0", 1), common::feed("b:0", 2)],
        &common::names(&["ia:0", "ib:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 1);
    assert_eq!(common::scalar_i32(&outputs[1])?, 2);

    // Same logical request, permuted; the canonical cache entry serves both
    // and values still land under the right names.
    session.run(
        &[common::feed("b:0", 20), common::feed("a:0", 10)],
        &common::names(&["ib:0", "ia:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 20);
    assert_eq!(common::scalar_i32(&outputs[1])?, 10);
    Ok(())
}

#[test]
fn concurrent_identical_runs_are_correct() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut handles = Vec::new();
    for value in 0..8 {
        let session = std::sync::Arc::clone(&session);
        handles.push(std::thread::spawn(move || -> Result<i32> {
            let mut outputs = Vec::new();
            session.run(
                &[common::feed("x:0", value)],
                &common::names(&["y:0"]),
                &[],
                &mut outputs,
            )?;
            common::scalar_i32(&outputs[0])
        }));
    }
    for (value, handle) in handles.into_iter().enumerate() {
        let result = handle.join().expect("runner thread panicked")?;
        assert_eq!(result, value as i32);
    }
    Ok(())
}

#[test]
fn duplicate_feed_is_rejected() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    let err = session
        .run(
            &[common::feed("x:0", 1), common::feed("x:0", 2)],
            &common::names(&["y:0"]),
            &[],
            &mut outputs,
        )
        .unwrap_err();
    assert_eq!(err.code(), inflow::Code::InvalidArgument);
    Ok(())
}

#[test]
fn stateful_nodes_keep_their_placement_across_requests() -> Result<()> {
    let session = common::new_cpu_session()?;
    let graph = GraphDef {
        nodes: vec![
            NodeDef::new("v", "Variable")
                .with_attr("dtype", AttrValue::Type(DType::I32))
                .with_attr("value", AttrValue::Ints(vec![41])),
            NodeDef::new("one", "Const")
                .with_attr("dtype", AttrValue::Type(DType::I32))
                .with_attr("value", AttrValue::Ints(vec![1])),
            NodeDef::new("vp", "Add")
                .with_inputs(vec!["v".into(), "one".into()])
                .with_attr("T", AttrValue::Type(DType::I32)),
        ],
        ..Default::default()
    };
    session.create(graph)?;

    let mut outputs = Vec::new();
    session.run(&[], &common::names(&["v:0"]), &[], &mut outputs)?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 41);
    // A different request over the same stateful node builds new executors
    // but must agree on its placement.
    session.run(&[], &common::names(&["vp:0"]), &[], &mut outputs)?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 42);
    Ok(())
}
