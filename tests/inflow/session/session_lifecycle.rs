use anyhow::Result;
use inflow::{
    new_session, AttrValue, Code, ConfigProto, DType, ExperimentalConfig,
    GraphDef, NodeDef, SessionMetadata, SessionOptions,
};

use crate::common;

#[test]
fn create_twice_is_already_exists() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;
    let err = session.create(common::identity_graph()).unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
    Ok(())
}

#[test]
fn create_with_empty_graph_is_a_no_op() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(GraphDef::default())?;
    // The empty create did not latch graph creation.
    session.create(common::identity_graph())?;
    Ok(())
}

#[test]
fn run_before_create_is_failed_precondition() -> Result<()> {
    let session = common::new_cpu_session()?;
    let mut outputs = Vec::new();
    let err = session
        .run(&[], &common::names(&["y:0"]), &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    Ok(())
}

#[test]
fn extend_adds_nodes() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;
    session.extend(GraphDef {
        nodes: vec![NodeDef::new("z", "Identity")
            .with_inputs(vec!["y".into()])
            .with_attr("T", AttrValue::Type(DType::I32))],
        ..Default::default()
    })?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("x:0", 11)],
        &common::names(&["z:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 11);
    Ok(())
}

#[test]
fn extend_with_existing_node_is_rejected() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;
    let err = session
        .extend(GraphDef {
            nodes: vec![NodeDef::new("x", "Placeholder")
                .with_attr("dtype", AttrValue::Type(DType::I32))],
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn close_is_idempotent_and_rejects_operations() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;
    session.close()?;
    session.close()?;

    let mut outputs = Vec::new();
    let err = session
        .run(
            &[common::feed("x:0", 1)],
            &common::names(&["y:0"]),
            &[],
            &mut outputs,
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    assert!(outputs.is_empty());

    let err = session.extend(GraphDef::default()).unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    Ok(())
}

#[test]
fn list_devices_reports_a_client_cpu() -> Result<()> {
    let session = common::new_cpu_session()?;
    let devices = session.list_devices();
    assert!(!devices.is_empty());
    assert_eq!(devices[0].device_type, "CPU");
    assert_ne!(devices[0].incarnation, 0);
    Ok(())
}

#[test]
fn duplicate_session_metadata_is_already_exists() -> Result<()> {
    let options = SessionOptions {
        config: ConfigProto {
            experimental: ExperimentalConfig {
                session_metadata: Some(SessionMetadata {
                    name: "lifecycle_meta_model".to_string(),
                    version: 3,
                }),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let first = new_session(options.clone())?;
    let err = new_session(options.clone()).unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    // Closing the first session releases the key.
    first.close()?;
    let second = new_session(options)?;
    second.close()?;
    Ok(())
}

#[test]
fn negative_metadata_version_is_invalid() -> Result<()> {
    let options = SessionOptions {
        config: ConfigProto {
            experimental: ExperimentalConfig {
                session_metadata: Some(SessionMetadata {
                    name: "bad_version".to_string(),
                    version: -1,
                }),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let err = new_session(options).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn reset_clears_named_containers() -> Result<()> {
    let session = common::new_cpu_session()?;
    let graph = GraphDef {
        nodes: vec![NodeDef::new("v", "Variable")
            .with_attr("dtype", AttrValue::Type(DType::I32))
            .with_attr("value", AttrValue::Ints(vec![5]))
            .with_attr("container", AttrValue::S("test_container".to_string()))],
        ..Default::default()
    };
    session.create(graph)?;

    let mut outputs = Vec::new();
    session.run(&[], &common::names(&["v:0"]), &[], &mut outputs)?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 5);

    let device = &session.device_mgr().list_devices()[0];
    assert!(device
        .resource_manager()
        .lookup("test_container", "v")
        .is_ok());
    session.reset(&["test_container".to_string()])?;
    assert!(device
        .resource_manager()
        .lookup("test_container", "v")
        .is_err());
    Ok(())
}
