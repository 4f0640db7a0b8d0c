use anyhow::Result;
use inflow::{CallableOptions, Code, RunMetadata, TensorValue};

use crate::common;

fn identity_callable() -> CallableOptions {
    CallableOptions {
        feed: common::names(&["x:0"]),
        fetch: common::names(&["y:0"]),
        ..Default::default()
    }
}

#[test]
fn make_run_release_callable() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let handle = session.make_callable(&identity_callable())?;
    let mut fetched = Vec::new();
    let mut metadata = RunMetadata::default();
    session.run_callable(handle, &[TensorValue::from(5)], &mut fetched, &mut metadata)?;
    assert_eq!(common::scalar_i32(&fetched[0])?, 5);

    // The compiled handle is reusable.
    session.run_callable(handle, &[TensorValue::from(6)], &mut fetched, &mut metadata)?;
    assert_eq!(common::scalar_i32(&fetched[0])?, 6);

    session.release_callable(handle)?;
    let err = session
        .run_callable(handle, &[TensorValue::from(7)], &mut fetched, &mut metadata)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn feed_count_mismatch_is_invalid_argument() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let handle = session.make_callable(&identity_callable())?;
    let mut fetched = Vec::new();
    let mut metadata = RunMetadata::default();
    let err = session
        .run_callable(handle, &[], &mut fetched, &mut metadata)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn unknown_handle_is_invalid_argument() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let mut fetched = Vec::new();
    let mut metadata = RunMetadata::default();
    let err = session
        .run_callable(999, &[TensorValue::from(1)], &mut fetched, &mut metadata)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = session.release_callable(999).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn callables_get_distinct_handles() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::identity_graph())?;

    let first = session.make_callable(&identity_callable())?;
    let second = session.make_callable(&identity_callable())?;
    assert_ne!(first, second);
    session.release_callable(first)?;
    // Releasing one handle leaves the other usable.
    let mut fetched = Vec::new();
    let mut metadata = RunMetadata::default();
    session.run_callable(second, &[TensorValue::from(8)], &mut fetched, &mut metadata)?;
    assert_eq!(common::scalar_i32(&fetched[0])?, 8);
    Ok(())
}
