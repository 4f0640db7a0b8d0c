use anyhow::Result;
use inflow::Code;

use crate::common;

#[test]
fn incremental_feed_and_fetch() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let handle = session.prun_setup(
        &common::names(&["a:0", "b:0"]),
        &common::names(&["s:0", "t:0"]),
        &[],
    )?;

    // Feed without fetching.
    let mut outputs = Vec::new();
    session.prun(&handle, &[common::feed("a:0", 3)], &[], &mut outputs)?;
    assert!(outputs.is_empty());

    // Feeding the same endpoint again is rejected while the run is live.
    let err = session
        .prun(&handle, &[common::feed("a:0", 9)], &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("already been fed"));

    session.prun(
        &handle,
        &[common::feed("b:0", 4)],
        &common::names(&["s:0"]),
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 7);

    session.prun(&handle, &[], &common::names(&["t:0"]), &mut outputs)?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 14);

    // Everything pending has been used; the handle is gone.
    let err = session
        .prun(&handle, &[common::feed("a:0", 1)], &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn fetch_with_pending_reachable_feed_is_rejected() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let handle = session.prun_setup(
        &common::names(&["a:0", "b:0"]),
        &common::names(&["s:0"]),
        &[],
    )?;

    // s depends on b, which is still pending and not part of this call.
    let mut outputs = Vec::new();
    let err = session
        .prun(
            &handle,
            &[common::feed("a:0", 1)],
            &common::names(&["s:0"]),
            &mut outputs,
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("can't be computed"));
    session.close()?;
    Ok(())
}

#[test]
fn repeated_fetch_is_rejected() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let handle = session.prun_setup(
        &common::names(&["a:0", "b:0"]),
        &common::names(&["s:0", "t:0"]),
        &[],
    )?;

    let mut outputs = Vec::new();
    session.prun(
        &handle,
        &[common::feed("a:0", 2), common::feed("b:0", 5)],
        &common::names(&["s:0"]),
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 7);

    let err = session
        .prun(&handle, &[], &common::names(&["s:0"]), &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("already been fetched"));

    session.prun(&handle, &[], &common::names(&["t:0"]), &mut outputs)?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 14);
    Ok(())
}

#[test]
fn feed_outside_setup_is_rejected() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let handle = session.prun_setup(
        &common::names(&["a:0"]),
        &common::names(&["s:0"]),
        &[],
    )?;
    let mut outputs = Vec::new();
    let err = session
        .prun(&handle, &[common::feed("b:0", 1)], &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("was not specified"));
    session.close()?;
    Ok(())
}

#[test]
fn prun_without_setup_is_rejected() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let mut outputs = Vec::new();
    let err = session
        .prun("no-such-handle", &[], &common::names(&["s:0"]), &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn partial_runs_on_the_same_graph_are_independent() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::add_mul_graph())?;

    let first = session.prun_setup(
        &common::names(&["a:0", "b:0"]),
        &common::names(&["s:0", "t:0"]),
        &[],
    )?;
    let second = session.prun_setup(
        &common::names(&["a:0", "b:0"]),
        &common::names(&["s:0", "t:0"]),
        &[],
    )?;
    assert_ne!(first, second);

    let mut outputs = Vec::new();
    session.prun(
        &first,
        &[common::feed("a:0", 1), common::feed("b:0", 2)],
        &common::names(&["s:0", "t:0"]),
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 3);
    assert_eq!(common::scalar_i32(&outputs[1])?, 6);

    session.prun(
        &second,
        &[common::feed("a:0", 10), common::feed("b:0", 20)],
        &common::names(&["s:0", "t:0"]),
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 30);
    assert_eq!(common::scalar_i32(&outputs[1])?, 60);
    Ok(())
}
