use std::time::{Duration, Instant};

use anyhow::Result;
use inflow::{Code, RunMetadata, RunOptions};

use crate::common;

#[test]
fn close_cancels_a_blocking_run() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::blocking_graph())?;

    let runner = {
        let session = std::sync::Arc::clone(&session);
        std::thread::spawn(move || {
            let mut outputs = Vec::new();
            session.run(&[], &[], &common::names(&["block"]), &mut outputs)
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    session.close()?;
    let result = runner.join().expect("runner thread panicked");
    assert!(started.elapsed() < Duration::from_secs(10));

    let err = result.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    Ok(())
}

#[test]
fn timeout_returns_deadline_exceeded() -> Result<()> {
    let session = common::new_cpu_session()?;
    session.create(common::blocking_graph())?;

    let run_options = RunOptions {
        timeout_in_ms: 50,
        ..Default::default()
    };
    let mut outputs = Vec::new();
    let mut metadata = RunMetadata::default();
    let started = Instant::now();
    let err = session
        .run_with_options(
            &run_options,
            &[],
            &[],
            &common::names(&["block"]),
            &mut outputs,
            &mut metadata,
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    // The step was cancelled and drained, not left running.
    assert!(started.elapsed() < Duration::from_secs(10));
    session.close()?;
    Ok(())
}

#[test]
fn session_default_timeout_applies() -> Result<()> {
    let mut options = inflow::SessionOptions::default();
    options.config.operation_timeout_in_ms = 50;
    let session = common::new_session_with(options)?;
    session.create(common::blocking_graph())?;

    let mut outputs = Vec::new();
    let err = session
        .run(&[], &[], &common::names(&["block"]), &mut outputs)
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    session.close()?;
    Ok(())
}
