use anyhow::Result;
use inflow::{Code, ConfigProto, RunMetadata, RunOptions, SessionOptions, ThreadPoolOptions};

use crate::common;

fn options_with_pools(pools: Vec<ThreadPoolOptions>) -> SessionOptions {
    SessionOptions {
        config: ConfigProto {
            session_inter_op_thread_pool: pools,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn run_selects_the_configured_pool() -> Result<()> {
    let options = options_with_pools(vec![
        ThreadPoolOptions {
            num_threads: 2,
            global_name: String::new(),
        },
        ThreadPoolOptions {
            num_threads: 2,
            global_name: String::new(),
        },
    ]);
    let session = common::new_session_with(options)?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    let mut metadata = RunMetadata::default();
    for pool_index in [-1, 0, 1] {
        let run_options = RunOptions {
            inter_op_thread_pool: pool_index,
            ..Default::default()
        };
        session.run_with_options(
            &run_options,
            &[common::feed("x:0", pool_index)],
            &common::names(&["y:0"]),
            &[],
            &mut outputs,
            &mut metadata,
        )?;
        assert_eq!(common::scalar_i32(&outputs[0])?, pool_index);
    }
    Ok(())
}

#[test]
fn out_of_range_pool_index_is_invalid_argument() -> Result<()> {
    let options = options_with_pools(vec![ThreadPoolOptions {
        num_threads: 2,
        global_name: String::new(),
    }]);
    let session = common::new_session_with(options)?;
    session.create(common::identity_graph())?;

    let run_options = RunOptions {
        inter_op_thread_pool: 5,
        ..Default::default()
    };
    let mut outputs = Vec::new();
    let mut metadata = RunMetadata::default();
    let err = session
        .run_with_options(
            &run_options,
            &[common::feed("x:0", 1)],
            &common::names(&["y:0"]),
            &[],
            &mut outputs,
            &mut metadata,
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn global_pool_name_conflicts_surface_at_create() -> Result<()> {
    let shared = options_with_pools(vec![ThreadPoolOptions {
        num_threads: 2,
        global_name: "pool_conflict_test".to_string(),
    }]);
    let first = common::new_session_with(shared)?;
    first.create(common::identity_graph())?;

    // Same name, different thread count: the pool is interned first-writer-
    // wins, so the second session latches an init error.
    let conflicting = options_with_pools(vec![ThreadPoolOptions {
        num_threads: 4,
        global_name: "pool_conflict_test".to_string(),
    }]);
    let second = common::new_session_with(conflicting)?;
    let err = second.create(common::identity_graph()).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn global_pool_name_is_shared_between_sessions() -> Result<()> {
    let options = options_with_pools(vec![ThreadPoolOptions {
        num_threads: 2,
        global_name: "pool_sharing_test".to_string(),
    }]);
    let first = common::new_session_with(options.clone())?;
    first.create(common::identity_graph())?;
    let second = common::new_session_with(options)?;
    second.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    for session in [&first, &second] {
        session.run(
            &[common::feed("x:0", 33)],
            &common::names(&["y:0"]),
            &[],
            &mut outputs,
        )?;
        assert_eq!(common::scalar_i32(&outputs[0])?, 33);
    }
    Ok(())
}

#[test]
fn caller_thread_execution_still_computes() -> Result<()> {
    let options = SessionOptions {
        config: ConfigProto {
            inter_op_parallelism_threads: -1,
            ..Default::default()
        },
        ..Default::default()
    };
    let session = common::new_session_with(options)?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("x:0", 55)],
        &common::names(&["y:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 55);
    Ok(())
}

#[test]
fn per_session_threads_build_a_private_pool() -> Result<()> {
    let options = SessionOptions {
        config: ConfigProto {
            use_per_session_threads: true,
            inter_op_parallelism_threads: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let session = common::new_session_with(options)?;
    session.create(common::identity_graph())?;

    let mut outputs = Vec::new();
    session.run(
        &[common::feed("x:0", 66)],
        &common::names(&["y:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 66);
    Ok(())
}
