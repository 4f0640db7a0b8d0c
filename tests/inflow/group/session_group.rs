use std::sync::Arc;

use anyhow::Result;
use inflow::{new_session_group, ConfigProto, SessionOptions};

use crate::common;

fn group_options(multi_stream: bool) -> SessionOptions {
    SessionOptions {
        config: ConfigProto {
            use_per_session_stream: multi_stream,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn multi_stream_group_gives_each_member_one_gpu() -> Result<()> {
    let group = new_session_group(group_options(true), 3)?;
    assert_eq!(group.size(), 3);

    let mut seen_gpu_names = Vec::new();
    for rank in 0..3 {
        let session = group.session(rank)?;
        let gpus: Vec<_> = session
            .list_devices()
            .into_iter()
            .filter(|attrs| attrs.device_type == "GPU")
            .collect();
        assert_eq!(gpus.len(), 1, "rank {rank} should see exactly one GPU");
        assert!(gpus[0].name.ends_with(&format!("/device:GPU:{rank}")));
        assert_eq!(gpus[0].memory_limit_mb, -1);
        seen_gpu_names.push(gpus[0].name.clone());
    }
    seen_gpu_names.sort();
    seen_gpu_names.dedup();
    assert_eq!(seen_gpu_names.len(), 3);

    // All members share one GPU resource manager instance.
    let shared = group
        .shared_gpu_resource_mgr()
        .expect("multi-stream group has a shared GPU manager");
    for rank in 0..3 {
        let session = group.session(rank)?;
        let gpu = session
            .device_mgr()
            .lookup(&format!("/device:GPU:{rank}"))
            .expect("member sees its own GPU");
        assert!(Arc::ptr_eq(gpu.resource_manager(), shared));
    }
    Ok(())
}

#[test]
fn group_members_share_the_cpu_resource_manager() -> Result<()> {
    let group = new_session_group(group_options(true), 2)?;
    let shared = group.shared_cpu_resource_mgr();
    for rank in 0..2 {
        let session = group.session(rank)?;
        let cpu = session
            .device_mgr()
            .lookup("/device:CPU:0")
            .expect("member sees the CPU");
        assert!(Arc::ptr_eq(cpu.resource_manager(), shared));
    }
    Ok(())
}

#[test]
fn single_stream_followers_share_the_leader_devices() -> Result<()> {
    let group = new_session_group(group_options(false), 2)?;
    assert!(group.shared_gpu_resource_mgr().is_none());
    let leader_mgr = group.leader().device_mgr();
    let follower_mgr = group.followers()[0].device_mgr();
    assert!(Arc::ptr_eq(leader_mgr, follower_mgr));
    Ok(())
}

#[test]
fn group_members_run_independently() -> Result<()> {
    let group = new_session_group(group_options(true), 2)?;
    for rank in 0..2 {
        let session = group.session(rank)?;
        session.create(common::identity_graph())?;
        let mut outputs = Vec::new();
        session.run(
            &[common::feed("x:0", rank as i32 + 100)],
            &common::names(&["y:0"]),
            &[],
            &mut outputs,
        )?;
        assert_eq!(common::scalar_i32(&outputs[0])?, rank as i32 + 100);
    }
    Ok(())
}

#[test]
fn zero_sessions_is_invalid_argument() {
    let err = new_session_group(group_options(true), 0).unwrap_err();
    assert_eq!(err.code(), inflow::Code::InvalidArgument);
}

#[test]
fn visible_cpus_are_partitioned_across_members() -> Result<()> {
    let group = new_session_group(group_options(true), 2)?;
    let leader_cpus = group.leader().visible_cpus().to_vec();
    let follower_cpus = group.followers()[0].visible_cpus().to_vec();
    for cpu in &leader_cpus {
        assert!(!follower_cpus.contains(cpu));
    }
    Ok(())
}
