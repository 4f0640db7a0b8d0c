//! Session groups: one leader and N-1 followers serving the same model
//! concurrently over shared resource managers, with one virtual GPU stream
//! per member when multi-stream is enabled.

use std::sync::Arc;

use crate::config::SessionOptions;
use crate::device::factory::{
    add_devices, DeviceGlobalThreadPoolOptions, DeviceResourceMgrMap,
};
use crate::device::resource::ResourceMgr;
use crate::device::{Device, DeviceMgr, LOCAL_DEVICE_PREFIX};
use crate::session::{factory, Session};
use crate::status::{Result, Status};

pub struct SessionGroup {
    leader: Arc<Session>,
    followers: Vec<Arc<Session>>,
    shared_cpu_rmgr: Arc<ResourceMgr>,
    shared_gpu_rmgr: Option<Arc<ResourceMgr>>,
}

impl std::fmt::Debug for SessionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGroup")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl SessionGroup {
    pub fn size(&self) -> usize {
        1 + self.followers.len()
    }

    pub fn leader(&self) -> &Arc<Session> {
        &self.leader
    }

    pub fn followers(&self) -> &[Arc<Session>] {
        &self.followers
    }

    /// Member by rank; rank 0 is the leader.
    pub fn session(&self, rank: usize) -> Result<&Arc<Session>> {
        if rank == 0 {
            return Ok(&self.leader);
        }
        self.followers.get(rank - 1).ok_or_else(|| {
            Status::invalid_argument(format!(
                "session rank {rank} out of range for group of {}",
                self.size()
            ))
        })
    }

    pub fn shared_cpu_resource_mgr(&self) -> &Arc<ResourceMgr> {
        &self.shared_cpu_rmgr
    }

    pub fn shared_gpu_resource_mgr(&self) -> Option<&Arc<ResourceMgr>> {
        self.shared_gpu_rmgr.as_ref()
    }
}

/// Evenly partition the visible CPUs across the group members.
fn allocate_visible_cpus(visible_cpus: &[usize], session_num: usize) -> Vec<Vec<usize>> {
    let per_session = visible_cpus.len() / session_num;
    (0..session_num)
        .map(|rank| {
            let start = rank * per_session;
            visible_cpus[start..start + per_session].to_vec()
        })
        .collect()
}

/// Strip every virtual GPU except the member's own stream.
fn remove_other_stream_devices(devices: &mut Vec<Arc<dyn Device>>, stream_idx: usize) {
    let keep = format!("/device:GPU:{stream_idx}");
    devices.retain(|device| {
        device.device_type() != "GPU" || device.name().ends_with(&keep)
    });
}

/// Build a leader plus `session_num - 1` followers sharing one CPU resource
/// manager (and, with multi-stream, one GPU resource manager across per-rank
/// virtual GPU devices).
pub fn new_session_group(
    options: SessionOptions,
    session_num: usize,
) -> Result<SessionGroup> {
    if session_num < 1 {
        return Err(Status::invalid_argument(
            "must specify a positive session_num for new_session_group",
        ));
    }
    factory::global().claim_metadata_key(&options)?;

    let mut options = options;
    let use_multi_stream = options.config.use_per_session_stream;
    if use_multi_stream {
        // One virtual GPU per member; memory is sized lazily and growth is
        // forced on so streams can share the physical device.
        options.config.gpu_options.virtual_device_memory_limit_mb =
            vec![-1; session_num];
        options.config.gpu_options.allow_growth = true;
    } else {
        crate::warning!(
            "using a single stream in session group mode, this can't get good performance"
        );
    }

    let visible_cpus: Vec<usize> = (0..std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1))
        .collect();
    let visible_cpus_per_session = allocate_visible_cpus(&visible_cpus, session_num);

    // Shared CPU resource manager, published under every spelling of the
    // client CPU device name.
    let shared_cpu_rmgr = Arc::new(ResourceMgr::new("localhost"));
    let mut rmgr_map = DeviceResourceMgrMap::default();
    for spelling in [
        format!("{LOCAL_DEVICE_PREFIX}/device:CPU:0"),
        format!("{LOCAL_DEVICE_PREFIX}/device:cpu:0"),
        "/device:CPU:0".to_string(),
        "/device:cpu:0".to_string(),
    ] {
        rmgr_map
            .device_rmgr_map
            .insert(spelling, Arc::clone(&shared_cpu_rmgr));
    }

    let shared_gpu_rmgr = if use_multi_stream {
        let gpu_rmgr = Arc::new(ResourceMgr::new("localhost"));
        for rank in 0..session_num {
            rmgr_map.device_rmgr_map.insert(
                format!("{LOCAL_DEVICE_PREFIX}/device:GPU:{rank}"),
                Arc::clone(&gpu_rmgr),
            );
        }
        Some(gpu_rmgr)
    } else {
        None
    };

    let mut tp_options = DeviceGlobalThreadPoolOptions {
        global_threadpool_num: session_num,
        device_threadpool_index: 0,
    };

    let mut leader_devices =
        add_devices(&options, LOCAL_DEVICE_PREFIX, Some(&rmgr_map), Some(tp_options))?;
    if use_multi_stream {
        remove_other_stream_devices(&mut leader_devices, 0);
    }
    let leader_device_mgr = Arc::new(DeviceMgr::new(leader_devices));

    let mut leader_options = options.clone();
    if use_multi_stream {
        leader_options
            .config
            .per_session_devices
            .push(format!("{LOCAL_DEVICE_PREFIX}/device:GPU:0"));
    }
    let leader = Session::new(
        leader_options,
        Arc::clone(&leader_device_mgr),
        visible_cpus_per_session[0].clone(),
    );
    factory::global().register(&leader);

    let mut followers = Vec::with_capacity(session_num - 1);
    for rank in 1..session_num {
        tp_options.device_threadpool_index = rank;
        let device_mgr = if use_multi_stream {
            let mut devices = add_devices(
                &options,
                LOCAL_DEVICE_PREFIX,
                Some(&rmgr_map),
                Some(tp_options),
            )?;
            remove_other_stream_devices(&mut devices, rank);
            Arc::new(DeviceMgr::new(devices))
        } else {
            // Sharing the leader's devices is permitted but degraded.
            crate::warning!(
                "session group follower {rank} shares the leader's device manager"
            );
            Arc::clone(&leader_device_mgr)
        };

        let mut follower_options = options.clone();
        if use_multi_stream {
            follower_options
                .config
                .per_session_devices
                .push(format!("{LOCAL_DEVICE_PREFIX}/device:GPU:{rank}"));
        }
        let follower = Session::new(
            follower_options,
            device_mgr,
            visible_cpus_per_session[rank].clone(),
        );
        factory::global().register(&follower);
        followers.push(follower);
    }

    Ok(SessionGroup {
        leader,
        followers,
        shared_cpu_rmgr,
        shared_gpu_rmgr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_allocation_is_even() {
        let cpus: Vec<usize> = (0..8).collect();
        let slices = allocate_visible_cpus(&cpus, 2);
        assert_eq!(slices[0], vec![0, 1, 2, 3]);
        assert_eq!(slices[1], vec![4, 5, 6, 7]);
    }
}
