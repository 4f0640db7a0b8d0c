use std::sync::Arc;

use crate::device::resource::{OpSegment, ResourceMgr, ScopedAllocatorMgr};
use crate::device::{Device, DeviceAttributes, DeviceLocality, MemoryType};
use crate::tensor::DType;
use crate::threadpool::ComputePool;

/// A host CPU device. The first CPU device in a session is the client device
/// from which tensors are fed and fetched.
pub struct CpuDevice {
    attributes: DeviceAttributes,
    op_segment: OpSegment,
    resource_mgr: Arc<ResourceMgr>,
    scoped_allocator_mgr: ScopedAllocatorMgr,
    thread_pool: Option<Arc<ComputePool>>,
}

impl CpuDevice {
    pub fn new(
        name: String,
        numa_node: i32,
        resource_mgr: Arc<ResourceMgr>,
        thread_pool: Option<Arc<ComputePool>>,
    ) -> Self {
        Self {
            attributes: DeviceAttributes {
                name,
                device_type: "CPU".to_string(),
                incarnation: rand::random::<u64>() | 1,
                locality: DeviceLocality { numa_node },
                memory_limit_mb: 0,
            },
            op_segment: OpSegment::new(),
            resource_mgr,
            scoped_allocator_mgr: ScopedAllocatorMgr::new(),
            thread_pool,
        }
    }
}

impl Device for CpuDevice {
    fn attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    fn op_segment(&self) -> &OpSegment {
        &self.op_segment
    }

    fn resource_manager(&self) -> &Arc<ResourceMgr> {
        &self.resource_mgr
    }

    fn scoped_allocator_mgr(&self) -> Option<&ScopedAllocatorMgr> {
        Some(&self.scoped_allocator_mgr)
    }

    fn device_thread_pool(&self) -> Option<Arc<ComputePool>> {
        self.thread_pool.clone()
    }

    fn memory_type(&self, _dtype: DType) -> MemoryType {
        MemoryType::Host
    }
}
