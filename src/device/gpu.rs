use std::sync::Arc;

use crate::device::resource::{OpSegment, ResourceMgr, ScopedAllocatorMgr};
use crate::device::{Device, DeviceAttributes, DeviceLocality, MemoryType};
use crate::tensor::DType;
use crate::threadpool::ComputePool;

/// A virtual GPU device backed by one stream of the physical accelerator.
/// Session groups materialize one per member session; each session keeps
/// only the device whose stream index matches its rank.
pub struct VirtualGpuDevice {
    attributes: DeviceAttributes,
    stream_id: usize,
    allow_growth: bool,
    op_segment: OpSegment,
    resource_mgr: Arc<ResourceMgr>,
    scoped_allocator_mgr: ScopedAllocatorMgr,
}

impl VirtualGpuDevice {
    pub fn new(
        name: String,
        stream_id: usize,
        memory_limit_mb: i64,
        allow_growth: bool,
        resource_mgr: Arc<ResourceMgr>,
    ) -> Self {
        Self {
            attributes: DeviceAttributes {
                name,
                device_type: "GPU".to_string(),
                incarnation: rand::random::<u64>() | 1,
                locality: DeviceLocality { numa_node: 0 },
                memory_limit_mb,
            },
            stream_id,
            allow_growth,
            op_segment: OpSegment::new(),
            resource_mgr,
            scoped_allocator_mgr: ScopedAllocatorMgr::new(),
        }
    }

    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    pub fn allow_growth(&self) -> bool {
        self.allow_growth
    }
}

impl Device for VirtualGpuDevice {
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
        None
    }

    fn memory_type(&self, dtype: DType) -> MemoryType {
        // Resource handles stay host-resident even on accelerator devices.
        match dtype {
            DType::Resource => MemoryType::Host,
            _ => MemoryType::Device,
        }
    }
}
