//! Local compute devices and the manager that indexes them.

pub mod cpu;
pub mod factory;
pub mod gpu;
pub mod resource;

use std::collections::HashMap;
use std::sync::Arc;

use crate::graph::Graph;
use crate::status::{Result, Status};
use crate::tensor::DType;
use crate::threadpool::ComputePool;
use resource::{OpSegment, ResourceMgr, ScopedAllocatorMgr};

pub const LOCAL_DEVICE_PREFIX: &str = "/job:localhost/replica:0/task:0";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLocality {
    pub numa_node: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    /// Fully qualified name, e.g. `/job:localhost/replica:0/task:0/device:CPU:0`.
    pub name: String,
    pub device_type: String,
    /// Random per-process identity, part of every rendezvous key.
    pub incarnation: u64,
    pub locality: DeviceLocality,
    /// -1 defers sizing (virtual stream devices).
    pub memory_limit_mb: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Host,
    Device,
}

pub trait Device: Send + Sync {
    fn attributes(&self) -> &DeviceAttributes;

    fn name(&self) -> &str {
        &self.attributes().name
    }

    fn device_type(&self) -> &str {
        &self.attributes().device_type
    }

    fn op_segment(&self) -> &OpSegment;

    fn resource_manager(&self) -> &Arc<ResourceMgr>;

    fn scoped_allocator_mgr(&self) -> Option<&ScopedAllocatorMgr>;

    /// Optional per-device compute pool; partitions placed here bypass the
    /// session's inter-op pool.
    fn device_thread_pool(&self) -> Option<Arc<ComputePool>>;

    fn memory_type(&self, dtype: DType) -> MemoryType;

    /// Hook for device-specific partition rewrites before executor setup.
    fn maybe_rewrite_graph(&self, _graph: &mut Graph) -> Result<()> {
        Ok(())
    }
}

/// Strips the job/replica/task prefix: `/device:CPU:0` from the full name.
pub fn local_device_name(name: &str) -> &str {
    match name.find("/device:") {
        Some(pos) => &name[pos..],
        None => name,
    }
}

fn name_spellings(name: &str) -> Vec<String> {
    let local = local_device_name(name);
    let mut spellings = vec![
        name.to_string(),
        name.to_ascii_lowercase(),
        local.to_string(),
        local.to_ascii_lowercase(),
    ];
    spellings.dedup();
    spellings
}

/// Owns the device list and resolves lookups under every accepted spelling.
pub struct DeviceMgr {
    devices: Vec<Arc<dyn Device>>,
    name_index: HashMap<String, usize>,
}

impl DeviceMgr {
    pub fn new(devices: Vec<Arc<dyn Device>>) -> Self {
        let mut name_index = HashMap::new();
        for (idx, device) in devices.iter().enumerate() {
            for spelling in name_spellings(device.name()) {
                name_index.entry(spelling).or_insert(idx);
            }
        }
        Self {
            devices,
            name_index,
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Device>> {
        self.name_index
            .get(name)
            .or_else(|| self.name_index.get(&name.to_ascii_lowercase()))
            .map(|idx| Arc::clone(&self.devices[*idx]))
            .ok_or_else(|| Status::not_found(format!("device {name} not found")))
    }

    pub fn list_devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn clear_containers(&self, containers: &[String]) {
        for device in &self.devices {
            device.resource_manager().clear(containers);
        }
    }

    pub fn device_mapping_string(&self) -> String {
        let mut lines = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let attrs = device.attributes();
            lines.push(format!(
                "{} -> type {}, incarnation {:x}",
                attrs.name, attrs.device_type, attrs.incarnation
            ));
        }
        lines.join("\n")
    }
}

/// The session's view of its devices; the first one added is the client
/// device used to feed and fetch tensors.
#[derive(Clone)]
pub struct DeviceSet {
    devices: Vec<Arc<dyn Device>>,
    client_device: Arc<dyn Device>,
}

impl DeviceSet {
    pub fn new(devices: Vec<Arc<dyn Device>>) -> Result<Self> {
        let client_device = devices
            .first()
            .cloned()
            .ok_or_else(|| Status::internal("session has no devices"))?;
        Ok(Self {
            devices,
            client_device,
        })
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn client_device(&self) -> &Arc<dyn Device> {
        &self.client_device
    }

    /// Resolve an assigned device name (full or local spelling).
    pub fn find(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .iter()
            .find(|device| {
                device.name() == name || local_device_name(device.name()) == name
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_name_strips_prefix() {
        assert_eq!(
            local_device_name("/job:localhost/replica:0/task:0/device:CPU:0"),
            "/device:CPU:0"
        );
        assert_eq!(local_device_name("/device:GPU:1"), "/device:GPU:1");
    }
}
