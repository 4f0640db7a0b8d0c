//! Per-device resource scopes: named containers, the kernel op-segment, and
//! step-scoped cleanup.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::ops::Kernel;
use crate::status::{Result, Status};
use crate::tensor::TensorValue;

pub const DEFAULT_CONTAINER: &str = "localhost";

/// Named tensor containers scoped to a device (or shared across devices in a
/// session group).
#[derive(Debug)]
pub struct ResourceMgr {
    name: String,
    containers: Mutex<HashMap<String, HashMap<String, TensorValue>>>,
}

impl ResourceMgr {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, container: &str, name: &str) -> Result<TensorValue> {
        let containers = self.containers.lock().expect("resource containers poisoned");
        containers
            .get(container)
            .and_then(|entries| entries.get(name))
            .cloned()
            .ok_or_else(|| {
                Status::not_found(format!("resource {container}/{name} not found"))
            })
    }

    pub fn create(&self, container: &str, name: &str, value: TensorValue) -> Result<()> {
        let mut containers = self.containers.lock().expect("resource containers poisoned");
        let entries = containers.entry(container.to_string()).or_default();
        if entries.contains_key(name) {
            return Err(Status::already_exists(format!(
                "resource {container}/{name} already exists"
            )));
        }
        entries.insert(name.to_string(), value);
        Ok(())
    }

    pub fn lookup_or_create(
        &self,
        container: &str,
        name: &str,
        init: impl FnOnce() -> Result<TensorValue>,
    ) -> Result<TensorValue> {
        let mut containers = self.containers.lock().expect("resource containers poisoned");
        let entries = containers.entry(container.to_string()).or_default();
        if let Some(value) = entries.get(name) {
            return Ok(value.clone());
        }
        let value = init()?;
        entries.insert(name.to_string(), value.clone());
        Ok(value)
    }

    pub fn update(&self, container: &str, name: &str, value: TensorValue) {
        let mut containers = self.containers.lock().expect("resource containers poisoned");
        containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn cleanup(&self, container: &str) {
        let mut containers = self.containers.lock().expect("resource containers poisoned");
        containers.remove(container);
    }

    /// Clear the named containers; an empty list clears the default one.
    pub fn clear(&self, containers: &[String]) {
        if containers.is_empty() {
            self.cleanup(DEFAULT_CONTAINER);
            return;
        }
        for container in containers {
            self.cleanup(container);
        }
    }
}

struct SegmentEntry {
    holds: usize,
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

/// Per-device kernel cache scoped by session handle. Kernels in the segment
/// outlive any executor that references them.
#[derive(Default)]
pub struct OpSegment {
    sessions: Mutex<HashMap<String, SegmentEntry>>,
}

impl OpSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hold(&self, session_handle: &str) {
        let mut sessions = self.sessions.lock().expect("op segment poisoned");
        sessions
            .entry(session_handle.to_string())
            .or_insert_with(|| SegmentEntry {
                holds: 0,
                kernels: HashMap::new(),
            })
            .holds += 1;
    }

    pub fn remove_hold(&self, session_handle: &str) {
        let mut sessions = self.sessions.lock().expect("op segment poisoned");
        if let Some(entry) = sessions.get_mut(session_handle) {
            entry.holds -= 1;
            if entry.holds == 0 {
                sessions.remove(session_handle);
            }
        }
    }

    pub fn find_or_create(
        &self,
        session_handle: &str,
        node_name: &str,
        create: impl FnOnce() -> anyhow::Result<Arc<dyn Kernel>>,
    ) -> Result<Arc<dyn Kernel>> {
        let mut sessions = self.sessions.lock().expect("op segment poisoned");
        let entry = sessions.get_mut(session_handle).ok_or_else(|| {
            Status::not_found(format!(
                "op segment has no hold for session {session_handle}"
            ))
        })?;
        if let Some(kernel) = entry.kernels.get(node_name) {
            return Ok(Arc::clone(kernel));
        }
        let kernel = create().map_err(Status::from_opaque)?;
        entry.kernels.insert(node_name.to_string(), Arc::clone(&kernel));
        Ok(kernel)
    }

    pub fn has_hold(&self, session_handle: &str) -> bool {
        let sessions = self.sessions.lock().expect("op segment poisoned");
        sessions.contains_key(session_handle)
    }
}

/// Tracks per-step scoped allocations so they can be dropped at step end.
#[derive(Debug, Default)]
pub struct ScopedAllocatorMgr {
    steps: Mutex<HashSet<i64>>,
}

impl ScopedAllocatorMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, step_id: i64) {
        self.steps.lock().expect("scoped allocator poisoned").insert(step_id);
    }

    pub fn cleanup(&self, step_id: i64) {
        self.steps.lock().expect("scoped allocator poisoned").remove(&step_id);
    }

    pub fn active_steps(&self) -> usize {
        self.steps.lock().expect("scoped allocator poisoned").len()
    }
}

/// Scope for everything a step allocates. Dropping the container walks the
/// devices and releases resource-manager and scoped-allocator state keyed by
/// the step id.
pub struct StepContainer {
    step_id: i64,
    devices: Vec<Arc<dyn Device>>,
}

impl StepContainer {
    pub fn new(step_id: i64, devices: Vec<Arc<dyn Device>>) -> Self {
        for device in &devices {
            if let Some(sam) = device.scoped_allocator_mgr() {
                sam.register(step_id);
            }
        }
        Self { step_id, devices }
    }

    pub fn step_id(&self) -> i64 {
        self.step_id
    }

    pub fn name(&self) -> String {
        per_step_container_name(self.step_id)
    }
}

pub fn per_step_container_name(step_id: i64) -> String {
    format!("__per_step_{step_id}")
}

impl Drop for StepContainer {
    fn drop(&mut self) {
        let container = self.name();
        for device in &self.devices {
            device.resource_manager().cleanup(&container);
            if let Some(sam) = device.scoped_allocator_mgr() {
                sam.cleanup(self.step_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn create_twice_is_already_exists() {
        let mgr = ResourceMgr::new("localhost");
        let value = TensorValue::I32(Tensor::scalar(1));
        mgr.create("c", "v", value.clone()).unwrap();
        let err = mgr.create("c", "v", value).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::AlreadyExists);
    }

    #[test]
    fn clear_with_empty_list_hits_default_container() {
        let mgr = ResourceMgr::new("localhost");
        mgr.create(DEFAULT_CONTAINER, "v", TensorValue::I32(Tensor::scalar(7)))
            .unwrap();
        mgr.clear(&[]);
        assert!(mgr.lookup(DEFAULT_CONTAINER, "v").is_err());
    }

    #[test]
    fn step_container_scopes_allocator_state() {
        let device: Arc<dyn Device> = Arc::new(crate::device::cpu::CpuDevice::new(
            "/device:CPU:0".to_string(),
            0,
            Arc::new(ResourceMgr::new("localhost")),
            None,
        ));
        let container = StepContainer::new(7, vec![Arc::clone(&device)]);
        assert_eq!(
            device.scoped_allocator_mgr().expect("cpu has one").active_steps(),
            1
        );
        drop(container);
        assert_eq!(
            device.scoped_allocator_mgr().expect("cpu has one").active_steps(),
            0
        );
    }
}
