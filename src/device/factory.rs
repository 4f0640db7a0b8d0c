//! Device factory registry. The engine asks the registry to enumerate local
//! devices; session groups pass a shared resource-manager map and global
//! thread-pool options through to the factories.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::config::SessionOptions;
use crate::device::cpu::CpuDevice;
use crate::device::gpu::VirtualGpuDevice;
use crate::device::resource::ResourceMgr;
use crate::device::{local_device_name, Device};
use crate::status::Result;
use crate::threadpool;

/// Maps device names (under any spelling) to resource managers shared across
/// the sessions of a group.
#[derive(Default)]
pub struct DeviceResourceMgrMap {
    pub device_rmgr_map: HashMap<String, Arc<ResourceMgr>>,
}

impl DeviceResourceMgrMap {
    fn find(&self, name: &str) -> Option<Arc<ResourceMgr>> {
        self.device_rmgr_map
            .get(name)
            .or_else(|| self.device_rmgr_map.get(local_device_name(name)))
            .or_else(|| self.device_rmgr_map.get(&name.to_ascii_lowercase()))
            .cloned()
    }
}

/// Selects one of the globally indexed device compute pools; session-group
/// followers advertise distinct indices so each lands on its own pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceGlobalThreadPoolOptions {
    pub global_threadpool_num: usize,
    pub device_threadpool_index: usize,
}

pub struct DeviceFactoryContext<'a> {
    pub rmgr_map: Option<&'a DeviceResourceMgrMap>,
    pub global_tp: Option<DeviceGlobalThreadPoolOptions>,
}

pub trait DeviceFactory: Send + Sync {
    fn create_devices(
        &self,
        options: &SessionOptions,
        name_prefix: &str,
        ctx: &DeviceFactoryContext,
    ) -> Result<Vec<Arc<dyn Device>>>;
}

struct CpuDeviceFactory;

impl DeviceFactory for CpuDeviceFactory {
    fn create_devices(
        &self,
        options: &SessionOptions,
        name_prefix: &str,
        ctx: &DeviceFactoryContext,
    ) -> Result<Vec<Arc<dyn Device>>> {
        let count = options.config.device_count.cpu.unwrap_or(1).max(1);
        let mut devices: Vec<Arc<dyn Device>> = Vec::with_capacity(count);
        for index in 0..count {
            let name = format!("{name_prefix}/device:CPU:{index}");
            let rmgr = ctx
                .rmgr_map
                .and_then(|map| map.find(&name))
                .unwrap_or_else(|| Arc::new(ResourceMgr::new("localhost")));
            let pool = match ctx.global_tp {
                Some(tp_opts) if tp_opts.global_threadpool_num > 0 => {
                    let threads =
                        threadpool::num_intra_op_threads_from_options(options);
                    Some(threadpool::global_indexed_pool(
                        tp_opts.device_threadpool_index,
                        threads,
                    )?)
                }
                _ => None,
            };
            devices.push(Arc::new(CpuDevice::new(name, index as i32, rmgr, pool)));
        }
        Ok(devices)
    }
}

struct GpuDeviceFactory;

impl DeviceFactory for GpuDeviceFactory {
    fn create_devices(
        &self,
        options: &SessionOptions,
        name_prefix: &str,
        ctx: &DeviceFactoryContext,
    ) -> Result<Vec<Arc<dyn Device>>> {
        let gpu_options = &options.config.gpu_options;
        let limits: Vec<i64> = if !gpu_options.virtual_device_memory_limit_mb.is_empty() {
            gpu_options.virtual_device_memory_limit_mb.clone()
        } else {
            vec![0; options.config.device_count.gpu.unwrap_or(0)]
        };
        let mut devices: Vec<Arc<dyn Device>> = Vec::with_capacity(limits.len());
        for (index, memory_limit_mb) in limits.iter().enumerate() {
            let name = format!("{name_prefix}/device:GPU:{index}");
            let rmgr = ctx
                .rmgr_map
                .and_then(|map| map.find(&name))
                .unwrap_or_else(|| Arc::new(ResourceMgr::new("localhost")));
            devices.push(Arc::new(VirtualGpuDevice::new(
                name,
                index,
                *memory_limit_mb,
                gpu_options.allow_growth,
                rmgr,
            )));
        }
        Ok(devices)
    }
}

static FACTORIES: Lazy<Mutex<BTreeMap<&'static str, Arc<dyn DeviceFactory>>>> =
    Lazy::new(|| {
        let mut factories: BTreeMap<&'static str, Arc<dyn DeviceFactory>> = BTreeMap::new();
        factories.insert("CPU", Arc::new(CpuDeviceFactory));
        factories.insert("GPU", Arc::new(GpuDeviceFactory));
        Mutex::new(factories)
    });

/// Enumerate local devices. CPU devices come first so the client device is
/// always a CPU.
pub fn add_devices(
    options: &SessionOptions,
    name_prefix: &str,
    rmgr_map: Option<&DeviceResourceMgrMap>,
    global_tp: Option<DeviceGlobalThreadPoolOptions>,
) -> Result<Vec<Arc<dyn Device>>> {
    let ctx = DeviceFactoryContext {
        rmgr_map,
        global_tp,
    };
    let factories = FACTORIES.lock().expect("device factories poisoned");
    let mut devices = Vec::new();
    for device_type in ["CPU", "GPU"] {
        if let Some(factory) = factories.get(device_type) {
            devices.extend(factory.create_devices(options, name_prefix, &ctx)?);
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigProto;

    #[test]
    fn cpu_device_is_first() {
        let options = SessionOptions {
            config: ConfigProto {
                gpu_options: crate::config::GpuOptions {
                    virtual_device_memory_limit_mb: vec![-1, -1],
                    allow_growth: true,
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let devices =
            add_devices(&options, crate::device::LOCAL_DEVICE_PREFIX, None, None).unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].device_type(), "CPU");
        assert_eq!(devices[1].device_type(), "GPU");
    }
}
