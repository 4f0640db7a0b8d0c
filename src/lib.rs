//! inflow: an in-process dataflow session engine.
//!
//! A session accepts a declarative computation graph plus feed/fetch
//! bindings and drives the graph to completion on a fixed set of local
//! devices: the graph is pruned to the request, placed, partitioned per
//! device, and the partitions are dispatched in parallel onto configurable
//! compute pools with a join barrier. Prepared executors are cached per
//! `(feeds, fetches, targets)` request; partial runs feed and fetch a
//! pre-pruned subgraph incrementally through a persistent rendezvous; and
//! session groups multiplex one model across leader/follower sessions
//! sharing resource managers.

pub mod callframe;
pub mod cancellation;
pub mod collective;
pub mod config;
pub mod debug;
pub mod device;
pub mod executor;
pub mod graph;
pub mod logging;
pub mod metrics;
pub mod ops;
pub mod rendezvous;
pub mod session;
pub mod status;
pub mod tensor;
pub mod threadpool;

pub use callframe::{CallFrame, FunctionCallFrame};
pub use cancellation::{CancellationManager, Notification};
pub use config::{
    CallableOptions, ConfigProto, DebugOptions, DeviceCount, ExecutorPolicy,
    ExperimentalConfig, GpuOptions, GraphOptions, RunOptions, SessionMetadata,
    SessionOptions, ThreadPoolOptions, TraceLevel,
};
pub use device::{Device, DeviceAttributes, DeviceMgr, DeviceSet};
pub use executor::stats::RunMetadata;
pub use graph::{AttrValue, GraphDef, NodeDef};
pub use rendezvous::Rendezvous;
pub use session::callable::CallableHandle;
pub use session::factory::{new_session, DirectSessionFactory};
pub use session::group::{new_session_group, SessionGroup};
pub use session::Session;
pub use status::{Code, Result, Status};
pub use tensor::{DType, ResourceHandle, Tensor, TensorElement, TensorValue};
