//! Debug decoration: a two-step visitor over each partition graph, keyed by
//! device name. Decorators are installed through a process-wide registry so
//! debug tooling stays an external collaborator.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::config::DebugOptions;
use crate::graph::Graph;
use crate::status::{Result, Status};

/// Inserts watcher nodes, then notifies collaborators that the decorated
/// graph is live on a device.
pub trait DebugGraphDecorator: Send + Sync {
    fn decorate_graph(&self, graph: &mut Graph, device_name: &str) -> Result<()>;
    fn publish_graph(&self, graph: &Graph, device_name: &str) -> Result<()>;
}

/// Publishes per-run metadata (step counters, feed/fetch/target names) to
/// whatever debugger is attached.
pub trait DebuggerState: Send + Sync {
    fn publish_debug_metadata(
        &self,
        global_step: i64,
        session_run_index: i64,
        executor_step_index: i64,
        input_names: &[String],
        output_names: &[String],
        target_names: &[String],
    ) -> Result<()>;
}

pub type DecoratorFactory =
    fn(&DebugOptions) -> Result<Arc<dyn DebugGraphDecorator>>;
pub type DebuggerStateFactory = fn(&DebugOptions) -> Result<Arc<dyn DebuggerState>>;

static DECORATOR_FACTORY: Lazy<Mutex<Option<DecoratorFactory>>> =
    Lazy::new(|| Mutex::new(None));
static STATE_FACTORY: Lazy<Mutex<Option<DebuggerStateFactory>>> =
    Lazy::new(|| Mutex::new(None));

pub fn register_decorator_factory(factory: DecoratorFactory) {
    *DECORATOR_FACTORY.lock().expect("decorator factory poisoned") = Some(factory);
}

pub fn register_debugger_state_factory(factory: DebuggerStateFactory) {
    *STATE_FACTORY.lock().expect("debugger state factory poisoned") = Some(factory);
}

pub fn create_decorator(options: &DebugOptions) -> Result<Arc<dyn DebugGraphDecorator>> {
    let factory = DECORATOR_FACTORY
        .lock()
        .expect("decorator factory poisoned")
        .ok_or_else(|| {
            Status::failed_precondition(
                "debug watches requested but no graph decorator is registered",
            )
        })?;
    factory(options)
}

pub fn create_debugger_state(options: &DebugOptions) -> Result<Arc<dyn DebuggerState>> {
    let factory = STATE_FACTORY
        .lock()
        .expect("debugger state factory poisoned")
        .ok_or_else(|| {
            Status::failed_precondition(
                "debug watches requested but no debugger state is registered",
            )
        })?;
    factory(options)
}

/// Decorate then publish one partition graph.
pub fn decorate_and_publish(
    options: &DebugOptions,
    graph: &mut Graph,
    device_name: &str,
) -> Result<()> {
    let decorator = create_decorator(options)?;
    decorator.decorate_graph(graph, device_name)?;
    decorator.publish_graph(graph, device_name)
}
