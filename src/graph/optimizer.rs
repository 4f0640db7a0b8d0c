//! Post-partitioning optimization pass seam. The passes themselves live
//! outside the engine; partitions are run through whatever is registered.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::graph::Graph;
use crate::status::Result;

pub trait OptimizationPass: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, graph: &mut Graph, device_name: &str) -> Result<()>;
}

static PASSES: Lazy<Mutex<Vec<Arc<dyn OptimizationPass>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

pub fn register_pass(pass: Arc<dyn OptimizationPass>) {
    PASSES.lock().expect("optimization passes poisoned").push(pass);
}

/// Run every registered pass over one partition graph.
pub fn run_post_partitioning(graph: &mut Graph, device_name: &str) -> Result<()> {
    let passes = PASSES
        .lock()
        .expect("optimization passes poisoned")
        .clone();
    for pass in passes {
        crate::trace!("optimization pass {} on {device_name}", pass.name());
        pass.run(graph, device_name)?;
    }
    Ok(())
}
