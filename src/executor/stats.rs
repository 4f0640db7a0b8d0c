//! Step statistics, the cost model fed from them, and run metadata.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::graph::{Graph, GraphDef};
use crate::status::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExecStats {
    pub node_name: String,
    pub all_start_micros: u64,
    pub all_end_rel_micros: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStepStats {
    pub device: String,
    pub node_stats: Vec<NodeExecStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepStats {
    pub dev_stats: Vec<DeviceStepStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostNode {
    pub name: String,
    pub device: String,
    pub compute_micros: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostGraphDef {
    pub nodes: Vec<CostNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilerData {
    pub duration_usecs: u64,
}

/// Everything a run reports back besides its fetch tensors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    pub step_stats: Option<StepStats>,
    pub cost_graph: Option<CostGraphDef>,
    pub partition_graphs: Vec<GraphDef>,
    pub profiler_data: Option<ProfilerData>,
}

/// Collects per-node timings while a step runs; built only when tracing,
/// cost-model sampling, or OOM reporting asks for it.
pub struct StepStatsCollector {
    started: Instant,
    stats: Mutex<HashMap<String, Vec<NodeExecStats>>>,
}

impl StepStatsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn step_start(&self) -> Instant {
        self.started
    }

    pub fn record(&self, device: &str, node_name: &str, start: Instant, end: Instant) {
        let all_start_micros = start.duration_since(self.started).as_micros() as u64;
        let all_end_rel_micros = end.duration_since(start).as_micros() as u64;
        let mut stats = self.stats.lock().expect("step stats poisoned");
        stats.entry(device.to_string()).or_default().push(NodeExecStats {
            node_name: node_name.to_string(),
            all_start_micros,
            all_end_rel_micros,
        });
    }

    pub fn finalize(&self) -> StepStats {
        let stats = self.stats.lock().expect("step stats poisoned");
        let mut dev_stats: Vec<DeviceStepStats> = stats
            .iter()
            .map(|(device, node_stats)| DeviceStepStats {
                device: device.clone(),
                node_stats: node_stats.clone(),
            })
            .collect();
        dev_stats.sort_by(|a, b| a.device.cmp(&b.device));
        StepStats { dev_stats }
    }
}

impl Default for StepStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponentially aged per-node compute costs, rebuilt on sample steps.
#[derive(Debug, Default)]
pub struct CostModelManager {
    costs: Mutex<HashMap<(String, String), u64>>,
}

impl CostModelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_stats(&self, step_stats: &StepStats) {
        let mut costs = self.costs.lock().expect("cost model poisoned");
        for dev in &step_stats.dev_stats {
            for node in &dev.node_stats {
                let key = (dev.device.clone(), node.node_name.clone());
                let entry = costs.entry(key).or_insert(node.all_end_rel_micros);
                *entry = (*entry * 3 + node.all_end_rel_micros) / 4;
            }
        }
    }

    /// Append cost annotations for one partition graph.
    pub fn add_to_cost_graph(
        &self,
        graph: &Graph,
        device: &str,
        cost_graph: &mut CostGraphDef,
    ) -> Result<()> {
        let costs = self.costs.lock().expect("cost model poisoned");
        for node in graph.nodes() {
            if let Some(micros) = costs.get(&(device.to_string(), node.name.clone())) {
                cost_graph.nodes.push(CostNode {
                    name: node.name.clone(),
                    device: device.to_string(),
                    compute_micros: *micros,
                });
            }
        }
        Ok(())
    }

    pub fn estimated_cost(&self, device: &str, node_name: &str) -> Option<u64> {
        let costs = self.costs.lock().expect("cost model poisoned");
        costs.get(&(device.to_string(), node_name.to_string())).copied()
    }
}

/// Wall-clock capture around a hardware-traced step.
pub struct ProfilerSession {
    started: Instant,
}

impl ProfilerSession {
    pub fn create() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn collect_data(&self, metadata: &mut RunMetadata) -> Result<()> {
        metadata.profiler_data = Some(ProfilerData {
            duration_usecs: self.started.elapsed().as_micros() as u64,
        });
        Ok(())
    }
}
