//! Fitness calculators scoring (task, host) pairs.
//!
//! A fitness value lies in `[0, 1]`, higher is better. The bin-packing
//! calculators prefer fuller hosts so that partially used hosts fill up
//! before empty ones, keeping whole hosts idle for scale-down.

use crate::tracker::TaskTrackerView;
use crate::types::{HostCandidate, TaskRequest};

/// Plugin scoring how well a task fits on a host.
pub trait FitnessCalculator: Send + Sync {
    fn name(&self) -> &str;

    /// Score in `[0, 1]`, higher is better.
    fn calculate(&self, task: &TaskRequest, host: &HostCandidate, tracker: &TaskTrackerView)
        -> f64;
}

/// Treats every host as an equally good fit.
pub struct DefaultFitnessCalculator;

impl FitnessCalculator for DefaultFitnessCalculator {
    fn name(&self) -> &str {
        "Default"
    }

    fn calculate(
        &self,
        _task: &TaskRequest,
        _host: &HostCandidate,
        _tracker: &TaskTrackerView,
    ) -> f64 {
        1.0
    }
}

fn packing_score(requested: f64, available: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    let used_after = (total - available) + requested;
    (used_after / total).clamp(0.0, 1.0)
}

/// Packs tasks by cpu: a host whose cpu is fuller after placement scores
/// higher.
pub struct CpuBinPacker;

impl FitnessCalculator for CpuBinPacker {
    fn name(&self) -> &str {
        "CpuBinPacker"
    }

    fn calculate(
        &self,
        task: &TaskRequest,
        host: &HostCandidate,
        _tracker: &TaskTrackerView,
    ) -> f64 {
        packing_score(task.resources.cpu, host.available.cpu, host.total.cpu)
    }
}

/// Packs tasks by memory.
pub struct MemoryBinPacker;

impl FitnessCalculator for MemoryBinPacker {
    fn name(&self) -> &str {
        "MemoryBinPacker"
    }

    fn calculate(
        &self,
        task: &TaskRequest,
        host: &HostCandidate,
        _tracker: &TaskTrackerView,
    ) -> f64 {
        packing_score(
            task.resources.memory_mb,
            host.available.memory_mb,
            host.total.memory_mb,
        )
    }
}

/// Packs tasks by cpu, memory, and network together, weighing the three
/// dimensions equally.
pub struct CpuMemNetworkBinPacker;

impl FitnessCalculator for CpuMemNetworkBinPacker {
    fn name(&self) -> &str {
        "CpuMemNetworkBinPacker"
    }

    fn calculate(
        &self,
        task: &TaskRequest,
        host: &HostCandidate,
        _tracker: &TaskTrackerView,
    ) -> f64 {
        let cpu = packing_score(task.resources.cpu, host.available.cpu, host.total.cpu);
        let memory = packing_score(
            task.resources.memory_mb,
            host.available.memory_mb,
            host.total.memory_mb,
        );
        let network = packing_score(
            task.resources.network_mbps,
            host.available.network_mbps,
            host.total.network_mbps,
        );
        (cpu + memory + network) / 3.0
    }
}
