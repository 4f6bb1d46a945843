//! Per-group resource allocation ceilings.
//!
//! Quotas cap how much cpu, memory, network, disk, and how many tasks a
//! task group may consume across the cluster. The evaluator snapshots
//! usage at round start and short-circuits every later task of a group
//! once the group runs out within the round.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tracker::TaskTrackerView;
use crate::types::{AssignmentFailure, ResourceKind, TaskRequest};

/// Resource allocation ceilings for one task group. Absent dimensions are
/// unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResAllocs {
    pub group_name: String,
    pub cpu: Option<f64>,
    pub memory_mb: Option<f64>,
    pub network_mbps: Option<f64>,
    pub disk_mb: Option<f64>,
    pub task_count: Option<usize>,
}

impl ResAllocs {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Default::default()
        }
    }

    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: f64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn with_network_mbps(mut self, network_mbps: f64) -> Self {
        self.network_mbps = Some(network_mbps);
        self
    }

    pub fn with_disk_mb(mut self, disk_mb: f64) -> Self {
        self.disk_mb = Some(disk_mb);
        self
    }

    pub fn with_task_count(mut self, task_count: usize) -> Self {
        self.task_count = Some(task_count);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupUsage {
    cpu: f64,
    memory_mb: f64,
    network_mbps: f64,
    disk_mb: f64,
    tasks: usize,
}

impl GroupUsage {
    fn add_task(&mut self, task: &TaskRequest) {
        self.cpu += task.resources.cpu;
        self.memory_mb += task.resources.memory_mb;
        self.network_mbps += task.resources.network_mbps;
        self.disk_mb += task.resources.disk_mb;
        self.tasks += 1;
    }
}

#[derive(Default)]
struct RoundState {
    usage: HashMap<String, GroupUsage>,
    failed_groups: HashSet<String>,
}

/// Applies per-group allocation ceilings ahead of host evaluation.
pub(crate) struct QuotaEvaluator {
    allocs: DashMap<String, ResAllocs>,
    round: Mutex<RoundState>,
}

impl QuotaEvaluator {
    pub(crate) fn new(initial: HashMap<String, ResAllocs>) -> Self {
        let allocs = DashMap::new();
        for (group, res) in initial {
            allocs.insert(group, res);
        }
        Self {
            allocs,
            round: Mutex::new(RoundState::default()),
        }
    }

    pub(crate) fn add_or_replace(&self, res: ResAllocs) {
        self.allocs.insert(res.group_name.clone(), res);
    }

    pub(crate) fn remove(&self, group_name: &str) {
        self.allocs.remove(group_name);
    }

    pub(crate) fn get_all(&self) -> HashMap<String, ResAllocs> {
        self.allocs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Snapshot current usage from the tracker at round start. Returns
    /// whether any quota is registered at all.
    pub(crate) fn prepare(&self, tracker: &TaskTrackerView) -> bool {
        let mut round = self.round.lock();
        round.failed_groups.clear();
        round.usage.clear();
        if self.allocs.is_empty() {
            return false;
        }
        for tracked in tracker.all_tasks() {
            round
                .usage
                .entry(tracked.task.group_name.clone())
                .or_default()
                .add_task(&tracked.task);
        }
        true
    }

    /// Whether the task's group already exhausted its quota this round.
    pub(crate) fn group_exhausted(&self, group_name: &str) -> bool {
        self.round.lock().failed_groups.contains(group_name)
    }

    /// Check a task against its group's remaining quota. On refusal, the
    /// group is marked exhausted for the rest of the round and the exceeded
    /// dimension is returned.
    pub(crate) fn check(&self, task: &TaskRequest) -> Option<AssignmentFailure> {
        let allocs = match self.allocs.get(&task.group_name) {
            Some(entry) => entry.value().clone(),
            None => return None,
        };

        let mut round = self.round.lock();
        let usage = round.usage.entry(task.group_name.clone()).or_default();

        let exceeded = Self::exceeded_dimension(&allocs, usage, task);
        if let Some(failure) = exceeded {
            round.failed_groups.insert(task.group_name.clone());
            return Some(failure);
        }
        None
    }

    /// Account a successfully bound task against its group.
    pub(crate) fn commit(&self, task: &TaskRequest) {
        let mut round = self.round.lock();
        round
            .usage
            .entry(task.group_name.clone())
            .or_default()
            .add_task(task);
    }

    fn exceeded_dimension(
        allocs: &ResAllocs,
        usage: &GroupUsage,
        task: &TaskRequest,
    ) -> Option<AssignmentFailure> {
        let group = task.group_name.clone();
        if let Some(limit) = allocs.cpu {
            if usage.cpu + task.resources.cpu > limit {
                return Some(AssignmentFailure::QuotaExceeded {
                    group,
                    resource: ResourceKind::Cpu,
                    limit,
                    used: usage.cpu,
                    requested: task.resources.cpu,
                });
            }
        }
        if let Some(limit) = allocs.memory_mb {
            if usage.memory_mb + task.resources.memory_mb > limit {
                return Some(AssignmentFailure::QuotaExceeded {
                    group,
                    resource: ResourceKind::MemoryMb,
                    limit,
                    used: usage.memory_mb,
                    requested: task.resources.memory_mb,
                });
            }
        }
        if let Some(limit) = allocs.network_mbps {
            if usage.network_mbps + task.resources.network_mbps > limit {
                return Some(AssignmentFailure::QuotaExceeded {
                    group,
                    resource: ResourceKind::NetworkMbps,
                    limit,
                    used: usage.network_mbps,
                    requested: task.resources.network_mbps,
                });
            }
        }
        if let Some(limit) = allocs.disk_mb {
            if usage.disk_mb + task.resources.disk_mb > limit {
                return Some(AssignmentFailure::QuotaExceeded {
                    group,
                    resource: ResourceKind::DiskMb,
                    limit,
                    used: usage.disk_mb,
                    requested: task.resources.disk_mb,
                });
            }
        }
        if let Some(limit) = allocs.task_count {
            if usage.tasks + 1 > limit {
                return Some(AssignmentFailure::QuotaExceeded {
                    group,
                    resource: ResourceKind::Other("taskCount".to_string()),
                    limit: limit as f64,
                    used: usage.tasks as f64,
                    requested: 1.0,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TaskTracker;
    use crate::types::ResourceVector;
    use std::sync::Arc;

    fn cpu_task(id: &str, group: &str, cpu: f64) -> TaskRequest {
        TaskRequest::new(id, group).with_resources(ResourceVector::new(cpu, 0.0, 0.0, 0.0))
    }

    fn empty_view() -> TaskTrackerView {
        Arc::new(TaskTracker::new()).view()
    }

    #[test]
    fn no_quota_means_no_refusal() {
        let evaluator = QuotaEvaluator::new(HashMap::new());
        assert!(!evaluator.prepare(&empty_view()));
        assert!(evaluator.check(&cpu_task("t1", "any", 100.0)).is_none());
    }

    #[test]
    fn group_without_allocs_is_unbounded() {
        let evaluator = QuotaEvaluator::new(HashMap::new());
        evaluator.add_or_replace(ResAllocs::new("capped").with_cpu(1.0));
        evaluator.prepare(&empty_view());
        assert!(evaluator.check(&cpu_task("t1", "other", 64.0)).is_none());
    }

    #[test]
    fn committed_usage_counts_against_later_tasks() {
        let evaluator = QuotaEvaluator::new(HashMap::new());
        evaluator.add_or_replace(ResAllocs::new("g").with_cpu(4.0));
        evaluator.prepare(&empty_view());

        let first = cpu_task("t1", "g", 3.0);
        assert!(evaluator.check(&first).is_none());
        evaluator.commit(&first);

        let second = cpu_task("t2", "g", 2.0);
        let failure = evaluator.check(&second).unwrap();
        assert!(matches!(
            failure,
            AssignmentFailure::QuotaExceeded {
                resource: ResourceKind::Cpu,
                ..
            }
        ));
        assert!(evaluator.group_exhausted("g"));
        assert!(!evaluator.group_exhausted("other"));
    }

    #[test]
    fn running_tasks_count_toward_usage_at_prepare() {
        let tracker = Arc::new(TaskTracker::new());
        tracker.assign_running(
            Arc::new(cpu_task("running", "g", 3.0)),
            "h1",
            Arc::new(HashMap::new()),
        );

        let evaluator = QuotaEvaluator::new(HashMap::new());
        evaluator.add_or_replace(ResAllocs::new("g").with_cpu(4.0));
        evaluator.prepare(&tracker.view());

        assert!(evaluator.check(&cpu_task("t1", "g", 2.0)).is_some());
    }

    #[test]
    fn task_count_ceiling_is_independent_of_resources() {
        let evaluator = QuotaEvaluator::new(HashMap::new());
        evaluator.add_or_replace(ResAllocs::new("g").with_task_count(1));
        evaluator.prepare(&empty_view());

        let first = cpu_task("t1", "g", 0.1);
        assert!(evaluator.check(&first).is_none());
        evaluator.commit(&first);

        let failure = evaluator.check(&cpu_task("t2", "g", 0.1)).unwrap();
        match failure {
            AssignmentFailure::QuotaExceeded { resource, .. } => {
                assert_eq!(resource, ResourceKind::Other("taskCount".to_string()));
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[test]
    fn prepare_resets_failed_groups() {
        let evaluator = QuotaEvaluator::new(HashMap::new());
        evaluator.add_or_replace(ResAllocs::new("g").with_cpu(1.0));
        evaluator.prepare(&empty_view());

        assert!(evaluator.check(&cpu_task("t1", "g", 2.0)).is_some());
        assert!(evaluator.group_exhausted("g"));

        evaluator.prepare(&empty_view());
        assert!(!evaluator.group_exhausted("g"));
    }
}
