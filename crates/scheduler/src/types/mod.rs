//! Core data types for the assignment engine.
//!
//! Resource leases and task requests are the engine's inputs; assignment
//! results and the per-round scheduling result are its outputs. Plain data
//! types derive `serde` so embedding frameworks can ship them around; the
//! types that carry plugin trait objects do not.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constraints::{HardConstraint, SoftConstraint};
use crate::host::AssignableHost;

/// Resource dimensions tracked per host and per task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    MemoryMb,
    NetworkMbps,
    DiskMb,
    Ports,
    /// Custom named scalar resource.
    Other(String),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::MemoryMb => write!(f, "memoryMB"),
            ResourceKind::NetworkMbps => write!(f, "networkMbps"),
            ResourceKind::DiskMb => write!(f, "diskMB"),
            ResourceKind::Ports => write!(f, "ports"),
            ResourceKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Scalar resource dimensions of a host or a task. Ports are carried
/// separately because they are discrete and individually assigned.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu: f64,
    pub memory_mb: f64,
    pub network_mbps: f64,
    pub disk_mb: f64,
}

impl ResourceVector {
    pub fn new(cpu: f64, memory_mb: f64, network_mbps: f64, disk_mb: f64) -> Self {
        Self {
            cpu,
            memory_mb,
            network_mbps,
            disk_mb,
        }
    }

    pub fn add(&mut self, other: &ResourceVector) {
        self.cpu += other.cpu;
        self.memory_mb += other.memory_mb;
        self.network_mbps += other.network_mbps;
        self.disk_mb += other.disk_mb;
    }

    pub fn subtract(&mut self, other: &ResourceVector) {
        self.cpu -= other.cpu;
        self.memory_mb -= other.memory_mb;
        self.network_mbps -= other.network_mbps;
        self.disk_mb -= other.disk_mb;
    }

    pub fn is_empty(&self) -> bool {
        self.cpu <= 0.0 && self.memory_mb <= 0.0 && self.network_mbps <= 0.0 && self.disk_mb <= 0.0
    }

    /// Per-dimension maximum, used for cluster-wide feasibility checks.
    pub fn max_with(&mut self, other: &ResourceVector) {
        self.cpu = self.cpu.max(other.cpu);
        self.memory_mb = self.memory_mb.max(other.memory_mb);
        self.network_mbps = self.network_mbps.max(other.network_mbps);
        self.disk_mb = self.disk_mb.max(other.disk_mb);
    }
}

/// Inclusive range of ports advertised by a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    pub fn count(&self) -> usize {
        if self.end < self.begin {
            0
        } else {
            (self.end - self.begin) as usize + 1
        }
    }
}

/// A resource offer from the cluster manager: one host advertising capacity.
///
/// Leases are immutable once ingested and identified by `id`. The receipt
/// time defaults to construction time and drives the expiry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLease {
    pub id: String,
    pub hostname: String,
    pub vm_id: Option<String>,
    pub offered_at: DateTime<Utc>,
    pub resources: ResourceVector,
    pub port_ranges: Vec<PortRange>,
    pub scalar_resources: HashMap<String, f64>,
    pub attributes: HashMap<String, String>,
}

impl ResourceLease {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            vm_id: None,
            offered_at: Utc::now(),
            resources: ResourceVector::default(),
            port_ranges: Vec::new(),
            scalar_resources: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceVector) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_vm_id(mut self, vm_id: impl Into<String>) -> Self {
        self.vm_id = Some(vm_id.into());
        self
    }

    pub fn with_offered_at(mut self, offered_at: DateTime<Utc>) -> Self {
        self.offered_at = offered_at;
        self
    }

    pub fn with_port_range(mut self, begin: u16, end: u16) -> Self {
        self.port_ranges.push(PortRange::new(begin, end));
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalar_resources.insert(name.into(), value);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn total_ports(&self) -> usize {
        self.port_ranges.iter().map(PortRange::count).sum()
    }
}

/// A unit of work awaiting placement.
///
/// Read-only during a round. Hard constraints disqualify hosts; soft
/// constraints contribute to the fitness score without disqualifying.
#[derive(Clone)]
pub struct TaskRequest {
    pub id: String,
    pub group_name: String,
    pub resources: ResourceVector,
    pub ports: usize,
    pub scalar_requests: HashMap<String, f64>,
    pub hard_constraints: Vec<Arc<dyn HardConstraint>>,
    pub soft_constraints: Vec<Arc<dyn SoftConstraint>>,
}

impl TaskRequest {
    pub fn new(id: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_name: group_name.into(),
            resources: ResourceVector::default(),
            ports: 0,
            scalar_requests: HashMap::new(),
            hard_constraints: Vec::new(),
            soft_constraints: Vec::new(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceVector) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_ports(mut self, ports: usize) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_scalar_request(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalar_requests.insert(name.into(), value);
        self
    }

    pub fn with_hard_constraint(mut self, constraint: Arc<dyn HardConstraint>) -> Self {
        self.hard_constraints.push(constraint);
        self
    }

    pub fn with_soft_constraint(mut self, constraint: Arc<dyn SoftConstraint>) -> Self {
        self.soft_constraints.push(constraint);
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("id", &self.id)
            .field("group_name", &self.group_name)
            .field("resources", &self.resources)
            .field("ports", &self.ports)
            .field("scalar_requests", &self.scalar_requests)
            .field("hard_constraints", &self.hard_constraints.len())
            .field("soft_constraints", &self.soft_constraints.len())
            .finish()
    }
}

/// Read-only view of a candidate host handed to constraint and fitness
/// plugins during evaluation.
#[derive(Debug, Clone)]
pub struct HostCandidate {
    pub hostname: String,
    pub attributes: Arc<HashMap<String, String>>,
    /// Free resources at evaluation time: held offers minus assignments
    /// tentatively made earlier in the current round.
    pub available: ResourceVector,
    /// Combined resources across all held offers.
    pub total: ResourceVector,
    /// Tasks previously assigned here and still running.
    pub running_tasks: Vec<Arc<TaskRequest>>,
    /// Tasks tentatively assigned here during the current round.
    pub assigned_tasks: Vec<Arc<TaskRequest>>,
}

/// A structured reason a task could not be placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignmentFailure {
    /// The host's free resources fall short in one dimension.
    ResourceShortage {
        resource: ResourceKind,
        requested: f64,
        used: f64,
        available: f64,
    },
    /// The task's group has exhausted its resource allocation.
    QuotaExceeded {
        group: String,
        resource: ResourceKind,
        limit: f64,
        used: f64,
        requested: f64,
    },
    /// No host in the cluster is large enough in one dimension.
    NoHostLargeEnough {
        resource: ResourceKind,
        requested: f64,
        largest: f64,
    },
}

impl fmt::Display for AssignmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentFailure::ResourceShortage {
                resource,
                requested,
                used,
                available,
            } => write!(
                f,
                "{}: requested {} but only {} available ({} used)",
                resource, requested, available, used
            ),
            AssignmentFailure::QuotaExceeded {
                group,
                resource,
                limit,
                used,
                requested,
            } => write!(
                f,
                "group {} quota exceeded on {}: limit {}, used {}, requested {}",
                group, resource, limit, used, requested
            ),
            AssignmentFailure::NoHostLargeEnough {
                resource,
                requested,
                largest,
            } => write!(
                f,
                "no host large enough on {}: requested {}, largest host offers {}",
                resource, requested, largest
            ),
        }
    }
}

/// A hard constraint rejection, carrying the constraint name for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintFailure {
    pub constraint: String,
    pub reason: String,
}

impl fmt::Display for ConstraintFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.constraint, self.reason)
    }
}

/// The outcome of evaluating one task against one host.
///
/// A result is successful iff every resource requirement is met and every
/// hard constraint passes. Fitness combines the plugin calculator with the
/// task's soft constraint scores and lies in `[0, 1]`.
#[derive(Clone)]
pub struct TaskAssignmentResult {
    task: Arc<TaskRequest>,
    hostname: Option<String>,
    successful: bool,
    failures: Vec<AssignmentFailure>,
    constraint_failure: Option<ConstraintFailure>,
    fitness: f64,
    assigned_ports: Vec<u16>,
    host: Option<Arc<AssignableHost>>,
}

impl TaskAssignmentResult {
    pub(crate) fn succeeded(
        task: Arc<TaskRequest>,
        host: Arc<AssignableHost>,
        fitness: f64,
        assigned_ports: Vec<u16>,
    ) -> Self {
        Self {
            task,
            hostname: Some(host.hostname().to_string()),
            successful: true,
            failures: Vec::new(),
            constraint_failure: None,
            fitness,
            assigned_ports,
            host: Some(host),
        }
    }

    pub(crate) fn failed(
        task: Arc<TaskRequest>,
        hostname: Option<String>,
        failures: Vec<AssignmentFailure>,
        constraint_failure: Option<ConstraintFailure>,
    ) -> Self {
        Self {
            task,
            hostname,
            successful: false,
            failures,
            constraint_failure,
            fitness: 0.0,
            assigned_ports: Vec::new(),
            host: None,
        }
    }

    pub fn task(&self) -> &Arc<TaskRequest> {
        &self.task
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    /// The evaluated host, or `None` for cluster-wide failures that are not
    /// tied to any particular host.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    pub fn failures(&self) -> &[AssignmentFailure] {
        &self.failures
    }

    pub fn constraint_failure(&self) -> Option<&ConstraintFailure> {
        self.constraint_failure.as_ref()
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    /// Concrete ports picked from the host's offered ranges on success.
    pub fn assigned_ports(&self) -> &[u16] {
        &self.assigned_ports
    }

    /// Record this winning result as a tentative assignment on its host so
    /// later tasks in the round see the reduced capacity.
    pub(crate) fn assign(&self) {
        if let Some(host) = &self.host {
            host.commit_tentative(self);
        }
    }

    pub(crate) fn host_handle(&self) -> Option<&Arc<AssignableHost>> {
        self.host.as_ref()
    }
}

impl fmt::Debug for TaskAssignmentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskAssignmentResult")
            .field("task_id", &self.task.id)
            .field("hostname", &self.hostname)
            .field("successful", &self.successful)
            .field("failures", &self.failures)
            .field("constraint_failure", &self.constraint_failure)
            .field("fitness", &self.fitness)
            .field("assigned_ports", &self.assigned_ports)
            .finish()
    }
}

/// All assignments made to one host during a round, together with the
/// leases the framework should use to launch them.
#[derive(Debug, Clone)]
pub struct HostAssignmentResult {
    pub hostname: String,
    pub leases_used: Vec<ResourceLease>,
    pub tasks: Vec<TaskAssignmentResult>,
}

/// The outcome of one scheduling round.
#[derive(Debug, Default)]
pub struct SchedulingResult {
    /// Successful assignments keyed by hostname.
    pub host_assignments: HashMap<String, HostAssignmentResult>,
    /// Per-task failure sets for tasks that could not be placed.
    pub task_failures: HashMap<String, Vec<TaskAssignmentResult>>,
    pub leases_added: usize,
    pub leases_rejected: usize,
    pub num_allocation_trials: usize,
    pub total_hosts: usize,
    pub idle_hosts: usize,
    pub runtime_millis: u64,
}

/// Point-in-time description of a known host, for inspection.
#[derive(Debug, Clone)]
pub struct HostCurrentState {
    pub hostname: String,
    pub vm_id: Option<String>,
    pub group: Option<String>,
    pub attributes: Arc<HashMap<String, String>>,
    pub available: ResourceVector,
    pub available_ports: usize,
    pub running_task_ids: Vec<String>,
    pub assigned_task_ids: Vec<String>,
    pub disabled_until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_vector_arithmetic() {
        let mut total = ResourceVector::new(4.0, 8192.0, 1024.0, 10_000.0);
        total.subtract(&ResourceVector::new(2.0, 4096.0, 512.0, 5_000.0));
        assert_eq!(total, ResourceVector::new(2.0, 4096.0, 512.0, 5_000.0));

        total.add(&ResourceVector::new(2.0, 4096.0, 512.0, 5_000.0));
        assert_eq!(total.cpu, 4.0);
        assert!(!total.is_empty());
        assert!(ResourceVector::default().is_empty());
    }

    #[test]
    fn resource_vector_max_is_per_dimension() {
        let mut max = ResourceVector::new(4.0, 1024.0, 0.0, 0.0);
        max.max_with(&ResourceVector::new(2.0, 8192.0, 100.0, 0.0));
        assert_eq!(max, ResourceVector::new(4.0, 8192.0, 100.0, 0.0));
    }

    #[test]
    fn port_range_counts_are_inclusive() {
        assert_eq!(PortRange::new(8000, 8000).count(), 1);
        assert_eq!(PortRange::new(8000, 8009).count(), 10);
        assert_eq!(PortRange::new(9000, 8000).count(), 0);
    }

    #[test]
    fn lease_builder_accumulates_fields() {
        let lease = ResourceLease::new("lease-1", "h1")
            .with_vm_id("vm-1")
            .with_resources(ResourceVector::new(4.0, 8192.0, 0.0, 0.0))
            .with_port_range(8000, 8009)
            .with_scalar("gpu", 2.0)
            .with_attribute("zone", "us-east-1a");

        assert_eq!(lease.total_ports(), 10);
        assert_eq!(lease.vm_id.as_deref(), Some("vm-1"));
        assert_eq!(lease.scalar_resources.get("gpu"), Some(&2.0));
        assert_eq!(lease.attributes.get("zone").unwrap(), "us-east-1a");
    }

    #[test]
    fn failure_display_names_the_dimension() {
        let failure = AssignmentFailure::ResourceShortage {
            resource: ResourceKind::Cpu,
            requested: 2.0,
            used: 3.0,
            available: 1.0,
        };
        let text = failure.to_string();
        assert!(text.contains("cpu"));
        assert!(text.contains("requested 2"));
    }
}
