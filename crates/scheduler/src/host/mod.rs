//! Per-host state and the registry of all known hosts.
//!
//! An [`AssignableHost`] aggregates the unused offers of one host into a
//! single resource view, answers "try this task here" queries, and
//! accumulates the tentative assignments of the current round. The
//! [`HostRegistry`] owns the set of hosts, the lease and vm-id indices,
//! offer expiry, and the periodic inactive-host sweep.
//!
//! Hosts are created lazily on the first offer, disable call, or assign
//! notification, and use internal locking so mutation calls from the
//! framework can overlap a scheduling round safely.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::fitness::FitnessCalculator;
use crate::tracker::TaskTrackerView;
use crate::types::{
    AssignmentFailure, ConstraintFailure, HostAssignmentResult, HostCandidate, HostCurrentState,
    PortRange, ResourceKind, ResourceLease, ResourceVector, TaskAssignmentResult, TaskRequest,
};
use crate::{LeaseRejectCallback, SchedulerError};

/// Resources a launched-but-not-yet-confirmed task holds in single-offer
/// mode, keyed by task id until the framework confirms the launch.
#[derive(Debug, Clone, Default)]
struct PendingLaunch {
    resources: ResourceVector,
    ports: usize,
    scalars: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
struct RunningEntry {
    task: Arc<TaskRequest>,
    ports: usize,
}

#[derive(Default)]
struct HostState {
    leases: Vec<ResourceLease>,
    total: ResourceVector,
    total_ports: Vec<PortRange>,
    total_scalars: HashMap<String, f64>,
    attributes: Arc<HashMap<String, String>>,
    vm_id: Option<String>,
    group: Option<String>,
    disabled_until: Option<DateTime<Utc>>,
    running: HashMap<String, RunningEntry>,
    tentative: Vec<TaskAssignmentResult>,
    tentative_used: ResourceVector,
    tentative_ports: HashSet<u16>,
    tentative_scalars: HashMap<String, f64>,
    /// Resources consumed by assignments in single-offer mode, where the
    /// standing offer is a complete view and usage is tracked internally.
    consumed: ResourceVector,
    consumed_ports: usize,
    consumed_scalars: HashMap<String, f64>,
    pending_launch: HashMap<String, PendingLaunch>,
    expire_marks: HashSet<String>,
    expire_all: bool,
}

impl HostState {
    fn recompute_totals(&mut self) {
        let mut total = ResourceVector::default();
        let mut ports = Vec::new();
        let mut scalars: HashMap<String, f64> = HashMap::new();
        for lease in &self.leases {
            total.add(&lease.resources);
            ports.extend_from_slice(&lease.port_ranges);
            for (name, value) in &lease.scalar_resources {
                *scalars.entry(name.clone()).or_default() += value;
            }
        }
        self.total = total;
        self.total_ports = ports;
        self.total_scalars = scalars;
    }

    fn available(&self) -> ResourceVector {
        let mut available = self.total;
        available.subtract(&self.tentative_used);
        available.subtract(&self.consumed);
        available
    }

    fn total_port_count(&self) -> usize {
        self.total_ports.iter().map(PortRange::count).sum()
    }

    fn available_port_count(&self) -> usize {
        self.total_port_count()
            .saturating_sub(self.tentative_ports.len())
            .saturating_sub(self.consumed_ports)
    }

    fn available_scalar(&self, name: &str) -> f64 {
        self.total_scalars.get(name).copied().unwrap_or(0.0)
            - self.tentative_scalars.get(name).copied().unwrap_or(0.0)
            - self.consumed_scalars.get(name).copied().unwrap_or(0.0)
    }

    /// Pick `count` concrete ports from the offered ranges, skipping ports
    /// already taken by this round's tentative assignments.
    fn select_ports(&self, count: usize) -> Vec<u16> {
        let mut selected = Vec::with_capacity(count);
        if count == 0 {
            return selected;
        }
        for range in &self.total_ports {
            let mut port = range.begin;
            loop {
                if !self.tentative_ports.contains(&port) {
                    selected.push(port);
                    if selected.len() == count {
                        return selected;
                    }
                }
                if port == range.end {
                    break;
                }
                port += 1;
            }
        }
        selected
    }

    fn candidate_view(&self, hostname: &str) -> HostCandidate {
        HostCandidate {
            hostname: hostname.to_string(),
            attributes: Arc::clone(&self.attributes),
            available: self.available(),
            total: self.total,
            running_tasks: self.running.values().map(|e| Arc::clone(&e.task)).collect(),
            assigned_tasks: self
                .tentative
                .iter()
                .map(|r| Arc::clone(r.task()))
                .collect(),
        }
    }

    fn recompute_group(&mut self, group_attribute: Option<&str>) {
        self.group = group_attribute.and_then(|attr| self.attributes.get(attr).cloned());
    }
}

/// One known host: its held offers, running tasks, and the tentative
/// assignments of the current round.
pub struct AssignableHost {
    hostname: String,
    state: Mutex<HostState>,
}

impl AssignableHost {
    fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub(crate) fn attributes(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.state.lock().attributes)
    }

    pub(crate) fn group(&self) -> Option<String> {
        self.state.lock().group.clone()
    }

    /// Ingest one offer. In single-offer mode a newer offer replaces the
    /// standing one and the replaced leases are returned for rejection.
    fn add_lease(
        &self,
        lease: ResourceLease,
        single_offer: bool,
        group_attribute: Option<&str>,
    ) -> Vec<ResourceLease> {
        let mut state = self.state.lock();
        let mut replaced = Vec::new();
        if single_offer && !state.leases.is_empty() {
            replaced = mem::take(&mut state.leases);
        }
        if lease.vm_id.is_some() {
            state.vm_id = lease.vm_id.clone();
        }
        if !lease.attributes.is_empty() {
            let mut merged = (*state.attributes).clone();
            for (name, value) in &lease.attributes {
                merged.insert(name.clone(), value.clone());
            }
            state.attributes = Arc::new(merged);
        }
        state.leases.push(lease);
        state.recompute_totals();
        state.recompute_group(group_attribute);
        replaced
    }

    fn mark_lease_expired(&self, lease_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.leases.iter().any(|l| l.id == lease_id) {
            state.expire_marks.insert(lease_id.to_string());
            true
        } else {
            false
        }
    }

    fn mark_all_leases_expired(&self) {
        self.state.lock().expire_all = true;
    }

    /// Drop leases that were explicitly marked for expiry or are older
    /// than the expiry window. Returns the removed leases so the caller
    /// can run the rejection callback and clean its indices.
    ///
    /// Age-based expiry does not apply in single-offer mode, where the
    /// standing offer is the host's complete capacity view.
    fn apply_expiry(
        &self,
        now: DateTime<Utc>,
        expiry_secs: u64,
        single_offer: bool,
    ) -> Vec<ResourceLease> {
        let mut state = self.state.lock();
        let expire_all = mem::take(&mut state.expire_all);
        let marks = mem::take(&mut state.expire_marks);
        let cutoff = Duration::seconds(expiry_secs as i64);

        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for lease in mem::take(&mut state.leases) {
            let stale = !single_offer && now - lease.offered_at > cutoff;
            if expire_all || marks.contains(&lease.id) || stale {
                removed.push(lease);
            } else {
                kept.push(lease);
            }
        }
        state.leases = kept;
        if !removed.is_empty() {
            state.recompute_totals();
        }
        removed
    }

    /// Expire every held lease immediately, returning them for rejection.
    fn take_all_leases(&self) -> Vec<ResourceLease> {
        let mut state = self.state.lock();
        let removed = mem::take(&mut state.leases);
        if !removed.is_empty() {
            state.recompute_totals();
        }
        removed
    }

    /// Whether the host may receive tasks right now: enabled, in an active
    /// group, and holding any capacity.
    fn is_active(&self, now: DateTime<Utc>, active_groups: Option<&HashSet<String>>) -> bool {
        let state = self.state.lock();
        if let Some(until) = state.disabled_until {
            if until > now {
                return false;
            }
        }
        if let Some(groups) = active_groups {
            match &state.group {
                Some(group) if groups.contains(group) => {}
                _ => return false,
            }
        }
        !state.available().is_empty() || state.available_port_count() > 0
    }

    /// Evaluate one task against this host's current free capacity.
    pub(crate) fn try_task(
        self: &Arc<Self>,
        task: &Arc<TaskRequest>,
        fitness: &dyn FitnessCalculator,
        tracker: &TaskTrackerView,
    ) -> TaskAssignmentResult {
        let state = self.state.lock();
        let available = state.available();
        let mut failures = Vec::new();

        let dimensions = [
            (ResourceKind::Cpu, task.resources.cpu, available.cpu, state.total.cpu),
            (
                ResourceKind::MemoryMb,
                task.resources.memory_mb,
                available.memory_mb,
                state.total.memory_mb,
            ),
            (
                ResourceKind::NetworkMbps,
                task.resources.network_mbps,
                available.network_mbps,
                state.total.network_mbps,
            ),
            (
                ResourceKind::DiskMb,
                task.resources.disk_mb,
                available.disk_mb,
                state.total.disk_mb,
            ),
        ];
        for (resource, requested, avail, total) in dimensions {
            if requested > avail {
                failures.push(AssignmentFailure::ResourceShortage {
                    resource,
                    requested,
                    used: total - avail,
                    available: avail,
                });
            }
        }

        let selected_ports = state.select_ports(task.ports);
        if selected_ports.len() < task.ports {
            failures.push(AssignmentFailure::ResourceShortage {
                resource: ResourceKind::Ports,
                requested: task.ports as f64,
                used: (state.total_port_count() - state.available_port_count()) as f64,
                available: state.available_port_count() as f64,
            });
        }

        for (name, requested) in &task.scalar_requests {
            let avail = state.available_scalar(name);
            if *requested > avail {
                failures.push(AssignmentFailure::ResourceShortage {
                    resource: ResourceKind::Other(name.clone()),
                    requested: *requested,
                    used: state.total_scalars.get(name).copied().unwrap_or(0.0) - avail,
                    available: avail,
                });
            }
        }

        if !failures.is_empty() {
            return TaskAssignmentResult::failed(
                Arc::clone(task),
                Some(self.hostname.clone()),
                failures,
                None,
            );
        }

        let candidate = state.candidate_view(&self.hostname);
        for constraint in &task.hard_constraints {
            let result = constraint.evaluate(task, &candidate, tracker);
            if !result.passed {
                return TaskAssignmentResult::failed(
                    Arc::clone(task),
                    Some(self.hostname.clone()),
                    Vec::new(),
                    Some(ConstraintFailure {
                        constraint: constraint.name().to_string(),
                        reason: result.reason.unwrap_or_default(),
                    }),
                );
            }
        }

        let raw = fitness.calculate(task, &candidate, tracker);
        let soft_total: f64 = task
            .soft_constraints
            .iter()
            .map(|c| c.score(task, &candidate, tracker))
            .sum();
        let combined =
            ((raw + soft_total) / (1.0 + task.soft_constraints.len() as f64)).clamp(0.0, 1.0);

        TaskAssignmentResult::succeeded(Arc::clone(task), Arc::clone(self), combined, selected_ports)
    }

    /// Record a winning result as a tentative assignment of this round.
    pub(crate) fn commit_tentative(&self, result: &TaskAssignmentResult) {
        let mut state = self.state.lock();
        let task = result.task();
        state.tentative_used.add(&task.resources);
        for port in result.assigned_ports() {
            state.tentative_ports.insert(*port);
        }
        for (name, value) in &task.scalar_requests {
            *state.tentative_scalars.entry(name.clone()).or_default() += value;
        }
        state.tentative.push(result.clone());
    }

    /// Atomically take the round's accumulated assignments and clear the
    /// tentative list. Returns the per-host result (or `None`) along with
    /// the ids of leases handed over to the framework.
    pub(crate) fn reset_and_take_assignments(
        &self,
        single_offer: bool,
    ) -> (Option<HostAssignmentResult>, Vec<String>) {
        let mut state = self.state.lock();
        let tasks = mem::take(&mut state.tentative);
        state.tentative_used = ResourceVector::default();
        state.tentative_ports.clear();
        state.tentative_scalars.clear();
        if tasks.is_empty() {
            return (None, Vec::new());
        }

        let mut released = Vec::new();
        let leases_used = if single_offer {
            // Usage transfers to the internal accounting until the
            // framework confirms each launch via the task assigner.
            for result in &tasks {
                let task = result.task();
                state.consumed.add(&task.resources);
                state.consumed_ports += result.assigned_ports().len();
                for (name, value) in &task.scalar_requests {
                    *state.consumed_scalars.entry(name.clone()).or_default() += value;
                }
                state.pending_launch.insert(
                    task.id.clone(),
                    PendingLaunch {
                        resources: task.resources,
                        ports: result.assigned_ports().len(),
                        scalars: task.scalar_requests.clone(),
                    },
                );
            }
            state.leases.clone()
        } else {
            let handed_over = mem::take(&mut state.leases);
            released = handed_over.iter().map(|l| l.id.clone()).collect();
            state.recompute_totals();
            handed_over
        };

        (
            Some(HostAssignmentResult {
                hostname: self.hostname.clone(),
                leases_used,
                tasks,
            }),
            released,
        )
    }

    pub(crate) fn has_previously_assigned_tasks(&self) -> bool {
        !self.state.lock().running.is_empty()
    }

    pub(crate) fn has_leases(&self) -> bool {
        !self.state.lock().leases.is_empty()
    }

    /// Notification that a task selected in an earlier round is now running
    /// here, or that state is being reconstructed after a restart.
    pub(crate) fn assign_running(&self, task: Arc<TaskRequest>, single_offer: bool) {
        let mut state = self.state.lock();
        let pending = state.pending_launch.remove(&task.id);
        let ports = pending.as_ref().map(|p| p.ports).unwrap_or(0);
        if single_offer && pending.is_none() {
            // Not part of a handed-over round result, so the standing
            // offer has not accounted for it yet.
            state.consumed.add(&task.resources);
            for (name, value) in &task.scalar_requests {
                *state.consumed_scalars.entry(name.clone()).or_default() += value;
            }
        }
        state
            .running
            .insert(task.id.clone(), RunningEntry { task, ports });
    }

    pub(crate) fn unassign_running(&self, task_id: &str, single_offer: bool) -> bool {
        let mut state = self.state.lock();
        let removed = state.running.remove(task_id);
        match removed {
            Some(entry) => {
                if single_offer {
                    state.consumed.subtract(&entry.task.resources);
                    state.consumed_ports = state.consumed_ports.saturating_sub(entry.ports);
                    for (name, value) in &entry.task.scalar_requests {
                        if let Some(consumed) = state.consumed_scalars.get_mut(name) {
                            *consumed -= value;
                        }
                    }
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn disable_until(&self, until: DateTime<Utc>) {
        self.state.lock().disabled_until = Some(until);
    }

    pub(crate) fn enable(&self) {
        self.state.lock().disabled_until = None;
    }

    /// Whether the periodic sweep may drop this host record.
    fn is_purgeable(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        state.leases.is_empty()
            && state.running.is_empty()
            && state.tentative.is_empty()
            && state.pending_launch.is_empty()
            && state.disabled_until.map_or(true, |until| until <= now)
    }

    fn set_group_attribute(&self, group_attribute: Option<&str>) {
        self.state.lock().recompute_group(group_attribute);
    }

    fn resource_status(&self, single_offer: bool) -> HashMap<ResourceKind, [f64; 2]> {
        let state = self.state.lock();
        // In single-offer mode usage is tracked internally against the
        // standing offer; otherwise offers already exclude running tasks
        // and usage is the sum of what runs here.
        let mut used = ResourceVector::default();
        let used_ports: usize;
        if single_offer {
            used = state.consumed;
            used_ports = state.consumed_ports;
        } else {
            for entry in state.running.values() {
                used.add(&entry.task.resources);
            }
            used_ports = state.running.values().map(|e| e.ports).sum();
        }
        let available = state.available();
        let mut status = HashMap::new();
        status.insert(ResourceKind::Cpu, [used.cpu, available.cpu]);
        status.insert(ResourceKind::MemoryMb, [used.memory_mb, available.memory_mb]);
        status.insert(
            ResourceKind::NetworkMbps,
            [used.network_mbps, available.network_mbps],
        );
        status.insert(ResourceKind::DiskMb, [used.disk_mb, available.disk_mb]);
        status.insert(
            ResourceKind::Ports,
            [used_ports as f64, state.available_port_count() as f64],
        );
        status
    }

    fn current_state(&self) -> HostCurrentState {
        let state = self.state.lock();
        HostCurrentState {
            hostname: self.hostname.clone(),
            vm_id: state.vm_id.clone(),
            group: state.group.clone(),
            attributes: Arc::clone(&state.attributes),
            available: state.available(),
            available_ports: state.available_port_count(),
            running_task_ids: state.running.keys().cloned().collect(),
            assigned_task_ids: state.tentative.iter().map(|r| r.task_id().to_string()).collect(),
            disabled_until: state.disabled_until,
        }
    }

    fn total_resources(&self) -> (ResourceVector, usize, HashMap<String, f64>) {
        let state = self.state.lock();
        (
            state.total,
            state.total_port_count(),
            state.total_scalars.clone(),
        )
    }
}

/// Per-dimension maxima across all known hosts, for the cluster-wide
/// feasibility pre-check.
#[derive(Debug, Default)]
pub(crate) struct ClusterMaxima {
    resources: ResourceVector,
    ports: usize,
    scalars: HashMap<String, f64>,
}

impl ClusterMaxima {
    fn observe(&mut self, host: &AssignableHost) {
        let (total, ports, scalars) = host.total_resources();
        self.resources.max_with(&total);
        self.ports = self.ports.max(ports);
        for (name, value) in scalars {
            let entry = self.scalars.entry(name).or_default();
            if value > *entry {
                *entry = value;
            }
        }
    }

    /// The first dimension in which no host could ever satisfy the task,
    /// if any.
    pub(crate) fn failed_max_resource(&self, task: &TaskRequest) -> Option<AssignmentFailure> {
        let checks = [
            (ResourceKind::Cpu, task.resources.cpu, self.resources.cpu),
            (
                ResourceKind::MemoryMb,
                task.resources.memory_mb,
                self.resources.memory_mb,
            ),
            (
                ResourceKind::NetworkMbps,
                task.resources.network_mbps,
                self.resources.network_mbps,
            ),
            (
                ResourceKind::DiskMb,
                task.resources.disk_mb,
                self.resources.disk_mb,
            ),
        ];
        for (resource, requested, largest) in checks {
            if requested > largest {
                return Some(AssignmentFailure::NoHostLargeEnough {
                    resource,
                    requested,
                    largest,
                });
            }
        }
        if task.ports > self.ports {
            return Some(AssignmentFailure::NoHostLargeEnough {
                resource: ResourceKind::Ports,
                requested: task.ports as f64,
                largest: self.ports as f64,
            });
        }
        for (name, requested) in &task.scalar_requests {
            let largest = self.scalars.get(name).copied().unwrap_or(0.0);
            if *requested > largest {
                return Some(AssignmentFailure::NoHostLargeEnough {
                    resource: ResourceKind::Other(name.clone()),
                    requested: *requested,
                    largest,
                });
            }
        }
        None
    }
}

/// The set of known hosts plus the lease and vm-id indices.
pub(crate) struct HostRegistry {
    hosts: DashMap<String, Arc<AssignableHost>>,
    lease_ids: DashMap<String, String>,
    vm_ids: DashMap<String, String>,
    group_attribute: RwLock<Option<String>>,
    active_groups: RwLock<Option<HashSet<String>>>,
    single_offer: bool,
    lease_expiry_secs: u64,
    lease_reject: LeaseRejectCallback,
}

impl HostRegistry {
    pub(crate) fn new(
        single_offer: bool,
        lease_expiry_secs: u64,
        lease_reject: LeaseRejectCallback,
    ) -> Self {
        Self {
            hosts: DashMap::new(),
            lease_ids: DashMap::new(),
            vm_ids: DashMap::new(),
            group_attribute: RwLock::new(None),
            active_groups: RwLock::new(None),
            single_offer,
            lease_expiry_secs,
            lease_reject,
        }
    }

    fn get_or_create(&self, hostname: &str) -> Arc<AssignableHost> {
        self.hosts
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(AssignableHost::new(hostname)))
            .clone()
    }

    pub(crate) fn get(&self, hostname: &str) -> Option<Arc<AssignableHost>> {
        self.hosts.get(hostname).map(|entry| entry.value().clone())
    }

    pub(crate) fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Ingest a batch of new offers. A duplicate lease id fails with a
    /// state error; offers earlier in the batch stay ingested. Returns the
    /// number of offers rejected on the way in.
    pub(crate) fn add_leases(
        &self,
        leases: Vec<ResourceLease>,
    ) -> Result<usize, SchedulerError> {
        let group_attribute = self.group_attribute.read().clone();
        let mut rejected = 0;
        for lease in leases {
            if self.lease_ids.contains_key(&lease.id) {
                return Err(SchedulerError::DuplicateLease(lease.id));
            }
            if let Some(vm_id) = &lease.vm_id {
                self.vm_ids.insert(vm_id.clone(), lease.hostname.clone());
            }
            let host = self.get_or_create(&lease.hostname);
            let lease_id = lease.id.clone();
            let hostname = lease.hostname.clone();
            let replaced = host.add_lease(lease, self.single_offer, group_attribute.as_deref());
            self.lease_ids.insert(lease_id, hostname.clone());
            for old in replaced {
                debug!(
                    "Replacing standing offer {} on {} with a newer one",
                    old.id, hostname
                );
                self.lease_ids.remove(&old.id);
                (self.lease_reject)(&old);
                rejected += 1;
            }
        }
        Ok(rejected)
    }

    /// Apply pending expiries, then return the active candidate hosts in a
    /// deterministic order together with the cluster-wide maxima.
    pub(crate) fn prepare_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> (Vec<Arc<AssignableHost>>, ClusterMaxima) {
        let all_hosts: Vec<Arc<AssignableHost>> = self
            .hosts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let active_groups = self.active_groups.read().clone();

        let mut candidates = Vec::new();
        let mut maxima = ClusterMaxima::default();
        for host in all_hosts {
            let expired = host.apply_expiry(now, self.lease_expiry_secs, self.single_offer);
            for lease in &expired {
                debug!("Expiring lease {} on {}", lease.id, host.hostname());
                self.lease_ids.remove(&lease.id);
                (self.lease_reject)(lease);
            }
            maxima.observe(&host);
            if host.is_active(now, active_groups.as_ref()) {
                candidates.push(host);
            }
        }
        candidates.sort_by(|a, b| a.hostname().cmp(b.hostname()));
        (candidates, maxima)
    }

    /// Reject the offers of idle hosts beyond each group's max idle cap.
    /// Hosts without a group or without a cap keep their offers.
    pub(crate) fn remove_idle_leases(
        &self,
        idle_hosts: &[Arc<AssignableHost>],
        max_idle_by_group: &HashMap<String, usize>,
    ) -> usize {
        let mut idle_count: HashMap<String, usize> = HashMap::new();
        let mut rejected = 0;
        for host in idle_hosts {
            let group = match host.group() {
                Some(group) => group,
                None => continue,
            };
            let cap = match max_idle_by_group.get(&group) {
                Some(cap) => *cap,
                None => continue,
            };
            let seen = idle_count.entry(group.clone()).or_default();
            *seen += 1;
            if *seen > cap {
                for lease in host.take_all_leases() {
                    info!(
                        "Rejecting idle offer {} on {} (group {} above idle cap)",
                        lease.id,
                        host.hostname(),
                        group
                    );
                    self.lease_ids.remove(&lease.id);
                    (self.lease_reject)(&lease);
                    rejected += 1;
                }
            }
        }
        rejected
    }

    /// Drop host records that have no offers, no tasks, and no disable
    /// hold.
    pub(crate) fn purge_inactive(&self, now: DateTime<Utc>) {
        let purgeable: Vec<String> = self
            .hosts
            .iter()
            .filter(|entry| entry.value().is_purgeable(now))
            .map(|entry| entry.key().clone())
            .collect();
        for hostname in purgeable {
            debug!("Purging inactive host {}", hostname);
            self.hosts.remove(&hostname);
            self.vm_ids.retain(|_, host| host != &hostname);
        }
    }

    /// Remove handed-over lease ids from the index after a round returns
    /// them to the framework.
    pub(crate) fn release_leases(&self, lease_ids: &[String]) {
        for id in lease_ids {
            self.lease_ids.remove(id);
        }
    }

    pub(crate) fn mark_lease_expired(&self, lease_id: &str) {
        if let Some(hostname) = self.lease_ids.get(lease_id).map(|e| e.value().clone()) {
            if let Some(host) = self.get(&hostname) {
                host.mark_lease_expired(lease_id);
            }
        }
    }

    pub(crate) fn mark_all_leases_expired_for(&self, hostname: &str) {
        if let Some(host) = self.get(hostname) {
            host.mark_all_leases_expired();
        }
    }

    pub(crate) fn mark_all_leases_expired(&self) {
        for entry in self.hosts.iter() {
            entry.value().mark_all_leases_expired();
        }
    }

    pub(crate) fn hostname_for_vm_id(&self, vm_id: &str) -> Option<String> {
        self.vm_ids.get(vm_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn disable_until(&self, hostname: &str, until: DateTime<Utc>) {
        self.get_or_create(hostname).disable_until(until);
    }

    pub(crate) fn enable(&self, hostname: &str) {
        if let Some(host) = self.get(hostname) {
            host.enable();
        }
    }

    pub(crate) fn assign_running(
        &self,
        task: Arc<TaskRequest>,
        hostname: &str,
    ) -> Arc<HashMap<String, String>> {
        let host = self.get_or_create(hostname);
        host.assign_running(task, self.single_offer);
        host.attributes()
    }

    pub(crate) fn unassign_running(&self, task_id: &str, hostname: &str) {
        if let Some(host) = self.get(hostname) {
            if !host.unassign_running(task_id, self.single_offer) {
                debug!("Unassign for task {} not running on {}", task_id, hostname);
            }
        }
    }

    pub(crate) fn set_group_attribute(&self, name: &str) {
        *self.group_attribute.write() = Some(name.to_string());
        for entry in self.hosts.iter() {
            entry.value().set_group_attribute(Some(name));
        }
    }

    pub(crate) fn set_active_groups(&self, groups: Option<Vec<String>>) {
        *self.active_groups.write() = groups.map(|list| list.into_iter().collect());
    }

    pub(crate) fn resource_status(&self) -> HashMap<String, HashMap<ResourceKind, [f64; 2]>> {
        self.hosts
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().resource_status(self.single_offer),
                )
            })
            .collect()
    }

    pub(crate) fn host_states(&self) -> Vec<HostCurrentState> {
        let mut states: Vec<HostCurrentState> = self
            .hosts
            .iter()
            .map(|entry| entry.value().current_state())
            .collect();
        states.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        states
    }
}
