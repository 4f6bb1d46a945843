//! Task-to-host assignment engine for two-level cluster schedulers.
//!
//! A higher-level framework receives resource offers from a cluster
//! manager and holds a queue of pending tasks. Each call to
//! [`TaskScheduler::schedule_once`] answers one question: given the pool
//! of unused offers plus any newly arrived ones, and an ordered list of
//! pending tasks, which task goes on which host, and which offers remain
//! unused.
//!
//! The engine is an in-process library. It does not launch or kill tasks,
//! persist state, or optimize globally across a round: assignment is
//! greedy in task order, with earlier tasks seeing the full cluster and
//! later tasks seeing capacity reduced by earlier tentative assignments.
//!
//! Unused offers are stored between rounds and rejected through the
//! configured callback once they outlive the expiry window, so the engine
//! never hoards capacity. When a task that was selected in an earlier
//! round actually launches, notify the engine through
//! [`TaskScheduler::task_assigner`]; when it terminates, through
//! [`TaskScheduler::task_unassigner`]. Those notifications feed the
//! placement state that constraint and fitness plugins see.
//!
//! Do not call the scheduler concurrently: a second entry fails fast with
//! [`SchedulerError::ConcurrentAccess`] instead of blocking.

pub mod autoscale;
pub mod constraints;
pub mod fitness;
mod host;
pub mod quota;
mod state;
pub mod tracker;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::autoscale::{AutoScaler, AutoScalerInput, IdleHostInfo};
use crate::host::{AssignableHost, HostRegistry};
use crate::quota::QuotaEvaluator;
use crate::state::StateMonitor;
use crate::tracker::TaskTracker;

pub use crate::autoscale::{AutoScaleAction, AutoScaleRule};
pub use crate::fitness::{
    CpuBinPacker, CpuMemNetworkBinPacker, DefaultFitnessCalculator, FitnessCalculator,
    MemoryBinPacker,
};
pub use crate::quota::ResAllocs;
pub use crate::tracker::{TaskTrackerView, TrackedTask};
pub use crate::types::{
    AssignmentFailure, ConstraintFailure, HostAssignmentResult, HostCandidate, HostCurrentState,
    PortRange, ResourceKind, ResourceLease, ResourceVector, SchedulingResult,
    TaskAssignmentResult, TaskRequest,
};

/// Minimum number of candidate hosts one evaluation worker is worth.
const PARALLEL_SCHED_EVAL_MIN_BATCH_SIZE: usize = 30;

/// Hosts a worker drains from the shared queue at a time. Too small and
/// workers contend on the queue; too large and early termination leaves
/// more wasted trials behind.
const EVAL_CHUNK_SIZE: usize = 10;

const PURGE_HOSTS_INTERVAL_SECS: u64 = 60;

/// Invoked for every offer the engine rejects: expired, idle beyond the
/// group cap, replaced, or explicitly expired by the framework.
pub type LeaseRejectCallback = Arc<dyn Fn(&ResourceLease) + Send + Sync>;

/// Invoked with each scale-up or scale-down signal.
pub type AutoScaleCallback = Arc<dyn Fn(AutoScaleAction) + Send + Sync>;

/// Decides whether a fitness value is good enough to stop searching for a
/// better host. The default never says yes, producing an exhaustive
/// search.
pub type FitnessGoodEnoughFn = Arc<dyn Fn(f64) -> bool + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    /// A scheduling round or guarded operation is already in progress.
    #[error("scheduler state is busy; concurrent entry is not allowed")]
    ConcurrentAccess,

    /// An offer with this id is already held.
    #[error("lease {0} is already known; offers earlier in the batch may have been ingested")]
    DuplicateLease(String),

    #[error("invalid autoscale rule: {0}")]
    InvalidAutoScaleRule(String),

    /// Autoscaling operations require the scale-by attribute name.
    #[error("autoscaling is not configured; set the scale-by attribute name first")]
    AutoScalerNotConfigured,
}

/// Validated configuration of a [`TaskScheduler`].
///
/// Construct with the required lease reject callback, chain `with_*`
/// methods for the rest. Cross-field constraints are checked once in
/// [`TaskScheduler::new`].
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Seconds an unused offer is retained before rejection.
    pub lease_offer_expiry_secs: u64,
    /// Offers are a complete per-host view rather than incremental deltas.
    pub single_offer_per_host: bool,
    /// Skip the shortfall evaluation when sizing scale-up requests.
    pub disable_shortfall_evaluation: bool,
    /// Host attribute naming the autoscaling group. Required before any
    /// autoscale rule or callback may be configured.
    pub auto_scale_by_attribute_name: Option<String>,
    /// Host attribute that, when present, overrides the hostname as the
    /// identifier handed to scale-down actions.
    pub auto_scaler_map_hostname_attribute_name: Option<String>,
    /// Attribute whose values scale-down keeps balanced.
    pub auto_scale_down_balanced_by_attribute_name: Option<String>,
    pub auto_scale_rules: Vec<AutoScaleRule>,
    pub initial_res_allocs: HashMap<String, ResAllocs>,
    pub fitness_calculator: Arc<dyn FitnessCalculator>,
    pub is_fitness_good_enough: FitnessGoodEnoughFn,
    pub lease_reject_callback: LeaseRejectCallback,
    pub autoscaler_callback: Option<AutoScaleCallback>,
}

impl SchedulerConfig {
    pub fn new(lease_reject_callback: LeaseRejectCallback) -> Self {
        Self {
            lease_offer_expiry_secs: 120,
            single_offer_per_host: false,
            disable_shortfall_evaluation: false,
            auto_scale_by_attribute_name: None,
            auto_scaler_map_hostname_attribute_name: None,
            auto_scale_down_balanced_by_attribute_name: None,
            auto_scale_rules: Vec::new(),
            initial_res_allocs: HashMap::new(),
            fitness_calculator: Arc::new(DefaultFitnessCalculator),
            is_fitness_good_enough: Arc::new(|fitness| fitness > 1.0),
            lease_reject_callback,
            autoscaler_callback: None,
        }
    }

    pub fn with_lease_offer_expiry_secs(mut self, secs: u64) -> Self {
        self.lease_offer_expiry_secs = secs;
        self
    }

    pub fn with_single_offer_per_host(mut self, single: bool) -> Self {
        self.single_offer_per_host = single;
        self
    }

    pub fn with_disabled_shortfall_evaluation(mut self) -> Self {
        self.disable_shortfall_evaluation = true;
        self
    }

    pub fn with_auto_scale_by_attribute_name(mut self, name: impl Into<String>) -> Self {
        self.auto_scale_by_attribute_name = Some(name.into());
        self
    }

    pub fn with_auto_scaler_map_hostname_attribute_name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.auto_scaler_map_hostname_attribute_name = Some(name.into());
        self
    }

    pub fn with_auto_scale_down_balanced_by_attribute_name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.auto_scale_down_balanced_by_attribute_name = Some(name.into());
        self
    }

    pub fn with_auto_scale_rule(mut self, rule: AutoScaleRule) -> Self {
        self.auto_scale_rules.push(rule);
        self
    }

    pub fn with_initial_res_allocs(mut self, allocs: HashMap<String, ResAllocs>) -> Self {
        self.initial_res_allocs = allocs;
        self
    }

    pub fn with_fitness_calculator(mut self, calculator: Arc<dyn FitnessCalculator>) -> Self {
        self.fitness_calculator = calculator;
        self
    }

    pub fn with_fitness_good_enough(mut self, predicate: FitnessGoodEnoughFn) -> Self {
        self.is_fitness_good_enough = predicate;
        self
    }

    pub fn with_autoscaler_callback(mut self, callback: AutoScaleCallback) -> Self {
        self.autoscaler_callback = Some(callback);
        self
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("lease_offer_expiry_secs", &self.lease_offer_expiry_secs)
            .field("single_offer_per_host", &self.single_offer_per_host)
            .field(
                "disable_shortfall_evaluation",
                &self.disable_shortfall_evaluation,
            )
            .field(
                "auto_scale_by_attribute_name",
                &self.auto_scale_by_attribute_name,
            )
            .field("auto_scale_rules", &self.auto_scale_rules)
            .field("initial_res_allocs", &self.initial_res_allocs)
            .field("fitness_calculator", &self.fitness_calculator.name())
            .finish()
    }
}

struct SchedulerInner {
    registry: HostRegistry,
    tracker: Arc<TaskTracker>,
    quota: QuotaEvaluator,
    autoscaler: Option<Arc<AutoScaler>>,
    monitor: StateMonitor,
    fitness_calculator: Arc<dyn FitnessCalculator>,
    is_fitness_good_enough: FitnessGoodEnoughFn,
    single_offer: bool,
    max_eval_workers: usize,
    last_purge_at: Mutex<Instant>,
}

/// The scheduling engine. One instance per framework; rounds are strictly
/// serialized.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Build a scheduler from a configuration record, validating
    /// cross-field constraints.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        for rule in &config.auto_scale_rules {
            rule.validate()?;
        }
        let scaling_configured = config.auto_scale_by_attribute_name.is_some();
        if !scaling_configured
            && (!config.auto_scale_rules.is_empty() || config.autoscaler_callback.is_some())
        {
            return Err(SchedulerError::AutoScalerNotConfigured);
        }

        let autoscaler = if scaling_configured {
            let scaler = Arc::new(AutoScaler::new(
                config.auto_scale_rules.clone(),
                config.auto_scaler_map_hostname_attribute_name.clone(),
                config.auto_scale_down_balanced_by_attribute_name.clone(),
                config.disable_shortfall_evaluation,
            ));
            if let Some(callback) = &config.autoscaler_callback {
                scaler.set_callback(Arc::clone(callback));
            }
            Some(scaler)
        } else {
            None
        };

        let registry = HostRegistry::new(
            config.single_offer_per_host,
            config.lease_offer_expiry_secs,
            Arc::clone(&config.lease_reject_callback),
        );
        if let Some(attribute) = &config.auto_scale_by_attribute_name {
            registry.set_group_attribute(attribute);
        }

        let max_eval_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                registry,
                tracker: Arc::new(TaskTracker::new()),
                quota: QuotaEvaluator::new(config.initial_res_allocs),
                autoscaler,
                monitor: StateMonitor::new(),
                fitness_calculator: config.fitness_calculator,
                is_fitness_good_enough: config.is_fitness_good_enough,
                single_offer: config.single_offer_per_host,
                max_eval_workers,
                last_purge_at: Mutex::new(Instant::now()),
            }),
        })
    }

    /// Run one scheduling round: ingest `new_leases`, match `requests`
    /// against the host pool in order, and report assignments, failures,
    /// and round counters.
    ///
    /// Fails fast with [`SchedulerError::ConcurrentAccess`] on concurrent
    /// entry and with [`SchedulerError::DuplicateLease`] on an offer id
    /// collision; in the latter case offers earlier in the batch stay
    /// ingested.
    pub async fn schedule_once(
        &self,
        requests: Vec<TaskRequest>,
        new_leases: Vec<ResourceLease>,
    ) -> Result<SchedulingResult, SchedulerError> {
        let _guard = self.inner.monitor.enter()?;
        let start = Instant::now();

        let mut result = self.do_schedule(requests, new_leases).await?;

        let purge_due = {
            let mut last_purge = self.inner.last_purge_at.lock();
            if last_purge.elapsed() >= Duration::from_secs(PURGE_HOSTS_INTERVAL_SECS) {
                *last_purge = Instant::now();
                true
            } else {
                false
            }
        };
        if purge_due {
            info!("Purging inactive hosts");
            self.inner.registry.purge_inactive(Utc::now());
        }

        result.runtime_millis = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn do_schedule(
        &self,
        requests: Vec<TaskRequest>,
        new_leases: Vec<ResourceLease>,
    ) -> Result<SchedulingResult, SchedulerError> {
        let inner = &self.inner;
        let now = Utc::now();

        let mut result = SchedulingResult {
            leases_added: new_leases.len(),
            ..Default::default()
        };
        let mut leases_rejected = inner.registry.add_leases(new_leases)?;

        let (candidates, maxima) = inner.registry.prepare_candidates(now);
        debug!("Scheduling round with {} candidate host(s)", candidates.len());

        let tracker_view = inner.tracker.view();
        let has_res_allocs = inner.quota.prepare(&tracker_view);

        let tasks: Vec<Arc<TaskRequest>> = requests.into_iter().map(Arc::new).collect();
        // Tasks still worth scaling up for: placement failures count,
        // quota refusals and successes do not.
        let mut autoscale_eligible = vec![true; tasks.len()];

        if !candidates.is_empty() {
            for (index, task) in tasks.iter().enumerate() {
                if has_res_allocs {
                    if inner.quota.group_exhausted(&task.group_name) {
                        autoscale_eligible[index] = false;
                        continue;
                    }
                    if let Some(failure) = inner.quota.check(task) {
                        result.task_failures.insert(
                            task.id.clone(),
                            vec![TaskAssignmentResult::failed(
                                Arc::clone(task),
                                None,
                                vec![failure],
                                None,
                            )],
                        );
                        autoscale_eligible[index] = false;
                        continue;
                    }
                }

                if let Some(failure) = maxima.failed_max_resource(task) {
                    result.task_failures.insert(
                        task.id.clone(),
                        vec![TaskAssignmentResult::failed(
                            Arc::clone(task),
                            None,
                            vec![failure],
                            None,
                        )],
                    );
                    continue;
                }

                let (task_results, trials) = self.eval_in_parallel(task, &candidates).await;
                result.num_allocation_trials += trials;

                match best_successful(&task_results) {
                    Some(best_index) => {
                        let winning = &task_results[best_index];
                        winning.assign();
                        if let Some(host) = winning.host_handle() {
                            inner.tracker.add_assigned(
                                Arc::clone(task),
                                host.hostname(),
                                host.attributes(),
                            );
                        }
                        if has_res_allocs {
                            inner.quota.commit(task);
                        }
                        autoscale_eligible[index] = false;
                    }
                    None => {
                        result.task_failures.insert(task.id.clone(), task_results);
                    }
                }
            }
        }

        let mut idle_hosts = Vec::new();
        let mut idle_host_info = Vec::new();
        for host in &candidates {
            let (assignment, released) = host.reset_and_take_assignments(inner.single_offer);
            match assignment {
                Some(host_result) => {
                    for task_result in &host_result.tasks {
                        inner.tracker.remove_assigned(task_result.task_id());
                    }
                    inner.registry.release_leases(&released);
                    result
                        .host_assignments
                        .insert(host_result.hostname.clone(), host_result);
                }
                None => {
                    if !host.has_previously_assigned_tasks() {
                        idle_host_info.push(IdleHostInfo {
                            hostname: host.hostname().to_string(),
                            group: host.group(),
                            attributes: host.attributes(),
                        });
                        idle_hosts.push(Arc::clone(host));
                    }
                }
            }
        }
        result.idle_hosts = idle_hosts.len();

        if let Some(autoscaler) = &inner.autoscaler {
            leases_rejected += inner
                .registry
                .remove_idle_leases(&idle_hosts, &autoscaler.max_idle_by_group());

            let unplaced_by_group =
                attribute_unplaced_tasks(&tasks, &autoscale_eligible, &result, &candidates);
            autoscaler.schedule_evaluation(AutoScalerInput {
                idle_hosts: idle_host_info,
                unplaced_by_group,
            });
        }

        result.leases_rejected = leases_rejected;
        result.total_hosts = inner.registry.host_count();
        Ok(result)
    }

    /// Walk the candidate hosts for one task in parallel worker chunks.
    /// Worker panics out of plugin code are contained: that worker's
    /// partial results are dropped and the round continues.
    async fn eval_in_parallel(
        &self,
        task: &Arc<TaskRequest>,
        candidates: &[Arc<AssignableHost>],
    ) -> (Vec<TaskAssignmentResult>, usize) {
        let inner = &self.inner;
        let queue = Arc::new(SegQueue::new());
        for host in candidates {
            queue.push(Arc::clone(host));
        }

        let worker_count = candidates
            .len()
            .div_ceil(PARALLEL_SCHED_EVAL_MIN_BATCH_SIZE)
            .clamp(1, inner.max_eval_workers);

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let task = Arc::clone(task);
            let queue = Arc::clone(&queue);
            let fitness = Arc::clone(&inner.fitness_calculator);
            let good_enough = Arc::clone(&inner.is_fitness_good_enough);
            let tracker = inner.tracker.view();
            handles.push(tokio::spawn(async move {
                eval_assignments(task, queue, fitness, good_enough, tracker)
            }));
        }

        let mut results = Vec::new();
        let mut trials = 0;
        for handle in handles {
            match handle.await {
                Ok(eval) => {
                    trials += eval.trials;
                    results.extend(eval.results);
                }
                Err(join_error) => {
                    error!(
                        "Assignment evaluation worker failed for task {}: {}",
                        task.id, join_error
                    );
                }
            }
        }
        (results, trials)
    }

    /// Resource allocation quotas currently registered.
    pub fn get_res_allocs(&self) -> HashMap<String, ResAllocs> {
        self.inner.quota.get_all()
    }

    /// Add a quota, or replace the existing one of the same group.
    pub fn add_or_replace_res_allocs(&self, res_allocs: ResAllocs) {
        self.inner.quota.add_or_replace(res_allocs);
    }

    pub fn remove_res_allocs(&self, group_name: &str) {
        self.inner.quota.remove(group_name);
    }

    /// Autoscale rules currently registered; empty when autoscaling is not
    /// configured.
    pub fn get_auto_scale_rules(&self) -> Vec<AutoScaleRule> {
        self.inner
            .autoscaler
            .as_ref()
            .map(|scaler| scaler.rules())
            .unwrap_or_default()
    }

    /// Add an autoscale rule, or replace the existing one of the same
    /// group. Takes effect at the next round's autoscale evaluation.
    pub fn add_or_replace_auto_scale_rule(
        &self,
        rule: AutoScaleRule,
    ) -> Result<(), SchedulerError> {
        match &self.inner.autoscaler {
            Some(scaler) => scaler.replace_rule(rule),
            None => Err(SchedulerError::AutoScalerNotConfigured),
        }
    }

    pub fn remove_auto_scale_rule(&self, group: &str) {
        if let Some(scaler) = &self.inner.autoscaler {
            scaler.remove_rule(group);
        }
    }

    /// Set the autoscale action callback.
    pub fn set_autoscaler_callback(
        &self,
        callback: AutoScaleCallback,
    ) -> Result<(), SchedulerError> {
        match &self.inner.autoscaler {
            Some(scaler) => {
                scaler.set_callback(callback);
                Ok(())
            }
            None => Err(SchedulerError::AutoScalerNotConfigured),
        }
    }

    /// Used and available resources per known host. Blocks scheduling
    /// rounds for the duration; fails fast if one is in flight.
    pub fn get_resource_status(
        &self,
    ) -> Result<HashMap<String, HashMap<ResourceKind, [f64; 2]>>, SchedulerError> {
        let _guard = self.inner.monitor.enter()?;
        Ok(self.inner.registry.resource_status())
    }

    /// Current state of every known host. Blocks scheduling rounds for the
    /// duration; fails fast if one is in flight.
    pub fn get_host_current_states(&self) -> Result<Vec<HostCurrentState>, SchedulerError> {
        let _guard = self.inner.monitor.enter()?;
        Ok(self.inner.registry.host_states())
    }

    /// Reject one held offer. The rejection is applied, with the callback,
    /// at the start of the next round.
    pub fn expire_lease(&self, lease_id: &str) {
        self.inner.registry.mark_lease_expired(lease_id);
    }

    /// Reject every held offer of the named host.
    pub fn expire_all_leases_for(&self, hostname: &str) {
        self.inner.registry.mark_all_leases_expired_for(hostname);
    }

    /// Reject every held offer of the host known under the given vm id.
    /// Returns whether the id matched a known host.
    pub fn expire_all_leases_by_vm_id(&self, vm_id: &str) -> bool {
        match self.inner.registry.hostname_for_vm_id(vm_id) {
            Some(hostname) => {
                self.expire_all_leases_for(&hostname);
                true
            }
            None => false,
        }
    }

    /// Reject every held offer.
    pub fn expire_all_leases(&self) {
        info!("Expiring all leases");
        self.inner.registry.mark_all_leases_expired();
    }

    /// Keep the host out of consideration for the given duration. Unknown
    /// hosts get a record so the disablement survives their first offer.
    pub fn disable_host(&self, hostname: &str, duration_millis: u64) {
        info!("Disabling host {} for {} ms", hostname, duration_millis);
        let until = Utc::now() + chrono::Duration::milliseconds(duration_millis as i64);
        self.inner.registry.disable_until(hostname, until);
    }

    /// Disable the host known under the given vm id. Returns whether the
    /// id matched a known host.
    pub fn disable_host_by_vm_id(&self, vm_id: &str, duration_millis: u64) -> bool {
        match self.inner.registry.hostname_for_vm_id(vm_id) {
            Some(hostname) => {
                self.disable_host(&hostname, duration_millis);
                true
            }
            None => false,
        }
    }

    /// Lift a disablement. Hosts start enabled, so this is only needed
    /// after an explicit disable.
    pub fn enable_host(&self, hostname: &str) {
        info!("Enabling host {}", hostname);
        self.inner.registry.enable(hostname);
    }

    /// Name the host attribute whose value determines group membership.
    pub fn set_active_group_attribute_name(&self, attribute_name: &str) {
        self.inner.registry.set_group_attribute(attribute_name);
    }

    /// Restrict scheduling to hosts of the listed groups. `None` makes
    /// every group active again.
    pub fn set_active_groups(&self, groups: Option<Vec<String>>) {
        self.inner.registry.set_active_groups(groups);
    }

    /// Handle for notifying the engine that a selected task has actually
    /// been launched. Must not be called concurrently with a round.
    pub fn task_assigner(&self) -> TaskAssigner {
        TaskAssigner {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Handle for notifying the engine that a task has terminated. Safe to
    /// call from cluster-manager event threads at any time.
    pub fn task_unassigner(&self) -> TaskUnassigner {
        TaskUnassigner {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Notifies the engine of confirmed task launches; see
/// [`TaskScheduler::task_assigner`].
#[derive(Clone)]
pub struct TaskAssigner {
    inner: Arc<SchedulerInner>,
}

impl TaskAssigner {
    pub fn assign(&self, task: TaskRequest, hostname: &str) -> Result<(), SchedulerError> {
        let _guard = self.inner.monitor.enter()?;
        let task = Arc::new(task);
        let attributes = self
            .inner
            .registry
            .assign_running(Arc::clone(&task), hostname);
        self.inner.tracker.assign_running(task, hostname, attributes);
        Ok(())
    }
}

/// Notifies the engine of task terminations; see
/// [`TaskScheduler::task_unassigner`].
#[derive(Clone)]
pub struct TaskUnassigner {
    inner: Arc<SchedulerInner>,
}

impl TaskUnassigner {
    pub fn unassign(&self, task_id: &str, hostname: &str) {
        self.inner.registry.unassign_running(task_id, hostname);
        self.inner.tracker.unassign(task_id, hostname);
    }
}

struct EvalResult {
    results: Vec<TaskAssignmentResult>,
    trials: usize,
}

/// One evaluation worker: drain the shared queue in chunks, try the task
/// on each host, and stop the fleet early once a good-enough fit shows up.
fn eval_assignments(
    task: Arc<TaskRequest>,
    queue: Arc<SegQueue<Arc<AssignableHost>>>,
    fitness: Arc<dyn FitnessCalculator>,
    good_enough: FitnessGoodEnoughFn,
    tracker: TaskTrackerView,
) -> EvalResult {
    let mut results = Vec::new();
    let mut chunk = Vec::with_capacity(EVAL_CHUNK_SIZE);
    loop {
        chunk.clear();
        while chunk.len() < EVAL_CHUNK_SIZE {
            match queue.pop() {
                Some(host) => chunk.push(host),
                None => break,
            }
        }
        if chunk.is_empty() {
            let trials = results.len();
            return EvalResult { results, trials };
        }
        for host in chunk.drain(..) {
            let result = host.try_task(&task, fitness.as_ref(), &tracker);
            let stop = result.is_successful() && good_enough(result.fitness());
            results.push(result);
            if stop {
                // Drain the queue so no worker picks up new chunks; the
                // chunk already in hand still finishes so its comparisons
                // are not lost.
                while queue.pop().is_some() {}
            }
        }
    }
}

/// Best successful result by fitness. Ties resolve to the later-scanned
/// result, which makes equal-fitness outcomes dependent on worker timing;
/// callers needing full determinism should sharpen the fitness function.
fn best_successful(results: &[TaskAssignmentResult]) -> Option<usize> {
    let mut best = None;
    let mut best_fitness = 0.0;
    for (index, result) in results.iter().enumerate() {
        if result.is_successful() && (best.is_none() || result.fitness() >= best_fitness) {
            best = Some(index);
            best_fitness = result.fitness();
        }
    }
    best
}

/// Count each unplaced, scale-eligible task once per group on whose hosts
/// it failed; those groups could absorb it after a scale-up.
fn attribute_unplaced_tasks(
    tasks: &[Arc<TaskRequest>],
    autoscale_eligible: &[bool],
    result: &SchedulingResult,
    candidates: &[Arc<AssignableHost>],
) -> HashMap<String, usize> {
    let group_of: HashMap<&str, Option<String>> = candidates
        .iter()
        .map(|host| (host.hostname(), host.group()))
        .collect();

    let mut unplaced_by_group: HashMap<String, usize> = HashMap::new();
    for (index, task) in tasks.iter().enumerate() {
        if !autoscale_eligible[index] {
            continue;
        }
        let Some(failures) = result.task_failures.get(&task.id) else {
            continue;
        };
        let mut counted = HashSet::new();
        for failure in failures {
            let Some(hostname) = failure.hostname() else {
                continue;
            };
            if let Some(Some(group)) = group_of.get(hostname) {
                if counted.insert(group.clone()) {
                    *unplaced_by_group.entry(group.clone()).or_default() += 1;
                }
            }
        }
    }
    unplaced_by_group
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_config() -> SchedulerConfig {
        SchedulerConfig::new(Arc::new(|_| {}))
    }

    fn cpu_lease(id: &str, hostname: &str, cpu: f64) -> ResourceLease {
        ResourceLease::new(id, hostname)
            .with_resources(ResourceVector::new(cpu, 8192.0, 0.0, 0.0))
    }

    fn cpu_task(id: &str, cpu: f64) -> TaskRequest {
        TaskRequest::new(id, "group").with_resources(ResourceVector::new(cpu, 1024.0, 0.0, 0.0))
    }

    /// Fitness plugin that holds the round open long enough for a second
    /// caller to collide with it.
    struct SlowFitness;

    impl FitnessCalculator for SlowFitness {
        fn name(&self) -> &str {
            "Slow"
        }

        fn calculate(
            &self,
            _task: &TaskRequest,
            _host: &HostCandidate,
            _tracker: &TaskTrackerView,
        ) -> f64 {
            std::thread::sleep(Duration::from_millis(100));
            1.0
        }
    }

    struct PanickingFitness;

    impl FitnessCalculator for PanickingFitness {
        fn name(&self) -> &str {
            "Panicking"
        }

        fn calculate(
            &self,
            _task: &TaskRequest,
            _host: &HostCandidate,
            _tracker: &TaskTrackerView,
        ) -> f64 {
            panic!("plugin blew up");
        }
    }

    #[test]
    fn autoscale_rule_requires_scale_attribute() {
        let config = noop_config().with_auto_scale_rule(AutoScaleRule::new("g", 1, 2, 60));
        assert!(matches!(
            TaskScheduler::new(config),
            Err(SchedulerError::AutoScalerNotConfigured)
        ));

        let config = noop_config().with_autoscaler_callback(Arc::new(|_| {}));
        assert!(matches!(
            TaskScheduler::new(config),
            Err(SchedulerError::AutoScalerNotConfigured)
        ));
    }

    #[test]
    fn malformed_rule_is_rejected_at_construction() {
        let config = noop_config()
            .with_auto_scale_by_attribute_name("cluster")
            .with_auto_scale_rule(AutoScaleRule::new("g", 0, 2, 60));
        assert!(matches!(
            TaskScheduler::new(config),
            Err(SchedulerError::InvalidAutoScaleRule(_))
        ));
    }

    #[test]
    fn rule_crud_requires_configured_autoscaler() {
        let scheduler = TaskScheduler::new(noop_config()).unwrap();
        assert!(scheduler.get_auto_scale_rules().is_empty());
        assert!(matches!(
            scheduler.add_or_replace_auto_scale_rule(AutoScaleRule::new("g", 1, 2, 60)),
            Err(SchedulerError::AutoScalerNotConfigured)
        ));
        assert!(matches!(
            scheduler.set_autoscaler_callback(Arc::new(|_| {})),
            Err(SchedulerError::AutoScalerNotConfigured)
        ));

        let scheduler = TaskScheduler::new(
            noop_config().with_auto_scale_by_attribute_name("cluster"),
        )
        .unwrap();
        scheduler
            .add_or_replace_auto_scale_rule(AutoScaleRule::new("g", 1, 2, 60))
            .unwrap();
        assert_eq!(scheduler.get_auto_scale_rules().len(), 1);
        scheduler.remove_auto_scale_rule("g");
        assert!(scheduler.get_auto_scale_rules().is_empty());
    }

    #[tokio::test]
    async fn duplicate_lease_id_propagates_as_state_error() {
        let scheduler = TaskScheduler::new(noop_config()).unwrap();

        let result = scheduler
            .schedule_once(
                Vec::new(),
                vec![cpu_lease("a", "h1", 4.0), cpu_lease("a", "h2", 4.0)],
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::DuplicateLease(id)) if id == "a"));

        // The first offer of the batch is present; the second is not.
        let states = scheduler.get_host_current_states().unwrap();
        let hostnames: Vec<&str> = states.iter().map(|s| s.hostname.as_str()).collect();
        assert_eq!(hostnames, vec!["h1"]);
    }

    #[tokio::test]
    async fn single_task_lands_on_single_host() {
        let scheduler = TaskScheduler::new(noop_config()).unwrap();

        let result = scheduler
            .schedule_once(vec![cpu_task("t1", 2.0)], vec![cpu_lease("l1", "h1", 4.0)])
            .await
            .unwrap();

        assert_eq!(result.host_assignments.len(), 1);
        assert!(result.task_failures.is_empty());
        assert_eq!(result.leases_added, 1);
        assert_eq!(result.total_hosts, 1);
        let assignment = &result.host_assignments["h1"];
        assert_eq!(assignment.tasks.len(), 1);
        assert_eq!(assignment.tasks[0].task_id(), "t1");
        assert!(assignment.tasks[0].is_successful());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rounds_fail_fast() {
        let scheduler = Arc::new(
            TaskScheduler::new(
                noop_config().with_fitness_calculator(Arc::new(SlowFitness)),
            )
            .unwrap(),
        );

        let first = scheduler.schedule_once(
            vec![cpu_task("t1", 1.0)],
            vec![cpu_lease("l1", "h1", 4.0)],
        );
        let second = scheduler.schedule_once(vec![cpu_task("t2", 1.0)], Vec::new());

        let (first, second) = tokio::join!(first, second);
        let errors = [first.is_err(), second.is_err()];
        assert_eq!(errors.iter().filter(|e| **e).count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn assigner_collides_with_running_round() {
        let scheduler = Arc::new(
            TaskScheduler::new(
                noop_config().with_fitness_calculator(Arc::new(SlowFitness)),
            )
            .unwrap(),
        );
        let assigner = scheduler.task_assigner();

        let round = scheduler.schedule_once(
            vec![cpu_task("t1", 1.0)],
            vec![cpu_lease("l1", "h1", 4.0)],
        );
        let assign = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assigner.assign(cpu_task("other", 1.0), "h2")
        };

        let (round, assign) = tokio::join!(round, assign);
        assert!(round.is_ok());
        assert!(matches!(assign, Err(SchedulerError::ConcurrentAccess)));
    }

    #[tokio::test]
    async fn plugin_panic_drops_worker_results_but_round_survives() {
        let scheduler = TaskScheduler::new(
            noop_config().with_fitness_calculator(Arc::new(PanickingFitness)),
        )
        .unwrap();

        let result = scheduler
            .schedule_once(vec![cpu_task("t1", 1.0)], vec![cpu_lease("l1", "h1", 4.0)])
            .await
            .unwrap();

        // The only worker panicked, so there is neither an assignment nor
        // a failure record for the task.
        assert!(result.host_assignments.is_empty());
        assert!(result.task_failures.get("t1").map_or(true, |f| f.is_empty()));
    }

    #[tokio::test]
    async fn unassigner_needs_no_guard() {
        let scheduler = TaskScheduler::new(noop_config()).unwrap();
        let assigner = scheduler.task_assigner();
        let unassigner = scheduler.task_unassigner();

        assigner.assign(cpu_task("t1", 1.0), "h1").unwrap();
        let status = scheduler.get_resource_status().unwrap();
        assert_eq!(status["h1"][&ResourceKind::Cpu][0], 1.0);

        unassigner.unassign("t1", "h1");
        let status = scheduler.get_resource_status().unwrap();
        assert_eq!(status["h1"][&ResourceKind::Cpu][0], 0.0);
    }

    #[tokio::test]
    async fn empty_round_leaves_state_unchanged() {
        let scheduler = TaskScheduler::new(noop_config()).unwrap();
        scheduler
            .schedule_once(Vec::new(), vec![cpu_lease("l1", "h1", 4.0)])
            .await
            .unwrap();

        let before = scheduler.get_host_current_states().unwrap();
        let result = scheduler.schedule_once(Vec::new(), Vec::new()).await.unwrap();
        let after = scheduler.get_host_current_states().unwrap();

        assert_eq!(result.leases_added, 0);
        assert_eq!(result.idle_hosts, 1);
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].available, after[0].available);
    }
}
