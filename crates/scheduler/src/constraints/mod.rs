//! Placement constraints evaluated per (task, host) pair.
//!
//! Hard constraints disqualify a host outright; soft constraints return a
//! score in `[0, 1]` that is folded into the fitness value. Both receive
//! the candidate host and a read-only tracker view so they can reason
//! about co-scheduled tasks.

use std::sync::Arc;

use crate::tracker::TaskTrackerView;
use crate::types::{HostCandidate, TaskRequest};

/// Outcome of a hard constraint evaluation.
#[derive(Debug, Clone)]
pub struct ConstraintResult {
    pub passed: bool,
    pub reason: Option<String>,
}

impl ConstraintResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Pass/fail predicate on a (task, host, cluster state) triple.
pub trait HardConstraint: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        task: &TaskRequest,
        host: &HostCandidate,
        tracker: &TaskTrackerView,
    ) -> ConstraintResult;
}

/// Weighted score contributing to fitness; never disqualifies a host.
pub trait SoftConstraint: Send + Sync {
    fn name(&self) -> &str;

    /// Score in `[0, 1]`, higher is better.
    fn score(&self, task: &TaskRequest, host: &HostCandidate, tracker: &TaskTrackerView) -> f64;
}

/// Requires a host attribute to carry an exact value.
pub struct HostAttributeValueConstraint {
    attribute: String,
    expected: String,
}

impl HostAttributeValueConstraint {
    pub fn new(attribute: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            expected: expected.into(),
        }
    }
}

impl HardConstraint for HostAttributeValueConstraint {
    fn name(&self) -> &str {
        "HostAttributeValue"
    }

    fn evaluate(
        &self,
        _task: &TaskRequest,
        host: &HostCandidate,
        _tracker: &TaskTrackerView,
    ) -> ConstraintResult {
        match host.attributes.get(&self.attribute) {
            Some(value) if *value == self.expected => ConstraintResult::passed(),
            Some(value) => ConstraintResult::failed(format!(
                "attribute {} is {}, expected {}",
                self.attribute, value, self.expected
            )),
            None => ConstraintResult::failed(format!(
                "host has no attribute {}",
                self.attribute
            )),
        }
    }
}

/// Spreads co-scheduled tasks of one group across distinct values of a
/// host attribute. With no attribute configured, the hostname itself is
/// the distinguishing value, yielding one task of the group per host.
pub struct UniqueHostAttributeConstraint {
    attribute: Option<String>,
}

impl UniqueHostAttributeConstraint {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
        }
    }

    pub fn by_hostname() -> Self {
        Self { attribute: None }
    }

    fn value_of(&self, hostname: &str, attributes: &std::collections::HashMap<String, String>) -> Option<String> {
        match &self.attribute {
            None => Some(hostname.to_string()),
            Some(attr) => attributes.get(attr).cloned(),
        }
    }
}

impl HardConstraint for UniqueHostAttributeConstraint {
    fn name(&self) -> &str {
        "UniqueHostAttribute"
    }

    fn evaluate(
        &self,
        task: &TaskRequest,
        host: &HostCandidate,
        tracker: &TaskTrackerView,
    ) -> ConstraintResult {
        let candidate_value = match self.value_of(&host.hostname, &host.attributes) {
            Some(value) => value,
            // A host without the attribute cannot guarantee uniqueness.
            None => {
                return ConstraintResult::failed(format!(
                    "host has no attribute {}",
                    self.attribute.as_deref().unwrap_or("hostname")
                ))
            }
        };

        for tracked in tracker.all_tasks() {
            if tracked.task.group_name != task.group_name || tracked.task.id == task.id {
                continue;
            }
            if let Some(value) = self.value_of(&tracked.hostname, &tracked.attributes) {
                if value == candidate_value {
                    return ConstraintResult::failed(format!(
                        "value {} already taken by task {}",
                        candidate_value, tracked.task.id
                    ));
                }
            }
        }
        ConstraintResult::passed()
    }
}

/// Claims a host exclusively: the task only lands on a host with no other
/// running or tentatively assigned tasks.
pub struct ExclusiveHostConstraint;

impl HardConstraint for ExclusiveHostConstraint {
    fn name(&self) -> &str {
        "ExclusiveHost"
    }

    fn evaluate(
        &self,
        _task: &TaskRequest,
        host: &HostCandidate,
        _tracker: &TaskTrackerView,
    ) -> ConstraintResult {
        let occupied = host.running_tasks.len() + host.assigned_tasks.len();
        if occupied == 0 {
            ConstraintResult::passed()
        } else {
            ConstraintResult::failed(format!("host already holds {} task(s)", occupied))
        }
    }
}

struct SoftenedConstraint {
    inner: Arc<dyn HardConstraint>,
}

impl SoftConstraint for SoftenedConstraint {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn score(&self, task: &TaskRequest, host: &HostCandidate, tracker: &TaskTrackerView) -> f64 {
        if self.inner.evaluate(task, host, tracker).passed {
            1.0
        } else {
            0.0
        }
    }
}

/// Turn a hard constraint into a soft preference: a pass scores 1.0, a
/// failure scores 0.0 without disqualifying the host.
pub fn soft(constraint: Arc<dyn HardConstraint>) -> Arc<dyn SoftConstraint> {
    Arc::new(SoftenedConstraint { inner: constraint })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TaskTracker;
    use crate::types::ResourceVector;
    use std::collections::HashMap;

    fn candidate(hostname: &str, attrs: &[(&str, &str)]) -> HostCandidate {
        HostCandidate {
            hostname: hostname.to_string(),
            attributes: Arc::new(
                attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            available: ResourceVector::new(4.0, 8192.0, 0.0, 0.0),
            total: ResourceVector::new(4.0, 8192.0, 0.0, 0.0),
            running_tasks: Vec::new(),
            assigned_tasks: Vec::new(),
        }
    }

    fn view() -> TaskTrackerView {
        Arc::new(TaskTracker::new()).view()
    }

    #[test]
    fn attribute_value_constraint_matches_exact_value() {
        let constraint = HostAttributeValueConstraint::new("zone", "us-east-1a");
        let task = TaskRequest::new("t1", "g");

        let result = constraint.evaluate(&task, &candidate("h1", &[("zone", "us-east-1a")]), &view());
        assert!(result.passed);

        let result = constraint.evaluate(&task, &candidate("h2", &[("zone", "us-west-2a")]), &view());
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("us-west-2a"));

        let result = constraint.evaluate(&task, &candidate("h3", &[]), &view());
        assert!(!result.passed);
    }

    #[test]
    fn unique_hostname_rejects_second_task_on_same_host() {
        let tracker = Arc::new(TaskTracker::new());
        tracker.add_assigned(
            Arc::new(TaskRequest::new("t1", "g")),
            "h1",
            Arc::new(HashMap::new()),
        );

        let constraint = UniqueHostAttributeConstraint::by_hostname();
        let task = TaskRequest::new("t2", "g");

        assert!(!constraint.evaluate(&task, &candidate("h1", &[]), &tracker.view()).passed);
        assert!(constraint.evaluate(&task, &candidate("h2", &[]), &tracker.view()).passed);
    }

    #[test]
    fn unique_attribute_ignores_other_groups() {
        let tracker = Arc::new(TaskTracker::new());
        let mut attrs = HashMap::new();
        attrs.insert("rack".to_string(), "r1".to_string());
        tracker.assign_running(
            Arc::new(TaskRequest::new("other", "other-group")),
            "h1",
            Arc::new(attrs),
        );

        let constraint = UniqueHostAttributeConstraint::new("rack");
        let task = TaskRequest::new("t1", "g");

        let result = constraint.evaluate(&task, &candidate("h2", &[("rack", "r1")]), &tracker.view());
        assert!(result.passed);
    }

    #[test]
    fn exclusive_host_requires_empty_host() {
        let constraint = ExclusiveHostConstraint;
        let task = TaskRequest::new("t1", "g");

        assert!(constraint.evaluate(&task, &candidate("h1", &[]), &view()).passed);

        let mut occupied = candidate("h1", &[]);
        occupied.running_tasks.push(Arc::new(TaskRequest::new("t0", "g")));
        assert!(!constraint.evaluate(&task, &occupied, &view()).passed);
    }

    #[test]
    fn softened_constraint_scores_instead_of_rejecting() {
        let hard: Arc<dyn HardConstraint> = Arc::new(HostAttributeValueConstraint::new("zone", "a"));
        let softened = soft(hard);
        let task = TaskRequest::new("t1", "g");

        assert_eq!(softened.score(&task, &candidate("h1", &[("zone", "a")]), &view()), 1.0);
        assert_eq!(softened.score(&task, &candidate("h2", &[("zone", "b")]), &view()), 0.0);
    }
}
