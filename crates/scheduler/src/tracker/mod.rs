//! Process-wide registry of tasks that are running or tentatively assigned.
//!
//! The tracker is the only scheduler structure mutated from outside a
//! scheduling round: the framework's completion callbacks unassign tasks
//! from whatever thread delivers cluster-manager events. Its maps are
//! concurrent and each update touches a single entry, so those calls need
//! no coordination with an in-flight round.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::types::TaskRequest;

/// A task known to the tracker and the host it sits on.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub task: Arc<TaskRequest>,
    pub hostname: String,
    /// Attribute map of the host at the time of assignment, for
    /// attribute-based constraints that inspect co-tasks.
    pub attributes: Arc<HashMap<String, String>>,
    pub assigned_at: DateTime<Utc>,
}

/// Registry of running and tentatively assigned tasks, indexed by task id
/// and by hostname.
pub(crate) struct TaskTracker {
    running: DashMap<String, TrackedTask>,
    /// Tasks bound during the current round, cleared as results are
    /// returned to the caller.
    assigned: DashMap<String, TrackedTask>,
    by_host: DashMap<String, Vec<String>>,
}

impl TaskTracker {
    pub(crate) fn new() -> Self {
        Self {
            running: DashMap::new(),
            assigned: DashMap::new(),
            by_host: DashMap::new(),
        }
    }

    pub(crate) fn assign_running(
        &self,
        task: Arc<TaskRequest>,
        hostname: &str,
        attributes: Arc<HashMap<String, String>>,
    ) {
        let task_id = task.id.clone();
        self.running.insert(
            task_id.clone(),
            TrackedTask {
                task,
                hostname: hostname.to_string(),
                attributes,
                assigned_at: Utc::now(),
            },
        );
        let mut ids = self.by_host.entry(hostname.to_string()).or_default();
        if !ids.contains(&task_id) {
            ids.push(task_id);
        }
    }

    pub(crate) fn unassign(&self, task_id: &str, hostname: &str) {
        if self.running.remove(task_id).is_none() {
            debug!("Unassign for unknown task {} on {}", task_id, hostname);
        }
        if let Some(mut ids) = self.by_host.get_mut(hostname) {
            ids.retain(|id| id != task_id);
        }
        self.by_host
            .remove_if(hostname, |_, ids| ids.is_empty());
    }

    pub(crate) fn add_assigned(
        &self,
        task: Arc<TaskRequest>,
        hostname: &str,
        attributes: Arc<HashMap<String, String>>,
    ) {
        let task_id = task.id.clone();
        self.assigned.insert(
            task_id.clone(),
            TrackedTask {
                task,
                hostname: hostname.to_string(),
                attributes,
                assigned_at: Utc::now(),
            },
        );
        let mut ids = self.by_host.entry(hostname.to_string()).or_default();
        if !ids.contains(&task_id) {
            ids.push(task_id);
        }
    }

    pub(crate) fn remove_assigned(&self, task_id: &str) {
        if let Some((_, tracked)) = self.assigned.remove(task_id) {
            if let Some(mut ids) = self.by_host.get_mut(&tracked.hostname) {
                ids.retain(|id| id != task_id);
            }
            self.by_host
                .remove_if(&tracked.hostname, |_, ids| ids.is_empty());
        }
    }

    pub(crate) fn view(self: &Arc<Self>) -> TaskTrackerView {
        TaskTrackerView {
            inner: Arc::clone(self),
        }
    }
}

/// Read-only view of the tracker handed to constraint and fitness plugins.
///
/// Plugins see running tasks as well as tasks bound earlier in the same
/// round, but cannot mutate either set.
#[derive(Clone)]
pub struct TaskTrackerView {
    inner: Arc<TaskTracker>,
}

impl TaskTrackerView {
    pub fn get(&self, task_id: &str) -> Option<TrackedTask> {
        self.inner
            .running
            .get(task_id)
            .or_else(|| self.inner.assigned.get(task_id))
            .map(|entry| entry.value().clone())
    }

    pub fn running_tasks(&self) -> Vec<TrackedTask> {
        self.inner
            .running
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Tasks tentatively bound during the current round.
    pub fn assigned_tasks(&self) -> Vec<TrackedTask> {
        self.inner
            .assigned
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Running plus tentatively assigned tasks.
    pub fn all_tasks(&self) -> Vec<TrackedTask> {
        let mut tasks = self.running_tasks();
        tasks.extend(self.assigned_tasks());
        tasks
    }

    pub fn tasks_on_host(&self, hostname: &str) -> Vec<TrackedTask> {
        match self.inner.by_host.get(hostname) {
            Some(ids) => ids.iter().filter_map(|id| self.get(id)).collect(),
            None => Vec::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceVector;

    fn test_task(id: &str, group: &str) -> Arc<TaskRequest> {
        Arc::new(
            TaskRequest::new(id, group)
                .with_resources(ResourceVector::new(1.0, 1024.0, 0.0, 0.0)),
        )
    }

    fn no_attributes() -> Arc<HashMap<String, String>> {
        Arc::new(HashMap::new())
    }

    #[test]
    fn assign_then_unassign_restores_prior_state() {
        let tracker = Arc::new(TaskTracker::new());
        let view = tracker.view();

        tracker.assign_running(test_task("t1", "g"), "h1", no_attributes());
        assert_eq!(view.running_count(), 1);
        assert_eq!(view.tasks_on_host("h1").len(), 1);

        tracker.unassign("t1", "h1");
        assert_eq!(view.running_count(), 0);
        assert!(view.tasks_on_host("h1").is_empty());
        assert!(view.get("t1").is_none());
    }

    #[test]
    fn unassign_of_unknown_task_is_harmless() {
        let tracker = Arc::new(TaskTracker::new());
        tracker.unassign("missing", "h1");
        assert_eq!(tracker.view().running_count(), 0);
    }

    #[test]
    fn tentative_assignments_show_in_view_until_removed() {
        let tracker = Arc::new(TaskTracker::new());
        let view = tracker.view();

        tracker.add_assigned(test_task("t1", "g"), "h1", no_attributes());
        assert_eq!(view.assigned_tasks().len(), 1);
        assert_eq!(view.all_tasks().len(), 1);
        assert_eq!(view.tasks_on_host("h1").len(), 1);
        assert_eq!(view.running_count(), 0);

        tracker.remove_assigned("t1");
        assert!(view.assigned_tasks().is_empty());
        assert!(view.tasks_on_host("h1").is_empty());
    }

    #[test]
    fn host_index_tracks_multiple_tasks() {
        let tracker = Arc::new(TaskTracker::new());
        let view = tracker.view();

        tracker.assign_running(test_task("t1", "g"), "h1", no_attributes());
        tracker.assign_running(test_task("t2", "g"), "h1", no_attributes());
        tracker.assign_running(test_task("t3", "g"), "h2", no_attributes());

        assert_eq!(view.tasks_on_host("h1").len(), 2);
        assert_eq!(view.tasks_on_host("h2").len(), 1);

        tracker.unassign("t2", "h1");
        assert_eq!(view.tasks_on_host("h1").len(), 1);
        assert_eq!(view.get("t1").unwrap().hostname, "h1");
    }
}
