//! Autoscaling rules and the per-round scaling signal evaluator.
//!
//! The engine never scales anything itself. After each round it feeds the
//! idle hosts and the tasks it could not place into this evaluator, which
//! turns them into scale-up or scale-down actions for the configured
//! callback. Evaluation runs on a spawned task so the round never blocks
//! on the callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{AutoScaleCallback, SchedulerError};

/// Per-group autoscaling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScaleRule {
    pub group: String,
    pub min_idle_hosts_to_keep: usize,
    pub max_idle_hosts_to_keep: usize,
    pub cool_down_secs: u64,
    /// Estimated number of unplaced tasks one new host of this group can
    /// absorb; drives the shortfall evaluation. Zero disables shortfall
    /// scaling for the group.
    pub shortfall_trigger_capacity: usize,
}

impl AutoScaleRule {
    pub fn new(
        group: impl Into<String>,
        min_idle_hosts_to_keep: usize,
        max_idle_hosts_to_keep: usize,
        cool_down_secs: u64,
    ) -> Self {
        Self {
            group: group.into(),
            min_idle_hosts_to_keep,
            max_idle_hosts_to_keep,
            cool_down_secs,
            shortfall_trigger_capacity: 0,
        }
    }

    pub fn with_shortfall_trigger_capacity(mut self, capacity: usize) -> Self {
        self.shortfall_trigger_capacity = capacity;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if self.min_idle_hosts_to_keep < 1 {
            return Err(SchedulerError::InvalidAutoScaleRule(format!(
                "rule for group {}: min idle hosts to keep must be at least 1",
                self.group
            )));
        }
        if self.min_idle_hosts_to_keep > self.max_idle_hosts_to_keep {
            return Err(SchedulerError::InvalidAutoScaleRule(format!(
                "rule for group {}: min idle hosts to keep must not exceed max",
                self.group
            )));
        }
        Ok(())
    }
}

/// A scaling action handed to the framework's callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoScaleAction {
    ScaleUp {
        group: String,
        host_count: usize,
    },
    /// The listed hosts are idle and may be terminated. Host identifiers
    /// honor the configured hostname-mapping attribute when present.
    ScaleDown {
        group: String,
        hosts: Vec<String>,
    },
}

/// An idle host as seen at the end of a round.
#[derive(Debug, Clone)]
pub(crate) struct IdleHostInfo {
    pub(crate) hostname: String,
    pub(crate) group: Option<String>,
    pub(crate) attributes: Arc<HashMap<String, String>>,
}

/// End-of-round input to the evaluator.
#[derive(Debug, Default)]
pub(crate) struct AutoScalerInput {
    pub(crate) idle_hosts: Vec<IdleHostInfo>,
    /// Unplaced tasks attributed to the groups on whose hosts they failed.
    /// Quota-refused tasks are excluded upstream.
    pub(crate) unplaced_by_group: HashMap<String, usize>,
}

pub(crate) struct AutoScaler {
    rules: DashMap<String, AutoScaleRule>,
    callback: RwLock<Option<AutoScaleCallback>>,
    cooldowns: DashMap<String, Instant>,
    map_hostname_attribute: Option<String>,
    balance_attribute: Option<String>,
    shortfall_disabled: bool,
}

impl AutoScaler {
    pub(crate) fn new(
        rules: Vec<AutoScaleRule>,
        map_hostname_attribute: Option<String>,
        balance_attribute: Option<String>,
        shortfall_disabled: bool,
    ) -> Self {
        let by_group = DashMap::new();
        for rule in rules {
            by_group.insert(rule.group.clone(), rule);
        }
        Self {
            rules: by_group,
            callback: RwLock::new(None),
            cooldowns: DashMap::new(),
            map_hostname_attribute,
            balance_attribute,
            shortfall_disabled,
        }
    }

    pub(crate) fn set_callback(&self, callback: AutoScaleCallback) {
        *self.callback.write() = Some(callback);
    }

    pub(crate) fn replace_rule(&self, rule: AutoScaleRule) -> Result<(), SchedulerError> {
        rule.validate()?;
        self.rules.insert(rule.group.clone(), rule);
        Ok(())
    }

    pub(crate) fn remove_rule(&self, group: &str) {
        self.rules.remove(group);
    }

    pub(crate) fn rules(&self) -> Vec<AutoScaleRule> {
        self.rules.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn max_idle_by_group(&self) -> HashMap<String, usize> {
        self.rules
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().max_idle_hosts_to_keep))
            .collect()
    }

    /// Evaluate asynchronously so the scheduling round returns without
    /// waiting on the callback.
    pub(crate) fn schedule_evaluation(self: &Arc<Self>, input: AutoScalerInput) {
        let scaler = Arc::clone(self);
        tokio::spawn(async move {
            scaler.evaluate(input);
        });
    }

    fn evaluate(&self, input: AutoScalerInput) {
        let callback = self.callback.read().clone();
        let Some(callback) = callback else {
            debug!("No autoscaler callback configured, dropping scaling signals");
            return;
        };

        let mut idle_by_group: HashMap<&str, Vec<&IdleHostInfo>> = HashMap::new();
        for host in &input.idle_hosts {
            if let Some(group) = &host.group {
                idle_by_group.entry(group.as_str()).or_default().push(host);
            }
        }

        for entry in self.rules.iter() {
            let rule = entry.value();
            let idle = idle_by_group
                .get(rule.group.as_str())
                .map(|hosts| hosts.as_slice())
                .unwrap_or(&[]);

            let deficit = rule.min_idle_hosts_to_keep.saturating_sub(idle.len());
            let shortfall = self.shortfall_hosts(rule, &input);
            let scale_up = deficit.max(shortfall);

            if scale_up > 0 {
                if self.cooldown_elapsed(&rule.group, rule.cool_down_secs) {
                    info!(
                        "Scaling up group {} by {} host(s) (idle deficit {}, shortfall {})",
                        rule.group, scale_up, deficit, shortfall
                    );
                    callback(AutoScaleAction::ScaleUp {
                        group: rule.group.clone(),
                        host_count: scale_up,
                    });
                } else {
                    debug!("Scale up of group {} suppressed by cooldown", rule.group);
                }
            } else if idle.len() > rule.max_idle_hosts_to_keep {
                let excess = idle.len() - rule.max_idle_hosts_to_keep;
                if self.cooldown_elapsed(&rule.group, rule.cool_down_secs) {
                    let hosts = self.pick_for_scale_down(idle, excess);
                    info!(
                        "Scaling down group {}: {} idle above cap of {}",
                        rule.group, excess, rule.max_idle_hosts_to_keep
                    );
                    callback(AutoScaleAction::ScaleDown {
                        group: rule.group.clone(),
                        hosts,
                    });
                } else {
                    debug!("Scale down of group {} suppressed by cooldown", rule.group);
                }
            }
        }
    }

    fn shortfall_hosts(&self, rule: &AutoScaleRule, input: &AutoScalerInput) -> usize {
        if self.shortfall_disabled || rule.shortfall_trigger_capacity == 0 {
            return 0;
        }
        let unplaced = input
            .unplaced_by_group
            .get(&rule.group)
            .copied()
            .unwrap_or(0);
        unplaced.div_ceil(rule.shortfall_trigger_capacity)
    }

    /// Record an action for the group unless one fired within the cooldown
    /// window.
    fn cooldown_elapsed(&self, group: &str, cool_down_secs: u64) -> bool {
        let window = Duration::from_secs(cool_down_secs);
        let now = Instant::now();
        let mut suppressed = false;
        self.cooldowns
            .entry(group.to_string())
            .and_modify(|last| {
                if now.duration_since(*last) < window {
                    suppressed = true;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        !suppressed
    }

    /// Choose `excess` idle hosts to terminate, keeping the remaining idle
    /// set balanced across the values of the balance attribute.
    fn pick_for_scale_down(&self, idle: &[&IdleHostInfo], excess: usize) -> Vec<String> {
        let identifier = |host: &IdleHostInfo| -> String {
            self.map_hostname_attribute
                .as_ref()
                .and_then(|attr| host.attributes.get(attr).cloned())
                .unwrap_or_else(|| host.hostname.clone())
        };

        let balance_attr = match &self.balance_attribute {
            None => return idle.iter().take(excess).map(|h| identifier(h)).collect(),
            Some(attr) => attr,
        };

        let mut buckets: HashMap<String, Vec<&IdleHostInfo>> = HashMap::new();
        for &host in idle {
            let value = host
                .attributes
                .get(balance_attr)
                .cloned()
                .unwrap_or_default();
            buckets.entry(value).or_default().push(host);
        }

        // Repeatedly shrink the largest bucket so the survivors stay even
        // across attribute values.
        let mut picked = Vec::with_capacity(excess);
        while picked.len() < excess {
            let largest = buckets.iter_mut().max_by_key(|(_, hosts)| hosts.len());
            match largest {
                Some((_, hosts)) if !hosts.is_empty() => {
                    let host = hosts.pop().unwrap();
                    picked.push(identifier(host));
                }
                _ => break,
            }
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn capture() -> (AutoScaleCallback, Arc<Mutex<Vec<AutoScaleAction>>>) {
        let actions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&actions);
        let callback: AutoScaleCallback = Arc::new(move |action| {
            sink.lock().push(action);
        });
        (callback, actions)
    }

    fn idle_host(hostname: &str, group: &str, attrs: &[(&str, &str)]) -> IdleHostInfo {
        IdleHostInfo {
            hostname: hostname.to_string(),
            group: Some(group.to_string()),
            attributes: Arc::new(
                attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        }
    }

    #[test]
    fn rules_round_trip_through_serde() {
        let rule = AutoScaleRule::new("g", 1, 5, 300).with_shortfall_trigger_capacity(8);
        let json = serde_json::to_string(&rule).unwrap();
        let parsed: AutoScaleRule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.group, "g");
        assert_eq!(parsed.max_idle_hosts_to_keep, 5);
        assert_eq!(parsed.shortfall_trigger_capacity, 8);
    }

    #[test]
    fn rule_validation_rejects_bad_bounds() {
        assert!(AutoScaleRule::new("g", 0, 5, 60).validate().is_err());
        assert!(AutoScaleRule::new("g", 6, 5, 60).validate().is_err());
        assert!(AutoScaleRule::new("g", 1, 5, 60).validate().is_ok());
    }

    #[test]
    fn idle_deficit_triggers_scale_up() {
        let scaler = AutoScaler::new(vec![AutoScaleRule::new("g", 2, 5, 300)], None, None, false);
        let (callback, actions) = capture();
        scaler.set_callback(callback);

        scaler.evaluate(AutoScalerInput {
            idle_hosts: vec![idle_host("h1", "g", &[])],
            unplaced_by_group: HashMap::new(),
        });

        assert_eq!(
            actions.lock().as_slice(),
            &[AutoScaleAction::ScaleUp {
                group: "g".to_string(),
                host_count: 1
            }]
        );
    }

    #[test]
    fn cooldown_suppresses_back_to_back_actions() {
        let scaler = AutoScaler::new(vec![AutoScaleRule::new("g", 2, 5, 300)], None, None, false);
        let (callback, actions) = capture();
        scaler.set_callback(callback);

        let input = || AutoScalerInput {
            idle_hosts: Vec::new(),
            unplaced_by_group: HashMap::new(),
        };
        scaler.evaluate(input());
        scaler.evaluate(input());

        assert_eq!(actions.lock().len(), 1);
    }

    #[test]
    fn excess_idle_triggers_balanced_scale_down() {
        let scaler = AutoScaler::new(
            vec![AutoScaleRule::new("g", 1, 2, 0)],
            None,
            Some("zone".to_string()),
            false,
        );
        let (callback, actions) = capture();
        scaler.set_callback(callback);

        scaler.evaluate(AutoScalerInput {
            idle_hosts: vec![
                idle_host("a1", "g", &[("zone", "a")]),
                idle_host("a2", "g", &[("zone", "a")]),
                idle_host("a3", "g", &[("zone", "a")]),
                idle_host("b1", "g", &[("zone", "b")]),
            ],
            unplaced_by_group: HashMap::new(),
        });

        let actions = actions.lock();
        match &actions[0] {
            AutoScaleAction::ScaleDown { group, hosts } => {
                assert_eq!(group, "g");
                assert_eq!(hosts.len(), 2);
                // Both terminations come from the overrepresented zone.
                assert!(hosts.iter().all(|h| h.starts_with('a')));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn shortfall_scales_up_by_task_capacity() {
        let scaler = AutoScaler::new(
            vec![AutoScaleRule::new("g", 1, 10, 0).with_shortfall_trigger_capacity(4)],
            None,
            None,
            false,
        );
        let (callback, actions) = capture();
        scaler.set_callback(callback);

        let mut unplaced = HashMap::new();
        unplaced.insert("g".to_string(), 9);
        scaler.evaluate(AutoScalerInput {
            idle_hosts: vec![idle_host("h1", "g", &[])],
            unplaced_by_group: unplaced,
        });

        assert_eq!(
            actions.lock().as_slice(),
            &[AutoScaleAction::ScaleUp {
                group: "g".to_string(),
                host_count: 3
            }]
        );
    }

    #[test]
    fn disabled_shortfall_ignores_unplaced_tasks() {
        let scaler = AutoScaler::new(
            vec![AutoScaleRule::new("g", 1, 10, 0).with_shortfall_trigger_capacity(4)],
            None,
            None,
            true,
        );
        let (callback, actions) = capture();
        scaler.set_callback(callback);

        let mut unplaced = HashMap::new();
        unplaced.insert("g".to_string(), 9);
        scaler.evaluate(AutoScalerInput {
            idle_hosts: vec![idle_host("h1", "g", &[])],
            unplaced_by_group: unplaced,
        });

        assert!(actions.lock().is_empty());
    }

    #[test]
    fn mapped_hostname_attribute_overrides_identifier() {
        let scaler = AutoScaler::new(
            vec![AutoScaleRule::new("g", 1, 1, 0)],
            Some("instance-id".to_string()),
            None,
            false,
        );
        let (callback, actions) = capture();
        scaler.set_callback(callback);

        scaler.evaluate(AutoScalerInput {
            idle_hosts: vec![
                idle_host("h1", "g", &[("instance-id", "i-aaa")]),
                idle_host("h2", "g", &[("instance-id", "i-bbb")]),
            ],
            unplaced_by_group: HashMap::new(),
        });

        let guard = actions.lock();
        match &guard[0] {
            AutoScaleAction::ScaleDown { hosts, .. } => {
                assert_eq!(hosts.len(), 1);
                assert!(hosts[0].starts_with("i-"));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }
}
