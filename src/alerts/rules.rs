//! Custom alert rules and their filter language
//!
//! A rule is a flat list of conditions combined by a single AND/OR at the
//! top level; no nested groups. Text matching is case-insensitive. The
//! highest-priority enabled rule whose filter matches a guest overlays the
//! default thresholds; per-guest overrides win over everything.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AlertConfig, ThresholdProfile};
use crate::models::GuestSample;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=", alias = "==")]
    Eq,
}

impl CompareOp {
    fn matches(self, value: f64, target: f64) -> bool {
        match self {
            CompareOp::Gt => value > target,
            CompareOp::Lt => value < target,
            CompareOp::Ge => value >= target,
            CompareOp::Le => value <= target,
            // Equality on sampled floats means "within half a unit"
            CompareOp::Eq => (value - target).abs() <= 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterCondition {
    Metric {
        field: String,
        operator: CompareOp,
        value: f64,
    },
    Text {
        field: String,
        value: String,
    },
    Raw {
        #[serde(rename = "rawText")]
        text: String,
    },
}

impl FilterCondition {
    fn matches(&self, sample: &GuestSample) -> bool {
        match self {
            FilterCondition::Metric {
                field,
                operator,
                value,
            } => {
                let observed = match field.to_lowercase().as_str() {
                    "cpu" => sample.cpu * 100.0,
                    "memory" => sample.memory_usage,
                    "disk" => sample.disk_usage,
                    "diskread" => sample.disk_read as f64 / BYTES_PER_MB,
                    "diskwrite" => sample.disk_write as f64 / BYTES_PER_MB,
                    "networkin" => sample.network_in as f64 / BYTES_PER_MB,
                    "networkout" => sample.network_out as f64 / BYTES_PER_MB,
                    _ => return false,
                };
                operator.matches(observed, *value)
            }
            FilterCondition::Text { field, value } => {
                let needle = value.to_lowercase();
                match field.to_lowercase().as_str() {
                    "name" => sample.name.to_lowercase().contains(&needle),
                    "node" => sample.node.to_lowercase().contains(&needle),
                    "vmid" => sample.id.to_lowercase().contains(&needle),
                    _ => false,
                }
            }
            FilterCondition::Raw { text } => {
                if text.is_empty() {
                    return false;
                }
                let needle = text.to_lowercase();
                sample.name.to_lowercase().contains(&needle)
                    || sample.id.to_lowercase().contains(&needle)
                    || sample.node.to_lowercase().contains(&needle)
                    || sample.status.to_lowercase().contains(&needle)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogicalOp {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStack {
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    #[serde(default, rename = "logicalOperator")]
    pub operator: LogicalOp,
}

impl FilterStack {
    /// An empty stack matches everything
    pub fn matches(&self, sample: &GuestSample) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        match self.operator {
            LogicalOp::And => self.filters.iter().all(|f| f.matches(sample)),
            LogicalOp::Or => self.filters.iter().any(|f| f.matches(sample)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomAlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub filter_conditions: FilterStack,
    #[serde(default)]
    pub thresholds: ThresholdProfile,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Thresholds for one guest: defaults, overlaid by the highest-priority
/// enabled custom rule that matches, overlaid by a per-guest override.
pub fn resolve_guest_thresholds(config: &AlertConfig, sample: &GuestSample) -> ThresholdProfile {
    let mut thresholds = config.guest_defaults.clone();

    let best_rule = config
        .custom_rules
        .iter()
        .filter(|rule| rule.enabled)
        .filter(|rule| rule.filter_conditions.matches(sample))
        .max_by_key(|rule| rule.priority);

    if let Some(rule) = best_rule {
        overlay(&mut thresholds, &rule.thresholds);
    }

    if let Some(override_profile) = config.overrides.get(&sample.id) {
        overlay(&mut thresholds, override_profile);
    }

    thresholds
}

fn overlay(base: &mut ThresholdProfile, over: &ThresholdProfile) {
    for (slot, value) in [
        (&mut base.cpu, &over.cpu),
        (&mut base.memory, &over.memory),
        (&mut base.disk, &over.disk),
        (&mut base.disk_read, &over.disk_read),
        (&mut base.disk_write, &over.disk_write),
        (&mut base.network_in, &over.network_in),
        (&mut base.network_out, &over.network_out),
    ] {
        if value.is_some() {
            *slot = *value;
        }
    }
}

/// Default quiet-hours weekday map: weekdays on, weekend off
pub(super) fn default_days() -> HashMap<String, bool> {
    [
        ("monday", true),
        ("tuesday", true),
        ("wednesday", true),
        ("thursday", true),
        ("friday", true),
        ("saturday", false),
        ("sunday", false),
    ]
    .into_iter()
    .map(|(day, enabled)| (day.to_string(), enabled))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::HysteresisThreshold;
    use crate::models::GuestKind;

    fn sample(name: &str, cpu: f64) -> GuestSample {
        GuestSample {
            id: "lab-px1-100".to_string(),
            name: name.to_string(),
            node: "px1".to_string(),
            status: "running".to_string(),
            kind: GuestKind::Qemu,
            cpu,
            memory_usage: 40.0,
            disk_usage: 30.0,
            disk_read: 0,
            disk_write: 0,
            network_in: 0,
            network_out: 0,
        }
    }

    #[test]
    fn metric_condition_compares_percent_cpu() {
        let condition = FilterCondition::Metric {
            field: "cpu".to_string(),
            operator: CompareOp::Ge,
            value: 50.0,
        };
        assert!(condition.matches(&sample("web", 0.6)));
        assert!(!condition.matches(&sample("web", 0.4)));
    }

    #[test]
    fn text_condition_is_case_insensitive() {
        let condition = FilterCondition::Text {
            field: "name".to_string(),
            value: "WEB".to_string(),
        };
        assert!(condition.matches(&sample("webserver", 0.1)));
        assert!(!condition.matches(&sample("db01", 0.1)));
    }

    #[test]
    fn raw_condition_searches_multiple_fields() {
        let condition = FilterCondition::Raw {
            text: "px1".to_string(),
        };
        assert!(condition.matches(&sample("db01", 0.1)));

        let condition = FilterCondition::Raw {
            text: "running".to_string(),
        };
        assert!(condition.matches(&sample("db01", 0.1)));

        let condition = FilterCondition::Raw {
            text: String::new(),
        };
        assert!(!condition.matches(&sample("db01", 0.1)));
    }

    #[test]
    fn and_requires_all_conditions() {
        let stack = FilterStack {
            filters: vec![
                FilterCondition::Text {
                    field: "name".to_string(),
                    value: "web".to_string(),
                },
                FilterCondition::Metric {
                    field: "cpu".to_string(),
                    operator: CompareOp::Gt,
                    value: 50.0,
                },
            ],
            operator: LogicalOp::And,
        };
        assert!(stack.matches(&sample("web01", 0.9)));
        assert!(!stack.matches(&sample("web01", 0.1)));
        assert!(!stack.matches(&sample("db01", 0.9)));
    }

    #[test]
    fn or_requires_any_condition() {
        let stack = FilterStack {
            filters: vec![
                FilterCondition::Text {
                    field: "name".to_string(),
                    value: "web".to_string(),
                },
                FilterCondition::Text {
                    field: "name".to_string(),
                    value: "db".to_string(),
                },
            ],
            operator: LogicalOp::Or,
        };
        assert!(stack.matches(&sample("web01", 0.1)));
        assert!(stack.matches(&sample("db01", 0.1)));
        assert!(!stack.matches(&sample("cache01", 0.1)));
    }

    #[test]
    fn empty_stack_matches_everything() {
        assert!(FilterStack::default().matches(&sample("anything", 0.0)));
    }

    #[test]
    fn rule_priority_and_override_precedence() {
        let mut config = AlertConfig::default();
        config.custom_rules = vec![
            CustomAlertRule {
                id: "low".to_string(),
                name: "low priority".to_string(),
                priority: 1,
                enabled: true,
                thresholds: ThresholdProfile {
                    cpu: Some(HysteresisThreshold::new(50.0, 45.0)),
                    ..Default::default()
                },
                ..Default::default()
            },
            CustomAlertRule {
                id: "high".to_string(),
                name: "high priority".to_string(),
                priority: 10,
                enabled: true,
                thresholds: ThresholdProfile {
                    cpu: Some(HysteresisThreshold::new(60.0, 55.0)),
                    ..Default::default()
                },
                ..Default::default()
            },
            CustomAlertRule {
                id: "disabled".to_string(),
                name: "disabled".to_string(),
                priority: 100,
                enabled: false,
                thresholds: ThresholdProfile {
                    cpu: Some(HysteresisThreshold::new(5.0, 1.0)),
                    ..Default::default()
                },
                ..Default::default()
            },
        ];

        let guest = sample("web01", 0.1);
        let resolved = resolve_guest_thresholds(&config, &guest);
        // Highest-priority enabled rule wins; disabled rule is skipped
        assert_eq!(resolved.cpu.unwrap().trigger, 60.0);
        // Fields the rule does not set keep the defaults
        assert_eq!(resolved.memory, config.guest_defaults.memory);

        // A per-guest override beats every rule
        config.overrides.insert(
            guest.id.clone(),
            ThresholdProfile {
                cpu: Some(HysteresisThreshold::new(95.0, 90.0)),
                ..Default::default()
            },
        );
        let resolved = resolve_guest_thresholds(&config, &guest);
        assert_eq!(resolved.cpu.unwrap().trigger, 95.0);
    }

    #[test]
    fn wire_format_round_trips() {
        let json = r#"{
            "filters": [
                {"type": "metric", "field": "cpu", "operator": ">=", "value": 80},
                {"type": "text", "field": "name", "value": "prod"},
                {"type": "raw", "rawText": "px2"}
            ],
            "logicalOperator": "OR"
        }"#;
        let stack: FilterStack = serde_json::from_str(json).unwrap();
        assert_eq!(stack.filters.len(), 3);
        assert_eq!(stack.operator, LogicalOp::Or);

        let encoded = serde_json::to_string(&stack).unwrap();
        let decoded: FilterStack = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.filters.len(), 3);
    }
}
