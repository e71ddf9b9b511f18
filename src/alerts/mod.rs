//! Alert engine
//!
//! Stateful threshold evaluator with hysteresis, duplicate suppression,
//! time-threshold confirmation, rate limiting, quiet hours, an escalation
//! ladder and on-disk persistence of active alerts. The engine never talks
//! to transports itself; raised / resolved / escalated events go through
//! callbacks injected by the owner.

pub mod history;
pub mod rules;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::{GuestSample, Node, Storage};

pub use history::AlertHistory;
pub use rules::{CompareOp, CustomAlertRule, FilterCondition, FilterStack, LogicalOp};

/// Consecutive offline observations before a node-offline alert fires
const REQUIRED_OFFLINE_COUNT: u32 = 3;

/// How long resolved alerts stay visible for UI continuity
const RESOLVED_RETENTION: StdDuration = StdDuration::from_secs(300);

/// A value this far past the trigger escalates the level to critical
const CRITICAL_MARGIN: f64 = 10.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

const ACTIVE_ALERTS_FILE: &str = "active-alerts.json";

// ---------------------------------------------------------------------------
// Threshold configuration

/// Dual-threshold scheme: raise at `trigger`, resolve at or below `clear`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HysteresisThreshold {
    pub trigger: f64,
    pub clear: f64,
}

impl HysteresisThreshold {
    pub fn new(trigger: f64, clear: f64) -> Self {
        Self { trigger, clear }
    }

    /// Fill in a missing clear level and keep `clear <= trigger`
    pub fn normalize(&mut self, margin: f64) {
        if self.clear <= 0.0 {
            self.clear = self.trigger - margin;
        }
        if self.clear > self.trigger {
            self.clear = self.trigger;
        }
    }
}

// Accepts both the hysteresis object form and the legacy bare number; the
// legacy form leaves `clear` at zero until `normalize` fills the margin in.
impl<'de> Deserialize<'de> for HysteresisThreshold {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Spec {
            Hysteresis {
                trigger: f64,
                #[serde(default)]
                clear: f64,
            },
            Legacy(f64),
        }

        Ok(match Spec::deserialize(deserializer)? {
            Spec::Legacy(trigger) => Self { trigger, clear: 0.0 },
            Spec::Hysteresis { trigger, clear } => Self { trigger, clear },
        })
    }
}

/// Optional hysteresis thresholds for each watched metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<HysteresisThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<HysteresisThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<HysteresisThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_read: Option<HysteresisThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_write: Option<HysteresisThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_in: Option<HysteresisThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_out: Option<HysteresisThreshold>,
}

impl ThresholdProfile {
    pub fn normalize(&mut self, margin: f64) {
        for threshold in [
            &mut self.cpu,
            &mut self.memory,
            &mut self.disk,
            &mut self.disk_read,
            &mut self.disk_write,
            &mut self.network_in,
            &mut self.network_out,
        ]
        .into_iter()
        .flatten()
        {
            threshold.normalize(margin);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    pub enabled: bool,
    /// 24-hour "HH:MM"
    pub start: String,
    pub end: String,
    /// IANA timezone name
    pub timezone: String,
    pub days: HashMap<String, bool>,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "22:00".to_string(),
            end: "08:00".to_string(),
            timezone: "America/New_York".to_string(),
            days: rules::default_days(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    Email,
    Webhook,
    All,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationLevel {
    /// Minutes after the alert started
    pub after: i64,
    pub notify: NotifyChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationConfig {
    pub enabled: bool,
    pub levels: Vec<EscalationLevel>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            levels: vec![
                EscalationLevel {
                    after: 15,
                    notify: NotifyChannel::Email,
                },
                EscalationLevel {
                    after: 30,
                    notify: NotifyChannel::Webhook,
                },
                EscalationLevel {
                    after: 60,
                    notify: NotifyChannel::All,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingConfig {
    pub enabled: bool,
    /// Seconds
    pub window: u64,
    pub by_node: bool,
    pub by_guest: bool,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 30,
            by_node: true,
            by_guest: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    pub quiet_hours: QuietHours,
    /// Minutes
    pub cooldown: u64,
    /// Seconds (kept for older settings documents)
    pub grouping_window: u64,
    /// Max notifications per alert per hour; 0 disables the limit
    pub max_alerts_hour: u32,
    pub escalation: EscalationConfig,
    pub grouping: GroupingConfig,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            quiet_hours: QuietHours::default(),
            cooldown: 5,
            grouping_window: 30,
            max_alerts_hour: 10,
            escalation: EscalationConfig::default(),
            grouping: GroupingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub guest_defaults: ThresholdProfile,
    pub node_defaults: ThresholdProfile,
    pub storage_default: HysteresisThreshold,
    /// Keyed by resource id
    pub overrides: HashMap<String, ThresholdProfile>,
    pub custom_rules: Vec<CustomAlertRule>,
    pub schedule: ScheduleConfig,
    /// Minimum change (percentage points / MB/s) between duplicate alerts
    pub minimum_delta: f64,
    /// Minutes a duplicate alert stays suppressed
    pub suppression_window: u64,
    /// Default margin when a legacy single-number threshold is converted
    pub hysteresis_margin: f64,
    /// Seconds the trigger must be continuously exceeded; 0 fires immediately
    pub time_threshold: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            guest_defaults: ThresholdProfile {
                cpu: Some(HysteresisThreshold::new(80.0, 75.0)),
                memory: Some(HysteresisThreshold::new(85.0, 80.0)),
                disk: Some(HysteresisThreshold::new(90.0, 85.0)),
                // I/O thresholds are MB/s
                disk_read: Some(HysteresisThreshold::new(150.0, 125.0)),
                disk_write: Some(HysteresisThreshold::new(150.0, 125.0)),
                network_in: Some(HysteresisThreshold::new(200.0, 175.0)),
                network_out: Some(HysteresisThreshold::new(200.0, 175.0)),
            },
            node_defaults: ThresholdProfile {
                cpu: Some(HysteresisThreshold::new(80.0, 75.0)),
                memory: Some(HysteresisThreshold::new(85.0, 80.0)),
                disk: Some(HysteresisThreshold::new(90.0, 85.0)),
                ..Default::default()
            },
            storage_default: HysteresisThreshold::new(85.0, 80.0),
            overrides: HashMap::new(),
            custom_rules: Vec::new(),
            schedule: ScheduleConfig::default(),
            minimum_delta: 2.0,
            suppression_window: 5,
            hysteresis_margin: 5.0,
            time_threshold: 0,
        }
    }
}

impl AlertConfig {
    /// Apply defaults for zero values and convert any legacy single-number
    /// thresholds. Runs once at config ingress.
    pub fn normalize(&mut self) {
        if self.storage_default.trigger <= 0.0 {
            self.storage_default = HysteresisThreshold::new(85.0, 80.0);
        }
        if self.minimum_delta <= 0.0 {
            self.minimum_delta = 2.0;
        }
        if self.suppression_window == 0 {
            self.suppression_window = 5;
        }
        if self.hysteresis_margin <= 0.0 {
            self.hysteresis_margin = 5.0;
        }

        let margin = self.hysteresis_margin;
        self.guest_defaults.normalize(margin);
        self.node_defaults.normalize(margin);
        self.storage_default.normalize(margin);
        for profile in self.overrides.values_mut() {
            profile.normalize(margin);
        }
        for rule in &mut self.custom_rules {
            rule.thresholds.normalize(margin);
        }
    }
}

// ---------------------------------------------------------------------------
// Alert model

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// A raised, unresolved alert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// `<resourceId>-<metric>`, or `node-offline-<resourceId>`
    pub id: String,
    /// Metric name, or "connectivity" for offline alerts
    #[serde(rename = "type")]
    pub kind: String,
    pub level: AlertLevel,
    pub resource_id: String,
    pub resource_name: String,
    pub node: String,
    pub instance: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub start_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_user: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_escalation: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_times: Vec<DateTime<Utc>>,
}

/// An alert kept for a short while after resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAlert {
    #[serde(flatten)]
    pub alert: Alert,
    pub resolved_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Engine

pub type AlertCallback = Arc<dyn Fn(Alert) + Send + Sync>;
pub type ResolvedCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type EscalateCallback = Arc<dyn Fn(Alert, usize) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_alert: Option<AlertCallback>,
    on_resolved: Option<ResolvedCallback>,
    on_escalate: Option<EscalateCallback>,
}

#[derive(Debug, Clone, Copy)]
struct RecentAlert {
    value: f64,
    start_time: DateTime<Utc>,
}

#[derive(Default)]
struct EngineState {
    config: AlertConfig,
    active: HashMap<String, Alert>,
    recent: HashMap<String, RecentAlert>,
    suppressed_until: HashMap<String, DateTime<Utc>>,
    pending: HashMap<String, DateTime<Utc>>,
    node_offline_count: HashMap<String, u32>,
    rate_limit: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Side effects collected under the engine lock, dispatched after release
#[derive(Default)]
struct Effects {
    raised: Vec<Alert>,
    resolved: Vec<ResolvedAlert>,
    resolved_ids_only: Vec<String>,
    persist: bool,
}

impl Effects {
    fn is_empty(&self) -> bool {
        self.raised.is_empty()
            && self.resolved.is_empty()
            && self.resolved_ids_only.is_empty()
            && !self.persist
    }
}

/// Identity of the resource a metric sample belongs to
struct AlertTarget<'a> {
    resource_id: &'a str,
    resource_name: &'a str,
    node: &'a str,
    instance: &'a str,
    kind: &'a str,
}

/// Stateful alert manager
pub struct AlertManager {
    state: Mutex<EngineState>,
    // Separate lock so resolved-alert GC never contends with evaluation
    resolved: Mutex<HashMap<String, ResolvedAlert>>,
    callbacks: Mutex<Callbacks>,
    history: AlertHistory,
    alerts_dir: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

impl AlertManager {
    /// Create a manager rooted at `<data_dir>/alerts`, restoring persisted
    /// active alerts and history.
    pub fn new(data_dir: &Path) -> Self {
        let alerts_dir = data_dir.join("alerts");
        let (shutdown_tx, _) = watch::channel(false);

        let mut config = AlertConfig::default();
        config.normalize();

        let manager = Self {
            state: Mutex::new(EngineState {
                config,
                ..Default::default()
            }),
            resolved: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Callbacks::default()),
            history: AlertHistory::new(&alerts_dir),
            alerts_dir,
            shutdown_tx,
        };

        if let Err(e) = manager.load_active_alerts() {
            error!(error = %e, "failed to load active alerts");
        }

        manager
    }

    pub fn set_alert_callback(&self, cb: AlertCallback) {
        self.callbacks.lock().expect("callbacks lock poisoned").on_alert = Some(cb);
    }

    pub fn set_resolved_callback(&self, cb: ResolvedCallback) {
        self.callbacks.lock().expect("callbacks lock poisoned").on_resolved = Some(cb);
    }

    pub fn set_escalate_callback(&self, cb: EscalateCallback) {
        self.callbacks.lock().expect("callbacks lock poisoned").on_escalate = Some(cb);
    }

    pub fn update_config(&self, mut config: AlertConfig) {
        config.normalize();
        self.state.lock().expect("engine lock poisoned").config = config;
        info!("alert configuration updated");
    }

    pub fn config(&self) -> AlertConfig {
        self.state.lock().expect("engine lock poisoned").config.clone()
    }

    // -- evaluation entry points ------------------------------------------

    /// Check a VM or container against its resolved thresholds
    pub fn check_guest(&self, sample: &GuestSample, instance: &str) {
        let effects = self.check_guest_at(sample, instance, Utc::now());
        self.dispatch(effects);
    }

    fn check_guest_at(&self, sample: &GuestSample, instance: &str, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        let mut state = self.state.lock().expect("engine lock poisoned");
        if !state.config.enabled {
            return effects;
        }

        // A stopped guest keeps no alerts; pending confirmations go too so
        // a later restart starts from a clean slate.
        if sample.status == "stopped" {
            let removed: Vec<String> = state
                .active
                .values()
                .filter(|alert| alert.resource_id == sample.id)
                .map(|alert| alert.id.clone())
                .collect();
            for id in removed {
                state.active.remove(&id);
                info!(alert_id = %id, guest = %sample.name, "cleared alert for stopped guest");
            }
            let prefix = format!("{}-", sample.id);
            state.pending.retain(|id, _| !id.starts_with(&prefix));
            return effects;
        }

        let thresholds = rules::resolve_guest_thresholds(&state.config, sample);
        let target = AlertTarget {
            resource_id: &sample.id,
            resource_name: &sample.name,
            node: &sample.node,
            instance,
            kind: sample.kind.label(),
        };

        let checks: [(&str, f64, Option<&HysteresisThreshold>); 7] = [
            ("cpu", sample.cpu * 100.0, thresholds.cpu.as_ref()),
            ("memory", sample.memory_usage, thresholds.memory.as_ref()),
            ("disk", sample.disk_usage, thresholds.disk.as_ref()),
            // I/O thresholds compare in MB/s
            (
                "diskRead",
                sample.disk_read as f64 / BYTES_PER_MB,
                thresholds.disk_read.as_ref(),
            ),
            (
                "diskWrite",
                sample.disk_write as f64 / BYTES_PER_MB,
                thresholds.disk_write.as_ref(),
            ),
            (
                "networkIn",
                sample.network_in as f64 / BYTES_PER_MB,
                thresholds.network_in.as_ref(),
            ),
            (
                "networkOut",
                sample.network_out as f64 / BYTES_PER_MB,
                thresholds.network_out.as_ref(),
            ),
        ];

        for (metric, value, threshold) in checks {
            evaluate_metric(
                &mut state,
                &self.history,
                &target,
                metric,
                value,
                threshold,
                now,
                &mut effects,
            );
        }

        effects
    }

    /// Check a node, including offline confirmation
    pub fn check_node(&self, node: &Node) {
        let effects = self.check_node_at(node, Utc::now());
        self.dispatch(effects);
    }

    fn check_node_at(&self, node: &Node, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        let mut state = self.state.lock().expect("engine lock poisoned");
        if !state.config.enabled {
            return effects;
        }

        let offline = node.status == "offline" || node.connection_health.is_down();
        if offline {
            check_node_offline(&mut state, &self.history, node, now, &mut effects);
        } else {
            clear_node_offline(&mut state, node, now, &mut effects);
        }

        if node.status != "offline" {
            let thresholds = state.config.node_defaults.clone();
            let target = AlertTarget {
                resource_id: &node.id,
                resource_name: &node.name,
                node: &node.name,
                instance: &node.instance,
                kind: "Node",
            };
            let checks: [(&str, f64, Option<&HysteresisThreshold>); 3] = [
                ("cpu", node.cpu * 100.0, thresholds.cpu.as_ref()),
                ("memory", node.memory.usage, thresholds.memory.as_ref()),
                ("disk", node.disk.usage, thresholds.disk.as_ref()),
            ];
            for (metric, value, threshold) in checks {
                evaluate_metric(
                    &mut state,
                    &self.history,
                    &target,
                    metric,
                    value,
                    threshold,
                    now,
                    &mut effects,
                );
            }
        }

        effects
    }

    /// Check a storage pool against the single storage threshold
    pub fn check_storage(&self, storage: &Storage) {
        let effects = self.check_storage_at(storage, Utc::now());
        self.dispatch(effects);
    }

    fn check_storage_at(&self, storage: &Storage, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        let mut state = self.state.lock().expect("engine lock poisoned");
        if !state.config.enabled {
            return effects;
        }

        let threshold = state.config.storage_default;
        let target = AlertTarget {
            resource_id: &storage.id,
            resource_name: &storage.name,
            node: &storage.node,
            instance: &storage.instance,
            kind: "Storage",
        };
        evaluate_metric(
            &mut state,
            &self.history,
            &target,
            "usage",
            storage.usage,
            Some(&threshold),
            now,
            &mut effects,
        );

        effects
    }

    // -- queries and mutations --------------------------------------------

    pub fn active_alerts(&self) -> Vec<Alert> {
        let state = self.state.lock().expect("engine lock poisoned");
        state.active.values().cloned().collect()
    }

    /// Resolved alerts still within the retention window
    pub fn recently_resolved(&self) -> Vec<ResolvedAlert> {
        let cutoff = Utc::now() - Duration::seconds(RESOLVED_RETENTION.as_secs() as i64);
        let mut resolved = self.resolved.lock().expect("resolved lock poisoned");
        resolved.retain(|_, r| r.resolved_time > cutoff);
        resolved.values().cloned().collect()
    }

    pub fn acknowledge(&self, alert_id: &str, user: &str) -> Result<(), crate::error::MonitorError> {
        let mut state = self.state.lock().expect("engine lock poisoned");
        match state.active.get_mut(alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                alert.ack_time = Some(Utc::now());
                alert.ack_user = Some(user.to_string());
                Ok(())
            }
            None => Err(crate::error::MonitorError::validation(
                "acknowledge_alert",
                "",
                format!("alert not found: {alert_id}"),
            )),
        }
    }

    pub fn unacknowledge(&self, alert_id: &str) -> Result<(), crate::error::MonitorError> {
        let mut state = self.state.lock().expect("engine lock poisoned");
        match state.active.get_mut(alert_id) {
            Some(alert) => {
                alert.acknowledged = false;
                alert.ack_time = None;
                alert.ack_user = None;
                Ok(())
            }
            None => Err(crate::error::MonitorError::validation(
                "unacknowledge_alert",
                "",
                format!("alert not found: {alert_id}"),
            )),
        }
    }

    /// Manually clear an alert, notifying subscribers
    pub fn clear_alert(&self, alert_id: &str) {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().expect("engine lock poisoned");
            if state.active.remove(alert_id).is_some() {
                effects.resolved_ids_only.push(alert_id.to_string());
                effects.persist = true;
            }
        }
        self.dispatch(effects);
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.history.all(limit)
    }

    pub fn clear_alert_history(&self) -> std::io::Result<()> {
        self.history.clear()
    }

    /// Prune acknowledged alerts older than `max_age`, recent-alert and
    /// suppression entries past their windows, and expired resolved alerts.
    pub fn cleanup(&self, max_age: StdDuration) {
        let now = Utc::now();
        let max_age = Duration::from_std(max_age).unwrap_or_else(|_| Duration::hours(24));
        {
            let mut state = self.state.lock().expect("engine lock poisoned");

            state.active.retain(|_, alert| {
                !(alert.acknowledged
                    && alert.ack_time.map(|at| now - at > max_age).unwrap_or(false))
            });

            let suppression = Duration::minutes(state.config.suppression_window.max(1) as i64);
            state.recent.retain(|_, recent| now - recent.start_time <= suppression);
            state.suppressed_until.retain(|_, until| *until > now);
        }

        let resolved_cutoff = now - Duration::seconds(RESOLVED_RETENTION.as_secs() as i64);
        let mut resolved = self.resolved.lock().expect("resolved lock poisoned");
        resolved.retain(|_, r| r.resolved_time > resolved_cutoff);
    }

    // -- escalation --------------------------------------------------------

    /// One escalation scan over active, unacknowledged alerts
    pub fn check_escalations(&self) {
        let escalated = self.check_escalations_at(Utc::now());
        if escalated.is_empty() {
            return;
        }
        let on_escalate = self
            .callbacks
            .lock()
            .expect("callbacks lock poisoned")
            .on_escalate
            .clone();
        if let Some(cb) = on_escalate {
            for (alert, level) in escalated {
                cb(alert, level);
            }
        }
    }

    fn check_escalations_at(&self, now: DateTime<Utc>) -> Vec<(Alert, usize)> {
        let mut state = self.state.lock().expect("engine lock poisoned");
        if !state.config.schedule.escalation.enabled {
            return Vec::new();
        }

        let levels = state.config.schedule.escalation.levels.clone();
        let mut escalated = Vec::new();

        for alert in state.active.values_mut() {
            if alert.acknowledged {
                continue;
            }
            for (index, level) in levels.iter().enumerate() {
                let level_number = index + 1;
                if alert.last_escalation >= level_number {
                    continue;
                }
                if now >= alert.start_time + Duration::minutes(level.after) {
                    alert.last_escalation = level_number;
                    alert.escalation_times.push(now);
                    info!(alert_id = %alert.id, level = level_number, "alert escalated");
                    escalated.push((alert.clone(), level_number));
                }
            }
        }

        escalated
    }

    // -- persistence -------------------------------------------------------

    /// Write all active alerts to `active-alerts.json` via tmp + rename
    pub fn save_active_alerts(&self) -> std::io::Result<()> {
        let alerts = self.active_alerts();
        write_active_alerts(&self.alerts_dir, &alerts)
    }

    fn load_active_alerts(&self) -> std::io::Result<()> {
        let path = self.alerts_dir.join(ACTIVE_ALERTS_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no active alerts file found, starting fresh");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let alerts: Vec<Alert> = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let now = Utc::now();
        let mut state = self.state.lock().expect("engine lock poisoned");
        let total = alerts.len();
        let mut restored = 0;
        for alert in alerts {
            if now - alert.start_time > Duration::hours(24) {
                continue;
            }
            if alert.acknowledged
                && alert.ack_time.map(|at| now - at > Duration::hours(1)).unwrap_or(false)
            {
                continue;
            }
            state.active.insert(alert.id.clone(), alert);
            restored += 1;
        }
        info!(restored, total, "restored active alerts from disk");
        Ok(())
    }

    fn persist_async(&self) {
        let alerts = self.active_alerts();
        let dir = self.alerts_dir.clone();
        let write = move || {
            if let Err(e) = write_active_alerts(&dir, &alerts) {
                error!(error = %e, "failed to save active alerts");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    // -- background tasks --------------------------------------------------

    /// Run the escalation scan, periodic saves and cleanup until [`stop`]
    ///
    /// [`stop`]: AlertManager::stop
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut escalation_tick = tokio::time::interval(StdDuration::from_secs(60));
            let mut save_tick = tokio::time::interval(StdDuration::from_secs(60));
            let mut history_tick = tokio::time::interval(StdDuration::from_secs(300));
            let mut cleanup_tick = tokio::time::interval(StdDuration::from_secs(600));

            loop {
                tokio::select! {
                    _ = escalation_tick.tick() => manager.check_escalations(),
                    _ = save_tick.tick() => {
                        if let Err(e) = manager.save_active_alerts() {
                            error!(error = %e, "periodic active-alert save failed");
                        }
                    }
                    _ = history_tick.tick() => {
                        manager.history.prune_old();
                        if let Err(e) = manager.history.save() {
                            error!(error = %e, "periodic history save failed");
                        }
                    }
                    _ = cleanup_tick.tick() => manager.cleanup(StdDuration::from_secs(24 * 3600)),
                    _ = shutdown.changed() => break,
                }
            }
            debug!("alert background tasks stopped");
        });
    }

    /// Stop background tasks and flush state to disk
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.save_active_alerts() {
            error!(error = %e, "failed to save active alerts on stop");
        }
        if let Err(e) = self.history.save() {
            error!(error = %e, "failed to save alert history on stop");
        }
    }

    // -- effect dispatch ---------------------------------------------------

    fn dispatch(&self, effects: Effects) {
        if effects.is_empty() {
            return;
        }

        let (on_alert, on_resolved) = {
            let callbacks = self.callbacks.lock().expect("callbacks lock poisoned");
            (callbacks.on_alert.clone(), callbacks.on_resolved.clone())
        };

        for alert in effects.raised {
            if let Some(cb) = &on_alert {
                cb(alert);
            }
        }

        for resolved_alert in effects.resolved {
            let id = resolved_alert.alert.id.clone();
            self.resolved
                .lock()
                .expect("resolved lock poisoned")
                .insert(id.clone(), resolved_alert);
            if let Some(cb) = &on_resolved {
                cb(id);
            }
        }

        for id in effects.resolved_ids_only {
            if let Some(cb) = &on_resolved {
                cb(id);
            }
        }

        if effects.persist {
            self.persist_async();
        }
    }
}

fn write_active_alerts(dir: &Path, alerts: &[Alert]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let data = serde_json::to_vec_pretty(alerts)?;
    let tmp = dir.join(format!("{ACTIVE_ALERTS_FILE}.tmp"));
    let target = dir.join(ACTIVE_ALERTS_FILE);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &target)?;
    debug!(count = alerts.len(), "saved active alerts to disk");
    Ok(())
}

// ---------------------------------------------------------------------------
// Core evaluation

#[allow(clippy::too_many_arguments)]
fn evaluate_metric(
    state: &mut EngineState,
    history: &AlertHistory,
    target: &AlertTarget<'_>,
    metric: &str,
    value: f64,
    threshold: Option<&HysteresisThreshold>,
    now: DateTime<Utc>,
    effects: &mut Effects,
) {
    let Some(threshold) = threshold else { return };
    if threshold.trigger <= 0.0 {
        return;
    }

    let alert_id = format!("{}-{}", target.resource_id, metric);

    if let Some(until) = state.suppressed_until.get(&alert_id) {
        if now < *until {
            return;
        }
    }

    if value >= threshold.trigger {
        if let Some(existing) = state.active.get_mut(&alert_id) {
            existing.last_seen = now;
            existing.value = value;
            existing.level = level_for(value, threshold.trigger);
            return;
        }

        // Time-threshold confirmation: the first observation only records
        // when the breach started; the alert fires once the breach has
        // lasted long enough.
        if state.config.time_threshold > 0 {
            match state.pending.get(&alert_id).copied() {
                Some(since) => {
                    if (now - since).num_seconds() < state.config.time_threshold as i64 {
                        return;
                    }
                    state.pending.remove(&alert_id);
                }
                None => {
                    state.pending.insert(alert_id, now);
                    return;
                }
            }
        }

        // Duplicate suppression: a near-identical alert inside the
        // suppression window is dropped and the id muted for the window.
        if let Some(recent) = state.recent.get(&alert_id).copied() {
            let window = Duration::minutes(state.config.suppression_window as i64);
            if state.config.minimum_delta > 0.0
                && now - recent.start_time < window
                && (recent.value - value).abs() < state.config.minimum_delta
            {
                state.suppressed_until.insert(alert_id, now + window);
                return;
            }
        }

        let message = if metric == "usage" {
            format!("{} at {value:.1}%", target.kind)
        } else {
            format!("{} {metric} at {value:.1}%", target.kind)
        };

        let mut metadata = HashMap::new();
        metadata.insert(
            "resourceType".to_string(),
            serde_json::Value::String(target.kind.to_string()),
        );
        metadata.insert(
            "clearThreshold".to_string(),
            serde_json::json!(threshold.clear),
        );

        let alert = Alert {
            id: alert_id.clone(),
            kind: metric.to_string(),
            level: level_for(value, threshold.trigger),
            resource_id: target.resource_id.to_string(),
            resource_name: target.resource_name.to_string(),
            node: target.node.to_string(),
            instance: target.instance.to_string(),
            message,
            value,
            threshold: threshold.trigger,
            start_time: now,
            last_seen: now,
            acknowledged: false,
            ack_time: None,
            ack_user: None,
            metadata,
            last_escalation: 0,
            escalation_times: Vec::new(),
        };

        state.active.insert(alert_id.clone(), alert.clone());
        state.recent.insert(
            alert_id.clone(),
            RecentAlert {
                value,
                start_time: now,
            },
        );
        history.add(alert.clone());
        effects.persist = true;

        warn!(
            alert_id = %alert_id,
            resource = %target.resource_name,
            metric,
            value,
            trigger = threshold.trigger,
            "alert triggered"
        );

        // The rate limit applies to the notification only; the alert stays
        // in state either way.
        if !check_rate_limit(state, &alert_id, now) {
            debug!(alert_id = %alert_id, "alert notification suppressed by rate limit");
            return;
        }

        if alert.level != AlertLevel::Critical
            && is_in_quiet_hours(&state.config.schedule.quiet_hours, now)
        {
            debug!(alert_id = %alert_id, "alert notification suppressed by quiet hours");
            return;
        }

        effects.raised.push(alert);
    } else {
        state.pending.remove(&alert_id);

        let Some(existing) = state.active.get(&alert_id) else {
            return;
        };

        let clear = if threshold.clear > 0.0 {
            threshold.clear
        } else {
            threshold.trigger
        };

        if value <= clear {
            let alert = existing.clone();
            state.active.remove(&alert_id);
            info!(
                alert_id = %alert_id,
                resource = %target.resource_name,
                metric,
                value,
                clear,
                "alert resolved"
            );
            effects.resolved.push(ResolvedAlert {
                alert,
                resolved_time: now,
            });
            effects.persist = true;
        }
    }
}

fn level_for(value: f64, trigger: f64) -> AlertLevel {
    if value >= trigger + CRITICAL_MARGIN {
        AlertLevel::Critical
    } else {
        AlertLevel::Warning
    }
}

fn check_node_offline(
    state: &mut EngineState,
    history: &AlertHistory,
    node: &Node,
    now: DateTime<Utc>,
    effects: &mut Effects,
) {
    let alert_id = format!("node-offline-{}", node.id);

    if let Some(existing) = state.active.get_mut(&alert_id) {
        existing.last_seen = now;
        return;
    }

    let count = state.node_offline_count.entry(node.id.clone()).or_insert(0);
    *count += 1;
    let count = *count;

    // Transient cluster hiccups produce single offline observations; wait
    // for three in a row before alerting.
    if count < REQUIRED_OFFLINE_COUNT {
        info!(
            node = %node.name,
            count,
            required = REQUIRED_OFFLINE_COUNT,
            "node appears offline, waiting for confirmation"
        );
        return;
    }

    let alert = Alert {
        id: alert_id.clone(),
        kind: "connectivity".to_string(),
        level: AlertLevel::Critical,
        resource_id: node.id.clone(),
        resource_name: node.name.clone(),
        node: node.name.clone(),
        instance: node.instance.clone(),
        message: format!("Node '{}' is offline", node.name),
        value: 0.0,
        threshold: 0.0,
        start_time: now,
        last_seen: now,
        acknowledged: false,
        ack_time: None,
        ack_user: None,
        metadata: HashMap::new(),
        last_escalation: 0,
        escalation_times: Vec::new(),
    };

    state.active.insert(alert_id, alert.clone());
    state.recent.insert(
        alert.id.clone(),
        RecentAlert {
            value: 0.0,
            start_time: now,
        },
    );
    history.add(alert.clone());
    effects.persist = true;

    error!(
        node = %node.name,
        instance = %node.instance,
        confirmed_after = REQUIRED_OFFLINE_COUNT,
        "node is offline (confirmed)"
    );

    effects.raised.push(alert);
}

fn clear_node_offline(
    state: &mut EngineState,
    node: &Node,
    now: DateTime<Utc>,
    effects: &mut Effects,
) {
    let alert_id = format!("node-offline-{}", node.id);

    if state.node_offline_count.remove(&node.id).is_some() {
        debug!(node = %node.name, "node back online, offline count reset");
    }

    let Some(alert) = state.active.remove(&alert_id) else {
        return;
    };

    info!(
        node = %node.name,
        instance = %node.instance,
        downtime_secs = (now - alert.start_time).num_seconds(),
        "node is back online"
    );

    effects.resolved.push(ResolvedAlert {
        alert,
        resolved_time: now,
    });
    effects.persist = true;
}

/// Sliding one-hour notification budget per alert id. Entries are pruned
/// on every call, so a long-lived id never accumulates unbounded history.
fn check_rate_limit(state: &mut EngineState, alert_id: &str, now: DateTime<Utc>) -> bool {
    let max = state.config.schedule.max_alerts_hour;
    if max == 0 {
        return true;
    }

    let cutoff = now - Duration::hours(1);
    let times = state.rate_limit.entry(alert_id.to_string()).or_default();
    times.retain(|t| *t > cutoff);

    if times.len() >= max as usize {
        return false;
    }
    times.push(now);
    true
}

/// Whether `now` falls in the configured quiet hours, honoring enabled
/// weekdays and overnight windows. Criticals bypass this at the call site.
fn is_in_quiet_hours(config: &QuietHours, now: DateTime<Utc>) -> bool {
    if !config.enabled {
        return false;
    }

    let tz: Tz = match config.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = %config.timezone, "unknown quiet-hours timezone, using UTC");
            chrono_tz::UTC
        }
    };
    let local = now.with_timezone(&tz);

    let day = weekday_name(local.weekday());
    if !config.days.get(day).copied().unwrap_or(false) {
        return false;
    }

    let (Ok(start), Ok(end)) = (
        NaiveTime::parse_from_str(&config.start, "%H:%M"),
        NaiveTime::parse_from_str(&config.end, "%H:%M"),
    ) else {
        warn!(start = %config.start, end = %config.end, "failed to parse quiet hours");
        return false;
    };

    let time = local.time();
    if end < start {
        // Overnight window, e.g. 22:00 to 08:00
        time >= start || time < end
    } else {
        time >= start && time < end
    }
}

fn weekday_name(weekday: chrono::Weekday) -> &'static str {
    match weekday {
        chrono::Weekday::Mon => "monday",
        chrono::Weekday::Tue => "tuesday",
        chrono::Weekday::Wed => "wednesday",
        chrono::Weekday::Thu => "thursday",
        chrono::Weekday::Fri => "friday",
        chrono::Weekday::Sat => "saturday",
        chrono::Weekday::Sun => "sunday",
    }
}
