//! Integration tests for the alert engine lifecycle
//!
//! These drive the public API end to end: threshold evaluation with
//! hysteresis, duplicate suppression, persistence across restarts and the
//! callback wiring.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use proxmon::alerts::{
    Alert, AlertConfig, AlertLevel, AlertManager, HysteresisThreshold, ThresholdProfile,
};
use proxmon::models::{GuestKind, GuestSample};

fn memory_sample(id: &str, value: f64) -> GuestSample {
    GuestSample {
        id: id.to_string(),
        name: "web01".to_string(),
        node: "px1".to_string(),
        status: "running".to_string(),
        kind: GuestKind::Qemu,
        cpu: 0.1,
        memory_usage: value,
        disk_usage: 10.0,
        disk_read: 0,
        disk_write: 0,
        network_in: 0,
        network_out: 0,
    }
}

fn memory_only_config(trigger: f64, clear: f64) -> AlertConfig {
    AlertConfig {
        guest_defaults: ThresholdProfile {
            memory: Some(HysteresisThreshold::new(trigger, clear)),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn alert_raises_and_resolves_through_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let manager = AlertManager::new(dir.path());
    manager.update_config(memory_only_config(85.0, 80.0));

    let raised = Arc::new(AtomicUsize::new(0));
    let resolved = Arc::new(AtomicUsize::new(0));
    {
        let raised = Arc::clone(&raised);
        manager.set_alert_callback(Arc::new(move |alert: Alert| {
            assert_eq!(alert.id, "lab-px1-100-memory");
            assert_eq!(alert.level, AlertLevel::Warning);
            raised.fetch_add(1, Ordering::SeqCst);
        }));
        let resolved = Arc::clone(&resolved);
        manager.set_resolved_callback(Arc::new(move |alert_id: String| {
            assert_eq!(alert_id, "lab-px1-100-memory");
            resolved.fetch_add(1, Ordering::SeqCst);
        }));
    }

    manager.check_guest(&memory_sample("lab-px1-100", 86.0), "lab");
    assert_eq!(raised.load(Ordering::SeqCst), 1);
    assert_eq!(manager.active_alerts().len(), 1);

    // Between clear and trigger: still active
    manager.check_guest(&memory_sample("lab-px1-100", 82.0), "lab");
    assert_eq!(manager.active_alerts().len(), 1);
    assert_eq!(resolved.load(Ordering::SeqCst), 0);

    // At the clear level: resolved
    manager.check_guest(&memory_sample("lab-px1-100", 80.0), "lab");
    assert!(manager.active_alerts().is_empty());
    assert_eq!(resolved.load(Ordering::SeqCst), 1);

    let recent = manager.recently_resolved();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].alert.id, "lab-px1-100-memory");
}

#[tokio::test]
async fn persistence_round_trip_restores_active_alerts() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = AlertManager::new(dir.path());
        manager.update_config(memory_only_config(85.0, 80.0));
        manager.check_guest(&memory_sample("lab-px1-100", 92.0), "lab");
        manager.check_guest(&memory_sample("lab-px1-101", 88.0), "lab");
        assert_eq!(manager.active_alerts().len(), 2);
        manager.save_active_alerts().unwrap();
    }

    let reloaded = AlertManager::new(dir.path());
    let mut ids: Vec<String> = reloaded.active_alerts().into_iter().map(|a| a.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["lab-px1-100-memory", "lab-px1-101-memory"]);
}

#[tokio::test]
async fn load_drops_stale_and_long_acknowledged_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let alerts_dir = dir.path().join("alerts");
    std::fs::create_dir_all(&alerts_dir).unwrap();

    let now = Utc::now();
    let fresh = serde_json::json!({
        "id": "lab-px1-100-memory",
        "type": "memory",
        "level": "warning",
        "resourceId": "lab-px1-100",
        "resourceName": "web01",
        "node": "px1",
        "instance": "lab",
        "message": "VM memory at 90.0%",
        "value": 90.0,
        "threshold": 85.0,
        "startTime": now - Duration::hours(1),
        "lastSeen": now,
        "acknowledged": false,
        "lastEscalation": 0
    });
    let stale = serde_json::json!({
        "id": "lab-px1-200-cpu",
        "type": "cpu",
        "level": "warning",
        "resourceId": "lab-px1-200",
        "resourceName": "db01",
        "node": "px1",
        "instance": "lab",
        "message": "VM cpu at 95.0%",
        "value": 95.0,
        "threshold": 80.0,
        "startTime": now - Duration::hours(25),
        "lastSeen": now - Duration::hours(25),
        "acknowledged": false,
        "lastEscalation": 0
    });
    let acked_long_ago = serde_json::json!({
        "id": "lab-px1-300-disk",
        "type": "disk",
        "level": "warning",
        "resourceId": "lab-px1-300",
        "resourceName": "cache01",
        "node": "px1",
        "instance": "lab",
        "message": "VM disk at 95.0%",
        "value": 95.0,
        "threshold": 90.0,
        "startTime": now - Duration::hours(3),
        "lastSeen": now,
        "acknowledged": true,
        "ackTime": now - Duration::hours(2),
        "ackUser": "admin",
        "lastEscalation": 0
    });

    std::fs::write(
        alerts_dir.join("active-alerts.json"),
        serde_json::to_vec_pretty(&vec![fresh, stale, acked_long_ago]).unwrap(),
    )
    .unwrap();

    let manager = AlertManager::new(dir.path());
    let alerts = manager.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, "lab-px1-100-memory");
}

#[tokio::test]
async fn stopped_guest_invariant_holds() {
    let dir = tempfile::tempdir().unwrap();
    let manager = AlertManager::new(dir.path());
    manager.update_config(AlertConfig::default());

    let mut sample = memory_sample("lab-px1-100", 95.0);
    sample.cpu = 0.99;
    manager.check_guest(&sample, "lab");
    assert!(!manager.active_alerts().is_empty());

    let mut stopped = memory_sample("lab-px1-100", 0.0);
    stopped.status = "stopped".to_string();
    stopped.cpu = 0.0;
    manager.check_guest(&stopped, "lab");

    // No active alert may reference a stopped guest
    assert!(manager
        .active_alerts()
        .iter()
        .all(|a| a.resource_id != "lab-px1-100"));
}

#[tokio::test]
async fn time_threshold_confirmation_with_real_clock() {
    let dir = tempfile::tempdir().unwrap();
    let manager = AlertManager::new(dir.path());
    let mut config = memory_only_config(85.0, 80.0);
    config.time_threshold = 1;
    manager.update_config(config);

    manager.check_guest(&memory_sample("lab-px1-100", 90.0), "lab");
    assert!(manager.active_alerts().is_empty(), "first breach only starts the clock");

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    manager.check_guest(&memory_sample("lab-px1-100", 90.0), "lab");
    assert_eq!(manager.active_alerts().len(), 1);
}

#[tokio::test]
async fn clear_alert_notifies_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let manager = AlertManager::new(dir.path());
    manager.update_config(memory_only_config(85.0, 80.0));

    let resolved = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resolved);
    manager.set_resolved_callback(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    manager.check_guest(&memory_sample("lab-px1-100", 90.0), "lab");
    manager.clear_alert("lab-px1-100-memory");

    assert!(manager.active_alerts().is_empty());
    assert_eq!(resolved.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acknowledged_alert_survives_but_carries_ack_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let manager = AlertManager::new(dir.path());
    manager.update_config(memory_only_config(85.0, 80.0));

    manager.check_guest(&memory_sample("lab-px1-100", 90.0), "lab");
    manager.acknowledge("lab-px1-100-memory", "operator").unwrap();

    let alerts = manager.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].acknowledged);
    assert_eq!(alerts[0].ack_user.as_deref(), Some("operator"));
    assert!(alerts[0].ack_time.is_some());

    manager.unacknowledge("lab-px1-100-memory").unwrap();
    let alerts = manager.active_alerts();
    assert!(!alerts[0].acknowledged);
    assert!(alerts[0].ack_user.is_none());
}
