//! Authoritative state aggregate
//!
//! Resources are sharded by instance: every update replaces only the rows
//! belonging to one instance, so a slow or failing poll on instance A can
//! never partially overwrite another instance's data. Snapshots are full
//! clones; readers can never observe a torn write.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::alerts::{Alert, ResolvedAlert};
use crate::models::{
    BackupTask, Container, GuestSnapshot, Node, PbsBackup, PbsInstanceStatus, Stats, Storage,
    StorageBackup, Vm,
};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub nodes: Vec<Node>,
    pub vms: Vec<Vm>,
    pub containers: Vec<Container>,
    pub storage: Vec<Storage>,
    pub pve_backups: Vec<StorageBackup>,
    pub guest_snapshots: Vec<GuestSnapshot>,
    pub backup_tasks: Vec<BackupTask>,
    pub pbs_instances: Vec<PbsInstanceStatus>,
    pub pbs_backups: Vec<PbsBackup>,
    pub active_alerts: Vec<Alert>,
    pub recently_resolved: Vec<ResolvedAlert>,
    pub connection_health: HashMap<String, bool>,
    pub stats: Stats,
}

/// Shared aggregate with per-instance atomic replacement
#[derive(Default)]
pub struct State {
    inner: RwLock<StateSnapshot>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_nodes_for_instance(&self, instance: &str, nodes: Vec<Node>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.nodes.retain(|n| n.instance != instance);
        inner.nodes.extend(nodes);
    }

    pub fn update_vms_for_instance(&self, instance: &str, vms: Vec<Vm>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.vms.retain(|v| v.instance != instance);
        inner.vms.extend(vms);
    }

    pub fn update_containers_for_instance(&self, instance: &str, containers: Vec<Container>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.containers.retain(|c| c.instance != instance);
        inner.containers.extend(containers);
    }

    pub fn update_storage_for_instance(&self, instance: &str, storage: Vec<Storage>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.storage.retain(|s| s.instance != instance);
        inner.storage.extend(storage);
    }

    pub fn update_pve_backups_for_instance(&self, instance: &str, backups: Vec<StorageBackup>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner
            .pve_backups
            .retain(|b| !b.id.starts_with(&format!("{instance}-")));
        inner.pve_backups.extend(backups);
    }

    pub fn update_guest_snapshots_for_instance(
        &self,
        instance: &str,
        snapshots: Vec<GuestSnapshot>,
    ) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner
            .guest_snapshots
            .retain(|s| !s.id.starts_with(&format!("{instance}-")));
        inner.guest_snapshots.extend(snapshots);
    }

    pub fn update_backup_tasks_for_instance(&self, instance: &str, tasks: Vec<BackupTask>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner
            .backup_tasks
            .retain(|t| !t.id.starts_with(&format!("{instance}-")));
        inner.backup_tasks.extend(tasks);
    }

    /// Insert or replace one PBS instance by id
    pub fn update_pbs_instance(&self, status: PbsInstanceStatus) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.pbs_instances.retain(|p| p.id != status.id);
        inner.pbs_instances.push(status);
    }

    pub fn remove_pbs_instance(&self, name: &str) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.pbs_instances.retain(|p| p.name != name);
    }

    pub fn update_pbs_backups(&self, instance: &str, backups: Vec<PbsBackup>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.pbs_backups.retain(|b| b.instance != instance);
        inner.pbs_backups.extend(backups);
    }

    pub fn update_active_alerts(&self, alerts: Vec<Alert>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.active_alerts = alerts;
    }

    pub fn update_recently_resolved(&self, resolved: Vec<ResolvedAlert>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.recently_resolved = resolved;
    }

    pub fn set_connection_health(&self, instance: &str, healthy: bool) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.connection_health.insert(instance.to_string(), healthy);
    }

    pub fn connection_health(&self) -> HashMap<String, bool> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner.connection_health.clone()
    }

    pub fn set_stats(&self, stats: Stats) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.stats = stats;
    }

    /// Immutable view of the whole aggregate
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.read().expect("state lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionHealth, Disk, Memory};
    use chrono::Utc;

    fn node(instance: &str, name: &str) -> Node {
        Node {
            id: format!("{instance}-{name}"),
            name: name.to_string(),
            instance: instance.to_string(),
            host: String::new(),
            status: "online".to_string(),
            kind: "node".to_string(),
            cpu: 0.1,
            memory: Memory::default(),
            disk: Disk::default(),
            uptime: 0,
            load_average: vec![],
            kernel_version: String::new(),
            pve_version: String::new(),
            cpu_info: Default::default(),
            last_seen: Utc::now(),
            connection_health: ConnectionHealth::Healthy,
        }
    }

    #[test]
    fn per_instance_replacement_preserves_other_instances() {
        let state = State::new();
        state.update_nodes_for_instance("a", vec![node("a", "n1"), node("a", "n2")]);
        state.update_nodes_for_instance("b", vec![node("b", "n1")]);

        // Replacing instance a removes its departed node but leaves b alone
        state.update_nodes_for_instance("a", vec![node("a", "n1")]);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert!(snapshot.nodes.iter().any(|n| n.id == "a-n1"));
        assert!(snapshot.nodes.iter().any(|n| n.id == "b-n1"));
        assert!(!snapshot.nodes.iter().any(|n| n.id == "a-n2"));
    }

    #[test]
    fn empty_update_clears_instance_shard() {
        let state = State::new();
        state.update_nodes_for_instance("a", vec![node("a", "n1")]);
        state.update_nodes_for_instance("a", vec![]);
        assert!(state.snapshot().nodes.is_empty());
    }

    #[test]
    fn connection_health_is_per_instance() {
        let state = State::new();
        state.set_connection_health("a", true);
        state.set_connection_health("b", false);

        let health = state.connection_health();
        assert_eq!(health.get("a"), Some(&true));
        assert_eq!(health.get("b"), Some(&false));
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let state = State::new();
        state.update_nodes_for_instance("a", vec![node("a", "n1")]);

        let snapshot = state.snapshot();
        state.update_nodes_for_instance("a", vec![]);

        assert_eq!(snapshot.nodes.len(), 1);
        assert!(state.snapshot().nodes.is_empty());
    }
}
