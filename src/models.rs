//! Canonical resource model
//!
//! Everything the pollers produce is normalized into these types before it
//! reaches the state store, the alert engine or a push subscriber. Field
//! names serialize in camelCase to match the wire format consumed by the
//! front end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of the connection a resource row was observed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Healthy,
    Error,
    Failed,
}

impl ConnectionHealth {
    pub fn is_down(self) -> bool {
        matches!(self, ConnectionHealth::Error | ConnectionHealth::Failed)
    }
}

/// Memory usage for a node or guest
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Used percentage in [0, 100]
    pub usage: f64,
}

impl Memory {
    pub fn from_used_total(used: u64, total: u64) -> Self {
        Self {
            total,
            used,
            free: total.saturating_sub(used),
            usage: safe_percentage(used as f64, total as f64),
        }
    }
}

/// Disk usage for a node or guest
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Used percentage in [0, 100]
    pub usage: f64,
}

impl Disk {
    pub fn from_used_total(used: u64, total: u64) -> Self {
        Self {
            total,
            used,
            free: total.saturating_sub(used),
            usage: safe_percentage(used as f64, total as f64),
        }
    }
}

/// CPU hardware description for a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub model: String,
    /// Logical core count (falls back to physical when the API omits it)
    pub cores: u32,
    pub sockets: u32,
    pub mhz: String,
}

/// A PVE cluster node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// `<instance>-<name>`
    pub id: String,
    pub name: String,
    pub instance: String,
    pub host: String,
    /// "online" or "offline"
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// CPU usage as a fraction in [0, 1]
    pub cpu: f64,
    pub memory: Memory,
    pub disk: Disk,
    pub uptime: u64,
    pub load_average: Vec<f64>,
    #[serde(default)]
    pub kernel_version: String,
    #[serde(default)]
    pub pve_version: String,
    #[serde(default)]
    pub cpu_info: CpuInfo,
    pub last_seen: DateTime<Utc>,
    pub connection_health: ConnectionHealth,
}

/// A QEMU virtual machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    /// `<instance>-<node>-<vmid>`
    pub id: String,
    pub vmid: u32,
    pub name: String,
    pub node: String,
    pub instance: String,
    /// running, stopped, paused or suspended
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// CPU usage as a fraction in [0, 1]; forced to 0 when not running
    pub cpu: f64,
    pub cpus: u32,
    pub memory: Memory,
    pub disk: Disk,
    /// Bytes per second, derived from cumulative counters
    pub network_in: u64,
    pub network_out: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub uptime: u64,
    pub template: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub lock: String,
    pub last_seen: DateTime<Utc>,
}

/// An LXC container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub vmid: u32,
    pub name: String,
    pub node: String,
    pub instance: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub cpu: f64,
    pub cpus: u32,
    pub memory: Memory,
    pub disk: Disk,
    pub network_in: u64,
    pub network_out: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub uptime: u64,
    pub template: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub lock: String,
    pub last_seen: DateTime<Utc>,
}

/// Whether a guest sample came from a VM or a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    pub fn label(self) -> &'static str {
        match self {
            GuestKind::Qemu => "VM",
            GuestKind::Lxc => "Container",
        }
    }
}

/// Flat view of a guest used by the alert engine and custom-rule filters
#[derive(Debug, Clone)]
pub struct GuestSample {
    pub id: String,
    pub name: String,
    pub node: String,
    pub status: String,
    pub kind: GuestKind,
    /// CPU usage as a fraction in [0, 1]
    pub cpu: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub network_in: u64,
    pub network_out: u64,
}

impl From<&Vm> for GuestSample {
    fn from(vm: &Vm) -> Self {
        Self {
            id: vm.id.clone(),
            name: vm.name.clone(),
            node: vm.node.clone(),
            status: vm.status.clone(),
            kind: GuestKind::Qemu,
            cpu: vm.cpu,
            memory_usage: vm.memory.usage,
            disk_usage: vm.disk.usage,
            disk_read: vm.disk_read,
            disk_write: vm.disk_write,
            network_in: vm.network_in,
            network_out: vm.network_out,
        }
    }
}

impl From<&Container> for GuestSample {
    fn from(ct: &Container) -> Self {
        Self {
            id: ct.id.clone(),
            name: ct.name.clone(),
            node: ct.node.clone(),
            status: ct.status.clone(),
            kind: GuestKind::Lxc,
            cpu: ct.cpu,
            memory_usage: ct.memory.usage,
            disk_usage: ct.disk.usage,
            disk_read: ct.disk_read,
            disk_write: ct.disk_write,
            network_in: ct.network_in,
            network_out: ct.network_out,
        }
    }
}

/// A storage pool visible from a PVE node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// `<instance>-<node>-<name>`, or `shared-<name>` for shared pools
    pub id: String,
    pub name: String,
    /// Owning node, or "shared" for shared pools
    pub node: String,
    pub instance: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// available, inactive or disabled
    pub status: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage: f64,
    /// Sorted comma-separated content kinds
    pub content: String,
    pub shared: bool,
    pub enabled: bool,
    pub active: bool,
}

/// A backup volume discovered on PVE storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBackup {
    pub id: String,
    pub storage: String,
    pub node: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub vmid: u32,
    pub time: DateTime<Utc>,
    pub size: u64,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub notes: String,
    pub protected: bool,
    pub volid: String,
    pub is_pbs: bool,
    pub verified: bool,
    #[serde(default)]
    pub verification: String,
}

/// A VM or container snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSnapshot {
    pub id: String,
    pub name: String,
    pub node: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub vmid: u32,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent: String,
    pub vm_state: bool,
}

/// A vzdump task observed on a PVE node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTask {
    pub id: String,
    pub node: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub vmid: u32,
    #[serde(default)]
    pub status: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// A PBS namespace within a datastore
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsNamespace {
    pub path: String,
    #[serde(default)]
    pub parent: String,
    pub depth: usize,
}

/// A PBS datastore with capacity and discovered namespaces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsDatastore {
    pub name: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage: f64,
    pub status: String,
    #[serde(default)]
    pub namespaces: Vec<PbsNamespace>,
}

/// Health and capacity of one PBS instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsInstanceStatus {
    /// `pbs-<name>`
    pub id: String,
    pub name: String,
    pub host: String,
    /// "online" or "offline"
    pub status: String,
    pub version: String,
    pub connection_health: String,
    /// CPU usage as a fraction in [0, 1]
    pub cpu: f64,
    pub memory_usage: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub uptime: u64,
    #[serde(default)]
    pub datastores: Vec<PbsDatastore>,
    pub last_seen: DateTime<Utc>,
}

/// A backup snapshot stored on PBS
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsBackup {
    pub id: String,
    pub instance: String,
    pub datastore: String,
    pub namespace: String,
    /// "vm" or "ct"
    pub backup_type: String,
    pub vmid: String,
    pub backup_time: DateTime<Utc>,
    pub size: u64,
    pub protected: bool,
    pub verified: bool,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// One historical metric sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Aggregate counters exported with every snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub start_time: Option<DateTime<Utc>>,
    pub uptime: u64,
    pub polling_cycles: u64,
    pub last_poll_duration: f64,
    pub connected_clients: usize,
    pub version: String,
}

/// Percentage that tolerates zero and non-finite divisors
pub fn safe_percentage(used: f64, total: f64) -> f64 {
    if total == 0.0 {
        return 0.0;
    }
    let result = used / total * 100.0;
    if result.is_nan() || result.is_infinite() {
        0.0
    } else {
        result
    }
}

/// Clamp NaN and infinities to zero
pub fn safe_fraction(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        0.0
    } else {
        value
    }
}

/// Sort a comma-separated content list for stable display
pub fn sort_content(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    let mut parts: Vec<&str> = content.split(',').collect();
    parts.sort_unstable();
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_percentage_handles_zero_total() {
        assert_eq!(safe_percentage(5.0, 0.0), 0.0);
        assert_eq!(safe_percentage(50.0, 100.0), 50.0);
    }

    #[test]
    fn sort_content_is_stable() {
        assert_eq!(sort_content("rootdir,images,backup"), "backup,images,rootdir");
        assert_eq!(sort_content(""), "");
    }

    #[test]
    fn memory_from_used_total() {
        let mem = Memory::from_used_total(512, 1024);
        assert_eq!(mem.free, 512);
        assert_eq!(mem.usage, 50.0);
    }
}
