//! Proxmox VE API client
//!
//! Thin typed wrapper over the `/api2/json` REST surface. Authentication is
//! either an API token (`PVEAPIToken=user@realm!name=secret` header) or a
//! ticket obtained from `/access/ticket` and renewed every two hours.

pub mod cluster;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::tls;

pub use cluster::ClusterClient;

/// Configuration for a single-endpoint client
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub token_name: String,
    pub token_value: String,
    pub fingerprint: String,
    pub verify_ssl: bool,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn from_instance(inst: &crate::config::PveInstance, timeout: Duration) -> Self {
        Self {
            host: crate::config::normalize_host(&inst.host),
            user: inst.user.clone(),
            password: inst.password.clone(),
            token_name: inst.token_name.clone(),
            token_value: inst.token_value.clone(),
            fingerprint: inst.fingerprint.clone(),
            verify_ssl: inst.verify_ssl,
            timeout,
        }
    }
}

#[derive(Debug, Default)]
struct TicketState {
    ticket: String,
    csrf_token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Single-endpoint Proxmox VE client
pub struct Client {
    instance: String,
    base_url: String,
    http: reqwest::Client,
    user: String,
    realm: String,
    token_name: String,
    token_value: String,
    password: String,
    ticket: Mutex<TicketState>,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

impl Client {
    pub fn new(instance: impl Into<String>, cfg: ClientConfig) -> Result<Self> {
        let instance = instance.into();

        // Token names arrive as "user@realm!tokenname"; split out the parts
        // so the Authorization header can be reassembled per request.
        let (user, realm, token_name) = if !cfg.token_name.is_empty() {
            match split_token_name(&cfg.token_name) {
                Some(parts) => parts,
                None => {
                    return Err(MonitorError::validation(
                        "create_client",
                        instance,
                        format!("invalid token name {:?}, expected user@realm!name", cfg.token_name),
                    ))
                }
            }
        } else {
            let (user, realm) = split_user_realm(&cfg.user).ok_or_else(|| {
                MonitorError::validation(
                    "create_client",
                    instance.clone(),
                    "invalid user format, expected user@realm",
                )
            })?;
            (user, realm, String::new())
        };

        let http = tls::build_http_client(cfg.verify_ssl, &cfg.fingerprint, cfg.timeout)?;

        Ok(Self {
            instance,
            base_url: format!("{}/api2/json", cfg.host.trim_end_matches('/')),
            http,
            user,
            realm,
            token_name,
            token_value: cfg.token_value.clone(),
            password: cfg.password.clone(),
            ticket: Mutex::new(TicketState::default()),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    fn uses_token(&self) -> bool {
        !self.token_name.is_empty() && !self.token_value.is_empty()
    }

    async fn authenticate(&self) -> Result<()> {
        let username = format!("{}@{}", self.user, self.realm);
        let response = self
            .http
            .post(format!("{}/access/ticket", self.base_url))
            .form(&[("username", username.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(|e| request_error("authenticate", &self.instance, e))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(MonitorError::api("authenticate", &self.instance, status, body));
        }

        #[derive(Deserialize)]
        struct TicketData {
            ticket: String,
            #[serde(rename = "CSRFPreventionToken")]
            csrf_token: String,
        }

        let envelope: ApiEnvelope<TicketData> = response
            .json()
            .await
            .map_err(|e| MonitorError::api("authenticate", &self.instance, 0, e.to_string()))?;

        let mut state = self.ticket.lock().expect("ticket lock poisoned");
        state.ticket = envelope.data.ticket;
        state.csrf_token = envelope.data.csrf_token;
        // PVE tickets expire after 2 hours
        state.expires_at = Some(Utc::now() + chrono::Duration::hours(2));
        debug!(instance = %self.instance, "obtained PVE ticket");
        Ok(())
    }

    async fn ensure_auth(&self) -> Result<Option<String>> {
        if self.uses_token() {
            return Ok(None);
        }

        let needs_refresh = {
            let state = self.ticket.lock().expect("ticket lock poisoned");
            match state.expires_at {
                Some(expires) => Utc::now() >= expires,
                None => true,
            }
        };

        if needs_refresh {
            self.authenticate().await?;
        }

        let state = self.ticket.lock().expect("ticket lock poisoned");
        Ok(Some(state.ticket.clone()))
    }

    async fn get_json<T: DeserializeOwned>(&self, op: &'static str, path: &str) -> Result<T> {
        let cookie = self.ensure_auth().await?;

        let mut request = self.http.get(format!("{}{}", self.base_url, path));
        if self.uses_token() {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!(
                    "PVEAPIToken={}@{}!{}={}",
                    self.user, self.realm, self.token_name, self.token_value
                ),
            );
        } else if let Some(ticket) = cookie {
            request = request.header(reqwest::header::COOKIE, format!("PVEAuthCookie={ticket}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| request_error(op, &self.instance, e))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            if matches!(status, 401 | 403 | 595) {
                warn!(instance = %self.instance, status, op, "PVE authentication error");
            }
            return Err(MonitorError::api(op, &self.instance, status, body));
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| MonitorError::api(op, &self.instance, 0, e.to_string()))?;
        Ok(envelope.data)
    }
}

fn request_error(op: &'static str, instance: &str, err: reqwest::Error) -> MonitorError {
    if err.is_timeout() {
        MonitorError::timeout(op, instance)
    } else {
        MonitorError::connection(op, instance, err.to_string())
    }
}

fn split_token_name(token_name: &str) -> Option<(String, String, String)> {
    let (user_realm, name) = token_name.split_once('!')?;
    let (user, realm) = user_realm.split_once('@')?;
    if user.is_empty() || realm.is_empty() || name.is_empty() {
        return None;
    }
    Some((user.to_string(), realm.to_string(), name.to_string()))
}

fn split_user_realm(user: &str) -> Option<(String, String)> {
    let (user, realm) = user.split_once('@')?;
    if user.is_empty() || realm.is_empty() {
        return None;
    }
    Some((user.to_string(), realm.to_string()))
}

// ---------------------------------------------------------------------------
// Wire types

/// A node row from `/nodes`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Node {
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
    #[serde(default)]
    pub uptime: u64,
}

/// Detailed node status from `/nodes/{node}/status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: Option<MemoryStatus>,
    /// Load average entries arrive as either numbers or strings
    #[serde(default, deserialize_with = "de::flex_f64_vec")]
    pub loadavg: Vec<f64>,
    #[serde(default, rename = "kversion")]
    pub kernel_version: String,
    #[serde(default, rename = "pveversion")]
    pub pve_version: String,
    #[serde(default, rename = "cpuinfo")]
    pub cpu_info: Option<CpuInfo>,
    #[serde(default)]
    pub rootfs: Option<RootFs>,
    #[serde(default)]
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStatus {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub free: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RootFs {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default, rename = "avail")]
    pub free: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuInfo {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub sockets: u32,
    /// Reported as a string or a number depending on PVE version
    #[serde(default, deserialize_with = "de::flex_string")]
    pub mhz: String,
}

/// A VM row from `/nodes/{node}/qemu`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Vm {
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
    #[serde(default)]
    pub netin: u64,
    #[serde(default)]
    pub netout: u64,
    #[serde(default)]
    pub diskread: u64,
    #[serde(default)]
    pub diskwrite: u64,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub template: u8,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub lock: String,
}

/// A container row from `/nodes/{node}/lxc`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Container {
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpu: f64,
    /// Containers report cpus as an int, float or string (cpulimit)
    #[serde(default, deserialize_with = "de::flex_u32")]
    pub cpus: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
    #[serde(default)]
    pub netin: u64,
    #[serde(default)]
    pub netout: u64,
    #[serde(default)]
    pub diskread: u64,
    #[serde(default)]
    pub diskwrite: u64,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub template: u8,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub lock: String,
}

/// Detailed VM status from `/nodes/{node}/qemu/{vmid}/status/current`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub balloon: u64,
    #[serde(default, rename = "freemem")]
    pub free_mem: u64,
    #[serde(default)]
    pub uptime: u64,
}

/// A storage row from `/nodes/{node}/storage` or `/storage`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Storage {
    pub storage: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub active: u8,
    #[serde(default)]
    pub enabled: u8,
    #[serde(default)]
    pub shared: u8,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default, rename = "avail")]
    pub available: u64,
}

/// A volume from `/nodes/{node}/storage/{storage}/content`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageContent {
    pub volid: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub ctime: i64,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub vmid: u32,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub protected: u8,
    #[serde(default)]
    pub verified: u8,
    /// PBS verification info, `{"state": "ok", ...}` when present
    #[serde(default)]
    pub verification: Option<serde_json::Value>,
}

/// A snapshot row from the qemu/lxc snapshot endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "snaptime")]
    pub snap_time: i64,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub vmid: u32,
}

/// A task row from `/nodes/{node}/tasks`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Task {
    pub upid: String,
    #[serde(default)]
    pub node: String,
    #[serde(default, rename = "starttime")]
    pub start_time: i64,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "endtime")]
    pub end_time: i64,
}

/// A row from `/cluster/status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterStatus {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub online: u8,
}

/// A row from `/cluster/resources`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterResource {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vmid: u32,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
    #[serde(default)]
    pub netin: u64,
    #[serde(default)]
    pub netout: u64,
    #[serde(default)]
    pub diskread: u64,
    #[serde(default)]
    pub diskwrite: u64,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub template: u8,
    #[serde(default)]
    pub tags: String,
}

// ---------------------------------------------------------------------------
// API trait

/// Operations shared by the single-endpoint client and the cluster client.
///
/// The monitor only talks through this trait, so the failover wrapper can be
/// swapped in wherever an instance is configured as a cluster.
#[async_trait]
pub trait PveApi: Send + Sync {
    async fn get_nodes(&self) -> Result<Vec<Node>>;
    async fn get_node_status(&self, node: &str) -> Result<NodeStatus>;
    async fn get_vms(&self, node: &str) -> Result<Vec<Vm>>;
    async fn get_containers(&self, node: &str) -> Result<Vec<Container>>;
    async fn get_storage(&self, node: &str) -> Result<Vec<Storage>>;
    async fn get_all_storage(&self) -> Result<Vec<Storage>>;
    async fn get_storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageContent>>;
    async fn get_backup_tasks(&self) -> Result<Vec<Task>>;
    async fn get_vm_snapshots(&self, node: &str, vmid: u32) -> Result<Vec<Snapshot>>;
    async fn get_container_snapshots(&self, node: &str, vmid: u32) -> Result<Vec<Snapshot>>;
    async fn get_vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus>;
    async fn get_container_status(&self, node: &str, vmid: u32) -> Result<Container>;
    async fn get_cluster_resources(&self, resource_type: &str) -> Result<Vec<ClusterResource>>;
    async fn is_cluster_member(&self) -> Result<bool>;
}

#[async_trait]
impl PveApi for Client {
    async fn get_nodes(&self) -> Result<Vec<Node>> {
        self.get_json("get_nodes", "/nodes").await
    }

    async fn get_node_status(&self, node: &str) -> Result<NodeStatus> {
        self.get_json("get_node_status", &format!("/nodes/{node}/status"))
            .await
            .map_err(|e| e.with_node(node))
    }

    async fn get_vms(&self, node: &str) -> Result<Vec<Vm>> {
        self.get_json("get_vms", &format!("/nodes/{node}/qemu"))
            .await
            .map_err(|e| e.with_node(node))
    }

    async fn get_containers(&self, node: &str) -> Result<Vec<Container>> {
        self.get_json("get_containers", &format!("/nodes/{node}/lxc"))
            .await
            .map_err(|e| e.with_node(node))
    }

    async fn get_storage(&self, node: &str) -> Result<Vec<Storage>> {
        self.get_json("get_storage", &format!("/nodes/{node}/storage"))
            .await
            .map_err(|e| e.with_node(node))
    }

    async fn get_all_storage(&self) -> Result<Vec<Storage>> {
        self.get_json("get_all_storage", "/storage").await
    }

    async fn get_storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageContent>> {
        let contents: Vec<StorageContent> = self
            .get_json(
                "get_storage_content",
                &format!("/nodes/{node}/storage/{storage}/content"),
            )
            .await
            .map_err(|e| e.with_node(node))?;

        // Only backup volumes and templates are of interest downstream
        Ok(contents
            .into_iter()
            .filter(|c| c.content == "backup" || c.content == "vztmpl")
            .collect())
    }

    async fn get_backup_tasks(&self) -> Result<Vec<Task>> {
        let nodes = self.get_nodes().await?;

        let mut all_tasks = Vec::new();
        for node in nodes {
            if node.status != "online" {
                continue;
            }
            let tasks: Vec<Task> = match self
                .get_json("get_node_tasks", &format!("/nodes/{}/tasks", node.node))
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    debug!(instance = %self.instance, node = %node.node, error = %e,
                        "skipping tasks for unreachable node");
                    continue;
                }
            };
            all_tasks.extend(tasks.into_iter().filter(|t| t.kind == "vzdump"));
        }
        Ok(all_tasks)
    }

    async fn get_vm_snapshots(&self, node: &str, vmid: u32) -> Result<Vec<Snapshot>> {
        let snapshots: Vec<Snapshot> = self
            .get_json(
                "get_vm_snapshots",
                &format!("/nodes/{node}/qemu/{vmid}/snapshot"),
            )
            .await
            .map_err(|e| e.with_node(node))?;
        Ok(filter_snapshots(snapshots, vmid))
    }

    async fn get_container_snapshots(&self, node: &str, vmid: u32) -> Result<Vec<Snapshot>> {
        let snapshots: Vec<Snapshot> = self
            .get_json(
                "get_container_snapshots",
                &format!("/nodes/{node}/lxc/{vmid}/snapshot"),
            )
            .await
            .map_err(|e| e.with_node(node))?;
        Ok(filter_snapshots(snapshots, vmid))
    }

    async fn get_vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus> {
        self.get_json(
            "get_vm_status",
            &format!("/nodes/{node}/qemu/{vmid}/status/current"),
        )
        .await
        .map_err(|e| e.with_node(node))
    }

    async fn get_container_status(&self, node: &str, vmid: u32) -> Result<Container> {
        self.get_json(
            "get_container_status",
            &format!("/nodes/{node}/lxc/{vmid}/status/current"),
        )
        .await
        .map_err(|e| e.with_node(node))
    }

    async fn get_cluster_resources(&self, resource_type: &str) -> Result<Vec<ClusterResource>> {
        let path = if resource_type.is_empty() {
            "/cluster/resources".to_string()
        } else {
            format!("/cluster/resources?type={resource_type}")
        };
        self.get_json("get_cluster_resources", &path).await
    }

    async fn is_cluster_member(&self) -> Result<bool> {
        // An error here is treated as "not a cluster" rather than propagated,
        // so standalone nodes with restricted tokens don't look broken.
        let status: Vec<ClusterStatus> = match self
            .get_json("get_cluster_status", "/cluster/status")
            .await
        {
            Ok(status) => status,
            Err(_) => return Ok(false),
        };

        if status.iter().any(|s| s.kind == "cluster") {
            return Ok(true);
        }
        Ok(status.iter().filter(|s| s.kind == "node").count() > 1)
    }
}

/// Drop the synthetic "current" entry and stamp the owning vmid
fn filter_snapshots(snapshots: Vec<Snapshot>, vmid: u32) -> Vec<Snapshot> {
    snapshots
        .into_iter()
        .filter(|s| s.name != "current")
        .map(|mut s| {
            s.vmid = vmid;
            s
        })
        .collect()
}

mod de {
    use serde::de::{Deserializer, Error};
    use serde::Deserialize;
    use serde_json::Value;

    /// Accept an integer, float or numeric string
    pub fn flex_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) as u32),
            Value::String(s) => s
                .parse::<f64>()
                .map(|f| f as u32)
                .map_err(|e| Error::custom(format!("invalid numeric string: {e}"))),
            Value::Null => Ok(0),
            other => Err(Error::custom(format!("expected number or string, got {other}"))),
        }
    }

    /// Accept a number or a string, keeping the textual form
    pub fn flex_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Null => Ok(String::new()),
            other => Err(Error::custom(format!("expected number or string, got {other}"))),
        }
    }

    /// Accept an array whose entries are numbers or numeric strings
    pub fn flex_f64_vec<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values: Vec<Value> = Vec::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_name_parsing() {
        assert_eq!(
            split_token_name("monitor@pam!reader"),
            Some(("monitor".into(), "pam".into(), "reader".into()))
        );
        assert_eq!(split_token_name("monitor@pam"), None);
        assert_eq!(split_token_name("monitor!reader"), None);
    }

    #[test]
    fn container_cpus_tolerates_mixed_types() {
        let ct: Container = serde_json::from_str(r#"{"vmid": 101, "cpus": 2}"#).unwrap();
        assert_eq!(ct.cpus, 2);

        let ct: Container = serde_json::from_str(r#"{"vmid": 101, "cpus": 1.5}"#).unwrap();
        assert_eq!(ct.cpus, 1);

        let ct: Container = serde_json::from_str(r#"{"vmid": 101, "cpus": "4"}"#).unwrap();
        assert_eq!(ct.cpus, 4);
    }

    #[test]
    fn node_status_loadavg_tolerates_strings() {
        let status: NodeStatus = serde_json::from_str(
            r#"{"cpu": 0.25, "loadavg": ["0.50", 0.75, "1.00"], "kversion": "6.8"}"#,
        )
        .unwrap();
        assert_eq!(status.loadavg, vec![0.5, 0.75, 1.0]);
        assert_eq!(status.kernel_version, "6.8");
    }

    #[test]
    fn cpuinfo_mhz_tolerates_numbers() {
        let info: CpuInfo =
            serde_json::from_str(r#"{"model": "EPYC", "cores": 16, "sockets": 1, "mhz": 2800}"#)
                .unwrap();
        assert_eq!(info.mhz, "2800");
    }

    #[test]
    fn filter_snapshots_drops_current() {
        let snapshots = vec![
            Snapshot {
                name: "before-upgrade".into(),
                ..Default::default()
            },
            Snapshot {
                name: "current".into(),
                ..Default::default()
            },
        ];
        let filtered = filter_snapshots(snapshots, 100);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].vmid, 100);
    }
}
