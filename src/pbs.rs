//! Proxmox Backup Server API client
//!
//! Same `/api2/json` conventions as PVE but with the `PBSAPIToken` header
//! format (`user@realm!name:secret`, colon separator) and a flat node model.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::tls;

/// Concurrent namespace listings per datastore scan
const NAMESPACE_CONCURRENCY: usize = 3;

/// Configuration for a PBS client
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
    pub fn from_instance(inst: &crate::config::PbsInstance, timeout: Duration) -> Self {
        // PBS listens on 8007 and always wants HTTPS
        let host = if inst.host.starts_with("http://") || inst.host.starts_with("https://") {
            inst.host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}:8007", inst.host)
        };
        Self {
            host,
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
    expires_at: Option<DateTime<Utc>>,
}

/// PBS API client
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

        let (user, realm, token_name) = if !cfg.token_name.is_empty() {
            if let Some((user_realm, name)) = cfg.token_name.split_once('!') {
                let (user, realm) = user_realm.split_once('@').ok_or_else(|| {
                    MonitorError::validation(
                        "create_pbs_client",
                        instance.clone(),
                        "token name must be user@realm!name",
                    )
                })?;
                (user.to_string(), realm.to_string(), name.to_string())
            } else if !cfg.user.is_empty() {
                // User provided separately; realm defaults to pbs
                let (user, realm) = cfg
                    .user
                    .split_once('@')
                    .map(|(u, r)| (u.to_string(), r.to_string()))
                    .unwrap_or_else(|| (cfg.user.clone(), "pbs".to_string()));
                (user, realm, cfg.token_name.clone())
            } else {
                return Err(MonitorError::validation(
                    "create_pbs_client",
                    instance,
                    "token authentication requires user info in token name or user field",
                ));
            }
        } else {
            let (user, realm) = cfg.user.split_once('@').ok_or_else(|| {
                MonitorError::validation(
                    "create_pbs_client",
                    instance.clone(),
                    "invalid user format, expected user@realm",
                )
            })?;
            (user.to_string(), realm.to_string(), String::new())
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
            .map_err(|e| MonitorError::connection("pbs_authenticate", &self.instance, e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(MonitorError::api("pbs_authenticate", &self.instance, status, body));
        }

        #[derive(Deserialize)]
        struct TicketData {
            ticket: String,
        }

        let envelope: ApiEnvelope<TicketData> = response.json().await.map_err(|e| {
            MonitorError::api("pbs_authenticate", &self.instance, 0, e.to_string())
        })?;

        let mut state = self.ticket.lock().expect("ticket lock poisoned");
        state.ticket = envelope.data.ticket;
        // PBS tickets expire after 2 hours, same as PVE
        state.expires_at = Some(Utc::now() + chrono::Duration::hours(2));
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, op: &'static str, path: &str) -> Result<T> {
        let cookie = if self.uses_token() {
            None
        } else {
            let needs_refresh = {
                let state = self.ticket.lock().expect("ticket lock poisoned");
                state.expires_at.map_or(true, |at| Utc::now() >= at)
            };
            if needs_refresh {
                self.authenticate().await?;
            }
            let state = self.ticket.lock().expect("ticket lock poisoned");
            Some(state.ticket.clone())
        };

        let mut request = self.http.get(format!("{}{}", self.base_url, path));
        if self.uses_token() {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!(
                    "PBSAPIToken={}@{}!{}:{}",
                    self.user, self.realm, self.token_name, self.token_value
                ),
            );
        } else if let Some(ticket) = cookie {
            request = request.header(reqwest::header::COOKIE, format!("PBSAuthCookie={ticket}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                MonitorError::timeout(op, &self.instance)
            } else {
                MonitorError::connection(op, &self.instance, e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(MonitorError::api(op, &self.instance, status, body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MonitorError::api(op, &self.instance, 0, e.to_string()))?;

        // An HTML page here means a proxy or the wrong port, not JSON
        if body.trim_start().starts_with('<') {
            return Err(MonitorError::api(
                op,
                &self.instance,
                0,
                "PBS returned HTML instead of JSON; check the URL and port (default 8007)",
            ));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)
            .map_err(|e| MonitorError::api(op, &self.instance, 0, e.to_string()))?;
        Ok(envelope.data)
    }

    pub async fn get_version(&self) -> Result<Version> {
        self.get_json("pbs_get_version", "/version").await
    }

    pub async fn get_node_status(&self) -> Result<NodeStatus> {
        // PBS exposes single-node installs as "localhost"
        self.get_json("pbs_get_node_status", "/nodes/localhost/status")
            .await
    }

    /// List datastores with capacity, one status call per store. A store
    /// whose status call fails is still returned so the UI can show it.
    pub async fn get_datastores(&self) -> Result<Vec<Datastore>> {
        #[derive(Deserialize)]
        struct DatastoreEntry {
            store: String,
        }

        let entries: Vec<DatastoreEntry> =
            self.get_json("pbs_get_datastores", "/admin/datastore").await?;

        #[derive(Deserialize, Default)]
        struct DatastoreStatus {
            #[serde(default)]
            total: u64,
            #[serde(default)]
            used: u64,
            #[serde(default)]
            avail: u64,
            // Alternate spellings used by some PBS versions
            #[serde(default, rename = "total-space")]
            total_space: u64,
            #[serde(default, rename = "used-space")]
            used_space: u64,
            #[serde(default, rename = "avail-space")]
            avail_space: u64,
        }

        let mut datastores = Vec::with_capacity(entries.len());
        for entry in entries {
            let status: DatastoreStatus = match self
                .get_json(
                    "pbs_get_datastore_status",
                    &format!("/admin/datastore/{}/status", entry.store),
                )
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    warn!(instance = %self.instance, store = %entry.store, error = %e,
                        "failed to get datastore status");
                    datastores.push(Datastore {
                        store: entry.store,
                        ..Default::default()
                    });
                    continue;
                }
            };

            let mut total = if status.total > 0 { status.total } else { status.total_space };
            let used = if status.used > 0 { status.used } else { status.used_space };
            let avail = if status.avail > 0 { status.avail } else { status.avail_space };
            if total == 0 && used > 0 && avail > 0 {
                total = used + avail;
            }

            datastores.push(Datastore {
                store: entry.store,
                total,
                used,
                avail,
            });
        }

        Ok(datastores)
    }

    /// List namespaces for a datastore. Older PBS versions without the
    /// namespace endpoint yield an empty list.
    pub async fn list_namespaces(&self, datastore: &str) -> Result<Vec<Namespace>> {
        match self
            .get_json::<Vec<Namespace>>(
                "pbs_list_namespaces",
                &format!("/admin/datastore/{datastore}/namespace"),
            )
            .await
        {
            Ok(namespaces) => Ok(namespaces),
            Err(e) if e.status() == Some(404) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_backup_groups(
        &self,
        datastore: &str,
        namespace: &str,
    ) -> Result<Vec<BackupGroup>> {
        let mut path = format!("/admin/datastore/{datastore}/groups");
        if !namespace.is_empty() {
            path = format!("{path}?ns={}", urlencode(namespace));
        }
        self.get_json("pbs_list_backup_groups", &path).await
    }

    pub async fn list_backup_snapshots(
        &self,
        datastore: &str,
        namespace: &str,
        backup_type: &str,
        backup_id: &str,
    ) -> Result<Vec<BackupSnapshot>> {
        let mut path = format!(
            "/admin/datastore/{datastore}/snapshots?backup-type={}&backup-id={}",
            urlencode(backup_type),
            urlencode(backup_id)
        );
        if !namespace.is_empty() {
            path = format!("{path}&ns={}", urlencode(namespace));
        }
        self.get_json("pbs_list_backup_snapshots", &path).await
    }

    /// Fetch every snapshot across the given namespaces, at most
    /// [`NAMESPACE_CONCURRENCY`] namespaces in flight. A namespace whose
    /// group listing fails is logged and skipped; partial results win over
    /// none.
    pub async fn list_all_backups(
        self: &Arc<Self>,
        datastore: &str,
        namespaces: &[String],
    ) -> std::collections::HashMap<String, Vec<BackupSnapshot>> {
        let semaphore = Arc::new(Semaphore::new(NAMESPACE_CONCURRENCY));

        let tasks = namespaces.iter().cloned().map(|namespace| {
            let client = Arc::clone(self);
            let datastore = datastore.to_string();
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.ok()?;

                let groups = match client.list_backup_groups(&datastore, &namespace).await {
                    Ok(groups) => groups,
                    Err(e) => {
                        warn!(instance = %client.instance, datastore = %datastore,
                            namespace = %namespace, error = %e, "failed to list backup groups");
                        return None;
                    }
                };

                let mut snapshots = Vec::new();
                for group in groups {
                    match client
                        .list_backup_snapshots(
                            &datastore,
                            &namespace,
                            &group.backup_type,
                            &group.backup_id,
                        )
                        .await
                    {
                        Ok(group_snapshots) => snapshots.extend(group_snapshots),
                        Err(e) => {
                            debug!(instance = %client.instance, datastore = %datastore,
                                namespace = %namespace, group = %group.backup_id, error = %e,
                                "failed to list snapshots");
                        }
                    }
                }
                Some((namespace, snapshots))
            }
        });

        futures::future::join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

fn urlencode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                (b as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Wire types

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Version {
    pub version: String,
    #[serde(default)]
    pub release: String,
}

#[derive(Debug, Clone, Default)]
pub struct Datastore {
    pub store: String,
    pub total: u64,
    pub used: u64,
    pub avail: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: MemoryInfo,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default, rename = "loadavg")]
    pub load_average: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MemoryInfo {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub free: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Namespace {
    #[serde(default)]
    pub ns: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent: String,
}

impl Namespace {
    /// The namespace path, whichever field the server populated
    pub fn effective_path(&self) -> &str {
        if !self.ns.is_empty() {
            &self.ns
        } else if !self.path.is_empty() {
            &self.path
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupGroup {
    #[serde(rename = "backup-type")]
    pub backup_type: String,
    #[serde(rename = "backup-id")]
    pub backup_id: String,
    #[serde(default, rename = "last-backup")]
    pub last_backup: i64,
    #[serde(default, rename = "backup-count")]
    pub backup_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupSnapshot {
    #[serde(rename = "backup-type")]
    pub backup_type: String,
    #[serde(rename = "backup-id")]
    pub backup_id: String,
    #[serde(rename = "backup-time")]
    pub backup_time: i64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub comment: String,
    /// File entries arrive as strings or `{"filename": ...}` objects
    #[serde(default)]
    pub files: Vec<serde_json::Value>,
    /// Either a plain state string or a `{"state": ...}` object
    #[serde(default)]
    pub verification: Option<serde_json::Value>,
}

impl BackupSnapshot {
    /// Flatten the mixed-form file list to names
    pub fn file_names(&self) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|f| match f {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(map) => map
                    .get("filename")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }

    /// Verification passes when the state is "ok", whatever its shape
    pub fn is_verified(&self) -> bool {
        match &self.verification {
            Some(serde_json::Value::String(s)) => s == "ok",
            Some(serde_json::Value::Object(map)) => {
                map.get("state").and_then(|v| v.as_str()) == Some("ok")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verification_state_from_string_or_object() {
        let snapshot: BackupSnapshot = serde_json::from_value(json!({
            "backup-type": "vm",
            "backup-id": "100",
            "backup-time": 1700000000i64,
            "verification": "ok"
        }))
        .unwrap();
        assert!(snapshot.is_verified());

        let snapshot: BackupSnapshot = serde_json::from_value(json!({
            "backup-type": "vm",
            "backup-id": "100",
            "backup-time": 1700000000i64,
            "verification": {"state": "failed", "upid": "x"}
        }))
        .unwrap();
        assert!(!snapshot.is_verified());

        let snapshot: BackupSnapshot = serde_json::from_value(json!({
            "backup-type": "vm",
            "backup-id": "100",
            "backup-time": 1700000000i64,
            "verification": {"state": "ok", "upid": "x"}
        }))
        .unwrap();
        assert!(snapshot.is_verified());
    }

    #[test]
    fn file_names_from_mixed_forms() {
        let snapshot: BackupSnapshot = serde_json::from_value(json!({
            "backup-type": "ct",
            "backup-id": "101",
            "backup-time": 1700000000i64,
            "files": ["root.pxar.didx", {"filename": "catalog.pcat1.didx", "size": 123}]
        }))
        .unwrap();
        assert_eq!(
            snapshot.file_names(),
            vec!["root.pxar.didx".to_string(), "catalog.pcat1.didx".to_string()]
        );
    }

    #[test]
    fn namespace_effective_path_prefers_ns() {
        let ns = Namespace {
            ns: "prod".into(),
            path: "ignored".into(),
            ..Default::default()
        };
        assert_eq!(ns.effective_path(), "prod");

        let ns = Namespace {
            path: "dev".into(),
            ..Default::default()
        };
        assert_eq!(ns.effective_path(), "dev");
    }

    #[test]
    fn urlencode_escapes_reserved() {
        assert_eq!(urlencode("a/b"), "a/b");
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("vm"), "vm");
    }

    #[test]
    fn from_instance_defaults_to_8007() {
        let inst = crate::config::PbsInstance {
            name: "backup".into(),
            host: "10.0.0.9".into(),
            ..Default::default()
        };
        let cfg = ClientConfig::from_instance(&inst, Duration::from_secs(60));
        assert_eq!(cfg.host, "https://10.0.0.9:8007");
    }
}
