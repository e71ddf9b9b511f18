//! Runtime configuration
//!
//! The monitor consumes an already-decrypted settings document; file
//! persistence and encryption live with the caller. Field names follow the
//! camelCase wire format of the settings file.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::trace;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default, rename = "pveInstances")]
    pub pve_instances: Vec<PveInstance>,
    #[serde(default, rename = "pbsInstances")]
    pub pbs_instances: Vec<PbsInstance>,
    /// Seconds between polling cycles. The effective cadence is pinned to
    /// 10 s because the upstream cluster/resources endpoint refreshes on a
    /// 10 s cycle; polling faster returns the same data.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    /// Run the backup/snapshot scan every N polling cycles
    #[serde(default = "default_backup_polling_cycles")]
    pub backup_polling_cycles: u64,
    /// Per-request timeout for PVE clients, seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_true")]
    pub concurrent_polling: bool,
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default)]
    pub discovery_subnet: Option<String>,
}

impl Config {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout.max(1))
    }
}

/// One configured PVE instance (standalone node or cluster)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PveInstance {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub token_name: String,
    #[serde(default)]
    pub token_value: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub is_cluster: bool,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub cluster_endpoints: Vec<ClusterEndpoint>,
    #[serde(default = "default_true")]
    pub monitor_vms: bool,
    #[serde(default = "default_true")]
    pub monitor_containers: bool,
    #[serde(default = "default_true")]
    pub monitor_storage: bool,
    #[serde(default = "default_true")]
    pub monitor_backups: bool,
}

impl PveInstance {
    /// Endpoint URLs for the cluster client. Prefers an endpoint's IP over
    /// its hostname and normalizes bare hosts to `https://host:8006`.
    pub fn endpoint_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .cluster_endpoints
            .iter()
            .filter_map(|ep| {
                let host = if ep.ip.is_empty() { &ep.host } else { &ep.ip };
                if host.is_empty() {
                    None
                } else {
                    Some(normalize_host(host))
                }
            })
            .collect();

        if urls.is_empty() {
            urls.push(normalize_host(&self.host));
        }
        urls
    }
}

/// One equivalent API host of a cluster
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEndpoint {
    pub node_name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// One configured PBS instance
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbsInstance {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub token_name: String,
    #[serde(default)]
    pub token_value: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default = "default_true")]
    pub monitor_datastores: bool,
    #[serde(default = "default_true")]
    pub monitor_backups: bool,
}

pub fn normalize_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{host}:8006")
    }
}

fn default_polling_interval() -> u64 {
    10
}

fn default_backup_polling_cycles() -> u64 {
    10
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/proxmon")
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_prefer_ip_and_normalize() {
        let inst = PveInstance {
            name: "lab".into(),
            host: "pve.example.com".into(),
            cluster_endpoints: vec![
                ClusterEndpoint {
                    node_name: "px1".into(),
                    host: "px1.example.com".into(),
                    ip: "10.0.0.1".into(),
                    ..Default::default()
                },
                ClusterEndpoint {
                    node_name: "px2".into(),
                    host: "https://px2.example.com:8006".into(),
                    ..Default::default()
                },
                ClusterEndpoint {
                    node_name: "px3".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let urls = inst.endpoint_urls();
        assert_eq!(
            urls,
            vec![
                "https://10.0.0.1:8006".to_string(),
                "https://px2.example.com:8006".to_string(),
            ]
        );
    }

    #[test]
    fn endpoint_urls_fall_back_to_instance_host() {
        let inst = PveInstance {
            name: "solo".into(),
            host: "192.168.1.5".into(),
            ..Default::default()
        };
        assert_eq!(inst.endpoint_urls(), vec!["https://192.168.1.5:8006".to_string()]);
    }

    #[test]
    fn config_defaults_apply() {
        let config: Config = serde_json::from_str(r#"{"pveInstances": []}"#).unwrap();
        assert_eq!(config.polling_interval, 10);
        assert_eq!(config.backup_polling_cycles, 10);
        assert!(config.concurrent_polling);
    }
}
