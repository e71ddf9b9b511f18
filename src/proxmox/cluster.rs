//! Cluster-aware failover client
//!
//! Wraps one [`Client`] per cluster endpoint and routes each call to a
//! healthy endpoint picked uniformly at random. Endpoints are only demoted
//! for failures that actually indicate the endpoint is broken; errors that
//! concern a cluster member the endpoint was proxying to (status 595, or 500
//! with a hostname-lookup body) are returned to the caller untouched.
//! Demoting on those cascades into false-unhealthy across large clusters.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use rand::Rng;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    Client, ClientConfig, ClusterResource, Container, Node, NodeStatus, PveApi, Snapshot, Storage,
    StorageContent, Task, Vm, VmStatus,
};
use crate::error::{MonitorError, Result};

/// Probe budget for initial and recovery health checks
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Do not re-probe an unhealthy endpoint more often than this
const RECOVERY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Default)]
struct EndpointState {
    healthy: bool,
    last_check: Option<Instant>,
    client: Option<Arc<Client>>,
}

/// What the failover loop should do with a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDisposition {
    /// Return the error without touching endpoint health: the endpoint is
    /// reachable, the problem lies with the call itself (auth) or with a
    /// cluster member it was proxying to.
    ReturnToCaller,
    /// Mark the endpoint unhealthy and retry on another one
    Demote,
}

/// Classify an error for the failover loop. Single call site for the
/// demotion policy.
pub fn failover_disposition(err: &MonitorError) -> FailoverDisposition {
    if err.is_node_specific() || err.is_auth() {
        FailoverDisposition::ReturnToCaller
    } else {
        FailoverDisposition::Demote
    }
}

/// Multi-endpoint client for one PVE cluster
pub struct ClusterClient {
    name: String,
    base: ClientConfig,
    endpoints: Vec<String>,
    health: RwLock<HashMap<String, EndpointState>>,
}

impl ClusterClient {
    /// Create a cluster client and probe every endpoint in parallel.
    /// Endpoints start pessimistic and are promoted by a successful probe.
    pub async fn new(name: impl Into<String>, base: ClientConfig, endpoints: Vec<String>) -> Self {
        let name = name.into();
        let health = endpoints
            .iter()
            .map(|ep| (ep.clone(), EndpointState::default()))
            .collect();

        let client = Self {
            name,
            base,
            endpoints,
            health: RwLock::new(health),
        };

        let probes = client.endpoints.iter().map(|ep| client.probe(ep.clone()));
        join_all(probes).await;

        let healthy = client.healthy_endpoints().len();
        info!(
            cluster = %client.name,
            healthy,
            total = client.endpoints.len(),
            "initial cluster health check completed"
        );

        client
    }

    /// Probe one endpoint: short-timeout client, one `get_nodes` call. On
    /// success the cached client is replaced with a full-timeout one.
    async fn probe(&self, endpoint: String) {
        let mut short_cfg = self.base.clone();
        short_cfg.host = endpoint.clone();
        short_cfg.timeout = PROBE_TIMEOUT;

        let outcome = match Client::new(&self.name, short_cfg) {
            Ok(short) => match timeout(PROBE_TIMEOUT, short.get_nodes()).await {
                Ok(Ok(_)) => {
                    let mut full_cfg = self.base.clone();
                    full_cfg.host = endpoint.clone();
                    Client::new(&self.name, full_cfg).ok().map(Arc::new)
                }
                _ => None,
            },
            Err(_) => None,
        };

        let mut health = self.health.write().expect("health lock poisoned");
        let state = health.entry(endpoint.clone()).or_default();
        state.last_check = Some(Instant::now());
        match outcome {
            Some(client) => {
                state.healthy = true;
                state.client = Some(client);
                debug!(cluster = %self.name, endpoint = %endpoint, "endpoint passed health check");
            }
            None => {
                state.healthy = false;
                state.client = None;
                info!(cluster = %self.name, endpoint = %endpoint, "endpoint failed health check");
            }
        }
    }

    fn healthy_endpoints(&self) -> Vec<(String, Arc<Client>)> {
        let health = self.health.read().expect("health lock poisoned");
        health
            .iter()
            .filter(|(_, state)| state.healthy)
            .filter_map(|(ep, state)| state.client.clone().map(|c| (ep.clone(), c)))
            .collect()
    }

    fn mark_unhealthy(&self, endpoint: &str) {
        let mut health = self.health.write().expect("health lock poisoned");
        if let Some(state) = health.get_mut(endpoint) {
            if state.healthy {
                warn!(cluster = %self.name, endpoint = %endpoint, "marking cluster endpoint unhealthy");
                state.healthy = false;
            }
        }
    }

    /// Re-probe unhealthy endpoints whose last check is older than the
    /// recovery backoff.
    async fn recover(&self) {
        let due: Vec<String> = {
            let health = self.health.read().expect("health lock poisoned");
            health
                .iter()
                .filter(|(_, state)| !state.healthy)
                .filter(|(_, state)| {
                    state
                        .last_check
                        .is_none_or(|at| at.elapsed() >= RECOVERY_BACKOFF)
                })
                .map(|(ep, _)| ep.clone())
                .collect()
        };

        if due.is_empty() {
            return;
        }

        join_all(due.into_iter().map(|ep| self.probe(ep))).await;
    }

    /// Execute `call` with failover: pick a healthy endpoint at random, on a
    /// demotable failure mark it unhealthy and move on, up to one attempt
    /// per configured endpoint.
    async fn execute<T, F>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: Fn(Arc<Client>) -> BoxFuture<'static, Result<T>>,
    {
        let max_attempts = self.endpoints.len().max(1);

        for attempt in 0..max_attempts {
            let mut candidates = self.healthy_endpoints();
            if candidates.is_empty() {
                self.recover().await;
                candidates = self.healthy_endpoints();
            }
            if candidates.is_empty() {
                return Err(MonitorError::connection(
                    op,
                    &self.name,
                    format!("no healthy nodes available in cluster {}", self.name),
                ));
            }

            let (endpoint, client) = {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                candidates.swap_remove(index)
            };

            match call(client).await {
                Ok(value) => return Ok(value),
                Err(err) => match failover_disposition(&err) {
                    FailoverDisposition::ReturnToCaller => {
                        debug!(
                            cluster = %self.name,
                            endpoint = %endpoint,
                            error = %err,
                            "node-specific or auth error, not demoting endpoint"
                        );
                        return Err(err);
                    }
                    FailoverDisposition::Demote => {
                        self.mark_unhealthy(&endpoint);
                        warn!(
                            cluster = %self.name,
                            endpoint = %endpoint,
                            attempt = attempt + 1,
                            error = %err,
                            "call failed on cluster endpoint, trying next"
                        );
                    }
                },
            }
        }

        Err(MonitorError::connection(
            op,
            &self.name,
            format!("all cluster nodes failed for {}", self.name),
        ))
    }

    /// Current per-endpoint health, for status surfaces
    pub fn health_status(&self) -> HashMap<String, bool> {
        let health = self.health.read().expect("health lock poisoned");
        health
            .iter()
            .map(|(ep, state)| (ep.clone(), state.healthy))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, endpoints: Vec<String>) -> Self {
        let health = endpoints
            .iter()
            .map(|ep| (ep.clone(), EndpointState::default()))
            .collect();
        Self {
            name: name.to_string(),
            base: ClientConfig::default(),
            endpoints,
            health: RwLock::new(health),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_healthy_for_tests(&self, endpoint: &str, healthy: bool) {
        let mut map = self.health.write().unwrap();
        if let Some(state) = map.get_mut(endpoint) {
            state.healthy = healthy;
        }
    }
}

macro_rules! failover_call {
    ($self:ident, $op:literal, |$client:ident| $body:expr) => {
        $self
            .execute($op, move |$client| Box::pin(async move { $body }))
            .await
    };
}

#[async_trait]
impl PveApi for ClusterClient {
    async fn get_nodes(&self) -> Result<Vec<Node>> {
        failover_call!(self, "get_nodes", |c| c.get_nodes().await)
    }

    async fn get_node_status(&self, node: &str) -> Result<NodeStatus> {
        let node = node.to_string();
        self.execute("get_node_status", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_node_status(&node).await })
        })
        .await
    }

    async fn get_vms(&self, node: &str) -> Result<Vec<Vm>> {
        let node = node.to_string();
        self.execute("get_vms", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_vms(&node).await })
        })
        .await
    }

    async fn get_containers(&self, node: &str) -> Result<Vec<Container>> {
        let node = node.to_string();
        self.execute("get_containers", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_containers(&node).await })
        })
        .await
    }

    async fn get_storage(&self, node: &str) -> Result<Vec<Storage>> {
        let node = node.to_string();
        self.execute("get_storage", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_storage(&node).await })
        })
        .await
    }

    async fn get_all_storage(&self) -> Result<Vec<Storage>> {
        failover_call!(self, "get_all_storage", |c| c.get_all_storage().await)
    }

    async fn get_storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageContent>> {
        let node = node.to_string();
        let storage = storage.to_string();
        self.execute("get_storage_content", move |c| {
            let node = node.clone();
            let storage = storage.clone();
            Box::pin(async move { c.get_storage_content(&node, &storage).await })
        })
        .await
    }

    async fn get_backup_tasks(&self) -> Result<Vec<Task>> {
        failover_call!(self, "get_backup_tasks", |c| c.get_backup_tasks().await)
    }

    async fn get_vm_snapshots(&self, node: &str, vmid: u32) -> Result<Vec<Snapshot>> {
        let node = node.to_string();
        self.execute("get_vm_snapshots", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_vm_snapshots(&node, vmid).await })
        })
        .await
    }

    async fn get_container_snapshots(&self, node: &str, vmid: u32) -> Result<Vec<Snapshot>> {
        let node = node.to_string();
        self.execute("get_container_snapshots", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_container_snapshots(&node, vmid).await })
        })
        .await
    }

    async fn get_vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus> {
        let node = node.to_string();
        self.execute("get_vm_status", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_vm_status(&node, vmid).await })
        })
        .await
    }

    async fn get_container_status(&self, node: &str, vmid: u32) -> Result<Container> {
        let node = node.to_string();
        self.execute("get_container_status", move |c| {
            let node = node.clone();
            Box::pin(async move { c.get_container_status(&node, vmid).await })
        })
        .await
    }

    async fn get_cluster_resources(&self, resource_type: &str) -> Result<Vec<ClusterResource>> {
        let resource_type = resource_type.to_string();
        self.execute("get_cluster_resources", move |c| {
            let resource_type = resource_type.clone();
            Box::pin(async move { c.get_cluster_resources(&resource_type).await })
        })
        .await
    }

    async fn is_cluster_member(&self) -> Result<bool> {
        failover_call!(self, "is_cluster_member", |c| c.is_cluster_member().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<String> {
        vec![
            "https://e1:8006".to_string(),
            "https://e2:8006".to_string(),
            "https://e3:8006".to_string(),
        ]
    }

    #[test]
    fn hostname_lookup_595_is_returned_without_demotion() {
        // A 595 with a hostname-lookup body is a per-target failure: the
        // endpoint answered, the cluster member it proxied to did not.
        let err = MonitorError::api("get_vms", "lab", 595, "no ticket for hostname lookup");
        assert_eq!(failover_disposition(&err), FailoverDisposition::ReturnToCaller);

        let client = ClusterClient::for_tests("lab", endpoints());
        for ep in endpoints() {
            client.set_healthy_for_tests(&ep, true);
        }

        // Health map stays all-true even though the call failed
        let health = client.health_status();
        assert!(health.values().all(|&h| h));
    }

    #[test]
    fn auth_errors_are_returned_without_demotion() {
        let err = MonitorError::api("get_nodes", "lab", 401, "authentication failure");
        assert_eq!(failover_disposition(&err), FailoverDisposition::ReturnToCaller);

        let err = MonitorError::api("get_nodes", "lab", 403, "permission denied");
        assert_eq!(failover_disposition(&err), FailoverDisposition::ReturnToCaller);
    }

    #[test]
    fn generic_errors_demote_the_endpoint() {
        let err = MonitorError::connection("get_nodes", "lab", "connection refused");
        assert_eq!(failover_disposition(&err), FailoverDisposition::Demote);

        let err = MonitorError::api("get_nodes", "lab", 500, "internal server error");
        assert_eq!(failover_disposition(&err), FailoverDisposition::Demote);

        let err = MonitorError::timeout("get_nodes", "lab");
        assert_eq!(failover_disposition(&err), FailoverDisposition::Demote);
    }

    #[test]
    fn mark_unhealthy_flips_health_map() {
        let client = ClusterClient::for_tests("lab", endpoints());
        client.set_healthy_for_tests("https://e1:8006", true);
        client.set_healthy_for_tests("https://e2:8006", true);

        client.mark_unhealthy("https://e1:8006");

        let health = client.health_status();
        assert_eq!(health["https://e1:8006"], false);
        assert_eq!(health["https://e2:8006"], true);
    }

    #[tokio::test]
    async fn execute_fails_fast_with_no_healthy_endpoints() {
        let client = ClusterClient::for_tests("lab", endpoints());

        // All endpoints unhealthy with a fresh last_check, so recovery is
        // skipped by the backoff and the call errors out immediately.
        {
            let mut health = client.health.write().unwrap();
            for state in health.values_mut() {
                state.healthy = false;
                state.last_check = Some(Instant::now());
            }
        }

        let result: Result<Vec<Node>> = client
            .execute("get_nodes", |c| Box::pin(async move { c.get_nodes().await }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("no healthy nodes"));
    }
}
