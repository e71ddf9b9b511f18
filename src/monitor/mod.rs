//! Polling orchestrator
//!
//! Owns the clients, the state store, the alert engine, the rate tracker and
//! the metrics history, and drives one polling cycle across every configured
//! PVE and PBS instance on a fixed cadence. Each instance is polled by its
//! own task under a worker semaphore and a per-cycle deadline; a broadcast
//! ticker republishes the latest snapshot independently of cycle outcomes.

pub mod history;
pub mod rates;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::alerts::AlertManager;
use crate::config::{Config, PbsInstance, PveInstance};
use crate::error::Result;
use crate::fanout::Hub;
use crate::models::{
    safe_fraction, safe_percentage, sort_content, BackupTask, ConnectionHealth, Container, CpuInfo,
    Disk, GuestSample, GuestSnapshot, Memory, MetricPoint, Node, PbsBackup, PbsDatastore,
    PbsInstanceStatus, PbsNamespace, Stats, Storage, StorageBackup, Vm,
};
use crate::pbs;
use crate::proxmox::{self, ClusterClient, PveApi};
use crate::state::{State, StateSnapshot};

use history::MetricsHistory;
use rates::{IoSample, RateTracker};

/// Fixed polling cadence. The upstream cluster/resources endpoint refreshes
/// every 10 seconds; polling faster returns identical data.
const POLLING_INTERVAL: Duration = Duration::from_secs(10);

/// Subtracted from the interval to form the per-cycle deadline
const CYCLE_HEADROOM: Duration = Duration::from_millis(200);

/// Per-cycle deadline never drops below this
const MIN_CYCLE_BUDGET: Duration = Duration::from_secs(5);

/// At most this many polling cycles in flight at once
const MAX_CONCURRENT_CYCLES: i32 = 2;

/// Consecutive auth failures before an instance is locked out
const MAX_AUTH_FAILURES: u32 = 5;

/// Budget for the detached backup/snapshot scan
const BACKUP_SCAN_BUDGET: Duration = Duration::from_secs(120);

/// Per-request timeout for PBS clients; slow spinning-rust PBS boxes need it
const PBS_TIMEOUT: Duration = Duration::from_secs(60);

/// History bounds: points per series, retention window
const HISTORY_MAX_POINTS: usize = 1000;
const HISTORY_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Top-level monitor owning all core subsystems
pub struct Monitor {
    config: Config,
    state: Arc<State>,
    hub: Arc<Hub>,
    alerts: Arc<AlertManager>,
    rate_tracker: RateTracker,
    metrics_history: MetricsHistory,
    pve_clients: HashMap<String, Arc<dyn PveApi>>,
    pbs_clients: HashMap<String, Arc<pbs::Client>>,
    start_time: DateTime<Utc>,
    active_polls: AtomicI32,
    poll_counter: AtomicU64,
    auth_failures: Mutex<HashMap<String, u32>>,
    // Instances configured as clusters that turned out to be standalone
    demoted_clusters: Mutex<HashSet<String>>,
    shutdown_tx: watch::Sender<bool>,
}

struct PollGuard<'a>(&'a AtomicI32);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Monitor {
    /// Build clients from configuration and wire the alert callbacks into
    /// the push hub. Instances whose client cannot be constructed are
    /// skipped with an error log; the monitor itself never fails to start
    /// over one bad instance.
    pub async fn new(config: Config, hub: Arc<Hub>) -> Result<Arc<Self>> {
        let state = Arc::new(State::new());
        let alerts = Arc::new(AlertManager::new(&config.data_path));

        let mut pve_clients: HashMap<String, Arc<dyn PveApi>> = HashMap::new();
        for inst in &config.pve_instances {
            let client_config =
                proxmox::ClientConfig::from_instance(inst, config.connection_timeout());

            if inst.is_cluster && !inst.cluster_endpoints.is_empty() {
                let endpoints = inst.endpoint_urls();
                info!(
                    instance = %inst.name,
                    cluster = %inst.cluster_name,
                    endpoints = endpoints.len(),
                    "creating cluster-aware client"
                );
                let cluster =
                    ClusterClient::new(inst.name.clone(), client_config, endpoints).await;
                pve_clients.insert(inst.name.clone(), Arc::new(cluster));
            } else {
                match proxmox::Client::new(inst.name.clone(), client_config) {
                    Ok(client) => {
                        pve_clients.insert(inst.name.clone(), Arc::new(client));
                    }
                    Err(e) => {
                        error!(instance = %inst.name, error = %e, "failed to create PVE client");
                    }
                }
            }
        }

        let mut pbs_clients = HashMap::new();
        for inst in &config.pbs_instances {
            let client_config = pbs::ClientConfig::from_instance(inst, PBS_TIMEOUT);
            match pbs::Client::new(inst.name.clone(), client_config) {
                Ok(client) => {
                    pbs_clients.insert(inst.name.clone(), Arc::new(client));
                }
                Err(e) => {
                    error!(instance = %inst.name, error = %e, "failed to create PBS client");
                }
            }
        }

        // Alert events flow up only through these callbacks; the engine
        // holds no reference back to the monitor.
        {
            let hub_for_alert = Arc::clone(&hub);
            alerts.set_alert_callback(Arc::new(move |alert| {
                hub_for_alert.broadcast_alert(alert);
            }));

            let hub_for_resolved = Arc::clone(&hub);
            let state_for_resolved = Arc::clone(&state);
            alerts.set_resolved_callback(Arc::new(move |alert_id| {
                hub_for_resolved.broadcast_alert_resolved(alert_id);
                // Push a fresh snapshot so subscribers see the shrunken
                // active list immediately
                hub_for_resolved.broadcast_state(state_for_resolved.snapshot());
            }));

            let hub_for_escalate = Arc::clone(&hub);
            alerts.set_escalate_callback(Arc::new(move |alert, level| {
                hub_for_escalate.broadcast_alert_escalated(alert, level);
            }));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            state,
            hub,
            alerts,
            rate_tracker: RateTracker::new(),
            metrics_history: MetricsHistory::new(HISTORY_MAX_POINTS, HISTORY_RETENTION),
            pve_clients,
            pbs_clients,
            start_time: Utc::now(),
            active_polls: AtomicI32::new(0),
            poll_counter: AtomicU64::new(0),
            auth_failures: Mutex::new(HashMap::new()),
            demoted_clusters: Mutex::new(HashSet::new()),
            shutdown_tx,
        }))
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Per-instance connection health, as last observed
    pub fn connection_statuses(&self) -> HashMap<String, bool> {
        self.state.connection_health()
    }

    pub fn guest_metrics(
        &self,
        guest_id: &str,
        window: Duration,
    ) -> HashMap<String, Vec<MetricPoint>> {
        self.metrics_history.guest_metrics(guest_id, window)
    }

    pub fn node_metrics(&self, node_id: &str, metric: &str, window: Duration) -> Vec<MetricPoint> {
        self.metrics_history.node_metrics(node_id, metric, window)
    }

    pub fn storage_metrics(
        &self,
        storage_id: &str,
        window: Duration,
    ) -> HashMap<String, Vec<MetricPoint>> {
        self.metrics_history.storage_metrics(storage_id, window)
    }

    /// Run the polling and broadcast loops until [`stop`]
    ///
    /// [`stop`]: Monitor::stop
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = POLLING_INTERVAL.as_secs(),
            pve = self.pve_clients.len(),
            pbs = self.pbs_clients.len(),
            "starting monitoring loop"
        );

        self.alerts.start();

        let mut poll_tick = tokio::time::interval(POLLING_INTERVAL);
        let mut broadcast_tick = tokio::time::interval(POLLING_INTERVAL);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = poll_tick.tick() => {
                    let monitor = Arc::clone(&self);
                    tokio::spawn(async move { monitor.poll().await });
                }
                _ = broadcast_tick.tick() => {
                    // Republish unconditionally so subscribers converge even
                    // when a polling cycle was skipped or cancelled
                    self.hub.broadcast_state(self.state.snapshot());
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("monitoring loop stopped");
    }

    /// Stop the loop and flush alert state
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.alerts.stop();
    }

    /// One polling cycle over every instance
    pub async fn poll(self: &Arc<Self>) {
        let in_flight = self.active_polls.fetch_add(1, Ordering::SeqCst) + 1;
        if in_flight > MAX_CONCURRENT_CYCLES {
            self.active_polls.fetch_sub(1, Ordering::SeqCst);
            debug!(in_flight, "too many concurrent polls, skipping cycle");
            return;
        }
        let _guard = PollGuard(&self.active_polls);

        let cycle = self.poll_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started = std::time::Instant::now();
        debug!(cycle, "starting polling cycle");

        let interval = Duration::from_secs(self.config.polling_interval.max(1));
        let budget = interval
            .saturating_sub(CYCLE_HEADROOM)
            .max(MIN_CYCLE_BUDGET);
        let deadline = Instant::now() + budget;

        if self.config.concurrent_polling {
            self.poll_concurrent(cycle, deadline).await;
        } else {
            self.poll_sequential(cycle, deadline).await;
        }

        // Mirror alert engine state into the aggregate
        self.state.update_active_alerts(self.alerts.active_alerts());
        self.state
            .update_recently_resolved(self.alerts.recently_resolved());

        self.state.set_stats(Stats {
            start_time: Some(self.start_time),
            uptime: (Utc::now() - self.start_time).num_seconds().max(0) as u64,
            polling_cycles: cycle,
            last_poll_duration: started.elapsed().as_secs_f64(),
            connected_clients: self.hub.client_count(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        debug!(cycle, elapsed_ms = started.elapsed().as_millis() as u64, "polling cycle completed");
    }

    async fn poll_concurrent(self: &Arc<Self>, cycle: u64, deadline: Instant) {
        let total = self.pve_clients.len() + self.pbs_clients.len();
        let workers = total.clamp(2, 10);
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut tasks = Vec::with_capacity(total);

        for inst in &self.config.pve_instances {
            let Some(client) = self.pve_clients.get(&inst.name).cloned() else {
                continue;
            };
            let monitor = Arc::clone(self);
            let inst = inst.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if timeout_at(deadline, monitor.poll_pve_instance(&inst, client, cycle))
                    .await
                    .is_err()
                {
                    warn!(instance = %inst.name, "PVE poll hit the cycle deadline");
                }
            }));
        }

        for inst in &self.config.pbs_instances {
            let Some(client) = self.pbs_clients.get(&inst.name).cloned() else {
                continue;
            };
            let monitor = Arc::clone(self);
            let inst = inst.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if timeout_at(deadline, monitor.poll_pbs_instance(&inst, client))
                    .await
                    .is_err()
                {
                    warn!(instance = %inst.name, "PBS poll hit the cycle deadline");
                }
            }));
        }

        join_all(tasks).await;
    }

    async fn poll_sequential(self: &Arc<Self>, cycle: u64, deadline: Instant) {
        for inst in &self.config.pve_instances {
            let Some(client) = self.pve_clients.get(&inst.name).cloned() else {
                continue;
            };
            if timeout_at(deadline, self.poll_pve_instance(inst, client, cycle))
                .await
                .is_err()
            {
                warn!(instance = %inst.name, "PVE poll hit the cycle deadline");
                return;
            }
        }
        for inst in &self.config.pbs_instances {
            let Some(client) = self.pbs_clients.get(&inst.name).cloned() else {
                continue;
            };
            if timeout_at(deadline, self.poll_pbs_instance(inst, client))
                .await
                .is_err()
            {
                warn!(instance = %inst.name, "PBS poll hit the cycle deadline");
                return;
            }
        }
    }

    // -- PVE ---------------------------------------------------------------

    async fn poll_pve_instance(
        self: &Arc<Self>,
        inst: &PveInstance,
        client: Arc<dyn PveApi>,
        cycle: u64,
    ) {
        debug!(instance = %inst.name, "polling PVE instance");

        let nodes = match client.get_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(instance = %inst.name, error = %e, "failed to get nodes");
                self.state.set_connection_health(&inst.name, false);
                if e.is_auth() {
                    self.record_auth_failure(&inst.name, "pve");
                }
                return;
            }
        };

        self.reset_auth_failures(&inst.name, "pve");
        self.state.set_connection_health(&inst.name, true);

        let now = Utc::now();
        let mut model_nodes = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut model = Node {
                id: format!("{}-{}", inst.name, node.node),
                name: node.node.clone(),
                instance: inst.name.clone(),
                host: inst.host.clone(),
                status: node.status.clone(),
                kind: "node".to_string(),
                cpu: safe_fraction(node.cpu),
                memory: Memory::from_used_total(node.mem, node.maxmem),
                disk: Disk::from_used_total(node.disk, node.maxdisk),
                uptime: node.uptime,
                load_average: Vec::new(),
                kernel_version: String::new(),
                pve_version: String::new(),
                cpu_info: CpuInfo::default(),
                last_seen: now,
                connection_health: ConnectionHealth::Healthy,
            };

            match client.get_node_status(&node.node).await {
                Ok(status) => {
                    model.load_average = status.loadavg.clone();
                    model.kernel_version = status.kernel_version.clone();
                    model.pve_version = status.pve_version.clone();

                    // rootfs gives stabler disk numbers than the summary row
                    if let Some(rootfs) = &status.rootfs {
                        if rootfs.total > 0 {
                            model.disk = Disk::from_used_total(rootfs.used, rootfs.total);
                        }
                    }

                    if let Some(cpu_info) = &status.cpu_info {
                        let logical_cores = if node.maxcpu > 0 {
                            node.maxcpu
                        } else {
                            cpu_info.cores
                        };
                        model.cpu_info = CpuInfo {
                            model: cpu_info.model.clone(),
                            cores: logical_cores,
                            sockets: cpu_info.sockets,
                            mhz: cpu_info.mhz.clone(),
                        };
                    }
                }
                Err(e) => {
                    // Publish the basic row anyway; the health marker tells
                    // the alert engine and the UI that detail is missing
                    debug!(instance = %inst.name, node = %node.node, error = %e,
                        "could not get node status");
                    model.connection_health = ConnectionHealth::Error;
                }
            }

            model_nodes.push(model);
        }

        // Publish early so downstream fetches see current nodes
        self.state
            .update_nodes_for_instance(&inst.name, model_nodes.clone());

        // Storage-based disk fallback for nodes without rootfs data
        if inst.monitor_storage && model_nodes.iter().any(|n| n.disk.total == 0) {
            let mut fallback: HashMap<String, Disk> = HashMap::new();
            for node in &nodes {
                let Ok(storages) = client.get_storage(&node.node).await else {
                    continue;
                };
                for storage in storages {
                    if storage.storage != "local" && storage.storage != "local-lvm" {
                        continue;
                    }
                    let disk = Disk::from_used_total(storage.used, storage.total);
                    // Prefer "local" over "local-lvm"
                    let replace = match fallback.get(&node.node) {
                        None => true,
                        Some(_) => storage.storage == "local",
                    };
                    if replace {
                        fallback.insert(node.node.clone(), disk);
                    }
                }
            }
            for model in &mut model_nodes {
                if model.disk.total == 0 {
                    if let Some(disk) = fallback.get(&model.name) {
                        model.disk = *disk;
                    }
                }
            }
        }

        for model in &model_nodes {
            // History stores percentages
            self.metrics_history
                .add_node_metric(&model.id, "cpu", model.cpu * 100.0, now);
            self.metrics_history
                .add_node_metric(&model.id, "memory", model.memory.usage, now);
            self.metrics_history
                .add_node_metric(&model.id, "disk", model.disk.usage, now);
            self.alerts.check_node(model);
        }

        self.state
            .update_nodes_for_instance(&inst.name, model_nodes);

        if inst.monitor_vms || inst.monitor_containers {
            let mut used_cluster_endpoint = false;
            if inst.is_cluster && !self.is_demoted_cluster(&inst.name) {
                match client.is_cluster_member().await {
                    Ok(true) => {
                        used_cluster_endpoint =
                            self.poll_guests_efficient(&inst.name, client.as_ref()).await;
                    }
                    Ok(false) => {
                        warn!(
                            instance = %inst.name,
                            "instance marked as cluster but is standalone, using per-node polling"
                        );
                        self.demote_cluster(&inst.name);
                    }
                    Err(e) => {
                        debug!(instance = %inst.name, error = %e, "cluster membership check failed");
                    }
                }
            }

            if !used_cluster_endpoint {
                if inst.monitor_vms {
                    self.poll_vms_with_nodes(&inst.name, client.as_ref(), &nodes)
                        .await;
                }
                if inst.monitor_containers {
                    self.poll_containers_with_nodes(&inst.name, client.as_ref(), &nodes)
                        .await;
                }
            }
        }

        if inst.monitor_storage {
            self.poll_storage_with_nodes(&inst.name, client.as_ref(), &nodes)
                .await;
        }

        // The backup scan is slow and runs detached under its own budget so
        // it can never hold up real-time polling.
        let backup_cycles = self.config.backup_polling_cycles.max(1);
        if inst.monitor_backups && (cycle % backup_cycles == 0 || cycle == 1) {
            let monitor = Arc::clone(self);
            let instance_name = inst.name.clone();
            let client = Arc::clone(&client);
            let nodes = nodes.clone();
            tokio::spawn(async move {
                info!(instance = %instance_name, "starting background backup scan");
                let scan = async {
                    monitor
                        .poll_backup_tasks(&instance_name, client.as_ref())
                        .await;
                    monitor
                        .poll_storage_backups(&instance_name, client.as_ref(), &nodes)
                        .await;
                    monitor
                        .poll_guest_snapshots(&instance_name, client.as_ref())
                        .await;
                };
                if timeout(BACKUP_SCAN_BUDGET, scan).await.is_err() {
                    warn!(instance = %instance_name, "backup scan exceeded its budget");
                } else {
                    info!(instance = %instance_name, "background backup scan completed");
                }
            });
        }
    }

    /// Fetch all guests through `/cluster/resources` in one call. Returns
    /// false when the endpoint is unavailable so the caller can fall back
    /// to per-node polling.
    async fn poll_guests_efficient(&self, instance: &str, client: &dyn PveApi) -> bool {
        let resources = match client.get_cluster_resources("vm").await {
            Ok(resources) => resources,
            Err(e) => {
                debug!(instance, error = %e, "cluster/resources unavailable, falling back");
                return false;
            }
        };

        let now = Utc::now();
        let mut vms = Vec::new();
        let mut containers = Vec::new();

        for res in resources {
            if res.template == 1 {
                continue;
            }

            let guest_id = format!("{}-{}-{}", instance, res.node, res.vmid);
            let rates = self.rate_tracker.calculate_rates(
                &guest_id,
                IoSample {
                    disk_read: res.diskread,
                    disk_write: res.diskwrite,
                    net_in: res.netin,
                    net_out: res.netout,
                    timestamp: now,
                },
            );

            let running = res.status == "running";
            let cpu = if running { safe_fraction(res.cpu) } else { 0.0 };
            let memory = if running {
                Memory::from_used_total(res.mem, res.maxmem)
            } else {
                Memory::from_used_total(0, res.maxmem)
            };
            let tags = split_tags(&res.tags);

            match res.kind.as_str() {
                "qemu" => {
                    let vm = Vm {
                        id: guest_id,
                        vmid: res.vmid,
                        name: res.name.clone(),
                        node: res.node.clone(),
                        instance: instance.to_string(),
                        status: res.status.clone(),
                        kind: "qemu".to_string(),
                        cpu,
                        cpus: res.maxcpu,
                        memory,
                        disk: Disk::from_used_total(res.disk, res.maxdisk),
                        network_in: rates.net_in,
                        network_out: rates.net_out,
                        disk_read: rates.disk_read,
                        disk_write: rates.disk_write,
                        uptime: res.uptime,
                        template: false,
                        tags,
                        lock: String::new(),
                        last_seen: now,
                    };
                    self.record_guest(&GuestSample::from(&vm), instance, now);
                    vms.push(vm);
                }
                "lxc" => {
                    let ct = Container {
                        id: guest_id,
                        vmid: res.vmid,
                        name: res.name.clone(),
                        node: res.node.clone(),
                        instance: instance.to_string(),
                        status: res.status.clone(),
                        kind: "lxc".to_string(),
                        cpu,
                        cpus: res.maxcpu,
                        memory,
                        disk: Disk::from_used_total(res.disk, res.maxdisk),
                        network_in: rates.net_in,
                        network_out: rates.net_out,
                        disk_read: rates.disk_read,
                        disk_write: rates.disk_write,
                        uptime: res.uptime,
                        template: false,
                        tags,
                        lock: String::new(),
                        last_seen: now,
                    };
                    self.record_guest(&GuestSample::from(&ct), instance, now);
                    containers.push(ct);
                }
                _ => {}
            }
        }

        // A transiently empty result must not wipe the shard; the next
        // successful cycle reconciles it.
        if !vms.is_empty() {
            self.state.update_vms_for_instance(instance, vms);
        }
        if !containers.is_empty() {
            self.state.update_containers_for_instance(instance, containers);
        }

        true
    }

    async fn poll_vms_with_nodes(
        &self,
        instance: &str,
        client: &dyn PveApi,
        nodes: &[proxmox::Node],
    ) {
        let now = Utc::now();
        let mut all_vms = Vec::new();

        for node in nodes {
            let vms = match client.get_vms(&node.node).await {
                Ok(vms) => vms,
                Err(e) => {
                    error!(instance, node = %node.node, error = %e, "failed to get VMs");
                    continue;
                }
            };

            for vm in vms {
                if vm.template == 1 {
                    continue;
                }

                let guest_id = format!("{}-{}-{}", instance, node.node, vm.vmid);
                let rates = self.rate_tracker.calculate_rates(
                    &guest_id,
                    IoSample {
                        disk_read: vm.diskread,
                        disk_write: vm.diskwrite,
                        net_in: vm.netin,
                        net_out: vm.netout,
                        timestamp: now,
                    },
                );

                let running = vm.status == "running";
                let mut mem_total = vm.maxmem;
                let mut mem_used = 0;

                if running {
                    // The status endpoint knows about ballooning and, with a
                    // guest agent, the real free memory.
                    match client.get_vm_status(&node.node, vm.vmid).await {
                        Ok(status) => {
                            if status.balloon > 0 && status.balloon < status.maxmem {
                                mem_total = status.balloon;
                            }
                            if status.free_mem > 0 {
                                mem_used = mem_total.saturating_sub(status.free_mem);
                            } else if status.mem > 0 {
                                mem_used = status.mem;
                            }
                        }
                        Err(e) => {
                            debug!(instance, node = %node.node, vmid = vm.vmid, error = %e,
                                "failed to get VM status");
                        }
                    }
                }

                let cpu = if running { safe_fraction(vm.cpu) } else { 0.0 };

                let model = Vm {
                    id: guest_id,
                    vmid: vm.vmid,
                    name: vm.name.clone(),
                    node: node.node.clone(),
                    instance: instance.to_string(),
                    status: vm.status.clone(),
                    kind: "qemu".to_string(),
                    cpu,
                    cpus: vm.cpus,
                    memory: Memory::from_used_total(mem_used, mem_total),
                    disk: Disk::from_used_total(vm.disk, vm.maxdisk),
                    network_in: rates.net_in,
                    network_out: rates.net_out,
                    disk_read: rates.disk_read,
                    disk_write: rates.disk_write,
                    uptime: vm.uptime,
                    template: false,
                    tags: split_tags(&vm.tags),
                    lock: vm.lock.clone(),
                    last_seen: now,
                };

                self.record_guest(&GuestSample::from(&model), instance, now);
                all_vms.push(model);
            }
        }

        self.state.update_vms_for_instance(instance, all_vms);
    }

    async fn poll_containers_with_nodes(
        &self,
        instance: &str,
        client: &dyn PveApi,
        nodes: &[proxmox::Node],
    ) {
        let now = Utc::now();
        let mut all_containers = Vec::new();

        for node in nodes {
            let containers = match client.get_containers(&node.node).await {
                Ok(containers) => containers,
                Err(e) => {
                    error!(instance, node = %node.node, error = %e, "failed to get containers");
                    continue;
                }
            };

            for ct in containers {
                if ct.template == 1 {
                    continue;
                }

                let guest_id = format!("{}-{}-{}", instance, node.node, ct.vmid);
                let rates = self.rate_tracker.calculate_rates(
                    &guest_id,
                    IoSample {
                        disk_read: ct.diskread,
                        disk_write: ct.diskwrite,
                        net_in: ct.netin,
                        net_out: ct.netout,
                        timestamp: now,
                    },
                );

                let running = ct.status == "running";
                // Container memory reporting is accurate without extra calls
                let mem_used = if running { ct.mem } else { 0 };
                let cpu = if running { safe_fraction(ct.cpu) } else { 0.0 };

                let model = Container {
                    id: guest_id,
                    vmid: ct.vmid,
                    name: ct.name.clone(),
                    node: node.node.clone(),
                    instance: instance.to_string(),
                    status: ct.status.clone(),
                    kind: "lxc".to_string(),
                    cpu,
                    cpus: ct.cpus,
                    memory: Memory::from_used_total(mem_used, ct.maxmem),
                    disk: Disk::from_used_total(ct.disk, ct.maxdisk),
                    network_in: rates.net_in,
                    network_out: rates.net_out,
                    disk_read: rates.disk_read,
                    disk_write: rates.disk_write,
                    uptime: ct.uptime,
                    template: false,
                    tags: split_tags(&ct.tags),
                    lock: ct.lock.clone(),
                    last_seen: now,
                };

                self.record_guest(&GuestSample::from(&model), instance, now);
                all_containers.push(model);
            }
        }

        self.state
            .update_containers_for_instance(instance, all_containers);
    }

    /// Record history samples and run threshold checks for one guest
    fn record_guest(&self, sample: &GuestSample, instance: &str, now: DateTime<Utc>) {
        let id = &sample.id;
        self.metrics_history
            .add_guest_metric(id, "cpu", sample.cpu * 100.0, now);
        self.metrics_history
            .add_guest_metric(id, "memory", sample.memory_usage, now);
        self.metrics_history
            .add_guest_metric(id, "disk", sample.disk_usage, now);
        self.metrics_history
            .add_guest_metric(id, "diskread", sample.disk_read as f64, now);
        self.metrics_history
            .add_guest_metric(id, "diskwrite", sample.disk_write as f64, now);
        self.metrics_history
            .add_guest_metric(id, "netin", sample.network_in as f64, now);
        self.metrics_history
            .add_guest_metric(id, "netout", sample.network_out as f64, now);

        self.alerts.check_guest(sample, instance);
    }

    async fn poll_storage_with_nodes(
        &self,
        instance: &str,
        client: &dyn PveApi,
        nodes: &[proxmox::Node],
    ) {
        // The cluster-wide listing carries the shared/enabled flags that the
        // per-node rows lack
        let cluster_storages = match client.get_all_storage().await {
            Ok(storages) => storages,
            Err(e) => {
                error!(instance, error = %e, "failed to get cluster storage");
                Vec::new()
            }
        };
        let cluster_map: HashMap<&str, &proxmox::Storage> = cluster_storages
            .iter()
            .map(|s| (s.storage.as_str(), s))
            .collect();

        let now = Utc::now();
        let mut all_storage = Vec::new();
        let mut seen_shared: HashSet<String> = HashSet::new();

        for node in nodes {
            let node_storages = match client.get_storage(&node.node).await {
                Ok(storages) => storages,
                Err(e) => {
                    error!(instance, node = %node.node, error = %e, "failed to get node storage");
                    continue;
                }
            };

            for storage in node_storages {
                let cluster_config = cluster_map.get(storage.storage.as_str());
                let shared = cluster_config.map(|c| c.shared == 1).unwrap_or(false);

                // A shared pool reports identical numbers from every node;
                // emit it exactly once under a node-independent id.
                if shared && !seen_shared.insert(storage.storage.clone()) {
                    continue;
                }

                let (node_id, storage_id) = if shared {
                    ("shared".to_string(), format!("shared-{}", storage.storage))
                } else {
                    (
                        node.node.clone(),
                        format!("{}-{}-{}", instance, node.node, storage.storage),
                    )
                };

                let content = cluster_config
                    .filter(|c| !c.content.is_empty())
                    .map(|c| sort_content(&c.content))
                    .unwrap_or_else(|| sort_content(&storage.content));
                let enabled = cluster_config.map(|c| c.enabled == 1).unwrap_or(true);
                let active = cluster_config.map(|c| c.active == 1).unwrap_or(true);

                let status = if storage.active == 1 || active {
                    "available"
                } else if enabled {
                    "inactive"
                } else {
                    "disabled"
                };

                let model = Storage {
                    id: storage_id,
                    name: storage.storage.clone(),
                    node: node_id,
                    instance: instance.to_string(),
                    kind: storage.kind.clone(),
                    status: status.to_string(),
                    total: storage.total,
                    used: storage.used,
                    free: storage.available,
                    usage: safe_percentage(storage.used as f64, storage.total as f64),
                    content,
                    shared,
                    enabled,
                    active,
                };

                self.metrics_history
                    .add_storage_metric(&model.id, "usage", model.usage, now);
                self.metrics_history
                    .add_storage_metric(&model.id, "used", model.used as f64, now);
                self.metrics_history
                    .add_storage_metric(&model.id, "total", model.total as f64, now);
                self.metrics_history
                    .add_storage_metric(&model.id, "avail", model.free as f64, now);

                self.alerts.check_storage(&model);
                all_storage.push(model);
            }
        }

        self.state.update_storage_for_instance(instance, all_storage);
    }

    async fn poll_backup_tasks(&self, instance: &str, client: &dyn PveApi) {
        let tasks = match client.get_backup_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(instance, error = %e, "failed to get backup tasks");
                return;
            }
        };

        let backup_tasks: Vec<BackupTask> = tasks
            .into_iter()
            .map(|task| BackupTask {
                id: format!("{}-{}", instance, task.upid),
                node: task.node.clone(),
                kind: task.kind.clone(),
                // The task id field carries the vmid for vzdump tasks
                vmid: task.id.parse().unwrap_or(0),
                status: task.status.clone(),
                start_time: timestamp(task.start_time),
                end_time: (task.end_time > 0).then(|| timestamp(task.end_time)),
            })
            .collect();

        self.state
            .update_backup_tasks_for_instance(instance, backup_tasks);
    }

    async fn poll_storage_backups(
        &self,
        instance: &str,
        client: &dyn PveApi,
        nodes: &[proxmox::Node],
    ) {
        let mut all_backups = Vec::new();
        // Shared storage shows the same volumes from every node
        let mut seen_volids: HashSet<String> = HashSet::new();

        for node in nodes {
            if node.status != "online" {
                continue;
            }

            let storages = match client.get_storage(&node.node).await {
                Ok(storages) => storages,
                Err(e) => {
                    error!(instance, node = %node.node, error = %e, "failed to get storage");
                    continue;
                }
            };

            for storage in storages {
                if !storage.content.contains("backup") {
                    continue;
                }

                let contents = match client.get_storage_content(&node.node, &storage.storage).await
                {
                    Ok(contents) => contents,
                    Err(e) => {
                        debug!(instance, node = %node.node, storage = %storage.storage,
                            error = %e, "failed to get storage content");
                        continue;
                    }
                };

                for content in contents {
                    if !seen_volids.insert(content.volid.clone()) {
                        continue;
                    }
                    // Templates and ISOs are not backups
                    if content.content == "vztmpl" || content.content == "iso" {
                        continue;
                    }

                    let backup_type = if content.volid.contains("/vm/")
                        || content.volid.contains("qemu")
                        || content.format.contains("pbs-vm")
                    {
                        "qemu"
                    } else if content.volid.contains("/ct/")
                        || content.volid.contains("lxc")
                        || content.format.contains("pbs-ct")
                    {
                        "lxc"
                    } else {
                        "unknown"
                    };

                    let is_pbs =
                        storage.storage.starts_with("pbs-") || storage.kind == "pbs";
                    // Shared storage is not tied to the node we queried from
                    let backup_node = if is_pbs || storage.shared == 1 {
                        storage.storage.clone()
                    } else {
                        node.node.clone()
                    };

                    let mut verified = content.verified > 0;
                    let mut verification = String::new();
                    if is_pbs {
                        if let Some(serde_json::Value::Object(map)) = &content.verification {
                            if let Some(state) = map.get("state").and_then(|v| v.as_str()) {
                                verified = state == "ok";
                                verification = state.to_string();
                            }
                        }
                    }

                    all_backups.push(StorageBackup {
                        id: format!("{}-{}", instance, content.volid),
                        storage: storage.storage.clone(),
                        node: backup_node,
                        kind: backup_type.to_string(),
                        vmid: content.vmid,
                        time: timestamp(content.ctime),
                        size: content.size,
                        format: content.format.clone(),
                        notes: content.notes.clone(),
                        protected: content.protected > 0,
                        volid: content.volid.clone(),
                        is_pbs,
                        verified,
                        verification,
                    });
                }
            }
        }

        debug!(instance, count = all_backups.len(), "storage backups polled");
        self.state
            .update_pve_backups_for_instance(instance, all_backups);
    }

    async fn poll_guest_snapshots(&self, instance: &str, client: &dyn PveApi) {
        let snapshot_state = self.state.snapshot();

        let mut all_snapshots = Vec::new();

        for vm in snapshot_state.vms.iter().filter(|v| v.instance == instance) {
            if vm.template {
                continue;
            }
            let snapshots = match client.get_vm_snapshots(&vm.node, vm.vmid).await {
                Ok(snapshots) => snapshots,
                Err(e) => {
                    debug!(instance, node = %vm.node, vmid = vm.vmid, error = %e,
                        "failed to get VM snapshots");
                    continue;
                }
            };
            for snap in snapshots {
                all_snapshots.push(GuestSnapshot {
                    id: format!("{}-{}-{}-{}", instance, vm.node, vm.vmid, snap.name),
                    name: snap.name.clone(),
                    node: vm.node.clone(),
                    kind: "qemu".to_string(),
                    vmid: vm.vmid,
                    time: timestamp(snap.snap_time),
                    description: snap.description.clone(),
                    parent: snap.parent.clone(),
                    vm_state: true,
                });
            }
        }

        for ct in snapshot_state
            .containers
            .iter()
            .filter(|c| c.instance == instance)
        {
            if ct.template {
                continue;
            }
            let snapshots = match client.get_container_snapshots(&ct.node, ct.vmid).await {
                Ok(snapshots) => snapshots,
                Err(e) => {
                    // Status 596 means the container has no snapshot support
                    let text = e.to_string();
                    if !text.contains("596") && !text.contains("not available") {
                        debug!(instance, node = %ct.node, vmid = ct.vmid, error = %e,
                            "failed to get container snapshots");
                    }
                    continue;
                }
            };
            for snap in snapshots {
                all_snapshots.push(GuestSnapshot {
                    id: format!("{}-{}-{}-{}", instance, ct.node, ct.vmid, snap.name),
                    name: snap.name.clone(),
                    node: ct.node.clone(),
                    kind: "lxc".to_string(),
                    vmid: ct.vmid,
                    time: timestamp(snap.snap_time),
                    description: snap.description.clone(),
                    parent: snap.parent.clone(),
                    vm_state: false,
                });
            }
        }

        debug!(instance, count = all_snapshots.len(), "guest snapshots polled");
        self.state
            .update_guest_snapshots_for_instance(instance, all_snapshots);
    }

    // -- PBS ---------------------------------------------------------------

    async fn poll_pbs_instance(&self, inst: &PbsInstance, client: Arc<pbs::Client>) {
        debug!(instance = %inst.name, "polling PBS instance");
        let health_key = format!("pbs-{}", inst.name);

        let mut status = PbsInstanceStatus {
            id: format!("pbs-{}", inst.name),
            name: inst.name.clone(),
            host: inst.host.clone(),
            status: "offline".to_string(),
            version: "unknown".to_string(),
            connection_health: "unhealthy".to_string(),
            cpu: 0.0,
            memory_usage: 0.0,
            memory_used: 0,
            memory_total: 0,
            uptime: 0,
            datastores: Vec::new(),
            last_seen: Utc::now(),
        };

        match client.get_version().await {
            Ok(version) => {
                status.status = "online".to_string();
                status.version = version.version;
                status.connection_health = "healthy".to_string();
                self.reset_auth_failures(&inst.name, "pbs");
                self.state.set_connection_health(&health_key, true);
            }
            Err(version_err) => {
                // A read-only token may lack version access; datastore
                // visibility still proves the server is alive.
                match client.get_datastores().await {
                    Ok(_) => {
                        status.status = "online".to_string();
                        status.version = "connected".to_string();
                        status.connection_health = "healthy".to_string();
                        self.reset_auth_failures(&inst.name, "pbs");
                        self.state.set_connection_health(&health_key, true);
                    }
                    Err(datastore_err) => {
                        status.connection_health = "error".to_string();
                        error!(instance = %inst.name, error = %version_err,
                            "failed to connect to PBS");
                        self.state.set_connection_health(&health_key, false);
                        if version_err.is_auth() || datastore_err.is_auth() {
                            self.record_auth_failure(&inst.name, "pbs");
                            return;
                        }
                    }
                }
            }
        }

        // Needs Sys.Audit, which read-only tokens often lack
        match client.get_node_status().await {
            Ok(node_status) => {
                status.cpu = safe_fraction(node_status.cpu);
                if node_status.memory.total > 0 {
                    status.memory_usage = safe_percentage(
                        node_status.memory.used as f64,
                        node_status.memory.total as f64,
                    );
                    status.memory_used = node_status.memory.used;
                    status.memory_total = node_status.memory.total;
                }
                status.uptime = node_status.uptime;
            }
            Err(e) => {
                debug!(instance = %inst.name, error = %e,
                    "could not get PBS node status (may need Sys.Audit)");
            }
        }

        if inst.monitor_datastores && status.status == "online" {
            match client.get_datastores().await {
                Ok(datastores) => {
                    for ds in datastores {
                        let mut model = PbsDatastore {
                            name: ds.store.clone(),
                            total: ds.total,
                            used: ds.used,
                            free: ds.avail,
                            usage: safe_percentage(ds.used as f64, ds.total as f64),
                            status: "available".to_string(),
                            namespaces: Vec::new(),
                        };

                        match client.list_namespaces(&ds.store).await {
                            Ok(namespaces) => {
                                for ns in &namespaces {
                                    let path = ns.effective_path().to_string();
                                    model.namespaces.push(PbsNamespace {
                                        depth: path.matches('/').count(),
                                        parent: ns.parent.clone(),
                                        path,
                                    });
                                }
                            }
                            Err(e) => {
                                warn!(instance = %inst.name, datastore = %ds.store, error = %e,
                                    "failed to list namespaces");
                            }
                        }

                        // The root namespace is implicit and always scanned
                        if !model.namespaces.iter().any(|ns| ns.path.is_empty()) {
                            model.namespaces.insert(
                                0,
                                PbsNamespace {
                                    path: String::new(),
                                    parent: String::new(),
                                    depth: 0,
                                },
                            );
                        }

                        status.datastores.push(model);
                    }
                }
                Err(e) => {
                    error!(instance = %inst.name, error = %e, "failed to get datastores");
                }
            }
        }

        let datastores = status.datastores.clone();
        self.state.update_pbs_instance(status);

        if inst.monitor_backups && !datastores.is_empty() {
            self.poll_pbs_backups(&inst.name, &client, &datastores).await;
        }
    }

    async fn poll_pbs_backups(
        &self,
        instance: &str,
        client: &Arc<pbs::Client>,
        datastores: &[PbsDatastore],
    ) {
        let mut all_backups = Vec::new();

        for ds in datastores {
            let namespaces: Vec<String> =
                ds.namespaces.iter().map(|ns| ns.path.clone()).collect();

            let backups_by_namespace = client.list_all_backups(&ds.name, &namespaces).await;

            for (namespace, snapshots) in backups_by_namespace {
                for snapshot in snapshots {
                    all_backups.push(PbsBackup {
                        id: format!(
                            "pbs-{}-{}-{}-{}-{}-{}",
                            instance,
                            ds.name,
                            namespace,
                            snapshot.backup_type,
                            snapshot.backup_id,
                            snapshot.backup_time
                        ),
                        instance: instance.to_string(),
                        datastore: ds.name.clone(),
                        namespace: namespace.clone(),
                        backup_type: snapshot.backup_type.clone(),
                        vmid: snapshot.backup_id.clone(),
                        backup_time: timestamp(snapshot.backup_time),
                        size: snapshot.size,
                        protected: snapshot.protected,
                        verified: snapshot.is_verified(),
                        comment: snapshot.comment.clone(),
                        files: snapshot.file_names(),
                    });
                }
            }
        }

        info!(instance, count = all_backups.len(), "PBS backups fetched");
        self.state.update_pbs_backups(instance, all_backups);
    }

    // -- auth lockout ------------------------------------------------------

    fn record_auth_failure(&self, instance: &str, kind: &str) {
        let key = format!("{kind}-{instance}");
        let count = {
            let mut failures = self.auth_failures.lock().expect("auth lock poisoned");
            let count = failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        warn!(instance, kind, failures = count, "authentication failure recorded");

        if count >= MAX_AUTH_FAILURES {
            error!(
                instance,
                kind,
                failures = count,
                "maximum authentication failures reached, locking instance out"
            );
            match kind {
                "pve" => self.lockout_pve_instance(instance),
                "pbs" => self.lockout_pbs_instance(instance),
                _ => {}
            }
            self.auth_failures
                .lock()
                .expect("auth lock poisoned")
                .remove(&key);
        }
    }

    fn reset_auth_failures(&self, instance: &str, kind: &str) {
        let key = format!("{kind}-{instance}");
        let mut failures = self.auth_failures.lock().expect("auth lock poisoned");
        if failures.remove(&key).is_some() {
            info!(instance, kind, "authentication succeeded, failure count reset");
        }
    }

    /// Replace the instance's state with one synthetic offline node and
    /// clear everything else, so stale data never masquerades as live.
    fn lockout_pve_instance(&self, instance: &str) {
        let host = self
            .config
            .pve_instances
            .iter()
            .find(|i| i.name == instance)
            .map(|i| i.host.clone())
            .unwrap_or_default();

        let failed_node = Node {
            id: format!("{instance}-failed"),
            name: instance.to_string(),
            instance: instance.to_string(),
            host,
            status: "offline".to_string(),
            kind: "node".to_string(),
            cpu: 0.0,
            memory: Memory::default(),
            disk: Disk::default(),
            uptime: 0,
            load_average: Vec::new(),
            kernel_version: String::new(),
            pve_version: String::new(),
            cpu_info: CpuInfo::default(),
            last_seen: Utc::now(),
            connection_health: ConnectionHealth::Error,
        };

        self.state
            .update_nodes_for_instance(instance, vec![failed_node]);
        self.state.update_vms_for_instance(instance, Vec::new());
        self.state
            .update_containers_for_instance(instance, Vec::new());
        self.state.update_storage_for_instance(instance, Vec::new());
        self.state
            .update_backup_tasks_for_instance(instance, Vec::new());
        self.state
            .update_pve_backups_for_instance(instance, Vec::new());
        self.state
            .update_guest_snapshots_for_instance(instance, Vec::new());
        self.state.set_connection_health(instance, false);
    }

    fn lockout_pbs_instance(&self, instance: &str) {
        self.state.remove_pbs_instance(instance);
        self.state.update_pbs_backups(instance, Vec::new());
        self.state
            .set_connection_health(&format!("pbs-{instance}"), false);
    }

    fn is_demoted_cluster(&self, instance: &str) -> bool {
        self.demoted_clusters
            .lock()
            .expect("demoted lock poisoned")
            .contains(instance)
    }

    fn demote_cluster(&self, instance: &str) {
        self.demoted_clusters
            .lock()
            .expect("demoted lock poisoned")
            .insert(instance.to_string());
    }
}

fn split_tags(tags: &str) -> Vec<String> {
    if tags.is_empty() {
        Vec::new()
    } else {
        tags.split(';').map(str::to_string).collect()
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tags_handles_empty_and_lists() {
        assert!(split_tags("").is_empty());
        assert_eq!(split_tags("prod"), vec!["prod".to_string()]);
        assert_eq!(
            split_tags("prod;web;critical"),
            vec!["prod".to_string(), "web".to_string(), "critical".to_string()]
        );
    }

    #[test]
    fn cycle_budget_has_floor() {
        let interval = Duration::from_secs(10);
        let budget = interval.saturating_sub(CYCLE_HEADROOM).max(MIN_CYCLE_BUDGET);
        assert_eq!(budget, Duration::from_millis(9800));

        let short = Duration::from_secs(2);
        let budget = short.saturating_sub(CYCLE_HEADROOM).max(MIN_CYCLE_BUDGET);
        assert_eq!(budget, MIN_CYCLE_BUDGET);
    }

    #[test]
    fn worker_pool_size_is_clamped() {
        assert_eq!(0usize.clamp(2, 10), 2);
        assert_eq!(1usize.clamp(2, 10), 2);
        assert_eq!(5usize.clamp(2, 10), 5);
        assert_eq!(40usize.clamp(2, 10), 10);
    }
}

#[cfg(test)]
mod poll_tests {
    use super::*;
    use crate::error::MonitorError;
    use async_trait::async_trait;

    /// Canned PVE API for driving the poll paths without a server
    #[derive(Default)]
    struct MockPve {
        nodes: Vec<proxmox::Node>,
        fail_get_nodes_with_status: Option<u16>,
        node_storages: HashMap<String, Vec<proxmox::Storage>>,
        cluster_storages: Vec<proxmox::Storage>,
        resources: Vec<proxmox::ClusterResource>,
        vms: HashMap<String, Vec<proxmox::Vm>>,
        vm_status: HashMap<(String, u32), proxmox::VmStatus>,
    }

    #[async_trait]
    impl PveApi for MockPve {
        async fn get_nodes(&self) -> Result<Vec<proxmox::Node>> {
            if let Some(status) = self.fail_get_nodes_with_status {
                return Err(MonitorError::api("get_nodes", "mock", status, "denied"));
            }
            Ok(self.nodes.clone())
        }

        async fn get_node_status(&self, _node: &str) -> Result<proxmox::NodeStatus> {
            Ok(proxmox::NodeStatus::default())
        }

        async fn get_vms(&self, node: &str) -> Result<Vec<proxmox::Vm>> {
            Ok(self.vms.get(node).cloned().unwrap_or_default())
        }

        async fn get_containers(&self, _node: &str) -> Result<Vec<proxmox::Container>> {
            Ok(Vec::new())
        }

        async fn get_storage(&self, node: &str) -> Result<Vec<proxmox::Storage>> {
            Ok(self.node_storages.get(node).cloned().unwrap_or_default())
        }

        async fn get_all_storage(&self) -> Result<Vec<proxmox::Storage>> {
            Ok(self.cluster_storages.clone())
        }

        async fn get_storage_content(
            &self,
            _node: &str,
            _storage: &str,
        ) -> Result<Vec<proxmox::StorageContent>> {
            Ok(Vec::new())
        }

        async fn get_backup_tasks(&self) -> Result<Vec<proxmox::Task>> {
            Ok(Vec::new())
        }

        async fn get_vm_snapshots(&self, _node: &str, _vmid: u32) -> Result<Vec<proxmox::Snapshot>> {
            Ok(Vec::new())
        }

        async fn get_container_snapshots(
            &self,
            _node: &str,
            _vmid: u32,
        ) -> Result<Vec<proxmox::Snapshot>> {
            Ok(Vec::new())
        }

        async fn get_vm_status(&self, node: &str, vmid: u32) -> Result<proxmox::VmStatus> {
            self.vm_status
                .get(&(node.to_string(), vmid))
                .cloned()
                .ok_or_else(|| MonitorError::internal("get_vm_status", "mock", "no status"))
        }

        async fn get_container_status(&self, _node: &str, _vmid: u32) -> Result<proxmox::Container> {
            Err(MonitorError::internal("get_container_status", "mock", "unused"))
        }

        async fn get_cluster_resources(
            &self,
            _resource_type: &str,
        ) -> Result<Vec<proxmox::ClusterResource>> {
            Ok(self.resources.clone())
        }

        async fn is_cluster_member(&self) -> Result<bool> {
            Ok(true)
        }
    }

    async fn test_monitor(dir: &std::path::Path) -> Arc<Monitor> {
        let config = Config {
            data_path: dir.to_path_buf(),
            ..Default::default()
        };
        Monitor::new(config, Arc::new(Hub::default())).await.unwrap()
    }

    fn online_node(name: &str) -> proxmox::Node {
        proxmox::Node {
            node: name.to_string(),
            status: "online".to_string(),
            maxcpu: 8,
            mem: 8 << 30,
            maxmem: 32 << 30,
            ..Default::default()
        }
    }

    fn storage(name: &str, shared: u8) -> proxmox::Storage {
        proxmox::Storage {
            storage: name.to_string(),
            kind: if shared == 1 { "rbd" } else { "dir" }.to_string(),
            content: "images,backup".to_string(),
            active: 1,
            enabled: 1,
            shared,
            total: 1 << 40,
            used: 1 << 39,
            available: 1 << 39,
        }
    }

    #[tokio::test]
    async fn shared_storage_is_emitted_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = test_monitor(dir.path()).await;

        let nodes = vec![online_node("n1"), online_node("n2"), online_node("n3")];
        let mut mock = MockPve {
            nodes: nodes.clone(),
            cluster_storages: vec![storage("ceph-rbd", 1), storage("local", 0)],
            ..Default::default()
        };
        for node in &nodes {
            mock.node_storages.insert(
                node.node.clone(),
                vec![storage("ceph-rbd", 1), storage("local", 0)],
            );
        }

        monitor
            .poll_storage_with_nodes("lab", &mock, &nodes)
            .await;

        let snapshot = monitor.snapshot();
        let shared: Vec<_> = snapshot
            .storage
            .iter()
            .filter(|s| s.id == "shared-ceph-rbd")
            .collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].node, "shared");
        assert!(shared[0].shared);

        // Per-node storage still appears once per node
        let locals: Vec<_> = snapshot
            .storage
            .iter()
            .filter(|s| s.name == "local")
            .collect();
        assert_eq!(locals.len(), 3);
        assert_eq!(snapshot.storage.len(), 4);
    }

    #[tokio::test]
    async fn five_auth_failures_lock_the_instance_out() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = test_monitor(dir.path()).await;

        // Seed state that must be wiped by the lockout
        monitor.state.update_vms_for_instance(
            "badtoken",
            vec![Vm {
                id: "badtoken-n1-100".to_string(),
                vmid: 100,
                name: "web".to_string(),
                node: "n1".to_string(),
                instance: "badtoken".to_string(),
                status: "running".to_string(),
                kind: "qemu".to_string(),
                cpu: 0.5,
                cpus: 2,
                memory: Memory::default(),
                disk: Disk::default(),
                network_in: 0,
                network_out: 0,
                disk_read: 0,
                disk_write: 0,
                uptime: 100,
                template: false,
                tags: vec![],
                lock: String::new(),
                last_seen: Utc::now(),
            }],
        );

        let client: Arc<dyn PveApi> = Arc::new(MockPve {
            fail_get_nodes_with_status: Some(401),
            ..Default::default()
        });
        let inst = PveInstance {
            name: "badtoken".to_string(),
            host: "https://badtoken:8006".to_string(),
            ..Default::default()
        };

        for cycle in 1..=5 {
            monitor
                .poll_pve_instance(&inst, Arc::clone(&client), cycle)
                .await;
        }

        let snapshot = monitor.snapshot();
        let nodes: Vec<_> = snapshot
            .nodes
            .iter()
            .filter(|n| n.instance == "badtoken")
            .collect();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, "offline");
        assert_eq!(nodes[0].connection_health, ConnectionHealth::Error);
        assert!(snapshot.vms.iter().all(|v| v.instance != "badtoken"));
        assert_eq!(snapshot.connection_health.get("badtoken"), Some(&false));
    }

    #[tokio::test]
    async fn successful_poll_resets_auth_failure_streak() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = test_monitor(dir.path()).await;

        let failing: Arc<dyn PveApi> = Arc::new(MockPve {
            fail_get_nodes_with_status: Some(401),
            ..Default::default()
        });
        let healthy: Arc<dyn PveApi> = Arc::new(MockPve {
            nodes: vec![online_node("n1")],
            ..Default::default()
        });
        let inst = PveInstance {
            name: "flaky".to_string(),
            host: "https://flaky:8006".to_string(),
            monitor_vms: false,
            monitor_containers: false,
            monitor_storage: false,
            monitor_backups: false,
            ..Default::default()
        };

        for cycle in 1..=4 {
            monitor
                .poll_pve_instance(&inst, Arc::clone(&failing), cycle)
                .await;
        }
        // One success clears the streak
        monitor
            .poll_pve_instance(&inst, Arc::clone(&healthy), 5)
            .await;
        for cycle in 6..=9 {
            monitor
                .poll_pve_instance(&inst, Arc::clone(&failing), cycle)
                .await;
        }

        // Nine failures total but never five consecutive: no lockout node
        let snapshot = monitor.snapshot();
        assert!(!snapshot.nodes.iter().any(|n| n.id == "flaky-failed"));
    }

    #[tokio::test]
    async fn efficient_path_normalizes_guests() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = test_monitor(dir.path()).await;

        let resource = |vmid: u32, kind: &str, status: &str| proxmox::ClusterResource {
            kind: kind.to_string(),
            node: "n1".to_string(),
            status: status.to_string(),
            name: format!("guest{vmid}"),
            vmid,
            cpu: 0.4,
            maxcpu: 4,
            mem: 2 << 30,
            maxmem: 8 << 30,
            tags: "prod;web".to_string(),
            ..Default::default()
        };

        let mut template = resource(102, "qemu", "running");
        template.template = 1;

        let mock = MockPve {
            resources: vec![
                resource(100, "qemu", "running"),
                resource(101, "qemu", "stopped"),
                template,
                resource(200, "lxc", "running"),
            ],
            ..Default::default()
        };

        assert!(monitor.poll_guests_efficient("lab", &mock).await);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.vms.len(), 2, "template must be filtered out");
        assert_eq!(snapshot.containers.len(), 1);

        let running = snapshot.vms.iter().find(|v| v.vmid == 100).unwrap();
        assert_eq!(running.cpu, 0.4);
        assert!(running.memory.used > 0);
        assert_eq!(running.tags, vec!["prod".to_string(), "web".to_string()]);

        // Stopped guests report zero CPU and zero used memory
        let stopped = snapshot.vms.iter().find(|v| v.vmid == 101).unwrap();
        assert_eq!(stopped.cpu, 0.0);
        assert_eq!(stopped.memory.used, 0);
    }

    #[tokio::test]
    async fn vm_memory_is_balloon_aware() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = test_monitor(dir.path()).await;

        let node = online_node("n1");
        let mut mock = MockPve {
            nodes: vec![node.clone()],
            ..Default::default()
        };
        mock.vms.insert(
            "n1".to_string(),
            vec![proxmox::Vm {
                vmid: 100,
                name: "balloony".to_string(),
                status: "running".to_string(),
                cpu: 0.2,
                cpus: 4,
                mem: 6 << 30,
                maxmem: 16 << 30,
                ..Default::default()
            }],
        );
        mock.vm_status.insert(
            ("n1".to_string(), 100),
            proxmox::VmStatus {
                status: "running".to_string(),
                maxmem: 16 << 30,
                balloon: 8 << 30,
                free_mem: 2 << 30,
                ..Default::default()
            },
        );

        monitor
            .poll_vms_with_nodes("lab", &mock, &[node])
            .await;

        let snapshot = monitor.snapshot();
        let vm = snapshot.vms.iter().find(|v| v.vmid == 100).unwrap();
        // Balloon caps the effective total; the guest agent's free memory
        // yields the used figure
        assert_eq!(vm.memory.total, 8 << 30);
        assert_eq!(vm.memory.used, 6 << 30);
    }
}
