//! Sentinel client: topology discovery, change notification and introspection
//!
//! The client keeps one connection per configured Sentinel, keyed by
//! endpoint. Queries walk the endpoints in configured order and the first
//! successful answer wins. A background monitor task polls the topology and
//! invokes the registered callbacks when the primary or the replica set
//! changes.
pub mod monitor;
pub mod protocol;

use fnv::FnvHashMap;
use futures::future::{join_all, BoxFuture};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::core::connection::{ConnectOptions, RespConnection};
use crate::core::{Endpoint, NodeInfo, TopologySnapshot};
use crate::error::{HaError, HaResult};
use crate::health::redis::PingHealthChecker;
use crate::health::HealthCheckManager;
use monitor::MonitorTask;

/// Invoked with the new primary after a switch
pub type PrimarySwitchCallback = Arc<dyn Fn(NodeInfo) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with the full new replica list after it changed
pub type ReplicaChangeCallback =
    Arc<dyn Fn(Vec<NodeInfo>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything the client needs, passed in explicitly at construction
#[derive(Debug, Clone)]
pub struct SentinelOptions {
    pub master_name: String,
    /// Sentinel endpoints in query order
    pub sentinels: Vec<Endpoint>,
    /// Dial/query timeouts and the optional Sentinel password
    pub connect: ConnectOptions,
    pub monitor_interval: Duration,
    pub monitor_jitter: Duration,
}

impl SentinelOptions {
    pub fn new<S: Into<String>>(master_name: S, sentinels: Vec<Endpoint>) -> Self {
        Self {
            master_name: master_name.into(),
            sentinels,
            connect: ConnectOptions {
                command_timeout: Duration::from_millis(2000),
                ..Default::default()
            },
            monitor_interval: Duration::from_millis(1000),
            monitor_jitter: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    on_primary_switch: Option<PrimarySwitchCallback>,
    on_replica_change: Option<ReplicaChangeCallback>,
}

type QueryFn<T> = for<'a> fn(&'a mut RespConnection, &'a str) -> BoxFuture<'a, HaResult<T>>;

pub struct SentinelClient {
    options: SentinelOptions,
    connections: tokio::sync::Mutex<FnvHashMap<Endpoint, RespConnection>>,
    topology: RwLock<TopologySnapshot>,
    callbacks: Mutex<Callbacks>,
    monitor: Mutex<Option<MonitorTask>>,
    health: HealthCheckManager,
}

impl SentinelClient {
    /// Dial every configured Sentinel.
    ///
    /// Never fails: with zero reachable Sentinels the client is still built
    /// and later queries report [`HaError::NoSentinelAvailable`].
    pub async fn connect(options: SentinelOptions) -> Arc<Self> {
        let connections = dial_all(&options.sentinels, &options.connect).await;
        if connections.is_empty() {
            error!(
                master = %options.master_name,
                "No Sentinel reachable out of {} configured",
                options.sentinels.len()
            );
        } else {
            info!(
                master = %options.master_name,
                "Connected to {}/{} Sentinels",
                connections.len(),
                options.sentinels.len()
            );
        }

        let health = HealthCheckManager::new(Box::new(PingHealthChecker::with_timeout(
            options.connect.command_timeout,
        )));

        Arc::new(Self {
            options,
            connections: tokio::sync::Mutex::new(connections),
            topology: RwLock::new(TopologySnapshot::default()),
            callbacks: Mutex::new(Callbacks::default()),
            monitor: Mutex::new(None),
            health,
        })
    }

    pub fn master_name(&self) -> &str {
        &self.options.master_name
    }

    pub fn options(&self) -> &SentinelOptions {
        &self.options
    }

    /// Ask the Sentinels for the current primary and cache the answer
    pub async fn query_primary(&self) -> HaResult<NodeInfo> {
        let node = self.query_any("primary", protocol::fetch_primary).await?;
        self.topology.write().await.primary = Some(node.clone());
        Ok(node)
    }

    /// Ask the Sentinels for the replica list and replace the cached one
    pub async fn query_replicas(&self) -> HaResult<Vec<NodeInfo>> {
        let replicas = self.query_any("replicas", protocol::fetch_replicas).await?;
        self.topology.write().await.replicas = replicas.clone();
        Ok(replicas)
    }

    async fn query_any<T>(&self, what: &str, fetch: QueryFn<T>) -> HaResult<T> {
        let mut connections = self.connections.lock().await;
        let mut attempted = 0usize;

        for endpoint in &self.options.sentinels {
            let Some(conn) = connections.get_mut(endpoint) else {
                continue;
            };
            if conn.is_broken() {
                continue;
            }
            attempted += 1;

            match fetch(conn, &self.options.master_name).await {
                Ok(value) => {
                    debug!(endpoint = %endpoint, "Sentinel answered {} query", what);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, "Sentinel {} query failed: {}", what, e);
                }
            }
        }

        if attempted == 0 {
            error!(master = %self.options.master_name, "No Sentinel available for {} query", what);
        } else {
            warn!(
                master = %self.options.master_name,
                "All {} reachable Sentinels failed the {} query", attempted, what
            );
        }
        Err(HaError::NoSentinelAvailable)
    }

    /// Copy of the cached topology
    pub async fn topology(&self) -> TopologySnapshot {
        self.topology.read().await.clone()
    }

    pub async fn current_primary(&self) -> Option<NodeInfo> {
        self.topology.read().await.primary.clone()
    }

    /// Install the change callbacks, replacing any earlier registration
    pub fn register_callbacks(
        &self,
        on_primary_switch: Option<PrimarySwitchCallback>,
        on_replica_change: Option<ReplicaChangeCallback>,
    ) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        callbacks.on_primary_switch = on_primary_switch;
        callbacks.on_replica_change = on_replica_change;
    }

    fn callbacks(&self) -> (Option<PrimarySwitchCallback>, Option<ReplicaChangeCallback>) {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        (
            callbacks.on_primary_switch.clone(),
            callbacks.on_replica_change.clone(),
        )
    }

    /// Launch the monitor task.
    ///
    /// Returns true if the task is running afterwards, including when it was
    /// already running. Returns false when no Sentinel is connected.
    pub async fn start_monitoring(self: &Arc<Self>) -> bool {
        if self.is_monitoring() {
            debug!(master = %self.options.master_name, "Monitoring already running");
            return true;
        }
        if self.connected_count().await == 0 {
            error!(master = %self.options.master_name, "Cannot start monitoring: no Sentinel connected");
            return false;
        }

        let seed = self.topology().await;
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(MonitorTask::is_running) {
            return true;
        }
        *slot = Some(MonitorTask::spawn(self, seed));
        info!(
            master = %self.options.master_name,
            interval_ms = self.options.monitor_interval.as_millis() as u64,
            "Topology monitoring started"
        );
        true
    }

    /// Stop the monitor task and wait for it to exit. No-op when not running.
    pub async fn stop_monitoring(&self) {
        let task = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
            info!(master = %self.options.master_name, "Topology monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(MonitorTask::is_running)
    }

    /// PING every connected Sentinel.
    ///
    /// Returns whether all answered and the endpoints that did not. With no
    /// connection at all the result is `(false, [])`. The connection set is
    /// left as is.
    pub async fn check_health(&self) -> (bool, Vec<Endpoint>) {
        let mut connections = self.connections.lock().await;
        if connections.is_empty() {
            warn!(master = %self.options.master_name, "Health check: no Sentinel connected");
            return (false, Vec::new());
        }

        let mut unhealthy = Vec::new();
        for endpoint in &self.options.sentinels {
            if let Some(conn) = connections.get_mut(endpoint) {
                let status = self.health.check_connection(conn).await;
                if !status.is_healthy() {
                    unhealthy.push(endpoint.clone());
                }
            }
        }
        (unhealthy.is_empty(), unhealthy)
    }

    /// Configured endpoints that currently have no usable connection
    pub async fn check_connectivity(&self) -> (bool, Vec<Endpoint>) {
        let connections = self.connections.lock().await;
        let missing: Vec<Endpoint> = self
            .options
            .sentinels
            .iter()
            .filter(|endpoint| connections.get(*endpoint).map_or(true, RespConnection::is_broken))
            .cloned()
            .collect();
        (missing.is_empty(), missing)
    }

    /// Number of configured Sentinels with a usable connection
    pub async fn connected_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|conn| !conn.is_broken())
            .count()
    }

    /// Drop every Sentinel connection and dial all endpoints again.
    ///
    /// Returns true iff at least one endpoint connected.
    pub async fn reconnect_all(&self) -> bool {
        let fresh = dial_all(&self.options.sentinels, &self.options.connect).await;
        let connected = fresh.len();
        *self.connections.lock().await = fresh;

        if connected == 0 {
            error!(master = %self.options.master_name, "Reconnect failed: no Sentinel reachable");
        } else {
            info!(
                master = %self.options.master_name,
                "Reconnected to {}/{} Sentinels",
                connected,
                self.options.sentinels.len()
            );
        }
        connected > 0
    }
}

impl Drop for SentinelClient {
    fn drop(&mut self) {
        let task = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel();
        }
    }
}

async fn dial_all(
    endpoints: &[Endpoint],
    options: &ConnectOptions,
) -> FnvHashMap<Endpoint, RespConnection> {
    let attempts = endpoints.iter().map(|endpoint| async move {
        match RespConnection::connect(endpoint, options).await {
            Ok(conn) => {
                debug!(endpoint = %endpoint, "Connected to Sentinel");
                Some((endpoint.clone(), conn))
            }
            Err(e) => {
                warn!(endpoint = %endpoint, "Failed to connect to Sentinel: {}", e);
                None
            }
        }
    });

    join_all(attempts).await.into_iter().flatten().collect()
}
