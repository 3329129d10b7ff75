//! Primary/replica connection pool driven by Sentinel topology
//!
//! The pool owns one connection to the primary for writes and a rotating
//! set of replica connections for reads. It follows the Sentinel client's
//! change callbacks and can be refreshed on demand.
use futures::future::join_all;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::core::connection::{ConnectOptions, Credentials, RespConnection};
use crate::core::{Endpoint, NodeInfo};
use crate::error::{HaError, HaResult};
use crate::health::redis::PingHealthChecker;
use crate::health::HealthCheckManager;
use crate::sentinel::{PrimarySwitchCallback, ReplicaChangeCallback, SentinelClient};

/// Settings for connections to store nodes
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub connect: ConnectOptions,
}

impl PoolOptions {
    pub fn new(credentials: Option<Credentials>, connect_timeout: Duration) -> Self {
        Self {
            connect: ConnectOptions {
                connect_timeout,
                credentials,
                ..Default::default()
            },
        }
    }
}

struct HandleInner {
    addr: Endpoint,
    broken: Arc<AtomicBool>,
    conn: Mutex<RespConnection>,
}

/// A pooled connection lent to a caller.
///
/// Cloning is cheap and clones refer to the same channel. Callers must not
/// keep a handle across operations: the pool may replace it at any time.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    fn new(conn: RespConnection) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                addr: conn.endpoint().clone(),
                broken: conn.broken_flag(),
                conn: Mutex::new(conn),
            }),
        }
    }

    /// Exclusive access for the duration of one operation
    pub async fn lock(&self) -> MutexGuard<'_, RespConnection> {
        self.inner.conn.lock().await
    }

    pub fn addr(&self) -> &Endpoint {
        &self.inner.addr
    }

    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same underlying channel
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("addr", &self.inner.addr)
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// What the replica rotation needs from a pooled connection
trait Pooled: Clone {
    fn is_broken(&self) -> bool;
}

impl Pooled for ConnectionHandle {
    fn is_broken(&self) -> bool {
        ConnectionHandle::is_broken(self)
    }
}

struct ReplicaSet<H = ConnectionHandle> {
    conns: Vec<H>,
    /// Round-robin cursor, guarded with the list it indexes
    next: usize,
}

impl<H> Default for ReplicaSet<H> {
    fn default() -> Self {
        Self {
            conns: Vec::new(),
            next: 0,
        }
    }
}

impl<H: Pooled> ReplicaSet<H> {
    /// Next connection in rotation that is not broken; broken ones are
    /// skipped but stay in the set until the next replace
    fn next_healthy(&mut self) -> Option<H> {
        let count = self.conns.len();
        for _ in 0..count {
            let idx = self.next % count;
            self.next = (idx + 1) % count;
            if !self.conns[idx].is_broken() {
                return Some(self.conns[idx].clone());
            }
        }
        None
    }

    fn replace(&mut self, conns: Vec<H>) {
        self.conns = conns;
        self.next = 0;
    }
}

pub struct ConnectionPool {
    sentinel: Arc<SentinelClient>,
    options: PoolOptions,
    primary: Mutex<Option<ConnectionHandle>>,
    replicas: Mutex<ReplicaSet>,
    health: HealthCheckManager,
}

impl ConnectionPool {
    pub fn new(sentinel: Arc<SentinelClient>, options: PoolOptions) -> Arc<Self> {
        let health = HealthCheckManager::new(Box::new(PingHealthChecker::with_timeout(
            options.connect.command_timeout,
        )));
        Arc::new(Self {
            sentinel,
            options,
            primary: Mutex::new(None),
            replicas: Mutex::new(ReplicaSet::default()),
            health,
        })
    }

    pub fn sentinel(&self) -> &Arc<SentinelClient> {
        &self.sentinel
    }

    /// Build the initial connections and subscribe to topology changes.
    ///
    /// Returns false if no primary connection could be established; replica
    /// failures are tolerated.
    pub async fn initialize(self: &Arc<Self>) -> bool {
        let primary_ok = match self.sentinel.query_primary().await {
            Ok(node) => self.replace_primary(&node).await,
            Err(e) => {
                error!(master = %self.sentinel.master_name(), "Cannot resolve primary: {}", e);
                false
            }
        };

        match self.sentinel.query_replicas().await {
            Ok(replicas) => self.replace_replicas(&replicas).await,
            Err(e) => {
                warn!(master = %self.sentinel.master_name(), "Cannot resolve replicas: {}", e);
            }
        }

        self.subscribe();

        if primary_ok {
            info!(
                master = %self.sentinel.master_name(),
                replicas = self.replica_count().await,
                "Connection pool initialized"
            );
        }
        primary_ok
    }

    fn subscribe(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let on_primary: PrimarySwitchCallback = Arc::new(move |node: NodeInfo| {
            let pool = pool.clone();
            async move {
                if let Some(pool) = pool.upgrade() {
                    pool.handle_primary_switch(node).await;
                }
            }
            .boxed()
        });

        let pool = Arc::downgrade(self);
        let on_replicas: ReplicaChangeCallback = Arc::new(move |replicas: Vec<NodeInfo>| {
            let pool = pool.clone();
            async move {
                if let Some(pool) = pool.upgrade() {
                    pool.handle_replica_change(replicas).await;
                }
            }
            .boxed()
        });

        self.sentinel
            .register_callbacks(Some(on_primary), Some(on_replicas));
    }

    /// Current primary connection, re-established first if absent or broken
    pub async fn get_write_connection(&self) -> HaResult<ConnectionHandle> {
        let mut slot = self.primary.lock().await;
        if let Some(handle) = slot.as_ref().filter(|h| !h.is_broken()) {
            return Ok(handle.clone());
        }

        let node = match self.sentinel.query_primary().await {
            Ok(node) => Some(node),
            Err(e) => {
                debug!("Primary query failed, using cached topology: {}", e);
                self.sentinel.current_primary().await
            }
        };
        let Some(node) = node else {
            *slot = None;
            return Err(HaError::NoPrimaryAvailable);
        };

        match RespConnection::connect(&node.addr, &self.options.connect).await {
            Ok(conn) => {
                info!(endpoint = %node.addr, "Primary connection re-established");
                let handle = ConnectionHandle::new(conn);
                *slot = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!(endpoint = %node.addr, "Failed to connect to primary: {}", e);
                *slot = None;
                Err(HaError::NoPrimaryAvailable)
            }
        }
    }

    /// Next healthy replica in round-robin order, or the primary when
    /// `prefer_replica` is false or no replica is usable
    pub async fn get_read_connection(&self, prefer_replica: bool) -> HaResult<ConnectionHandle> {
        if prefer_replica {
            let mut set = self.replicas.lock().await;
            if let Some(handle) = set.next_healthy() {
                return Ok(handle);
            }
            if !set.conns.is_empty() {
                debug!("No healthy replica connection, reading from primary");
            }
        }
        self.get_write_connection().await
    }

    /// Recreate every connection from the latest topology.
    ///
    /// Falls back to the cached topology when the Sentinels cannot be
    /// queried. Returns whether the primary connection succeeded.
    pub async fn refresh_connections(&self) -> bool {
        info!(master = %self.sentinel.master_name(), "Refreshing pool connections");

        let primary = match self.sentinel.query_primary().await {
            Ok(node) => Some(node),
            Err(e) => {
                warn!("Primary query failed during refresh, using cached topology: {}", e);
                self.sentinel.current_primary().await
            }
        };
        let primary_ok = match primary {
            Some(node) => self.replace_primary(&node).await,
            None => {
                *self.primary.lock().await = None;
                false
            }
        };

        let replicas = match self.sentinel.query_replicas().await {
            Ok(replicas) => replicas,
            Err(e) => {
                warn!("Replica query failed during refresh, using cached topology: {}", e);
                self.sentinel.topology().await.replicas
            }
        };
        self.replace_replicas(&replicas).await;

        primary_ok
    }

    /// PING every pooled connection and count the healthy ones.
    ///
    /// Unhealthy connections are left in place; call
    /// [`refresh_connections`](Self::refresh_connections) to replace them.
    pub async fn check_connections_health(&self) -> usize {
        let mut handles: Vec<ConnectionHandle> = Vec::new();
        if let Some(primary) = self.primary.lock().await.clone() {
            handles.push(primary);
        }
        handles.extend(self.replicas.lock().await.conns.iter().cloned());

        let mut healthy = 0;
        for handle in &handles {
            let mut conn = handle.lock().await;
            if self.health.check_connection(&mut conn).await.is_healthy() {
                healthy += 1;
            }
        }
        debug!("{}/{} pooled connections healthy", healthy, handles.len());
        healthy
    }

    /// React to a primary switch reported by the monitor
    pub async fn handle_primary_switch(&self, primary: NodeInfo) {
        info!(endpoint = %primary.addr, "Switching write connection to new primary");
        self.replace_primary(&primary).await;
    }

    /// React to a replica set change reported by the monitor
    pub async fn handle_replica_change(&self, replicas: Vec<NodeInfo>) {
        info!(count = replicas.len(), "Rebuilding replica connections");
        self.replace_replicas(&replicas).await;
    }

    async fn replace_primary(&self, node: &NodeInfo) -> bool {
        let mut slot = self.primary.lock().await;
        match RespConnection::connect(&node.addr, &self.options.connect).await {
            Ok(conn) => {
                debug!(endpoint = %node.addr, "Primary connection established");
                *slot = Some(ConnectionHandle::new(conn));
                true
            }
            Err(e) => {
                warn!(endpoint = %node.addr, "Failed to connect to primary: {}", e);
                *slot = None;
                false
            }
        }
    }

    async fn replace_replicas(&self, replicas: &[NodeInfo]) {
        let options = &self.options.connect;
        let attempts = replicas.iter().filter(|r| r.alive).map(|replica| async move {
            match RespConnection::connect(&replica.addr, options).await {
                Ok(conn) => Some(ConnectionHandle::new(conn)),
                Err(e) => {
                    warn!(endpoint = %replica.addr, "Failed to connect to replica: {}", e);
                    None
                }
            }
        });
        let conns: Vec<ConnectionHandle> = join_all(attempts).await.into_iter().flatten().collect();

        let mut set = self.replicas.lock().await;
        debug!(
            "Replica connections: {} of {} reported replicas",
            conns.len(),
            replicas.len()
        );
        set.replace(conns);
    }

    /// Address of the current primary connection, if any
    pub async fn primary_addr(&self) -> Option<Endpoint> {
        self.primary
            .lock()
            .await
            .as_ref()
            .map(|h| h.addr().clone())
    }

    pub async fn replica_addrs(&self) -> Vec<Endpoint> {
        self.replicas
            .lock()
            .await
            .conns
            .iter()
            .map(|h| h.addr().clone())
            .collect()
    }

    pub async fn replica_count(&self) -> usize {
        self.replicas.lock().await.conns.len()
    }
}
