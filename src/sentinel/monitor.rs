//! Background topology polling
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::SentinelClient;
use crate::core::{NodeInfo, TopologySnapshot};
use crate::utils::jittered;

/// Handle to a running monitor loop
pub(crate) struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorTask {
    /// Spawn the loop. `seed` is the topology the first tick compares against.
    pub(crate) fn spawn(client: &Arc<SentinelClient>, seed: TopologySnapshot) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::downgrade(client), seed, cancel.clone()));
        Self { cancel, handle }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait until the loop has exited
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Monitor task ended abnormally: {}", e);
        }
    }
}

async fn run(client: Weak<SentinelClient>, mut last: TopologySnapshot, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(strong) = client.upgrade() else {
            debug!("Sentinel client dropped, monitor exiting");
            break;
        };

        tick(&strong, &mut last).await;

        let interval = strong.options.monitor_interval;
        let jitter = strong.options.monitor_jitter;
        drop(strong);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(jittered(interval, jitter)) => {}
        }
    }
}

/// One polling round: query, diff against `last`, then notify outside any lock
pub(crate) async fn tick(client: &SentinelClient, last: &mut TopologySnapshot) {
    let mut switched: Option<NodeInfo> = None;
    let mut replicas_changed: Option<Vec<NodeInfo>> = None;

    match client.query_primary().await {
        Ok(primary) => {
            if last.primary_changed(&primary) {
                let previous = last
                    .primary
                    .as_ref()
                    .map(|p| p.addr.to_string())
                    .unwrap_or_else(|| "none".to_string());
                info!(
                    master = %client.master_name(),
                    from = %previous,
                    to = %primary.addr,
                    "Primary switch detected"
                );
                last.primary = Some(primary.clone());
                switched = Some(primary);
            }
        }
        Err(e) => debug!(master = %client.master_name(), "Primary query failed this tick: {}", e),
    }

    match client.query_replicas().await {
        Ok(replicas) => {
            if last.replicas_changed(&replicas) {
                info!(
                    master = %client.master_name(),
                    before = last.replicas.len(),
                    after = replicas.len(),
                    "Replica set changed"
                );
                last.replicas = replicas.clone();
                replicas_changed = Some(replicas);
            }
        }
        Err(e) => debug!(master = %client.master_name(), "Replica query failed this tick: {}", e),
    }

    if switched.is_none() && replicas_changed.is_none() {
        return;
    }

    let (on_primary, on_replicas) = client.callbacks();
    if let (Some(primary), Some(callback)) = (switched, on_primary) {
        let result = AssertUnwindSafe(async move { callback(primary).await })
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(master = %client.master_name(), "Primary switch callback panicked");
        }
    }
    if let (Some(replicas), Some(callback)) = (replicas_changed, on_replicas) {
        let result = AssertUnwindSafe(async move { callback(replicas).await })
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(master = %client.master_name(), "Replica change callback panicked");
        }
    }
}
