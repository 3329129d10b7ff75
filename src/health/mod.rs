//! Liveness probing for Sentinel and store connections
pub mod redis;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;

use crate::core::connection::RespConnection;

/// Health status of a probed connection
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    /// The connection was already broken, no probe was sent
    Broken,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Broken => write!(f, "Broken"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy connection
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe an open connection
    async fn check_health(&self, conn: &mut RespConnection) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Runs a checker against connections with an outer timeout.
///
/// Detection only: the manager never replaces or drops a connection. A
/// probe that times out leaves an unread reply on the stream, so the
/// connection is marked broken.
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Perform health check with timeout
    pub async fn check_connection(&self, conn: &mut RespConnection) -> HealthStatus {
        if conn.is_broken() {
            return HealthStatus::Broken;
        }

        let check_timeout = self.checker.check_timeout();
        let status = match timeout(check_timeout, self.checker.check_health(conn)).await {
            Ok(status) => status,
            Err(_) => {
                conn.mark_broken();
                HealthStatus::Timeout
            }
        };

        match &status {
            HealthStatus::Healthy => {
                tracing::debug!(endpoint = %conn.endpoint(), "Connection is healthy");
            }
            other => {
                tracing::warn!(endpoint = %conn.endpoint(), "Connection is unhealthy: {}", other);
            }
        }

        status
    }
}
