//! PING-based health checker for Sentinel and Redis nodes
use super::{HealthChecker, HealthStatus};
use crate::core::connection::RespConnection;
use crate::error::HaError;
use std::time::Duration;

/// Sends `PING` over an existing connection and expects `+PONG`
pub struct PingHealthChecker {
    check_timeout: Duration,
}

impl PingHealthChecker {
    pub fn new() -> Self {
        Self {
            check_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(check_timeout: Duration) -> Self {
        Self { check_timeout }
    }
}

impl Default for PingHealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HealthChecker for PingHealthChecker {
    async fn check_health(&self, conn: &mut RespConnection) -> HealthStatus {
        match conn.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(HaError::Timeout { .. }) => HealthStatus::Timeout,
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}
