//! Health checks for agent connections.

use crate::agent::Agent;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a health check waits for the `ping` reply.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health check result for an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Agent is answering requests.
    Healthy,
    /// Agent is running but not answering correctly.
    Unhealthy(String),
    /// Agent connection is closed.
    NotRunning,
}

impl HealthStatus {
    /// Returns true if the agent is healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Returns true if the agent is not running.
    pub fn is_not_running(&self) -> bool {
        matches!(self, HealthStatus::NotRunning)
    }
}

/// Check an agent by sending a `ping`.
pub async fn health_check(agent: &Agent) -> HealthStatus {
    if agent.is_closed() {
        return HealthStatus::NotRunning;
    }

    debug!(pid = ?agent.pid(), "Performing agent health check");
    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, agent.ping()).await {
        Ok(Ok(())) => HealthStatus::Healthy,
        Ok(Err(e)) if agent.is_closed() => {
            debug!(error = %e, "Agent closed during health check");
            HealthStatus::NotRunning
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Agent health check failed");
            HealthStatus::Unhealthy(e.to_string())
        }
        Err(_) => {
            warn!("Agent health check timed out");
            HealthStatus::Unhealthy(format!(
                "no ping reply within {}ms",
                HEALTH_CHECK_TIMEOUT.as_millis()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status() {
        let healthy = HealthStatus::Healthy;
        assert!(healthy.is_healthy());
        assert!(!healthy.is_not_running());

        let unhealthy = HealthStatus::Unhealthy("test".to_string());
        assert!(!unhealthy.is_healthy());
        assert!(!unhealthy.is_not_running());

        let not_running = HealthStatus::NotRunning;
        assert!(!not_running.is_healthy());
        assert!(not_running.is_not_running());
    }
}
