// src/health/status.rs
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not probed yet. Unknown backends are still routable so a fresh
    /// process serves traffic before the first sweep completes.
    Unknown,
}

impl HealthStatus {
    pub fn is_routable(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Unknown)
    }
}
