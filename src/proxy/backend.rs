// src/proxy/backend.rs
use crate::health::HealthStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use url::Url;

#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,
    pub weight: u32,
    pub max_connections: usize,

    // Runtime state
    active_connections: AtomicUsize,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    health_status: RwLock<HealthStatus>,
    last_probe: RwLock<Option<DateTime<Utc>>>,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
}

impl Backend {
    pub fn new(url: Url, weight: u32, max_connections: usize) -> Self {
        let id = format!(
            "{}:{}",
            url.host_str().unwrap_or("unknown"),
            url.port_or_known_default().unwrap_or(80)
        );

        Self {
            id,
            url,
            weight,
            max_connections,
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            health_status: RwLock::new(HealthStatus::Unknown),
            last_probe: RwLock::new(None),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Reserve a connection slot. Refuses once the cap is reached.
    pub fn increment_connections(&self) -> bool {
        loop {
            let current = self.active_connections.load(Ordering::Relaxed);
            if current >= self.max_connections {
                return false;
            }

            if self
                .active_connections
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a probe result. Updates the streak counters; the status flip
    /// itself is threshold-gated and done by the health checker.
    pub async fn record_probe(&self, pass: bool) {
        if pass {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut last = self.last_probe.write().await;
        *last = Some(Utc::now());
    }

    pub async fn set_status(&self, status: HealthStatus) {
        let mut current = self.health_status.write().await;
        *current = status;
    }

    pub async fn status(&self) -> HealthStatus {
        *self.health_status.read().await
    }

    pub async fn is_healthy(&self) -> bool {
        *self.health_status.read().await == HealthStatus::Healthy
    }

    pub async fn is_routable(&self) -> bool {
        self.health_status.read().await.is_routable()
    }

    pub fn consecutive_successes(&self) -> usize {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id.clone(),
            url: self.url.to_string(),
            status: self.status().await,
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            last_probe: *self.last_probe.read().await,
        }
    }
}

/// Point-in-time view of a backend, served on the admin endpoint.
#[derive(Debug, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub url: String,
    pub status: HealthStatus,
    pub active_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_probe: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(max_connections: usize) -> Backend {
        Backend::new(
            "http://127.0.0.1:8001".parse().unwrap(),
            1,
            max_connections,
        )
    }

    #[test]
    fn id_is_host_and_port() {
        let b = backend(8);
        assert_eq!(b.id, "127.0.0.1:8001");

        let https = Backend::new("https://example.com".parse().unwrap(), 1, 8);
        assert_eq!(https.id, "example.com:443");
    }

    #[test]
    fn connection_cap_enforced() {
        let b = backend(2);
        assert!(b.increment_connections());
        assert!(b.increment_connections());
        assert!(!b.increment_connections());

        b.decrement_connections();
        assert!(b.increment_connections());
        assert_eq!(b.active_connections(), 2);
    }

    #[tokio::test]
    async fn new_backend_is_routable_but_not_healthy() {
        let b = backend(8);
        assert!(b.is_routable().await);
        assert!(!b.is_healthy().await);
    }

    #[tokio::test]
    async fn probe_streaks_reset_each_other() {
        let b = backend(8);
        b.record_probe(true).await;
        b.record_probe(true).await;
        assert_eq!(b.consecutive_successes(), 2);

        b.record_probe(false).await;
        assert_eq!(b.consecutive_successes(), 0);
        assert_eq!(b.consecutive_failures(), 1);
        assert!(b.snapshot().await.last_probe.is_some());
    }

    #[tokio::test]
    async fn snapshot_reflects_counters() {
        let b = backend(8);
        b.record_request(true);
        b.record_request(false);

        let snap = b.snapshot().await;
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.status, HealthStatus::Unknown);
    }
}
