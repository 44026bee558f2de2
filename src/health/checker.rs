// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::health::HealthStatus;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendPool};
use reqwest::Client;
use std::sync::Arc;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, warn};

pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<BackendPool>,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ProbeOutcome {
    pub backend_id: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<BackendPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Self {
            config,
            pool,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn start(self: Arc<Self>) {
        let mut interval = interval(self.config.interval());
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health checker with interval: {:?}",
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Probe every backend once, then refresh the routable snapshot.
    pub async fn sweep(self: &Arc<Self>) {
        let backends = self.pool.all_backends();
        let mut tasks = Vec::new();

        for backend in backends {
            let checker = self.clone();
            tasks.push(tokio::spawn(async move {
                checker.probe(backend).await
            }));
        }

        let results = futures::future::join_all(tasks).await;

        let mut healthy_count = 0;
        let mut unhealthy_count = 0;

        for result in results {
            match result {
                Ok(outcome) => {
                    if outcome.healthy {
                        healthy_count += 1;
                        debug!("Backend {} passed probe", outcome.backend_id);
                    } else {
                        unhealthy_count += 1;
                        warn!(
                            "Backend {} failed probe: {:?}",
                            outcome.backend_id, outcome.error
                        );
                    }
                }
                Err(e) => {
                    error!("Probe task join error: {}", e);
                    unhealthy_count += 1;
                }
            }
        }

        self.pool.refresh_routable().await;

        if let Some(metrics) = &self.metrics {
            let routable = self.pool.routable_backends().len();
            metrics.update_backend_counts(routable, self.pool.len());
        }

        info!(
            "Health sweep complete: {} passed, {} failed",
            healthy_count, unhealthy_count
        );
    }

    async fn probe(&self, backend: Arc<Backend>) -> ProbeOutcome {
        let start = std::time::Instant::now();
        let previous = backend.status().await;

        let (healthy, error) = match backend.url.join(&self.config.path) {
            Ok(url) => {
                let result = timeout(self.config.timeout(), self.client.get(url.as_str()).send()).await;
                match result {
                    Ok(Ok(response)) => {
                        let status = response.status();
                        if status.is_success() {
                            (true, None)
                        } else {
                            (false, Some(format!("HTTP {}", status)))
                        }
                    }
                    Ok(Err(e)) => (false, Some(e.to_string())),
                    Err(_) => (false, Some("Request timeout".to_string())),
                }
            }
            Err(e) => (false, Some(format!("Bad probe URL: {}", e))),
        };

        let response_time_ms = start.elapsed().as_millis() as u64;

        backend.record_probe(healthy).await;
        self.apply_thresholds(&backend, previous, healthy).await;

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_health(&backend.id, backend.is_healthy().await);
        }

        ProbeOutcome {
            backend_id: backend.id.clone(),
            healthy,
            response_time_ms,
            error,
        }
    }

    /// Flip status only at the configured streak edges, logging once per
    /// transition rather than every tick.
    async fn apply_thresholds(&self, backend: &Backend, previous: HealthStatus, pass: bool) {
        if pass {
            if previous != HealthStatus::Healthy
                && backend.consecutive_successes() >= self.config.healthy_threshold as usize
            {
                backend.set_status(HealthStatus::Healthy).await;
                info!(
                    "Backend {} is now healthy after {} consecutive passes",
                    backend.id,
                    backend.consecutive_successes()
                );
            }
        } else if previous != HealthStatus::Unhealthy
            && backend.consecutive_failures() >= self.config.unhealthy_threshold as usize
        {
            backend.set_status(HealthStatus::Unhealthy).await;
            warn!(
                "Backend {} is now unhealthy after {} consecutive failures",
                backend.id,
                backend.consecutive_failures()
            );
        }
    }
}
