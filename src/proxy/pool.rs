// src/proxy/pool.rs
use super::backend::{Backend, BackendSnapshot};
use crate::config::BackendConfig;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;
use url::Url;

/// All configured backends plus a lock-free snapshot of the routable ones.
/// The snapshot is what the request path reads; only the health checker and
/// the admin operations rewrite it.
#[derive(Clone)]
pub struct BackendPool {
    backends: Arc<DashMap<String, Arc<Backend>>>,
    routable: Arc<ArcSwap<Vec<Arc<Backend>>>>,
}

impl BackendPool {
    pub fn new(configs: Vec<BackendConfig>) -> Self {
        let backends = Arc::new(DashMap::new());
        let mut routable = Vec::new();

        for config in configs {
            let backend = Arc::new(Backend::new(
                config.url.clone(),
                config.weight,
                config.max_connections,
            ));

            backends.insert(backend.id.clone(), backend.clone());
            routable.push(backend);
        }

        routable.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            backends,
            routable: Arc::new(ArcSwap::from_pointee(routable)),
        }
    }

    /// Cheap read for the request path.
    pub fn routable_backends(&self) -> Arc<Vec<Arc<Backend>>> {
        self.routable.load_full()
    }

    pub fn get_backend(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.get(id).map(|b| b.clone())
    }

    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.backends.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Recompute the routable snapshot from per-backend status.
    pub async fn refresh_routable(&self) {
        let mut routable = Vec::new();

        for backend in self.backends.iter() {
            if backend.is_routable().await {
                routable.push(backend.value().clone());
            }
        }

        // Stable order keeps round-robin and ip-hash placement deterministic
        // between refreshes.
        routable.sort_by(|a, b| a.id.cmp(&b.id));

        let count = routable.len();
        self.routable.store(Arc::new(routable));

        tracing::info!(
            "Updated routable backends: {}/{} available",
            count,
            self.backends.len()
        );
    }

    pub async fn add_backend(&self, url: Url, weight: u32, max_connections: usize) {
        let backend = Arc::new(Backend::new(url, weight, max_connections));
        let id = backend.id.clone();

        self.backends.insert(id.clone(), backend);
        self.refresh_routable().await;

        tracing::info!("Added new backend: {}", id);
    }

    pub async fn remove_backend(&self, id: &str) -> bool {
        if self.backends.remove(id).is_some() {
            self.refresh_routable().await;
            tracing::info!("Removed backend: {}", id);
            true
        } else {
            false
        }
    }

    pub async fn snapshots(&self) -> Vec<BackendSnapshot> {
        let mut snapshots = Vec::with_capacity(self.backends.len());
        for backend in self.backends.iter() {
            snapshots.push(backend.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }
}
