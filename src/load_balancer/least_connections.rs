// src/load_balancer/least_connections.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

/// Picks the backend with the fewest in-flight requests, dividing by weight
/// so heavier backends are allowed proportionally more connections.
#[derive(Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LoadBalancer for LeastConnectionsBalancer {
    async fn select_backend(
        &self,
        backends: &[Arc<Backend>],
        _client_addr: Option<SocketAddr>,
    ) -> Option<Arc<Backend>> {
        let mut best: Option<&Arc<Backend>> = None;
        let mut best_load = usize::MAX;

        for backend in backends {
            let load = backend.active_connections() / backend.weight.max(1) as usize;
            if load < best_load {
                best_load = load;
                best = Some(backend);
            }
        }

        best.cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
