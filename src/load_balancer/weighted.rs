// src/load_balancer/weighted.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use async_trait::async_trait;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;

/// Weight-proportional random draw. A backend with weight 3 receives on
/// average three times the traffic of a backend with weight 1.
#[derive(Default)]
pub struct WeightedRandomBalancer;

impl WeightedRandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LoadBalancer for WeightedRandomBalancer {
    async fn select_backend(
        &self,
        backends: &[Arc<Backend>],
        _client_addr: Option<SocketAddr>,
    ) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let weights: Vec<u32> = backends.iter().map(|b| b.weight.max(1)).collect();
        // Weights are validated non-zero at config load; the fallback covers
        // a pool mutated at runtime.
        let dist = WeightedIndex::new(&weights).ok()?;
        let index = dist.sample(&mut rand::thread_rng());
        Some(backends[index].clone())
    }

    fn name(&self) -> &'static str {
        "weighted_random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn weighted_backends() -> Vec<Arc<Backend>> {
        [(8001u16, 9u32), (8002, 1)]
            .iter()
            .map(|(port, weight)| {
                let config = BackendConfig {
                    url: format!("http://127.0.0.1:{port}").parse().unwrap(),
                    weight: *weight,
                    max_connections: 64,
                };
                Arc::new(Backend::new(config.url, config.weight, config.max_connections))
            })
            .collect()
    }

    #[tokio::test]
    async fn distribution_follows_weights() {
        let balancer = WeightedRandomBalancer::new();
        let backends = weighted_backends();

        let mut heavy = 0u32;
        for _ in 0..1000 {
            let backend = balancer.select_backend(&backends, None).await.unwrap();
            if backend.id.ends_with("8001") {
                heavy += 1;
            }
        }

        // Expect ~900 hits on the weight-9 backend; allow generous slack.
        assert!(heavy > 800, "heavy backend only got {heavy}/1000");
    }

    #[tokio::test]
    async fn empty_pool_yields_none() {
        let balancer = WeightedRandomBalancer::new();
        assert!(balancer.select_backend(&[], None).await.is_none());
    }
}
