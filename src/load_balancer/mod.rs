// src/load_balancer/mod.rs
mod algorithm;
mod ip_hash;
mod least_connections;
mod round_robin;
mod weighted;

pub use algorithm::LoadBalancer;
pub use ip_hash::IpHashBalancer;
pub use least_connections::LeastConnectionsBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted::WeightedRandomBalancer;

use crate::config::LoadBalancerAlgorithm;
use std::sync::Arc;

pub fn create_load_balancer(algorithm: LoadBalancerAlgorithm) -> Arc<dyn LoadBalancer> {
    match algorithm {
        LoadBalancerAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancerAlgorithm::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
        LoadBalancerAlgorithm::WeightedRandom => Arc::new(WeightedRandomBalancer::new()),
        LoadBalancerAlgorithm::IpHash => Arc::new(IpHashBalancer::new()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::proxy::Backend;
    use std::sync::Arc;

    pub fn make_backends(ports: &[u16]) -> Vec<Arc<Backend>> {
        ports
            .iter()
            .map(|port| {
                Arc::new(Backend::new(
                    format!("http://127.0.0.1:{port}").parse().unwrap(),
                    1,
                    64,
                ))
            })
            .collect()
    }

    pub fn make_weighted(specs: &[(u16, u32)]) -> Vec<Arc<Backend>> {
        specs
            .iter()
            .map(|(port, weight)| {
                Arc::new(Backend::new(
                    format!("http://127.0.0.1:{port}").parse().unwrap(),
                    *weight,
                    64,
                ))
            })
            .collect()
    }
}
