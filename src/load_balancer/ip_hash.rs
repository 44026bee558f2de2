// src/load_balancer/ip_hash.rs
use crate::load_balancer::{LoadBalancer, RoundRobinBalancer};
use crate::proxy::Backend;
use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

/// Pins a client IP to a backend: the same address maps to the same backend
/// for as long as the routable set is unchanged. Requests with no known
/// client address fall back to round-robin.
pub struct IpHashBalancer {
    fallback: RoundRobinBalancer,
}

impl IpHashBalancer {
    pub fn new() -> Self {
        Self {
            fallback: RoundRobinBalancer::new(),
        }
    }

    fn hash_ip(addr: SocketAddr) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        // Port excluded: every connection from a client sticks to one backend.
        addr.ip().hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for IpHashBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for IpHashBalancer {
    async fn select_backend(
        &self,
        backends: &[Arc<Backend>],
        client_addr: Option<SocketAddr>,
    ) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        match client_addr {
            Some(addr) => {
                let index = (Self::hash_ip(addr) as usize) % backends.len();
                Some(backends[index].clone())
            }
            None => self.fallback.select_backend(backends, None).await,
        }
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::make_backends;

    #[tokio::test]
    async fn same_ip_sticks_to_one_backend() {
        let balancer = IpHashBalancer::new();
        let backends = make_backends(&[8001, 8002, 8003]);
        let client: SocketAddr = "192.168.1.100:55001".parse().unwrap();

        let first = balancer
            .select_backend(&backends, Some(client))
            .await
            .unwrap();
        for port in [55002, 60000, 12345] {
            let again = balancer
                .select_backend(&backends, Some(SocketAddr::new(client.ip(), port)))
                .await
                .unwrap();
            assert_eq!(first.id, again.id, "client moved backends across ports");
        }
    }

    #[tokio::test]
    async fn different_ips_spread_out() {
        let balancer = IpHashBalancer::new();
        let backends = make_backends(&[8001, 8002, 8003]);

        let mut seen = std::collections::HashSet::new();
        for i in 0..64u32 {
            let client: SocketAddr = format!("10.0.{}.{}:40000", i / 256, i % 256)
                .parse()
                .unwrap();
            let backend = balancer
                .select_backend(&backends, Some(client))
                .await
                .unwrap();
            seen.insert(backend.id.clone());
        }

        assert!(seen.len() > 1, "all 64 clients hashed to a single backend");
    }

    #[tokio::test]
    async fn missing_client_addr_falls_back() {
        let balancer = IpHashBalancer::new();
        let backends = make_backends(&[8001, 8002]);

        assert!(balancer.select_backend(&backends, None).await.is_some());
        assert!(balancer.select_backend(&[], None).await.is_none());
    }
}
