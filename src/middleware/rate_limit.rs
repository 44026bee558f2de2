// src/middleware/rate_limit.rs
use crate::config::RateLimitConfig;
use crate::metrics::MetricsCollector;
use crate::middleware::TokenBucket;
use crate::server::ClientAddr;
use dashmap::DashMap;
use hyper::{Body, Request, Response, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use tower::Service;
use tracing::debug;

/// Per-client-IP token buckets.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<IpAddr, Arc<TokenBucket>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            metrics,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether a request from this client may proceed.
    pub fn check(&self, client: IpAddr) -> bool {
        if !self.config.enabled {
            return true;
        }

        let bucket = self
            .buckets
            .entry(client)
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(self.config.burst, self.config.per_second))
            })
            .clone();

        let allowed = bucket.try_consume();
        if !allowed {
            debug!("Rate limited client {}", client);
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limited();
            }
        }
        allowed
    }
}

/// Rejects over-limit clients with 429 before the request reaches the proxy.
#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> RateLimit<S> {
    pub fn new(inner: S, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

impl<S> Service<Request<Body>> for RateLimit<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let client = req.extensions().get::<ClientAddr>().map(|c| c.0.ip());

            if let Some(ip) = client {
                if !limiter.check(ip) {
                    return Ok(Response::builder()
                        .status(StatusCode::TOO_MANY_REQUESTS)
                        .header("Retry-After", "1")
                        .body(Body::from("Too many requests"))
                        .unwrap());
                }
            }

            inner.call(req).await.map_err(Into::into)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(enabled: bool, burst: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig {
                enabled,
                burst,
                per_second: 0.0001,
            },
            None,
        )
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = limiter(false, 1);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..100 {
            assert!(limiter.check(ip));
        }
    }

    #[test]
    fn clients_get_independent_buckets() {
        let limiter = limiter(true, 2);
        let alice: IpAddr = "10.0.0.1".parse().unwrap();
        let bob: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(alice));
        assert!(limiter.check(alice));
        assert!(!limiter.check(alice));

        // Alice exhausting her bucket does not affect Bob.
        assert!(limiter.check(bob));
    }

    #[tokio::test]
    async fn service_returns_429_when_dry() {
        use crate::server::ClientAddr;
        use std::convert::Infallible;
        use tower::service_fn;

        let inner = service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("ok")))
        });
        let limiter = Arc::new(limiter(true, 1));
        let mut service = RateLimit::new(inner, limiter);

        let addr: std::net::SocketAddr = "10.0.0.9:40000".parse().unwrap();

        let mut first = Request::new(Body::empty());
        first.extensions_mut().insert(ClientAddr(addr));
        let resp = service.call(first).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut second = Request::new(Body::empty());
        second.extensions_mut().insert(ClientAddr(addr));
        let resp = service.call(second).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "1");
    }
}
