// src/proxy/forwarder.rs
// Reverse-proxy engine: backend selection, request rewriting, retries.
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::Config;
use crate::health::HealthChecker;
use crate::load_balancer::{create_load_balancer, LoadBalancer};
use crate::metrics::{MetricsCollector, Timer};
use crate::middleware::REQUEST_ID_HEADER;
use crate::proxy::{Backend, BackendPool};
use crate::retry::{RetryDecision, RetryStrategy};
use crate::server::ClientAddr;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Body, Client, Request, Response, Uri};
use hyper_tls::HttpsConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that are connection-scoped and must not be forwarded upstream.
/// Host is stripped too; hyper derives it from the rewritten URI.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub struct Proxy {
    config: Config,
    pool: Arc<BackendPool>,
    balancer: Arc<dyn LoadBalancer>,
    retry: RetryStrategy,
    breakers: CircuitBreakerManager,
    client: Client<HttpsConnector<HttpConnector>>,
    metrics: Arc<MetricsCollector>,
    upstream_timeout: Duration,
}

impl Proxy {
    pub fn new(config: Config, pool: Arc<BackendPool>, metrics: Arc<MetricsCollector>) -> Self {
        let balancer = create_load_balancer(config.load_balancer.algorithm);
        let retry = RetryStrategy::new(config.retry.clone());
        let breakers = CircuitBreakerManager::new(config.circuit_breaker.clone());
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());
        let upstream_timeout = config.server.upstream_timeout();

        Self {
            config,
            pool,
            balancer,
            retry,
            breakers,
            client,
            metrics,
            upstream_timeout,
        }
    }

    pub fn pool(&self) -> Arc<BackendPool> {
        self.pool.clone()
    }

    /// Spawn the health check loop; the returned handle is used to stop it
    /// on shutdown.
    pub fn start_health_checker(&self) -> Arc<HealthChecker> {
        let checker = Arc::new(HealthChecker::new(
            self.config.health_check.clone(),
            self.pool.clone(),
            Some(self.metrics.clone()),
        ));

        let runner = checker.clone();
        tokio::spawn(async move {
            runner.start().await;
        });

        checker
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let client_addr = req.extensions().get::<ClientAddr>().map(|c| c.0);
        let request_id = req.headers().get(REQUEST_ID_HEADER).cloned();

        // Buffer the body once so it can be replayed across attempts.
        let (parts, body) = req.into_parts();
        let body_bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|e| ProxyError::BackendError(format!("failed to read request body: {e}")))?;

        let mut tried: Vec<String> = Vec::new();
        let mut last_error = ProxyError::NoHealthyBackends;
        let max_attempts = self.retry.max_attempts();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.backoff_for(attempt - 1)).await;
                self.metrics.record_retry();
            }

            let routable = self.pool.routable_backends();
            let candidates: Vec<Arc<Backend>> = routable
                .iter()
                .filter(|b| !tried.contains(&b.id))
                .cloned()
                .collect();

            let backend = match self.balancer.select_backend(&candidates, client_addr).await {
                Some(backend) => backend,
                None => break,
            };
            tried.push(backend.id.clone());

            let breaker = self.breakers.get_or_create(&backend.id);
            if !breaker.call_permitted().await {
                debug!("Circuit open for backend {}, skipping", backend.id);
                last_error = ProxyError::BackendError(format!("circuit open for {}", backend.id));
                continue;
            }

            if !backend.increment_connections() {
                last_error =
                    ProxyError::BackendError(format!("backend {} at connection capacity", backend.id));
                continue;
            }
            self.metrics
                .update_backend_connections(&backend.id, backend.active_connections() as i64);

            let timer = Timer::new();
            let outcome = self
                .forward_once(&parts, body_bytes.clone(), &backend, client_addr)
                .await;

            backend.decrement_connections();
            self.metrics
                .update_backend_connections(&backend.id, backend.active_connections() as i64);
            self.metrics
                .update_breaker_state(&backend.id, breaker.state().await);

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    let success = !status.is_server_error();

                    backend.record_request(success);
                    self.metrics.record_request(
                        parts.method.as_str(),
                        status.as_u16(),
                        &backend.id,
                        timer.elapsed(),
                    );
                    self.metrics
                        .record_backend_request(&backend.id, success, timer.elapsed());

                    if success {
                        breaker.record_success().await;
                        return Ok(attach_request_id(response, request_id));
                    }

                    breaker.record_failure().await;

                    let retryable =
                        matches!(RetryStrategy::is_retryable_status(status), RetryDecision::Retry);
                    if retryable && attempt < max_attempts {
                        debug!(
                            "Backend {} returned {}, trying another backend",
                            backend.id, status
                        );
                        last_error =
                            ProxyError::BackendError(format!("backend {} returned {}", backend.id, status));
                        continue;
                    }

                    // Out of attempts or non-retryable: hand the upstream
                    // response through unchanged.
                    return Ok(attach_request_id(response, request_id));
                }
                Err(error) => {
                    backend.record_request(false);
                    breaker.record_failure().await;
                    self.metrics
                        .record_backend_request(&backend.id, false, timer.elapsed());

                    warn!(
                        "Attempt {}/{} to backend {} failed: {}",
                        attempt, max_attempts, backend.id, error
                    );
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    async fn forward_once(
        &self,
        parts: &Parts,
        body: Bytes,
        backend: &Backend,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        let uri = upstream_uri(&backend.url, &parts.uri)?;

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            copy_request_headers(&parts.headers, headers);
            append_forwarded_for(headers, client_addr);
        }

        let request = builder
            .body(Body::from(body))
            .map_err(|e| ProxyError::BackendError(format!("failed to build request: {e}")))?;

        match timeout(self.upstream_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ProxyError::BackendError(e.to_string())),
            Err(_) => Err(ProxyError::Timeout),
        }
    }
}

/// Scheme and authority come from the backend, path and query from the
/// original request.
fn upstream_uri(backend_url: &url::Url, original: &Uri) -> Result<Uri, ProxyError> {
    let host = backend_url
        .host_str()
        .ok_or_else(|| ProxyError::BackendError("backend URL has no host".to_string()))?;

    let authority = match backend_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{}://{}{}", backend_url.scheme(), authority, path_and_query)
        .parse::<Uri>()
        .map_err(|e| ProxyError::BackendError(format!("bad upstream URI: {e}")))
}

fn copy_request_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            to.append(name.clone(), value.clone());
        }
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: Option<SocketAddr>) {
    let Some(addr) = client_addr else {
        return;
    };

    let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, addr.ip()),
        None => addr.ip().to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn attach_request_id(mut response: Response<Body>, id: Option<HeaderValue>) -> Response<Body> {
    if let Some(id) = id {
        response.headers_mut().entry(REQUEST_ID_HEADER).or_insert(id);
    }
    response
}

// Custom error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Request timeout")]
    Timeout,
}

// Convert ProxyError to a Hyper response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match err {
            ProxyError::NoHealthyBackends => (503, "No healthy backends available"),
            ProxyError::BackendError(_) => (502, "Bad gateway"),
            ProxyError::Timeout => (504, "Gateway timeout"),
        };

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let backend: url::Url = "http://10.0.0.1:8001".parse().unwrap();
        let original: Uri = "http://lb.example.com/api/users?page=2".parse().unwrap();

        let uri = upstream_uri(&backend, &original).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8001/api/users?page=2");
    }

    #[test]
    fn upstream_uri_without_explicit_port() {
        let backend: url::Url = "https://backend.internal".parse().unwrap();
        let original: Uri = "/".parse().unwrap();

        let uri = upstream_uri(&backend, &original).unwrap();
        assert_eq!(uri.to_string(), "https://backend.internal/");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut from = HeaderMap::new();
        from.insert("connection", HeaderValue::from_static("keep-alive"));
        from.insert("host", HeaderValue::from_static("lb.example.com"));
        from.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        from.insert("accept", HeaderValue::from_static("application/json"));

        let mut to = HeaderMap::new();
        copy_request_headers(&from, &mut to);

        assert_eq!(to.len(), 1);
        assert!(to.contains_key("accept"));
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));

        let client: SocketAddr = "192.168.1.5:51000".parse().unwrap();
        append_forwarded_for(&mut headers, Some(client));

        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.7, 192.168.1.5"
        );
    }

    #[test]
    fn forwarded_for_starts_chain() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, Some("10.1.2.3:9999".parse().unwrap()));
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.1.2.3");

        let mut untouched = HeaderMap::new();
        append_forwarded_for(&mut untouched, None);
        assert!(untouched.is_empty());
    }

    #[test]
    fn error_maps_to_status() {
        let resp: Response<Body> = ProxyError::NoHealthyBackends.into();
        assert_eq!(resp.status(), 503);

        let resp: Response<Body> = ProxyError::BackendError("boom".into()).into();
        assert_eq!(resp.status(), 502);

        let resp: Response<Body> = ProxyError::Timeout.into();
        assert_eq!(resp.status(), 504);
    }
}
