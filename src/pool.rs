//! Connection pool for forwarded requests
//!
//! One pooled client serves both local backends and remote gateway nodes;
//! connections are keyed by upstream endpoint.

use crate::tables::Endpoint;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Which kind of upstream a request went to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// A backend on this node
    Backend,
    /// Another gateway node
    Node,
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Absolute URI for `path_and_query` on `endpoint`
pub fn upstream_uri(endpoint: &Endpoint, path_and_query: Option<&str>) -> String {
    format!("http://{}{}", endpoint, path_and_query.unwrap_or("/"))
}

/// A connection pool for HTTP connections to backends and peer nodes
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client }
    }

    /// Send a request to `endpoint`, with `headers` replacing the request's own
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        headers: HeaderMap,
        endpoint: &Endpoint,
        upstream: Upstream,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = upstream_uri(endpoint, req.uri().path_and_query().map(|pq| pq.as_str()));

        let (parts, body) = req.into_parts();
        let mut upstream_req = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *upstream_req.headers_mut() = headers;

        debug!(uri = %uri, upstream = ?upstream, "Sending upstream request");

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_upstream_uri() {
        let backend = Endpoint::new("127.0.0.1", 9001);
        assert_eq!(
            upstream_uri(&backend, Some("/bucket/key?versionId=3")),
            "http://127.0.0.1:9001/bucket/key?versionId=3"
        );
        assert_eq!(upstream_uri(&backend, None), "http://127.0.0.1:9001/");

        let v6 = Endpoint::new("::1", 8008);
        assert_eq!(upstream_uri(&v6, Some("/")), "http://[::1]:8008/");
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        let _client = pool.client.clone();
    }
}
