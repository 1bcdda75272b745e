use crate::controller::{Controller, Destination};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::pool::{ConnectionPool, PoolConfig, Upstream};
use crate::tables::{Endpoint, Tables};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for the trace id carried through every hop
pub const X_TRACE_ID: &str = "x-trace-id";
/// Marks a request already forwarded by another gateway node
pub const X_POOLMUX_FORWARDED: &str = "x-poolmux-forwarded";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Front-end settings shared by every connection
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Requests for this host are routed by access key
    pub facade_hostname: Option<String>,
    /// Upper bound on one forwarded request
    pub forwarding_timeout: Duration,
    /// Peers besides registered nodes allowed to mark requests as forwarded
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            facade_hostname: None,
            forwarding_timeout: Duration::from_secs(60),
            trusted_proxies: Vec::new(),
        }
    }
}

/// The gateway's request listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    controller: Arc<Controller>,
    frontend: Arc<FrontendConfig>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<Controller>,
        frontend: FrontendConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(
            bind_addr,
            controller,
            frontend,
            shutdown_rx,
            PoolConfig::default(),
        )
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        controller: Arc<Controller>,
        frontend: FrontendConfig,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            controller,
            frontend: Arc::new(frontend),
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, node = %self.controller.node(), "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let controller = Arc::clone(&self.controller);
                            let frontend = Arc::clone(&self.frontend);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, controller, frontend, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    controller: Arc<Controller>,
    frontend: Arc<FrontendConfig>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let controller = Arc::clone(&controller);
        let frontend = Arc::clone(&frontend);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, controller, frontend, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    controller: Arc<Controller>,
    frontend: Arc<FrontendConfig>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let trace_id = req
        .headers()
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_safe_token(v))
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(hostname) = extract_hostname(req.headers()) else {
        return Ok(json_error_response(
            GatewayErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    // Only other nodes and configured proxies may skip the first-hop header rewrite
    let marked = req.headers().contains_key(X_POOLMUX_FORWARDED);
    let forwarded = marked
        && forwarding_peer_trusted(client_addr.ip(), &frontend.trusted_proxies, controller.tables()).await;
    if marked && !forwarded {
        warn!(trace_id, client = %client_addr, "Ignoring forwarded marker from untrusted peer");
    }
    let (host, access_key_id) = routing_inputs(
        &hostname,
        frontend.facade_hostname.as_deref(),
        req.headers(),
        req.uri().query(),
    );

    debug!(
        trace_id,
        hostname,
        method = %req.method(),
        uri = %req.uri(),
        forwarded,
        "Incoming request"
    );

    let routed = controller
        .route_request(Some(&trace_id), host.as_deref(), access_key_id.as_deref())
        .await;

    let (endpoint, upstream, pool_id) = match routed {
        Ok((Destination::Local(backend), Some(pool_id))) => (backend, Upstream::Backend, pool_id),
        Ok((Destination::Local(backend), None)) => (backend, Upstream::Backend, String::new()),
        Ok((Destination::Remote(_), _)) if forwarded => {
            // placement moved between the two nodes' lookups
            warn!(trace_id, hostname, "Forwarded request routed elsewhere again");
            return Ok(json_error_response(
                GatewayErrorCode::PlacementChanged,
                "Pool placement changed, please retry",
            ));
        }
        Ok((Destination::Remote(node), pool_id)) => (node, Upstream::Node, pool_id.unwrap_or_default()),
        Ok((Destination::NotFound, None)) => {
            return Ok(json_error_response(
                GatewayErrorCode::UnknownPool,
                "Unknown host or access key",
            ));
        }
        Ok((Destination::NotFound, Some(pool_id))) => {
            warn!(trace_id, pool_id, "No backend available");
            return Ok(json_error_response(
                GatewayErrorCode::BackendStartFailed,
                "Backend unavailable",
            ));
        }
        Err(e) => {
            error!(trace_id, hostname, error = %e, "Routing failed");
            return Ok(json_error_response(
                GatewayErrorCode::StoreUnavailable,
                "Service temporarily unavailable",
            ));
        }
    };

    if upstream == Upstream::Backend && !pool_id.is_empty() {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = controller.tables().set_access_time(&pool_id, now) {
            warn!(trace_id, pool_id, error = %e, "Failed to record access time");
        }
    }

    let headers = upstream_headers(req.headers(), &trace_id, client_addr, upstream, forwarded);
    forward(req, headers, &endpoint, upstream, &pool, frontend.forwarding_timeout, &trace_id).await
}

async fn forward(
    req: Request<Incoming>,
    headers: HeaderMap,
    endpoint: &Endpoint,
    upstream: Upstream,
    pool: &ConnectionPool,
    timeout: Duration,
    trace_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let result = tokio::time::timeout(timeout, pool.send_request(req, headers, endpoint, upstream)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            error!(trace_id, endpoint = %endpoint, upstream = ?upstream, error = %e, "Failed to forward request");
            Ok(json_error_response(
                GatewayErrorCode::ConnectionFailed,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            warn!(
                trace_id,
                endpoint = %endpoint,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                GatewayErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ))
        }
    }
}

/// Whether `peer` may send requests already forwarded by a gateway node.
///
/// Registered nodes are trusted by address; a node registered by name is
/// resolved.
pub async fn forwarding_peer_trusted(peer: IpAddr, trusted_proxies: &[IpAddr], tables: &Tables) -> bool {
    let peer = peer.to_canonical();
    if trusted_proxies.iter().any(|addr| addr.to_canonical() == peer) {
        return true;
    }

    let nodes = match tables.list_nodes() {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "Failed to list nodes for forwarding check");
            return false;
        }
    };

    for node in nodes {
        if let Ok(addr) = node.host.parse::<IpAddr>() {
            if addr.to_canonical() == peer {
                return true;
            }
            continue;
        }
        if let Ok(mut resolved) = tokio::net::lookup_host((node.host.as_str(), node.port)).await {
            if resolved.any(|addr| addr.ip().to_canonical() == peer) {
                return true;
            }
        }
    }
    false
}

/// Headers for the upstream request.
///
/// X-Forwarded-* are overwritten on the first hop to prevent client spoofing;
/// a request from a peer node keeps the values that node set.
pub fn upstream_headers(
    incoming: &HeaderMap,
    trace_id: &str,
    client_addr: SocketAddr,
    upstream: Upstream,
    forwarded: bool,
) -> HeaderMap {
    let mut headers = incoming.clone();

    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(X_TRACE_ID, value);
    }

    if !forwarded {
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = incoming.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    match upstream {
        Upstream::Node => {
            headers.insert(X_POOLMUX_FORWARDED, HeaderValue::from_static("1"));
        }
        Upstream::Backend => {
            headers.remove(X_POOLMUX_FORWARDED);
        }
    }

    headers
}

/// The host and access key to route by.
///
/// Requests for the facade hostname carry no per-pool host, so they are
/// routed by the access key of their signature.
pub fn routing_inputs(
    hostname: &str,
    facade_hostname: Option<&str>,
    headers: &HeaderMap,
    query: Option<&str>,
) -> (Option<String>, Option<String>) {
    let is_facade = facade_hostname.map_or(false, |facade| facade.eq_ignore_ascii_case(hostname));
    if !is_facade {
        return (Some(hostname.to_string()), None);
    }

    let access_key = headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(access_key_from_authorization)
        .or_else(|| query.and_then(access_key_from_query));
    (None, access_key)
}

/// Access key id from an S3 `Authorization` header (SigV4 or SigV2)
pub fn access_key_from_authorization(value: &str) -> Option<String> {
    let value = value.trim();
    let candidate = if let Some(rest) = value.strip_prefix("AWS4-") {
        let start = rest.find("Credential=")? + "Credential=".len();
        rest[start..].split('/').next()?
    } else if let Some(rest) = value.strip_prefix("AWS ") {
        rest.split(':').next()?
    } else {
        return None;
    };
    let candidate = candidate.trim();
    is_safe_token(candidate).then(|| candidate.to_string())
}

/// Access key id from a presigned URL query string
pub fn access_key_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let candidate = match name {
            "X-Amz-Credential" => value.split("%2F").next()?.split('/').next()?,
            "AWSAccessKeyId" => value,
            _ => return None,
        };
        is_safe_token(candidate).then(|| candidate.to_string())
    })
}

/// Maximum length of ids taken from request headers
const MAX_TOKEN_LEN: usize = 128;

/// Non-empty, bounded, and free of characters that could corrupt logs or keys
fn is_safe_token(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_TOKEN_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

pub fn extract_hostname(headers: &HeaderMap) -> Option<String> {
    headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // IPv6 literal: "[addr]" or "[addr]:port"
            if let Some(rest) = h.strip_prefix('[') {
                let (literal, tail) = rest.split_once(']')?;
                if !(tail.is_empty() || tail.starts_with(':')) {
                    return None;
                }
                let addr: std::net::Ipv6Addr = literal.parse().ok()?;
                return Some(addr.to_string());
            }

            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Validate characters: alphanumeric, hyphen, and dot only
            // This prevents log injection and other attacks
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(
            extract_hostname(&headers(&[("host", "Files.Example.com:8008")])).as_deref(),
            Some("files.example.com")
        );
        assert_eq!(extract_hostname(&headers(&[("host", "bad host")])), None);
        assert_eq!(extract_hostname(&headers(&[("host", ":8008")])), None);
        assert_eq!(extract_hostname(&HeaderMap::new()), None);
    }

    #[test]
    fn test_extract_hostname_ipv6_literal() {
        assert_eq!(
            extract_hostname(&headers(&[("host", "[::1]:8008")])).as_deref(),
            Some("::1")
        );
        assert_eq!(
            extract_hostname(&headers(&[("host", "[2001:DB8::5]")])).as_deref(),
            Some("2001:db8::5")
        );
        assert_eq!(extract_hostname(&headers(&[("host", "[::1")])), None);
        assert_eq!(extract_hostname(&headers(&[("host", "[::1]x")])), None);
        assert_eq!(extract_hostname(&headers(&[("host", "[not-an-ip]:80")])), None);
    }

    #[test]
    fn test_access_key_sigv4() {
        let auth = "AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20240101/us-east-1/s3/aws4_request, SignedHeaders=host;x-amz-date, Signature=abc";
        assert_eq!(
            access_key_from_authorization(auth).as_deref(),
            Some("AKIAEXAMPLE")
        );
    }

    #[test]
    fn test_access_key_sigv2() {
        assert_eq!(
            access_key_from_authorization("AWS AK1:c2lnbmF0dXJl").as_deref(),
            Some("AK1")
        );
        assert_eq!(access_key_from_authorization("Bearer token"), None);
        assert_eq!(access_key_from_authorization("AWS :sig"), None);
    }

    #[test]
    fn test_access_key_presigned_query() {
        assert_eq!(
            access_key_from_query(
                "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential=AK2%2F20240101%2Fus-east-1%2Fs3%2Faws4_request"
            )
            .as_deref(),
            Some("AK2")
        );
        assert_eq!(
            access_key_from_query("AWSAccessKeyId=AK3&Expires=1").as_deref(),
            Some("AK3")
        );
        assert_eq!(access_key_from_query("list-type=2"), None);
    }

    #[test]
    fn test_routing_inputs() {
        let facade = Some("s3.example.com");
        let signed = headers(&[("authorization", "AWS AK1:sig")]);

        assert_eq!(
            routing_inputs("p1.example.com", facade, &signed, None),
            (Some("p1.example.com".to_string()), None)
        );
        assert_eq!(
            routing_inputs("s3.example.com", facade, &signed, None),
            (None, Some("AK1".to_string()))
        );
        assert_eq!(
            routing_inputs("s3.example.com", facade, &HeaderMap::new(), None),
            (None, None)
        );
        assert_eq!(
            routing_inputs("s3.example.com", None, &signed, None),
            (Some("s3.example.com".to_string()), None)
        );
    }

    #[test]
    fn test_upstream_headers_first_hop() {
        let incoming = headers(&[
            ("host", "p1.example.com"),
            ("x-forwarded-for", "6.6.6.6"),
            ("x-poolmux-forwarded", "1"),
        ]);
        let client: SocketAddr = "10.1.2.3:5555".parse().unwrap();

        let to_backend = upstream_headers(&incoming, "t-1", client, Upstream::Backend, false);
        assert_eq!(to_backend.get(X_FORWARDED_FOR).unwrap(), "10.1.2.3");
        assert_eq!(to_backend.get(X_FORWARDED_HOST).unwrap(), "p1.example.com");
        assert_eq!(to_backend.get(X_TRACE_ID).unwrap(), "t-1");
        assert!(to_backend.get(X_POOLMUX_FORWARDED).is_none());

        let to_node = upstream_headers(&incoming, "t-1", client, Upstream::Node, false);
        assert_eq!(to_node.get(X_POOLMUX_FORWARDED).unwrap(), "1");
        assert_eq!(to_node.get(hyper::header::HOST).unwrap(), "p1.example.com");
    }

    #[test]
    fn test_upstream_headers_from_peer_keep_client() {
        let incoming = headers(&[("host", "p1.example.com"), ("x-forwarded-for", "10.1.2.3")]);
        let peer: SocketAddr = "10.0.0.2:40000".parse().unwrap();

        let to_backend = upstream_headers(&incoming, "t-1", peer, Upstream::Backend, true);
        assert_eq!(to_backend.get(X_FORWARDED_FOR).unwrap(), "10.1.2.3");
    }

    #[tokio::test]
    async fn test_forwarding_peer_trusted() {
        use crate::store::MemoryStore;
        use crate::tables::NodeRecord;

        let tables = Tables::new(Arc::new(MemoryStore::new()));
        tables
            .register_node(
                &NodeRecord {
                    host: "10.0.0.2".to_string(),
                    port: 8008,
                    started_at: 0,
                    last_heartbeat: 0,
                },
                Duration::from_secs(60),
            )
            .unwrap();
        let proxies: Vec<IpAddr> = vec!["192.168.1.10".parse().unwrap()];

        assert!(forwarding_peer_trusted("10.0.0.2".parse().unwrap(), &proxies, &tables).await);
        assert!(forwarding_peer_trusted("::ffff:10.0.0.2".parse().unwrap(), &proxies, &tables).await);
        assert!(forwarding_peer_trusted("192.168.1.10".parse().unwrap(), &proxies, &tables).await);
        assert!(!forwarding_peer_trusted("10.0.0.99".parse().unwrap(), &proxies, &tables).await);
        assert!(!forwarding_peer_trusted("10.0.0.99".parse().unwrap(), &[], &tables).await);
    }

    #[test]
    fn test_is_safe_token() {
        assert!(is_safe_token("AKIA-123_x.y"));
        assert!(!is_safe_token(""));
        assert!(!is_safe_token("a\nb"));
        assert!(!is_safe_token(&"a".repeat(MAX_TOKEN_LEN + 1)));
    }
}
