//! Read-only status API: node registry and process census

use crate::error::StoreResult;
use crate::tables::{Endpoint, Tables};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Status API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    tables: Arc<Tables>,
    node: Endpoint,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        tables: Arc<Tables>,
        node: Endpoint,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            tables,
            node,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Status API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let node = Arc::new(self.node.clone());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let tables = Arc::clone(&self.tables);
                            let node = Arc::clone(&node);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, tables, node, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Status API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    tables: Arc<Tables>,
    node: Arc<Endpoint>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let tables = Arc::clone(&tables);
        let node = Arc::clone(&node);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, tables, node, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Registered nodes, marking this one
pub fn nodes_json(tables: &Tables, local: &Endpoint) -> StoreResult<serde_json::Value> {
    let nodes: Vec<serde_json::Value> = tables
        .list_nodes()?
        .into_iter()
        .map(|n| {
            serde_json::json!({
                "endpoint": n.endpoint().to_string(),
                "started_at": n.started_at,
                "last_heartbeat": n.last_heartbeat,
                "local": n.endpoint() == *local,
            })
        })
        .collect();
    Ok(serde_json::json!({
        "count": nodes.len(),
        "nodes": nodes,
    }))
}

/// Running backends with their last access time
pub fn processes_json(tables: &Tables) -> StoreResult<serde_json::Value> {
    let mut processes = Vec::new();
    for (pool_id, p) in tables.list_processes()? {
        processes.push(serde_json::json!({
            "pool_id": pool_id,
            "node": p.mux_endpoint().to_string(),
            "backend": p.backend_endpoint().to_string(),
            "manager_pid": p.manager_pid,
            "backend_pid": p.backend_pid,
            "started_at": p.started_at,
            "last_access": tables.get_access_time(&pool_id)?,
        }));
    }
    Ok(serde_json::json!({
        "count": processes.len(),
        "processes": processes,
    }))
}

fn snapshot_response(snapshot: StoreResult<serde_json::Value>) -> Response<Full<Bytes>> {
    match snapshot {
        Ok(body) => json_response(StatusCode::OK, body.to_string()),
        Err(e) => {
            error!(error = %e, "Failed to read tables for status API");
            response(StatusCode::SERVICE_UNAVAILABLE, "table store unavailable")
        }
    }
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    tables: Arc<Tables>,
    node: Arc<Endpoint>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        // Health check for the status API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "node": node.to_string(),
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/nodes") | (&Method::GET, "/processes") => {
            if !check_auth(req.headers(), &auth_token) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else if path == "/nodes" {
                snapshot_response(nodes_json(&tables, &node))
            } else {
                snapshot_response(processes_json(&tables))
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
