//! HTTP admin API for operating nodes
//!
//! Every route except `/health` and `/version` requires the bearer token.
//! Handlers are thin: all lifecycle rules live in [`NodeRegistry`].

use crate::error::{json_error_response, ErrorResponse, NodeError};
use crate::node::NodeSpec;
use crate::registry::{NodeRegistry, SwitchKind};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
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

fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new("INVALID_REQUEST", StatusCode::BAD_REQUEST, message).to_json();
    json_response(StatusCode::BAD_REQUEST, body)
}

fn unauthorized() -> Response<Full<Bytes>> {
    let body = ErrorResponse::new("UNAUTHORIZED", StatusCode::UNAUTHORIZED, "unauthorized").to_json();
    json_response(StatusCode::UNAUTHORIZED, body)
}

#[derive(Debug, Deserialize)]
struct AddNodeRequest {
    name: String,
    #[serde(flatten)]
    spec: NodeSpec,
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    from: String,
    to: String,
    #[serde(default)]
    confirm: bool,
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<NodeRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<NodeRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let registry = Arc::clone(&self.registry);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, registry, auth_token).await {
                                    debug!(addr = %peer, error = %e, "Admin connection error");
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
                        info!("Admin server shutting down");
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
    registry: Arc<NodeRegistry>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, registry, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
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

/// Read and deserialize a JSON request body
async fn read_json<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<Result<T, Response<Full<Bytes>>>, hyper::Error> {
    let body = req.collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid JSON: {}", e))))
}

fn node_result<T: serde::Serialize>(
    result: Result<T, NodeError>,
    status: StatusCode,
) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(body) => json_response(status, body),
            Err(e) => {
                error!(error = %e, "Failed to serialize admin response");
                response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },
        Err(e) => {
            debug!(code = e.as_code(), error = %e, "Admin operation failed");
            json_error_response(&e)
        }
    }
}

async fn handle_admin_request(
    req: Request<Incoming>,
    registry: Arc<NodeRegistry>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(unauthorized());
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        // List nodes: GET /nodes
        (&Method::GET, ["nodes"]) => node_result(Ok(registry.status()), StatusCode::OK),

        // Add a node: POST /nodes
        (&Method::POST, ["nodes"]) => match read_json::<AddNodeRequest>(req).await? {
            Ok(add) => {
                let result = registry.add(&add.name, add.spec).await;
                node_result(result, StatusCode::CREATED)
            }
            Err(resp) => resp,
        },

        // Modify an inactive node: PUT /nodes/{name}
        (&Method::PUT, ["nodes", name]) => {
            let name = name.to_string();
            match read_json::<NodeSpec>(req).await? {
                Ok(spec) => node_result(registry.modify(&name, spec).await, StatusCode::OK),
                Err(resp) => resp,
            }
        }

        // Remove an inactive node: DELETE /nodes/{name}
        (&Method::DELETE, ["nodes", name]) => match registry.remove(name).await {
            Ok(()) => response(StatusCode::NO_CONTENT, Bytes::new()),
            Err(e) => json_error_response(&e),
        },

        (&Method::POST, ["nodes", name, "activate"]) => {
            let result = registry.activate(name).await.map(|()| registry.get(name).map(|n| n.status()));
            node_result(result, StatusCode::OK)
        }

        (&Method::POST, ["nodes", name, "deactivate"]) => {
            let result = registry.deactivate(name).await.map(|()| registry.get(name).map(|n| n.status()));
            node_result(result, StatusCode::OK)
        }

        // Switch traffic: POST /switch {from, to, confirm}
        (&Method::POST, ["switch"]) => match read_json::<SwitchRequest>(req).await? {
            Ok(switch) => {
                let confirm = switch.confirm;
                let result = registry
                    .switch(&switch.from, &switch.to, |from, to| {
                        info!(
                            from = %from.name,
                            from_host = %from.host,
                            to = %to.name,
                            to_host = %to.host,
                            confirm,
                            "Cross-host switch requested"
                        );
                        confirm
                    })
                    .await;
                match result {
                    Ok(kind) => {
                        let mode = match kind {
                            SwitchKind::Handoff => "handoff",
                            SwitchKind::Cutover => "cutover",
                        };
                        let body = serde_json::json!({
                            "from": switch.from,
                            "to": switch.to,
                            "mode": mode,
                        });
                        let status = match kind {
                            SwitchKind::Handoff => StatusCode::OK,
                            SwitchKind::Cutover => StatusCode::ACCEPTED,
                        };
                        json_response(status, body.to_string())
                    }
                    Err(e) => json_error_response(&e),
                }
            }
            Err(resp) => resp,
        },

        // Upstream pool statistics: GET /stats
        (&Method::GET, ["stats"]) => {
            let pool = registry.pool();
            let stats = pool.stats();
            let body = serde_json::json!({
                "requests": stats.get_total_requests(),
                "health_checks": stats.get_health_checks(),
                "max_idle_per_host": pool.config().max_idle_per_host,
                "idle_timeout_secs": pool.config().idle_timeout.as_secs(),
                "nodes": registry.status().len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use crate::registry::LifecycleSettings;

    #[test]
    fn test_add_request_flattens_spec() {
        let req: AddNodeRequest = serde_json::from_str(
            r#"{"name":"blue","host":":9001","destination":"http://localhost:9100","health_path":"/health"}"#,
        )
        .unwrap();
        assert_eq!(req.name, "blue");
        assert_eq!(
            req.spec,
            NodeSpec::new(":9001", "http://localhost:9100", "/health")
        );
    }

    #[test]
    fn test_switch_confirm_defaults_to_false() {
        let req: SwitchRequest = serde_json::from_str(r#"{"from":"a","to":"b"}"#).unwrap();
        assert!(!req.confirm);
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown_signal() {
        let registry = NodeRegistry::new(
            Arc::new(ConnectionPool::default()),
            LifecycleSettings::default(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = AdminServer::new(
            "127.0.0.1:0".parse().unwrap(),
            registry,
            shutdown_rx,
            "token".to_string(),
        );
        assert_eq!(server.auth_token(), "token");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn(server.serve(listener));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
