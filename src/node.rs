//! Proxy nodes and their lifecycle
//!
//! A [`Node`] forwards every request it receives to `destination + path`.
//! It is either inactive (no socket) or active (it owns the [`ServerHandle`]
//! of a bound socket whose handler slot points back at it). Transitions:
//!
//! - `serve`: bind a fresh socket and run it until shut down
//! - `shutdown`: stop the socket gracefully, bounded by the shutdown deadline
//! - `switch_to`: hand the socket to another node on the same host, no rebind
//! - `shutdown_and_serve`: stop this socket, then bind one for another node

use crate::error::{status_text_response, NodeError};
use crate::host;
use crate::pool::ConnectionPool;
use crate::proxy::{self, BoundServer, ServerHandle};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default grace period for in-flight connections when a node shuts down
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// User-supplied definition of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Bind address, `host:port`; an empty host binds all interfaces
    pub host: String,
    /// Upstream base URL requests are forwarded to
    pub destination: String,
    /// Path appended to `destination` for health probing
    pub health_path: String,
}

impl NodeSpec {
    pub fn new(host: &str, destination: &str, health_path: &str) -> Self {
        Self {
            host: host.to_string(),
            destination: destination.to_string(),
            health_path: health_path.to_string(),
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.destination, self.health_path)
    }
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub host: String,
    pub destination: String,
    pub health_path: String,
    pub active: bool,
    /// Requests currently being forwarded
    pub requests: usize,
    /// Last upstream status, 500 after a local failure, 0 before any request
    pub last_status: u16,
}

struct NodeState {
    active: bool,
    server: Option<ServerHandle>,
}

/// A named proxy endpoint
pub struct Node {
    name: String,
    spec: NodeSpec,
    pool: Arc<ConnectionPool>,
    shutdown_deadline: Duration,
    state: RwLock<NodeState>,
    in_flight: AtomicUsize,
    last_status: AtomicU16,
}

/// Counts one forwarded request for as long as it is alive
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Node {
    pub fn new(
        name: &str,
        spec: NodeSpec,
        pool: Arc<ConnectionPool>,
        shutdown_deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            spec,
            pool,
            shutdown_deadline,
            state: RwLock::new(NodeState {
                active: false,
                server: None,
            }),
            in_flight: AtomicUsize::new(0),
            last_status: AtomicU16::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    /// Number of requests currently being forwarded
    pub fn requests(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_status(&self) -> u16 {
        self.last_status.load(Ordering::Relaxed)
    }

    /// Address of the socket this node currently owns
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.read().server.as_ref().map(ServerHandle::local_addr)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.name.clone(),
            host: self.spec.host.clone(),
            destination: self.spec.destination.clone(),
            health_path: self.spec.health_path.clone(),
            active: self.is_active(),
            requests: self.requests(),
            last_status: self.last_status(),
        }
    }

    /// Bind a new socket at this node's host and take ownership of it.
    ///
    /// The node is active once this returns; the returned accept loop must
    /// be run for requests to be served.
    pub async fn bind(self: &Arc<Self>) -> Result<BoundServer, NodeError> {
        if self.state.read().server.is_some() {
            return Err(NodeError::Conflict(format!(
                "node {} already owns a socket",
                self.name
            )));
        }

        let addr = host::bind_addr(&self.spec.host)?;
        let (handle, server) = proxy::bind(addr, Arc::clone(self))
            .await
            .map_err(|source| NodeError::Bind {
                host: self.spec.host.clone(),
                source,
            })?;

        let mut state = self.state.write();
        state.active = true;
        state.server = Some(handle);
        drop(state);

        info!(node = %self.name, addr = %server.local_addr(), "Node bound");
        Ok(server)
    }

    /// Bind and serve until the socket is shut down.
    ///
    /// Meant to be spawned; the socket closing because of a shutdown is the
    /// normal way for this to return.
    pub async fn serve(self: Arc<Self>) -> Result<(), NodeError> {
        let server = self.bind_or_deactivate().await?;
        server.run().await;
        debug!(node = %self.name, "Server closed");
        Ok(())
    }

    /// Like [`Node::bind`], but a failed bind leaves the node inactive
    async fn bind_or_deactivate(self: &Arc<Self>) -> Result<BoundServer, NodeError> {
        match self.bind().await {
            Ok(server) => Ok(server),
            Err(e) => {
                let mut state = self.state.write();
                if state.server.is_none() {
                    state.active = false;
                }
                drop(state);
                error!(node = %self.name, host = %self.spec.host, error = %e, "Failed to serve node");
                Err(e)
            }
        }
    }

    /// Stop serving, waiting up to the shutdown deadline for open connections.
    ///
    /// In-flight requests are not awaited beyond that deadline; whatever is
    /// still open afterwards is closed. Returns `false` if the node had no
    /// socket to stop.
    pub async fn shutdown(&self) -> bool {
        let handle = {
            let mut state = self.state.write();
            state.active = false;
            state.server.take()
        };

        let Some(handle) = handle else {
            debug!(node = %self.name, "Shutdown requested for node without a socket");
            return false;
        };

        let addr = handle.local_addr();
        info!(node = %self.name, addr = %addr, in_flight = self.requests(), "Shutting down node");

        let graceful = handle.stop(self.shutdown_deadline).await;
        if graceful {
            info!(node = %self.name, addr = %addr, "Node shut down");
        } else {
            warn!(node = %self.name, addr = %addr, "Node shut down after forcing connections closed");
        }
        true
    }

    /// Hand this node's socket to `other` without closing it.
    ///
    /// Both nodes must share the same host. The handler swap is the only
    /// point at which requests move from this node to `other`.
    pub fn switch_to(self: &Arc<Self>, other: &Arc<Node>) -> Result<(), NodeError> {
        if Arc::ptr_eq(self, other) {
            return Err(NodeError::Conflict(format!(
                "cannot switch node {} to itself",
                self.name
            )));
        }
        if self.spec.host != other.spec.host {
            return Err(NodeError::Conflict(format!(
                "node {} host({}) differs from node {} host({})",
                self.name, self.spec.host, other.name, other.spec.host
            )));
        }

        let (mut mine, mut theirs) = lock_pair(self, other);

        if theirs.active || theirs.server.is_some() {
            return Err(NodeError::Conflict(format!(
                "node {} is already active",
                other.name
            )));
        }

        let handle = mine.server.take().ok_or_else(|| {
            NodeError::Conflict(format!("node {} is not serving", self.name))
        })?;

        handle.install(Arc::clone(other));
        let addr = handle.local_addr();
        theirs.server = Some(handle);
        theirs.active = true;
        mine.active = false;

        info!(from = %self.name, to = %other.name, addr = %addr, "Socket handed over");
        Ok(())
    }

    /// Shut this node down, then bind and serve `other` on its own host.
    ///
    /// Blocks for the whole lifetime of `other`'s socket, like [`Node::serve`].
    pub async fn shutdown_and_serve(self: Arc<Self>, other: Arc<Node>) -> Result<(), NodeError> {
        let server = self.cutover(&other).await?;
        server.run().await;
        debug!(node = %other.name, "Server closed");
        Ok(())
    }

    /// First half of [`Node::shutdown_and_serve`]: stop this node and bind
    /// `other`, returning its accept loop without running it.
    pub async fn cutover(self: &Arc<Self>, other: &Arc<Node>) -> Result<BoundServer, NodeError> {
        if Arc::ptr_eq(self, other) {
            return Err(NodeError::Conflict(format!(
                "cannot switch node {} to itself",
                self.name
            )));
        }

        self.shutdown().await;

        {
            let (mut mine, mut theirs) = lock_pair(self, other);
            theirs.active = true;
            mine.active = false;
        }

        info!(from = %self.name, to = %other.name, host = %other.spec.host, "Cutting over to new socket");
        other.bind_or_deactivate().await
    }

    /// Forward one inbound request upstream and relay the answer
    pub async fn forward(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let _in_flight = InFlight::enter(&self.in_flight);

        // Only method and path travel upstream
        let method = req.method().clone();
        let url = format!("{}{}", self.spec.destination, req.uri().path());
        drop(req);

        match self.pool.fetch(method.clone(), &url).await {
            Ok(upstream) => {
                let (parts, body) = upstream.into_parts();

                let mut response = Response::new(Full::new(body));
                *response.status_mut() = parts.status;
                for name in parts.headers.keys() {
                    // Repeated headers collapse to their first value
                    if let Some(value) = parts.headers.get(name) {
                        response.headers_mut().insert(name.clone(), value.clone());
                    }
                }

                self.last_status
                    .store(parts.status.as_u16(), Ordering::Relaxed);
                debug!(node = %self.name, %method, url = %url, status = %parts.status, "Request forwarded");
                response
            }
            Err(e) => {
                warn!(node = %self.name, %method, url = %url, error = %e, "Failed to forward request");
                self.last_status.store(
                    StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    Ordering::Relaxed,
                );
                status_text_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Write-lock two distinct nodes in name order, returning the guards as (a, b)
fn lock_pair<'a>(
    a: &'a Node,
    b: &'a Node,
) -> (
    RwLockWriteGuard<'a, NodeState>,
    RwLockWriteGuard<'a, NodeState>,
) {
    if a.name <= b.name {
        let first = a.state.write();
        let second = b.state.write();
        (first, second)
    } else {
        let first = b.state.write();
        let second = a.state.write();
        (second, first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(name: &str, host: &str) -> Arc<Node> {
        Node::new(
            name,
            NodeSpec::new(host, "http://127.0.0.1:1", "/health"),
            Arc::new(ConnectionPool::default()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_new_node_is_inactive() {
        let node = test_node("blue", "127.0.0.1:0");
        let status = node.status();

        assert_eq!(status.name, "blue");
        assert_eq!(status.host, "127.0.0.1:0");
        assert_eq!(status.health_path, "/health");
        assert!(!status.active);
        assert_eq!(status.requests, 0);
        assert_eq!(status.last_status, 0);
        assert!(node.local_addr().is_none());
    }

    #[test]
    fn test_health_url() {
        let spec = NodeSpec::new(":9001", "http://localhost:9100", "/health");
        assert_eq!(spec.health_url(), "http://localhost:9100/health");
    }

    #[test]
    fn test_in_flight_guard() {
        let counter = AtomicUsize::new(0);
        {
            let _a = InFlight::enter(&counter);
            let _b = InFlight::enter(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lock_pair_returns_guards_in_argument_order() {
        let zeta = test_node("zeta", "127.0.0.1:0");
        let alpha = test_node("alpha", "127.0.0.1:0");

        let (mut z, a) = lock_pair(&zeta, &alpha);
        z.active = true;
        assert!(!a.active);
        drop((z, a));

        assert!(zeta.is_active());
        assert!(!alpha.is_active());
    }

    #[tokio::test]
    async fn test_shutdown_without_socket() {
        let node = test_node("blue", "127.0.0.1:0");
        assert!(!node.shutdown().await);
        assert!(!node.is_active());
    }

    #[tokio::test]
    async fn test_switch_requires_serving_node() {
        let blue = test_node("blue", "127.0.0.1:0");
        let green = test_node("green", "127.0.0.1:0");

        let err = blue.switch_to(&green).unwrap_err();
        assert!(matches!(err, NodeError::Conflict(_)));
        assert!(!green.is_active());
    }

    #[tokio::test]
    async fn test_switch_rejects_different_hosts() {
        let blue = test_node("blue", "127.0.0.1:0");
        let green = test_node("green", ":0");

        assert!(matches!(
            blue.switch_to(&green),
            Err(NodeError::Conflict(_))
        ));
        assert!(matches!(blue.switch_to(&blue), Err(NodeError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_bind_switch_and_shutdown() {
        let blue = test_node("blue", "127.0.0.1:0");
        let green = test_node("green", "127.0.0.1:0");

        let server = blue.bind().await.unwrap();
        let addr = server.local_addr();
        let serving = tokio::spawn(server.run());
        assert!(blue.is_active());
        assert_eq!(blue.local_addr(), Some(addr));

        // Handoff in both name orders exercises both lock orders
        blue.switch_to(&green).unwrap();
        assert!(!blue.is_active());
        assert!(green.is_active());
        assert_eq!(green.local_addr(), Some(addr));
        assert!(blue.local_addr().is_none());

        green.switch_to(&blue).unwrap();
        assert!(blue.is_active());
        assert!(!green.is_active());

        assert!(blue.shutdown().await);
        assert!(!blue.is_active());
        assert!(blue.local_addr().is_none());
        serving.await.unwrap();

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_twice_conflicts() {
        let blue = test_node("blue", "127.0.0.1:0");
        let server = blue.bind().await.unwrap();
        let serving = tokio::spawn(server.run());

        assert!(matches!(blue.bind().await, Err(NodeError::Conflict(_))));

        blue.shutdown().await;
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = taken.local_addr().unwrap().to_string();
        let node = test_node("blue", &host);

        let err = node.clone().serve().await.unwrap_err();
        assert!(matches!(err, NodeError::Bind { .. }));
        assert!(!node.is_active());
    }
}
