//! Name-keyed collection of nodes
//!
//! The registry enforces the rules that span nodes: names are unique and at
//! most one active node serves any given host. Every mutating operation holds
//! one coarse operation lock from its first check to its last state change,
//! probes included, so concurrent operators cannot interleave between a gate
//! and the mutation it guards.

use crate::error::NodeError;
use crate::host::is_valid_host;
use crate::node::{Node, NodeSpec, NodeStatus, DEFAULT_SHUTDOWN_DEADLINE};
use crate::pool::ConnectionPool;
use crate::probe::{probe_http, probe_tcp, DEFAULT_TCP_PROBE_TIMEOUT};
use crate::proxy::BoundServer;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Timeouts governing probes and shutdowns
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Grace period for open connections when a node stops serving
    pub shutdown_deadline: Duration,
    /// Connect timeout of the port-in-use probe
    pub tcp_probe_timeout: Duration,
    /// Optional limit on the HTTP health probe; `None` leaves it to the client
    pub http_probe_timeout: Option<Duration>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            tcp_probe_timeout: DEFAULT_TCP_PROBE_TIMEOUT,
            http_probe_timeout: None,
        }
    }
}

/// How a switch was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    /// Same host: the socket was handed over without closing
    Handoff,
    /// Different host: the old socket is shutting down and a new one will be
    /// bound in the background
    Cutover,
}

/// All nodes known to this process
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<Node>>,
    ops: Arc<Mutex<()>>,
    pool: Arc<ConnectionPool>,
    settings: LifecycleSettings,
}

impl NodeRegistry {
    /// Create an empty registry.
    ///
    /// Returns `Arc<Self>` since the registry is shared between the operator
    /// interface and background serving tasks.
    pub fn new(pool: Arc<ConnectionPool>, settings: LifecycleSettings) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            ops: Arc::new(Mutex::new(())),
            pool,
            settings,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).map(|n| Arc::clone(n.value()))
    }

    fn lookup(&self, name: &str) -> Result<Arc<Node>, NodeError> {
        self.get(name)
            .ok_or_else(|| NodeError::NotFound(name.to_string()))
    }

    async fn lock_ops(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.ops).lock_owned().await
    }

    /// Active node other than `except` currently serving `host`
    fn active_on_host(&self, host: &str, except: Option<&str>) -> Option<String> {
        self.nodes.iter().find_map(|entry| {
            let node = entry.value();
            let skipped = except.is_some_and(|name| name == node.name());
            (!skipped && node.is_active() && node.host() == host).then(|| node.name().to_string())
        })
    }

    /// Gates shared by add and modify
    async fn check_spec(&self, spec: &NodeSpec) -> Result<(), NodeError> {
        probe_http(&self.pool, &spec.health_url(), self.settings.http_probe_timeout).await?;

        if !is_valid_host(&spec.host) {
            return Err(NodeError::Validation(format!(
                "{} is not a valid local host",
                spec.host
            )));
        }

        if let Some(owner) = self.active_on_host(&spec.host, None) {
            return Err(NodeError::Conflict(format!(
                "host {} already in use by node {}",
                spec.host, owner
            )));
        }

        probe_tcp(&spec.host, self.settings.tcp_probe_timeout).await?;
        Ok(())
    }

    fn new_node(&self, name: &str, spec: NodeSpec) -> Arc<Node> {
        Node::new(
            name,
            spec,
            Arc::clone(&self.pool),
            self.settings.shutdown_deadline,
        )
    }

    /// Register a new, inactive node after probing its destination and host
    pub async fn add(&self, name: &str, spec: NodeSpec) -> Result<NodeStatus, NodeError> {
        let _ops = self.lock_ops().await;

        if self.nodes.contains_key(name) {
            return Err(NodeError::Conflict(format!("node {} already exists", name)));
        }

        self.check_spec(&spec).await?;

        let node = self.new_node(name, spec);
        let status = node.status();
        self.nodes.insert(name.to_string(), node);

        info!(node = name, host = %status.host, destination = %status.destination, "Node added");
        Ok(status)
    }

    /// Replace the definition of an inactive node
    pub async fn modify(&self, name: &str, spec: NodeSpec) -> Result<NodeStatus, NodeError> {
        let _ops = self.lock_ops().await;

        let existing = self.lookup(name)?;
        if existing.is_active() {
            return Err(NodeError::Conflict(format!(
                "node {} is currently active",
                name
            )));
        }

        self.check_spec(&spec).await?;

        let node = self.new_node(name, spec);
        let status = node.status();
        self.nodes.insert(name.to_string(), node);

        info!(node = name, host = %status.host, destination = %status.destination, "Node modified");
        Ok(status)
    }

    /// Bind the node's host and start serving in the background
    pub async fn activate(&self, name: &str) -> Result<(), NodeError> {
        let _ops = self.lock_ops().await;

        let node = self.lookup(name)?;
        if let Some(owner) = self.active_on_host(node.host(), None) {
            return Err(NodeError::Conflict(format!(
                "node {} with same host {} already active",
                owner,
                node.host()
            )));
        }

        let server = node.bind().await?;
        spawn_server(server);

        info!(node = name, host = %node.host(), "Node activated");
        Ok(())
    }

    /// Move traffic from one node to another.
    ///
    /// Nodes on the same host swap the live socket. Across hosts the old
    /// socket is shut down and a new one bound, which only happens if
    /// `confirm` approves; it runs in the background and keeps further
    /// operations waiting until it has finished.
    pub async fn switch<F>(&self, from: &str, to: &str, confirm: F) -> Result<SwitchKind, NodeError>
    where
        F: FnOnce(&NodeStatus, &NodeStatus) -> bool,
    {
        let ops = self.lock_ops().await;

        let source = self.lookup(from)?;
        let target = self.lookup(to)?;

        if from == to {
            return Err(NodeError::Conflict(format!(
                "cannot switch node {} to itself",
                from
            )));
        }
        if !source.is_active() {
            return Err(NodeError::Conflict(format!(
                "node {} is currently not active, switching from inactive node not possible",
                from
            )));
        }
        if target.is_active() {
            return Err(NodeError::Conflict(format!("node {} is already active", to)));
        }

        if source.host() == target.host() {
            source.switch_to(&target)?;
            info!(from, to, host = %target.host(), "Switched nodes");
            return Ok(SwitchKind::Handoff);
        }

        if let Some(owner) = self.active_on_host(target.host(), Some(from)) {
            return Err(NodeError::Conflict(format!(
                "host {} already in use by node {}",
                target.host(),
                owner
            )));
        }

        if !confirm(&source.status(), &target.status()) {
            warn!(from, to, "Switch across hosts not confirmed");
            return Err(NodeError::Aborted {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        info!(
            from,
            to,
            from_host = %source.host(),
            to_host = %target.host(),
            "Cutting over to a different host"
        );

        tokio::spawn(async move {
            // Further operations wait until the new socket is bound or has failed
            let server = match source.cutover(&target).await {
                Ok(server) => server,
                Err(e) => {
                    error!(node = %target.name(), error = %e, "Cutover failed");
                    return;
                }
            };
            drop(ops);

            run_server(server).await;
        });

        Ok(SwitchKind::Cutover)
    }

    /// Stop serving a node; a no-op for inactive nodes
    pub async fn deactivate(&self, name: &str) -> Result<(), NodeError> {
        let _ops = self.lock_ops().await;

        let node = self.lookup(name)?;
        if node.shutdown().await {
            info!(node = name, "Node deactivated");
        } else {
            warn!(node = name, "Node was not active");
        }
        Ok(())
    }

    /// Forget an inactive node
    pub async fn remove(&self, name: &str) -> Result<(), NodeError> {
        let _ops = self.lock_ops().await;

        let node = self.lookup(name)?;
        if node.is_active() {
            return Err(NodeError::Conflict(format!(
                "node {} is currently active",
                name
            )));
        }

        self.nodes.remove(name);
        info!(node = name, "Node removed");
        Ok(())
    }

    /// Snapshot of every node, sorted by name
    pub fn status(&self) -> Vec<NodeStatus> {
        let mut statuses: Vec<NodeStatus> = self.nodes.iter().map(|n| n.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Shut down every active node
    pub async fn shutdown_all(&self) {
        let _ops = self.lock_ops().await;

        let nodes: Vec<Arc<Node>> = self.nodes.iter().map(|n| Arc::clone(n.value())).collect();
        for node in nodes {
            if node.shutdown().await {
                info!(node = %node.name(), "Node stopped");
            }
        }
    }
}

/// Run a socket's accept loop until it is stopped.
///
/// The socket can change owners through handoffs, so it is logged by address.
async fn run_server(server: BoundServer) {
    let addr = server.local_addr();
    server.run().await;
    info!(addr = %addr, "Node server closed");
}

fn spawn_server(server: BoundServer) -> JoinHandle<()> {
    tokio::spawn(run_server(server))
}
