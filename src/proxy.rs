//! Listening sockets owned by nodes
//!
//! A bound socket is split in two halves:
//! - [`ServerHandle`], the owner's side: where requests are routed and how to stop.
//!   It is not `Clone`, so exactly one node holds it at any time and a
//!   handoff between nodes is a move.
//! - [`BoundServer`], the accept loop, running on its own task until the
//!   handle asks it to stop.
//!
//! Requests read the handler slot once when they arrive. Re-pointing the slot
//! is therefore the single cutover point of a handoff: the listener is never
//! closed and every request is served by exactly one node.

use crate::node::Node;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause before accepting again after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle signal sent from a [`ServerHandle`] to its accept loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSignal {
    Running,
    /// Stop accepting and let open connections finish
    Drain,
    /// Close every remaining connection now
    Abort,
}

/// The node currently answering requests on a socket
type HandlerSlot = Arc<RwLock<Arc<Node>>>;

/// Exclusive ownership of a bound socket and its request handler
pub struct ServerHandle {
    local_addr: SocketAddr,
    handler: HandlerSlot,
    signal: watch::Sender<ServeSignal>,
    stopped: watch::Receiver<bool>,
}

/// The accept loop of a bound socket
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: HandlerSlot,
    signal: watch::Receiver<ServeSignal>,
    stopped: watch::Sender<bool>,
}

/// Bind `addr` with `node` installed as the handler
pub async fn bind(addr: SocketAddr, node: Arc<Node>) -> std::io::Result<(ServerHandle, BoundServer)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let handler = Arc::new(RwLock::new(node));
    let (signal_tx, signal_rx) = watch::channel(ServeSignal::Running);
    let (stopped_tx, stopped_rx) = watch::channel(false);

    let handle = ServerHandle {
        local_addr,
        handler: Arc::clone(&handler),
        signal: signal_tx,
        stopped: stopped_rx,
    };
    let server = BoundServer {
        listener,
        local_addr,
        handler,
        signal: signal_rx,
        stopped: stopped_tx,
    };

    Ok((handle, server))
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Route all subsequent requests on this socket to `node`
    pub(crate) fn install(&self, node: Arc<Node>) {
        *self.handler.write() = node;
    }

    /// Stop the socket: close the listener at once, wait up to `deadline` for
    /// open connections, then force-close whatever is left.
    ///
    /// Returns `true` if every connection finished within the deadline.
    pub async fn stop(self, deadline: Duration) -> bool {
        let ServerHandle {
            local_addr,
            signal,
            mut stopped,
            ..
        } = self;

        let _ = signal.send(ServeSignal::Drain);

        let drained = tokio::time::timeout(deadline, wait_until(&mut stopped, |done| done))
            .await
            .is_ok();

        if !drained {
            warn!(
                addr = %local_addr,
                deadline_secs = deadline.as_secs_f64(),
                "Shutdown deadline elapsed, forcing connections closed"
            );
            let _ = signal.send(ServeSignal::Abort);
            wait_until(&mut stopped, |done| done).await;
        }

        drained
    }
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections until the owning handle stops the socket
    pub async fn run(self) {
        let BoundServer {
            listener,
            local_addr,
            handler,
            mut signal,
            stopped,
        } = self;

        info!(addr = %local_addr, "Node listener accepting connections");

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&handler);
                            let drain = signal.clone();
                            connections.spawn(serve_connection(stream, peer, handler, drain));
                        }
                        Err(e) => {
                            error!(addr = %local_addr, error = %e, "Failed to accept connection");
                            // Persistent errors such as EMFILE must not spin the loop
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = signal.changed() => {
                    if changed.is_err() || *signal.borrow_and_update() != ServeSignal::Running {
                        break;
                    }
                }
            }
        }

        drop(listener);
        debug!(addr = %local_addr, open = connections.len(), "Listener closed, draining connections");

        loop {
            if *signal.borrow_and_update() == ServeSignal::Abort {
                connections.abort_all();
                break;
            }
            tokio::select! {
                next = connections.join_next() => {
                    if next.is_none() {
                        break;
                    }
                }
                changed = signal.changed() => {
                    if changed.is_err() {
                        connections.abort_all();
                        break;
                    }
                }
            }
        }

        while connections.join_next().await.is_some() {}

        info!(addr = %local_addr, "Node listener closed");
        let _ = stopped.send(true);
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: HandlerSlot,
    mut drain: watch::Receiver<ServeSignal>,
) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let node = Arc::clone(&*handler.read());
        async move { Ok::<_, Infallible>(node.forward(req).await) }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection error");
            }
        }
        _ = wait_until(&mut drain, |signal| signal != ServeSignal::Running) => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!(peer = %peer, error = %e, "Connection error while draining");
            }
        }
    }
}

/// Wait until the watched value satisfies `done`, or the sender goes away
async fn wait_until<T: Copy>(rx: &mut watch::Receiver<T>, done: impl Fn(T) -> bool) {
    while !done(*rx.borrow_and_update()) {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
