//! Upstream HTTP client shared by all nodes
//!
//! Every node forwards through the same pooled client. The connector speaks
//! plain HTTP and HTTPS (rustls, webpki roots) and never consults proxy
//! environment variables, so upstream traffic always goes straight to the
//! destination URL.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::LOCATION;
use hyper::{Method, Request, Response, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream requests
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request (usually a malformed URL)
    RequestBuild(String),
    /// Error while reading the response body
    Body(hyper::Error),
    /// Redirect without a usable Location, or too many redirects
    Redirect(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
            PoolError::Body(e) => write!(f, "Body error: {}", e),
            PoolError::Redirect(s) => write!(f, "Redirect error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of forwarded requests
    pub total_requests: AtomicU64,
    /// Total number of health probe requests
    pub health_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Redirects followed by [`ConnectionPool::check`] before giving up
pub const MAX_REDIRECTS: usize = 10;

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
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

/// Pooled client for talking to upstream destinations
pub struct ConnectionPool {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);

        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .with_root_certificates(rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
        .with_no_client_auth();

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a body-less request and buffer the whole response
    pub async fn fetch(&self, method: Method, url: &str) -> Result<Response<Bytes>, PoolError> {
        let req = Request::builder()
            .method(method)
            .uri(url)
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(req).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await.map_err(PoolError::Body)?.to_bytes();

        Ok(Response::from_parts(parts, body))
    }

    /// GET `url` and return the final status, discarding bodies.
    ///
    /// Redirects (301, 302, 303, 307, 308) are followed up to
    /// [`MAX_REDIRECTS`] times, relative `Location`s resolved against the
    /// URL that produced them.
    pub async fn check(&self, url: &str) -> Result<StatusCode, PoolError> {
        self.stats.record_health_check();

        let mut current = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let req = Request::builder()
                .method(Method::GET)
                .uri(current.as_str())
                .body(Empty::<Bytes>::new())
                .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

            let response = self.client.request(req).await?;
            let status = response.status();
            if !is_redirect(status) {
                return Ok(status);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    PoolError::Redirect(format!("{} from {} without Location", status, current))
                })?;
            let next = url::Url::parse(&current)
                .and_then(|base| base.join(location))
                .map_err(|e| PoolError::Redirect(format!("bad Location {:?}: {}", location, e)))?;

            debug!(from = %current, to = %next, %status, "Following redirect");
            current = next.to_string();
        }

        Err(PoolError::Redirect(format!(
            "stopped after {} redirects",
            MAX_REDIRECTS
        )))
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
