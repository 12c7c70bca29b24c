//! Reachability probes that gate node creation and modification
//!
//! `probe_tcp` answers "is this port free?", so its result is inverted
//! compared to a usual connectivity check: a refused or timed-out connect
//! is success, an accepted connect is [`ProbeError::PortInUse`].

use crate::error::ProbeError;
use crate::host::dial_addr;
use crate::pool::ConnectionPool;
use hyper::StatusCode;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default connect timeout for [`probe_tcp`]
pub const DEFAULT_TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Succeeds only if a GET to `url`, after following redirects, answers with exactly 200
pub async fn probe_http(
    pool: &ConnectionPool,
    url: &str,
    timeout: Option<Duration>,
) -> Result<(), ProbeError> {
    let unreachable = |reason: String| ProbeError::Unreachable {
        url: url.to_string(),
        reason,
    };

    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, pool.check(url))
            .await
            .map_err(|_| unreachable(format!("no response within {}ms", limit.as_millis())))?,
        None => pool.check(url).await,
    };

    match result {
        Ok(StatusCode::OK) => {
            debug!(url, "HTTP probe passed");
            Ok(())
        }
        Ok(status) => {
            debug!(url, %status, "HTTP probe returned non-200 status");
            Err(unreachable(format!("status {}", status)))
        }
        Err(e) => {
            debug!(url, error = %e, "HTTP probe failed");
            Err(unreachable(e.to_string()))
        }
    }
}

/// Succeeds when nothing accepts connections on `address` within `timeout`
pub async fn probe_tcp(address: &str, timeout: Duration) -> Result<(), ProbeError> {
    let target = dial_addr(address);

    match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            debug!(address, "TCP probe connected, address in use");
            Err(ProbeError::PortInUse {
                address: address.to_string(),
            })
        }
        Ok(Err(e)) => {
            debug!(address, error = %e, "TCP probe refused, address free");
            Ok(())
        }
        Err(_) => {
            debug!(address, "TCP probe timed out, address free");
            Ok(())
        }
    }
}
