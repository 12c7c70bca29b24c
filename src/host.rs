//! Host address validation
//!
//! A node's `host` is a `host:port` string. An empty host binds every
//! interface; any other host must be a literal IP address owned by one of
//! this machine's interfaces.

use crate::error::NodeError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::debug;

/// Split `host:port` the way a standard address splitter does.
///
/// Accepts `host:port`, `:port` and `[v6]:port`. Rejects a missing port
/// separator, unbalanced brackets and unbracketed hosts containing colons.
/// The port is returned unparsed.
pub fn split_host_port(host_port: &str) -> Option<(&str, &str)> {
    let colon = host_port.rfind(':')?;
    let (host, port) = (&host_port[..colon], &host_port[colon + 1..]);

    let host = if let Some(inner) = host.strip_prefix('[') {
        // The closing bracket must sit right before the port separator
        let inner = inner.strip_suffix(']')?;
        if inner.contains('[') || inner.contains(']') {
            return None;
        }
        inner
    } else {
        if host.contains(':') || host.contains('[') || host.contains(']') {
            return None;
        }
        host
    };

    if port.contains('[') || port.contains(']') {
        return None;
    }

    Some((host, port))
}

/// Check that `host_port` is a syntactically valid address this machine can bind
pub fn is_valid_host(host_port: &str) -> bool {
    let Some((host, port)) = split_host_port(host_port) else {
        return false;
    };

    if port.parse::<u64>().is_err() {
        return false;
    }

    if host.is_empty() {
        return true;
    }

    let Ok(ip) = host.parse::<IpAddr>() else {
        debug!(host, "Host is not a literal IP address");
        return false;
    };

    local_addrs().contains(&ip)
}

/// Addresses currently assigned to this machine's network interfaces
#[cfg(unix)]
pub fn local_addrs() -> Vec<IpAddr> {
    use std::net::{SocketAddrV4, SocketAddrV6};

    let interfaces = match nix::ifaddrs::getifaddrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!(error = %e, "Failed to enumerate network interfaces");
            return Vec::new();
        }
    };

    let mut addrs = Vec::new();
    for interface in interfaces {
        let Some(address) = interface.address else {
            continue;
        };
        if let Some(v4) = address.as_sockaddr_in() {
            addrs.push(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
        } else if let Some(v6) = address.as_sockaddr_in6() {
            addrs.push(IpAddr::V6(*SocketAddrV6::from(*v6).ip()));
        }
    }
    addrs
}

#[cfg(not(unix))]
pub fn local_addrs() -> Vec<IpAddr> {
    Vec::new()
}

/// Socket address to bind for `host_port`; an empty host binds all IPv4 interfaces
pub fn bind_addr(host_port: &str) -> Result<SocketAddr, NodeError> {
    let invalid = || NodeError::Validation(format!("{} is not a valid bind address", host_port));

    let (host, port) = split_host_port(host_port).ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse().map_err(|_| invalid())?
    };

    Ok(SocketAddr::new(ip, port))
}

/// Address to dial when probing `host_port`; an empty host means this machine
pub fn dial_addr(host_port: &str) -> String {
    match split_host_port(host_port) {
        Some(("", port)) => format!("localhost:{}", port),
        Some((host, port)) if host.contains(':') => format!("[{}]:{}", host, port),
        _ => host_port.to_string(),
    }
}
