//! Nodeswitch - A reverse proxy whose endpoints can be switched live
//!
//! This library manages named proxy endpoints ("nodes") that:
//! - Forward every request to a fixed upstream destination
//! - Are health-probed and checked for host conflicts before they are added
//! - Can be activated, deactivated and removed at runtime
//! - Hand a listening socket to another node on the same host without closing it
//! - Shut down gracefully, force-closing connections after a deadline

pub mod admin;
pub mod config;
pub mod error;
pub mod host;
pub mod node;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod registry;
