use crate::pool::PoolConfig;
use crate::registry::LifecycleSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Process configuration. Nodes are managed at runtime and never stored here.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Probe and shutdown timing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Upstream connection pool
    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address of the admin API (default: 127.0.0.1:9999)
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Authentication token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_bind: default_admin_bind(),
            admin_token: None,
        }
    }
}

fn default_admin_bind() -> String {
    "127.0.0.1:9999".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Grace period for open connections when a node stops serving (default: 10)
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,

    /// Connect timeout of the port-in-use probe (default: 1000)
    #[serde(default = "default_tcp_probe_timeout")]
    pub tcp_probe_timeout_ms: u64,

    /// Limit on the HTTP health probe (default: none)
    pub http_probe_timeout_secs: Option<u64>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_deadline_secs: default_shutdown_deadline(),
            tcp_probe_timeout_ms: default_tcp_probe_timeout(),
            http_probe_timeout_secs: None,
        }
    }
}

fn default_shutdown_deadline() -> u64 {
    10
}

fn default_tcp_probe_timeout() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl LifecycleConfig {
    pub fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            shutdown_deadline: Duration::from_secs(self.shutdown_deadline_secs),
            tcp_probe_timeout: Duration::from_millis(self.tcp_probe_timeout_ms),
            http_probe_timeout: self.http_probe_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.max_idle_per_host,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.admin_bind.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.admin_bind '{}' is not a socket address",
                self.server.admin_bind
            ));
        }

        if self.lifecycle.shutdown_deadline_secs == 0 {
            errors.push("lifecycle.shutdown_deadline_secs must be greater than 0".to_string());
        }

        if self.lifecycle.tcp_probe_timeout_ms == 0 {
            errors.push("lifecycle.tcp_probe_timeout_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Parsed admin API address; only valid after [`Config::validate`]
    pub fn admin_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.admin_bind.parse()?)
    }
}
