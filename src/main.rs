use nodeswitch::admin::{AdminServer, PKG_NAME, VERSION};
use nodeswitch::config::Config;
use nodeswitch::pool::ConnectionPool;
use nodeswitch::registry::NodeRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "nodeswitch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nodeswitch=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = Arc::new(ConnectionPool::new(config.pool.pool_config()));
    let registry = NodeRegistry::new(pool, config.lifecycle.settings());

    let admin_addr = config.admin_addr().map_err(|e| {
        error!(admin_bind = %config.server.admin_bind, error = %e, "Invalid admin bind address");
        e
    })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&registry), shutdown_rx, admin_token);

    // Spawn admin server
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all nodes
    info!("Stopping all nodes...");
    registry.shutdown_all().await;

    // Wait for the admin server to stop (with timeout)
    if tokio::time::timeout(Duration::from_secs(5), admin_handle).await.is_err() {
        warn!("Admin server did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load the file named on the command line, or the default file if present
fn load_config() -> anyhow::Result<Config> {
    let (config_path, explicit) = match std::env::args().nth(1) {
        Some(path) => (PathBuf::from(path), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    if !explicit && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        return Ok(Config::default());
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting node switch"
    );
    info!(
        admin_bind = %config.server.admin_bind,
        "Server configuration"
    );
    info!(
        shutdown_deadline_secs = config.lifecycle.shutdown_deadline_secs,
        tcp_probe_timeout_ms = config.lifecycle.tcp_probe_timeout_ms,
        http_probe_timeout_secs = ?config.lifecycle.http_probe_timeout_secs,
        "Lifecycle settings"
    );
    info!(
        pool_max_idle = config.pool.max_idle_per_host,
        pool_idle_timeout_secs = config.pool.idle_timeout_secs,
        "Connection pool settings"
    );
}
