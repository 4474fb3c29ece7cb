use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subroute::admin::{AdminServer, PKG_NAME, VERSION};
use subroute::config::Config;
use subroute::docker::DockerOrchestrator;
use subroute::ingest::{IngestSettings, Ingestor};
use subroute::pool::PoolConfig;
use subroute::proxy::{ForwardSettings, ProxyServer};
use subroute::registry::ServiceRegistry;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("subroute=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if explicit_path.is_none() && !config_path.exists() {
        info!("No config.toml found, using built-in defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = DockerOrchestrator::connect(config.docker.host.as_deref())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Docker");
            e
        })?;

    let registry = ServiceRegistry::shared();
    let ingestor = Arc::new(Ingestor::new(
        Arc::new(orchestrator),
        Arc::clone(&registry),
        IngestSettings::from(&config.docker),
    ));
    let ingest_status = ingestor.status();

    let ingest_shutdown = shutdown_rx.clone();
    let ingest_runner = Arc::clone(&ingestor);
    let mut ingest_handle =
        tokio::spawn(async move { ingest_runner.run(ingest_shutdown).await });

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        connect_timeout: config.proxy.connect_timeout(),
    };

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_config(
        proxy_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
        pool_config,
        ForwardSettings::from(&config.proxy),
    );
    let proxy_listener = proxy.bind().await.map_err(|e| {
        error!(error = %e, "Proxy server cannot listen");
        e
    })?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(proxy_listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        // Status API is always local-only plain HTTP
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&registry),
            ingest_status,
            shutdown_rx.clone(),
            admin_token,
        );
        let admin_listener = admin_server.bind().await.map_err(|e| {
            error!(error = %e, "Status API cannot listen");
            e
        })?;
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.serve(admin_listener).await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Status API disabled");
        None
    };

    // Wait for a shutdown signal or for the ingestor to give up
    let mut exit_error = None;
    let mut ingest_finished = false;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

    #[cfg(unix)]
    let terminate = sigterm.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut ingest_handle => {
            ingest_finished = true;
            match result {
                Ok(Ok(())) => info!("Event ingestion stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "Event ingestion failed, shutting down");
                    exit_error = Some(anyhow::Error::new(e));
                }
                Err(e) => {
                    error!(error = %e, "Event ingestion task panicked");
                    exit_error = Some(anyhow::anyhow!("ingest task failed: {}", e));
                }
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for everything to stop (with timeout)
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        if !ingest_finished {
            let _ = ingest_handle.await;
        }
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    if stopped.is_err() {
        error!("Timed out waiting for tasks to stop");
    }

    info!(routes = registry.len(), "Shutdown complete");

    match exit_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting subdomain router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        request_timeout_secs = config.proxy.request_timeout_secs,
        connect_timeout_ms = config.proxy.connect_timeout_ms,
        upgrade_timeout_secs = config.proxy.upgrade_timeout_secs,
        upgrade_max_lifetime_secs = ?config.proxy.upgrade_max_lifetime_secs,
        change_origin = config.proxy.change_origin,
        "Request handling settings"
    );
    info!(
        docker_host = ?config.docker.host,
        network = ?config.docker.network,
        port_label = %config.docker.port_label,
        max_resubscribe_attempts = config.docker.max_resubscribe_attempts,
        "Docker settings"
    );
}
