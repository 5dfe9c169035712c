use modhub::access_log::AccessLog;
use modhub::config::Config;
use modhub::credentials;
use modhub::hub::Hub;
use modhub::process::ProcessLauncher;
use modhub::server::{self, HubServer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modhub=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("modhub.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    std::fs::create_dir_all(&config.mods_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create modules directory '{}': {}",
            config.mods_dir.display(),
            e
        )
    })?;

    let access_log = AccessLog::open(&config.access_log).map_err(|e| {
        anyhow::anyhow!(
            "Failed to open access log '{}': {}",
            config.access_log.display(),
            e
        )
    })?;

    let shared_secret = match config.secret.as_deref().map(str::trim) {
        Some(secret) if !secret.is_empty() => secret.to_string(),
        _ => credentials::load_or_generate_shared_secret(Path::new(credentials::SECRET_FILE))?,
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port)
        .parse()
        .map_err(|e| {
            error!(address = %config.server.address, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Load TLS configuration if enabled
    let tls_acceptor = match (&config.server.cert, &config.server.cert_key) {
        (Some(cert), Some(key)) => {
            let acceptor = server::tls_acceptor(cert, key)?;
            info!(cert = %cert, key = %key, "TLS enabled with provided certificates");
            Some(acceptor)
        }
        _ => None,
    };

    let scheme = if tls_acceptor.is_some() { "https" } else { "http" };
    let hub_url = format!("{}://127.0.0.1:{}", scheme, config.server.port);
    let launcher = Arc::new(ProcessLauncher::new(hub_url));

    let hub = Hub::new(config, shared_secret, launcher, Arc::new(access_log))?;

    // Spawn the supervisor
    let supervisor = Arc::clone(hub.supervisor());
    let supervisor_handle = tokio::spawn(supervisor.run(hub.subscribe_shutdown()));

    let mut server = HubServer::new(bind_addr, Arc::clone(&hub));
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }
    let listener = tokio::net::TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind listener");
        anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e)
    })?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Module setup runs in the background so the listener answers handshakes immediately
    let setup_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        setup_hub.load_modules().await;
    });

    wait_for_shutdown(&hub).await;
    hub.request_shutdown();

    let grace = hub.config().server.shutdown_grace() + Duration::from_secs(1);
    if tokio::time::timeout(grace, async {
        let _ = server_handle.await;
        let _ = supervisor_handle.await;
    })
    .await
    .is_err()
    {
        warn!("Shutdown did not complete within the grace period");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM, or a `Shutdown` command addressed to the hub
async fn wait_for_shutdown(hub: &Hub) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = hub.shutdown_signal() => info!("Shutdown command received, shutting down..."),
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = hub.shutdown_signal() => info!("Shutdown command received, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
            _ = hub.shutdown_signal() => info!("Shutdown command received, shutting down..."),
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = %config.name, package = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        address = %config.server.address,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
    info!(
        settle_delay_ms = config.handshake.settle_delay_ms,
        ping_attempts = config.handshake.ping_attempts,
        stale_after_secs = config.supervisor.stale_after_secs,
        "Liveness settings"
    );
    let mut modules: Vec<_> = config.modules.keys().collect();
    modules.sort();
    info!(module_count = modules.len(), modules = ?modules, "Configured modules");

    if let Some(motd) = &config.motd {
        match std::fs::read_to_string(motd) {
            Ok(text) => println!("{}", text.trim_end()),
            Err(e) => warn!(path = %motd.display(), error = %e, "Failed to read MOTD"),
        }
    }
}
