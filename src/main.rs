use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tunnelctl::api::{ApiServer, PKG_NAME, VERSION};
use tunnelctl::config::{ClientMode, Config};
use tunnelctl::driver::resolve_program;
use tunnelctl::service::TunnelService;

const DEFAULT_CONFIG: &str = "tunnelctl.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunnelctl=debug".parse()?),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file, using defaults");
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

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = TunnelService::from_config(&config);

    recover(&config, &service).await;

    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let api_server = ApiServer::new(
        api_addr,
        Arc::clone(&service),
        shutdown_rx,
        config.server.auth_token.clone(),
    );

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, re-applying tunnel set...");
                    match service.apply_and_reload().await {
                        Ok(outcome) => info!(?outcome, "Tunnel set re-applied"),
                        Err(e) => error!(error = %e, "Failed to re-apply tunnel set"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // frpc is left running; the next instance adopts it through the PID file
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Bring frpc back in line with persisted state after a restart
async fn recover(config: &Config, service: &TunnelService) {
    if let Some(session) = service.sessions().load() {
        info!(email = %session.user_email, server_url = %session.server_url, "Restored session");
    }

    if config.client.mode == ClientMode::Subprocess {
        let binary = Path::new(&config.client.binary);
        match resolve_program(binary) {
            Some(path) => info!(path = %path.display(), "frpc binary found"),
            None => warn!(binary = %binary.display(), "frpc binary not found, start will fail"),
        }
    }

    // Reconciles the PID file with the process table
    let status = service.status().await;
    info!(state = %status.state, pid = ?status.pid, "frpc state on startup");

    match service.ensure_running().await {
        Ok(true) => info!("Auto-started frpc"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Auto-start failed"),
    }
}

fn print_startup_banner(config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        auth = config.server.auth_token.is_some(),
        "Control API"
    );
    info!(
        mode = %config.client.mode,
        binary = %config.client.binary,
        config_path = %config.client.config_path,
        pid_file = %config.client.pid_file,
        server_port = config.client.server_port,
        "frpc client"
    );
    if config.client.mode == ClientMode::Admin {
        info!(admin_url = %config.client.admin_url, "frpc admin API");
    }
    info!(
        kind = ?config.store.kind,
        server_url = ?config.store.server_url,
        "Tunnel store"
    );
    match config.credentials.path() {
        Some(path) => info!(path = %path.display(), "Credentials persisted"),
        None => info!("Credentials kept in memory only"),
    }
    info!("========================================");
}
