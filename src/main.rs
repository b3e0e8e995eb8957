//! portmux - multi-tenant, multi-port proxy server
//!
//! Serves many access keys over a dynamic set of ports and converges the
//! bound ports on the access-key file at startup, on SIGHUP, on file changes
//! and through the admin API.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portmux::{
    config::{ConfigManager, ConfigWatcher, ServerSettings, StopPolicy},
    management::{AppState, ManagementServer},
    metrics::{PrometheusMetrics, ProxyMetrics},
    service::{PreambleMatcher, ServiceContext},
    shutdown::reload_on_hangup,
    PortOrchestrator, ShutdownCoordinator,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI arguments for portmux
#[derive(Parser, Debug)]
#[command(name = "portmux")]
#[command(about = "portmux - multi-tenant, multi-port proxy server")]
#[command(version)]
#[command(long_about = "
portmux - multi-tenant, multi-port proxy server

Every access key names a port; all keys sharing a port share one TCP
listener and one UDP socket. Sending SIGHUP re-reads the access-key file.

Settings priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Built-in defaults

Environment variables:
  PORTMUX_CONFIG           - Access-key file (default config.yml)
  PORTMUX_ADMIN_ADDR       - Admin API address (e.g., 127.0.0.1:8080)
  PORTMUX_LISTEN_IP        - Address every port binds on
  PORTMUX_TCP_READ_TIMEOUT - Handshake read deadline (e.g., 59s)
  PORTMUX_CONNECT_TIMEOUT  - Upstream connect deadline (e.g., 10s)
  PORTMUX_REPLAY_HISTORY   - Salts remembered for replay detection
  PORTMUX_STOP_POLICY      - drain or abort
  PORTMUX_WATCH_CONFIG     - Reload on file change (true/false)
  PORTMUX_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
  PORTMUX_API_KEY          - Require this key on mutating admin routes
")]
pub struct CliArgs {
    /// Access-key file path
    #[arg(short, long, help = "Path to the access-key file")]
    pub config: Option<PathBuf>,

    /// Admin API address
    #[arg(short, long, help = "Admin API address (e.g., 127.0.0.1:8080)")]
    pub admin_addr: Option<SocketAddr>,

    #[arg(long, help = "Address every port binds on")]
    pub listen_ip: Option<IpAddr>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Handshake read deadline (e.g., 59s)")]
    pub tcp_read_timeout: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Upstream connect deadline (e.g., 10s)")]
    pub connect_timeout: Option<Duration>,

    #[arg(long, help = "Salts remembered for replay detection, 0 disables")]
    pub replay_history: Option<usize>,

    #[arg(long, help = "What happens to live connections of a removed port (drain, abort)")]
    pub stop_policy: Option<StopPolicy>,

    #[arg(short, long, help = "Reload when the access-key file changes")]
    pub watch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate settings and the access-key file, then exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut settings = ServerSettings::from_env().context("Invalid environment settings")?;
    settings.merge_with_cli_args(
        args.config.clone(),
        args.admin_addr,
        args.listen_ip,
        args.tcp_read_timeout,
        args.connect_timeout,
        args.replay_history,
        args.stop_policy,
        args.watch,
    );
    if let Some(level) = &args.log_level {
        settings.log_level = level.clone();
    }
    settings
        .validate()
        .context("Final settings validation failed")?;

    init_tracing(&settings, args.verbose)?;

    info!("Starting portmux v{}", env!("CARGO_PKG_VERSION"));

    let config = ConfigManager::load_from_file(&settings.config_path).with_context(|| {
        format!(
            "Failed to load access keys from {}",
            settings.config_path.display()
        )
    })?;
    config.validate().context("Invalid access-key file")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Access-key file: {}", settings.config_path.display());
        info!("  Access keys: {}", config.keys.len());
        info!("  Ports: {:?}", config.ports());
        info!("  Admin address: {}", settings.admin_addr);
        info!("  Stop policy: {}", settings.stop_policy);
        return Ok(());
    }

    info!("Listen IP: {}", settings.listen_ip);
    info!("Stop policy: {}", settings.stop_policy);
    info!(
        "Replay detection: {}",
        if settings.replay_history > 0 {
            "enabled"
        } else {
            "disabled"
        }
    );

    let metrics = Arc::new(
        PrometheusMetrics::new(prometheus::Registry::new())
            .context("Failed to register metrics")?,
    );
    metrics.set_build_info(env!("CARGO_PKG_VERSION"));

    let ctx = ServiceContext::new(Arc::new(PreambleMatcher)).with_metrics(metrics.clone());
    let orchestrator = Arc::new(PortOrchestrator::from_settings(&settings, ctx));

    // Ports that fail to bind are logged; the rest still serve.
    if let Err(e) = orchestrator.reconcile(&config).await {
        error!("Initial configuration only partially applied: {}", e);
    }

    let shutdown_coordinator = ShutdownCoordinator::new(SHUTDOWN_TIMEOUT);

    let app_state = AppState::new(orchestrator.clone(), settings.config_path.clone())
        .with_metrics(metrics.clone());
    let management_server =
        ManagementServer::new(settings.admin_addr, app_state, settings.api_auth.clone());
    let listener = management_server.bind().await?;
    let mut admin_shutdown = shutdown_coordinator.subscribe();
    let management_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = admin_shutdown.recv().await;
        };
        if let Err(e) = management_server.serve(listener, shutdown).await {
            error!("Management API server error: {:#}", e);
        }
    });

    let reload_handle = tokio::spawn(reload_on_hangup(
        orchestrator.clone(),
        settings.config_path.clone(),
        shutdown_coordinator.subscribe(),
    ));

    let watch_handle = if settings.watch_config {
        let watcher = ConfigWatcher::new(settings.config_path.clone())?;
        let orchestrator = orchestrator.clone();
        let mut shutdown_rx = shutdown_coordinator.subscribe();
        Some(tokio::spawn(async move {
            let mut events = watcher.subscribe();
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            info!("Access-key file changed: {}", event.file_path.display());
                            if let Err(e) = orchestrator.reconcile(&event.config).await {
                                error!("Failed to apply changed access keys: {}", e);
                            }
                        }
                        Some(Err(e)) => warn!("Missed config change events: {}", e),
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        }))
    } else {
        None
    };

    info!("portmux started");
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown, SIGHUP to reload");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!("Initiating graceful shutdown...");

    if let Err(e) = management_handle.await {
        error!("Management API task failed: {}", e);
    }
    match reload_handle.await {
        Ok(Err(e)) => error!("SIGHUP listener failed: {:#}", e),
        Err(e) => error!("SIGHUP listener task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = watch_handle {
        if let Err(e) = handle.await {
            error!("Config watcher task failed: {}", e);
        }
    }

    if let Err(e) = shutdown_coordinator
        .shutdown_orchestrator(&orchestrator)
        .await
    {
        error!("Shutdown incomplete: {:#}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(settings: &ServerSettings, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        settings.log_level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
