//! Graceful Shutdown Handling
//!
//! Turns SIGTERM/SIGINT into a broadcast that every long-running task listens
//! on, and SIGHUP into a reload of the access-key file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::server::PortOrchestrator;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    /// Upper bound on stopping every port.
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast shutdown without waiting for a signal.
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Shutdown requested with no listeners");
        }
    }

    /// Wait for SIGTERM or SIGINT, then broadcast shutdown.
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Stop every bound port, giving up after the configured timeout.
    pub async fn shutdown_orchestrator(&self, orchestrator: &PortOrchestrator) -> Result<()> {
        let start_time = Instant::now();
        match tokio::time::timeout(self.timeout, orchestrator.stop_all()).await {
            Ok(Ok(stopped)) => {
                info!("Stopped {} ports in {:?}", stopped, start_time.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Failed to stop some ports: {}", e);
                Err(e.into())
            }
            Err(_) => {
                warn!("Shutdown timeout reached after {:?}", self.timeout);
                Err(anyhow::anyhow!("Timed out stopping ports after {:?}", self.timeout))
            }
        }
    }
}

/// Reload `config_path` into `orchestrator` on every SIGHUP until shutdown.
///
/// Reload failures are logged; the previous state keeps serving.
pub async fn reload_on_hangup(
    orchestrator: Arc<PortOrchestrator>,
    config_path: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    #[cfg(unix)]
    {
        let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
        loop {
            tokio::select! {
                received = sighup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading {}", config_path.display());
                    if let Err(e) = orchestrator.reload_from_file(&config_path).await {
                        error!("Failed to reload config: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (orchestrator, config_path);
        let _ = shutdown_rx.recv().await;
    }

    Ok(())
}
