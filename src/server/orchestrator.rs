//! Port Orchestrator
//!
//! Owns every port binding and converges them on a configuration. All callers
//! (startup, SIGHUP, the admin API and the file watcher) share one instance and
//! are serialized by its mutex.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::binding::PortBinding;
use crate::config::{Config, ConfigManager, ServerSettings, StopPolicy};
use crate::error::{PortFailure, ReconcileError, ReloadError, StopError};
use crate::service::{CipherEntry, ReplayCache, ServiceContext};

/// Ports currently bound.
#[derive(Debug, Default)]
pub struct ServerState {
    ports: HashMap<u16, PortBinding>,
}

/// What a successful reconcile changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: Vec<u16>,
    pub stopped: Vec<u16>,
    /// Ports kept open whose cipher set was replaced.
    pub updated: Vec<u16>,
    pub keys: usize,
    pub ports: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.updated.is_empty()
    }
}

pub struct PortOrchestrator {
    state: Mutex<ServerState>,
    ctx: Arc<ServiceContext>,
    listen_ip: IpAddr,
    stop_policy: StopPolicy,
}

impl PortOrchestrator {
    pub fn new(ctx: ServiceContext, listen_ip: IpAddr, stop_policy: StopPolicy) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            ctx: Arc::new(ctx),
            listen_ip,
            stop_policy,
        }
    }

    /// Apply the timeouts and replay history from `settings` to `ctx`.
    pub fn from_settings(settings: &ServerSettings, ctx: ServiceContext) -> Self {
        let ctx = ctx
            .with_timeouts(settings.tcp_read_timeout, settings.connect_timeout)
            .with_replay_guard(Arc::new(ReplayCache::new(settings.replay_history)));
        Self::new(ctx, settings.listen_ip, settings.stop_policy)
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Converge the bound ports on `config`.
    ///
    /// Ports only in the running state are stopped, ports only in `config` are
    /// started, and ports in both keep their sockets while their cipher set is
    /// replaced. An invalid configuration changes nothing. Per-port failures
    /// are collected; the remaining ports are still processed.
    pub async fn reconcile(&self, config: &Config) -> Result<ReconcileSummary, ReloadError> {
        config.validate()?;
        let mut port_ciphers: BTreeMap<u16, Vec<Arc<CipherEntry>>> = BTreeMap::new();
        for (port, keys) in config.keys_by_port() {
            let entries = keys
                .into_iter()
                .map(|key| CipherEntry::from_config(key).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;
            port_ciphers.insert(port, entries);
        }

        let mut state = self.state.lock().await;

        // +1 desired, -1 bound. Only a net change touches the sockets.
        let mut port_changes: BTreeMap<u16, i8> = BTreeMap::new();
        for port in state.ports.keys() {
            *port_changes.entry(*port).or_default() -= 1;
        }
        for port in port_ciphers.keys() {
            *port_changes.entry(*port).or_default() += 1;
        }

        let mut summary = ReconcileSummary::default();
        let mut failures = Vec::new();
        for (port, delta) in port_changes {
            match delta {
                -1 => match state.stop_port(port, self.stop_policy).await {
                    Ok(()) => summary.stopped.push(port),
                    Err(e) => failures.push((port, PortFailure::from(e))),
                },
                1 => match state.start_port(self.listen_ip, port, &self.ctx).await {
                    Ok(()) => summary.started.push(port),
                    Err(e) => failures.push((port, PortFailure::from(e))),
                },
                _ => {}
            }
        }

        for (port, entries) in port_ciphers {
            let Some(binding) = state.ports.get(&port) else {
                continue;
            };
            if binding.replace_ciphers(entries) && !summary.started.contains(&port) {
                summary.updated.push(port);
            }
        }

        if !failures.is_empty() {
            for (port, failure) in &failures {
                error!(port, error = %failure, "Failed to converge port");
            }
            return Err(ReconcileError { failures }.into());
        }

        summary.keys = config.keys.len();
        summary.ports = state.ports.len();
        self.ctx
            .metrics
            .set_num_access_keys(summary.keys, summary.ports);
        info!(
            keys = summary.keys,
            ports = summary.ports,
            started = ?summary.started,
            stopped = ?summary.stopped,
            updated = ?summary.updated,
            "Loaded {} access keys over {} ports",
            summary.keys,
            summary.ports
        );
        Ok(summary)
    }

    /// Re-read the access-key file and reconcile against it.
    pub async fn reload_from_file(&self, path: &Path) -> Result<ReconcileSummary, ReloadError> {
        let config = ConfigManager::load_from_file(path)?;
        self.reconcile(&config).await
    }

    /// Stop every binding. Used at shutdown.
    pub async fn stop_all(&self) -> Result<usize, ReconcileError> {
        let mut state = self.state.lock().await;
        let mut ports: Vec<u16> = state.ports.keys().copied().collect();
        ports.sort_unstable();

        let mut failures = Vec::new();
        let mut stopped = 0;
        for port in ports {
            match state.stop_port(port, self.stop_policy).await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    warn!(port, error = %e, "Failed to stop port");
                    failures.push((port, PortFailure::from(e)));
                }
            }
        }

        if failures.is_empty() {
            Ok(stopped)
        } else {
            Err(ReconcileError { failures })
        }
    }

    /// Bound ports in ascending order.
    pub async fn ports(&self) -> Vec<u16> {
        let state = self.state.lock().await;
        let mut ports: Vec<u16> = state.ports.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Address the TCP listener of `port` is bound to.
    pub async fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        let state = self.state.lock().await;
        state.ports.get(&port).map(PortBinding::local_addr)
    }

    /// Ids of the keys currently served on `port`.
    pub async fn key_ids(&self, port: u16) -> Option<Vec<String>> {
        let state = self.state.lock().await;
        state.ports.get(&port).map(|binding| {
            binding
                .ciphers()
                .snapshot()
                .iter()
                .map(|entry| entry.id.clone())
                .collect()
        })
    }
}

impl ServerState {
    /// Bind, register, then launch. A port that fails to bind is not registered.
    async fn start_port(
        &mut self,
        listen_ip: IpAddr,
        port: u16,
        ctx: &Arc<ServiceContext>,
    ) -> Result<(), crate::error::BindError> {
        let binding = PortBinding::bind(listen_ip, port).await?;
        let binding = self.ports.entry(port).or_insert(binding);
        binding.launch(ctx);
        Ok(())
    }

    /// Deregister and stop. The port is gone from the state even if stopping fails.
    async fn stop_port(&mut self, port: u16, policy: StopPolicy) -> Result<(), StopError> {
        let binding = self.ports.remove(&port).ok_or(StopError::NotBound(port))?;
        binding.stop(policy).await
    }
}
