//! Port Binding
//!
//! One TCP listener and one UDP socket sharing a port number, the cipher set
//! served on that port, and the two loops serving them.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::StopPolicy;
use crate::error::{BindError, StopError};
use crate::service::{CipherEntry, CipherSet, ServiceContext, TcpService, UdpService};

struct Sockets {
    tcp: TcpListener,
    udp: UdpSocket,
}

struct Tasks {
    tcp: JoinHandle<()>,
    udp: JoinHandle<()>,
}

/// A bound port.
pub struct PortBinding {
    port: u16,
    local_addr: SocketAddr,
    ciphers: Arc<CipherSet>,
    stop_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    sockets: Option<Sockets>,
    tasks: Option<Tasks>,
}

impl PortBinding {
    /// Bind both sockets. Nothing is served until [`PortBinding::launch`].
    pub async fn bind(listen_ip: IpAddr, port: u16) -> Result<Self, BindError> {
        let addr = SocketAddr::new(listen_ip, port);
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| BindError::Tcp { port, source })?;
        let local_addr = tcp
            .local_addr()
            .map_err(|source| BindError::Tcp { port, source })?;
        let udp = UdpSocket::bind(addr)
            .await
            .map_err(|source| BindError::Udp { port, source })?;

        let (stop_tx, _) = watch::channel(false);
        let (abort_tx, _) = watch::channel(false);

        Ok(Self {
            port,
            local_addr,
            ciphers: Arc::new(CipherSet::new()),
            stop_tx,
            abort_tx,
            sockets: Some(Sockets { tcp, udp }),
            tasks: None,
        })
    }

    /// Spawn the TCP accept loop and the UDP serve loop.
    pub fn launch(&mut self, ctx: &Arc<ServiceContext>) {
        let Some(sockets) = self.sockets.take() else {
            return;
        };

        let tcp_service = Arc::new(TcpService::new(
            self.port,
            Arc::clone(&self.ciphers),
            Arc::clone(ctx),
        ));
        let udp_service = Arc::new(UdpService::new(
            self.port,
            Arc::clone(&self.ciphers),
            Arc::clone(ctx),
        ));

        let tcp = tokio::spawn(tcp_service.serve(
            sockets.tcp,
            self.stop_tx.subscribe(),
            self.abort_tx.subscribe(),
        ));
        let udp = tokio::spawn(udp_service.serve(Arc::new(sockets.udp), self.stop_tx.subscribe()));

        self.tasks = Some(Tasks { tcp, udp });
        info!(port = self.port, "Started TCP and UDP listeners");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ciphers(&self) -> &Arc<CipherSet> {
        &self.ciphers
    }

    /// Swap in a new cipher set unless it equals the current one. Returns
    /// whether a swap happened.
    pub fn replace_ciphers(&self, entries: Vec<Arc<CipherEntry>>) -> bool {
        let current = self.ciphers.snapshot();
        let unchanged = current.len() == entries.len()
            && current.iter().zip(&entries).all(|(old, new)| old == new);
        if unchanged {
            return false;
        }
        debug!(port = self.port, keys = entries.len(), "Replacing cipher set");
        self.ciphers.replace(entries);
        true
    }

    /// Stop both loops and release the sockets.
    pub async fn stop(mut self, policy: StopPolicy) -> Result<(), StopError> {
        // Receivers are gone if both loops already ended.
        let _ = self.stop_tx.send(true);
        if policy == StopPolicy::Abort {
            let _ = self.abort_tx.send(true);
        }

        let mut failures = Vec::new();
        if let Some(tasks) = self.tasks.take() {
            if let Err(e) = tasks.tcp.await {
                failures.push(format!("TCP loop failed: {}", e));
            }
            if let Err(e) = tasks.udp.await {
                failures.push(format!("UDP loop failed: {}", e));
            }
        }

        if !failures.is_empty() {
            return Err(StopError::Loops {
                port: self.port,
                failures,
            });
        }

        info!(port = self.port, policy = %policy, "Stopped TCP and UDP listeners");
        Ok(())
    }
}

impl std::fmt::Debug for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortBinding")
            .field("port", &self.port)
            .field("local_addr", &self.local_addr)
            .field("keys", &self.ciphers.len())
            .field("running", &self.tasks.is_some())
            .finish()
    }
}
