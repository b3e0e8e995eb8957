//! Port Services
//!
//! The TCP and UDP loops a port binding runs, plus the tenant-matching and
//! replay capabilities they consume.

pub mod cipher;
pub mod replay;
pub mod tcp;
pub mod tenant;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

use crate::metrics::{NoOpMetrics, ProxyMetrics};

pub use cipher::{CipherEntry, CipherKind, CipherSet};
pub use replay::{ReplayCache, ReplayGuard};
pub use tcp::TcpService;
pub use tenant::{
    BoxFuture, CipherMatch, DiscardPackets, OpenedStream, PacketHandler, PreambleMatcher,
    TenantMatcher,
};
pub use udp::UdpService;

/// Connection statuses reported to the metrics sink.
pub mod status {
    pub const OK: &str = "OK";
    pub const ERR_CIPHER: &str = "ERR_CIPHER";
    pub const ERR_REPLAY: &str = "ERR_REPLAY";
    pub const ERR_READ_HANDSHAKE: &str = "ERR_READ_HANDSHAKE";
    pub const ERR_READ_ADDRESS: &str = "ERR_READ_ADDRESS";
    pub const ERR_CONNECT: &str = "ERR_CONNECT";
    pub const ERR_RELAY_CLIENT: &str = "ERR_RELAY_CLIENT";
    pub const ERR_RELAY_TARGET: &str = "ERR_RELAY_TARGET";
    pub const ERR_RELAY: &str = "ERR_RELAY";
    /// The port stopped under the abort policy while the connection was live.
    pub const ERR_ABORTED: &str = "ERR_ABORTED";
}

/// Collaborators and limits shared by every port service.
#[derive(Clone)]
pub struct ServiceContext {
    pub metrics: Arc<dyn ProxyMetrics>,
    pub matcher: Arc<dyn TenantMatcher>,
    pub packet_handler: Arc<dyn PacketHandler>,
    pub replay: Arc<dyn ReplayGuard>,
    /// Deadline for the client to send enough bytes to identify its key.
    pub read_timeout: Duration,
    /// Deadline for resolving and dialing a target.
    pub connect_timeout: Duration,
}

impl ServiceContext {
    pub fn new(matcher: Arc<dyn TenantMatcher>) -> Self {
        Self {
            metrics: Arc::new(NoOpMetrics),
            matcher,
            packet_handler: Arc::new(DiscardPackets),
            replay: Arc::new(ReplayCache::new(0)),
            read_timeout: Duration::from_secs(59),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ProxyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_packet_handler(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.packet_handler = handler;
        self
    }

    pub fn with_replay_guard(mut self, replay: Arc<dyn ReplayGuard>) -> Self {
        self.replay = replay;
        self
    }

    pub fn with_timeouts(mut self, read_timeout: Duration, connect_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.connect_timeout = connect_timeout;
        self
    }
}
