//! UDP Service
//!
//! Receives datagrams on a bound port, identifies the access key of each one
//! and hands matched datagrams to the packet handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::cipher::CipherSet;
use super::status;
use super::ServiceContext;

/// Largest UDP payload.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// UDP side of a port binding.
pub struct UdpService {
    port: u16,
    ciphers: Arc<CipherSet>,
    ctx: Arc<ServiceContext>,
}

impl UdpService {
    pub fn new(port: u16, ciphers: Arc<CipherSet>, ctx: Arc<ServiceContext>) -> Self {
        Self { port, ciphers, ctx }
    }

    /// Serve datagrams until `stop` fires. The loop's reference to the socket
    /// is dropped on return.
    pub async fn serve(self: Arc<Self>, socket: Arc<UdpSocket>, mut stop: watch::Receiver<bool>) {
        info!(port = self.port, "UDP service started");
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                recv_result = socket.recv_from(&mut buf) => {
                    match recv_result {
                        Ok((len, client_addr)) => {
                            self.handle_datagram(&buf[..len], client_addr, &socket);
                        }
                        Err(e) => {
                            debug!(port = self.port, error = %e, "Failed to receive datagram");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }

        info!(port = self.port, "UDP service stopped");
    }

    fn handle_datagram(&self, data: &[u8], client_addr: SocketAddr, socket: &Arc<UdpSocket>) {
        let client_ip = client_addr.ip().to_string();
        let ciphers = self.ciphers.snapshot();

        let find_start = Instant::now();
        let found = self.ctx.matcher.find_cipher(data, client_addr.ip(), &ciphers);
        let time_to_cipher = find_start.elapsed();

        let Some(matched) = found else {
            debug!(port = self.port, client_addr = %client_addr, "No cipher matched datagram");
            self.ctx.metrics.add_udp_packet_from_client(
                &client_ip,
                "",
                status::ERR_CIPHER,
                data.len(),
                0,
                time_to_cipher,
            );
            return;
        };

        let (status, forwarded) = match self.ctx.packet_handler.handle_packet(
            &matched,
            data,
            client_addr,
            Arc::clone(socket),
        ) {
            Ok(forwarded) => (status::OK, forwarded),
            Err(e) => {
                warn!(
                    port = self.port,
                    access_key = %matched.entry.id,
                    error = %e,
                    "Failed to forward datagram"
                );
                (status::ERR_RELAY, 0)
            }
        };

        self.ctx.metrics.add_udp_packet_from_client(
            &client_ip,
            &matched.entry.id,
            status,
            data.len(),
            forwarded,
            time_to_cipher,
        );
    }
}
