//! TCP Service
//!
//! Accepts client connections on a bound port, identifies the access key from
//! the first bytes, dials the requested target and relays until both sides are
//! done.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cipher::{CipherEntry, CipherSet};
use super::status;
use super::tenant::CipherMatch;
use super::ServiceContext;
use crate::error::RelayDirection;
use crate::metrics::{measure_conn, TrafficCounts};
use crate::net::{relay, DuplexConn, Marker};
use crate::Result;

/// Upper bound on bytes buffered while looking for a matching key.
const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;
const HANDSHAKE_CHUNK_SIZE: usize = 2 * 1024;

#[derive(Debug, Default)]
struct ConnCounters {
    client_proxy: Arc<AtomicU64>,
    proxy_target: Arc<AtomicU64>,
    target_proxy: Arc<AtomicU64>,
    proxy_client: Arc<AtomicU64>,
}

impl ConnCounters {
    fn snapshot(&self) -> TrafficCounts {
        TrafficCounts {
            client_proxy: self.client_proxy.load(Ordering::Relaxed),
            proxy_target: self.proxy_target.load(Ordering::Relaxed),
            target_proxy: self.target_proxy.load(Ordering::Relaxed),
            proxy_client: self.proxy_client.load(Ordering::Relaxed),
        }
    }
}

/// Why the handshake read ended without a match.
#[derive(Debug)]
enum HandshakeFailure {
    Timeout,
    Eof,
    Full,
    Io(io::Error),
}

struct Handshake {
    data: Vec<u8>,
    deadline: Instant,
    time_to_cipher: Duration,
    result: std::result::Result<CipherMatch, HandshakeFailure>,
}

struct Outcome {
    access_key: String,
    status: &'static str,
    time_to_cipher: Duration,
}

impl Outcome {
    fn new(access_key: String, status: &'static str, time_to_cipher: Duration) -> Self {
        Self {
            access_key,
            status,
            time_to_cipher,
        }
    }
}

/// What is known about a connection so far, reported if it is aborted.
#[derive(Debug, Default)]
struct Progress {
    access_key: String,
    time_to_cipher: Duration,
}

/// TCP side of a port binding.
pub struct TcpService {
    port: u16,
    ciphers: Arc<CipherSet>,
    ctx: Arc<ServiceContext>,
}

impl TcpService {
    pub fn new(port: u16, ciphers: Arc<CipherSet>, ctx: Arc<ServiceContext>) -> Self {
        Self { port, ciphers, ctx }
    }

    /// Accept connections until `stop` fires. The listener is dropped on return.
    /// Connections already accepted keep running unless `abort` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut stop: watch::Receiver<bool>,
        abort: watch::Receiver<bool>,
    ) {
        info!(port = self.port, "TCP service started");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let service = Arc::clone(&self);
                            let abort = abort.clone();
                            tokio::spawn(async move {
                                service
                                    .handle_connection(stream, client_addr, Uuid::new_v4(), abort)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!(port = self.port, error = %e, "Error accepting connection");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }

        info!(port = self.port, "TCP service stopped");
    }

    #[instrument(
        name = "tcp_connection",
        skip(self, stream, abort),
        fields(port = self.port, connection_id = %connection_id, client_addr = %client_addr)
    )]
    async fn handle_connection(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        connection_id: Uuid,
        abort: watch::Receiver<bool>,
    ) {
        let start = Instant::now();
        let client_ip = client_addr.ip().to_string();
        self.ctx.metrics.add_open_tcp_connection(&client_ip);
        debug!("Accepted connection");

        let counters = ConnCounters::default();
        let outcome = match DuplexConn::from_tcp(stream) {
            Ok(conn) => {
                let client = measure_conn(
                    conn,
                    Arc::clone(&counters.proxy_client),
                    Arc::clone(&counters.client_proxy),
                );
                let mut progress = Progress::default();
                let served = tokio::select! {
                    outcome = self.serve_client(client, client_addr, &counters, &mut progress) => Some(outcome),
                    _ = aborted(abort) => None,
                };
                served.unwrap_or_else(|| {
                    debug!("Connection aborted by port stop");
                    Outcome::new(progress.access_key, status::ERR_ABORTED, progress.time_to_cipher)
                })
            }
            Err(e) => {
                warn!(error = %e, "Failed to adopt client socket");
                Outcome::new(String::new(), status::ERR_READ_HANDSHAKE, Duration::ZERO)
            }
        };

        let data = counters.snapshot();
        let duration = start.elapsed();
        self.ctx.metrics.add_closed_tcp_connection(
            &client_ip,
            &outcome.access_key,
            outcome.status,
            data,
            outcome.time_to_cipher,
            duration,
        );
        debug!(
            status = outcome.status,
            access_key = %outcome.access_key,
            bytes = data.total(),
            duration_ms = duration.as_millis() as u64,
            "Connection closed"
        );
    }

    async fn serve_client(
        &self,
        mut client: DuplexConn,
        client_addr: SocketAddr,
        counters: &ConnCounters,
        progress: &mut Progress,
    ) -> Outcome {
        let ciphers = self.ciphers.snapshot();
        let handshake = self.read_handshake(&mut client, client_addr, &ciphers).await;
        let time_to_cipher = handshake.time_to_cipher;

        let matched = match handshake.result {
            Ok(matched) => matched,
            Err(failure) => {
                let status = match failure {
                    HandshakeFailure::Io(_) => status::ERR_READ_HANDSHAKE,
                    _ => status::ERR_CIPHER,
                };
                let drain_result = drain(&mut client, failure, handshake.deadline).await;
                debug!(status, drain_result, "Failed to find a valid cipher");
                self.ctx
                    .metrics
                    .add_tcp_probe(status, drain_result, self.port, counters.snapshot());
                return Outcome::new(String::new(), status, time_to_cipher);
            }
        };

        let access_key = matched.entry.id.clone();
        progress.access_key = access_key.clone();
        progress.time_to_cipher = time_to_cipher;
        debug!(access_key = %access_key, "Found cipher");

        if !matched.salt.is_empty() && !self.ctx.replay.add(&matched.salt) {
            warn!(access_key = %access_key, "Rejected replayed handshake");
            return Outcome::new(access_key, status::ERR_REPLAY, time_to_cipher);
        }

        let (reader, writer) = client.take_streams();
        let open = self
            .ctx
            .matcher
            .open_stream(&matched, handshake.data, reader, writer);
        let opened = match timeout_at(handshake.deadline, open).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                debug!(error = %e, "Failed to read target address");
                return Outcome::new(access_key, status::ERR_READ_ADDRESS, time_to_cipher);
            }
            Err(_) => {
                debug!("Timed out reading target address");
                return Outcome::new(access_key, status::ERR_READ_ADDRESS, time_to_cipher);
            }
        };
        let mut client = client.wrap(opened.reader, opened.writer);
        let target_addr = opened.target;

        let target = match self.connect_to_target(&target_addr, client_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target = %target_addr, error = %e, "Failed to connect to target");
                return Outcome::new(access_key, status::ERR_CONNECT, time_to_cipher);
            }
        };
        let target = match DuplexConn::from_tcp(target) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(target = %target_addr, error = %e, "Failed to adopt target socket");
                return Outcome::new(access_key, status::ERR_CONNECT, time_to_cipher);
            }
        };
        let mut target = measure_conn(
            target,
            Arc::clone(&counters.proxy_target),
            Arc::clone(&counters.target_proxy),
        );

        debug!(target = %target_addr, "Relaying");
        let report = relay(&mut client, &mut target).await;
        let status = match report.error {
            None => status::OK,
            Some(e) => {
                debug!(error = %e, "Relay ended with error");
                match e.direction {
                    RelayDirection::Forward => status::ERR_RELAY_CLIENT,
                    RelayDirection::Reverse => status::ERR_RELAY_TARGET,
                }
            }
        };
        Outcome::new(access_key, status, time_to_cipher)
    }

    /// Read from the client until a key matches, the buffer is full, the
    /// client stops sending or the read timeout passes.
    async fn read_handshake(
        &self,
        client: &mut DuplexConn,
        client_addr: SocketAddr,
        ciphers: &[Arc<CipherEntry>],
    ) -> Handshake {
        let deadline = Instant::now() + self.ctx.read_timeout;
        let mut data = Vec::with_capacity(HANDSHAKE_CHUNK_SIZE);
        let mut chunk = vec![0u8; HANDSHAKE_CHUNK_SIZE];
        let mut time_to_cipher = Duration::ZERO;

        let result = loop {
            if data.len() >= MAX_HANDSHAKE_SIZE {
                break Err(HandshakeFailure::Full);
            }
            let limit = HANDSHAKE_CHUNK_SIZE.min(MAX_HANDSHAKE_SIZE - data.len());
            let n = match timeout_at(deadline, client.read(&mut chunk[..limit])).await {
                Err(_) => break Err(HandshakeFailure::Timeout),
                Ok(Ok(0)) => break Err(HandshakeFailure::Eof),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => break Err(HandshakeFailure::Io(e)),
            };
            data.extend_from_slice(&chunk[..n]);

            let find_start = Instant::now();
            let found = self.ctx.matcher.find_cipher(&data, client_addr.ip(), ciphers);
            time_to_cipher += find_start.elapsed();
            if let Some(matched) = found {
                break Ok(matched);
            }
        };

        Handshake {
            data,
            deadline,
            time_to_cipher,
            result,
        }
    }

    /// Resolve `target` and dial it from a socket marked for the client.
    async fn connect_to_target(&self, target: &str, client_addr: SocketAddr) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = timeout(self.ctx.connect_timeout, lookup_host(target))
            .await
            .map_err(|_| anyhow!("DNS resolution timed out for {}", target))?
            .with_context(|| format!("DNS resolution failed for {}", target))?
            .collect();

        let marker = Marker::for_client(client_addr.ip());
        let mut last_error = None;
        for addr in addrs {
            match self.try_connect_to_address(addr, marker).await {
                Ok(stream) => {
                    debug!(target_addr = %addr, "Connected to target");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(target_addr = %addr, error = %e, "Failed to connect");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("No addresses resolved for {}", target)))
    }

    async fn try_connect_to_address(&self, addr: SocketAddr, marker: Marker) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        marker.apply_or_log(&socket);

        match timeout(self.ctx.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(anyhow!("Connection failed: {}", e)),
            Err(_) => Err(anyhow!("Connection timed out")),
        }
    }
}

/// Resolves once `abort` is set. Never resolves if the sender goes away.
async fn aborted(mut abort: watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Keep reading from an unauthenticated client until the handshake deadline so
/// probes cannot time how quickly the server gives up.
async fn drain(client: &mut DuplexConn, failure: HandshakeFailure, deadline: Instant) -> &'static str {
    match failure {
        HandshakeFailure::Timeout => "timeout",
        HandshakeFailure::Eof => "eof",
        HandshakeFailure::Io(_) => "other",
        HandshakeFailure::Full => {
            let mut sink = tokio::io::sink();
            match timeout_at(deadline, tokio::io::copy(client, &mut sink)).await {
                Ok(Ok(_)) => "eof",
                Ok(Err(_)) => "other",
                Err(_) => "timeout",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::types::testing::RecordingMetrics;
    use crate::service::cipher::CipherKind;
    use crate::service::tenant::PreambleMatcher;
    use tokio::io::AsyncWriteExt;

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });
        addr
    }

    async fn start_service(
        metrics: Arc<RecordingMetrics>,
        read_timeout: Duration,
    ) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (addr, stop_tx, _abort_tx, handle) = start_abortable_service(metrics, read_timeout).await;
        (addr, stop_tx, handle)
    }

    async fn start_abortable_service(
        metrics: Arc<RecordingMetrics>,
        read_timeout: Duration,
    ) -> (
        SocketAddr,
        watch::Sender<bool>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let ciphers = Arc::new(CipherSet::new());
        ciphers.replace(vec![Arc::new(CipherEntry {
            id: "k1".to_string(),
            kind: CipherKind::Chacha20IetfPoly1305,
            secret: "alpha".to_string(),
        })]);
        let ctx = ServiceContext::new(Arc::new(PreambleMatcher))
            .with_metrics(metrics)
            .with_timeouts(read_timeout, Duration::from_secs(2));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(TcpService::new(addr.port(), ciphers, Arc::new(ctx)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let handle = tokio::spawn(service.serve(listener, stop_rx, abort_rx));
        (addr, stop_tx, abort_tx, handle)
    }

    async fn wait_for_closed(metrics: &RecordingMetrics) -> Vec<crate::metrics::types::testing::ClosedConnection> {
        for _ in 0..200 {
            let closed = metrics.closed();
            if !closed.is_empty() {
                return closed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection was never reported closed");
    }

    #[tokio::test]
    async fn test_authenticated_connection_is_relayed() {
        let echo = spawn_echo_server().await;
        let metrics = Arc::new(RecordingMetrics::default());
        let (addr, _stop, _handle) = start_service(metrics.clone(), Duration::from_secs(5)).await;

        let preamble = format!("alpha\n{}\n", echo);
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(preamble.as_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"hello");

        let closed = wait_for_closed(&metrics).await;
        assert_eq!(closed[0].status, status::OK);
        assert_eq!(closed[0].access_key, "k1");
        assert_eq!(closed[0].data.client_proxy, (preamble.len() + 5) as u64);
        assert_eq!(closed[0].data.proxy_target, 5);
        assert_eq!(closed[0].data.target_proxy, 5);
        assert_eq!(closed[0].data.proxy_client, 5);
        assert!(metrics.probes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_secret_is_reported_as_probe() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (addr, _stop, _handle) = start_service(metrics.clone(), Duration::from_secs(5)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"wrong\n").await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;

        let closed = wait_for_closed(&metrics).await;
        assert_eq!(closed[0].status, status::ERR_CIPHER);
        assert_eq!(closed[0].access_key, "");
        assert_eq!(
            metrics.probes(),
            vec![(status::ERR_CIPHER.to_string(), "eof".to_string(), addr.port())]
        );
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (addr, _stop, _handle) = start_service(metrics.clone(), Duration::from_millis(100)).await;

        let _client = TcpStream::connect(addr).await.unwrap();
        let closed = wait_for_closed(&metrics).await;
        assert_eq!(closed[0].status, status::ERR_CIPHER);
        assert_eq!(metrics.probes()[0].1, "timeout");
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        // Bind then drop to get a port nobody listens on.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let metrics = Arc::new(RecordingMetrics::default());
        let (addr, _stop, _handle) = start_service(metrics.clone(), Duration::from_secs(5)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("alpha\n{}\n", unused).as_bytes())
            .await
            .unwrap();

        let closed = wait_for_closed(&metrics).await;
        assert_eq!(closed[0].status, status::ERR_CONNECT);
        assert_eq!(closed[0].access_key, "k1");
    }

    #[tokio::test]
    async fn test_aborted_connection_is_reported_closed() {
        let echo = spawn_echo_server().await;
        let metrics = Arc::new(RecordingMetrics::default());
        let (addr, stop, abort, handle) =
            start_abortable_service(metrics.clone(), Duration::from_secs(5)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("alpha\n{}\nhi", echo).as_bytes())
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hi");

        let _ = stop.send(true);
        let _ = abort.send(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;

        let closed = wait_for_closed(&metrics).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, status::ERR_ABORTED);
        assert_eq!(closed[0].access_key, "k1");
        assert_eq!(closed[0].data.proxy_target, 2);
        assert_eq!(closed[0].data.proxy_client, 2);
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (addr, stop, handle) = start_service(metrics, Duration::from_secs(5)).await;

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
