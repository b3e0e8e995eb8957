//! Tenant Matching
//!
//! Capabilities the port services rely on to identify which access key produced
//! a connection or datagram, and to decode the stream once it is known.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::debug;

use super::cipher::CipherEntry;
use crate::net::{BoxReader, BoxWriter};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Longest target line accepted by [`PreambleMatcher`].
const MAX_TARGET_LEN: u64 = 512;

/// The access key identified for a connection or datagram.
#[derive(Debug, Clone)]
pub struct CipherMatch {
    pub entry: Arc<CipherEntry>,
    /// Handshake salt checked against the replay guard. Empty skips the check.
    pub salt: Vec<u8>,
}

/// A decoded client stream and the destination it asked for.
pub struct OpenedStream {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    /// `host:port` of the requested destination.
    pub target: String,
}

/// Identifies tenants from the first bytes a client sends.
pub trait TenantMatcher: Send + Sync + 'static {
    /// Find the entry in `ciphers` that produced `data`, if any. `data` grows as
    /// more bytes arrive, so this may be called several times per connection.
    fn find_cipher(
        &self,
        data: &[u8],
        client_ip: IpAddr,
        ciphers: &[Arc<CipherEntry>],
    ) -> Option<CipherMatch>;

    /// Decode the client stream for `matched`. `initial` holds every byte
    /// already read from `reader`.
    fn open_stream<'a>(
        &'a self,
        matched: &'a CipherMatch,
        initial: Vec<u8>,
        reader: BoxReader,
        writer: BoxWriter,
    ) -> BoxFuture<'a, io::Result<OpenedStream>>;
}

/// Receives datagrams whose tenant has been identified.
pub trait PacketHandler: Send + Sync + 'static {
    /// Forward `payload` for `matched`. Returns the number of bytes sent on to
    /// the destination.
    fn handle_packet(
        &self,
        matched: &CipherMatch,
        payload: &[u8],
        client: SocketAddr,
        socket: Arc<UdpSocket>,
    ) -> io::Result<usize>;
}

/// Drops every datagram.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardPackets;

impl PacketHandler for DiscardPackets {
    fn handle_packet(
        &self,
        matched: &CipherMatch,
        payload: &[u8],
        client: SocketAddr,
        _socket: Arc<UdpSocket>,
    ) -> io::Result<usize> {
        debug!(
            access_key = %matched.entry.id,
            client_addr = %client,
            len = payload.len(),
            "Discarding datagram"
        );
        Ok(0)
    }
}

/// Plaintext development matcher. A client opens with `"<secret>\n<host:port>\n"`
/// and the rest of the stream is passed through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreambleMatcher;

impl PreambleMatcher {
    fn secret_line(data: &[u8]) -> Option<&[u8]> {
        let end = data.iter().position(|&b| b == b'\n')?;
        Some(&data[..end])
    }
}

impl TenantMatcher for PreambleMatcher {
    fn find_cipher(
        &self,
        data: &[u8],
        _client_ip: IpAddr,
        ciphers: &[Arc<CipherEntry>],
    ) -> Option<CipherMatch> {
        let secret = Self::secret_line(data)?;
        ciphers
            .iter()
            .find(|entry| entry.secret.as_bytes() == secret)
            .map(|entry| CipherMatch {
                entry: Arc::clone(entry),
                salt: Vec::new(),
            })
    }

    fn open_stream<'a>(
        &'a self,
        _matched: &'a CipherMatch,
        initial: Vec<u8>,
        reader: BoxReader,
        writer: BoxWriter,
    ) -> BoxFuture<'a, io::Result<OpenedStream>> {
        Box::pin(async move {
            let skip = Self::secret_line(&initial)
                .map(|line| line.len() + 1)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing secret line"))?;

            let rest = io::Cursor::new(initial[skip..].to_vec());
            let mut reader = BufReader::new(rest.chain(reader));

            let mut line = Vec::new();
            (&mut reader)
                .take(MAX_TARGET_LEN)
                .read_until(b'\n', &mut line)
                .await?;
            if line.pop() != Some(b'\n') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "missing or oversized target line",
                ));
            }
            let target = String::from_utf8(line)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "target is not UTF-8"))?;

            Ok(OpenedStream {
                reader: Box::new(reader),
                writer,
                target: target.trim_end_matches('\r').to_string(),
            })
        })
    }
}
