//! Duplex Connections
//!
//! A connection is a pair of byte streams plus a shared control handle that
//! owns half-close and addressing. Keeping the control handle separate from
//! the streams is what lets a connection be re-wrapped any number of times
//! without stacking delegation layers: wrapping only swaps the streams.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use socket2::{SockRef, Socket};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Boxed read side of a connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write side of a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle and addressing operations of a connection.
pub trait ConnControl: Send + Sync {
    /// Closes the read end. No more reads should happen.
    fn close_read(&self) -> io::Result<()>;

    /// Closes the write end. The peer observes end-of-stream.
    fn close_write(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Control handle of a TCP connection, backed by a duplicate of its descriptor.
#[derive(Debug)]
pub struct TcpControl {
    socket: Socket,
}

impl TcpControl {
    fn new(stream: &TcpStream) -> io::Result<Self> {
        let socket = SockRef::from(stream).try_clone()?;
        Ok(Self { socket })
    }
}

impl ConnControl for TcpControl {
    fn close_read(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Read)
    }

    fn close_write(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Write)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "not an IP socket"))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "not an IP socket"))
    }
}

/// A bidirectional byte stream with independently closable halves.
pub struct DuplexConn {
    reader: BoxReader,
    writer: BoxWriter,
    control: Arc<dyn ConnControl>,
}

impl DuplexConn {
    pub fn new(reader: BoxReader, writer: BoxWriter, control: Arc<dyn ConnControl>) -> Self {
        Self {
            reader,
            writer,
            control,
        }
    }

    /// Adopt an established TCP stream.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let control = Arc::new(TcpControl::new(&stream)?);
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self::new(Box::new(reader), Box::new(writer), control))
    }

    /// Replace the byte streams while keeping half-close and addressing
    /// delegated to the original connection.
    ///
    /// Re-wrapping an already wrapped connection replaces the substitutes; the
    /// previous streams are dropped, never nested.
    pub fn wrap(self, reader: BoxReader, writer: BoxWriter) -> Self {
        Self::new(reader, writer, self.control)
    }

    /// Transform the current byte streams, e.g. to decorate them.
    pub fn map_streams<F>(self, f: F) -> Self
    where
        F: FnOnce(BoxReader, BoxWriter) -> (BoxReader, BoxWriter),
    {
        let (reader, writer) = f(self.reader, self.writer);
        Self::new(reader, writer, self.control)
    }

    /// Move the byte streams out, leaving an exhausted reader and a discarding
    /// writer behind until [`DuplexConn::wrap`] installs replacements.
    pub fn take_streams(&mut self) -> (BoxReader, BoxWriter) {
        let reader = std::mem::replace(&mut self.reader, Box::new(tokio::io::empty()));
        let writer = std::mem::replace(&mut self.writer, Box::new(tokio::io::sink()));
        (reader, writer)
    }

    pub fn control(&self) -> Arc<dyn ConnControl> {
        Arc::clone(&self.control)
    }

    pub fn close_read(&self) -> io::Result<()> {
        self.control.close_read()
    }

    pub fn close_write(&self) -> io::Result<()> {
        self.control.close_write()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.control.peer_addr()
    }

    pub(crate) fn halves(&mut self) -> (&mut BoxReader, &mut BoxWriter, &Arc<dyn ConnControl>) {
        (&mut self.reader, &mut self.writer, &self.control)
    }
}

impl std::fmt::Debug for DuplexConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexConn")
            .field("local_addr", &self.control.local_addr().ok())
            .field("peer_addr", &self.control.peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for DuplexConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    /// Flushes the current writer, then half-closes the underlying connection.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.writer).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(self.control.close_write()),
            other => other,
        }
    }
}
