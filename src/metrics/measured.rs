//! Byte-Counting Connections
//!
//! Decorates a [`DuplexConn`] so that every byte moving through it is added to
//! counters owned by the caller. Counting happens at the stream level, so the
//! per-call path and bulk copies (including vectored writes) update the same
//! counters.

use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::{BoxReader, BoxWriter, DuplexConn};

struct CountingReader {
    inner: BoxReader,
    count: Arc<AtomicU64>,
}

impl AsyncRead for CountingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            self.count.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }
}

struct CountingWriter {
    inner: BoxWriter,
    count: Arc<AtomicU64>,
}

impl CountingWriter {
    fn record(&self, result: &Poll<io::Result<usize>>) {
        if let Poll::Ready(Ok(n)) = result {
            self.count.fetch_add(*n as u64, Ordering::Relaxed);
        }
    }
}

impl AsyncWrite for CountingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        self.record(&result);
        result
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        self.record(&result);
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Count bytes read from `conn` into `received` and bytes written to it into
/// `sent`. Half-close and addressing still go to the original connection.
pub fn measure_conn(conn: DuplexConn, sent: Arc<AtomicU64>, received: Arc<AtomicU64>) -> DuplexConn {
    conn.map_streams(|reader, writer| {
        let reader: BoxReader = Box::new(CountingReader {
            inner: reader,
            count: received,
        });
        let writer: BoxWriter = Box::new(CountingWriter {
            inner: writer,
            count: sent,
        });
        (reader, writer)
    })
}
