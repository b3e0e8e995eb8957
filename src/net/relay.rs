//! Duplex Relay
//!
//! Copies bytes between two connections in both directions at once. Each
//! direction ends independently: when its source reaches end-of-stream the
//! destination's write side is half-closed (the peer sees EOF) and the source's
//! read side is released, while the opposite direction keeps flowing.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::duplex::{BoxReader, BoxWriter, ConnControl, DuplexConn};
use crate::error::{RelayDirection, RelayError};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of a finished relay.
#[derive(Debug)]
pub struct RelayReport {
    /// Bytes copied from the first connection to the second.
    pub forward_bytes: u64,
    /// Bytes copied from the second connection to the first.
    pub reverse_bytes: u64,
    /// First failure observed. When both directions fail the forward error
    /// wins and the reverse error is dropped.
    pub error: Option<RelayError>,
}

impl RelayReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Relay between `a` and `b` until both directions have finished.
pub async fn relay(a: &mut DuplexConn, b: &mut DuplexConn) -> RelayReport {
    let (a_reader, a_writer, a_control) = a.halves();
    let (b_reader, b_writer, b_control) = b.halves();

    let forward = copy_one_way(a_reader, a_control, b_writer, b_control);
    let reverse = copy_one_way(b_reader, b_control, a_writer, a_control);
    let ((forward_bytes, forward_err), (reverse_bytes, reverse_err)) = tokio::join!(forward, reverse);

    let error = match (forward_err, reverse_err) {
        (Some(source), _) => Some(RelayError {
            direction: RelayDirection::Forward,
            source,
        }),
        (None, Some(source)) => Some(RelayError {
            direction: RelayDirection::Reverse,
            source,
        }),
        (None, None) => None,
    };

    RelayReport {
        forward_bytes,
        reverse_bytes,
        error,
    }
}

/// Copy `reader` into `writer` until EOF or error, then half-close both ends.
/// The byte count includes everything written before a failure.
async fn copy_one_way(
    reader: &mut BoxReader,
    source: &Arc<dyn ConnControl>,
    writer: &mut BoxWriter,
    destination: &Arc<dyn ConnControl>,
) -> (u64, Option<io::Error>) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;

    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break writer.flush().await,
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        copied += n as u64;
    };

    // Send FIN to indicate EOF
    if let Err(e) = destination.close_write() {
        debug!(error = %e, "Half-close of relay destination failed");
    }
    // Release reader resources
    if let Err(e) = source.close_read() {
        debug!(error = %e, "Closing read side of relay source failed");
    }

    (copied, result.err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::duplex::testing::RecordingControl;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    struct FailingReader(&'static str);

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, self.0)))
        }
    }

    fn conn(reader: BoxReader, writer: BoxWriter) -> (DuplexConn, Arc<RecordingControl>) {
        let control = Arc::new(RecordingControl::default());
        (DuplexConn::new(reader, writer, control.clone()), control)
    }

    #[tokio::test]
    async fn test_relay_counts_and_half_closes() {
        let (mut a, a_control) = conn(
            Box::new(std::io::Cursor::new(vec![7u8; 40_000])),
            Box::new(tokio::io::sink()),
        );
        let (mut b, b_control) = conn(
            Box::new(std::io::Cursor::new(vec![9u8; 123])),
            Box::new(tokio::io::sink()),
        );

        let report = relay(&mut a, &mut b).await;
        assert!(report.is_ok());
        assert_eq!(report.forward_bytes, 40_000);
        assert_eq!(report.reverse_bytes, 123);

        // Each side had its read end released and its write end half-closed once.
        assert_eq!(a_control.read_closes(), 1);
        assert_eq!(a_control.write_closes(), 1);
        assert_eq!(b_control.read_closes(), 1);
        assert_eq!(b_control.write_closes(), 1);
    }

    #[tokio::test]
    async fn test_forward_error_wins_when_both_fail() {
        let (mut a, _) = conn(Box::new(FailingReader("forward")), Box::new(tokio::io::sink()));
        let (mut b, _) = conn(Box::new(FailingReader("reverse")), Box::new(tokio::io::sink()));

        let report = relay(&mut a, &mut b).await;
        let error = report.error.expect("relay should fail");
        assert_eq!(error.direction, RelayDirection::Forward);
        assert_eq!(error.source.to_string(), "forward");
    }

    #[tokio::test]
    async fn test_reverse_error_reported_alone() {
        let (mut a, _) = conn(
            Box::new(std::io::Cursor::new(b"hello".to_vec())),
            Box::new(tokio::io::sink()),
        );
        let (mut b, _) = conn(Box::new(FailingReader("reverse")), Box::new(tokio::io::sink()));

        let report = relay(&mut a, &mut b).await;
        assert_eq!(report.forward_bytes, 5);
        let error = report.error.expect("relay should fail");
        assert_eq!(error.direction, RelayDirection::Reverse);
    }
}
