//! Relay behaviour over real TCP sockets

use portmux::net::{relay, DuplexConn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

/// Returns (client end, proxy end) of a loopback connection.
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

#[tokio::test]
async fn test_half_close_propagates_both_ways() {
    let (mut client, proxy_client_side) = tcp_pair().await;
    let (proxy_target_side, mut target) = tcp_pair().await;

    let relay_handle = tokio::spawn(async move {
        let mut a = DuplexConn::from_tcp(proxy_client_side).unwrap();
        let mut b = DuplexConn::from_tcp(proxy_target_side).unwrap();
        relay(&mut a, &mut b).await
    });

    // Several writes arrive as one stream once the client half-closes.
    for chunk in [&b"hel"[..], b"lo ", b"there"] {
        client.write_all(chunk).await.unwrap();
    }
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), target.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"hello there");

    // The reverse direction is still open after the forward EOF.
    target.write_all(b"bye").await.unwrap();
    target.shutdown().await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"bye");

    let report = timeout(Duration::from_secs(5), relay_handle)
        .await
        .unwrap()
        .unwrap();
    assert!(report.is_ok());
    assert_eq!(report.forward_bytes, 11);
    assert_eq!(report.reverse_bytes, 3);
}

#[tokio::test]
async fn test_large_transfer_counts() {
    let (mut client, proxy_client_side) = tcp_pair().await;
    let (proxy_target_side, mut target) = tcp_pair().await;

    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));
    let (sent_clone, received_clone) = (sent.clone(), received.clone());
    let relay_handle = tokio::spawn(async move {
        let a = DuplexConn::from_tcp(proxy_client_side).unwrap();
        let mut a = portmux::metrics::measure_conn(a, sent_clone, received_clone);
        let mut b = DuplexConn::from_tcp(proxy_target_side).unwrap();
        relay(&mut a, &mut b).await
    });

    let payload = vec![0x5au8; 200 * 1024];
    let writer = tokio::spawn(async move {
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();
        client
    });

    let mut forwarded = Vec::new();
    timeout(Duration::from_secs(10), target.read_to_end(&mut forwarded))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded.len(), 200 * 1024);
    target.write_all(b"done").await.unwrap();
    drop(target);

    let mut client = writer.await.unwrap();
    let mut reply = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"done");

    let report = timeout(Duration::from_secs(5), relay_handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.forward_bytes, 200 * 1024);
    assert_eq!(report.reverse_bytes, 4);
    // Bytes read from the client and bytes written back to it.
    assert_eq!(received.load(Ordering::SeqCst), 200 * 1024);
    assert_eq!(sent.load(Ordering::SeqCst), 4);
}
