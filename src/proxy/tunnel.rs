//! Bidirectional byte relay for established CONNECT tunnels
//!
//! Once the upstream proxy accepts a tunnel, the client socket and the
//! proxy-side socket are wired together until either side closes.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes in both directions until both sides close.
///
/// Each direction shuts down its peer's write side when its source finishes,
/// so a close on one end propagates to the other. Disconnect-style errors
/// (broken pipe, reset) are a normal end of tunnel, not failures; anything
/// else is returned for the caller to log against the offending proxy.
pub async fn relay<C, U>(client: C, upstream: U) -> std::io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };

    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);

    let bytes_sent = flatten(sent)?;
    let bytes_received = flatten(received)?;

    debug!(
        bytes_sent = bytes_sent,
        bytes_received = bytes_received,
        "Tunnel closed"
    );

    Ok((bytes_sent, bytes_received))
}

fn flatten(result: std::io::Result<u64>) -> std::io::Result<u64> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if is_disconnect(&e) => {
            debug!("Tunnel peer disconnected: {}", e);
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Errors that mean "the other side went away", expected under normal
/// client/proxy disconnects
pub fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_relay_carries_bytes_both_ways() {
        // Client side and its far end, upstream side and its far end
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut upstream_peer, upstream) = tokio::io::duplex(1024);

        let relay_handle = tokio::spawn(async move { relay(client, upstream).await });

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.shutdown().await.unwrap();

        upstream_peer.write_all(b"hello from upstream").await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = upstream_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 100];
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from upstream");

        // The relay finishes once both sides close (must not hang)
        let result = tokio::time::timeout(Duration::from_secs(1), relay_handle)
            .await
            .expect("relay timed out")
            .unwrap();
        let (sent, received) = result.unwrap();
        assert_eq!(sent, b"hello from client".len() as u64);
        assert_eq!(received, b"hello from upstream".len() as u64);
    }

    #[test]
    fn test_is_disconnect_classification() {
        assert!(is_disconnect(&std::io::Error::from(ErrorKind::BrokenPipe)));
        assert!(is_disconnect(&std::io::Error::from(
            ErrorKind::ConnectionReset
        )));
        assert!(!is_disconnect(&std::io::Error::from(
            ErrorKind::PermissionDenied
        )));
    }
}
