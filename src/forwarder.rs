//! Heartbeat-supervised bidirectional byte forwarding.
//!
//! Each call to [`forward`] drives one direction of a session: a producer
//! task reads from `src`, writes to `dst`, and emits a coalesced liveness
//! tick after every completed read (including the terminal zero-byte read).
//! A supervisor races that tick stream against a heartbeat timer and the
//! producer's own termination. Exactly one of the three outcomes decides the
//! call's result, but the producer is always joined before returning.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;

/// Forwards `src` into `dst` until EOF, error, or heartbeat expiry.
///
/// `cancel` is fired exactly when the heartbeat timer expires; firing it
/// does not close anything by itself — the caller is expected to be racing
/// a task that closes the underlying sockets on cancellation, which is what
/// actually unblocks the producer below.
pub async fn forward<R, W>(
    cancel: CancellationToken,
    mut src: R,
    mut dst: W,
    heartbeat: Duration,
    buf_size: usize,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
    let (done_tx, mut done_rx) = oneshot::channel::<io::Result<()>>();

    let producer = tokio::spawn(async move {
        let mut buf = vec![0u8; buf_size];
        let result = loop {
            match src.read(&mut buf).await {
                Ok(0) => {
                    let _ = tick_tx.try_send(());
                    break Ok(());
                }
                Ok(n) => {
                    let _ = tick_tx.try_send(());
                    if let Err(e) = dst.write_all(&buf[..n]).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let _ = done_tx.send(result);
    });

    let supervised = async {
        let sleep = tokio::time::sleep(heartbeat);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                tick = tick_rx.recv() => {
                    if tick.is_some() {
                        sleep.as_mut().reset(Instant::now() + heartbeat);
                    }
                }
                () = &mut sleep => {
                    cancel.cancel();
                    return Err(ProxyError::ForwardHeartbeatTimeout);
                }
                res = &mut done_rx => {
                    return match res {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(ProxyError::ForwardIo(e)),
                        Err(_) => Ok(()),
                    };
                }
            }
        }
    };

    let result = supervised.await;
    let _ = producer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn forwards_bytes_in_order() {
        let (mut client_side, proxy_side) = duplex(64);
        let (dst_side, mut upstream_side) = duplex(64);
        let cancel = CancellationToken::new();

        client_side.write_all(b"hello world").await.unwrap();
        client_side.shutdown().await.unwrap();

        let result = forward(cancel, proxy_side, dst_side, Duration::from_secs(5), 8).await;
        assert!(result.is_ok());

        let mut received = Vec::new();
        upstream_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn heartbeat_expiry_fires_cancel_and_returns_timeout() {
        let (client_side, proxy_side) = duplex(64);
        let (dst_side, _upstream_side) = duplex(64);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        // Nothing is ever written, so the producer blocks on read forever.
        // In production a watcher task force-closes the underlying socket
        // once cancel fires, which is what actually unblocks the read; this
        // stands in for that watcher so the producer can be joined.
        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            watcher_cancel.cancelled().await;
            drop(client_side);
        });

        let result = forward(cancel_clone, proxy_side, dst_side, Duration::from_millis(50), 8).await;
        assert!(matches!(result, Err(ProxyError::ForwardHeartbeatTimeout)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn eof_completes_without_heartbeat_firing() {
        let (mut client_side, proxy_side) = duplex(64);
        let (dst_side, _upstream_side) = duplex(64);
        let cancel = CancellationToken::new();

        client_side.shutdown().await.unwrap();

        let result = forward(cancel.clone(), proxy_side, dst_side, Duration::from_secs(5), 8).await;
        assert!(result.is_ok());
        assert!(!cancel.is_cancelled());
    }
}
