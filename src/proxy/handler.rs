//! Per-accepted-connection orchestration: the state machine described in
//! §4.4 — handshake, identity, balancer acquire, upstream dial, forwarding,
//! draining, release.

use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, Socket};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthRegistry;
use crate::balancer::Balancer;
use crate::error::ProxyError;
use crate::forwarder::forward;
use crate::proxy::tls::client_common_name;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Force-shuts-down both directions of a socket this process independently
/// owns a descriptor for — `dup`'d off the live stream before it was split,
/// via `Socket::try_clone`, so this never needs to reach back into the split
/// halves or reconstruct a borrow from a raw fd.
fn force_close(dup: &Socket) {
    let _ = dup.shutdown(Shutdown::Both);
}

pub async fn handle_connection(
    acceptor: TlsAcceptor,
    raw_conn: TcpStream,
    auth: Arc<AuthRegistry>,
    balancer: Arc<Balancer>,
    heartbeat: Duration,
    buf_size: usize,
) -> Result<(), ProxyError> {
    // Handshaking
    let tls_stream = acceptor
        .accept(raw_conn)
        .await
        .map_err(ProxyError::HandshakeFailed)?;

    let peer_certs = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .ok_or_else(|| {
            ProxyError::HandshakeFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                "no peer certificate presented",
            ))
        })?;
    let client_id = client_common_name(peer_certs)?;

    // Authenticated
    if !auth.authn(&client_id) {
        return Err(ProxyError::NotAuthenticated(client_id));
    }

    // Acquired
    let upstream_handle = balancer.acquire(&client_id)?;

    // Connected
    let upstream_stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(upstream_handle.addr())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::UpstreamDialFailed(e)),
        Err(_) => {
            return Err(ProxyError::UpstreamDialFailed(io::Error::new(
                io::ErrorKind::TimedOut,
                "dialing upstream",
            )))
        }
    };

    // Forwarding / Draining
    let result = run_session(tls_stream, upstream_stream, heartbeat, buf_size).await;

    // Closed — the upstream handle is dropped here (after both forwarders
    // have returned), releasing the balancer slot exactly once.
    match &result {
        Ok(()) => info!(client = %client_id, addr = %upstream_handle.addr(), "session closed"),
        Err(e) => warn!(client = %client_id, addr = %upstream_handle.addr(), error = %e, "session closed with error"),
    }
    drop(upstream_handle);

    result
}

async fn run_session(
    client_stream: tokio_rustls::server::TlsStream<TcpStream>,
    upstream_stream: TcpStream,
    heartbeat: Duration,
    buf_size: usize,
) -> Result<(), ProxyError> {
    let client_dup = SockRef::from(&client_stream).try_clone()?;
    let upstream_dup = SockRef::from(&upstream_stream).try_clone()?;

    let (client_read, client_write) = tokio::io::split(client_stream);
    let (upstream_read, upstream_write) = upstream_stream.into_split();

    let cancel = CancellationToken::new();

    let watcher_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        watcher_cancel.cancelled().await;
        force_close(&client_dup);
        force_close(&upstream_dup);
    });

    let mut client_to_upstream = tokio::spawn(forward(
        cancel.clone(),
        client_read,
        upstream_write,
        heartbeat,
        buf_size,
    ));
    let mut upstream_to_client = tokio::spawn(forward(
        cancel.clone(),
        upstream_read,
        client_write,
        heartbeat,
        buf_size,
    ));

    // Draining begins the moment either forwarder returns, for any reason —
    // the cancel fan-out tears down the side that is still running.
    enum Direction {
        ClientToUpstream,
        UpstreamToClient,
    }
    let (first_result, which) = tokio::select! {
        res = &mut client_to_upstream => (res, Direction::ClientToUpstream),
        res = &mut upstream_to_client => (res, Direction::UpstreamToClient),
    };
    cancel.cancel();

    let second_result = match which {
        Direction::ClientToUpstream => upstream_to_client.await,
        Direction::UpstreamToClient => client_to_upstream.await,
    };

    let _ = watcher.await;

    match (flatten(first_result), flatten(second_result)) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

fn flatten(joined: Result<Result<(), ProxyError>, tokio::task::JoinError>) -> Result<(), ProxyError> {
    match joined {
        Ok(inner) => inner,
        Err(e) => Err(ProxyError::ForwardIo(io::Error::other(e))),
    }
}
