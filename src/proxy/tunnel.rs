//! CONNECT tunnel relay.
//!
//! The relay splices the client socket to the target with no inspection of
//! the bytes in between. Each direction is pumped by its own future so a
//! half-closed connection (one side sent FIN) keeps flowing the other way
//! for a bounded grace period. A tunnel that carries no bytes in either
//! direction for the idle timeout is torn down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ProxyError, ProxyResult};
use super::server::shutdown_signal;
use super::upstream::UpstreamConnector;
use crate::http::{Response, Target};
use crate::telemetry::{AuditEvent, AuditLogger, CloseReason};

/// Default time the surviving direction may keep flowing after a half-close.
pub const DEFAULT_TUNNEL_GRACE: Duration = Duration::from_secs(5);

/// Default time an established tunnel may carry no bytes at all.
pub const DEFAULT_TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Summary of one finished tunnel.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    /// Session ID, also used in the audit trail.
    pub id: Uuid,
    /// Client socket address.
    pub client: SocketAddr,
    /// `host:port` of the target.
    pub target: String,
    /// Bytes relayed client -> target, including bytes buffered with the
    /// CONNECT head.
    pub bytes_up: u64,
    /// Bytes relayed target -> client.
    pub bytes_down: u64,
    /// Why the tunnel ended.
    pub reason: CloseReason,
    /// How long the tunnel was open.
    pub duration: Duration,
}

/// Establishes and relays CONNECT tunnels.
#[derive(Debug, Clone)]
pub struct TunnelRelay {
    connector: Arc<UpstreamConnector>,
    grace: Duration,
    idle_timeout: Duration,
    audit: Arc<AuditLogger>,
}

impl TunnelRelay {
    /// Create a relay that connects through `connector`.
    pub fn new(connector: Arc<UpstreamConnector>, grace: Duration, audit: Arc<AuditLogger>) -> Self {
        Self {
            connector,
            grace,
            idle_timeout: DEFAULT_TUNNEL_IDLE_TIMEOUT,
            audit,
        }
    }

    /// Close tunnels that relay nothing for `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Open a tunnel from `client` to `target` and relay until both sides are done.
    ///
    /// `buffered` holds bytes the client sent after the CONNECT head that were
    /// already read off the socket; they are forwarded to the target before
    /// anything else. If the target cannot be reached the client gets a 502
    /// (504 on timeout) and the error is returned.
    pub async fn relay(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        buffered: &[u8],
        target: &Target,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProxyResult<TunnelSession> {
        let id = Uuid::new_v4();
        let authority = target.authority();
        let started = Instant::now();

        let mut upstream = match self.connector.connect(&target.host, target.port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Tunnel {} to {} failed: {}", id, authority, e);
                let refusal = Response::status_only(e.status());
                let _ = refusal.write_to(&mut client).await;
                let _ = client.shutdown().await;
                return Err(e);
            }
        };

        Response::connection_established()
            .write_to(&mut client)
            .await
            .map_err(ProxyError::Io)?;
        debug!("Tunnel {} established: {} -> {}", id, peer, authority);

        let bytes_up = AtomicU64::new(0);
        let bytes_down = AtomicU64::new(0);

        if !buffered.is_empty() {
            upstream.write_all(buffered).await?;
            bytes_up.fetch_add(buffered.len() as u64, Ordering::Relaxed);
        }

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let reason = splice(
            (client_read, client_write),
            (upstream_read, upstream_write),
            (&bytes_up, &bytes_down),
            self.grace,
            self.idle_timeout,
            &mut shutdown,
        )
        .await;

        let session = TunnelSession {
            id,
            client: peer,
            target: authority,
            bytes_up: bytes_up.load(Ordering::Relaxed),
            bytes_down: bytes_down.load(Ordering::Relaxed),
            reason,
            duration: started.elapsed(),
        };

        info!(
            "Tunnel {} to {} closed ({:?}): {} bytes up, {} bytes down in {:?}",
            session.id,
            session.target,
            session.reason,
            session.bytes_up,
            session.bytes_down,
            session.duration
        );
        self.audit.log(AuditEvent::TunnelClosed {
            id: session.id.to_string(),
            client: peer.to_string(),
            target: session.target.clone(),
            bytes_up: session.bytes_up,
            bytes_down: session.bytes_down,
            reason: session.reason,
            duration_ms: session.duration.as_millis() as u64,
        });

        Ok(session)
    }
}

/// Run both directions until they finish, the grace period runs out, the
/// tunnel goes idle or the proxy shuts down. Returns the termination reason.
async fn splice<CR, CW, UR, UW>(
    client: (CR, CW),
    upstream: (UR, UW),
    counters: (&AtomicU64, &AtomicU64),
    grace: Duration,
    idle: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let (client_read, client_write) = client;
    let (upstream_read, upstream_write) = upstream;
    let (bytes_up, bytes_down) = counters;

    let up = pump(client_read, upstream_write, bytes_up);
    let down = pump(upstream_read, client_write, bytes_down);
    tokio::pin!(up);
    tokio::pin!(down);

    let first = tokio::select! {
        result = &mut up => FirstDone::Client(result),
        result = &mut down => FirstDone::Server(result),
        _ = idle_watch(counters, idle) => FirstDone::Idle,
        _ = shutdown_signal(shutdown) => FirstDone::Shutdown,
    };

    match first {
        FirstDone::Client(result) => {
            finish(result, CloseReason::ClientClosed, down, grace, shutdown).await
        }
        FirstDone::Server(result) => {
            finish(result, CloseReason::ServerClosed, up, grace, shutdown).await
        }
        FirstDone::Idle => {
            debug!("Tunnel idle for {:?}, closing", idle);
            CloseReason::IdleTimeout
        }
        FirstDone::Shutdown => CloseReason::Shutdown,
    }
}

enum FirstDone {
    Client(std::io::Result<()>),
    Server(std::io::Result<()>),
    Idle,
    Shutdown,
}

/// Resolve once a whole `idle` period passes with no bytes relayed either way.
async fn idle_watch(counters: (&AtomicU64, &AtomicU64), idle: Duration) {
    let relayed = || counters.0.load(Ordering::Relaxed) + counters.1.load(Ordering::Relaxed);
    let mut last = relayed();
    loop {
        tokio::time::sleep(idle).await;
        let now = relayed();
        if now == last {
            return;
        }
        last = now;
    }
}

/// Give the surviving direction `grace` to finish after the first one ended.
async fn finish<F>(
    first: std::io::Result<()>,
    closed_by: CloseReason,
    other: F,
    grace: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = first {
        debug!("Tunnel relay error: {}", e);
        return CloseReason::Error;
    }

    tokio::select! {
        outcome = timeout(grace, other) => match outcome {
            Ok(Ok(())) => closed_by,
            Ok(Err(e)) => {
                debug!("Tunnel relay error after half-close: {}", e);
                CloseReason::Error
            }
            Err(_) => CloseReason::GraceExpired,
        },
        _ = shutdown_signal(shutdown) => CloseReason::Shutdown,
    }
}

/// Copy `from` into `to` until EOF, then half-close `to`.
async fn pump<R, W>(mut from: R, mut to: W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            // The peer may already be gone; the FIN is best effort.
            let _ = to.shutdown().await;
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
