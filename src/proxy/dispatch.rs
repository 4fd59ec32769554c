//! Per-connection request dispatcher.
//!
//! Reads request heads off a client connection, applies the policy, and
//! routes each request either to the response pipeline (plain HTTP) or to
//! the tunnel relay (CONNECT). Plain HTTP connections are kept alive for
//! sequential requests until the client asks to close or goes idle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::error::{ProxyError, ProxyResult};
use super::pipeline::{ResponsePipeline, Served};
use super::policy::{PolicyDecision, PolicyStore};
use super::server::shutdown_signal;
use super::tunnel::TunnelRelay;
use crate::http::{
    BodyKind, Limits, ParseError, Request, Response, Target, Version, read_request_body,
    read_request_head, request_body_kind,
};
use crate::telemetry::{AuditEvent, AuditLogger, CacheStatus};

/// Default time a client connection may sit idle between requests.
pub const DEFAULT_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes requests from client connections.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    policy: Arc<PolicyStore>,
    pipeline: ResponsePipeline,
    tunnel: TunnelRelay,
    audit: Arc<AuditLogger>,
    limits: Limits,
    idle_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        policy: Arc<PolicyStore>,
        pipeline: ResponsePipeline,
        tunnel: TunnelRelay,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            policy,
            pipeline,
            tunnel,
            audit,
            limits: Limits::default(),
            idle_timeout: DEFAULT_CLIENT_IDLE_TIMEOUT,
        }
    }

    /// Size limits for client request heads and bodies.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// How long to wait for the next request on a kept-alive connection.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Serve one client connection until it closes.
    ///
    /// Errors are contained to this connection. Protocol errors are answered
    /// with a 400/413/431 page before the error is returned.
    pub async fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProxyResult<()> {
        let mut reader = BufReader::new(stream);

        loop {
            let next = tokio::select! {
                read = timeout(self.idle_timeout, read_request_head(&mut reader, &self.limits)) => read,
                _ = shutdown_signal(&mut shutdown) => {
                    debug!("Closing connection from {} for shutdown", peer);
                    return Ok(());
                }
            };

            let mut request = match next {
                Ok(Ok(Some(request))) => request,
                Ok(Ok(None)) => {
                    trace!("Client {} closed the connection", peer);
                    return Ok(());
                }
                Ok(Err(e)) => return self.refuse_parse_error(reader.get_mut(), e).await,
                Err(_) => {
                    debug!("Client {} idle for {:?}, closing", peer, self.idle_timeout);
                    return Ok(());
                }
            };

            let target =
                match Target::from_request(&request.method, &request.target, &request.headers) {
                    Ok(target) => target,
                    Err(e) => return self.refuse_parse_error(reader.get_mut(), e).await,
                };

            if request.method == Method::CONNECT {
                let buffered = reader.buffer().to_vec();
                let client = reader.into_inner();
                return self
                    .open_tunnel(client, peer, &buffered, &request, &target, shutdown)
                    .await;
            }

            let close = request.wants_close();

            if let PolicyDecision::Block { rule } =
                self.policy.evaluate(&target.host, Some(target.path()))
            {
                self.report_blocked(peer, &request, target.absolute_url(), rule);
                // A body we never read would be parsed as the next request.
                let has_body = !matches!(request_body_kind(&request.headers), Ok(BodyKind::Empty));
                let close = close || has_body;
                respond(reader.get_mut(), Response::blocked(), &request, close).await?;
                if close {
                    let _ = reader.get_mut().shutdown().await;
                    return Ok(());
                }
                continue;
            }

            if request.expects_continue() {
                Response::status_only(StatusCode::CONTINUE)
                    .write_to(reader.get_mut())
                    .await?;
            }

            request.body = match timeout(
                self.idle_timeout,
                read_request_body(&mut reader, &request, &self.limits),
            )
            .await
            {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => return self.refuse_parse_error(reader.get_mut(), e).await,
                Err(_) => {
                    debug!("Client {} stalled sending a request body", peer);
                    return Ok(());
                }
            };

            let url = target.absolute_url();
            let served = match self.pipeline.handle(&request, &target).await {
                Ok(served) => served,
                Err(e) => {
                    warn!("{} {} failed: {}", request.method, url, e);
                    Served {
                        response: Response::error(e.status(), &e.to_string()),
                        cache: CacheStatus::Bypass,
                    }
                }
            };

            let status = served.response.status;
            respond(reader.get_mut(), served.response, &request, close).await?;
            debug!("{} {} {} -> {}", peer, request.method, url, status.as_u16());
            self.audit.log(AuditEvent::RequestAllowed {
                client: peer.to_string(),
                method: request.method.to_string(),
                url,
                status: status.as_u16(),
                cache: served.cache,
            });

            if close {
                let _ = reader.get_mut().shutdown().await;
                return Ok(());
            }
        }
    }

    async fn open_tunnel(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        buffered: &[u8],
        request: &Request,
        target: &Target,
        shutdown: watch::Receiver<bool>,
    ) -> ProxyResult<()> {
        if let PolicyDecision::Block { rule } = self.policy.evaluate(&target.host, None) {
            self.report_blocked(peer, request, target.authority(), rule);
            Response::status_only(StatusCode::FORBIDDEN)
                .write_to(&mut client)
                .await?;
            let _ = client.shutdown().await;
            return Ok(());
        }

        self.tunnel
            .relay(client, peer, buffered, target, shutdown)
            .await
            .map(|_| ())
    }

    fn report_blocked(&self, peer: SocketAddr, request: &Request, target: String, rule: String) {
        info!(
            "Blocked {} {} from {} (rule '{}')",
            request.method, target, peer, rule
        );
        self.audit.log(AuditEvent::RequestBlocked {
            client: peer.to_string(),
            method: request.method.to_string(),
            target,
            rule,
        });
    }

    /// Answer a malformed request and end the connection.
    async fn refuse_parse_error(&self, stream: &mut TcpStream, error: ParseError) -> ProxyResult<()> {
        if !error.is_protocol_error() {
            return Err(error.into());
        }

        let error = ProxyError::Parse(error);
        debug!("Refusing request: {}", error);
        let mut response = Response::error(error.status(), &error.to_string());
        response.headers.set("Connection", "close");
        let _ = response.write_to(stream).await;
        let _ = stream.shutdown().await;
        Err(error)
    }
}

/// Write `response` to the client with connection management fields set.
async fn respond(
    stream: &mut TcpStream,
    mut response: Response,
    request: &Request,
    close: bool,
) -> std::io::Result<()> {
    response.version = Version::Http11;
    if close {
        response.headers.set("Connection", "close");
    } else if request.version == Version::Http10 {
        response.headers.set("Connection", "keep-alive");
    }
    response.write_to(stream).await
}
