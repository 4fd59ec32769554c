//! Proxy listener and accept loop.
//!
//! This module provides the main proxy server that:
//! - Binds the TCP listening socket with the configured backlog
//! - Accepts client connections and hands each one to its own Tokio task
//! - Enforces the optional concurrent connection limit
//! - Stops accepting when the shutdown signal fires
//!
//! # Example
//!
//! ```ignore
//! use webproxy::proxy::ProxyServerBuilder;
//! use std::sync::Arc;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! let server = ProxyServerBuilder::from_settings(&config.proxy)?
//!     .policy(policy)
//!     .cache(Some(cache))
//!     .audit(audit)
//!     .bind(shutdown_rx)
//!     .await?;
//! tokio::spawn(server.run());
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use super::dispatch::{DEFAULT_CLIENT_IDLE_TIMEOUT, Dispatcher};
use super::error::{ProxyError, ProxyResult};
use super::pipeline::ResponsePipeline;
use super::policy::PolicyStore;
use super::tunnel::{DEFAULT_TUNNEL_GRACE, DEFAULT_TUNNEL_IDLE_TIMEOUT, TunnelRelay};
use super::upstream::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, UpstreamConnector};
use crate::cache::{CacheLimits, CacheStore};
use crate::config::{ConfigError, ProxySettings};
use crate::http::{Limits, Response};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Default listen address.
pub const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 4000);

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Listen backlog.
    pub backlog: u32,
    /// Maximum concurrent client connections, 0 for unlimited.
    pub max_connections: usize,
    /// Size limits for heads and bodies, applied to clients and upstreams.
    pub limits: Limits,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
    /// Upstream exchange timeout.
    pub read_timeout: Duration,
    /// Idle timeout for kept-alive client connections.
    pub client_idle_timeout: Duration,
    /// Grace period for the surviving direction of a half-closed tunnel.
    pub tunnel_grace: Duration,
    /// How long an established tunnel may carry no bytes before it is closed.
    pub tunnel_idle_timeout: Duration,
    /// Static host -> address map consulted before DNS.
    pub host_overrides: HashMap<String, SocketAddr>,
    /// Policy store shared with the control plane.
    pub policy: Arc<PolicyStore>,
    /// Response cache, `None` to disable caching.
    pub cache: Option<Arc<CacheStore>>,
    /// Reference to the audit logger.
    pub audit: Arc<AuditLogger>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            backlog: DEFAULT_BACKLOG,
            max_connections: 0,
            limits: Limits::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            client_idle_timeout: DEFAULT_CLIENT_IDLE_TIMEOUT,
            tunnel_grace: DEFAULT_TUNNEL_GRACE,
            tunnel_idle_timeout: DEFAULT_TUNNEL_IDLE_TIMEOUT,
            host_overrides: HashMap::new(),
            policy: Arc::new(PolicyStore::new()),
            cache: Some(Arc::new(CacheStore::new(CacheLimits::default()))),
            audit: Arc::new(AuditLogger::new_null()),
        }
    }
}

/// The main proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    /// Permits for the connection limit, if one is set.
    limiter: Option<Arc<Semaphore>>,
    policy: Arc<PolicyStore>,
    cache: Option<Arc<CacheStore>>,
    audit: Arc<AuditLogger>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket.
    ///
    /// Failing to bind is fatal and reported as [`ProxyError::Bind`].
    pub async fn bind(config: ProxyConfig, shutdown_rx: watch::Receiver<bool>) -> ProxyResult<Self> {
        let listener = bind_listener(config.listen, config.backlog)?;

        let connector = Arc::new(
            UpstreamConnector::new(config.connect_timeout, config.read_timeout)
                .with_limits(config.limits)
                .with_host_overrides(config.host_overrides),
        );
        let pipeline = ResponsePipeline::new(
            config.cache.clone(),
            connector.clone(),
            config.audit.clone(),
        );
        let tunnel = TunnelRelay::new(connector, config.tunnel_grace, config.audit.clone())
            .with_idle_timeout(config.tunnel_idle_timeout);
        let dispatcher = Dispatcher::new(
            config.policy.clone(),
            pipeline,
            tunnel,
            config.audit.clone(),
        )
        .with_limits(config.limits)
        .with_idle_timeout(config.client_idle_timeout);

        let limiter = (config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.max_connections)));

        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            limiter,
            policy: config.policy,
            cache: config.cache,
            audit: config.audit,
            shutdown_rx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The policy store used by this server.
    pub fn policy(&self) -> Arc<PolicyStore> {
        self.policy.clone()
    }

    /// The response cache, if enabled.
    pub fn cache(&self) -> Option<Arc<CacheStore>> {
        self.cache.clone()
    }

    /// Run the accept loop.
    ///
    /// Returns when the shutdown signal is received. Connections already
    /// being served see the same signal and wind down on their own.
    pub async fn run(self) -> ProxyResult<()> {
        let local = self.local_addr()?;
        info!("Proxy listening on {}", local);
        self.audit.log(AuditEvent::ProxyStart {
            listen: local.to_string(),
            pid: std::process::id(),
        });
        let started = Instant::now();

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            self.spawn_connection_handler(stream, peer);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_signal(&mut shutdown_rx) => {
                    info!("Proxy shutting down");
                    break;
                }
            }
        }

        self.audit.log(AuditEvent::ProxyStop {
            duration_sec: started.elapsed().as_secs(),
        });
        Ok(())
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(&self, mut stream: TcpStream, peer: SocketAddr) {
        let permit = match &self.limiter {
            Some(limiter) => match limiter.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("Connection limit reached, refusing {}", peer);
                    tokio::spawn(async move {
                        let mut response =
                            Response::error(StatusCode::SERVICE_UNAVAILABLE, "Too many connections");
                        response.headers.set("Connection", "close");
                        let _ = response.write_to(&mut stream).await;
                        let _ = stream.shutdown().await;
                    });
                    return;
                }
            },
            None => None,
        };

        let dispatcher = self.dispatcher.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = dispatcher.accept(stream, peer, shutdown_rx).await {
                if is_routine(&e) {
                    debug!("Connection from {} ended: {}", peer, e);
                } else {
                    warn!("Connection error from {}: {}", peer, e);
                }
            }
        });
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("listener", &self.listener.local_addr().ok())
            .field("limiter", &self.limiter.as_ref().map(|l| l.available_permits()))
            .finish_non_exhaustive()
    }
}

/// Builder for ProxyServer configuration.
#[derive(Debug, Default)]
pub struct ProxyServerBuilder {
    config: ProxyConfig,
}

impl ProxyServerBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the `[proxy]` configuration section.
    pub fn from_settings(settings: &ProxySettings) -> Result<Self, ConfigError> {
        let config = ProxyConfig {
            listen: settings.listen_addr()?,
            backlog: settings.backlog,
            max_connections: settings.max_connections.unwrap_or(0),
            limits: Limits {
                max_header_bytes: settings.max_header_bytes,
                max_body_bytes: settings.max_body_bytes,
            },
            connect_timeout: settings.connect_timeout(),
            read_timeout: settings.read_timeout(),
            client_idle_timeout: settings.client_idle_timeout(),
            tunnel_grace: settings.tunnel_grace(),
            tunnel_idle_timeout: settings.tunnel_idle_timeout(),
            host_overrides: settings.resolved_host_overrides()?,
            ..ProxyConfig::default()
        };
        Ok(Self { config })
    }

    /// Set the listen address.
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.config.listen = addr;
        self
    }

    /// Set the concurrent connection limit, 0 for unlimited.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set head and body size limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the upstream connect and exchange timeouts.
    pub fn upstream_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.config.connect_timeout = connect;
        self.config.read_timeout = read;
        self
    }

    /// Set the idle timeout for kept-alive client connections.
    pub fn client_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.client_idle_timeout = timeout;
        self
    }

    /// Set the tunnel half-close grace period.
    pub fn tunnel_grace(mut self, grace: Duration) -> Self {
        self.config.tunnel_grace = grace;
        self
    }

    /// Set how long an established tunnel may sit idle.
    pub fn tunnel_idle_timeout(mut self, idle: Duration) -> Self {
        self.config.tunnel_idle_timeout = idle;
        self
    }

    /// Route `host` to a fixed address instead of resolving it.
    pub fn host_override(mut self, host: &str, addr: SocketAddr) -> Self {
        self.config
            .host_overrides
            .insert(host.to_ascii_lowercase(), addr);
        self
    }

    /// Set the policy store.
    pub fn policy(mut self, policy: Arc<PolicyStore>) -> Self {
        self.config.policy = policy;
        self
    }

    /// Set the response cache, `None` to disable caching.
    pub fn cache(mut self, cache: Option<Arc<CacheStore>>) -> Self {
        self.config.cache = cache;
        self
    }

    /// Set the audit logger.
    pub fn audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.config.audit = audit;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the server.
    ///
    /// # Arguments
    ///
    /// * `shutdown_rx` - Receiver for shutdown signal.
    pub async fn bind(self, shutdown_rx: watch::Receiver<bool>) -> ProxyResult<ProxyServer> {
        ProxyServer::bind(self.config, shutdown_rx).await
    }
}

/// Resolves once the shutdown flag is set.
///
/// A dropped sender never resolves, so tasks keep running until their own
/// work ends.
pub(crate) async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> ProxyResult<TcpListener> {
    let bind_error = |source: std::io::Error| ProxyError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(backlog).map_err(bind_error)
}

/// Errors that are part of normal traffic and only worth a debug line.
fn is_routine(error: &ProxyError) -> bool {
    use std::io::ErrorKind;
    match error {
        ProxyError::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::BrokenPipe
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
        ),
        ProxyError::Parse(_)
        | ProxyError::UpstreamConnect { .. }
        | ProxyError::UpstreamResponse { .. }
        | ProxyError::Timeout { .. } => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let (_tx, rx) = watch::channel(false);
        let server = ProxyServerBuilder::new()
            .listen(loopback())
            .bind(rx)
            .await
            .unwrap();

        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = ProxyServerBuilder::new()
            .listen(addr)
            .bind(rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_audits() {
        let audit = Arc::new(AuditLogger::new_memory());
        let (tx, rx) = watch::channel(false);
        let server = ProxyServerBuilder::new()
            .listen(loopback())
            .audit(audit.clone())
            .bind(rx)
            .await
            .unwrap();

        let handle = tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let events = audit.recorded();
        assert!(events[0].contains("\"event\":\"proxy_start\""));
        assert!(events.last().unwrap().contains("\"event\":\"proxy_stop\""));
    }

    #[tokio::test]
    async fn test_connection_limit_refuses_with_503() {
        let (_tx, rx) = watch::channel(false);
        let server = ProxyServerBuilder::new()
            .listen(loopback())
            .max_connections(1)
            .bind(rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        // Holds the only permit while it sits idle.
        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut reply = Vec::new();
        second.read_to_end(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 503 "));
    }

    #[tokio::test]
    async fn test_shutdown_signal_ignores_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited =
            tokio::time::timeout(Duration::from_millis(20), shutdown_signal(&mut rx)).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_builder_from_settings() {
        let mut settings = ProxySettings {
            listen: "127.0.0.1:8123".to_string(),
            backlog: 64,
            max_connections: Some(10),
            max_header_bytes: 1024,
            max_body_bytes: 2048,
            connect_timeout_ms: 100,
            read_timeout_ms: 200,
            client_idle_timeout_ms: 300,
            tunnel_grace_ms: 400,
            tunnel_idle_timeout_ms: 500,
            ..Default::default()
        };
        settings
            .host_overrides
            .insert("Example.COM".to_string(), "127.0.0.1:9000".to_string());

        let builder = ProxyServerBuilder::from_settings(&settings).unwrap();
        let config = builder.config();
        assert_eq!(config.listen.port(), 8123);
        assert_eq!(config.backlog, 64);
        assert_eq!(config.limits.max_body_bytes, 2048);
        assert_eq!(config.read_timeout, Duration::from_millis(200));
        assert_eq!(config.tunnel_grace, Duration::from_millis(400));
        assert_eq!(config.tunnel_idle_timeout, Duration::from_millis(500));
        assert_eq!(config.max_connections, 10);
        assert_eq!(
            config.host_overrides.get("example.com"),
            Some(&"127.0.0.1:9000".parse().unwrap())
        );
    }
}
