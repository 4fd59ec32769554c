//! Outbound connections to origin servers.
//!
//! Every upstream exchange uses a fresh connection marked `Connection: close`,
//! so a response without explicit framing is always delimited by EOF.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::{ProxyError, ProxyResult};
use crate::http::{Limits, ParseError, Request, Response, Target, read_response};

/// Default timeout for establishing an upstream TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the whole request/response exchange.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens connections to origin servers and performs single exchanges.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
    limits: Limits,
    host_overrides: HashMap<String, SocketAddr>,
}

impl Default for UpstreamConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

impl UpstreamConnector {
    /// Create a connector with the given timeouts and default size limits.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            limits: Limits::default(),
            host_overrides: HashMap::new(),
        }
    }

    /// Size limits applied to upstream responses.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Route connections for `host` to a fixed address instead of DNS.
    pub fn with_host_override(mut self, host: &str, addr: SocketAddr) -> Self {
        self.host_overrides.insert(host.to_ascii_lowercase(), addr);
        self
    }

    /// Replace the whole host override table. Keys must be lowercase.
    pub fn with_host_overrides(mut self, overrides: HashMap<String, SocketAddr>) -> Self {
        self.host_overrides = overrides;
        self
    }

    /// Timeout for establishing a connection.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open a TCP connection to `host:port`.
    ///
    /// Name resolution and the connect itself share one timeout.
    pub async fn connect(&self, host: &str, port: u16) -> ProxyResult<TcpStream> {
        let addr = format!("{}:{}", host, port);
        let override_addr = self.host_overrides.get(&host.to_ascii_lowercase()).copied();

        let attempt = async {
            match override_addr {
                Some(resolved) => {
                    trace!("Connecting to {} via override {}", addr, resolved);
                    TcpStream::connect(resolved).await
                }
                None => TcpStream::connect((host, port)).await,
            }
        };

        match timeout(self.connect_timeout, attempt).await {
            Ok(Ok(stream)) => {
                // Best effort; small requests should not wait on Nagle.
                let _ = stream.set_nodelay(true);
                debug!("Connected to upstream {}", addr);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
                addr,
                message: e.to_string(),
            }),
            Err(_) => Err(ProxyError::Timeout { addr }),
        }
    }

    /// Send `outgoing` to the origin named by `target` and read the response.
    ///
    /// `outgoing` must already be in origin-form (see [`Request::to_upstream`]).
    /// Returns the response together with the time the exchange took.
    pub async fn send(
        &self,
        target: &Target,
        outgoing: &Request,
    ) -> ProxyResult<(Response, Duration)> {
        let started = Instant::now();
        let addr = target.authority();
        let mut stream = self.connect(&target.host, target.port).await?;

        let exchange = async {
            outgoing.write_to(&mut stream).await.map_err(ParseError::Io)?;
            let mut reader = BufReader::new(&mut stream);
            read_response(&mut reader, &outgoing.method, &self.limits).await
        };

        match timeout(self.read_timeout, exchange).await {
            Ok(Ok(response)) => {
                let elapsed = started.elapsed();
                debug!(
                    "{} {} -> {} in {:?}",
                    outgoing.method,
                    target,
                    response.status.as_u16(),
                    elapsed
                );
                Ok((response, elapsed))
            }
            Ok(Err(source)) => Err(ProxyError::UpstreamResponse { addr, source }),
            Err(_) => Err(ProxyError::Timeout { addr }),
        }
    }
}
