//! Unix socket transport for the management interface.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐  Unix Socket  ┌──────────────────────────┐
//! │     webproxy serve       │←─────────────→│   webproxy block ...     │
//! │  ┌──────────────────┐    │    bincode    │  ┌──────────────────┐    │
//! │  │  ControlServer   │    │               │  │  ControlClient   │    │
//! │  └──────────────────┘    │               │  └──────────────────┘    │
//! └──────────────────────────┘               └──────────────────────────┘
//! ```
//!
//! # Message Framing
//!
//! Messages use length-prefixed bincode:
//! ```text
//! [4 bytes: message length (big-endian u32)]
//! [N bytes: bincode-serialized message]
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::{ControlError, ControlResult};
use super::protocol::{ControlRequest, ControlResponse};
use crate::cache::CacheStore;
use crate::proxy::{PolicyStore, RuleAction, normalize_pattern};
use crate::telemetry::{AuditEvent, AuditLogger, RuleChange};

/// Maximum message size. Rule lists are the largest messages.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Applies control requests to the live stores.
#[derive(Debug, Clone)]
pub struct ControlHandler {
    policy: Arc<PolicyStore>,
    cache: Option<Arc<CacheStore>>,
    audit: Arc<AuditLogger>,
}

impl ControlHandler {
    /// Create a handler over the proxy's stores.
    pub fn new(
        policy: Arc<PolicyStore>,
        cache: Option<Arc<CacheStore>>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            policy,
            cache,
            audit,
        }
    }

    /// Apply one request and build its response.
    pub fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Block { pattern } => {
                self.change_rule(&pattern, RuleChange::Block, |p| self.policy.block(p))
            }
            ControlRequest::Allow { pattern } => self.change_rule(&pattern, RuleChange::Allow, |p| {
                self.policy.add_rule(p, RuleAction::Allow)
            }),
            ControlRequest::Unblock { pattern } => {
                self.change_rule(&pattern, RuleChange::Remove, |p| self.policy.unblock(p))
            }
            ControlRequest::Remove { pattern } => {
                self.change_rule(&pattern, RuleChange::Remove, |p| self.policy.remove_rule(p))
            }
            ControlRequest::ListRules => ControlResponse::Rules(self.policy.rules()),
            ControlRequest::CacheStats => {
                ControlResponse::Stats(self.cache.as_ref().map(|cache| cache.stats()))
            }
            ControlRequest::PurgeCache => {
                let purged = self.cache.as_ref().map_or(0, |cache| cache.clear());
                info!("Purged {} cache entries", purged);
                ControlResponse::Purged(purged)
            }
        }
    }

    fn change_rule<F>(&self, pattern: &str, change: RuleChange, apply: F) -> ControlResponse
    where
        F: FnOnce(&str) -> Result<bool, crate::proxy::ProxyError>,
    {
        let normalized = match normalize_pattern(pattern) {
            Ok(normalized) => normalized,
            Err(e) => return ControlResponse::Error(e.to_string()),
        };

        match apply(&normalized) {
            Ok(changed) => {
                if changed {
                    info!("Policy change: {:?} {}", change, normalized);
                    self.audit.log(AuditEvent::RuleChanged {
                        pattern: normalized.clone(),
                        change,
                    });
                }
                ControlResponse::RuleUpdated {
                    pattern: normalized,
                    changed,
                }
            }
            Err(e) => ControlResponse::Error(e.to_string()),
        }
    }
}

/// Server side of the control socket, owned by the running proxy.
pub struct ControlServer {
    /// The Unix listener (std version, can be created outside tokio runtime).
    /// Option allows moving it out in serve() since we implement Drop.
    listener: Option<StdUnixListener>,
    /// Path to the socket file.
    socket_path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket at `socket_path`.
    ///
    /// A stale socket file at the path is removed first, missing parent
    /// directories are created, and the socket is restricted to the owner.
    pub fn bind<P: AsRef<Path>>(socket_path: P) -> ControlResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let bind_error = |source: io::Error| ControlError::Bind {
            path: socket_path.display().to_string(),
            source,
        };

        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent).map_err(bind_error)?;
        }
        if socket_path.exists() {
            fs::remove_file(&socket_path).map_err(bind_error)?;
        }

        let listener = StdUnixListener::bind(&socket_path).map_err(bind_error)?;
        // Set non-blocking so we can convert to tokio later
        listener.set_nonblocking(true).map_err(bind_error)?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600)).map_err(bind_error)?;
        info!("Control socket listening on {:?}", socket_path);

        Ok(Self {
            listener: Some(listener),
            socket_path,
        })
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve clients until shutdown. Each client may send several requests.
    pub async fn serve(
        mut self,
        handler: ControlHandler,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> ControlResult<()> {
        let std_listener = self
            .listener
            .take()
            .ok_or_else(|| io::Error::other("listener already consumed"))?;
        let listener = UnixListener::from_std(std_listener)?;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("Control client connected");
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            match serve_client(stream, &handler).await {
                                Ok(()) | Err(ControlError::ConnectionClosed) => {}
                                Err(e) => warn!("Control client error: {}", e),
                            }
                            debug!("Control client finished");
                        });
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                },
                _ = crate::proxy::server::shutdown_signal(&mut shutdown_rx) => {
                    debug!("Control socket shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        // Clean up socket file
        if self.socket_path.exists()
            && let Err(e) = fs::remove_file(&self.socket_path)
        {
            warn!("Failed to remove control socket file: {}", e);
        }
    }
}

async fn serve_client(mut stream: UnixStream, handler: &ControlHandler) -> ControlResult<()> {
    loop {
        let request: ControlRequest = read_frame(&mut stream).await?;
        debug!("Control request: {:?}", request);
        let response = handler.handle(request);
        write_frame(&mut stream, &response).await?;
    }
}

/// Client side of the control socket.
#[derive(Debug)]
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    /// Connect to a running proxy.
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> ControlResult<Self> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| ControlError::Connect {
                path: socket_path.display().to_string(),
                source,
            })?;
        debug!("Connected to control socket at {:?}", socket_path);
        Ok(Self { stream })
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, request: &ControlRequest) -> ControlResult<ControlResponse> {
        write_frame(&mut self.stream, request).await?;
        read_frame(&mut self.stream).await
    }
}

/// Read and decode one length-prefixed frame.
async fn read_frame<R, T>(reader: &mut R) -> ControlResult<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let data = read_message(reader).await?;
    Ok(bincode::deserialize(&data)?)
}

/// Encode and write one length-prefixed frame.
async fn write_frame<W, T>(writer: &mut W, message: &T) -> ControlResult<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(message)?;
    write_message(writer, &data).await
}

/// Read a length-prefixed message from the stream.
async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> ControlResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ControlError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ControlError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ControlError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed message to the stream.
async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> ControlResult<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ControlError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use crate::proxy::PolicyRule;
    use tempfile::tempdir;

    fn handler() -> (ControlHandler, Arc<PolicyStore>, Arc<AuditLogger>) {
        let policy = Arc::new(PolicyStore::new());
        let cache = Arc::new(CacheStore::new(CacheLimits::default()));
        let audit = Arc::new(AuditLogger::new_memory());
        (
            ControlHandler::new(policy.clone(), Some(cache), audit.clone()),
            policy,
            audit,
        )
    }

    #[test]
    fn test_handler_block_normalizes_and_audits() {
        let (handler, policy, audit) = handler();

        let response = handler.handle(ControlRequest::Block {
            pattern: "HTTP://Bad.Example.com:80/".to_string(),
        });
        assert_eq!(
            response,
            ControlResponse::RuleUpdated {
                pattern: "bad.example.com".to_string(),
                changed: true,
            }
        );
        assert!(!policy.is_allowed("bad.example.com", Some("/")));

        let events = audit.recorded();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("\"change\":\"block\""));
    }

    #[test]
    fn test_handler_repeat_block_is_unchanged() {
        let (handler, _, audit) = handler();
        let request = ControlRequest::Block {
            pattern: "bad.example.com".to_string(),
        };
        handler.handle(request.clone());
        let response = handler.handle(request);

        assert!(matches!(response, ControlResponse::RuleUpdated { changed: false, .. }));
        assert_eq!(audit.recorded().len(), 1);
    }

    #[test]
    fn test_handler_rejects_invalid_pattern() {
        let (handler, _, _) = handler();
        let response = handler.handle(ControlRequest::Block {
            pattern: "*bad*".to_string(),
        });
        assert!(matches!(response, ControlResponse::Error(_)));
    }

    #[test]
    fn test_handler_cache_disabled() {
        let handler = ControlHandler::new(
            Arc::new(PolicyStore::new()),
            None,
            Arc::new(AuditLogger::new_null()),
        );
        assert_eq!(handler.handle(ControlRequest::CacheStats), ControlResponse::Stats(None));
        assert_eq!(handler.handle(ControlRequest::PurgeCache), ControlResponse::Purged(0));
    }

    #[tokio::test]
    async fn test_server_client_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");
        let (handler, _, _) = handler();
        let (tx, rx) = watch::channel(false);

        let server = ControlServer::bind(&socket_path).unwrap();
        let mode = fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let server_task = tokio::spawn(server.serve(handler, rx));

        let mut client = ControlClient::connect(&socket_path).await.unwrap();
        let response = client
            .request(&ControlRequest::Allow {
                pattern: "docs.example.com".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(response, ControlResponse::RuleUpdated { changed: true, .. }));

        let rules = client.request(&ControlRequest::ListRules).await.unwrap();
        assert_eq!(
            rules,
            ControlResponse::Rules(vec![PolicyRule {
                pattern: "docs.example.com".to_string(),
                action: RuleAction::Allow,
            }])
        );

        tx.send(true).unwrap();
        server_task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_connect_without_server_fails() {
        let temp_dir = tempdir().unwrap();
        let err = ControlClient::connect(temp_dir.path().join("missing.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, ControlError::MessageTooLarge(..)));
    }
}
