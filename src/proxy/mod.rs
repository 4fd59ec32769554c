//! Forwarding proxy: policy, dispatch, caching pipeline and tunnels.
//!
//! This module provides the network side of webproxy:
//! - Plain HTTP forwarding with a shared response cache
//! - HTTP CONNECT tunnels for HTTPS, relayed without inspection
//! - Host and path policy with runtime block/allow changes
//!
//! # Architecture
//!
//! ```text
//!  client ──► ProxyServer (accept loop, one task per connection)
//!                 │
//!                 ▼
//!             Dispatcher ── PolicyStore (blocked → 403)
//!              │        │
//!         HTTP │        │ CONNECT
//!              ▼        ▼
//!   ResponsePipeline   TunnelRelay ──► target (raw TCP)
//!     │         │
//!     ▼         ▼
//! CacheStore  UpstreamConnector ──► origin (HTTP/1.1, Connection: close)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use webproxy::proxy::{PolicyStore, ProxyServerBuilder};
//! use std::sync::Arc;
//!
//! let policy = Arc::new(PolicyStore::from_config(&config.policy)?);
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! let server = ProxyServerBuilder::from_settings(&config.proxy)?
//!     .policy(policy.clone())
//!     .bind(shutdown_rx)
//!     .await?;
//! server.run().await?;
//! ```

pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod server;
pub mod tunnel;
pub mod upstream;

// Re-export main types for convenient access
pub use dispatch::Dispatcher;
pub use error::{ProxyError, ProxyResult};
pub use pipeline::{ResponsePipeline, Served};
pub use policy::{PolicyDecision, PolicyRule, PolicyStore, RuleAction, RuleSet, normalize_pattern};
pub use server::{ProxyConfig, ProxyServer, ProxyServerBuilder};
pub use tunnel::{TunnelRelay, TunnelSession};
pub use upstream::UpstreamConnector;
