//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `WEBPROXY` tag.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for the proxy.
///
/// Each variant is one line of JSON in the audit trail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Proxy started listening.
    ProxyStart {
        /// Bound listen address.
        listen: String,
        /// Process ID.
        pid: u32,
    },

    /// Proxy shut down.
    ProxyStop {
        /// Uptime in seconds.
        duration_sec: u64,
    },

    /// An HTTP request was allowed and answered.
    RequestAllowed {
        /// Client socket address.
        client: String,
        /// Request method.
        method: String,
        /// Normalized absolute URL.
        url: String,
        /// Status sent to the client.
        status: u16,
        /// How the cache was involved.
        cache: CacheStatus,
    },

    /// A request or tunnel was refused by policy.
    RequestBlocked {
        /// Client socket address.
        client: String,
        /// Request method.
        method: String,
        /// URL or `host:port` that was refused.
        target: String,
        /// Pattern of the blocking rule.
        rule: String,
    },

    /// A response was served from cache.
    CacheHit {
        /// Normalized absolute URL.
        url: String,
        /// Upstream fetch time avoided, in milliseconds.
        saved_ms: u64,
    },

    /// A CONNECT tunnel ended.
    TunnelClosed {
        /// Tunnel session ID.
        id: String,
        /// Client socket address.
        client: String,
        /// `host:port` of the tunnel.
        target: String,
        /// Bytes relayed client -> target.
        bytes_up: u64,
        /// Bytes relayed target -> client.
        bytes_down: u64,
        /// Why the tunnel ended.
        reason: CloseReason,
        /// Tunnel lifetime in milliseconds.
        duration_ms: u64,
    },

    /// A policy rule was changed through the control socket.
    RuleChanged {
        /// Normalized pattern.
        pattern: String,
        /// What happened to it.
        change: RuleChange,
    },
}

/// Cache involvement in an allowed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Served from a fresh entry.
    Hit,
    /// Stale entry confirmed by a 304.
    Revalidated,
    /// Fetched from upstream.
    Miss,
    /// Not eligible for caching.
    Bypass,
}

/// Reasons a tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client closed its side first.
    ClientClosed,
    /// The target closed its side first.
    ServerClosed,
    /// The other direction did not finish within the grace period.
    GraceExpired,
    /// No bytes moved in either direction for the idle timeout.
    IdleTimeout,
    /// A socket error ended the relay.
    Error,
    /// The proxy is shutting down.
    Shutdown,
}

/// Kinds of policy change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleChange {
    /// Block rule added or changed.
    Block,
    /// Allow rule added or changed.
    Allow,
    /// Rule removed.
    Remove,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
