//! Telemetry and audit logging for webproxy.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): policy decisions, tunnels, cache hits and rule
//!   changes go to syslog as JSON, one event per line
//! - **Debug logging** (tracing): diagnostics go to stderr via `tracing`
//! - These are completely separate concerns
//!
//! # Usage
//!
//! ```ignore
//! use webproxy::telemetry::{AuditEvent, AuditLogger};
//! use std::sync::Arc;
//!
//! let audit = Arc::new(AuditLogger::new().unwrap_or_else(|_| AuditLogger::new_null()));
//! audit.log(AuditEvent::ProxyStart {
//!     listen: "127.0.0.1:4000".to_string(),
//!     pid: std::process::id(),
//! });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"request_blocked","client":"127.0.0.1:51200","method":"GET","target":"http://ads.example.com/","rule":"ads.example.com"}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, CacheStatus, CloseReason, RuleChange, TimestampedEvent};
pub use syslog::{AuditLogger, SYSLOG_TAG};
