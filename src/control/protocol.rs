//! Control socket message types.
//!
//! Each client request gets exactly one response on the same connection.
//!
//! ```text
//! ┌─────────────────┐   ControlRequest    ┌─────────────────┐
//! │                 │────────────────────>│                 │
//! │  webproxy CLI   │                     │  running proxy  │
//! │                 │<────────────────────│                 │
//! └─────────────────┘   ControlResponse   └─────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::proxy::PolicyRule;

/// Requests a management client can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Add or overwrite a block rule.
    Block {
        /// Pattern to block.
        pattern: String,
    },
    /// Remove a block rule.
    Unblock {
        /// Pattern to unblock.
        pattern: String,
    },
    /// Add or overwrite an allow rule.
    Allow {
        /// Pattern to allow.
        pattern: String,
    },
    /// Remove a rule regardless of its action.
    Remove {
        /// Pattern to remove.
        pattern: String,
    },
    /// List all policy rules.
    ListRules,
    /// Report cache statistics.
    CacheStats,
    /// Drop every cached response.
    PurgeCache,
}

/// Responses sent by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    /// A rule change was applied.
    RuleUpdated {
        /// Normalized pattern.
        pattern: String,
        /// Whether the rule set actually changed.
        changed: bool,
    },
    /// Current rules, sorted by pattern.
    Rules(Vec<PolicyRule>),
    /// Cache statistics, `None` when caching is disabled.
    Stats(Option<CacheStats>),
    /// Number of cache entries dropped.
    Purged(usize),
    /// The request could not be applied.
    Error(String),
}
