//! Destination policy store.
//!
//! Holds the allow/block rules consulted for every request. Policy is
//! fail-open: a destination no rule matches is allowed.
//!
//! # Pattern Matching
//!
//! - Exact host: `example.com`
//! - Host plus path prefix: `example.com/ads` matches `/ads`, `/ads/1.png`
//!   and `/adsense` on `example.com`
//! - Wildcard: `*.example.com` matches `api.example.com`, `a.b.example.com`
//!   but NOT `example.com` itself
//!
//! Patterns are normalized before use: a leading `http://` or `https://` is
//! stripped, as is any port, and the host is lowercased. A bare trailing `/`
//! means host-only.
//!
//! # Precedence
//!
//! The most specific matching rule decides: path-prefix rules beat host
//! rules, exact hosts beat wildcards, and longer patterns beat shorter ones.
//! This lets an allow rule carve an exception out of a broader block:
//!
//! ```text
//! block  *.example.com
//! allow  docs.example.com          -> docs.example.com allowed
//! block  docs.example.com/private  -> /private/* blocked again
//! ```
//!
//! # Concurrency
//!
//! Readers take an `Arc` snapshot of the rule set; writers build a new set and
//! swap it in, so a lookup never sees a half-applied update.

use super::error::ProxyError;
use crate::config::PolicyConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What a rule does with matching requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    /// Let the request through.
    Allow,
    /// Refuse the request.
    Block,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Block => write!(f, "block"),
        }
    }
}

/// A rule as exposed to management clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Normalized pattern.
    pub pattern: String,
    /// Action for matching requests.
    pub action: RuleAction,
}

/// Result of evaluating a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Allow the request.
    Allow {
        /// Pattern of the deciding rule, `None` for the fail-open default.
        rule: Option<String>,
    },
    /// Block the request.
    Block {
        /// Pattern of the deciding rule.
        rule: String,
    },
}

impl PolicyDecision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatch {
    Exact(String),
    /// Suffix after `*.`
    Wildcard(String),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    host: HostMatch,
    path_prefix: Option<String>,
    action: RuleAction,
}

impl CompiledRule {
    fn matches(&self, host: &str, path: &str) -> bool {
        let host_ok = match &self.host {
            HostMatch::Exact(h) => h == host,
            HostMatch::Wildcard(suffix) => matches_wildcard(suffix, host),
        };
        host_ok
            && self
                .path_prefix
                .as_deref()
                .is_none_or(|prefix| path.starts_with(prefix))
    }

    /// Ordering key: higher is more specific.
    fn specificity(&self) -> (bool, usize, bool, usize) {
        let (exact, host_len) = match &self.host {
            HostMatch::Exact(h) => (true, h.len()),
            HostMatch::Wildcard(s) => (false, s.len()),
        };
        (
            self.path_prefix.is_some(),
            self.path_prefix.as_ref().map_or(0, String::len),
            exact,
            host_len,
        )
    }
}

/// Immutable set of compiled rules, keyed by normalized pattern.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<String, CompiledRule>,
}

impl RuleSet {
    /// Evaluate `host` and optional `path` against the rules.
    ///
    /// Without a path only host rules are considered.
    pub fn evaluate(&self, host: &str, path: Option<&str>) -> PolicyDecision {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        let best = self
            .rules
            .iter()
            .filter(|(_, rule)| match path {
                Some(path) => rule.matches(&host, path),
                None => rule.path_prefix.is_none() && rule.matches(&host, "/"),
            })
            .max_by_key(|(_, rule)| rule.specificity());

        match best {
            Some((pattern, rule)) if rule.action == RuleAction::Block => PolicyDecision::Block {
                rule: pattern.clone(),
            },
            Some((pattern, _)) => PolicyDecision::Allow {
                rule: Some(pattern.clone()),
            },
            None => PolicyDecision::Allow { rule: None },
        }
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Shared, runtime-mutable policy.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Arc<RuleSet>>,
}

impl PolicyStore {
    /// Create an empty store that allows everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded from configuration.
    ///
    /// Block rules are applied first, so a pattern listed in both sections
    /// ends up allowed.
    pub fn from_config(config: &PolicyConfig) -> Result<Self, ProxyError> {
        let store = Self::new();
        for pattern in &config.blocked {
            store.add_rule(pattern, RuleAction::Block)?;
        }
        for pattern in &config.allowed {
            store.add_rule(pattern, RuleAction::Allow)?;
        }
        Ok(store)
    }

    /// Current rule snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read())
    }

    /// Evaluate a destination against the current rules.
    ///
    /// `path` is the request path without query; `None` for CONNECT targets,
    /// which only host rules can match.
    pub fn evaluate(&self, host: &str, path: Option<&str>) -> PolicyDecision {
        self.snapshot().evaluate(host, path)
    }

    /// Whether requests to `host` (and optionally `path`) are allowed.
    pub fn is_allowed(&self, host: &str, path: Option<&str>) -> bool {
        self.evaluate(host, path).is_allowed()
    }

    /// Add or overwrite a rule. Returns whether the rule set changed.
    pub fn add_rule(&self, pattern: &str, action: RuleAction) -> Result<bool, ProxyError> {
        let (key, compiled) = compile(pattern, action)?;
        Ok(self.update(|rules| {
            if rules.get(&key).is_some_and(|r| r.action == action) {
                return false;
            }
            debug!("Policy rule {} {}", action, key);
            rules.insert(key, compiled);
            true
        }))
    }

    /// Remove the rule for `pattern`. Removing a missing rule is a no-op.
    pub fn remove_rule(&self, pattern: &str) -> Result<bool, ProxyError> {
        let key = normalize_pattern(pattern)?;
        Ok(self.update(|rules| rules.remove(&key).is_some()))
    }

    /// Block `pattern`.
    pub fn block(&self, pattern: &str) -> Result<bool, ProxyError> {
        self.add_rule(pattern, RuleAction::Block)
    }

    /// Remove the block rule for `pattern`, leaving allow rules untouched.
    pub fn unblock(&self, pattern: &str) -> Result<bool, ProxyError> {
        let key = normalize_pattern(pattern)?;
        Ok(self.update(|rules| {
            if rules.get(&key).is_some_and(|r| r.action == RuleAction::Block) {
                rules.remove(&key);
                true
            } else {
                false
            }
        }))
    }

    /// All rules, sorted by pattern.
    pub fn rules(&self) -> Vec<PolicyRule> {
        self.snapshot()
            .rules
            .iter()
            .map(|(pattern, rule)| PolicyRule {
                pattern: pattern.clone(),
                action: rule.action,
            })
            .collect()
    }

    /// Copy-on-write update; the closure reports whether it changed anything.
    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, CompiledRule>) -> bool) -> bool {
        let mut guard = self.current.write();
        let mut next = RuleSet::clone(&guard);
        let changed = f(&mut next.rules);
        if changed {
            *guard = Arc::new(next);
        }
        changed
    }
}

/// Normalize a user-supplied pattern to its canonical form.
///
/// `HTTP://Example.COM:8080/ads/` becomes `example.com/ads/`;
/// `https://example.com/` becomes `example.com`.
pub fn normalize_pattern(raw: &str) -> Result<String, ProxyError> {
    let invalid = || ProxyError::InvalidPattern(raw.to_string());
    let trimmed = raw.trim();

    let without_scheme = ["http://", "https://"]
        .iter()
        .find_map(|scheme| {
            trimmed
                .get(..scheme.len())
                .filter(|p| p.eq_ignore_ascii_case(scheme))
                .map(|_| &trimmed[scheme.len()..])
        })
        .unwrap_or(trimmed);

    let (authority, path) = match without_scheme.find('/') {
        Some(i) => without_scheme.split_at(i),
        None => (without_scheme, ""),
    };

    let host = strip_port(authority).ok_or_else(invalid)?.to_ascii_lowercase();
    let host = host.trim_end_matches('.');

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    if let Some(suffix) = host.strip_prefix("*.") {
        if suffix.is_empty() || suffix.contains('*') {
            return Err(invalid());
        }
    } else if host.contains('*') {
        return Err(invalid());
    }

    if path.is_empty() || path == "/" {
        Ok(host.to_string())
    } else {
        Ok(format!("{}{}", host, path))
    }
}

fn compile(pattern: &str, action: RuleAction) -> Result<(String, CompiledRule), ProxyError> {
    let key = normalize_pattern(pattern)?;
    let (host, path_prefix) = match key.find('/') {
        Some(i) => (&key[..i], Some(key[i..].to_string())),
        None => (key.as_str(), None),
    };
    let host = match host.strip_prefix("*.") {
        Some(suffix) => HostMatch::Wildcard(suffix.to_string()),
        None => HostMatch::Exact(host.to_string()),
    };
    let compiled = CompiledRule {
        host,
        path_prefix,
        action,
    };
    Ok((key, compiled))
}

/// Strip an optional `:port`, keeping IPv6 literals intact (without brackets).
fn strip_port(authority: &str) -> Option<&str> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return (after.is_empty() || after.starts_with(':')).then_some(host);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            port.parse::<u16>().ok()?;
            Some(host)
        }
        Some(_) => Some(authority),
        None => Some(authority),
    }
}

/// Check if a host matches a wildcard suffix.
///
/// Suffix `example.com` (from `*.example.com`) matches:
/// - `sub.example.com`
/// - `deep.sub.example.com`
///
/// But NOT:
/// - `example.com` (the base domain itself)
/// - `fakeexample.com` (different domain)
fn matches_wildcard(suffix: &str, host: &str) -> bool {
    if host.ends_with(suffix) {
        let prefix_len = host.len() - suffix.len();
        // Must have at least one character and a dot before the suffix
        prefix_len > 1 && host.as_bytes().get(prefix_len - 1) == Some(&b'.')
    } else {
        false
    }
}
