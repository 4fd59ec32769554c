//! Configuration schema definitions.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `/etc/webproxy/config.toml`
//! 3. User config: `~/.config/webproxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Every field deserializes to an empty or zero value when absent so that a
//! later file only overrides what it actually sets.

use super::error::ConfigError;
use crate::cache::CacheLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listener, limits and timeouts.
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Initial policy rules.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Control socket settings.
    #[serde(default)]
    pub control: ControlConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists (blocked, allowed) are merged (appended).
    /// Scalars (timeouts, log_level, etc.) are overridden.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.proxy.merge(other.proxy);
        self.cache.merge(other.cache);
        self.policy.merge(other.policy);
        self.control.merge(other.control);
    }

    /// Check values that cannot be validated by deserialization alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.listen_addr()?;
        self.proxy.resolved_host_overrides()?;

        if self.proxy.max_header_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "proxy.max_header_bytes".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.cache.is_enabled() && self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_entries".into(),
                message: "must be greater than zero when the cache is enabled".into(),
            });
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Listener, limits and timeouts.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxySettings {
    /// Address to listen on, e.g. `127.0.0.1:4000`.
    #[serde(default)]
    pub listen: String,

    /// Listen backlog.
    #[serde(default)]
    pub backlog: u32,

    /// Maximum concurrent client connections. 0 = unlimited.
    ///
    /// Unset keeps the value from earlier layers, so a later file can set 0
    /// to lift a limit.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Maximum size of a request or response head.
    #[serde(default)]
    pub max_header_bytes: usize,

    /// Maximum size of a request or response body.
    #[serde(default)]
    pub max_body_bytes: usize,

    /// Upstream connect timeout in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: u64,

    /// Upstream response timeout in milliseconds.
    #[serde(default)]
    pub read_timeout_ms: u64,

    /// How long an idle keep-alive client connection is kept open.
    #[serde(default)]
    pub client_idle_timeout_ms: u64,

    /// How long a tunnel keeps relaying after one side closes.
    #[serde(default)]
    pub tunnel_grace_ms: u64,

    /// How long an established tunnel may carry no bytes in either direction.
    #[serde(default)]
    pub tunnel_idle_timeout_ms: u64,

    /// Static host -> socket address map consulted before DNS.
    #[serde(default)]
    pub host_overrides: HashMap<String, String>,
}

impl ProxySettings {
    fn merge(&mut self, other: ProxySettings) {
        if !other.listen.is_empty() {
            self.listen = other.listen;
        }
        if other.backlog != 0 {
            self.backlog = other.backlog;
        }
        if other.max_connections.is_some() {
            self.max_connections = other.max_connections;
        }
        if other.max_header_bytes != 0 {
            self.max_header_bytes = other.max_header_bytes;
        }
        if other.max_body_bytes != 0 {
            self.max_body_bytes = other.max_body_bytes;
        }
        if other.connect_timeout_ms != 0 {
            self.connect_timeout_ms = other.connect_timeout_ms;
        }
        if other.read_timeout_ms != 0 {
            self.read_timeout_ms = other.read_timeout_ms;
        }
        if other.client_idle_timeout_ms != 0 {
            self.client_idle_timeout_ms = other.client_idle_timeout_ms;
        }
        if other.tunnel_grace_ms != 0 {
            self.tunnel_grace_ms = other.tunnel_grace_ms;
        }
        if other.tunnel_idle_timeout_ms != 0 {
            self.tunnel_idle_timeout_ms = other.tunnel_idle_timeout_ms;
        }
        // Maps are merged (later values override)
        self.host_overrides.extend(other.host_overrides);
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                field: "proxy.listen".into(),
                message: format!("'{}': {}", self.listen, e),
            })
    }

    /// Host overrides with lowercase hosts and parsed addresses.
    pub fn resolved_host_overrides(&self) -> Result<HashMap<String, SocketAddr>, ConfigError> {
        self.host_overrides
            .iter()
            .map(|(host, addr)| {
                let parsed = addr.parse().map_err(|e| ConfigError::InvalidValue {
                    field: format!("proxy.host_overrides.{}", host),
                    message: format!("'{}': {}", addr, e),
                })?;
                Ok((host.to_ascii_lowercase(), parsed))
            })
            .collect()
    }

    /// Upstream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Upstream response timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Idle timeout between requests on a client connection.
    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.client_idle_timeout_ms)
    }

    /// Tunnel half-close grace period.
    pub fn tunnel_grace(&self) -> Duration {
        Duration::from_millis(self.tunnel_grace_ms)
    }

    /// Tunnel inactivity limit.
    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_idle_timeout_ms)
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CacheConfig {
    /// Whether responses are cached at all.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Maximum number of entries.
    #[serde(default)]
    pub max_entries: usize,

    /// Maximum total size of cached responses.
    #[serde(default)]
    pub max_bytes: usize,

    /// Responses larger than this are not cached.
    #[serde(default)]
    pub max_entry_bytes: usize,

    /// Freshness lifetime for responses without explicit caching headers.
    #[serde(default)]
    pub default_ttl_secs: u64,
}

impl CacheConfig {
    fn merge(&mut self, other: CacheConfig) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.max_entries != 0 {
            self.max_entries = other.max_entries;
        }
        if other.max_bytes != 0 {
            self.max_bytes = other.max_bytes;
        }
        if other.max_entry_bytes != 0 {
            self.max_entry_bytes = other.max_entry_bytes;
        }
        if other.default_ttl_secs != 0 {
            self.default_ttl_secs = other.default_ttl_secs;
        }
    }

    /// Whether caching is enabled. Defaults to on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Store limits derived from this section.
    pub fn limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            max_entry_bytes: self.max_entry_bytes,
            default_ttl: Duration::from_secs(self.default_ttl_secs),
        }
    }
}

/// Initial policy rules.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PolicyConfig {
    /// Patterns to block.
    ///
    /// Supports `host`, `host/path-prefix` and `*.domain` patterns.
    #[serde(default)]
    pub blocked: Vec<String>,

    /// Patterns to allow explicitly, typically to carve exceptions out of a
    /// broader block.
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl PolicyConfig {
    fn merge(&mut self, other: PolicyConfig) {
        // Lists are merged (appended)
        self.blocked.extend(other.blocked);
        self.allowed.extend(other.allowed);
    }
}

/// Control socket settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ControlConfig {
    /// Path of the Unix control socket.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl ControlConfig {
    fn merge(&mut self, other: ControlConfig) {
        if other.socket_path.is_some() {
            self.socket_path = other.socket_path;
        }
    }

    /// Configured socket path, or the per-user default.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

/// `$XDG_RUNTIME_DIR/webproxy/control.sock`, falling back to the temp dir.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("webproxy")
        .join("control.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_empty() {
        let config = Config::default();
        assert!(config.proxy.listen.is_empty());
        assert_eq!(config.proxy.backlog, 0);
        assert!(config.policy.blocked.is_empty());
        assert!(config.cache.enabled.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
            [general]
            log_level = "debug"

            [proxy]
            listen = "0.0.0.0:8080"
            backlog = 64
            connect_timeout_ms = 2500

            [proxy.host_overrides]
            "Example.com" = "127.0.0.1:9000"

            [cache]
            enabled = false
            default_ttl_secs = 60

            [policy]
            blocked = ["bad.example.com", "*.ads.example"]
            allowed = ["bad.example.com/ok"]

            [control]
            socket_path = "/tmp/webproxy.sock"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.proxy.listen_addr().unwrap().port(), 8080);
        assert_eq!(config.proxy.backlog, 64);
        assert_eq!(config.proxy.connect_timeout(), Duration::from_millis(2500));
        assert!(!config.cache.is_enabled());
        assert_eq!(config.cache.limits().default_ttl, Duration::from_secs(60));
        assert_eq!(config.policy.blocked.len(), 2);
        assert_eq!(
            config.control.socket_path(),
            PathBuf::from("/tmp/webproxy.sock")
        );

        let overrides = config.proxy.resolved_host_overrides().unwrap();
        assert_eq!(
            overrides.get("example.com"),
            Some(&"127.0.0.1:9000".parse().unwrap())
        );
    }

    #[test]
    fn test_merge_scalars_override_lists_append() {
        let mut base: Config = toml::from_str(
            r#"
            [proxy]
            listen = "127.0.0.1:4000"
            backlog = 128
            [policy]
            blocked = ["a.example"]
            "#,
        )
        .unwrap();

        let overlay: Config = toml::from_str(
            r#"
            [proxy]
            listen = "127.0.0.1:5000"
            [policy]
            blocked = ["b.example"]
            "#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.proxy.listen, "127.0.0.1:5000");
        assert_eq!(base.proxy.backlog, 128);
        assert_eq!(base.policy.blocked, vec!["a.example", "b.example"]);
    }

    #[test]
    fn test_cache_enabled_can_be_turned_off() {
        let mut base = Config::default();
        base.cache.enabled = Some(true);

        let overlay: Config = toml::from_str("[cache]\nenabled = false\n").unwrap();
        base.merge(overlay);
        assert!(!base.cache.is_enabled());

        base.merge(Config::default());
        assert!(!base.cache.is_enabled());
    }

    #[test]
    fn test_max_connections_can_return_to_unlimited() {
        let mut base: Config = toml::from_str("[proxy]\nmax_connections = 50\n").unwrap();
        assert_eq!(base.proxy.max_connections, Some(50));

        base.merge(Config::default());
        assert_eq!(base.proxy.max_connections, Some(50));

        let overlay: Config = toml::from_str("[proxy]\nmax_connections = 0\n").unwrap();
        base.merge(overlay);
        assert_eq!(base.proxy.max_connections, Some(0));
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = Config::default();
        config.proxy.listen = "not-an-address".into();
        config.proxy.max_header_bytes = 1024;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "proxy.listen"));
    }

    #[test]
    fn test_invalid_host_override() {
        let mut config = Config::default();
        config.proxy.listen = "127.0.0.1:4000".into();
        config.proxy.max_header_bytes = 1024;
        config
            .proxy
            .host_overrides
            .insert("example.com".into(), "nowhere".into());

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_socket_path_name() {
        let path = default_socket_path();
        assert!(path.ends_with("webproxy/control.sock"));
    }

    #[test]
    fn test_embedded_default_config_parses() {
        let toml_content = include_str!("../../config/default.toml");
        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.proxy.listen, "127.0.0.1:4000");
        assert_eq!(config.proxy.max_connections, Some(0));
        assert_eq!(config.proxy.tunnel_idle_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }
}
