//! Configuration system for webproxy.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults (`config/default.toml`, compiled in)
//! 2. System config: `/etc/webproxy/config.toml`
//! 3. User config: `~/.config/webproxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (`policy.blocked`, `policy.allowed`) are **merged** (appended)
//! - **Scalars** (listen address, timeouts, limits) are **overridden**
//! - **Maps** (`proxy.host_overrides`) are **merged** (later values override)
//!
//! # Example
//!
//! ```toml
//! [proxy]
//! listen = "127.0.0.1:4000"
//!
//! [policy]
//! blocked = ["ads.example.com", "*.tracker.example"]
//! allowed = ["ads.example.com/status"]
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, DEFAULT_CONFIG};
pub use schema::{
    CacheConfig, Config, ControlConfig, GeneralConfig, PolicyConfig, ProxySettings,
    default_socket_path,
};
