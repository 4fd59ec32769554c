//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/webproxy/config.toml`
//! 3. User config: `~/.config/webproxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Lists (blocked, allowed) are **merged** (appended).
//! Scalars (listen, timeouts) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{Config, PolicyConfig};
use crate::cli::Cli;

/// Built-in defaults.
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/webproxy/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "webproxy";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config` file,
    /// invalid TOML, or an invalid merged value is an error.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config: Config =
            toml::from_str(DEFAULT_CONFIG).map_err(|e| ConfigError::ParseError {
                path: PathBuf::from("<embedded:default.toml>"),
                source: e,
            })?;
        debug!("Loaded embedded default configuration");

        for path in [&self.system_path, &self.user_path] {
            if let Some(file_config) = self.load_file(path)? {
                config.merge(file_config);
                debug!("Loaded config from {:?}", path);
            } else {
                debug!("No config found at {:?}", path);
            }
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        apply_cli_flags(&mut config, cli);
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_cli_flags(config: &mut Config, cli: &Cli) {
    let mut overlay = Config::default();

    if let Some(ref listen) = cli.listen {
        overlay.proxy.listen = listen.clone();
    }
    if cli.no_cache {
        overlay.cache.enabled = Some(false);
    }
    if let Some(ref socket) = cli.socket {
        overlay.control.socket_path = Some(socket.clone());
    }
    overlay.policy = PolicyConfig {
        blocked: cli.block.clone(),
        allowed: cli.allow.clone(),
    };

    if !cli.block.is_empty() || !cli.allow.is_empty() {
        debug!(
            "Added {} blocked and {} allowed patterns from CLI flags",
            cli.block.len(),
            cli.allow.len()
        );
    }
    config.merge(overlay);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn create_test_cli(args: &[&str]) -> Cli {
        let mut argv = vec!["webproxy"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    fn loader_in(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_paths(dir.join("system.toml"), dir.join("user.toml"))
    }

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let config = loader_in(dir.path()).load(&create_test_cli(&[])).unwrap();

        assert_eq!(config.proxy.listen, "127.0.0.1:4000");
        assert_eq!(config.proxy.backlog, 128);
        assert_eq!(config.proxy.max_header_bytes, 65536);
        assert_eq!(config.cache.default_ttl_secs, 300);
        assert!(config.cache.is_enabled());
        assert!(config.policy.blocked.is_empty());
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "[proxy]\nconnect_timeout_ms = 1000\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[proxy]\nconnect_timeout_ms = 2000\n",
        )
        .unwrap();

        let config = loader_in(dir.path()).load(&create_test_cli(&[])).unwrap();
        assert_eq!(config.proxy.connect_timeout_ms, 2000);
        assert_eq!(config.proxy.read_timeout_ms, 30000);
    }

    #[test]
    fn test_lists_are_merged() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "[policy]\nblocked = [\"system.example\"]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[policy]\nblocked = [\"user.example\"]\n",
        )
        .unwrap();

        let config = loader_in(dir.path()).load(&create_test_cli(&[])).unwrap();
        assert_eq!(config.policy.blocked, vec!["system.example", "user.example"]);
    }

    #[test]
    fn test_cli_flags_have_highest_priority() {
        let dir = tempdir().unwrap();
        let extra = dir.path().join("extra.toml");
        fs::write(&extra, "[proxy]\nlisten = \"127.0.0.1:5000\"\n").unwrap();

        let cli = create_test_cli(&[
            "--config",
            extra.to_str().unwrap(),
            "--listen",
            "127.0.0.1:6000",
            "--block",
            "bad.example.com",
            "--no-cache",
        ]);
        let config = loader_in(dir.path()).load(&cli).unwrap();

        assert_eq!(config.proxy.listen, "127.0.0.1:6000");
        assert_eq!(config.policy.blocked, vec!["bad.example.com"]);
        assert!(!config.cache.is_enabled());
    }

    #[test]
    fn test_missing_cli_config_is_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let cli = create_test_cli(&["--config", missing.to_str().unwrap()]);

        let err = loader_in(dir.path()).load(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("system.toml"), "this is not valid TOML [[[").unwrap();

        let err = loader_in(dir.path()).load(&create_test_cli(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_invalid_merged_value_is_error() {
        let dir = tempdir().unwrap();
        let cli = create_test_cli(&["--listen", "nonsense"]);

        let err = loader_in(dir.path()).load(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
