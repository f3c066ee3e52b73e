//! Layered TOML configuration for socksgate.
//!
//! Provides structured configuration types for the proxy and its runtime,
//! loading from:
//! - Global config: `~/.config/socksgate/socksgate.toml`
//! - Project config: `<workspace>/.socksgate/socksgate.toml`
//!
//! Project values take precedence for scalar fields. Every key is optional;
//! unset keys fall back to the compiled-in proxy defaults.
//!
//! # Example
//!
//! ```no_run
//! use socksgate_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{:?}", config.proxy.socks5_port);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[proxy]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySettings {
    /// Interface both listeners bind to (e.g. `"0.0.0.0"` or `"127.0.0.1"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_host: Option<String>,

    /// SOCKS5 listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks5_port: Option<u16>,

    /// HTTP CONNECT tunnel listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    /// Whether the HTTP tunnel listener is started at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_enabled: Option<bool>,

    /// DNS cache entry lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_cache_ttl_secs: Option<u64>,

    /// Read-idle timeout of pooled outbound connections in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Interval of the coarse DNS cache + pool sweep in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_cleanup_interval_secs: Option<u64>,

    /// Pooled connect timeout (resolve + dial) in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Connect timeout of the non-pooled path in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_connect_timeout_secs: Option<u64>,

    /// Route CONNECT through the connection pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_pooling: Option<bool>,

    /// How long shutdown waits for in-flight relays, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<u64>,
}

/// TOML `[runtime]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSettings {
    /// Number of async worker threads driving connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,

    /// Upper bound of blocking threads used by the HTTP tunnel relays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_threads: Option<usize>,
}

/// Top-level socksgate configuration, corresponding to `socksgate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksgateConfig {
    /// Proxy configuration.
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Runtime sizing.
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl SocksgateConfig {
    /// Parse a `SocksgateConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `SocksgateConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// A config with every key spelled out at its default value.
    ///
    /// Used by `config init` so the written file documents what can be tuned.
    pub fn starter() -> Self {
        Self {
            proxy: ProxySettings {
                bind_host: Some("0.0.0.0".to_string()),
                socks5_port: Some(1080),
                http_port: Some(443),
                http_enabled: Some(true),
                dns_cache_ttl_secs: Some(300),
                idle_timeout_secs: Some(30),
                pool_cleanup_interval_secs: Some(300),
                connect_timeout_secs: Some(10),
                direct_connect_timeout_secs: Some(3),
                connection_pooling: Some(true),
                shutdown_grace_secs: Some(5),
            },
            runtime: RuntimeSettings {
                worker_threads: Some(64),
                blocking_threads: Some(10),
            },
        }
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// Every field is a scalar: `other` wins when explicitly set (`Some`).
    #[must_use]
    pub fn merge(mut self, other: SocksgateConfig) -> SocksgateConfig {
        let p = other.proxy;
        override_if_set(&mut self.proxy.bind_host, p.bind_host);
        override_if_set(&mut self.proxy.socks5_port, p.socks5_port);
        override_if_set(&mut self.proxy.http_port, p.http_port);
        override_if_set(&mut self.proxy.http_enabled, p.http_enabled);
        override_if_set(&mut self.proxy.dns_cache_ttl_secs, p.dns_cache_ttl_secs);
        override_if_set(&mut self.proxy.idle_timeout_secs, p.idle_timeout_secs);
        override_if_set(
            &mut self.proxy.pool_cleanup_interval_secs,
            p.pool_cleanup_interval_secs,
        );
        override_if_set(&mut self.proxy.connect_timeout_secs, p.connect_timeout_secs);
        override_if_set(
            &mut self.proxy.direct_connect_timeout_secs,
            p.direct_connect_timeout_secs,
        );
        override_if_set(&mut self.proxy.connection_pooling, p.connection_pooling);
        override_if_set(&mut self.proxy.shutdown_grace_secs, p.shutdown_grace_secs);

        override_if_set(&mut self.runtime.worker_threads, other.runtime.worker_threads);
        override_if_set(&mut self.runtime.blocking_threads, other.runtime.blocking_threads);
        self
    }
}

fn override_if_set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = SocksgateConfig::parse("").unwrap();
        assert_eq!(config, SocksgateConfig::default());
    }

    #[test]
    fn test_parse_proxy_ports() {
        let toml = "[proxy]\nsocks5_port = 1090\nhttp_port = 8443";
        let config = SocksgateConfig::parse(toml).unwrap();
        assert_eq!(config.proxy.socks5_port, Some(1090));
        assert_eq!(config.proxy.http_port, Some(8443));
        assert!(config.proxy.http_enabled.is_none());
    }

    #[test]
    fn test_parse_durations_and_flags() {
        let toml = "[proxy]\ndns_cache_ttl_secs = 60\nidle_timeout_secs = 5\nconnection_pooling = false";
        let config = SocksgateConfig::parse(toml).unwrap();
        assert_eq!(config.proxy.dns_cache_ttl_secs, Some(60));
        assert_eq!(config.proxy.idle_timeout_secs, Some(5));
        assert_eq!(config.proxy.connection_pooling, Some(false));
    }

    #[test]
    fn test_parse_runtime_section() {
        let toml = "[runtime]\nworker_threads = 8\nblocking_threads = 4";
        let config = SocksgateConfig::parse(toml).unwrap();
        assert_eq!(config.runtime.worker_threads, Some(8));
        assert_eq!(config.runtime.blocking_threads, Some(4));
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        let result = SocksgateConfig::parse("[proxy]\nsocks_port = 1080");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_port() {
        let result = SocksgateConfig::parse("[proxy]\nsocks5_port = 70000");
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_scalar_project_wins() {
        let global = SocksgateConfig::parse("[proxy]\nsocks5_port = 1080").unwrap();
        let project = SocksgateConfig::parse("[proxy]\nsocks5_port = 2080").unwrap();
        let merged = global.merge(project);
        assert_eq!(merged.proxy.socks5_port, Some(2080));
    }

    #[test]
    fn test_merge_scalar_global_wins_when_project_absent() {
        let global = SocksgateConfig::parse("[proxy]\nhttp_enabled = false").unwrap();
        let project = SocksgateConfig::parse("").unwrap();
        let merged = global.merge(project);
        assert_eq!(merged.proxy.http_enabled, Some(false));
    }

    #[test]
    fn test_merge_runtime_section() {
        let global = SocksgateConfig::parse("[runtime]\nworker_threads = 2").unwrap();
        let project = SocksgateConfig::parse("[runtime]\nblocking_threads = 3").unwrap();
        let merged = global.merge(project);
        assert_eq!(merged.runtime.worker_threads, Some(2));
        assert_eq!(merged.runtime.blocking_threads, Some(3));
    }

    #[test]
    fn test_roundtrip_starter_toml() {
        let config = SocksgateConfig::starter();
        let serialized = config.to_toml().unwrap();
        let reparsed = SocksgateConfig::parse(&serialized).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_default_serializes_to_empty_sections() {
        let serialized = SocksgateConfig::default().to_toml().unwrap();
        let reparsed = SocksgateConfig::parse(&serialized).unwrap();
        assert_eq!(reparsed, SocksgateConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("socksgate.toml");

        let mut config = SocksgateConfig::default();
        config.proxy.bind_host = Some("127.0.0.1".to_string());

        config.save(&path).unwrap();

        let loaded = SocksgateConfig::load(&path).unwrap();
        assert_eq!(loaded.proxy.bind_host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_settings_error_display() {
        let err = SocksgateConfig::parse("invalid toml :::").unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
