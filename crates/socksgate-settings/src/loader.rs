//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/socksgate/socksgate.toml`
//! 2. Project: `<workspace>/.socksgate/socksgate.toml`
//!
//! Project values take precedence for every field that it sets.

use crate::SocksgateConfig;
use std::path::{Path, PathBuf};

/// Loads and merges `SocksgateConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Reads the global config, then the project config, and merges them.
    /// Missing files are silently skipped. Parse errors emit a warning to
    /// stderr and the file is treated as if absent.
    pub fn load(workspace: &Path) -> SocksgateConfig {
        let global = Self::global_config_path()
            .map(|path| Self::load_optional(&path))
            .unwrap_or_default();
        let project = Self::load_optional(&Self::project_config_path(workspace));
        global.merge(project)
    }

    /// Absolute path to the global config file, if a config directory exists.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|d| d.join("socksgate.toml"))
    }

    /// Absolute path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        Self::project_config_dir(workspace).join("socksgate.toml")
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("socksgate"))
    }

    fn project_config_dir(workspace: &Path) -> PathBuf {
        workspace.join(".socksgate")
    }

    fn load_optional(path: &Path) -> SocksgateConfig {
        if !path.exists() {
            return SocksgateConfig::default();
        }
        match SocksgateConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // A malformed config shouldn't block startup.
                eprintln!("socksgate-settings: warning: failed to parse {path:?}: {err}");
                SocksgateConfig::default()
            }
        }
    }
}
