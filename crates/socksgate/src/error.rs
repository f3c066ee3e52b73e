use std::path::PathBuf;

/// Everything a `socksgate` subcommand can fail with.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Settings(#[from] socksgate_settings::SettingsError),

    #[error("{0}")]
    Proxy(#[from] socksgate_proxy::ProxyError),

    #[error("Invalid bind host {host:?}: {source}")]
    InvalidBindHost {
        host: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("Config file already exists: {}", .0.display())]
    ConfigExists(PathBuf),

    #[error("Cannot determine global config path: no config directory for this user")]
    NoGlobalConfigDir,

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Editor {editor:?} exited with {status}")]
    Editor {
        editor: String,
        status: std::process::ExitStatus,
    },

    #[error("{failed} check(s) failed")]
    ChecksFailed { failed: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
