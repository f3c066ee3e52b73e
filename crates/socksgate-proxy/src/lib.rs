//! Local TCP proxy with SOCKS5 and HTTP `CONNECT` front-ends.
//!
//! `socksgate-proxy` accepts client connections, works out where they want
//! to go, and relays bytes to that destination until either side hangs up.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   +-- SOCKS5 (0.0.0.0:1080)
//!   |     |
//!   |     +-- handshake: no-auth only, else 0xFF + close
//!   |     +-- CONNECT --> ConnectionManager::get_or_create(host, port)
//!   |     |                 |
//!   |     |                 +-- pool hit (alive)? --> reuse
//!   |     |                 +-- DnsCache --> dial --> idle supervisor --> pool
//!   |     |               --> reply echoes requested address --> RelayPair
//!   |     +-- UDP_ASSOCIATE --> reply with local address, hold control connection
//!   |     +-- anything else --> close, no reply
//!   |
//!   +-- HTTP CONNECT (0.0.0.0:443)
//!         |
//!         +-- request line --> dial ad hoc --> 200 --> blocking relay
//!         +-- failure --> 500 with message --> close
//! ```
//!
//! # Components
//!
//! - [`Socks5Server`]: accept loop running one [`Socks5Session`] per client
//! - [`HttpTunnelServer`]: HTTP `CONNECT` tunnel
//! - [`ConnectionManager`]: pooled outbound connections with single-flight dials
//! - [`DnsCache`]: fixed-TTL hostname cache in front of a [`Resolve`] implementation
//! - [`RelayPair`]: full-duplex relay with idempotent close
//! - [`ProxyServer`]: both front-ends plus periodic cleanup and graceful shutdown
//!
//! # Usage
//!
//! ```ignore
//! use socksgate_proxy::{ProxyConfig, ProxyServer};
//!
//! let handle = ProxyServer::new(ProxyConfig::default()).start().await?;
//! println!("SOCKS5 on {}", handle.socks5_addr());
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! ```

pub mod conn;
pub mod dns;
pub mod http;
pub mod manager;
pub mod net;
pub mod pool;
pub mod relay;
pub mod server;
pub mod session;
pub mod socks5;

pub use conn::Connection;
pub use dns::{DnsCache, Resolve, SystemResolver};
pub use http::{HttpTunnelServer, TunnelTarget};
pub use manager::ConnectionManager;
pub use net::SocketOptions;
pub use pool::{pool_key, ConnectionPool};
pub use relay::{relay_blocking, RelayPair, RelayStats};
pub use server::{ProxyConfig, ProxyHandle, ProxyServer};
pub use session::{SessionState, Socks5Server, Socks5Session};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind a listener.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Client did not offer the no-authentication method.
    #[error("SOCKS5 handshake rejected: no acceptable authentication method")]
    HandshakeRejected,

    /// Command other than CONNECT or UDP ASSOCIATE.
    #[error("Unsupported SOCKS5 command {0:#04x}")]
    UnsupportedCommand(u8),

    /// Hostname could not be resolved.
    #[error("DNS resolution failed for {host}: {source}")]
    DnsResolutionFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to the destination failed or timed out.
    #[error("Failed to connect to {target}: {source}")]
    UpstreamConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport error while relaying.
    #[error("Relay error: {0}")]
    RelayIo(#[source] std::io::Error),

    /// Malformed SOCKS5 framing.
    #[error("SOCKS5 protocol error: {0}")]
    Protocol(#[from] socks5::Error),

    /// Bad HTTP tunnel request.
    #[error("{0}")]
    HttpRequest(String),

    /// Server or manager is shutting down.
    #[error("Server shutdown error: {0}")]
    Shutdown(String),
}

impl ProxyError {
    /// Whether this is the client's or the network's doing rather than a local fault.
    ///
    /// Only affects log severity.
    pub fn is_benign(&self) -> bool {
        match self {
            ProxyError::HandshakeRejected
            | ProxyError::UnsupportedCommand(_)
            | ProxyError::HttpRequest(_)
            | ProxyError::Shutdown(_) => true,
            ProxyError::Protocol(socks5::Error::Io(err)) | ProxyError::RelayIo(err) => {
                net::is_benign(err)
            }
            ProxyError::Protocol(_) => true,
            ProxyError::Bind { .. }
            | ProxyError::DnsResolutionFailed { .. }
            | ProxyError::UpstreamConnectFailed { .. } => false,
        }
    }

    /// Wrap a socket error raised while speaking SOCKS5.
    pub(crate) fn protocol_io(err: std::io::Error) -> Self {
        ProxyError::Protocol(socks5::Error::Io(err))
    }
}
