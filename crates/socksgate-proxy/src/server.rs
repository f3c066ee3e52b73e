//! Combined SOCKS5 + HTTP tunnel server.
//!
//! Manages the lifecycle of both front-ends, the shared connection manager
//! and its periodic cleanup, and provides a unified control interface.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! SOCKS5 accept loop            |
//! HTTP accept loop (optional)   |
//! pool cleanup every interval   |
//!       |                       v
//!       |               ProxyHandle::shutdown()
//!       |                       |
//!       v                       v
//! stop accepting, close pool, drain sessions for `shutdown_grace`
//! ```

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    dns::Resolve, net, ConnectionManager, HttpTunnelServer, ProxyError, Result, SocketOptions,
    Socks5Server,
};

/// Configuration for the combined proxy server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// SOCKS5 listener address.
    /// Default: `0.0.0.0:1080`
    pub socks5_bind_addr: SocketAddr,

    /// HTTP tunnel listener address; `None` disables the tunnel.
    /// Default: `0.0.0.0:443`
    pub http_bind_addr: Option<SocketAddr>,

    /// How long a resolved hostname is reused.
    /// Default: 5 minutes
    pub dns_cache_ttl: Duration,

    /// Pooled connections with no read for this long are closed.
    /// Default: 30 seconds
    pub idle_timeout: Duration,

    /// Period of the full DNS cache + pool sweep.
    /// Default: 5 minutes
    pub pool_cleanup_interval: Duration,

    /// Resolve + connect budget for pooled dials and the HTTP tunnel.
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Connect budget for ad-hoc SOCKS5 dials.
    /// Default: 3 seconds
    pub direct_connect_timeout: Duration,

    /// Route SOCKS5 CONNECT through the connection pool.
    /// Default: `true`
    pub connection_pooling: bool,

    /// Read chunk of the SOCKS5 relay.
    /// Default: 16 KiB
    pub relay_buffer_size: usize,

    /// How long shutdown waits for in-flight sessions.
    /// Default: 5 seconds
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socks5_bind_addr: "0.0.0.0:1080".parse().expect("hardcoded wildcard address"),
            http_bind_addr: Some("0.0.0.0:443".parse().expect("hardcoded wildcard address")),
            dns_cache_ttl: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(30),
            pool_cleanup_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            direct_connect_timeout: Duration::from_secs(3),
            connection_pooling: true,
            relay_buffer_size: 16 * 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    /// Config listening on loopback with OS-assigned ports.
    pub fn loopback() -> Self {
        Self {
            socks5_bind_addr: "127.0.0.1:0".parse().expect("hardcoded loopback address"),
            http_bind_addr: Some("127.0.0.1:0".parse().expect("hardcoded loopback address")),
            ..Default::default()
        }
    }
}

/// Everything a session needs, shared by both front-ends.
pub struct ProxyContext {
    pub(crate) config: ProxyConfig,
    pub(crate) manager: Arc<ConnectionManager>,
    /// Tracks sessions and relay directions for the shutdown drain.
    pub(crate) tasks: TaskTracker,
    /// Runtime sessions and relays are spawned on.
    pub(crate) runtime: Handle,
    pub(crate) shutdown: CancellationToken,
}

impl ProxyContext {
    pub fn new(config: ProxyConfig, manager: Arc<ConnectionManager>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            tasks: TaskTracker::new(),
            runtime,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Sessions and relay directions still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }
}

/// Accept clients until shutdown, running `serve` for each on the context's runtime.
pub(crate) async fn accept_loop<F, Fut>(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    front_end: &'static str,
    serve: F,
) -> Result<()>
where
    F: Fn(Arc<ProxyContext>, tokio::net::TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let (stream, client_addr) = tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(front_end, error = %e, "accept error");
                    continue;
                }
            },
        };

        if let Err(e) = SocketOptions::inbound().apply(&stream) {
            debug!(front_end, client = %client_addr, error = %e, "failed to set socket options");
        }

        let session = serve(Arc::clone(&ctx), stream, client_addr);
        ctx.tasks.spawn_on(
            async move {
                if let Err(e) = session.await {
                    log_session_error(front_end, client_addr, &e);
                }
            },
            &ctx.runtime,
        );
    }
}

fn log_session_error(front_end: &'static str, client: SocketAddr, err: &ProxyError) {
    match err {
        ProxyError::DnsResolutionFailed { .. } | ProxyError::UpstreamConnectFailed { .. } => {
            info!(front_end, client = %client, error = %err, "destination unreachable")
        }
        err if err.is_benign() => debug!(front_end, client = %client, error = %err, "session ended"),
        err => warn!(front_end, client = %client, error = %err, "session error"),
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    ctx: Arc<ProxyContext>,
    socks5_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    listeners: Vec<JoinHandle<Result<()>>>,
    cleanup: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    /// Bound SOCKS5 address (actual port if 0 was requested).
    pub fn socks5_addr(&self) -> SocketAddr {
        self.socks5_addr
    }

    /// Bound HTTP tunnel address, if the tunnel is enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.ctx.manager
    }

    /// Check if every listener is still accepting.
    pub fn is_running(&self) -> bool {
        !self.listeners.is_empty() && self.listeners.iter().all(|h| !h.is_finished())
    }

    /// Sessions and relay directions still running.
    pub fn active_sessions(&self) -> usize {
        self.ctx.active_tasks()
    }

    /// Shut down gracefully.
    ///
    /// Stops both listeners, closes every pooled connection, then waits up to
    /// `shutdown_grace` for in-flight sessions. Sessions still running after
    /// that are left to die with the runtime.
    ///
    /// # Errors
    /// * `ProxyError::Shutdown` - A listener task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let grace = self.ctx.config.shutdown_grace;
        self.ctx.shutdown.cancel();

        let mut panicked = false;
        for handle in self.listeners.drain(..) {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "listener exited with error"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(_)) => panicked = true,
                Err(_) => warn!("listener did not stop within grace period"),
            }
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }

        self.ctx.manager.shutdown(grace).await;

        self.ctx.tasks.close();
        if tokio::time::timeout(grace, self.ctx.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.ctx.tasks.len(),
                "sessions still active after grace period, abandoning"
            );
        } else {
            info!("proxy stopped");
        }

        if panicked {
            return Err(ProxyError::Shutdown("listener task panicked".to_string()));
        }
        Ok(())
    }
}

/// Combined SOCKS5 + HTTP tunnel server.
pub struct ProxyServer {
    config: ProxyConfig,
    manager: Arc<ConnectionManager>,
    runtime: Option<Handle>,
}

impl ProxyServer {
    /// Create a server resolving hostnames through the operating system.
    pub fn new(config: ProxyConfig) -> Self {
        let manager = Arc::new(ConnectionManager::new(&config));
        Self {
            config,
            manager,
            runtime: None,
        }
    }

    /// Create a server with a custom resolver behind the DNS cache.
    pub fn with_resolver(config: ProxyConfig, resolver: Arc<dyn Resolve>) -> Self {
        let manager = Arc::new(ConnectionManager::with_resolver(&config, resolver));
        Self {
            config,
            manager,
            runtime: None,
        }
    }

    /// Spawn sessions and relays on `runtime` instead of the current runtime.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the listeners and start serving.
    ///
    /// Listeners are bound before anything is spawned so the actual
    /// OS-assigned ports are known immediately.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - A listener address is unavailable.
    pub async fn start(self) -> Result<ProxyHandle> {
        let socks5_listener = bind(self.config.socks5_bind_addr)?;
        let socks5_addr = local_addr(&socks5_listener, self.config.socks5_bind_addr)?;

        let http_listener = match self.config.http_bind_addr {
            Some(addr) => {
                let listener = bind(addr)?;
                let bound = local_addr(&listener, addr)?;
                Some((listener, bound))
            }
            None => None,
        };
        let http_addr = http_listener.as_ref().map(|(_, addr)| *addr);

        let runtime = self.runtime.unwrap_or_else(Handle::current);
        let ctx = ProxyContext::new(self.config.clone(), Arc::clone(&self.manager), runtime.clone());

        let mut listeners = Vec::new();
        let socks5 = Socks5Server::new(Arc::clone(&ctx));
        listeners.push(runtime.spawn(socks5.run_on(socks5_listener)));
        info!(addr = %socks5_addr, pooling = self.config.connection_pooling, "SOCKS5 proxy listening");

        if let Some((listener, addr)) = http_listener {
            let http = HttpTunnelServer::new(Arc::clone(&ctx));
            listeners.push(runtime.spawn(http.run_on(listener)));
            info!(addr = %addr, "HTTP tunnel listening");
        }

        let cleanup = runtime.spawn(Arc::clone(&self.manager).run_cleanup(self.config.pool_cleanup_interval));

        Ok(ProxyHandle {
            ctx,
            socks5_addr,
            http_addr,
            listeners,
            cleanup: Some(cleanup),
        })
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    net::bind_listener(addr).map_err(|source| ProxyError::Bind { addr, source })
}

fn local_addr(listener: &TcpListener, requested: SocketAddr) -> Result<SocketAddr> {
    listener.local_addr().map_err(|source| ProxyError::Bind {
        addr: requested,
        source,
    })
}
