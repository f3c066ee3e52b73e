//! Get-or-create for outbound connections.
//!
//! # Flow
//!
//! ```text
//! get_or_create(host, port)
//!       |
//!       v
//! timeout(connect_timeout) {
//!   pool.checkout("host:port") --> slot (shared by concurrent callers)
//!       |
//!       +-- slot filled, peer alive --> reuse
//!       |
//!       +-- slot empty --> one caller dials, others wait:
//!               dns.resolve(host) --> net::connect(ip:port)
//!               |
//!               +-- ok  --> spawn idle supervisor, fill slot
//!               +-- err --> slot stays empty, error to caller
//! }
//! ```
//!
//! The budget runs per caller from the moment it asks, so a waiter queued
//! behind a hanging dial fails at its own deadline rather than after it.
//!
//! The supervisor closes the connection after `idle_timeout` without a read
//! and removes the pool entry whenever the connection closes, whoever closed it.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace};

use crate::{
    conn::Connection,
    dns::{DnsCache, Resolve, SystemResolver},
    net::{self, SocketOptions},
    pool::{pool_key, ConnectionPool},
    ProxyConfig, ProxyError, Result,
};

pub struct ConnectionManager {
    dns: DnsCache,
    pool: Arc<ConnectionPool>,
    idle_timeout: Duration,
    connect_timeout: Duration,
    socket_options: SocketOptions,
    supervisors: TaskTracker,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Manager resolving through the operating system.
    pub fn new(config: &ProxyConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: &ProxyConfig, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            dns: DnsCache::new(config.dns_cache_ttl, resolver),
            pool: Arc::new(ConnectionPool::new()),
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            socket_options: SocketOptions::pooled(),
            supervisors: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Pooled connection to `host:port`, dialing one if none is alive.
    ///
    /// Concurrent calls for the same destination share a single dial.
    ///
    /// # Errors
    /// * `ProxyError::DnsResolutionFailed` - `host` could not be resolved.
    /// * `ProxyError::UpstreamConnectFailed` - Connect refused or timed out.
    /// * `ProxyError::Shutdown` - The manager has been shut down.
    pub async fn get_or_create(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        if self.shutdown.is_cancelled() {
            return Err(ProxyError::Shutdown("connection manager is shut down".into()));
        }
        let key = pool_key(host, port);

        // Measured from this call, so time queued behind another caller's dial counts.
        match tokio::time::timeout(self.connect_timeout, self.acquire(&key, host, port)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(&key, self.connect_timeout)),
        }
    }

    /// One-shot connection to `host:port` that never enters the pool.
    ///
    /// Resolves through the shared DNS cache. `timeout` covers resolve and connect.
    ///
    /// # Errors
    /// * `ProxyError::DnsResolutionFailed` - `host` could not be resolved.
    /// * `ProxyError::UpstreamConnectFailed` - Connect refused or timed out.
    pub async fn connect_direct(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Arc<Connection>> {
        let key = pool_key(host, port);
        let opts = SocketOptions::ad_hoc();
        let attempt = self.open(&key, host, port, &opts);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result.map(Arc::new),
            Err(_) => Err(timed_out(&key, timeout)),
        }
    }

    async fn acquire(&self, key: &str, host: &str, port: u16) -> Result<Arc<Connection>> {
        let conn = self.checkout(key, host, port).await?;
        if conn.probe_alive().await {
            return Ok(conn);
        }

        debug!(key, id = conn.id(), "pooled connection stale, dialing fresh");
        self.pool.remove(key, conn.id());
        // Closed off the caller's budget so a timeout cannot cut the close short.
        self.supervisors.spawn(async move { conn.close_on_flush().await });
        self.checkout(key, host, port).await
    }

    async fn checkout(&self, key: &str, host: &str, port: u16) -> Result<Arc<Connection>> {
        let slot = self.pool.checkout(key);
        slot.get_or_try_init(|| self.dial(key, host, port)).await
    }

    async fn dial(&self, key: &str, host: &str, port: u16) -> Result<Arc<Connection>> {
        let started = Instant::now();
        let conn = Arc::new(self.open(key, host, port, &self.socket_options).await?);
        debug!(
            key,
            id = conn.id(),
            peer = %conn.peer_addr(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pooled connection established"
        );
        self.supervise(key.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn open(
        &self,
        key: &str,
        host: &str,
        port: u16,
        options: &SocketOptions,
    ) -> Result<Connection> {
        let connect_failed = |source| ProxyError::UpstreamConnectFailed {
            target: key.to_string(),
            source,
        };
        let ip = self.dns.resolve(host).await?;
        let stream = net::connect(SocketAddr::new(ip, port), options)
            .await
            .map_err(connect_failed)?;
        Connection::new(stream).map_err(connect_failed)
    }

    /// Idle-read timer plus pool membership for one connection.
    fn supervise(&self, key: String, conn: Arc<Connection>) {
        let pool = Arc::clone(&self.pool);
        let idle_timeout = self.idle_timeout;
        self.supervisors.spawn(async move {
            loop {
                let deadline = conn.last_read() + idle_timeout;
                tokio::select! {
                    _ = conn.closed() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        if conn.last_read() + idle_timeout <= Instant::now() {
                            debug!(key, id = conn.id(), "idle timeout, closing pooled connection");
                            conn.close_on_flush().await;
                            break;
                        }
                    }
                }
            }
            if pool.remove(&key, conn.id()) {
                trace!(key, id = conn.id(), "removed from pool");
            }
        });
    }

    /// Clear the DNS cache and force-close every pooled connection.
    ///
    /// Returns the number of connections closed.
    pub async fn cleanup(&self) -> usize {
        self.dns.clear();
        let drained = self.pool.drain();
        let count = drained.len();
        for conn in drained {
            conn.close_on_flush().await;
        }
        if count > 0 {
            info!(closed = count, "pool cleanup");
        }
        count
    }

    /// Run [`ConnectionManager::cleanup`] every `interval` until shutdown.
    pub async fn run_cleanup(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.cleanup().await;
                }
            }
        }
    }

    /// Refuse new dials, close everything pooled and wait up to `grace` for
    /// supervisors to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.cleanup().await;
        self.supervisors.close();
        if tokio::time::timeout(grace, self.supervisors.wait()).await.is_err() {
            debug!("connection supervisors still running after grace period");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Open connections currently in the pool.
    pub fn pooled_connections(&self) -> usize {
        self.pool.len()
    }

    /// Hostnames currently in the DNS cache.
    pub fn cached_hosts(&self) -> usize {
        self.dns.len()
    }
}

fn timed_out(key: &str, after: Duration) -> ProxyError {
    ProxyError::UpstreamConnectFailed {
        target: key.to_string(),
        source: io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {}ms", after.as_millis()),
        ),
    }
}
