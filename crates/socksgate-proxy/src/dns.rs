//! Hostname resolution with a fixed-TTL cache.
//!
//! # Flow
//!
//! ```text
//! DnsCache::resolve(host)
//!       |
//!       +-- IP literal? --> returned as is, never cached
//!       |
//!       +-- fresh entry (age < ttl)? --> cached address
//!       |
//!       +-- missing or expired --> Resolve::resolve(host)
//!                                    |
//!                                    +-- ok  --> store with now(), return
//!                                    +-- err --> DnsResolutionFailed, cache untouched
//! ```
//!
//! Concurrent misses for the same host may each hit the resolver. Entries
//! live in a `DashMap` so unrelated hosts never contend on one lock.

use std::{io, net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{ProxyError, Result};

/// Something that can turn a hostname into an address.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
///
/// Respects `/etc/hosts`, VPN and corporate DNS configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        tokio::net::lookup_host((host, 0))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
            })
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    addr: IpAddr,
    inserted: Instant,
}

/// Hostname to address cache with a fixed time-to-live.
pub struct DnsCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    resolver: Arc<dyn Resolve>,
}

impl DnsCache {
    pub fn new(ttl: Duration, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            resolver,
        }
    }

    /// Resolve `host`, serving from the cache while the entry is younger than the TTL.
    ///
    /// # Errors
    /// * `ProxyError::DnsResolutionFailed` - The resolver failed; nothing is cached.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(addr) = self.lookup(host) {
            trace!(host, %addr, "dns cache hit");
            return Ok(addr);
        }

        let addr = self
            .resolver
            .resolve(host)
            .await
            .map_err(|source| ProxyError::DnsResolutionFailed {
                host: host.to_string(),
                source,
            })?;
        debug!(host, %addr, "resolved");
        self.entries.insert(
            host.to_string(),
            CacheEntry {
                addr,
                inserted: Instant::now(),
            },
        );
        Ok(addr)
    }

    /// Cached address for `host` if the entry has not expired.
    pub fn lookup(&self, host: &str) -> Option<IpAddr> {
        self.entries
            .get(host)
            .filter(|entry| entry.inserted.elapsed() < self.ttl)
            .map(|entry| entry.addr)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
