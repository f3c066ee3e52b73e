//! Outbound connection pool keyed by `host:port`.
//!
//! Each key owns a [`PoolSlot`] holding a `OnceCell`. Callers racing on the
//! same key share the slot, so only one of them dials and the others await
//! its result. A slot whose connection has been closed is stale: the next
//! checkout swaps in a fresh slot under the map's per-key entry lock.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::conn::Connection;

/// Pool key for a destination.
pub fn pool_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// One pool entry: empty while a dial is in flight or after one failed.
#[derive(Default)]
pub struct PoolSlot {
    cell: OnceCell<Arc<Connection>>,
}

impl PoolSlot {
    /// Connection currently held by the slot, if its dial has completed.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.cell.get()
    }

    /// Return the slot's connection, running `dial` if no caller has filled it yet.
    ///
    /// A failed dial leaves the slot empty, so the next waiter dials in turn.
    pub async fn get_or_try_init<F, Fut, E>(&self, dial: F) -> Result<Arc<Connection>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<Connection>, E>>,
    {
        self.cell.get_or_try_init(dial).await.map(Arc::clone)
    }

    fn is_stale(&self) -> bool {
        self.cell.get().is_some_and(|conn| !conn.is_open())
    }
}

#[derive(Default)]
pub struct ConnectionPool {
    slots: DashMap<String, Arc<PoolSlot>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `key`, creating it when absent or stale.
    pub fn checkout(&self, key: &str) -> Arc<PoolSlot> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_stale() {
                    debug!(key, "pooled connection stale, replacing slot");
                    let fresh = Arc::new(PoolSlot::default());
                    occupied.insert(Arc::clone(&fresh));
                    fresh
                } else {
                    Arc::clone(occupied.get())
                }
            }
            Entry::Vacant(vacant) => vacant.insert(Arc::new(PoolSlot::default())).value().clone(),
        }
    }

    /// Remove `key` only if it still holds the connection with `id`.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, key: &str, id: u64) -> bool {
        self.slots
            .remove_if(key, |_, slot| {
                slot.connection().is_some_and(|conn| conn.id() == id)
            })
            .is_some()
    }

    /// Empty the pool, handing back every established connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .filter_map(|(_, slot)| slot.connection().cloned())
            .collect()
    }

    /// Number of open, established connections.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.connection().is_some_and(|conn| conn.is_open()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_listener_or_skip() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    async fn dial(listener: &TcpListener) -> io::Result<Arc<Connection>> {
        let stream = TcpStream::connect(listener.local_addr()?).await?;
        Ok(Arc::new(Connection::new(stream)?))
    }

    #[test]
    fn test_pool_key_format() {
        assert_eq!(pool_key("example.com", 443), "example.com:443");
        assert_eq!(pool_key("10.0.0.1", 80), "10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_checkout_returns_same_slot() {
        let pool = ConnectionPool::new();
        let a = pool.checkout("a:1");
        let b = pool.checkout("a:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_init_dials_once() {
        let Some(listener) = tcp_listener_or_skip().await else {
            return;
        };
        let pool = Arc::new(ConnectionPool::new());
        let dials = Arc::new(AtomicUsize::new(0));
        let listener = Arc::new(listener);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let dials = Arc::clone(&dials);
            let listener = Arc::clone(&listener);
            handles.push(tokio::spawn(async move {
                let slot = pool.checkout("dest:1");
                slot.get_or_try_init(|| async {
                    dials.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    dial(&listener).await
                })
                .await
                .unwrap()
                .id()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_init_leaves_slot_empty() {
        let pool = ConnectionPool::new();
        let slot = pool.checkout("dest:1");
        let result = slot
            .get_or_try_init(|| async { Err::<Arc<Connection>, _>(io::Error::other("refused")) })
            .await;
        assert!(result.is_err());
        assert!(slot.connection().is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_stale_slot_is_replaced() {
        let Some(listener) = tcp_listener_or_skip().await else {
            return;
        };
        let pool = ConnectionPool::new();
        let first = pool.checkout("dest:1");
        let conn = first.get_or_try_init(|| dial(&listener)).await.unwrap();

        conn.close_on_flush().await;
        let second = pool.checkout("dest:1");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.connection().is_none());
    }

    #[tokio::test]
    async fn test_remove_only_matching_connection() {
        let Some(listener) = tcp_listener_or_skip().await else {
            return;
        };
        let pool = ConnectionPool::new();
        let conn = pool
            .checkout("dest:1")
            .get_or_try_init(|| dial(&listener))
            .await
            .unwrap();

        assert!(!pool.remove("dest:1", conn.id() + 1000));
        assert_eq!(pool.len(), 1);
        assert!(pool.remove("dest:1", conn.id()));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_drain_returns_connections() {
        let Some(listener) = tcp_listener_or_skip().await else {
            return;
        };
        let pool = ConnectionPool::new();
        for key in ["a:1", "b:2"] {
            pool.checkout(key)
                .get_or_try_init(|| dial(&listener))
                .await
                .unwrap();
        }
        pool.checkout("pending:3");

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.checkout("a:1").connection().is_none());
    }
}
