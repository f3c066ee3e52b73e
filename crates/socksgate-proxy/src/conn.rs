//! Shared, closable TCP connection handle.
//!
//! A [`Connection`] is held by the pool, by its idle supervisor and by every
//! relay direction using it. Reads and writes go through per-half locks so
//! one direction never blocks the other. Closing is idempotent: the first
//! [`Connection::close_on_flush`] call flushes, shuts the socket down and
//! wakes every waiter; later calls return immediately.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Upper bound on waiting for an in-flight write before closing anyway.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closing: AtomicBool,
    closed: CancellationToken,
    last_read: StdMutex<Instant>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            last_read: StdMutex::new(Instant::now()),
        })
    }

    /// Process-unique id, used to tell a replaced pool entry from the current one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire)
    }

    /// Instant of the last successful read, or of creation if nothing was read.
    pub fn last_read(&self) -> Instant {
        *self.last_read.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_read.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Resolves once the connection has been closed locally.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Read into `buf`. Returns `Ok(0)` on EOF or once the connection is closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(0);
        };
        let n = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Ok(0),
            result = reader.read(buf) => result?,
        };
        if n > 0 {
            self.touch();
        }
        Ok(n)
    }

    /// Write all of `buf`.
    ///
    /// Fails with `NotConnected` once closing has started.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(ErrorKind::NotConnected.into());
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ErrorKind::NotConnected.into());
        };
        writer.write_all(buf).await
    }

    /// Check whether the remote end is still there without consuming data.
    ///
    /// A connection that is being read by someone else is assumed alive.
    pub async fn probe_alive(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let Ok(mut guard) = self.reader.try_lock() else {
            return true;
        };
        let Some(reader) = guard.as_mut() else {
            return false;
        };
        let mut byte = [0u8; 1];
        // A zero timeout polls the peek exactly once.
        match tokio::time::timeout(Duration::ZERO, reader.peek(&mut byte)).await {
            Err(_) => true,
            Ok(Ok(n)) => n > 0,
            Ok(Err(_)) => false,
        }
    }

    /// Flush pending writes, then close. Only the first call does anything.
    pub async fn close_on_flush(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(id = self.id, peer = %self.peer, "closing connection");

        if let Ok(mut guard) = tokio::time::timeout(FLUSH_TIMEOUT, self.writer.lock()).await {
            if let Some(mut writer) = guard.take() {
                let _ = tokio::time::timeout(FLUSH_TIMEOUT, writer.shutdown()).await;
            }
        }

        self.closed.cancel();

        if let Ok(mut guard) = tokio::time::timeout(FLUSH_TIMEOUT, self.reader.lock()).await {
            guard.take();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
