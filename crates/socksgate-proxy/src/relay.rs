//! Bidirectional byte relay.
//!
//! Two flavours share one contract: bytes read from one side are written to
//! the other, in order, until either side ends; then both sides are closed
//! exactly once.
//!
//! - [`RelayPair`] runs each direction as an async task on a caller-supplied
//!   runtime handle. Used by the SOCKS5 front-end.
//! - [`relay_blocking`] runs each direction on a blocking thread with a fixed
//!   8 KiB buffer. Used by the HTTP tunnel.
//!
//! Backpressure comes from the transport: a direction never reads its next
//! chunk until the previous one has been written.

use std::{
    io::{self, Read, Write},
    net::Shutdown,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{net::TcpStream, runtime::Handle};
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::{conn::Connection, net, ProxyError, Result};

/// Read buffer of the blocking relay.
pub const BLOCKING_BUFFER_SIZE: usize = 8192;

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToTarget => "client->target",
            Direction::TargetToClient => "target->client",
        }
    }
}

/// A client and a target connection bound together for one session.
pub struct RelayPair {
    client: Arc<Connection>,
    target: Arc<Connection>,
    active: AtomicBool,
    buffer_size: usize,
}

impl RelayPair {
    pub fn new(client: Arc<Connection>, target: Arc<Connection>, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            client,
            target,
            active: AtomicBool::new(true),
            buffer_size: buffer_size.max(1),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Relay until both directions have finished.
    ///
    /// Both directions are spawned on `runtime` and tracked by `tasks`.
    ///
    /// # Errors
    /// * `ProxyError::RelayIo` - A direction failed with something other than
    ///   a peer reset. Both sides are closed either way.
    pub async fn run(self: Arc<Self>, tasks: &TaskTracker, runtime: &Handle) -> Result<RelayStats> {
        let upstream = tasks.spawn_on(
            Arc::clone(&self).pump(Direction::ClientToTarget),
            runtime,
        );
        let downstream = tasks.spawn_on(
            Arc::clone(&self).pump(Direction::TargetToClient),
            runtime,
        );

        let (up, down) = tokio::join!(upstream, downstream);
        // A panicked direction still has to release both sockets.
        self.close().await;
        let up = up.map_err(|e| ProxyError::RelayIo(io::Error::other(e)))?;
        let down = down.map_err(|e| ProxyError::RelayIo(io::Error::other(e)))?;

        let stats = RelayStats {
            client_to_target: *up.as_ref().unwrap_or(&0),
            target_to_client: *down.as_ref().unwrap_or(&0),
        };
        for result in [up, down] {
            if let Err(err) = result {
                if !net::is_benign(&err) {
                    return Err(ProxyError::RelayIo(err));
                }
            }
        }
        Ok(stats)
    }

    async fn pump(self: Arc<Self>, direction: Direction) -> io::Result<u64> {
        let (from, to) = match direction {
            Direction::ClientToTarget => (&self.client, &self.target),
            Direction::TargetToClient => (&self.target, &self.client),
        };
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        let result = loop {
            let n = match from.read(&mut buf).await {
                Ok(0) => break Ok(total),
                Ok(n) => n,
                Err(err) => break Err(err),
            };
            if !to.is_open() {
                trace!(direction = direction.as_str(), dropped = n, "peer closed, dropping data");
                break Ok(total);
            }
            if let Err(err) = to.write_all(&buf[..n]).await {
                break Err(err);
            }
            total += n as u64;
        };

        match &result {
            Ok(bytes) => trace!(direction = direction.as_str(), bytes, "relay direction finished"),
            Err(err) if net::is_benign(err) => {
                debug!(direction = direction.as_str(), error = %err, "relay closed by peer")
            }
            Err(err) => warn!(direction = direction.as_str(), error = %err, "relay error"),
        }

        self.close().await;
        result
    }

    /// Flush and close both sides. Only the first call closes; later calls are no-ops.
    pub async fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tokio::join!(self.client.close_on_flush(), self.target.close_on_flush());
        }
    }
}

/// Relay between two sockets on blocking threads until either side ends.
///
/// Each direction gets its own thread from the runtime's bounded blocking
/// pool. When a direction finishes, both sockets are shut down so the
/// opposite thread's read returns.
pub async fn relay_blocking(
    client: TcpStream,
    target: TcpStream,
    runtime: &Handle,
) -> io::Result<RelayStats> {
    let client = into_blocking(client)?;
    let target = into_blocking(target)?;
    let closed = Arc::new(AtomicBool::new(false));

    let upstream = {
        let (from, to) = (client.try_clone()?, target.try_clone()?);
        let closed = Arc::clone(&closed);
        runtime.spawn_blocking(move || copy_then_close(from, to, &closed, Direction::ClientToTarget))
    };
    let downstream = {
        let closed = Arc::clone(&closed);
        runtime.spawn_blocking(move || copy_then_close(target, client, &closed, Direction::TargetToClient))
    };

    let (up, down) = tokio::join!(upstream, downstream);
    Ok(RelayStats {
        client_to_target: up.map_err(io::Error::other)?,
        target_to_client: down.map_err(io::Error::other)?,
    })
}

fn into_blocking(stream: TcpStream) -> io::Result<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

fn copy_then_close(
    mut from: std::net::TcpStream,
    mut to: std::net::TcpStream,
    closed: &AtomicBool,
    direction: Direction,
) -> u64 {
    let mut buf = [0u8; BLOCKING_BUFFER_SIZE];
    let mut total = 0u64;
    let result: io::Result<()> = loop {
        match from.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(err) = to.write_all(&buf[..n]).and_then(|_| to.flush()) {
                    break Err(err);
                }
                total += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => break Err(err),
        }
    };

    match result {
        Err(err) if !closed.load(Ordering::Acquire) && !net::is_benign(&err) => {
            warn!(direction = direction.as_str(), error = %err, "tunnel relay error")
        }
        Err(err) => debug!(direction = direction.as_str(), error = %err, "tunnel relay closed"),
        Ok(()) => trace!(direction = direction.as_str(), bytes = total, "tunnel direction finished"),
    }

    if !closed.swap(true, Ordering::AcqRel) {
        let _ = from.shutdown(Shutdown::Both);
        let _ = to.shutdown(Shutdown::Both);
    }
    total
}
