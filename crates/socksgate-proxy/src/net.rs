//! Socket option plumbing and timed connects.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};

use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::trace;

const LISTEN_BACKLOG: u32 = 1024;

/// Buffer size for pooled outbound and accepted inbound sockets.
pub const POOLED_BUFFER_SIZE: u32 = 256 * 1024;

/// Buffer size for ad-hoc (non-pooled) outbound sockets.
pub const AD_HOC_BUFFER_SIZE: u32 = 32 * 1024;

/// Options applied to every socket the proxy owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub nodelay: bool,
    pub send_buffer_size: Option<u32>,
    pub recv_buffer_size: Option<u32>,
    /// Close with RST instead of lingering on unsent data.
    pub linger_zero: bool,
}

impl SocketOptions {
    /// Options for connections the manager keeps in the pool.
    pub fn pooled() -> Self {
        Self {
            keepalive: true,
            nodelay: true,
            send_buffer_size: Some(POOLED_BUFFER_SIZE),
            recv_buffer_size: Some(POOLED_BUFFER_SIZE),
            linger_zero: true,
        }
    }

    /// Options for one-shot outbound connections.
    pub fn ad_hoc() -> Self {
        Self {
            send_buffer_size: Some(AD_HOC_BUFFER_SIZE),
            recv_buffer_size: Some(AD_HOC_BUFFER_SIZE),
            ..Self::pooled()
        }
    }

    /// Options for accepted client connections.
    ///
    /// Client sockets keep the default linger so the last relayed bytes reach
    /// the client before the FIN.
    pub fn inbound() -> Self {
        Self {
            linger_zero: false,
            ..Self::pooled()
        }
    }

    /// Apply the options to an established stream.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keepalive)?;
        sock.set_nodelay(self.nodelay)?;
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size as usize)?;
        }
        if let Some(size) = self.recv_buffer_size {
            sock.set_recv_buffer_size(size as usize)?;
        }
        if self.linger_zero {
            sock.set_linger(Some(Duration::ZERO))?;
        }
        Ok(())
    }
}

/// Connect to `addr`, sizing buffers before the SYN so window scaling sees them.
pub async fn connect(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(..) => TcpSocket::new_v4()?,
        SocketAddr::V6(..) => TcpSocket::new_v6()?,
    };
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    let stream = socket.connect(addr).await?;
    options.apply(&stream)?;
    trace!(target = %addr, "outbound socket connected");
    Ok(stream)
}

/// Connect to `addr` within `timeout`.
pub async fn connect_timeout(
    addr: SocketAddr,
    options: &SocketOptions,
    timeout: Duration,
) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, connect(addr, options)).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(timeout)),
    }
}

/// Resolve `host` with the system resolver and connect to the first address
/// that accepts, all within `timeout`.
pub async fn connect_host(
    host: &str,
    port: u16,
    options: &SocketOptions,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let attempt = async {
        let mut last_err = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            match connect(addr, options).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("no addresses found for {host}"))
        }))
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(timeout)),
    }
}

/// Bind a listening socket with address reuse and a deep accept backlog.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(..) => TcpSocket::new_v4()?,
        SocketAddr::V6(..) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

fn timed_out(after: Duration) -> io::Error {
    io::Error::new(
        ErrorKind::TimedOut,
        format!("connect timed out after {}ms", after.as_millis()),
    )
}

/// Peer-initiated teardown rather than a local fault.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tcp_listener_or_skip(addr: &str) -> Option<tokio::net::TcpListener> {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    #[test]
    fn test_socket_options_profiles() {
        let pooled = SocketOptions::pooled();
        assert!(pooled.keepalive && pooled.nodelay && pooled.linger_zero);
        assert_eq!(pooled.send_buffer_size, Some(256 * 1024));

        let ad_hoc = SocketOptions::ad_hoc();
        assert_eq!(ad_hoc.recv_buffer_size, Some(32 * 1024));
        assert!(ad_hoc.linger_zero);

        assert!(!SocketOptions::inbound().linger_zero);
    }

    #[test]
    fn test_is_benign() {
        assert!(is_benign(&io::Error::from(ErrorKind::ConnectionReset)));
        assert!(is_benign(&io::Error::from(ErrorKind::BrokenPipe)));
        assert!(is_benign(&io::Error::from(ErrorKind::UnexpectedEof)));
        assert!(!is_benign(&io::Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_benign(&io::Error::from(ErrorKind::TimedOut)));
    }

    #[tokio::test]
    async fn test_connect_applies_options() {
        let Some(listener) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let addr = listener.local_addr().unwrap();

        let stream = connect(addr, &SocketOptions::pooled()).await.unwrap();
        assert!(stream.nodelay().unwrap());
        assert_eq!(stream.linger().unwrap(), Some(Duration::ZERO));
        let (_accepted, _) = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_listener_ephemeral_port() {
        let listener = match bind_listener("127.0.0.1:0".parse().unwrap()) {
            Ok(listener) => listener,
            Err(err) if err.kind() == ErrorKind::PermissionDenied => return,
            Err(err) => panic!("Failed to bind listener: {err}"),
        };
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let Some(listener) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_timeout(addr, &SocketOptions::ad_hoc(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_connect_host_resolves_ip_literal() {
        let Some(listener) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let stream = connect_host("127.0.0.1", port, &SocketOptions::ad_hoc(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }
}
