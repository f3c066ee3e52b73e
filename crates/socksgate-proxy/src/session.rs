//! Per-connection SOCKS5 state machine.
//!
//! # States
//!
//! ```text
//! AwaitingVersionMethods
//!       |
//!       +-- no-auth not offered --> reply 0xFF, close
//!       +-- password sub-negotiation / other version --> close, no reply
//!       |
//!       v (reply 0x00)
//! MethodSelected --> AwaitingCommand
//!                        |
//!                        +-- BIND / unknown --> close, no reply
//!                        |
//!                        v
//!                  CommandHandled (reply sent, no more SOCKS5 framing)
//!                        |
//!                        +-- CONNECT ok      --> relay until either side closes
//!                        +-- CONNECT failed  --> failure reply, close
//!                        +-- UDP_ASSOCIATE   --> hold control connection until client closes
//! ```
//!
//! Each reply is written and flushed before the next stage reads anything,
//! so the command reply always precedes relayed data.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, trace};

use crate::{
    conn::Connection,
    relay::RelayPair,
    server::{accept_loop, ProxyContext},
    socks5::{
        consts, Address, Command, HandshakeRequest, HandshakeResponse, Reply, TcpRequestHeader,
        TcpResponseHeader,
    },
    ProxyError, Result,
};

/// Where a session is in the SOCKS5 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingVersionMethods,
    MethodSelected,
    AwaitingCommand,
    /// Terminal: the reply has been sent and the connection is a raw pipe or idle.
    CommandHandled,
}

/// Parsed command request, consumed by the command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command: Command,
    pub address: Address,
}

/// One accepted SOCKS5 client.
pub struct Socks5Session {
    stream: TcpStream,
    client_addr: SocketAddr,
    state: SessionState,
    ctx: Arc<ProxyContext>,
}

impl Socks5Session {
    pub fn new(stream: TcpStream, client_addr: SocketAddr, ctx: Arc<ProxyContext>) -> Self {
        Self {
            stream,
            client_addr,
            state: SessionState::AwaitingVersionMethods,
            ctx,
        }
    }

    /// Drive the session to completion.
    ///
    /// Protocol errors are answered (or not) on the wire and then returned
    /// for logging; they never outlive the session.
    pub async fn run(mut self) -> Result<()> {
        let shutdown = self.ctx.shutdown.clone();
        let pending = tokio::select! {
            pending = self.negotiate() => pending?,
            _ = shutdown.cancelled() => {
                return Err(ProxyError::Shutdown("server stopped during negotiation".into()));
            }
        };
        trace!(client = %self.client_addr, command = ?pending.command, target = %pending.address, "command received");
        self.handle_command(pending).await
    }

    async fn negotiate(&mut self) -> Result<PendingCommand> {
        loop {
            self.state = match self.state {
                SessionState::AwaitingVersionMethods => self.select_method().await?,
                SessionState::MethodSelected => SessionState::AwaitingCommand,
                SessionState::AwaitingCommand => return self.read_command().await,
                SessionState::CommandHandled => {
                    return Err(ProxyError::protocol_io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "command already handled",
                    )));
                }
            };
        }
    }

    async fn select_method(&mut self) -> Result<SessionState> {
        let version = self.stream.read_u8().await.map_err(ProxyError::protocol_io)?;
        match version {
            consts::SOCKS5_VERSION => {
                let request = HandshakeRequest::read_methods(&mut self.stream).await?;
                if !request.offers(consts::AUTH_METHOD_NONE) {
                    debug!(client = %self.client_addr, methods = ?request.methods, "no acceptable auth method");
                    HandshakeResponse::new(consts::AUTH_METHOD_NOT_ACCEPTABLE)
                        .write_to(&mut self.stream)
                        .await
                        .map_err(ProxyError::protocol_io)?;
                    let _ = self.stream.shutdown().await;
                    return Err(ProxyError::HandshakeRejected);
                }
                HandshakeResponse::new(consts::AUTH_METHOD_NONE)
                    .write_to(&mut self.stream)
                    .await
                    .map_err(ProxyError::protocol_io)?;
                Ok(SessionState::MethodSelected)
            }
            consts::PASSWORD_AUTH_VERSION => {
                debug!(client = %self.client_addr, "password sub-negotiation without method selection");
                Err(crate::socks5::Error::UnsupportedSocksVersion(version).into())
            }
            other => Err(crate::socks5::Error::UnsupportedSocksVersion(other).into()),
        }
    }

    async fn read_command(&mut self) -> Result<PendingCommand> {
        let command = TcpRequestHeader::read_command(&mut self.stream).await?;
        match command {
            Command::TcpConnect | Command::UdpAssociate => {
                let address = Address::read_from(&mut self.stream).await?;
                Ok(PendingCommand { command, address })
            }
            Command::TcpBind | Command::Other(_) => Err(ProxyError::UnsupportedCommand(command.as_u8())),
        }
    }

    async fn handle_command(self, pending: PendingCommand) -> Result<()> {
        match pending.command {
            Command::TcpConnect => self.connect(pending.address).await,
            Command::UdpAssociate => self.udp_associate().await,
            other => Err(ProxyError::UnsupportedCommand(other.as_u8())),
        }
    }

    async fn connect(mut self, address: Address) -> Result<()> {
        let target = match self.open_target(&address).await {
            Ok(target) => target,
            Err(err) => {
                let reply = TcpResponseHeader::new(Reply::GeneralFailure, Address::unspecified());
                self.state = SessionState::CommandHandled;
                if let Err(e) = reply.write_to(&mut self.stream).await {
                    trace!(client = %self.client_addr, error = %e, "failed to send failure reply");
                }
                let _ = self.stream.shutdown().await;
                return Err(err);
            }
        };

        // Echo what the client asked for, not what was dialed.
        TcpResponseHeader::new(Reply::Succeeded, address.clone())
            .write_to(&mut self.stream)
            .await
            .map_err(ProxyError::protocol_io)?;
        self.state = SessionState::CommandHandled;
        info!(
            client = %self.client_addr,
            target = %address,
            upstream = target.id(),
            "tunnel established"
        );

        let client = Connection::new(self.stream).map_err(ProxyError::RelayIo)?;
        let pair = RelayPair::new(Arc::new(client), target, self.ctx.config.relay_buffer_size);
        let stats = pair.run(&self.ctx.tasks, &self.ctx.runtime).await?;
        debug!(
            client = %self.client_addr,
            target = %address,
            sent = stats.client_to_target,
            received = stats.target_to_client,
            "tunnel closed"
        );
        Ok(())
    }

    async fn open_target(&self, address: &Address) -> Result<Arc<Connection>> {
        let host = address.host();
        let port = address.port();
        let manager = &self.ctx.manager;
        if self.ctx.config.connection_pooling {
            manager.get_or_create(&host, port).await
        } else {
            manager
                .connect_direct(&host, port, self.ctx.config.direct_connect_timeout)
                .await
        }
    }

    async fn udp_associate(mut self) -> Result<()> {
        let bound = self.stream.local_addr().map_err(ProxyError::protocol_io)?;
        TcpResponseHeader::new(Reply::Succeeded, Address::SocketAddress(bound))
            .write_to(&mut self.stream)
            .await
            .map_err(ProxyError::protocol_io)?;
        self.state = SessionState::CommandHandled;
        debug!(client = %self.client_addr, %bound, "udp associate acknowledged");

        // The association lives as long as the control connection.
        let mut sink = [0u8; 512];
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return Ok(()),
                read = self.stream.read(&mut sink) => match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => continue,
                },
            }
        }
    }
}

/// SOCKS5 accept loop.
pub struct Socks5Server {
    ctx: Arc<ProxyContext>,
}

impl Socks5Server {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Serve clients from a pre-bound listener until the context shuts down.
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        accept_loop(listener, self.ctx, "socks5", serve).await
    }
}

async fn serve(ctx: Arc<ProxyContext>, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
    trace!(client = %client_addr, "socks5 client accepted");
    Socks5Session::new(stream, client_addr, ctx).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::{CountingResolver, HangingResolver};
    use crate::dns::Resolve;
    use crate::{ConnectionManager, ProxyConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::runtime::Handle;

    async fn tcp_listener_or_skip() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    /// SOCKS5 server on loopback backed by a fake resolver.
    async fn start_proxy(config: ProxyConfig) -> Option<(SocketAddr, Arc<ProxyContext>)> {
        let resolver = Arc::new(CountingResolver::new(&[("echo.test", "127.0.0.1")]));
        start_proxy_with(config, resolver).await
    }

    async fn start_proxy_with(
        config: ProxyConfig,
        resolver: Arc<dyn Resolve>,
    ) -> Option<(SocketAddr, Arc<ProxyContext>)> {
        let listener = tcp_listener_or_skip().await?;
        let addr = listener.local_addr().unwrap();
        let manager = Arc::new(ConnectionManager::with_resolver(&config, resolver));
        let ctx = ProxyContext::new(config, manager, Handle::current());
        tokio::spawn(Socks5Server::new(Arc::clone(&ctx)).run_on(listener));
        Some((addr, ctx))
    }

    /// Echo server counting accepted connections.
    async fn echo_server() -> Option<(SocketAddr, Arc<AtomicUsize>)> {
        let listener = tcp_listener_or_skip().await?;
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        Some((addr, accepted))
    }

    async fn greet(stream: &mut TcpStream, methods: &[u8]) -> [u8; 2] {
        let mut hello = vec![0x05, methods.len() as u8];
        hello.extend_from_slice(methods);
        stream.write_all(&hello).await.unwrap();
        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await.unwrap();
        resp
    }

    async fn send_request(stream: &mut TcpStream, command: Command, address: &Address) {
        let mut buf = Vec::new();
        TcpRequestHeader {
            command,
            address: address.clone(),
        }
        .write_to_buf(&mut buf);
        stream.write_all(&buf).await.unwrap();
    }

    async fn assert_closed_without_bytes(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .expect("server should close the connection")
            .unwrap_or(0);
        assert_eq!(n, 0, "expected close without reply, got {:?}", &buf[..n]);
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    #[tokio::test]
    async fn test_handshake_selects_no_auth() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        assert_eq!(greet(&mut client, &[0x02, 0x00]).await, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_handshake_without_no_auth_is_rejected() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        assert_eq!(greet(&mut client, &[0x02]).await, [0x05, 0xff]);
        assert_closed_without_bytes(&mut client).await;
    }

    #[tokio::test]
    async fn test_password_subnegotiation_closes_silently() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x01, 0x04, b'u', b's', b'e', b'r', 0x02, b'p', b'w']).await.unwrap();
        assert_closed_without_bytes(&mut client).await;
    }

    #[tokio::test]
    async fn test_socks4_greeting_closes_silently() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x04, 0x01, 0x00, 0x50, 127, 0, 0, 1, 0x00]).await.unwrap();
        assert_closed_without_bytes(&mut client).await;
    }

    // ========================================================================
    // Commands
    // ========================================================================

    #[tokio::test]
    async fn test_bind_command_closes_without_reply() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        greet(&mut client, &[0x00]).await;
        send_request(&mut client, Command::TcpBind, &Address::unspecified()).await;
        assert_closed_without_bytes(&mut client).await;
    }

    #[tokio::test]
    async fn test_unknown_command_closes_without_reply() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        greet(&mut client, &[0x00]).await;
        send_request(&mut client, Command::Other(0x09), &Address::unspecified()).await;
        assert_closed_without_bytes(&mut client).await;
    }

    #[tokio::test]
    async fn test_connect_echoes_requested_domain_and_relays() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let Some((echo, _accepted)) = echo_server().await else {
            return;
        };
        let requested = Address::DomainNameAddress("echo.test".to_string(), echo.port());

        let mut client = TcpStream::connect(proxy).await.unwrap();
        greet(&mut client, &[0x00]).await;
        send_request(&mut client, Command::TcpConnect, &requested).await;
        let reply = TcpResponseHeader::read_from(&mut client).await.unwrap();
        assert_eq!(reply.reply, Reply::Succeeded);
        assert_eq!(reply.address, requested);

        client.write_all(b"round trip").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"round trip");
    }

    #[tokio::test]
    async fn test_connect_failure_sends_failure_reply() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        greet(&mut client, &[0x00]).await;
        send_request(
            &mut client,
            Command::TcpConnect,
            &Address::DomainNameAddress("nowhere.test".to_string(), 80),
        )
        .await;

        let reply = TcpResponseHeader::read_from(&mut client).await.unwrap();
        assert_eq!(reply.reply, Reply::GeneralFailure);
        assert_closed_without_bytes(&mut client).await;
    }

    /// CONNECT to a host whose lookup never finishes; returns the reply and how long it took.
    async fn connect_to_unresolvable(config: ProxyConfig) -> Option<(Reply, Duration)> {
        let (proxy, _ctx) = start_proxy_with(config, Arc::new(HangingResolver)).await?;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        greet(&mut client, &[0x00]).await;

        let started = tokio::time::Instant::now();
        send_request(
            &mut client,
            Command::TcpConnect,
            &Address::DomainNameAddress("slow.test".to_string(), 443),
        )
        .await;
        let reply = TcpResponseHeader::read_from(&mut client).await.unwrap();
        let elapsed = started.elapsed();
        assert_closed_without_bytes(&mut client).await;
        Some((reply.reply, elapsed))
    }

    #[tokio::test]
    async fn test_pooled_connect_timeout_sends_failure_reply() {
        let config = ProxyConfig {
            connect_timeout: Duration::from_millis(200),
            ..ProxyConfig::loopback()
        };
        let Some((reply, elapsed)) = connect_to_unresolvable(config).await else {
            return;
        };
        assert_eq!(reply, Reply::GeneralFailure);
        assert!(elapsed >= Duration::from_millis(150), "replied after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "replied after {elapsed:?}");
    }

    #[tokio::test]
    async fn test_direct_connect_timeout_sends_failure_reply() {
        let config = ProxyConfig {
            connection_pooling: false,
            connect_timeout: Duration::from_secs(30),
            direct_connect_timeout: Duration::from_millis(200),
            ..ProxyConfig::loopback()
        };
        let Some((reply, elapsed)) = connect_to_unresolvable(config).await else {
            return;
        };
        assert_eq!(reply, Reply::GeneralFailure);
        assert!(elapsed < Duration::from_secs(1), "replied after {elapsed:?}");
    }

    #[tokio::test]
    async fn test_second_connect_reuses_pooled_connection() {
        let Some((proxy, ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let Some((echo, accepted)) = echo_server().await else {
            return;
        };
        let requested = Address::DomainNameAddress("echo.test".to_string(), echo.port());

        let mut first = TcpStream::connect(proxy).await.unwrap();
        greet(&mut first, &[0x00]).await;
        send_request(&mut first, Command::TcpConnect, &requested).await;
        TcpResponseHeader::read_from(&mut first).await.unwrap();

        let mut second = TcpStream::connect(proxy).await.unwrap();
        greet(&mut second, &[0x00]).await;
        send_request(&mut second, Command::TcpConnect, &requested).await;
        let reply = TcpResponseHeader::read_from(&mut second).await.unwrap();
        assert_eq!(reply.reply, Reply::Succeeded);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.manager().pooled_connections(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_pooling_dials_each_time() {
        let config = ProxyConfig {
            connection_pooling: false,
            ..ProxyConfig::loopback()
        };
        let Some((proxy, ctx)) = start_proxy(config).await else {
            return;
        };
        let Some((echo, accepted)) = echo_server().await else {
            return;
        };
        let requested = Address::SocketAddress(echo);

        let mut clients = Vec::new();
        for _ in 0..2 {
            let mut client = TcpStream::connect(proxy).await.unwrap();
            greet(&mut client, &[0x00]).await;
            send_request(&mut client, Command::TcpConnect, &requested).await;
            let reply = TcpResponseHeader::read_from(&mut client).await.unwrap();
            assert_eq!(reply.address, requested);
            clients.push(client);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.manager().pooled_connections(), 0);
    }

    #[tokio::test]
    async fn test_client_close_reaches_destination() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let Some(destination) = tcp_listener_or_skip().await else {
            return;
        };
        let requested = Address::SocketAddress(destination.local_addr().unwrap());

        let mut client = TcpStream::connect(proxy).await.unwrap();
        greet(&mut client, &[0x00]).await;
        send_request(&mut client, Command::TcpConnect, &requested).await;
        let (mut upstream, _) = destination.accept().await.unwrap();
        TcpResponseHeader::read_from(&mut client).await.unwrap();

        client.write_all(b"bye").await.unwrap();
        let mut buf = [0u8; 3];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");
        drop(client);

        // Pooled sockets close with RST, so a reset counts as closed too.
        let n = tokio::time::timeout(Duration::from_secs(1), upstream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_udp_associate_replies_with_local_address() {
        let Some((proxy, _ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        greet(&mut client, &[0x00]).await;
        send_request(&mut client, Command::UdpAssociate, &Address::unspecified()).await;

        let reply = TcpResponseHeader::read_from(&mut client).await.unwrap();
        assert_eq!(reply.reply, Reply::Succeeded);
        assert_eq!(reply.address, Address::SocketAddress(proxy));

        // Control connection stays open and ignores further bytes.
        client.write_all(b"ignored").await.unwrap();
        let mut buf = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_negotiation() {
        let Some((proxy, ctx)) = start_proxy(ProxyConfig::loopback()).await else {
            return;
        };
        let mut client = TcpStream::connect(proxy).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        ctx.shutdown.cancel();
        assert_closed_without_bytes(&mut client).await;
    }
}
