//! SOCKS5 wire codec (RFC 1928).
//!
//! Only the framing lives here: method selection, command request and reply,
//! and the address encoding shared by both. What to do with a frame is the
//! session's business.

use std::{
    fmt,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[rustfmt::skip]
pub mod consts {
    pub const SOCKS5_VERSION:                      u8 = 0x05;
    /// First byte of a username/password sub-negotiation (RFC 1929).
    pub const PASSWORD_AUTH_VERSION:               u8 = 0x01;

    pub const AUTH_METHOD_NONE:                    u8 = 0x00;
    pub const AUTH_METHOD_GSSAPI:                  u8 = 0x01;
    pub const AUTH_METHOD_PASSWORD:                u8 = 0x02;
    pub const AUTH_METHOD_NOT_ACCEPTABLE:          u8 = 0xff;

    pub const CMD_TCP_CONNECT:                     u8 = 0x01;
    pub const CMD_TCP_BIND:                        u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE:                   u8 = 0x03;

    pub const ADDR_TYPE_IPV4:                      u8 = 0x01;
    pub const ADDR_TYPE_DOMAIN_NAME:               u8 = 0x03;
    pub const ADDR_TYPE_IPV6:                      u8 = 0x04;

    pub const REPLY_SUCCEEDED:                     u8 = 0x00;
    pub const REPLY_GENERAL_FAILURE:               u8 = 0x01;
    pub const REPLY_CONNECTION_NOT_ALLOWED:        u8 = 0x02;
    pub const REPLY_NETWORK_UNREACHABLE:           u8 = 0x03;
    pub const REPLY_HOST_UNREACHABLE:              u8 = 0x04;
    pub const REPLY_CONNECTION_REFUSED:            u8 = 0x05;
    pub const REPLY_TTL_EXPIRED:                   u8 = 0x06;
    pub const REPLY_COMMAND_NOT_SUPPORTED:         u8 = 0x07;
    pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED:    u8 = 0x08;
}

/// SOCKS5 command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    TcpConnect,
    TcpBind,
    UdpAssociate,
    /// Any code outside RFC 1928; kept so the session can refuse it.
    Other(u8),
}

impl Command {
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Command::TcpConnect   => consts::CMD_TCP_CONNECT,
            Command::TcpBind      => consts::CMD_TCP_BIND,
            Command::UdpAssociate => consts::CMD_UDP_ASSOCIATE,
            Command::Other(c)     => c,
        }
    }

    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Command {
        match code {
            consts::CMD_TCP_CONNECT   => Command::TcpConnect,
            consts::CMD_TCP_BIND      => Command::TcpBind,
            consts::CMD_UDP_ASSOCIATE => Command::UdpAssociate,
            c                         => Command::Other(c),
        }
    }
}

/// SOCKS5 reply code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Other(u8),
}

impl Reply {
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Reply::Succeeded               => consts::REPLY_SUCCEEDED,
            Reply::GeneralFailure          => consts::REPLY_GENERAL_FAILURE,
            Reply::ConnectionNotAllowed    => consts::REPLY_CONNECTION_NOT_ALLOWED,
            Reply::NetworkUnreachable      => consts::REPLY_NETWORK_UNREACHABLE,
            Reply::HostUnreachable         => consts::REPLY_HOST_UNREACHABLE,
            Reply::ConnectionRefused       => consts::REPLY_CONNECTION_REFUSED,
            Reply::TtlExpired              => consts::REPLY_TTL_EXPIRED,
            Reply::CommandNotSupported     => consts::REPLY_COMMAND_NOT_SUPPORTED,
            Reply::AddressTypeNotSupported => consts::REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Reply::Other(c)                => c,
        }
    }

    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Reply {
        match code {
            consts::REPLY_SUCCEEDED                  => Reply::Succeeded,
            consts::REPLY_GENERAL_FAILURE            => Reply::GeneralFailure,
            consts::REPLY_CONNECTION_NOT_ALLOWED     => Reply::ConnectionNotAllowed,
            consts::REPLY_NETWORK_UNREACHABLE        => Reply::NetworkUnreachable,
            consts::REPLY_HOST_UNREACHABLE           => Reply::HostUnreachable,
            consts::REPLY_CONNECTION_REFUSED         => Reply::ConnectionRefused,
            consts::REPLY_TTL_EXPIRED                => Reply::TtlExpired,
            consts::REPLY_COMMAND_NOT_SUPPORTED      => Reply::CommandNotSupported,
            consts::REPLY_ADDRESS_TYPE_NOT_SUPPORTED => Reply::AddressTypeNotSupported,
            c                                        => Reply::Other(c),
        }
    }
}

/// SOCKS5 codec error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("unsupported socks version {0:#x}")]
    UnsupportedSocksVersion(u8),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("address domain name must be UTF-8 encoding")]
    AddressDomainInvalidEncoding,
}

/// Destination address as carried in a request or reply.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainNameAddress(String, u16),
}

impl Address {
    /// Parse `ATYP | ADDR | PORT` from a stream.
    pub async fn read_from<R>(stream: &mut R) -> Result<Address, Error>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;
        match atyp {
            consts::ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await?;
                let port = stream.read_u16().await?;
                Ok(Address::SocketAddress(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(buf)),
                    port,
                )))
            }
            consts::ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 16];
                stream.read_exact(&mut buf).await?;
                let port = stream.read_u16().await?;
                Ok(Address::SocketAddress(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(buf)),
                    port,
                )))
            }
            consts::ADDR_TYPE_DOMAIN_NAME => {
                let len = stream.read_u8().await? as usize;
                let mut raw = vec![0u8; len];
                stream.read_exact(&mut raw).await?;
                let port = stream.read_u16().await?;
                let domain = String::from_utf8(raw).map_err(|_| Error::AddressDomainInvalidEncoding)?;
                Ok(Address::DomainNameAddress(domain, port))
            }
            other => Err(Error::AddressTypeNotSupported(other)),
        }
    }

    /// Address type tag this address is encoded with.
    pub fn address_type(&self) -> u8 {
        match self {
            Address::SocketAddress(SocketAddr::V4(..)) => consts::ADDR_TYPE_IPV4,
            Address::SocketAddress(SocketAddr::V6(..)) => consts::ADDR_TYPE_IPV6,
            Address::DomainNameAddress(..) => consts::ADDR_TYPE_DOMAIN_NAME,
        }
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.address_type());
        match self {
            Address::SocketAddress(SocketAddr::V4(addr)) => buf.put_slice(&addr.ip().octets()),
            Address::SocketAddress(SocketAddr::V6(addr)) => buf.put_slice(&addr.ip().octets()),
            Address::DomainNameAddress(domain, _) => {
                // Length is a single octet; longer names cannot be framed.
                let bytes = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                buf.put_u8(bytes.len() as u8);
                buf.put_slice(bytes);
            }
        }
        buf.put_u16(self.port());
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(domain, _) => 1 + 1 + domain.len().min(u8::MAX as usize) + 2,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(_, port) => *port,
        }
    }

    /// Host part without the port: an IP literal or a domain name.
    pub fn host(&self) -> String {
        match self {
            Address::SocketAddress(addr) => addr.ip().to_string(),
            Address::DomainNameAddress(domain, _) => domain.clone(),
        }
    }

    /// `0.0.0.0:0`, the address carried by failure replies.
    pub fn unspecified() -> Address {
        Address::SocketAddress(SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::SocketAddress(addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::SocketAddress(addr)
    }
}

/// Method-selection message, read after its version octet.
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    /// Read `NMETHODS | METHODS`; the caller has already consumed `VER`.
    pub async fn read_methods<R>(r: &mut R) -> Result<HandshakeRequest, Error>
    where
        R: AsyncRead + Unpin,
    {
        let nmethods = r.read_u8().await? as usize;
        let mut methods = vec![0u8; nmethods];
        r.read_exact(&mut methods).await?;
        Ok(HandshakeRequest { methods })
    }

    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// Method-selection reply: `VER | METHOD`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub chosen_method: u8,
}

impl HandshakeResponse {
    pub fn new(chosen_method: u8) -> HandshakeResponse {
        HandshakeResponse { chosen_method }
    }

    pub async fn write_to<W>(self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&[consts::SOCKS5_VERSION, self.chosen_method]).await?;
        w.flush().await
    }
}

/// Command request after the handshake.
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    /// Read `VER | CMD | RSV`, returning the command before any address bytes.
    ///
    /// Split from [`TcpRequestHeader::read_from`] so a session can refuse an
    /// unsupported command without consuming the rest of the frame.
    pub async fn read_command<R>(r: &mut R) -> Result<Command, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        Ok(Command::from_u8(buf[1]))
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpRequestHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let command = Self::read_command(r).await?;
        let address = Address::read_from(r).await?;
        Ok(TcpRequestHeader { command, address })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.command.as_u8(), 0x00]);
        self.address.write_to_buf(buf);
    }
}

/// Command reply.
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> TcpResponseHeader {
        TcpResponseHeader { reply, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpResponseHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        let address = Address::read_from(r).await?;
        Ok(TcpResponseHeader {
            reply: Reply::from_u8(buf[1]),
            address,
        })
    }

    /// Write the whole reply and flush it.
    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        w.write_all(&buf).await?;
        w.flush().await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.reply.as_u8(), 0x00]);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}
