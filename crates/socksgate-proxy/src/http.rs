//! HTTP `CONNECT` tunnel.
//!
//! The request line names the destination; headers are read and discarded.
//! On a successful dial the client gets `200 Connection Established` and the
//! socket pair is handed to the blocking relay. Any failure before that is
//! answered with a `500` carrying the error message, then the client is
//! closed. No pooling: every tunnel dials its own connection.

use std::{fmt, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, trace};

use crate::{
    net::{self, SocketOptions},
    relay,
    server::{accept_loop, ProxyContext},
    ProxyError, Result,
};

/// Largest request head accepted, request line included.
pub const MAX_HEAD_SIZE: usize = 8192;

const DEFAULT_PORT: u16 = 80;

pub const ESTABLISHED_RESPONSE: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: Simple-Http-Proxy/1.0\r\n\r\n";

/// `500` response carrying `message` as a plain-text body.
pub fn error_response(message: &str) -> String {
    format!(
        "HTTP/1.1 500 Internal Server Error\r\n\
         Content-Type: text/plain\r\n\
         Proxy-Agent: Simple-Http-Proxy/1.0\r\n\
         Connection: close\r\n\
         \r\n\
         Proxy Error: {message}"
    )
}

/// Destination named by a tunnel request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    /// Parse `METHOD target HTTP/version`.
    ///
    /// `target` may be `host`, `host:port`, `[v6]:port` or a full
    /// `http://` / `https://` URL; any path is ignored. The method is not
    /// checked. Without an explicit port the target is port 80.
    pub fn parse_request_line(line: &str) -> Result<TunnelTarget> {
        let mut parts = line.split_whitespace();
        let target = match (parts.next(), parts.next()) {
            (Some(_method), Some(target)) => target,
            _ => return Err(ProxyError::HttpRequest(format!("Invalid request line: {line}"))),
        };

        let authority = target
            .strip_prefix("http://")
            .or_else(|| target.strip_prefix("https://"))
            .unwrap_or(target);
        let authority = authority.split('/').next().unwrap_or_default();
        let invalid = || ProxyError::HttpRequest(format!("Invalid target host: {authority}"));

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            match after {
                "" => (host, None),
                _ => (host, Some(after.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() || port == Some("") {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| ProxyError::HttpRequest(format!("Invalid target port: {port}")))?,
            None => DEFAULT_PORT,
        };

        Ok(TunnelTarget {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Index just past the blank line ending the head, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Read the request head, returning the request line and any bytes the
/// client sent after the head.
///
/// A client that half-closes after a complete request line is served with
/// that line alone.
pub async fn read_request_head<R>(reader: &mut R) -> Result<(String, Vec<u8>)>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProxyError::HttpRequest(format!(
                "Request head exceeds {MAX_HEAD_SIZE} bytes"
            )));
        }
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::HttpRequest(format!("Failed to read request: {e}")))?;
        if n == 0 {
            match buf.iter().position(|&b| b == b'\n') {
                Some(_) => break buf.len(),
                None => {
                    return Err(ProxyError::HttpRequest(format!(
                        "Invalid request line: {}",
                        String::from_utf8_lossy(&buf).trim()
                    )))
                }
            }
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let leftover = buf.split_off(head_end);
    let head = String::from_utf8_lossy(&buf);
    let line = head.lines().next().unwrap_or_default().trim().to_string();
    if line.is_empty() {
        return Err(ProxyError::HttpRequest("Invalid request line: ".to_string()));
    }
    Ok((line, leftover))
}

/// HTTP `CONNECT` accept loop.
pub struct HttpTunnelServer {
    ctx: Arc<ProxyContext>,
}

impl HttpTunnelServer {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Serve clients from a pre-bound listener until the context shuts down.
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        accept_loop(listener, self.ctx, "http", serve).await
    }
}

async fn serve(ctx: Arc<ProxyContext>, mut client: TcpStream, client_addr: SocketAddr) -> Result<()> {
    trace!(client = %client_addr, "tunnel client accepted");

    let opened = async {
        let (line, leftover) = read_request_head(&mut client).await?;
        debug!(client = %client_addr, request = %line, "tunnel request");
        let target = TunnelTarget::parse_request_line(&line)?;
        let upstream = net::connect_host(
            &target.host,
            target.port,
            &SocketOptions::ad_hoc(),
            ctx.config.connect_timeout,
        )
        .await
        .map_err(|source| ProxyError::UpstreamConnectFailed {
            target: target.to_string(),
            source,
        })?;
        Ok::<_, ProxyError>((target, leftover, upstream))
    }
    .await;

    let (target, leftover, mut upstream) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            if let Err(e) = client.write_all(error_response(&err.to_string()).as_bytes()).await {
                debug!(client = %client_addr, error = %e, "failed to send error response");
            }
            let _ = client.shutdown().await;
            return Err(err);
        }
    };

    client
        .write_all(ESTABLISHED_RESPONSE)
        .await
        .map_err(ProxyError::RelayIo)?;
    if !leftover.is_empty() {
        upstream.write_all(&leftover).await.map_err(ProxyError::RelayIo)?;
    }
    info!(client = %client_addr, target = %target, "tunnel established");

    let stats = relay::relay_blocking(client, upstream, &ctx.runtime)
        .await
        .map_err(ProxyError::RelayIo)?;
    debug!(
        client = %client_addr,
        target = %target,
        sent = stats.client_to_target,
        received = stats.target_to_client,
        "tunnel closed"
    );
    Ok(())
}
