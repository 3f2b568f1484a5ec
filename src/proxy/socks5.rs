//! SOCKS5 engine (RFC 1928 subset).
//!
//! Terminates a SOCKS5 client on an already-accepted stream: no-auth method
//! negotiation, a single CONNECT request, target dial with reply-code
//! mapping, then hands the pair to the relay loop. No authentication is
//! offered; the tunnel itself is the trust boundary.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::proxy::relay::{relay, RelayConfig, RelayStats};

/// SOCKS protocol version handled here.
pub const SOCKS_VERSION: u8 = 0x05;

/// Authentication method codes.
pub mod method {
    /// No authentication required
    pub const NO_AUTH: u8 = 0x00;
    /// No acceptable methods
    pub const NO_ACCEPTABLE: u8 = 0xFF;
}

/// Request command codes.
pub mod command {
    /// CONNECT
    pub const CONNECT: u8 = 0x01;
    /// BIND
    pub const BIND: u8 = 0x02;
    /// UDP ASSOCIATE
    pub const UDP_ASSOCIATE: u8 = 0x03;
}

/// Address type codes.
pub mod atype {
    /// IPv4 address
    pub const IPV4: u8 = 0x01;
    /// Domain name
    pub const DOMAIN_NAME: u8 = 0x03;
    /// IPv6 address
    pub const IPV6: u8 = 0x04;
}

/// SOCKS5 reply codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Request granted
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    NotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Map a dial error to the reply code sent to the client.
    pub fn from_connect_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Destination of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IPv4 or IPv6 socket address
    Ip(SocketAddr),
    /// Domain name resolved on this side
    Domain(String, u16),
}

impl TargetAddr {
    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Encode in SOCKS5 address form: atyp + address + port.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(atype::IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(atype::IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Domain(domain, port) => {
                buf.put_u8(atype::DOMAIN_NAME);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    /// Command byte
    pub command: u8,
    /// Requested destination
    pub target: TargetAddr,
}

/// Engine settings.
#[derive(Debug, Clone, Copy)]
pub struct Socks5Config {
    /// Bound on method negotiation plus the CONNECT request
    pub handshake_timeout: Duration,
    /// Bound on resolving and dialing the target
    pub connect_timeout: Duration,
    /// Relay settings once connected
    pub relay: RelayConfig,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            relay: RelayConfig::default(),
        }
    }
}

/// Read the greeting and select "no authentication".
///
/// Replies `0xFF` and fails if the client did not offer it. A wrong version
/// byte closes without any reply.
pub async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::VersionMismatch {
            expected: SOCKS_VERSION,
            actual: header[0],
        });
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&method::NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, method::NO_AUTH]).await?;
        Ok(())
    } else {
        stream.write_all(&[SOCKS_VERSION, method::NO_ACCEPTABLE]).await?;
        Err(Error::NoAcceptableMethods)
    }
}

/// Read a request: VER CMD RSV ATYP DST.ADDR DST.PORT.
///
/// Address-level problems are answered with the matching reply code before
/// the error is returned; a bad version byte is not answered.
pub async fn read_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::VersionMismatch {
            expected: SOCKS_VERSION,
            actual: header[0],
        });
    }
    let command = header[1];
    let addr_type = header[3];

    let target = match addr_type {
        atype::IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        atype::IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        atype::DOMAIN_NAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let port_bytes = buf.split_off(len[0] as usize);
            let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

            match String::from_utf8(buf) {
                Ok(domain) if !domain.is_empty() => TargetAddr::Domain(domain, port),
                _ => {
                    write_reply(stream, Reply::GeneralFailure, None).await?;
                    return Err(Error::protocol("invalid domain name in request"));
                }
            }
        }
        other => {
            write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(Error::AddressTypeNotSupported(other));
        }
    };

    Ok(Socks5Request { command, target })
}

/// Encode a reply: VER REP RSV ATYP BND.ADDR BND.PORT.
pub fn encode_reply(reply: Reply, bound: Option<SocketAddr>) -> BytesMut {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(reply as u8);
    buf.put_u8(0x00);
    TargetAddr::Ip(bound).write_to(&mut buf);
    buf
}

/// Send a reply.
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bound: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(reply, bound)).await?;
    stream.flush().await?;
    Ok(())
}

/// Resolve and dial the target within `limit`, trying each address in turn.
///
/// On failure returns the reply code to send back.
pub async fn connect_target(
    target: &TargetAddr,
    limit: Duration,
) -> std::result::Result<TcpStream, Reply> {
    match tokio::time::timeout(limit, dial(target)).await {
        Ok(result) => result,
        Err(_) => Err(Reply::TtlExpired),
    }
}

async fn dial(target: &TargetAddr) -> std::result::Result<TcpStream, Reply> {
    let addrs: Vec<SocketAddr> = match target {
        TargetAddr::Ip(addr) => vec![*addr],
        TargetAddr::Domain(domain, port) => {
            match tokio::net::lookup_host((domain.as_str(), *port)).await {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    tracing::debug!("cannot resolve {}: {}", domain, e);
                    return Err(Reply::HostUnreachable);
                }
            }
        }
    };

    let mut reply = Reply::HostUnreachable;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("connect to {} failed: {}", addr, e);
                reply = Reply::from_connect_error(&e);
            }
        }
    }
    Err(reply)
}

/// Serve one SOCKS5 client end to end.
///
/// Negotiates, dials the CONNECT target, replies, then relays until either
/// side closes. Exactly one request is handled per stream. A client that
/// has not sent its request within `handshake_timeout` gets
/// [`Error::Timeout`].
pub async fn serve<S, F>(
    mut client: S,
    id: &str,
    config: Socks5Config,
    cancel: &CancellationToken,
    on_activity: F,
) -> Result<RelayStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(usize),
{
    let handshake = async {
        negotiate_method(&mut client).await?;
        read_request(&mut client).await
    };
    let request = tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| Error::Timeout(config.handshake_timeout.as_millis() as u64))??;

    if request.command != command::CONNECT {
        write_reply(&mut client, Reply::CommandNotSupported, None).await?;
        return Err(Error::CommandNotSupported(request.command));
    }

    tracing::info!("[{}] SOCKS5 CONNECT {}", id, request.target);

    let target = match connect_target(&request.target, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(reply) => {
            tracing::warn!("[{}] cannot reach {}: {:?}", id, request.target, reply);
            write_reply(&mut client, reply, None).await?;
            return Err(Error::TargetUnreachable {
                target: request.target.to_string(),
                reply: reply as u8,
            });
        }
    };

    let _ = target.set_nodelay(true);
    write_reply(&mut client, Reply::Succeeded, target.local_addr().ok()).await?;

    let stats = relay(client, target, config.relay, cancel, on_activity).await?;
    tracing::debug!(
        "[{}] relay to {} finished ({:?}): {} bytes up, {} bytes down",
        id,
        request.target,
        stats.end,
        stats.uplink,
        stats.downlink
    );
    Ok(stats)
}
