//! SOCKS5 address codec and the local SOCKS5 handshake.
//!
//! The same address encoding (`ATYP | ADDR | PORT`) prefixes every relayed
//! TCP stream and every UDP datagram on the encrypted leg.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// SOCKS protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// Address type: IPv4.
pub const ATYP_IPV4: u8 = 0x01;
/// Address type: domain name.
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6.
pub const ATYP_IPV6: u8 = 0x04;

/// Longest encoded address: type + length + 255-byte domain + port.
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// A relay destination.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    /// Literal IP address and port
    Socket(SocketAddr),
    /// Domain name and port, resolved by whoever dials it
    Domain(String, u16),
}

impl Address {
    /// Parse `host:port`. Returns `None` when the port is missing or invalid
    /// or the host is longer than 255 bytes.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(Address::Socket(addr));
        }

        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.len() > 255 {
            return None;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => Some(Address::Socket(SocketAddr::new(ip, port))),
            Err(_) => Some(Address::Domain(host.to_string(), port)),
        }
    }

    /// Port of the destination.
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Length of the encoded form.
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(host, _) => 1 + 1 + host.len() + 2,
        }
    }

    /// Append the encoded form to `buf`.
    ///
    /// # Errors
    ///
    /// Fails for a domain longer than 255 bytes; `buf` is left untouched.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Address::Domain(host, _) => {
                let len = u8::try_from(host.len()).map_err(|_| {
                    Error::address(format!("domain of {} bytes exceeds 255", host.len()))
                })?;
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Decode an address from the front of `buf`, returning it together with
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let atyp = *buf.first().ok_or_else(|| Error::address("empty address"))?;
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Err(Error::address("IPv4 address too short"));
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Socket(SocketAddr::new(ip.into(), port)), 7))
            }
            ATYP_DOMAIN => {
                let len = usize::from(*buf.get(1).ok_or_else(|| Error::address("domain address too short"))?);
                if buf.len() < 2 + len + 2 {
                    return Err(Error::address("domain address truncated"));
                }
                let host = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| Error::address("domain is not valid UTF-8"))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(host.to_string(), port), 2 + len + 2))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Err(Error::address("IPv6 address too short"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Address::Socket(SocketAddr::new(Ipv6Addr::from(octets).into(), port)),
                    19,
                ))
            }
            other => Err(Error::address(format!("unknown address type 0x{:02x}", other))),
        }
    }

    /// Read one encoded address from a stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let atyp = reader.read_u8().await?;
        let mut buf = vec![atyp];

        let rest = match atyp {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let len = reader.read_u8().await?;
                buf.push(len);
                usize::from(len) + 2
            }
            other => {
                return Err(Error::address(format!("unknown address type 0x{:02x}", other)));
            }
        };

        let start = buf.len();
        buf.resize(start + rest, 0);
        reader.read_exact(&mut buf[start..]).await?;

        Address::decode(&buf).map(|(addr, _)| addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

/// Serve the server side of a SOCKS5 handshake on a local connection.
///
/// Only the no-authentication method is offered. `udp_bind` is the address
/// advertised to UDP ASSOCIATE requests; `None` rejects them.
///
/// # Errors
///
/// Returns [`Error::UdpAssociate`] after replying to a UDP ASSOCIATE
/// request: the caller should hold the control connection open instead of
/// relaying.
pub async fn handshake<S>(stream: &mut S, udp_bind: Option<SocketAddr>) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // === Greeting ===
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::address("not SOCKS5"));
    }
    let mut methods = vec![0u8; usize::from(head[1])];
    stream.read_exact(&mut methods).await?;

    // Reply: no authentication required
    stream.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // === Request ===
    let mut req = [0u8; 3];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(Error::address("not SOCKS5"));
    }

    let target = match Address::read_from(stream).await {
        Ok(addr) => addr,
        Err(e) => {
            reply(stream, REPLY_ADDRESS_NOT_SUPPORTED, None).await?;
            return Err(e);
        }
    };

    match (req[1], udp_bind) {
        (CMD_CONNECT, _) => {
            reply(stream, REPLY_SUCCEEDED, None).await?;
            Ok(target)
        }
        (CMD_UDP_ASSOCIATE, Some(bind)) => {
            reply(stream, REPLY_SUCCEEDED, Some(bind)).await?;
            Err(Error::UdpAssociate)
        }
        (cmd, _) => {
            reply(stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
            Err(Error::address(format!("unsupported SOCKS command 0x{:02x}", cmd)))
        }
    }
}

async fn reply<S: AsyncWrite + Unpin>(
    stream: &mut S,
    code: u8,
    bind: Option<SocketAddr>,
) -> Result<()> {
    let bind = Address::Socket(bind.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))));
    let mut msg = vec![SOCKS_VERSION, code, 0x00];
    bind.write_to(&mut msg)?;
    stream.write_all(&msg).await?;
    Ok(())
}
