//! SOCKS5 wire format (RFC 1928 subset).
//!
//! Only what the tunnel needs: the no-auth greeting reply, the request
//! prefix, the destination address header and success replies. The
//! destination header is the same bytes on the SOCKS side and at the head
//! of the tunnel stream:
//!
//! ```text
//! +------+----------------------+----------+
//! | ATYP | DST.ADDR (variable)  | DST.PORT |
//! +------+----------------------+----------+
//! ```
//!
//! Parsing never consumes anything; callers peek, parse, and only consume
//! once a complete header is available.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Protocol version byte
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method
pub const METHOD_NO_AUTH: u8 = 0x00;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// BIND command (not served)
pub const CMD_BIND: u8 = 0x02;

/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;

/// Reply code: succeeded
pub const REP_SUCCEEDED: u8 = 0x00;

/// VER, CMD and RSV in front of the address header.
pub const REQUEST_PREFIX_LEN: usize = 3;

/// Reply to any greeting: version 5, no authentication.
pub const NEGOTIATION_REPLY: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

/// Request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a TCP connection to the destination
    Connect,
    /// Set up a UDP relay
    UdpAssociate,
}

impl Command {
    /// Decode the CMD byte.
    pub fn from_byte(cmd: u8) -> Result<Self> {
        match cmd {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// Destination host as carried in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4 or IPv6 literal
    Ip(IpAddr),
    /// Domain name, resolved later
    Domain(String),
}

impl TargetAddr {
    /// Host string handed to the resolver.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(ip) => ip.to_string(),
            TargetAddr::Domain(name) => name.clone(),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            TargetAddr::Ip(IpAddr::V4(_)) => 1 + 4,
            TargetAddr::Ip(IpAddr::V6(_)) => 1 + 16,
            TargetAddr::Domain(name) => 1 + 1 + name.len(),
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match self {
            TargetAddr::Ip(IpAddr::V4(ip)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            TargetAddr::Ip(IpAddr::V6(ip)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            TargetAddr::Domain(name) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            TargetAddr::Ip(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(name) => f.write_str(name),
        }
    }
}

/// Parsed destination header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHeader {
    /// Destination host
    pub addr: TargetAddr,
    /// Destination port
    pub port: u16,
    /// Number of bytes the header occupied
    pub len: usize,
}

impl TargetHeader {
    /// Build a header for `addr:port`.
    ///
    /// Domains longer than 255 bytes cannot be expressed and are rejected.
    pub fn new(addr: TargetAddr, port: u16) -> Result<Self> {
        if let TargetAddr::Domain(name) = &addr {
            if name.is_empty() || name.len() > u8::MAX as usize {
                return Err(Error::protocol(format!(
                    "domain length {} out of range",
                    name.len()
                )));
            }
        }
        let len = addr.encoded_len() + 2;
        Ok(Self { addr, port, len })
    }

    /// Wire form of the header.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len);
        self.addr.put(&mut buf);
        buf.put_u16(self.port);
        buf.freeze()
    }
}

impl fmt::Display for TargetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Parse a destination header from the start of `data`.
///
/// Returns `Ok(None)` while more bytes are needed.
///
/// # Errors
///
/// Unknown address types, empty domains and non-UTF-8 domains are protocol
/// violations.
pub fn parse_header(data: &[u8]) -> Result<Option<TargetHeader>> {
    let Some(&atyp) = data.first() else {
        return Ok(None);
    };

    let (addr, addr_end) = match atyp {
        ATYP_IPV4 => {
            if data.len() < 1 + 4 {
                return Ok(None);
            }
            let octets = [data[1], data[2], data[3], data[4]];
            (TargetAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets))), 1 + 4)
        }
        ATYP_IPV6 => {
            if data.len() < 1 + 16 {
                return Ok(None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            (TargetAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets))), 1 + 16)
        }
        ATYP_DOMAIN => {
            let Some(&name_len) = data.get(1) else {
                return Ok(None);
            };
            let name_len = name_len as usize;
            if name_len == 0 {
                return Err(Error::protocol("empty domain name"));
            }
            if data.len() < 2 + name_len {
                return Ok(None);
            }
            let name = std::str::from_utf8(&data[2..2 + name_len])
                .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?;
            (TargetAddr::Domain(name.to_string()), 2 + name_len)
        }
        other => return Err(Error::UnknownAddressType(other)),
    };

    if data.len() < addr_end + 2 {
        return Ok(None);
    }
    let port = u16::from_be_bytes([data[addr_end], data[addr_end + 1]]);

    Ok(Some(TargetHeader {
        addr,
        port,
        len: addr_end + 2,
    }))
}

/// Length of the greeting at the start of `data`, once NMETHODS is known.
pub fn greeting_len(data: &[u8]) -> Option<usize> {
    data.get(1).map(|&nmethods| 2 + nmethods as usize)
}

/// Build a reply carrying `bound` as BND.ADDR and BND.PORT.
pub fn build_reply(rep: u8, bound: SocketAddr) -> Bytes {
    let addr = TargetAddr::Ip(bound.ip());
    let mut buf = BytesMut::with_capacity(3 + addr.encoded_len() + 2);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(rep);
    buf.put_u8(0x00);
    addr.put(&mut buf);
    buf.put_u16(bound.port());
    buf.freeze()
}
