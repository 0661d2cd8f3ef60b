//! BGP-4 wire codec: framing, message types, address families, prefixes,
//! capabilities. Parsing works over `bytes::Buf` with explicit length
//! checks; nothing here touches sockets.

pub mod notification;
pub mod open;
pub mod update;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

pub use notification::NotificationMessage;
pub use open::{Capability, OpenMessage};
pub use update::{PathAttributes, UpdateMessage};

pub const BGP_VERSION: u8 = 4;
pub const MARKER_LEN: usize = 16;
pub const HEADER_LEN: usize = 19;
pub const MAX_MESSAGE_LEN: usize = 4096;

/// 2-byte AS placeholder used in OPEN when the real AS needs four octets.
pub const AS_TRANS: u16 = 23456;

pub const CAP_MULTIPROTOCOL: u8 = 1;
pub const CAP_ROUTE_REFRESH: u8 = 2;
pub const CAP_FOUR_OCTET_AS: u8 = 65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::Keepalive),
            5 => Ok(MessageType::RouteRefresh),
            _ => Err(Error::Protocol("unknown BGP message type")),
        }
    }
}

/// The fixed 19-byte message header: all-ones marker, length, type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u16,
    pub msg_type: MessageType,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol("short BGP header"));
        }
        if buf[..MARKER_LEN].iter().any(|&b| b != 0xff) {
            return Err(Error::Protocol("BGP marker is not all ones"));
        }
        let length = u16::from_be_bytes([buf[16], buf[17]]);
        if (length as usize) < HEADER_LEN || (length as usize) > MAX_MESSAGE_LEN {
            return Err(Error::Protocol("BGP length out of range"));
        }
        let msg_type = MessageType::try_from(buf[18])?;
        Ok(Header { length, msg_type })
    }

    /// `body_len` excludes the header itself.
    pub fn encode(msg_type: MessageType, body_len: usize) -> [u8; HEADER_LEN] {
        let mut hdr = [0xffu8; HEADER_LEN];
        let total = (HEADER_LEN + body_len) as u16;
        hdr[16..18].copy_from_slice(&total.to_be_bytes());
        hdr[18] = msg_type as u8;
        hdr
    }
}

pub fn encode_keepalive() -> [u8; HEADER_LEN] {
    Header::encode(MessageType::Keepalive, 0)
}

/// Route-refresh request body: AFI, reserved, SAFI.
pub fn encode_route_refresh(afi: Afi, safi: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 4);
    buf.put_slice(&Header::encode(MessageType::RouteRefresh, 4));
    buf.put_u16(afi as u16);
    buf.put_u8(0);
    buf.put_u8(safi);
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
}

impl TryFrom<u16> for Afi {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Afi::Ipv4),
            2 => Ok(Afi::Ipv6),
            _ => Err(Error::Protocol("unsupported AFI")),
        }
    }
}

pub const SAFI_UNICAST: u8 = 1;

/// A routing prefix as carried in NLRI: family, bit length, and the
/// minimal number of address octets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub afi: Afi,
    pub bits: u8,
    octets: Vec<u8>,
}

impl Prefix {
    pub fn new(afi: Afi, bits: u8, octets: Vec<u8>) -> Result<Prefix> {
        let max_bits = match afi {
            Afi::Ipv4 => 32,
            Afi::Ipv6 => 128,
        };
        if bits > max_bits || octets.len() != prefix_octet_len(bits) {
            return Err(Error::Protocol("malformed prefix"));
        }
        Ok(Prefix { afi, bits, octets })
    }

    pub fn v4(addr: Ipv4Addr, bits: u8) -> Prefix {
        let octets = addr.octets()[..prefix_octet_len(bits)].to_vec();
        Prefix {
            afi: Afi::Ipv4,
            bits,
            octets,
        }
    }

    /// Key bytes for hashing: AFI, bit length, packed address octets.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(3 + self.octets.len());
        key.extend_from_slice(&(self.afi as u16).to_be_bytes());
        key.push(self.bits);
        key.extend_from_slice(&self.octets);
        key
    }

    pub fn addr(&self) -> IpAddr {
        match self.afi {
            Afi::Ipv4 => {
                let mut o = [0u8; 4];
                o[..self.octets.len()].copy_from_slice(&self.octets);
                IpAddr::V4(Ipv4Addr::from(o))
            }
            Afi::Ipv6 => {
                let mut o = [0u8; 16];
                o[..self.octets.len()].copy_from_slice(&self.octets);
                IpAddr::V6(Ipv6Addr::from(o))
            }
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.bits)
    }
}

fn prefix_octet_len(bits: u8) -> usize {
    (bits as usize + 7) / 8
}

/// Parse a run of `(length, prefix)` NLRI entries covering exactly `buf`.
pub fn parse_nlri(mut buf: &[u8], afi: Afi) -> Result<Vec<Prefix>> {
    let mut prefixes = Vec::new();
    while buf.has_remaining() {
        let bits = buf.get_u8();
        let olen = prefix_octet_len(bits);
        if buf.remaining() < olen {
            return Err(Error::Protocol("truncated NLRI"));
        }
        let mut octets = vec![0u8; olen];
        buf.copy_to_slice(&mut octets);
        prefixes.push(Prefix::new(afi, bits, octets)?);
    }
    Ok(prefixes)
}

pub fn encode_nlri(prefixes: &[Prefix], buf: &mut BytesMut) {
    for p in prefixes {
        buf.put_u8(p.bits);
        buf.put_slice(&p.octets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = Header::encode(MessageType::Update, 4);
        let parsed = Header::parse(&hdr).unwrap();
        assert_eq!(parsed.length, 23);
        assert_eq!(parsed.msg_type, MessageType::Update);
    }

    #[test]
    fn header_rejects_bad_marker() {
        let mut hdr = Header::encode(MessageType::Keepalive, 0);
        hdr[3] = 0;
        assert!(Header::parse(&hdr).is_err());
    }

    #[test]
    fn header_rejects_bad_length() {
        let mut hdr = Header::encode(MessageType::Keepalive, 0);
        hdr[16..18].copy_from_slice(&10u16.to_be_bytes());
        assert!(Header::parse(&hdr).is_err());
    }

    #[test]
    fn route_refresh_frame() {
        let wire = encode_route_refresh(Afi::Ipv4, SAFI_UNICAST);
        let hdr = Header::parse(&wire).unwrap();
        assert_eq!(hdr.msg_type, MessageType::RouteRefresh);
        assert_eq!(hdr.length as usize, wire.len());
        assert_eq!(&wire[HEADER_LEN..], &[0, 1, 0, 1]);
    }

    #[test]
    fn nlri_round_trip() {
        let prefixes = vec![
            Prefix::v4(Ipv4Addr::new(10, 0, 0, 0), 8),
            Prefix::v4(Ipv4Addr::new(192, 168, 4, 0), 22),
            Prefix::v4(Ipv4Addr::new(0, 0, 0, 0), 0),
        ];
        let mut buf = BytesMut::new();
        encode_nlri(&prefixes, &mut buf);
        let parsed = parse_nlri(&buf, Afi::Ipv4).unwrap();
        assert_eq!(parsed, prefixes);
        assert_eq!(parsed[0].to_string(), "10.0.0.0/8");
    }

    #[test]
    fn nlri_rejects_truncated_prefix() {
        assert!(parse_nlri(&[24, 10, 0], Afi::Ipv4).is_err());
    }

    #[test]
    fn prefix_key_bytes_distinguish_length() {
        let a = Prefix::v4(Ipv4Addr::new(10, 0, 0, 0), 8);
        let b = Prefix::v4(Ipv4Addr::new(10, 0, 0, 0), 16);
        assert_ne!(a.key_bytes(), b.key_bytes());
    }
}
