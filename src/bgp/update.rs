//! UPDATE message parsing: withdrawn routes, path attributes, NLRI,
//! including the multiprotocol reach/unreach attributes.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

use super::{encode_nlri, parse_nlri, Afi, Header, MessageType, Prefix, HEADER_LEN};

pub const ATTR_ORIGIN: u8 = 1;
pub const ATTR_AS_PATH: u8 = 2;
pub const ATTR_NEXT_HOP: u8 = 3;
pub const ATTR_MED: u8 = 4;
pub const ATTR_LOCAL_PREF: u8 = 5;
pub const ATTR_COMMUNITIES: u8 = 8;
pub const ATTR_MP_REACH_NLRI: u8 = 14;
pub const ATTR_MP_UNREACH_NLRI: u8 = 15;

const FLAG_EXTENDED_LENGTH: u8 = 0x10;

const AS_PATH_SEGMENT_SEQUENCE: u8 = 2;

/// Parsed path attributes plus the canonical byte encoding used as the
/// attribute-table key. The canonical form excludes the MP reach/unreach
/// attributes: they carry per-update NLRI, not shared path properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathAttributes {
    pub origin: Option<u8>,
    pub as_path: Vec<u32>,
    pub next_hop: Option<[u8; 4]>,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub communities: Vec<u32>,
    canonical: Vec<u8>,
}

impl PathAttributes {
    pub fn canonical_bytes(&self) -> &[u8] {
        &self.canonical
    }

    pub fn as_path_string(&self) -> String {
        self.as_path
            .iter()
            .map(|asn| asn.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub announced: Vec<Prefix>,
    pub attrs: PathAttributes,
}

impl UpdateMessage {
    /// Parse an UPDATE body (after the 19-byte header). `four_octet_as`
    /// selects the AS_PATH segment width negotiated on the session.
    pub fn parse(mut buf: &[u8], four_octet_as: bool) -> Result<UpdateMessage> {
        if buf.remaining() < 2 {
            return Err(Error::Protocol("short UPDATE"));
        }
        let withdrawn_len = buf.get_u16() as usize;
        if buf.remaining() < withdrawn_len {
            return Err(Error::Protocol("truncated withdrawn routes"));
        }
        let mut withdrawn = parse_nlri(&buf[..withdrawn_len], Afi::Ipv4)?;
        buf.advance(withdrawn_len);

        if buf.remaining() < 2 {
            return Err(Error::Protocol("short UPDATE attribute section"));
        }
        let attrs_len = buf.get_u16() as usize;
        if buf.remaining() < attrs_len {
            return Err(Error::Protocol("truncated path attributes"));
        }
        let (attrs, mut announced, mp_withdrawn) =
            parse_attributes(&buf[..attrs_len], four_octet_as)?;
        buf.advance(attrs_len);

        // Everything after the attributes is IPv4 unicast NLRI.
        announced.extend(parse_nlri(buf, Afi::Ipv4)?);
        withdrawn.extend(mp_withdrawn);

        Ok(UpdateMessage {
            withdrawn,
            announced,
            attrs,
        })
    }

    /// Encode a complete UPDATE (header included) carrying IPv4 unicast
    /// reachability. Used by the test harness and session replay.
    pub fn encode(
        withdrawn: &[Prefix],
        attr_tlvs: &[(u8, Vec<u8>)],
        announced: &[Prefix],
    ) -> BytesMut {
        let mut wbuf = BytesMut::new();
        encode_nlri(withdrawn, &mut wbuf);
        let mut abuf = BytesMut::new();
        for (type_code, value) in attr_tlvs {
            // Well-known attributes: transitive flag, 1-byte length.
            abuf.put_u8(0x40);
            abuf.put_u8(*type_code);
            abuf.put_u8(value.len() as u8);
            abuf.put_slice(value);
        }
        let mut nbuf = BytesMut::new();
        encode_nlri(announced, &mut nbuf);

        let body_len = 2 + wbuf.len() + 2 + abuf.len() + nbuf.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_slice(&Header::encode(MessageType::Update, body_len));
        buf.put_u16(wbuf.len() as u16);
        buf.put_slice(&wbuf);
        buf.put_u16(abuf.len() as u16);
        buf.put_slice(&abuf);
        buf.put_slice(&nbuf);
        buf
    }

    /// AS_PATH attribute value bytes for an AS sequence, in the width the
    /// session negotiated.
    pub fn as_path_value(asns: &[u32], four_octet_as: bool) -> Vec<u8> {
        let mut value = Vec::new();
        value.push(AS_PATH_SEGMENT_SEQUENCE);
        value.push(asns.len() as u8);
        for &asn in asns {
            if four_octet_as {
                value.extend_from_slice(&asn.to_be_bytes());
            } else {
                value.extend_from_slice(&(asn as u16).to_be_bytes());
            }
        }
        value
    }
}

fn parse_attributes(
    mut buf: &[u8],
    four_octet_as: bool,
) -> Result<(PathAttributes, Vec<Prefix>, Vec<Prefix>)> {
    let mut attrs = PathAttributes::default();
    let mut announced = Vec::new();
    let mut withdrawn = Vec::new();

    while buf.has_remaining() {
        if buf.remaining() < 3 {
            return Err(Error::Protocol("truncated attribute header"));
        }
        let tlv_start = buf;
        let flags = buf.get_u8();
        let type_code = buf.get_u8();
        let len = if flags & FLAG_EXTENDED_LENGTH != 0 {
            if buf.remaining() < 2 {
                return Err(Error::Protocol("truncated attribute length"));
            }
            buf.get_u16() as usize
        } else {
            buf.get_u8() as usize
        };
        if buf.remaining() < len {
            return Err(Error::Protocol("truncated attribute value"));
        }
        let value = &buf[..len];
        buf.advance(len);

        match type_code {
            ATTR_ORIGIN => {
                if value.len() != 1 {
                    return Err(Error::Protocol("bad ORIGIN length"));
                }
                attrs.origin = Some(value[0]);
            }
            ATTR_AS_PATH => {
                attrs.as_path = parse_as_path(value, four_octet_as)?;
            }
            ATTR_NEXT_HOP => {
                let hop: [u8; 4] = value
                    .try_into()
                    .map_err(|_| Error::Protocol("bad NEXT_HOP length"))?;
                attrs.next_hop = Some(hop);
            }
            ATTR_MED => {
                attrs.med = Some(parse_u32_attr(value)?);
            }
            ATTR_LOCAL_PREF => {
                attrs.local_pref = Some(parse_u32_attr(value)?);
            }
            ATTR_COMMUNITIES => {
                if value.len() % 4 != 0 {
                    return Err(Error::Protocol("bad COMMUNITIES length"));
                }
                attrs.communities = value
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
            }
            ATTR_MP_REACH_NLRI => {
                announced.extend(parse_mp_reach(value)?);
            }
            ATTR_MP_UNREACH_NLRI => {
                withdrawn.extend(parse_mp_unreach(value)?);
            }
            _ => {}
        }

        // The canonical key covers the attribute TLV bytes as received,
        // minus the NLRI-bearing multiprotocol attributes.
        if type_code != ATTR_MP_REACH_NLRI && type_code != ATTR_MP_UNREACH_NLRI {
            let tlv_len = tlv_start.len() - buf.len();
            attrs.canonical.extend_from_slice(&tlv_start[..tlv_len]);
        }
    }

    Ok((attrs, announced, withdrawn))
}

fn parse_u32_attr(value: &[u8]) -> Result<u32> {
    let v: [u8; 4] = value
        .try_into()
        .map_err(|_| Error::Protocol("bad 4-byte attribute length"))?;
    Ok(u32::from_be_bytes(v))
}

fn parse_as_path(mut buf: &[u8], four_octet_as: bool) -> Result<Vec<u32>> {
    let mut path = Vec::new();
    let width = if four_octet_as { 4 } else { 2 };
    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(Error::Protocol("truncated AS_PATH segment"));
        }
        let _segment_type = buf.get_u8();
        let count = buf.get_u8() as usize;
        if buf.remaining() < count * width {
            return Err(Error::Protocol("truncated AS_PATH segment"));
        }
        for _ in 0..count {
            let asn = if four_octet_as {
                buf.get_u32()
            } else {
                buf.get_u16() as u32
            };
            path.push(asn);
        }
    }
    Ok(path)
}

fn parse_mp_reach(mut buf: &[u8]) -> Result<Vec<Prefix>> {
    if buf.remaining() < 5 {
        return Err(Error::Protocol("short MP_REACH_NLRI"));
    }
    let afi = Afi::try_from(buf.get_u16())?;
    let _safi = buf.get_u8();
    let nh_len = buf.get_u8() as usize;
    if buf.remaining() < nh_len + 1 {
        return Err(Error::Protocol("truncated MP_REACH next hop"));
    }
    buf.advance(nh_len);
    let _reserved = buf.get_u8();
    parse_nlri(buf, afi)
}

fn parse_mp_unreach(mut buf: &[u8]) -> Result<Vec<Prefix>> {
    if buf.remaining() < 3 {
        return Err(Error::Protocol("short MP_UNREACH_NLRI"));
    }
    let afi = Afi::try_from(buf.get_u16())?;
    let _safi = buf.get_u8();
    parse_nlri(buf, afi)
}
