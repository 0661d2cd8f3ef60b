//! OPEN message and capability advertisement.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

use super::{Header, MessageType, AS_TRANS, BGP_VERSION, CAP_FOUR_OCTET_AS, HEADER_LEN};

/// Optional-parameter type carrying capabilities.
const PARAM_CAPABILITIES: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub code: u8,
    pub value: Vec<u8>,
}

impl Capability {
    pub fn new(code: u8, value: Vec<u8>) -> Capability {
        Capability { code, value }
    }

    pub fn four_octet_as(asn: u32) -> Capability {
        Capability {
            code: CAP_FOUR_OCTET_AS,
            value: asn.to_be_bytes().to_vec(),
        }
    }

    pub fn multiprotocol(afi: u16, safi: u8) -> Capability {
        let mut value = Vec::with_capacity(4);
        value.extend_from_slice(&afi.to_be_bytes());
        value.push(0);
        value.push(safi);
        Capability {
            code: super::CAP_MULTIPROTOCOL,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    /// The 2-byte AS field; `AS_TRANS` when the real AS needs 4 bytes.
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_id: u32,
    pub capabilities: Vec<Capability>,
}

impl OpenMessage {
    pub fn new(asn: u32, hold_time: u16, bgp_id: u32, capabilities: Vec<Capability>) -> Self {
        let field_asn = if asn <= u16::MAX as u32 {
            asn as u16
        } else {
            AS_TRANS
        };
        OpenMessage {
            version: BGP_VERSION,
            asn: field_asn,
            hold_time,
            bgp_id,
            capabilities,
        }
    }

    /// Parse an OPEN body (the message after the 19-byte header).
    pub fn parse(mut buf: &[u8]) -> Result<OpenMessage> {
        if buf.remaining() < 10 {
            return Err(Error::Protocol("short OPEN"));
        }
        let version = buf.get_u8();
        let asn = buf.get_u16();
        let hold_time = buf.get_u16();
        let bgp_id = buf.get_u32();
        let opt_len = buf.get_u8() as usize;
        if buf.remaining() != opt_len {
            return Err(Error::Protocol("OPEN optional parameter length mismatch"));
        }

        let mut capabilities = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 2 {
                return Err(Error::Protocol("truncated OPEN parameter"));
            }
            let ptype = buf.get_u8();
            let plen = buf.get_u8() as usize;
            if buf.remaining() < plen {
                return Err(Error::Protocol("truncated OPEN parameter"));
            }
            let mut pval = &buf[..plen];
            buf.advance(plen);
            if ptype != PARAM_CAPABILITIES {
                // Unknown optional parameters are skipped, not fatal.
                continue;
            }
            while pval.has_remaining() {
                if pval.remaining() < 2 {
                    return Err(Error::Protocol("truncated capability"));
                }
                let code = pval.get_u8();
                let clen = pval.get_u8() as usize;
                if pval.remaining() < clen {
                    return Err(Error::Protocol("truncated capability"));
                }
                let value = pval[..clen].to_vec();
                pval.advance(clen);
                capabilities.push(Capability { code, value });
            }
        }

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            bgp_id,
            capabilities,
        })
    }

    /// Encode the complete message, header included.
    pub fn encode(&self) -> BytesMut {
        let mut caps = BytesMut::new();
        for cap in &self.capabilities {
            caps.put_u8(cap.code);
            caps.put_u8(cap.value.len() as u8);
            caps.put_slice(&cap.value);
        }
        let opt_len = if caps.is_empty() { 0 } else { caps.len() + 2 };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + 10 + opt_len);
        buf.put_slice(&Header::encode(MessageType::Open, 10 + opt_len));
        buf.put_u8(self.version);
        buf.put_u16(self.asn);
        buf.put_u16(self.hold_time);
        buf.put_u32(self.bgp_id);
        buf.put_u8(opt_len as u8);
        if !caps.is_empty() {
            buf.put_u8(PARAM_CAPABILITIES);
            buf.put_u8(caps.len() as u8);
            buf.put_slice(&caps);
        }
        buf
    }

    pub fn capability(&self, code: u8) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.code == code)
    }

    /// The AS advertised in the 4-byte-ASN capability, when present.
    pub fn four_octet_as(&self) -> Option<u32> {
        let cap = self.capability(CAP_FOUR_OCTET_AS)?;
        let value: [u8; 4] = cap.value.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(value))
    }

    /// The effective remote AS: the capability value when 4-byte ASNs are
    /// in use, the 2-byte field otherwise.
    pub fn effective_as(&self, want_four_octet: bool) -> u32 {
        if want_four_octet {
            if let Some(asn) = self.four_octet_as() {
                return asn;
            }
        }
        self.asn as u32
    }
}
