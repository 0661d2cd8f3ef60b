//! NOTIFICATION messages and the error codes the daemon actually sends.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

use super::{Header, MessageType, HEADER_LEN};

pub const ERR_MESSAGE_HEADER: u8 = 1;
pub const ERR_OPEN_MESSAGE: u8 = 2;
pub const ERR_UPDATE_MESSAGE: u8 = 3;
pub const ERR_HOLD_TIMER_EXPIRED: u8 = 4;
pub const ERR_FSM: u8 = 5;
pub const ERR_CEASE: u8 = 6;

/// OPEN error subcode for a capability mismatch.
pub const OPEN_ERR_UNSUPPORTED_CAPABILITY: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(code: u8, subcode: u8) -> NotificationMessage {
        NotificationMessage {
            code,
            subcode,
            data: Vec::new(),
        }
    }

    pub fn unsupported_capability() -> NotificationMessage {
        NotificationMessage::new(ERR_OPEN_MESSAGE, OPEN_ERR_UNSUPPORTED_CAPABILITY)
    }

    pub fn parse(mut buf: &[u8]) -> Result<NotificationMessage> {
        if buf.remaining() < 2 {
            return Err(Error::Protocol("short NOTIFICATION"));
        }
        let code = buf.get_u8();
        let subcode = buf.get_u8();
        Ok(NotificationMessage {
            code,
            subcode,
            data: buf.to_vec(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let body_len = 2 + self.data.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_slice(&Header::encode(MessageType::Notification, body_len));
        buf.put_u8(self.code);
        buf.put_u8(self.subcode);
        buf.put_slice(&self.data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_round_trip() {
        let notif = NotificationMessage::unsupported_capability();
        let wire = notif.encode();
        let hdr = Header::parse(&wire).unwrap();
        assert_eq!(hdr.msg_type, MessageType::Notification);
        let parsed = NotificationMessage::parse(&wire[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.code, ERR_OPEN_MESSAGE);
        assert_eq!(parsed.subcode, OPEN_ERR_UNSUPPORTED_CAPABILITY);
    }
}
