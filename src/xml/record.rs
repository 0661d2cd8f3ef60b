//! XML record framing and construction.
//!
//! Every record on the wire is `DDDDD<payload>`: a 5-byte zero-padded
//! decimal byte count (including the count itself) followed by the XML
//! payload. Chain clients use the same helpers to frame their reads.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::Writer;

use crate::message::{Message, MessageKind};
use crate::peer::SessionInfo;
use crate::{Error, Result};

/// Width of the decimal length prefix.
pub const LEN_PREFIX: usize = 5;

/// Largest record the 5-digit length field can describe.
pub const MAX_RECORD_LEN: usize = 99999;

/// Prepend the length prefix to an XML payload.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let total = payload.len() + LEN_PREFIX;
    if total > MAX_RECORD_LEN {
        return Err(Error::ResourceExhausted("XML record exceeds framing limit"));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(format!("{total:05}").as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Total record length from the first bytes of a stream. The header must
/// hold at least the 5 length digits.
pub fn record_len(header: &[u8]) -> Result<usize> {
    if header.len() < LEN_PREFIX {
        return Err(Error::Protocol("short XML record header"));
    }
    let digits = std::str::from_utf8(&header[..LEN_PREFIX])
        .map_err(|_| Error::Protocol("XML record length is not ASCII"))?;
    let len: usize = digits
        .parse()
        .map_err(|_| Error::Protocol("XML record length is not decimal"))?;
    if len < LEN_PREFIX {
        return Err(Error::Protocol("XML record length below minimum"));
    }
    Ok(len)
}

/// Pull the originating monitor id and sequence out of a framed record.
/// `None` means the record does not carry them (legacy producers).
pub fn parse_id_seq(record: &[u8]) -> Option<(u32, u32)> {
    let payload = record.get(LEN_PREFIX..)?;
    let mut reader = Reader::from_reader(payload);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"MONITOR" {
                    let mut id = None;
                    let mut seq = None;
                    for attr in e.attributes().flatten() {
                        let value = std::str::from_utf8(&attr.value).ok()?.parse().ok();
                        match attr.key.as_ref() {
                            b"id" => id = value,
                            b"seq" => seq = value,
                            _ => {}
                        }
                    }
                    return Some((id?, seq?));
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn kind_tag(kind: &MessageKind) -> &'static str {
    match kind {
        MessageKind::Update(_) | MessageKind::Labeled(_) => "UPDATE",
        MessageKind::Open(_) => "OPEN",
        MessageKind::Notification(_) => "NOTIFICATION",
        MessageKind::Refresh(_) => "REFRESH",
        MessageKind::Keepalive => "KEEPALIVE",
        MessageKind::StateChange { .. } => "STATE_CHANGE",
        MessageKind::Status { .. } => "STATUS",
    }
}

/// Build one framed record from an internal message.
///
/// Carried fields: monitor identity and record sequence, receive time
/// with millisecond precision, source session identity when known, the
/// raw BGP octets in hex, and per-prefix labels for labeled updates.
pub fn build_record(
    monitor_id: u32,
    record_seq: u32,
    msg: &Message,
    session: Option<&SessionInfo>,
) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    let io_err = |_: quick_xml::Error| Error::Internal("XML record write failed");

    let mut root = BytesStart::new("BGP_MESSAGE");
    root.push_attribute(("version", "0.4"));
    root.push_attribute(("type", kind_tag(&msg.kind)));
    writer.write_event(Event::Start(root)).map_err(io_err)?;

    let mut monitor = BytesStart::new("MONITOR");
    monitor.push_attribute(("id", monitor_id.to_string().as_str()));
    monitor.push_attribute(("seq", record_seq.to_string().as_str()));
    writer.write_event(Event::Empty(monitor)).map_err(io_err)?;

    let mut time = BytesStart::new("TIME");
    time.push_attribute(("timestamp", msg.timestamp.to_string().as_str()));
    time.push_attribute(("precision", msg.millis.to_string().as_str()));
    writer.write_event(Event::Empty(time)).map_err(io_err)?;

    if let Some(info) = session {
        let mut source = BytesStart::new("SOURCE");
        source.push_attribute(("as", info.peer_as.to_string().as_str()));
        source.push_attribute(("addr", info.peer_addr.to_string().as_str()));
        source.push_attribute(("port", info.peer_port.to_string().as_str()));
        source.push_attribute(("bgp_id", info.peer_bgp_id.to_string().as_str()));
        writer.write_event(Event::Empty(source)).map_err(io_err)?;

        let mut dest = BytesStart::new("DEST");
        dest.push_attribute(("as", info.local_as.to_string().as_str()));
        dest.push_attribute(("addr", info.local_addr.to_string().as_str()));
        dest.push_attribute(("bgp_id", info.local_bgp_id.to_string().as_str()));
        writer.write_event(Event::Empty(dest)).map_err(io_err)?;
    } else {
        let mut source = BytesStart::new("SOURCE");
        source.push_attribute(("session", msg.session_id.to_string().as_str()));
        writer.write_event(Event::Empty(source)).map_err(io_err)?;
    }

    match &msg.kind {
        MessageKind::Update(raw)
        | MessageKind::Open(raw)
        | MessageKind::Notification(raw)
        | MessageKind::Refresh(raw) => {
            write_octets(&mut writer, raw).map_err(io_err)?;
        }
        MessageKind::Keepalive => {}
        MessageKind::StateChange { from, to } => {
            let mut state = BytesStart::new("STATE");
            state.push_attribute(("from", from.as_str()));
            state.push_attribute(("to", to.as_str()));
            writer.write_event(Event::Empty(state)).map_err(io_err)?;
        }
        MessageKind::Status { prefixes, messages } => {
            let mut status = BytesStart::new("STATUS");
            status.push_attribute(("prefixes", prefixes.to_string().as_str()));
            status.push_attribute(("messages", messages.to_string().as_str()));
            writer.write_event(Event::Empty(status)).map_err(io_err)?;
        }
        MessageKind::Labeled(lm) => {
            write_octets(&mut writer, &lm.raw).map_err(io_err)?;
            for action in &lm.actions {
                let mut prefix = BytesStart::new("PREFIX");
                prefix.push_attribute(("label", action.label.as_str()));
                prefix.push_attribute(("afi", (action.prefix.afi as u16).to_string().as_str()));
                writer.write_event(Event::Start(prefix)).map_err(io_err)?;
                writer
                    .write_event(Event::Text(BytesText::new(&action.prefix.to_string())))
                    .map_err(io_err)?;
                writer
                    .write_event(Event::End(BytesEnd::new("PREFIX")))
                    .map_err(io_err)?;
            }
        }
    }

    writer
        .write_event(Event::End(BytesEnd::new("BGP_MESSAGE")))
        .map_err(io_err)?;

    frame(&writer.into_inner())
}

fn write_octets(writer: &mut Writer<Vec<u8>>, raw: &[u8]) -> quick_xml::Result<()> {
    let mut octets = BytesStart::new("OCTETS");
    octets.push_attribute(("length", raw.len().to_string().as_str()));
    writer.write_event(Event::Start(octets))?;
    writer.write_event(Event::Text(BytesText::new(&hex::encode_upper(raw))))?;
    writer.write_event(Event::End(BytesEnd::new("OCTETS")))?;
    Ok(())
}
