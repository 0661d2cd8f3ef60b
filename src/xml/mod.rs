//! XML serializer stage: turns labeled internal messages into
//! length-prefixed XML records and routes them onto the update or RIB
//! stream.

pub mod record;

pub use record::{build_record, frame, parse_id_seq, record_len, LEN_PREFIX};

use std::sync::Arc;

use log::warn;

use crate::message::{LabelAction, Message, MessageKind};
use crate::peer::SessionRegistry;
use crate::queue::{QueueReader, QueueWriter};

pub struct Serializer {
    monitor_id: u32,
    seq: u32,
    registry: Arc<SessionRegistry>,
}

impl Serializer {
    pub fn new(monitor_id: u32, registry: Arc<SessionRegistry>) -> Serializer {
        Serializer {
            monitor_id,
            seq: 0,
            registry,
        }
    }

    /// Serialize one message into a framed record, stamping the monitor
    /// id and the next record sequence.
    pub fn serialize(&mut self, msg: &Message) -> crate::Result<Vec<u8>> {
        self.seq = self.seq.wrapping_add(1);
        let session = self.registry.get(msg.session_id);
        build_record(self.monitor_id, self.seq, msg, session.as_ref())
    }

    /// Drain the label queue until it closes. Records from rib-only
    /// sessions go to the RIB stream; everything else goes to the update
    /// stream.
    pub fn run(
        mut self,
        mut reader: QueueReader<Message>,
        update_writer: QueueWriter<Vec<u8>>,
        rib_writer: QueueWriter<Vec<u8>>,
    ) {
        loop {
            let batch = match reader.read() {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    warn!("serializer: queue read failed: {err}");
                    break;
                }
            };
            for msg in batch.into_iter().flatten() {
                let record = match self.serialize(&msg) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!("serializer: dropping message: {err}");
                        continue;
                    }
                };
                let rib_phase = matches!(
                    &msg.kind,
                    MessageKind::Labeled(lm) if lm.mode == LabelAction::RibOnly
                );
                let outcome = if rib_phase {
                    rib_writer.write(record)
                } else {
                    update_writer.write(record)
                };
                if outcome.is_err() {
                    return;
                }
            }
        }
    }
}
