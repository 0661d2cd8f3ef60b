//! The labeling engine: classifies each UPDATE against the session's
//! stored RIB state and rewrites the internal message into a labeled one.

mod table;

pub use table::{AttrTable, PrefixTable};

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::bgp::{UpdateMessage, HEADER_LEN};
use crate::message::{Label, LabelAction, LabeledUpdate, Message, MessageKind, PrefixAction, SessionState};
use crate::peer::SessionRegistry;
use crate::queue::{QueueReader, QueueWriter};

/// The per-session RIB state: prefix table plus attribute intern table.
/// Created with the session, flushed on each Established transition
/// (the remote replays its RIB), destroyed when the session goes down.
pub struct SessionTables {
    pub prefixes: PrefixTable,
    pub attrs: AttrTable,
}

impl SessionTables {
    pub fn new() -> SessionTables {
        SessionTables {
            prefixes: PrefixTable::new(),
            attrs: AttrTable::new(),
        }
    }

    pub fn flush(&mut self) {
        let attrs = &mut self.attrs;
        self.prefixes.flush(|id| {
            attrs.release(id);
        });
    }

    /// Classify one parsed UPDATE, mutating the tables. Withdrawals are
    /// processed in wire order, then announcements.
    pub fn classify(&mut self, update: &UpdateMessage) -> Vec<PrefixAction> {
        let mut actions = Vec::with_capacity(update.withdrawn.len() + update.announced.len());

        for prefix in &update.withdrawn {
            match self.prefixes.remove(prefix) {
                Some(old) => {
                    self.attrs.release(old);
                    actions.push(PrefixAction {
                        prefix: prefix.clone(),
                        label: Label::Withdraw,
                        attr_id: Some(old),
                    });
                }
                None => actions.push(PrefixAction {
                    prefix: prefix.clone(),
                    label: Label::Spw,
                    attr_id: None,
                }),
            }
        }

        let canonical = update.attrs.canonical_bytes();
        for prefix in &update.announced {
            match self.prefixes.get(prefix) {
                None => {
                    let id = self.attrs.intern(&update.attrs);
                    self.prefixes.insert(prefix, id);
                    actions.push(PrefixAction {
                        prefix: prefix.clone(),
                        label: Label::New,
                        attr_id: Some(id),
                    });
                }
                Some(old) if self.attrs.matches(old, canonical) => {
                    actions.push(PrefixAction {
                        prefix: prefix.clone(),
                        label: Label::Dup,
                        attr_id: Some(old),
                    });
                }
                Some(old) => {
                    // Implicit withdraw: swap the reference, evicting the
                    // old attribute entry if this was its last holder.
                    let id = self.attrs.intern(&update.attrs);
                    self.prefixes.insert(prefix, id);
                    self.attrs.release(old);
                    actions.push(PrefixAction {
                        prefix: prefix.clone(),
                        label: Label::DPath,
                        attr_id: Some(id),
                    });
                }
            }
        }

        actions
    }
}

impl Default for SessionTables {
    fn default() -> Self {
        Self::new()
    }
}

/// The labeler stage. Owns every session's tables; nothing else touches
/// them.
pub struct Labeler {
    tables: HashMap<u32, SessionTables>,
    registry: Arc<SessionRegistry>,
}

impl Labeler {
    pub fn new(registry: Arc<SessionRegistry>) -> Labeler {
        Labeler {
            tables: HashMap::new(),
            registry,
        }
    }

    /// Transform one internal message. Updates become labeled messages;
    /// state transitions maintain table lifecycle; everything else passes
    /// through untouched.
    pub fn process(&mut self, msg: Message) -> Message {
        match &msg.kind {
            MessageKind::Update(raw) => {
                let mode = self.registry.label_action(msg.session_id);
                if mode == LabelAction::NoAction {
                    return msg;
                }
                let raw = raw.clone();
                let four_octet = self.registry.four_octet_as(msg.session_id);
                let update = match UpdateMessage::parse(&raw[HEADER_LEN..], four_octet) {
                    Ok(u) => u,
                    Err(err) => {
                        warn!(
                            "labeler: unparseable update on session {}: {err}",
                            msg.session_id
                        );
                        return msg;
                    }
                };
                let tables = self.tables.entry(msg.session_id).or_default();
                let actions = tables.classify(&update);
                self.registry
                    .set_prefix_count(msg.session_id, tables.prefixes.len() as u64);
                Message {
                    kind: MessageKind::Labeled(LabeledUpdate { raw, actions, mode }),
                    ..msg
                }
            }
            MessageKind::StateChange { to, .. } => {
                match to {
                    SessionState::Established => {
                        // The remote will replay its RIB; start clean.
                        if let Some(tables) = self.tables.get_mut(&msg.session_id) {
                            tables.flush();
                        }
                    }
                    SessionState::Idle => {
                        if self.tables.remove(&msg.session_id).is_some() {
                            debug!("labeler: dropped tables for session {}", msg.session_id);
                        }
                        self.registry.set_prefix_count(msg.session_id, 0);
                    }
                    _ => {}
                }
                msg
            }
            _ => msg,
        }
    }

    /// Drain the peer queue into the label queue until the input closes.
    pub fn run(mut self, mut reader: QueueReader<Message>, writer: QueueWriter<Message>) {
        loop {
            let batch = match reader.read() {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    warn!("labeler: queue read failed: {err}");
                    break;
                }
            };
            for msg in batch.into_iter().flatten() {
                let out = self.process(msg);
                if writer.write(out).is_err() {
                    return;
                }
            }
        }
    }
}
