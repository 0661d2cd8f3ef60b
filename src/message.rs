//! The internal message record that flows between pipeline stages.
//!
//! Everything a peer session or chain produces is wrapped in a [`Message`]
//! before it enters a queue: raw BGP messages, session state transitions,
//! status reports, and (downstream of the labeler) labeled updates. The
//! kind/payload split is a tagged variant, not a type hierarchy.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::bgp::Prefix;
use crate::queue::QueueItem;

/// BGP finite-state-machine states, also carried inside state-transition
/// messages so downstream consumers see every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        }
    }
}

/// Classification of one prefix change relative to the session's RIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// Prefix was not previously present.
    New,
    /// Prefix present with identical attributes.
    Dup,
    /// Prefix present with different attributes: implicit withdraw + new.
    DPath,
    /// Explicit withdraw of a present prefix.
    Withdraw,
    /// Spurious withdraw: the prefix was never there.
    Spw,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::New => "NEW",
            Label::Dup => "DUP",
            Label::DPath => "DPATH",
            Label::Withdraw => "WITH",
            Label::Spw => "SPW",
        }
    }
}

/// How a session's updates are treated by the labeler and serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelAction {
    /// Label against the RIB table and emit to the update stream.
    #[default]
    Label,
    /// Maintain the RIB but emit only to the RIB stream.
    RibOnly,
    /// Pass raw messages through untouched.
    NoAction,
}

/// One labeled prefix inside a labeled update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixAction {
    pub prefix: Prefix,
    pub label: Label,
    /// Intern id of the attribute entry backing this prefix, for
    /// diagnostics; withdrawals carry the id of the entry they released.
    pub attr_id: Option<u64>,
}

/// Payload of a labeled update: the raw UPDATE octets plus the per-prefix
/// classification. One UPDATE yields exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledUpdate {
    pub raw: Bytes,
    pub actions: Vec<PrefixAction>,
    pub mode: LabelAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Raw BGP UPDATE, header included.
    Update(Bytes),
    Open(Bytes),
    Notification(Bytes),
    Refresh(Bytes),
    Keepalive,
    StateChange {
        from: SessionState,
        to: SessionState,
    },
    /// Periodic operational report for one session.
    Status {
        prefixes: u64,
        messages: u64,
    },
    Labeled(LabeledUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub session_id: u32,
    /// Per-session sequence, assigned by the producing task.
    pub seq: u32,
    /// Wall-clock receive time.
    pub timestamp: u64,
    pub millis: u16,
    pub kind: MessageKind,
}

impl Message {
    /// Wrap a payload with the current wall-clock time.
    pub fn now(session_id: u32, seq: u32, kind: MessageKind) -> Message {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Message {
            session_id,
            seq,
            timestamp: since_epoch.as_secs(),
            millis: since_epoch.subsec_millis() as u16,
            kind,
        }
    }

    pub fn payload_len(&self) -> usize {
        match &self.kind {
            MessageKind::Update(b)
            | MessageKind::Open(b)
            | MessageKind::Notification(b)
            | MessageKind::Refresh(b) => b.len(),
            MessageKind::Keepalive | MessageKind::StateChange { .. } | MessageKind::Status { .. } => 0,
            MessageKind::Labeled(lm) => lm.raw.len(),
        }
    }
}

impl QueueItem for Message {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<Message>() + self.payload_len()
    }
}
