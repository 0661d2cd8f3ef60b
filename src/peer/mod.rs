//! Peer session engine: one thread per configured peer, driving the BGP
//! finite-state machine and wrapping everything the peer sends into
//! internal messages on the peer queue.

mod config;
mod fsm;

pub use config::{CapabilityPolicy, CapabilityRule, PeerConfig};
pub use fsm::{check_capabilities, PeerSession, SessionFlags};

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::message::{LabelAction, SessionState};

/// Everything the rest of the pipeline needs to know about a session:
/// identity for the serializer, label mode for the labeler, counters for
/// the status surface. Sessions register here at creation; the entry
/// outlives FSM restarts.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u32,
    pub peer_addr: IpAddr,
    pub peer_port: u16,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub peer_as: u32,
    pub local_as: u32,
    pub peer_bgp_id: u32,
    pub local_bgp_id: u32,
    pub label_action: LabelAction,
    pub four_octet_as: bool,
    pub state: SessionState,
    pub prefix_count: u64,
    pub msg_count: u64,
    pub reset_count: u64,
    pub retry_count: u64,
    pub last_down: u64,
    pub established_at: u64,
}

/// Process-wide directory of sessions, shared read-mostly across the
/// labeler, serializer, and status surface.
pub struct SessionRegistry {
    next_id: AtomicU32,
    inner: Mutex<HashMap<u32, SessionInfo>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry {
            next_id: AtomicU32::new(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a session id for a peer blueprint. Ids are monotonically
    /// assigned and never reused within a process lifetime.
    pub fn register(&self, config: &PeerConfig) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = SessionInfo {
            session_id: id,
            peer_addr: config.peer_addr,
            peer_port: config.peer_port,
            local_addr: config
                .local_addr
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            local_port: 0,
            peer_as: config.peer_as,
            local_as: config.local_as,
            peer_bgp_id: 0,
            local_bgp_id: config.local_bgp_id,
            label_action: config.label_action,
            four_octet_as: false,
            state: SessionState::Idle,
            prefix_count: 0,
            msg_count: 0,
            reset_count: 0,
            retry_count: 0,
            last_down: 0,
            established_at: 0,
        };
        self.inner.lock().expect("registry lock").insert(id, info);
        id
    }

    pub fn get(&self, id: u32) -> Option<SessionInfo> {
        self.inner.lock().expect("registry lock").get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self
            .inner
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|s| s.session_id);
        all
    }

    pub fn label_action(&self, id: u32) -> LabelAction {
        self.get(id).map(|s| s.label_action).unwrap_or_default()
    }

    pub fn four_octet_as(&self, id: u32) -> bool {
        self.get(id).map(|s| s.four_octet_as).unwrap_or(false)
    }

    fn update(&self, id: u32, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(info) = self.inner.lock().expect("registry lock").get_mut(&id) {
            f(info);
        }
    }

    pub fn set_state(&self, id: u32, state: SessionState) {
        self.update(id, |s| {
            if state == SessionState::Established {
                s.established_at = now_secs();
            }
            if s.state == SessionState::Established && state != SessionState::Established {
                s.last_down = now_secs();
                s.reset_count += 1;
            }
            s.state = state;
        });
    }

    pub fn set_negotiated(&self, id: u32, peer_bgp_id: u32, four_octet_as: bool) {
        self.update(id, |s| {
            s.peer_bgp_id = peer_bgp_id;
            s.four_octet_as = four_octet_as;
        });
    }

    pub fn set_prefix_count(&self, id: u32, count: u64) {
        self.update(id, |s| s.prefix_count = count);
    }

    pub fn incr_messages(&self, id: u32) {
        self.update(id, |s| s.msg_count += 1);
    }

    pub fn incr_retries(&self, id: u32) {
        self.update(id, |s| s.retry_count += 1);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_monotonic_ids() {
        let reg = SessionRegistry::new();
        let cfg = PeerConfig::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 65001, 65000);
        let a = reg.register(&cfg);
        let b = reg.register(&cfg);
        assert!(b > a);
        assert_eq!(reg.get(a).unwrap().peer_as, 65001);
    }

    #[test]
    fn established_transition_tracks_resets() {
        let reg = SessionRegistry::new();
        let cfg = PeerConfig::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 65001, 65000);
        let id = reg.register(&cfg);

        reg.set_state(id, SessionState::Established);
        assert!(reg.get(id).unwrap().established_at > 0);
        assert_eq!(reg.get(id).unwrap().reset_count, 0);

        reg.set_state(id, SessionState::Idle);
        let info = reg.get(id).unwrap();
        assert_eq!(info.reset_count, 1);
        assert!(info.last_down > 0);
    }

    #[test]
    fn unknown_session_defaults() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.label_action(99), LabelAction::Label);
        assert!(!reg.four_octet_as(99));
    }
}
