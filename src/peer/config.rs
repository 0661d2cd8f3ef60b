//! Peer configuration: the persistent blueprint a session is built from.

use std::net::{IpAddr, Ipv4Addr};

use crate::bgp::Capability;
use crate::message::LabelAction;
use crate::defaults::{CONNECT_RETRY_INTERVAL, DEFAULT_HOLD_TIME};

/// What the peer's advertised capability set must look like for the
/// session to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityPolicy {
    /// Session aborts if the capability is missing.
    Require,
    /// Accepted if present, fine if absent.
    Allow,
    /// Session aborts if the capability is present.
    Refuse,
}

#[derive(Debug, Clone)]
pub struct CapabilityRule {
    pub code: u8,
    /// When set, the rule only matches a capability with this exact
    /// value; `None` matches on code alone.
    pub value: Option<Vec<u8>>,
    pub policy: CapabilityPolicy,
}

impl CapabilityRule {
    pub fn require(code: u8) -> CapabilityRule {
        CapabilityRule {
            code,
            value: None,
            policy: CapabilityPolicy::Require,
        }
    }

    pub fn refuse(code: u8) -> CapabilityRule {
        CapabilityRule {
            code,
            value: None,
            policy: CapabilityPolicy::Refuse,
        }
    }
}

/// Blueprint of one BGP session. Owns at most one live session at a time;
/// the enabled flag suspends the session without discarding the
/// configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub peer_addr: IpAddr,
    pub peer_port: u16,
    pub local_addr: Option<IpAddr>,
    pub peer_as: u32,
    pub local_as: u32,
    pub local_bgp_id: u32,
    pub hold_time: u16,
    /// Ask for 4-byte ASNs; the remote's capability 65 then carries the
    /// real AS value.
    pub four_octet_as: bool,
    /// Requirements checked against the received OPEN.
    pub capability_rules: Vec<CapabilityRule>,
    /// Capabilities we advertise in our OPEN.
    pub announce: Vec<Capability>,
    pub label_action: LabelAction,
    /// Carried for the configuration surface; TCP-MD5 socket options are
    /// not applied.
    pub md5_password: Option<String>,
    pub enabled: bool,
    pub retry_interval_secs: u64,
}

impl PeerConfig {
    pub fn new(peer_addr: IpAddr, peer_as: u32, local_as: u32) -> PeerConfig {
        PeerConfig {
            peer_addr,
            peer_port: 179,
            local_addr: None,
            peer_as,
            local_as,
            local_bgp_id: u32::from(Ipv4Addr::new(127, 0, 0, 1)),
            hold_time: DEFAULT_HOLD_TIME,
            four_octet_as: false,
            capability_rules: Vec::new(),
            announce: Vec::new(),
            label_action: LabelAction::Label,
            md5_password: None,
            enabled: true,
            retry_interval_secs: CONNECT_RETRY_INTERVAL,
        }
    }
}
