//! Access control lists for subscriber admission.
//!
//! An ACL is an ordered rule list; the first rule whose address matcher
//! covers the connecting address decides, and a list that matches
//! nothing denies. Beyond plain permit/deny, a rule can tag the
//! connection for labeled or rib-only service.

use std::net::IpAddr;

/// What a matched rule does with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Permit,
    Deny,
    /// Permit, with labeling requested.
    Label,
    /// Permit, restricted to the RIB stream.
    RibOnly,
}

impl AclAction {
    pub fn permits(&self) -> bool {
        !matches!(self, AclAction::Deny)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AclAction::Permit => "permit",
            AclAction::Deny => "deny",
            AclAction::Label => "label",
            AclAction::RibOnly => "ribonly",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AclRule {
    pub action: AclAction,
    /// `None` matches any address.
    pub matcher: Option<(IpAddr, u8)>,
}

impl AclRule {
    pub fn any(action: AclAction) -> AclRule {
        AclRule {
            action,
            matcher: None,
        }
    }

    pub fn prefix(action: AclAction, addr: IpAddr, bits: u8) -> AclRule {
        AclRule {
            action,
            matcher: Some((addr, bits)),
        }
    }

    fn matches(&self, addr: IpAddr) -> bool {
        let Some((net, bits)) = self.matcher else {
            return true;
        };
        match (net, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = prefix_mask_v4(bits);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = prefix_mask_v6(bits);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(bits: u8) -> u32 {
    match bits {
        0 => 0,
        b if b >= 32 => u32::MAX,
        b => u32::MAX << (32 - b),
    }
}

fn prefix_mask_v6(bits: u8) -> u128 {
    match bits {
        0 => 0,
        b if b >= 128 => u128::MAX,
        b => u128::MAX << (128 - b),
    }
}

#[derive(Debug, Clone)]
pub struct Acl {
    pub name: String,
    pub rules: Vec<AclRule>,
}

impl Acl {
    pub fn new(name: &str, rules: Vec<AclRule>) -> Acl {
        Acl {
            name: name.to_string(),
            rules,
        }
    }

    /// An ACL that admits everyone, used when a listener names no ACL.
    pub fn permit_all(name: &str) -> Acl {
        Acl::new(name, vec![AclRule::any(AclAction::Permit)])
    }

    /// First match wins; no match denies.
    pub fn evaluate(&self, addr: IpAddr) -> AclAction {
        self.rules
            .iter()
            .find(|rule| rule.matches(addr))
            .map(|rule| rule.action)
            .unwrap_or(AclAction::Deny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn first_match_wins() {
        let acl = Acl::new(
            "clients",
            vec![
                AclRule::prefix(AclAction::Deny, v4(10, 0, 5, 0), 24),
                AclRule::prefix(AclAction::Permit, v4(10, 0, 0, 0), 8),
            ],
        );
        assert_eq!(acl.evaluate(v4(10, 0, 5, 7)), AclAction::Deny);
        assert_eq!(acl.evaluate(v4(10, 1, 0, 1)), AclAction::Permit);
    }

    #[test]
    fn default_is_deny() {
        let acl = Acl::new("empty", vec![]);
        assert_eq!(acl.evaluate(v4(127, 0, 0, 1)), AclAction::Deny);

        let scoped = Acl::new(
            "scoped",
            vec![AclRule::prefix(AclAction::Permit, v4(192, 0, 2, 0), 24)],
        );
        assert_eq!(scoped.evaluate(v4(198, 51, 100, 1)), AclAction::Deny);
    }

    #[test]
    fn any_rule_matches_everything() {
        let acl = Acl::permit_all("open");
        assert_eq!(acl.evaluate(v4(203, 0, 113, 9)), AclAction::Permit);
        assert_eq!(acl.evaluate("2001:db8::1".parse().unwrap()), AclAction::Permit);
    }

    #[test]
    fn family_mismatch_does_not_match() {
        let acl = Acl::new(
            "v4only",
            vec![AclRule::prefix(AclAction::Permit, v4(0, 0, 0, 0), 0)],
        );
        assert_eq!(acl.evaluate("2001:db8::1".parse().unwrap()), AclAction::Deny);
    }

    #[test]
    fn zero_bits_matches_whole_family() {
        let acl = Acl::new(
            "all4",
            vec![AclRule::prefix(AclAction::RibOnly, v4(0, 0, 0, 0), 0)],
        );
        let action = acl.evaluate(v4(8, 8, 8, 8));
        assert_eq!(action, AclAction::RibOnly);
        assert!(action.permits());
    }
}
