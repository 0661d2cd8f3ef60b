//! The XML configuration document.
//!
//! Read once at start-up, written back on an explicit save. Everything in
//! it overrides compile-time defaults: monitor identity, queue pacing
//! parameters, peers with their capability requirements, chains,
//! subscriber listeners, and ACLs.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::reader::Reader;
use quick_xml::Writer;

use crate::acl::{Acl, AclAction, AclRule};
use crate::chain::ChainConfig;
use crate::client::ListenerConfig;
use crate::defaults::MAX_CLIENT_IDS;
use crate::message::LabelAction;
use crate::peer::{CapabilityPolicy, CapabilityRule, PeerConfig};
use crate::queue::PacingConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitor_id: u32,
    pub pacing: PacingConfig,
    pub peers: Vec<PeerConfig>,
    pub chains: Vec<ChainConfig>,
    pub update_listener: ListenerConfig,
    pub rib_listener: ListenerConfig,
    pub acls: Vec<Acl>,
    pub access_password: Option<String>,
    pub enable_password: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            monitor_id: 1,
            pacing: PacingConfig::default(),
            peers: Vec::new(),
            chains: Vec::new(),
            update_listener: ListenerConfig::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 50001),
            rib_listener: ListenerConfig::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 50002),
            acls: Vec::new(),
            access_password: None,
            enable_password: None,
        }
    }
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<MonitorConfig> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::ConfigInvalid(format!("cannot read {}: {err}", path.as_ref().display()))
        })?;
        Self::parse(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let xml = self.to_xml()?;
        std::fs::write(path.as_ref(), xml).map_err(|err| {
            Error::ConfigInvalid(format!("cannot write {}: {err}", path.as_ref().display()))
        })
    }

    /// The ACL a listener names, falling back to permit-all when the
    /// listener names none and deny-by-default when the name is unknown.
    pub fn listener_acl(&self, listener: &ListenerConfig) -> Acl {
        match &listener.acl_name {
            None => Acl::permit_all("default"),
            Some(name) => self
                .acls
                .iter()
                .find(|acl| &acl.name == name)
                .cloned()
                .unwrap_or_else(|| Acl::new(name, Vec::new())),
        }
    }

    pub fn parse(xml: &str) -> Result<MonitorConfig> {
        let mut reader = Reader::from_str(xml);
        let mut config = MonitorConfig::default();
        let mut buf = Vec::new();

        // Containers tracked while descending.
        let mut current_peer: Option<PeerConfig> = None;
        let mut current_acl: Option<Acl> = None;

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|err| Error::ConfigInvalid(format!("XML parse error: {err}")))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let attrs = attr_map(e)?;
                    match e.name().as_ref() {
                        b"monitor" => {
                            config.monitor_id = req_parse(&attrs, "id", "monitor")?;
                        }
                        b"queues" => {
                            apply_pacing(&mut config.pacing, &attrs)?;
                        }
                        b"peer" => {
                            current_peer = Some(parse_peer(&attrs)?);
                            if matches!(event, Event::Empty(_)) {
                                config.peers.push(current_peer.take().expect("peer"));
                            }
                        }
                        b"require" | b"refuse" | b"announce" => {
                            let code: u8 = req_parse(&attrs, "code", "capability")?;
                            let peer = current_peer.as_mut().ok_or_else(|| {
                                Error::ConfigInvalid(
                                    "capability rule outside a peer element".into(),
                                )
                            })?;
                            match e.name().as_ref() {
                                b"require" => peer.capability_rules.push(CapabilityRule {
                                    code,
                                    value: None,
                                    policy: CapabilityPolicy::Require,
                                }),
                                b"refuse" => peer.capability_rules.push(CapabilityRule {
                                    code,
                                    value: None,
                                    policy: CapabilityPolicy::Refuse,
                                }),
                                _ => peer
                                    .announce
                                    .push(crate::bgp::Capability::new(code, Vec::new())),
                            }
                        }
                        b"chain" => {
                            config.chains.push(parse_chain(&attrs)?);
                        }
                        b"listener" => {
                            let stream = attrs
                                .get("stream")
                                .cloned()
                                .unwrap_or_else(|| "update".to_string());
                            let listener = parse_listener(&attrs)?;
                            match stream.as_str() {
                                "update" => config.update_listener = listener,
                                "rib" => config.rib_listener = listener,
                                other => {
                                    return Err(Error::ConfigInvalid(format!(
                                        "unknown listener stream '{other}'"
                                    )))
                                }
                            }
                        }
                        b"acl" => {
                            let name = attrs.get("name").cloned().ok_or_else(|| {
                                Error::ConfigInvalid("acl element without name".into())
                            })?;
                            current_acl = Some(Acl::new(&name, Vec::new()));
                            if matches!(event, Event::Empty(_)) {
                                config.acls.push(current_acl.take().expect("acl"));
                            }
                        }
                        b"rule" => {
                            let acl = current_acl.as_mut().ok_or_else(|| {
                                Error::ConfigInvalid("rule outside an acl element".into())
                            })?;
                            acl.rules.push(parse_rule(&attrs)?);
                        }
                        b"login" => {
                            config.access_password = attrs.get("access").cloned();
                            config.enable_password = attrs.get("enable").cloned();
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => match e.name().as_ref() {
                    b"peer" => {
                        if let Some(peer) = current_peer.take() {
                            config.peers.push(peer);
                        }
                    }
                    b"acl" => {
                        if let Some(acl) = current_acl.take() {
                            config.acls.push(acl);
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(config)
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        let werr = |_: quick_xml::Error| Error::Internal("config serialization failed");

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(werr)?;
        writer
            .write_event(Event::Start(BytesStart::new("routemon")))
            .map_err(werr)?;

        let mut monitor = BytesStart::new("monitor");
        monitor.push_attribute(("id", self.monitor_id.to_string().as_str()));
        writer.write_event(Event::Empty(monitor)).map_err(werr)?;

        let mut queues = BytesStart::new("queues");
        queues.push_attribute(("pacing_on", self.pacing.on_thresh.to_string().as_str()));
        queues.push_attribute(("pacing_off", self.pacing.off_thresh.to_string().as_str()));
        queues.push_attribute(("alpha", self.pacing.alpha.to_string().as_str()));
        queues.push_attribute((
            "min_writes",
            self.pacing.min_writes_limit.to_string().as_str(),
        ));
        queues.push_attribute(("interval", self.pacing.interval_secs.to_string().as_str()));
        queues.push_attribute((
            "log_interval",
            self.pacing.log_interval_secs.to_string().as_str(),
        ));
        writer.write_event(Event::Empty(queues)).map_err(werr)?;

        writer
            .write_event(Event::Start(BytesStart::new("peers")))
            .map_err(werr)?;
        for peer in &self.peers {
            write_peer(&mut writer, peer).map_err(werr)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("peers")))
            .map_err(werr)?;

        writer
            .write_event(Event::Start(BytesStart::new("chains")))
            .map_err(werr)?;
        for chain in &self.chains {
            let mut e = BytesStart::new("chain");
            e.push_attribute(("addr", chain.addr.as_str()));
            e.push_attribute(("update_port", chain.update_port.to_string().as_str()));
            e.push_attribute(("rib_port", chain.rib_port.to_string().as_str()));
            e.push_attribute(("enabled", bool_str(chain.enabled)));
            e.push_attribute(("retry", chain.retry_interval_secs.to_string().as_str()));
            writer.write_event(Event::Empty(e)).map_err(werr)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("chains")))
            .map_err(werr)?;

        writer
            .write_event(Event::Start(BytesStart::new("listeners")))
            .map_err(werr)?;
        for (stream, listener) in [("update", &self.update_listener), ("rib", &self.rib_listener)]
        {
            let mut e = BytesStart::new("listener");
            e.push_attribute(("stream", stream));
            e.push_attribute(("addr", listener.addr.to_string().as_str()));
            e.push_attribute(("port", listener.port.to_string().as_str()));
            e.push_attribute(("limit", listener.max_clients.to_string().as_str()));
            if let Some(acl) = &listener.acl_name {
                e.push_attribute(("acl", acl.as_str()));
            }
            writer.write_event(Event::Empty(e)).map_err(werr)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("listeners")))
            .map_err(werr)?;

        writer
            .write_event(Event::Start(BytesStart::new("acls")))
            .map_err(werr)?;
        for acl in &self.acls {
            let mut e = BytesStart::new("acl");
            e.push_attribute(("name", acl.name.as_str()));
            writer.write_event(Event::Start(e)).map_err(werr)?;
            for rule in &acl.rules {
                let mut r = BytesStart::new("rule");
                r.push_attribute(("action", rule.action.as_str()));
                if let Some((addr, bits)) = rule.matcher {
                    r.push_attribute(("addr", addr.to_string().as_str()));
                    r.push_attribute(("bits", bits.to_string().as_str()));
                }
                writer.write_event(Event::Empty(r)).map_err(werr)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("acl")))
                .map_err(werr)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("acls")))
            .map_err(werr)?;

        if self.access_password.is_some() || self.enable_password.is_some() {
            let mut e = BytesStart::new("login");
            if let Some(p) = &self.access_password {
                e.push_attribute(("access", p.as_str()));
            }
            if let Some(p) = &self.enable_password {
                e.push_attribute(("enable", p.as_str()));
            }
            writer.write_event(Event::Empty(e)).map_err(werr)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("routemon")))
            .map_err(werr)?;

        String::from_utf8(writer.into_inner())
            .map_err(|_| Error::Internal("config serialization produced invalid UTF-8"))
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

fn attr_map(e: &BytesStart) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::ConfigInvalid(format!("bad attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = String::from_utf8_lossy(&attr.value).to_string();
        map.insert(key, value);
    }
    Ok(map)
}

fn req_parse<T: FromStr>(attrs: &HashMap<String, String>, key: &str, element: &str) -> Result<T> {
    let raw = attrs
        .get(key)
        .ok_or_else(|| Error::ConfigInvalid(format!("{element} element missing '{key}'")))?;
    raw.parse()
        .map_err(|_| Error::ConfigInvalid(format!("{element} attribute '{key}': bad value '{raw}'")))
}

fn opt_parse<T: FromStr>(attrs: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
    match attrs.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            Error::ConfigInvalid(format!("attribute '{key}': bad value '{raw}'"))
        }),
    }
}

fn apply_pacing(pacing: &mut PacingConfig, attrs: &HashMap<String, String>) -> Result<()> {
    pacing.on_thresh = opt_parse(attrs, "pacing_on", pacing.on_thresh)?;
    pacing.off_thresh = opt_parse(attrs, "pacing_off", pacing.off_thresh)?;
    pacing.alpha = opt_parse(attrs, "alpha", pacing.alpha)?;
    pacing.min_writes_limit = opt_parse(attrs, "min_writes", pacing.min_writes_limit)?;
    pacing.interval_secs = opt_parse(attrs, "interval", pacing.interval_secs)?;
    pacing.log_interval_secs = opt_parse(attrs, "log_interval", pacing.log_interval_secs)?;
    for (value, name) in [
        (pacing.on_thresh, "pacing_on"),
        (pacing.off_thresh, "pacing_off"),
        (pacing.alpha, "alpha"),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::ConfigInvalid(format!(
                "queue attribute '{name}' must be between 0 and 1"
            )));
        }
    }
    Ok(())
}

fn parse_peer(attrs: &HashMap<String, String>) -> Result<PeerConfig> {
    let addr: IpAddr = req_parse(attrs, "addr", "peer")?;
    let remote_as: u32 = req_parse(attrs, "remote_as", "peer")?;
    let local_as: u32 = req_parse(attrs, "local_as", "peer")?;
    let mut peer = PeerConfig::new(addr, remote_as, local_as);
    peer.peer_port = opt_parse(attrs, "port", peer.peer_port)?;
    peer.hold_time = opt_parse(attrs, "hold_time", peer.hold_time)?;
    peer.four_octet_as = opt_parse(attrs, "four_octet_as", peer.four_octet_as)?;
    peer.enabled = opt_parse(attrs, "enabled", peer.enabled)?;
    peer.retry_interval_secs = opt_parse(attrs, "retry", peer.retry_interval_secs)?;
    peer.md5_password = attrs.get("password").cloned();
    if let Some(raw) = attrs.get("bgp_id") {
        let id: Ipv4Addr = raw.parse().map_err(|_| {
            Error::ConfigInvalid(format!("peer attribute 'bgp_id': bad value '{raw}'"))
        })?;
        peer.local_bgp_id = u32::from(id);
    }
    peer.label_action = match attrs.get("action").map(String::as_str) {
        None | Some("label") => LabelAction::Label,
        Some("ribonly") => LabelAction::RibOnly,
        Some("noaction") => LabelAction::NoAction,
        Some(other) => {
            return Err(Error::ConfigInvalid(format!(
                "peer attribute 'action': bad value '{other}'"
            )))
        }
    };
    Ok(peer)
}

fn write_peer(writer: &mut Writer<Vec<u8>>, peer: &PeerConfig) -> quick_xml::Result<()> {
    let mut e = BytesStart::new("peer");
    e.push_attribute(("addr", peer.peer_addr.to_string().as_str()));
    e.push_attribute(("port", peer.peer_port.to_string().as_str()));
    e.push_attribute(("remote_as", peer.peer_as.to_string().as_str()));
    e.push_attribute(("local_as", peer.local_as.to_string().as_str()));
    e.push_attribute((
        "bgp_id",
        Ipv4Addr::from(peer.local_bgp_id).to_string().as_str(),
    ));
    e.push_attribute(("hold_time", peer.hold_time.to_string().as_str()));
    e.push_attribute(("four_octet_as", bool_str(peer.four_octet_as)));
    e.push_attribute((
        "action",
        match peer.label_action {
            LabelAction::Label => "label",
            LabelAction::RibOnly => "ribonly",
            LabelAction::NoAction => "noaction",
        },
    ));
    if let Some(p) = &peer.md5_password {
        e.push_attribute(("password", p.as_str()));
    }
    e.push_attribute(("enabled", bool_str(peer.enabled)));
    e.push_attribute(("retry", peer.retry_interval_secs.to_string().as_str()));

    let has_children = !peer.capability_rules.is_empty() || !peer.announce.is_empty();
    if !has_children {
        return writer.write_event(Event::Empty(e));
    }
    writer.write_event(Event::Start(e))?;
    for rule in &peer.capability_rules {
        let tag = match rule.policy {
            CapabilityPolicy::Require => "require",
            CapabilityPolicy::Refuse => "refuse",
            CapabilityPolicy::Allow => "allow",
        };
        let mut r = BytesStart::new(tag);
        r.push_attribute(("code", rule.code.to_string().as_str()));
        writer.write_event(Event::Empty(r))?;
    }
    for cap in &peer.announce {
        let mut a = BytesStart::new("announce");
        a.push_attribute(("code", cap.code.to_string().as_str()));
        writer.write_event(Event::Empty(a))?;
    }
    writer.write_event(Event::End(BytesEnd::new("peer")))
}

fn parse_chain(attrs: &HashMap<String, String>) -> Result<ChainConfig> {
    let addr = attrs
        .get("addr")
        .cloned()
        .ok_or_else(|| Error::ConfigInvalid("chain element missing 'addr'".into()))?;
    let update_port: u16 = req_parse(attrs, "update_port", "chain")?;
    let rib_port: u16 = req_parse(attrs, "rib_port", "chain")?;
    let mut chain = ChainConfig::new(&addr, update_port, rib_port);
    chain.enabled = opt_parse(attrs, "enabled", chain.enabled)?;
    chain.retry_interval_secs = opt_parse(attrs, "retry", chain.retry_interval_secs)?;
    Ok(chain)
}

fn parse_listener(attrs: &HashMap<String, String>) -> Result<ListenerConfig> {
    let addr: IpAddr = req_parse(attrs, "addr", "listener")?;
    let port: u16 = req_parse(attrs, "port", "listener")?;
    let mut listener = ListenerConfig::new(addr, port);
    listener.max_clients = opt_parse(attrs, "limit", MAX_CLIENT_IDS)?;
    listener.acl_name = attrs.get("acl").cloned();
    Ok(listener)
}

fn parse_rule(attrs: &HashMap<String, String>) -> Result<AclRule> {
    let action = match attrs.get("action").map(String::as_str) {
        Some("permit") => AclAction::Permit,
        Some("deny") => AclAction::Deny,
        Some("label") => AclAction::Label,
        Some("ribonly") => AclAction::RibOnly,
        Some(other) => {
            return Err(Error::ConfigInvalid(format!(
                "rule attribute 'action': bad value '{other}'"
            )))
        }
        None => return Err(Error::ConfigInvalid("rule element missing 'action'".into())),
    };
    match attrs.get("addr") {
        None => Ok(AclRule::any(action)),
        Some(raw) => {
            let addr: IpAddr = raw.parse().map_err(|_| {
                Error::ConfigInvalid(format!("rule attribute 'addr': bad value '{raw}'"))
            })?;
            let bits: u8 = req_parse(attrs, "bits", "rule")?;
            Ok(AclRule::prefix(action, addr, bits))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<routemon>
  <monitor id="42"/>
  <queues pacing_on="0.6" pacing_off="0.3" alpha="0.25" min_writes="2" interval="5"/>
  <peers>
    <peer addr="192.0.2.1" remote_as="65001" local_as="65000" bgp_id="10.0.0.1"
          hold_time="90" four_octet_as="true" action="label" enabled="true" retry="30">
      <require code="65"/>
      <refuse code="128"/>
      <announce code="2"/>
    </peer>
    <peer addr="192.0.2.2" remote_as="65002" local_as="65000" action="ribonly"/>
  </peers>
  <chains>
    <chain addr="198.51.100.7" update_port="50001" rib_port="50002" retry="45"/>
  </chains>
  <listeners>
    <listener stream="update" addr="0.0.0.0" port="50001" limit="500" acl="clients"/>
    <listener stream="rib" addr="0.0.0.0" port="50002" limit="100" acl="clients"/>
  </listeners>
  <acls>
    <acl name="clients">
      <rule action="permit" addr="127.0.0.0" bits="8"/>
      <rule action="deny"/>
    </acl>
  </acls>
  <login access="secret" enable="topsecret"/>
</routemon>
"#;

    #[test]
    fn parse_sample_document() {
        let config = MonitorConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.monitor_id, 42);
        assert_eq!(config.pacing.on_thresh, 0.6);
        assert_eq!(config.pacing.interval_secs, 5);

        assert_eq!(config.peers.len(), 2);
        let peer = &config.peers[0];
        assert_eq!(peer.peer_as, 65001);
        assert!(peer.four_octet_as);
        assert_eq!(peer.hold_time, 90);
        assert_eq!(peer.capability_rules.len(), 2);
        assert_eq!(peer.announce.len(), 1);
        assert_eq!(peer.local_bgp_id, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(config.peers[1].label_action, LabelAction::RibOnly);

        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].retry_interval_secs, 45);

        assert_eq!(config.update_listener.max_clients, 500);
        assert_eq!(config.rib_listener.port, 50002);

        assert_eq!(config.acls.len(), 1);
        assert_eq!(config.acls[0].rules.len(), 2);
        assert_eq!(config.access_password.as_deref(), Some("secret"));
    }

    #[test]
    fn round_trip_preserves_content() {
        let config = MonitorConfig::parse(SAMPLE).unwrap();
        let xml = config.to_xml().unwrap();
        let reparsed = MonitorConfig::parse(&xml).unwrap();
        assert_eq!(reparsed.monitor_id, config.monitor_id);
        assert_eq!(reparsed.peers.len(), config.peers.len());
        assert_eq!(reparsed.peers[0].capability_rules.len(), 2);
        assert_eq!(reparsed.chains.len(), 1);
        assert_eq!(reparsed.acls[0].rules.len(), 2);
        assert_eq!(reparsed.enable_password.as_deref(), Some("topsecret"));
    }

    #[test]
    fn missing_required_attribute_is_config_invalid() {
        let err = MonitorConfig::parse("<routemon><peers><peer addr=\"1.2.3.4\"/></peers></routemon>")
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let err =
            MonitorConfig::parse("<routemon><queues pacing_on=\"1.5\"/></routemon>").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn listener_acl_resolution() {
        let config = MonitorConfig::parse(SAMPLE).unwrap();
        let acl = config.listener_acl(&config.update_listener);
        assert_eq!(acl.name, "clients");
        // Unnamed listener admits everyone.
        let open = ListenerConfig::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1);
        assert!(config
            .listener_acl(&open)
            .evaluate(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
            .permits());
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routemon.xml");
        let config = MonitorConfig::parse(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let loaded = MonitorConfig::load(&path).unwrap();
        assert_eq!(loaded.monitor_id, 42);
    }
}
