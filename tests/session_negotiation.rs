//! Capability negotiation against a scripted remote router on loopback.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use routemon::bgp::notification::{ERR_OPEN_MESSAGE, OPEN_ERR_UNSUPPORTED_CAPABILITY};
use routemon::bgp::{
    encode_keepalive, Capability, Header, MessageType, NotificationMessage, OpenMessage,
    CAP_FOUR_OCTET_AS, HEADER_LEN,
};
use routemon::message::{Message, MessageKind, SessionState};
use routemon::peer::{
    CapabilityRule, PeerConfig, PeerSession, SessionFlags, SessionRegistry,
};
use routemon::queue::{Clock, PacingConfig, PacingPolicy, Queue, SystemClock, WaitGroup};

fn peer_queue() -> Arc<Queue<Message>> {
    Queue::with_capacity(
        "peer",
        256,
        PacingPolicy::FfJump,
        PacingConfig::default(),
        Arc::new(SystemClock) as Arc<dyn Clock>,
        WaitGroup::new(),
    )
}

/// Read one framed BGP message from the fake-router side.
fn read_message(stream: &mut TcpStream) -> (MessageType, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).expect("header read");
    let parsed = Header::parse(&header).expect("valid header");
    let mut body = vec![0u8; parsed.length as usize - HEADER_LEN];
    stream.read_exact(&mut body).expect("body read");
    (parsed.msg_type, body)
}

fn spawn_session(
    config: PeerConfig,
    queue: &Arc<Queue<Message>>,
    registry: &Arc<SessionRegistry>,
    shutdown: &Arc<AtomicBool>,
) -> (u32, Arc<SessionFlags>, std::thread::JoinHandle<()>) {
    let session_id = registry.register(&config);
    let flags = SessionFlags::new(true, shutdown.clone());
    let writer = queue.add_writer().unwrap();
    let mut session = PeerSession::new(config, session_id, registry.clone(), writer, flags.clone());
    session.set_tick(Duration::from_millis(100));
    let handle = std::thread::spawn(move || session.run());
    (session_id, flags, handle)
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn missing_required_capability_aborts_with_notification() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let queue = peer_queue();
    let _drain = queue.add_reader().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut config = PeerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 65001, 65000);
    config.peer_port = port;
    config.four_octet_as = true;
    config.capability_rules = vec![CapabilityRule::require(CAP_FOUR_OCTET_AS)];
    config.retry_interval_secs = 30;
    let (session_id, flags, handle) = spawn_session(config, &queue, &registry, &shutdown);

    // Fake router: answer the OPEN with one that omits capability 65.
    let (mut remote, _) = listener.accept().unwrap();
    let (msg_type, _) = read_message(&mut remote);
    assert_eq!(msg_type, MessageType::Open);

    let reply = OpenMessage::new(65001, 180, 0x0a000001, vec![]);
    remote.write_all(&reply.encode()).unwrap();

    // The session must answer with "unsupported capability" and go down.
    let (msg_type, body) = read_message(&mut remote);
    assert_eq!(msg_type, MessageType::Notification);
    let notif = NotificationMessage::parse(&body).unwrap();
    assert_eq!(notif.code, ERR_OPEN_MESSAGE);
    assert_eq!(notif.subcode, OPEN_ERR_UNSUPPORTED_CAPABILITY);

    wait_for("retry counter", || {
        registry.get(session_id).unwrap().retry_count >= 1
    });
    let info = registry.get(session_id).unwrap();
    assert_ne!(info.state, SessionState::Established);
    assert_eq!(info.established_at, 0);

    shutdown.store(true, Ordering::SeqCst);
    flags.enabled.store(false, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn advertised_requirements_reach_established_and_stream_updates() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let queue = peer_queue();
    let mut reader = queue.add_reader().unwrap();
    reader.set_tick(Duration::from_millis(20));
    let registry = Arc::new(SessionRegistry::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut config = PeerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4200000000, 65000);
    config.peer_port = port;
    config.four_octet_as = true;
    config.capability_rules = vec![CapabilityRule::require(CAP_FOUR_OCTET_AS)];
    config.hold_time = 90;
    let (session_id, flags, handle) = spawn_session(config, &queue, &registry, &shutdown);

    let (mut remote, _) = listener.accept().unwrap();
    let (msg_type, _) = read_message(&mut remote);
    assert_eq!(msg_type, MessageType::Open);

    // The remote AS needs four octets: field carries AS_TRANS, the
    // capability carries the real value.
    let reply = OpenMessage::new(
        4200000000,
        180,
        0x0a000002,
        vec![Capability::four_octet_as(4200000000)],
    );
    remote.write_all(&reply.encode()).unwrap();
    // Session sends its KEEPALIVE; answer with ours to confirm.
    let (msg_type, _) = read_message(&mut remote);
    assert_eq!(msg_type, MessageType::Keepalive);
    remote.write_all(&encode_keepalive()).unwrap();

    wait_for("established state", || {
        registry.get(session_id).unwrap().state == SessionState::Established
    });
    let info = registry.get(session_id).unwrap();
    assert!(info.four_octet_as);
    assert_eq!(info.peer_bgp_id, 0x0a000002);

    // Push one UPDATE through and watch it surface as an internal
    // message, hold time negotiated to min(90, 180).
    let update = routemon::bgp::UpdateMessage::encode(
        &[routemon::bgp::Prefix::v4(Ipv4Addr::new(10, 0, 0, 0), 8)],
        &[],
        &[],
    );
    remote.write_all(&update).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got_update = false;
    while !got_update {
        assert!(Instant::now() < deadline, "no update surfaced");
        let Some(batch) = reader.read().unwrap() else {
            break;
        };
        for msg in batch.into_iter().flatten() {
            if let MessageKind::Update(raw) = msg.kind {
                assert_eq!(Header::parse(&raw).unwrap().msg_type, MessageType::Update);
                assert_eq!(msg.session_id, session_id);
                got_update = true;
            }
        }
    }
    assert!(got_update);

    shutdown.store(true, Ordering::SeqCst);
    flags.enabled.store(false, Ordering::SeqCst);
    handle.join().unwrap();
}
