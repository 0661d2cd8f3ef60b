//! End-to-end through the middle of the pipeline: raw UPDATE messages in
//! the peer queue come out of the serializer as labeled XML records on
//! the right stream.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use routemon::bgp::update::{ATTR_AS_PATH, ATTR_NEXT_HOP, ATTR_ORIGIN};
use routemon::bgp::{Prefix, UpdateMessage};
use routemon::label::Labeler;
use routemon::message::{Message, MessageKind};
use routemon::peer::{PeerConfig, SessionRegistry};
use routemon::queue::{Clock, PacingConfig, PacingPolicy, Queue, SystemClock, WaitGroup};
use routemon::xml::{parse_id_seq, record_len, Serializer, LEN_PREFIX};

fn msg_queue(name: &str) -> Arc<Queue<Message>> {
    Queue::with_capacity(
        name,
        256,
        PacingPolicy::FfJump,
        PacingConfig::default(),
        Arc::new(SystemClock) as Arc<dyn Clock>,
        WaitGroup::new(),
    )
}

fn byte_queue(name: &str) -> Arc<Queue<Vec<u8>>> {
    Queue::with_capacity(
        name,
        256,
        PacingPolicy::FfJump,
        PacingConfig::default(),
        Arc::new(SystemClock) as Arc<dyn Clock>,
        WaitGroup::new(),
    )
}

fn announcement(prefix: &Prefix, as_path: &[u32]) -> Bytes {
    let wire = UpdateMessage::encode(
        &[],
        &[
            (ATTR_ORIGIN, vec![0]),
            (ATTR_AS_PATH, UpdateMessage::as_path_value(as_path, false)),
            (ATTR_NEXT_HOP, vec![192, 0, 2, 1]),
        ],
        &[prefix.clone()],
    );
    Bytes::from(wire.to_vec())
}

fn withdrawal(prefix: &Prefix) -> Bytes {
    let wire = UpdateMessage::encode(&[prefix.clone()], &[], &[]);
    Bytes::from(wire.to_vec())
}

#[test]
fn updates_come_out_as_labeled_records_in_order() {
    let peer_q = msg_queue("peer");
    let label_q = msg_queue("label");
    let xml_u = byte_queue("xml-u");
    let xml_r = byte_queue("xml-r");

    let registry = Arc::new(SessionRegistry::new());
    let peer_cfg = PeerConfig::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 65001, 65000);
    let session_id = registry.register(&peer_cfg);

    // Labeler and serializer stages on their own threads, exactly as the
    // pipeline wires them.
    let labeler = Labeler::new(registry.clone());
    let mut label_in = peer_q.add_reader().unwrap();
    label_in.set_tick(Duration::from_millis(20));
    let label_out = label_q.add_writer().unwrap();
    let labeler_thread = std::thread::spawn(move || labeler.run(label_in, label_out));

    let serializer = Serializer::new(42, registry.clone());
    let mut ser_in = label_q.add_reader().unwrap();
    ser_in.set_tick(Duration::from_millis(20));
    let u_out = xml_u.add_writer().unwrap();
    let r_out = xml_r.add_writer().unwrap();
    let serializer_thread = std::thread::spawn(move || serializer.run(ser_in, u_out, r_out));

    let mut subscriber = xml_u.add_reader().unwrap();
    subscriber.set_tick(Duration::from_millis(20));

    // S1 with an attribute change folded in: NEW, DUP, DPATH, WITH.
    let prefix = Prefix::v4(Ipv4Addr::new(10, 0, 0, 0), 8);
    let ingress = peer_q.add_writer().unwrap();
    let updates = [
        announcement(&prefix, &[1, 2, 3]),
        announcement(&prefix, &[1, 2, 3]),
        announcement(&prefix, &[1, 9]),
        withdrawal(&prefix),
    ];
    for (i, raw) in updates.iter().enumerate() {
        ingress
            .write(Message::now(
                session_id,
                i as u32 + 1,
                MessageKind::Update(raw.clone()),
            ))
            .unwrap();
    }

    let mut labels_seen = Vec::new();
    while labels_seen.len() < 4 {
        let batch = subscriber.read().unwrap().expect("stream ended early");
        for record in batch.into_iter().flatten() {
            assert_eq!(record_len(&record).unwrap(), record.len());
            assert_eq!(parse_id_seq(&record).map(|(id, _)| id), Some(42));
            let text = String::from_utf8(record[LEN_PREFIX..].to_vec()).unwrap();
            for label in ["\"NEW\"", "\"DUP\"", "\"DPATH\"", "\"WITH\""] {
                if text.contains(&format!("label={label}")) {
                    labels_seen.push(label.trim_matches('"').to_string());
                }
            }
            assert!(text.contains("10.0.0.0/8"));
        }
    }
    assert_eq!(labels_seen, vec!["NEW", "DUP", "DPATH", "WITH"]);

    peer_q.close();
    labeler_thread.join().unwrap();
    label_q.close();
    serializer_thread.join().unwrap();
}

#[test]
fn rib_only_sessions_route_to_the_rib_stream() {
    let peer_q = msg_queue("peer");
    let label_q = msg_queue("label");
    let xml_u = byte_queue("xml-u");
    let xml_r = byte_queue("xml-r");

    let registry = Arc::new(SessionRegistry::new());
    let mut peer_cfg = PeerConfig::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)), 65002, 65000);
    peer_cfg.label_action = routemon::message::LabelAction::RibOnly;
    let session_id = registry.register(&peer_cfg);

    let labeler = Labeler::new(registry.clone());
    let mut label_in = peer_q.add_reader().unwrap();
    label_in.set_tick(Duration::from_millis(20));
    let label_out = label_q.add_writer().unwrap();
    let labeler_thread = std::thread::spawn(move || labeler.run(label_in, label_out));

    let serializer = Serializer::new(7, registry.clone());
    let mut ser_in = label_q.add_reader().unwrap();
    ser_in.set_tick(Duration::from_millis(20));
    let u_out = xml_u.add_writer().unwrap();
    let r_out = xml_r.add_writer().unwrap();
    let serializer_thread = std::thread::spawn(move || serializer.run(ser_in, u_out, r_out));

    let mut rib_sub = xml_r.add_reader().unwrap();
    rib_sub.set_tick(Duration::from_millis(20));
    // Subscribe on the update stream too: nothing must arrive there.
    let _update_sub = xml_u.add_reader().unwrap();

    let prefix = Prefix::v4(Ipv4Addr::new(172, 16, 0, 0), 12);
    let ingress = peer_q.add_writer().unwrap();
    ingress
        .write(Message::now(
            session_id,
            1,
            MessageKind::Update(announcement(&prefix, &[65002])),
        ))
        .unwrap();

    let batch = rib_sub.read().unwrap().expect("rib stream ended");
    let record = batch.into_iter().flatten().next().expect("rib record");
    let text = String::from_utf8(record[LEN_PREFIX..].to_vec()).unwrap();
    assert!(text.contains("label=\"NEW\""));
    assert_eq!(xml_u.stats().unwrap().items, 0);

    peer_q.close();
    labeler_thread.join().unwrap();
    label_q.close();
    serializer_thread.join().unwrap();
}
