//! The per-session finite-state machine and its driving thread.
//!
//! Each configured peer gets one thread running [`PeerSession::run`]. The
//! thread owns the socket; every blocking read carries a periodic timeout
//! so the enabled/reconnect/shutdown flags are observed. All failures
//! funnel back to Idle with a retry counter and a sleep.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::bgp::{
    encode_keepalive, Capability, Header, MessageType, NotificationMessage, OpenMessage,
    HEADER_LEN,
};
use crate::defaults::THREAD_CHECK_INTERVAL;
use crate::message::{Message, MessageKind, SessionState};
use crate::queue::QueueWriter;
use crate::{Error, Result};

use super::{CapabilityPolicy, CapabilityRule, PeerConfig, SessionRegistry};

/// Control bits shared between a session thread and its owner. `enabled`
/// suspends the session without destroying the configuration;
/// `reconnect` bounces the transport so configuration changes take hold.
pub struct SessionFlags {
    pub enabled: AtomicBool,
    pub reconnect: AtomicBool,
    pub shutdown: Arc<AtomicBool>,
}

impl SessionFlags {
    pub fn new(enabled: bool, shutdown: Arc<AtomicBool>) -> Arc<SessionFlags> {
        Arc::new(SessionFlags {
            enabled: AtomicBool::new(enabled),
            reconnect: AtomicBool::new(false),
            shutdown,
        })
    }

    fn should_run(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst)
    }
}

/// Match the received capability set against the configured rules.
/// A missing REQUIRE or a present REFUSE fails the negotiation with the
/// offending capability code.
pub fn check_capabilities(
    rules: &[CapabilityRule],
    received: &[Capability],
) -> std::result::Result<(), u8> {
    for rule in rules {
        let present = received.iter().any(|cap| {
            cap.code == rule.code
                && rule
                    .value
                    .as_ref()
                    .map(|v| v == &cap.value)
                    .unwrap_or(true)
        });
        match rule.policy {
            CapabilityPolicy::Require if !present => return Err(rule.code),
            CapabilityPolicy::Refuse if present => return Err(rule.code),
            _ => {}
        }
    }
    Ok(())
}

pub struct PeerSession {
    config: PeerConfig,
    session_id: u32,
    registry: Arc<SessionRegistry>,
    writer: QueueWriter<Message>,
    flags: Arc<SessionFlags>,
    seq: u32,
    state: SessionState,
    /// Hold time negotiated on the current connection; 0 disables both
    /// keepalives and hold expiry.
    hold_time: u16,
    four_octet_as: bool,
    tick: Duration,
}

impl PeerSession {
    pub fn new(
        config: PeerConfig,
        session_id: u32,
        registry: Arc<SessionRegistry>,
        writer: QueueWriter<Message>,
        flags: Arc<SessionFlags>,
    ) -> PeerSession {
        PeerSession {
            config,
            session_id,
            registry,
            writer,
            flags,
            seq: 0,
            state: SessionState::Idle,
            hold_time: 0,
            four_octet_as: false,
            tick: THREAD_CHECK_INTERVAL,
        }
    }

    /// Shorten the periodic wake-up; tests drive sessions with small
    /// ticks and retry intervals.
    pub fn set_tick(&mut self, tick: Duration) {
        self.tick = tick;
    }

    fn emit(&mut self, kind: MessageKind) {
        self.seq = self.seq.wrapping_add(1);
        let msg = Message::now(self.session_id, self.seq, kind);
        if self.writer.write(msg).is_err() {
            debug!("session {}: peer queue is closed", self.session_id);
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        info!(
            "session {}: {} -> {}",
            self.session_id,
            self.state.as_str(),
            to.as_str()
        );
        let from = self.state;
        self.state = to;
        self.registry.set_state(self.session_id, to);
        self.emit(MessageKind::StateChange { from, to });
    }

    /// Outer retry loop. Runs until shutdown; a cleared enabled flag
    /// parks the session in Idle without discarding it.
    pub fn run(mut self) {
        loop {
            if self.flags.shutdown.load(Ordering::SeqCst) {
                self.transition(SessionState::Idle);
                return;
            }
            if !self.flags.enabled.load(Ordering::SeqCst) {
                std::thread::sleep(self.tick.min(Duration::from_millis(200)));
                continue;
            }
            self.flags.reconnect.store(false, Ordering::SeqCst);

            match self.connect_and_drive() {
                Ok(()) => {
                    // Orderly teardown (disable, reconnect, shutdown).
                    self.transition(SessionState::Idle);
                }
                Err(err) => {
                    warn!("session {}: {err}", self.session_id);
                    self.transition(SessionState::Idle);
                    self.registry.incr_retries(self.session_id);
                    self.sleep_retry();
                }
            }
        }
    }

    fn sleep_retry(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.retry_interval_secs);
        while Instant::now() < deadline {
            if !self.flags.should_run() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100).min(self.tick));
        }
    }

    /// One full pass: Connect -> OpenSent -> OpenConfirm -> Established.
    fn connect_and_drive(&mut self) -> Result<()> {
        self.transition(SessionState::Connect);
        let addr = SocketAddr::new(self.config.peer_addr, self.config.peer_port);
        let mut stream = match TcpStream::connect_timeout(&addr, self.tick) {
            Ok(s) => s,
            Err(err) => {
                // The transport is not there; wait for the retry timer.
                self.transition(SessionState::Active);
                return Err(err.into());
            }
        };
        stream.set_read_timeout(Some(self.tick))?;
        stream.set_nodelay(true).ok();

        let open = OpenMessage::new(
            self.config.local_as,
            self.config.hold_time,
            self.config.local_bgp_id,
            self.announce_capabilities(),
        );
        stream.write_all(&open.encode())?;
        self.transition(SessionState::OpenSent);

        let mut buf = Vec::new();
        let received = self.await_message(&mut stream, &mut buf)?;
        let (msg_type, raw) = received;
        if msg_type != MessageType::Open {
            return Err(Error::Protocol("expected OPEN"));
        }
        let remote_open = OpenMessage::parse(&raw[HEADER_LEN..])?;
        self.negotiate(&mut stream, &remote_open)?;
        self.emit(MessageKind::Open(raw));

        stream.write_all(&encode_keepalive())?;
        self.transition(SessionState::OpenConfirm);

        let (msg_type, _raw) = self.await_message(&mut stream, &mut buf)?;
        match msg_type {
            MessageType::Keepalive => {
                self.emit(MessageKind::Keepalive);
            }
            MessageType::Notification => {
                return Err(Error::Protocol("NOTIFICATION in OpenConfirm"));
            }
            _ => return Err(Error::Protocol("expected KEEPALIVE in OpenConfirm")),
        }

        self.transition(SessionState::Established);
        self.established_loop(&mut stream, &mut buf)
    }

    fn announce_capabilities(&self) -> Vec<Capability> {
        let mut caps = self.config.announce.clone();
        if self.config.four_octet_as
            && !caps.iter().any(|c| c.code == crate::bgp::CAP_FOUR_OCTET_AS)
        {
            caps.push(Capability::four_octet_as(self.config.local_as));
        }
        caps
    }

    /// Capability and AS negotiation against the received OPEN. On a
    /// requirement failure the peer gets a NOTIFICATION with the
    /// "unsupported capability" subcode before the error propagates.
    fn negotiate(&mut self, stream: &mut TcpStream, open: &OpenMessage) -> Result<()> {
        if let Err(code) = check_capabilities(&self.config.capability_rules, &open.capabilities) {
            let notif = NotificationMessage::unsupported_capability();
            stream.write_all(&notif.encode()).ok();
            return Err(Error::PolicyReject(format!(
                "capability requirement failed on code {code}"
            )));
        }

        self.four_octet_as = self.config.four_octet_as && open.four_octet_as().is_some();
        let remote_as = open.effective_as(self.config.four_octet_as);
        if remote_as != self.config.peer_as {
            let notif = NotificationMessage::new(crate::bgp::notification::ERR_OPEN_MESSAGE, 2);
            stream.write_all(&notif.encode()).ok();
            return Err(Error::Protocol("remote AS does not match configuration"));
        }

        self.hold_time = self.config.hold_time.min(open.hold_time);
        self.registry
            .set_negotiated(self.session_id, open.bgp_id, self.four_octet_as);
        debug!(
            "session {}: negotiated hold {}s, 4-byte ASN {}",
            self.session_id, self.hold_time, self.four_octet_as
        );
        Ok(())
    }

    /// Block until a complete message arrives. Flag changes abort with an
    /// orderly `PolicyReject`-free error so the retry path runs.
    fn await_message(
        &self,
        stream: &mut TcpStream,
        buf: &mut Vec<u8>,
    ) -> Result<(MessageType, Bytes)> {
        loop {
            if !self.flags.should_run() || self.flags.reconnect.load(Ordering::SeqCst) {
                return Err(Error::Protocol("session torn down during handshake"));
            }
            if let Some(frame) = read_frame(stream, buf)? {
                return Ok(frame);
            }
        }
    }

    fn established_loop(&mut self, stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<()> {
        let keepalive_interval = if self.hold_time > 0 {
            Duration::from_secs((self.hold_time / 3).max(1) as u64)
        } else {
            Duration::ZERO
        };
        let mut last_recv = Instant::now();
        let mut last_sent = Instant::now();

        loop {
            if !self.flags.should_run() || self.flags.reconnect.load(Ordering::SeqCst) {
                return Ok(());
            }

            match read_frame(stream, buf)? {
                Some((msg_type, raw)) => {
                    last_recv = Instant::now();
                    self.registry.incr_messages(self.session_id);
                    match msg_type {
                        MessageType::Update => self.emit(MessageKind::Update(raw)),
                        MessageType::Keepalive => self.emit(MessageKind::Keepalive),
                        MessageType::RouteRefresh => self.emit(MessageKind::Refresh(raw)),
                        MessageType::Open => {
                            return Err(Error::Protocol("unexpected OPEN in Established"));
                        }
                        MessageType::Notification => {
                            self.emit(MessageKind::Notification(raw));
                            return Err(Error::Protocol("peer sent NOTIFICATION"));
                        }
                    }
                }
                None => {}
            }

            if self.hold_time > 0 {
                if last_recv.elapsed() > Duration::from_secs(self.hold_time as u64) {
                    let notif = NotificationMessage::new(
                        crate::bgp::notification::ERR_HOLD_TIMER_EXPIRED,
                        0,
                    );
                    stream.write_all(&notif.encode()).ok();
                    return Err(Error::Protocol("hold timer expired"));
                }
                if last_sent.elapsed() >= keepalive_interval {
                    stream.write_all(&encode_keepalive())?;
                    last_sent = Instant::now();
                }
            }
        }
    }
}

/// Pull one framed BGP message out of the stream, buffering partial
/// reads. `Ok(None)` is the periodic tick: the read timed out with no
/// complete message pending.
fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Option<(MessageType, Bytes)>> {
    loop {
        if buf.len() >= HEADER_LEN {
            let header = Header::parse(&buf[..HEADER_LEN])?;
            let total = header.length as usize;
            if buf.len() >= total {
                let raw = Bytes::copy_from_slice(&buf[..total]);
                buf.drain(..total);
                return Ok(Some((header.msg_type, raw)));
            }
        }
        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp) {
            Ok(0) => {
                return Err(Error::Transport(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )))
            }
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        }
    }
}
