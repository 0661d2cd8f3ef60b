//! Chain client: TCP connections to upstream monitor instances.
//!
//! A chain is a quasi-peer that emits already-serialized XML records on
//! two streams, one for updates and one for RIB snapshots. Each stream
//! runs on its own thread with the same read/retry shape; the stream kind
//! selects only the port and the destination queue. Records pass through
//! the owner cache so the same monitor's output arriving over several
//! chains is delivered exactly once.

pub mod cache;

pub use cache::{CacheDecision, ChainOwnerCache};

use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::defaults::{CONNECT_RETRY_INTERVAL, THREAD_CHECK_INTERVAL};
use crate::peer::SessionFlags;
use crate::queue::QueueWriter;
use crate::xml::{parse_id_seq, record_len, LEN_PREFIX};
use crate::{Error, Result};

/// Which of the chain's two streams a thread is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Update,
    Rib,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Update => "update",
            StreamKind::Rib => "rib",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub addr: String,
    pub update_port: u16,
    pub rib_port: u16,
    pub enabled: bool,
    pub retry_interval_secs: u64,
}

impl ChainConfig {
    pub fn new(addr: &str, update_port: u16, rib_port: u16) -> ChainConfig {
        ChainConfig {
            addr: addr.to_string(),
            update_port,
            rib_port,
            enabled: true,
            retry_interval_secs: CONNECT_RETRY_INTERVAL,
        }
    }

    fn port(&self, kind: StreamKind) -> u16 {
        match kind {
            StreamKind::Update => self.update_port,
            StreamKind::Rib => self.rib_port,
        }
    }
}

/// Operational counters for one chain stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub retry_count: AtomicU64,
    pub reset_count: AtomicU64,
    pub received: AtomicU64,
    pub connected_at: AtomicU64,
    pub last_down: AtomicU64,
}

/// One stream of one chain. Owns its socket outright: the socket lives
/// on this thread's stack and is closed exactly once when it goes out of
/// scope.
pub struct ChainStream {
    chain_id: u32,
    config: ChainConfig,
    kind: StreamKind,
    writer: QueueWriter<Vec<u8>>,
    cache: Arc<ChainOwnerCache>,
    flags: Arc<SessionFlags>,
    stats: Arc<StreamStats>,
    tick: Duration,
}

impl ChainStream {
    pub fn new(
        chain_id: u32,
        config: ChainConfig,
        kind: StreamKind,
        writer: QueueWriter<Vec<u8>>,
        cache: Arc<ChainOwnerCache>,
        flags: Arc<SessionFlags>,
        stats: Arc<StreamStats>,
    ) -> ChainStream {
        ChainStream {
            chain_id,
            config,
            kind,
            writer,
            cache,
            flags,
            stats,
            tick: THREAD_CHECK_INTERVAL,
        }
    }

    pub fn set_tick(&mut self, tick: Duration) {
        self.tick = tick;
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Outer connect/retry loop, one shape for both streams.
    pub fn run(mut self) {
        loop {
            if self.flags.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if !self.flags.enabled.load(Ordering::SeqCst) {
                std::thread::sleep(self.tick.min(Duration::from_millis(200)));
                continue;
            }
            self.flags.reconnect.store(false, Ordering::SeqCst);

            match self.connect_and_read() {
                Ok(()) => {
                    debug!(
                        "chain {} {}: orderly close",
                        self.chain_id,
                        self.kind.as_str()
                    );
                }
                Err(err) => {
                    warn!(
                        "chain {} {} stream to {}:{}: {err}",
                        self.chain_id,
                        self.kind.as_str(),
                        self.config.addr,
                        self.config.port(self.kind)
                    );
                    self.stats.retry_count.fetch_add(1, Ordering::Relaxed);
                    self.stats.last_down.store(Self::now_secs(), Ordering::Relaxed);
                    // A failed stream bounces its sibling too; both sides
                    // of the chain reconnect together.
                    self.flags.reconnect.store(true, Ordering::SeqCst);
                    self.sleep_retry();
                }
            }
        }
    }

    fn sleep_retry(&self) {
        let deadline =
            std::time::Instant::now() + Duration::from_secs(self.config.retry_interval_secs);
        while std::time::Instant::now() < deadline {
            if self.flags.shutdown.load(Ordering::SeqCst)
                || !self.flags.enabled.load(Ordering::SeqCst)
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100).min(self.tick));
        }
    }

    /// One connection lifetime. The socket is dropped (and with it
    /// closed) exactly once, on every exit path out of this function.
    fn connect_and_read(&mut self) -> Result<()> {
        let port = self.config.port(self.kind);
        let addr: SocketAddr = format!("{}:{port}", self.config.addr)
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("bad chain address {}", self.config.addr)))?;

        let mut stream = TcpStream::connect_timeout(&addr, self.tick)?;
        stream.set_read_timeout(Some(self.tick))?;
        info!(
            "chain {} {}: connected to {addr}",
            self.chain_id,
            self.kind.as_str()
        );
        self.stats.connected_at.store(Self::now_secs(), Ordering::Relaxed);
        self.stats.reset_count.fetch_add(1, Ordering::Relaxed);

        let mut buf: Vec<u8> = Vec::new();
        let mut first_read = true;
        loop {
            if self.flags.shutdown.load(Ordering::SeqCst)
                || !self.flags.enabled.load(Ordering::SeqCst)
                || self.flags.reconnect.load(Ordering::SeqCst)
            {
                return Ok(());
            }
            match self.read_record(&mut stream, &mut buf, &mut first_read)? {
                Some(record) => self.deliver(record)?,
                None => {}
            }
        }
    }

    /// Read one length-prefixed record, buffering partial input.
    /// `Ok(None)` is the periodic tick. On the first bytes of a stream a
    /// literal `<xml>` opener is consumed for legacy producers.
    fn read_record(
        &self,
        stream: &mut TcpStream,
        buf: &mut Vec<u8>,
        first_read: &mut bool,
    ) -> Result<Option<Vec<u8>>> {
        loop {
            if *first_read && buf.len() >= LEN_PREFIX {
                if &buf[..LEN_PREFIX] == b"<xml>" {
                    buf.drain(..LEN_PREFIX);
                }
                *first_read = false;
            }
            if !*first_read && buf.len() >= LEN_PREFIX {
                let total = record_len(buf)?;
                if buf.len() >= total {
                    let record: Vec<u8> = buf.drain(..total).collect();
                    return Ok(Some(record));
                }
            }
            let mut tmp = [0u8; 8192];
            match stream.read(&mut tmp) {
                Ok(0) => {
                    return Err(Error::Transport(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "chain closed connection",
                    )))
                }
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Owner-cache policy: forward records from monitors this chain owns,
    /// drop copies owned by other chains, pass unlabeled records through
    /// when non-empty.
    fn deliver(&mut self, record: Vec<u8>) -> Result<()> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match parse_id_seq(&record) {
            None => {
                if record.len() > LEN_PREFIX {
                    self.forward(record)?;
                } else {
                    warn!(
                        "chain {}: unparseable record without payload dropped",
                        self.chain_id
                    );
                }
            }
            Some((monitor_id, seq)) => {
                match self.cache.decide(monitor_id, seq, self.chain_id) {
                    CacheDecision::Forward => self.forward(record)?,
                    CacheDecision::Drop => {
                        debug!(
                            "chain {}: dropped record for monitor {monitor_id} owned elsewhere",
                            self.chain_id
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn forward(&mut self, record: Vec<u8>) -> Result<()> {
        self.writer
            .write(record)
            .map(|_| ())
            .map_err(|_| Error::ResourceExhausted("xml queue closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_kind_selects_port() {
        let cfg = ChainConfig::new("192.0.2.10", 50001, 50002);
        assert_eq!(cfg.port(StreamKind::Update), 50001);
        assert_eq!(cfg.port(StreamKind::Rib), 50002);
    }
}
