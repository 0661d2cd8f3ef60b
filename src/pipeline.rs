//! Pipeline wiring: owns the four named queues, the chain-owner cache,
//! and every long-lived task, with an explicit start/stop lifecycle.
//!
//! Start order is queues, labeler, serializer, listeners, chains, peers.
//! Shutdown walks the pipeline from ingest to egress: peers first, then
//! each queue is closed and its consumer joined once the upstream stages
//! have drained into it, components destroyed leaves-first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::chain::{ChainOwnerCache, ChainStream, StreamKind, StreamStats};
use crate::client::{ClientListener, ClientTable};
use crate::config::MonitorConfig;
use crate::defaults::{
    CACHE_EXPIRATION_INTERVAL, LABEL_QUEUE_NAME, PEER_QUEUE_NAME, XML_R_QUEUE_NAME,
    XML_U_QUEUE_NAME,
};
use crate::label::Labeler;
use crate::message::{Message, MessageKind, SessionState};
use crate::peer::{PeerSession, SessionFlags, SessionRegistry};
use crate::queue::{PacingPolicy, Queue, QueueWriter, SystemClock, WaitGroup};
use crate::xml::Serializer;
use crate::Result;

pub struct Pipeline {
    shutdown: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
    cache: Arc<ChainOwnerCache>,
    update_clients: Arc<ClientTable>,
    rib_clients: Arc<ClientTable>,

    peer_queue: Arc<Queue<Message>>,
    label_queue: Arc<Queue<Message>>,
    xml_update_queue: Arc<Queue<Vec<u8>>>,
    xml_rib_queue: Arc<Queue<Vec<u8>>>,

    session_flags: Vec<Arc<SessionFlags>>,
    session_handles: Vec<JoinHandle<()>>,
    chain_handles: Vec<JoinHandle<()>>,
    labeler_handle: Option<JoinHandle<()>>,
    serializer_handle: Option<JoinHandle<()>>,
    listener_handles: Vec<JoinHandle<()>>,
    periodic_handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Bring the whole pipeline up from a configuration document.
    pub fn start(config: MonitorConfig) -> Result<Pipeline> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let clock: Arc<SystemClock> = Arc::new(SystemClock);
        let registry = Arc::new(SessionRegistry::new());
        let cache = Arc::new(ChainOwnerCache::new(clock.clone()));

        let peer_queue = Queue::new(
            PEER_QUEUE_NAME,
            PacingPolicy::FfJump,
            config.pacing.clone(),
            clock.clone(),
            WaitGroup::new(),
        );
        let label_queue = Queue::new(
            LABEL_QUEUE_NAME,
            PacingPolicy::FfJump,
            config.pacing.clone(),
            clock.clone(),
            WaitGroup::new(),
        );
        let xml_update_queue = Queue::new(
            XML_U_QUEUE_NAME,
            PacingPolicy::FfJump,
            config.pacing.clone(),
            clock.clone(),
            WaitGroup::new(),
        );
        let xml_rib_queue = Queue::new(
            XML_R_QUEUE_NAME,
            PacingPolicy::FfJump,
            config.pacing.clone(),
            clock.clone(),
            WaitGroup::new(),
        );

        // Labeler: PeerQueue -> LabelQueue.
        let labeler_handle = {
            let reader = peer_queue.add_reader()?;
            let writer = label_queue.add_writer()?;
            let labeler = Labeler::new(registry.clone());
            std::thread::Builder::new()
                .name("labeler".into())
                .spawn(move || labeler.run(reader, writer))
                .map_err(|_| crate::Error::Internal("spawn failed"))?
        };

        // Serializer: LabelQueue -> XML queues.
        let serializer_handle = {
            let reader = label_queue.add_reader()?;
            let u_writer = xml_update_queue.add_writer()?;
            let r_writer = xml_rib_queue.add_writer()?;
            let serializer = Serializer::new(config.monitor_id, registry.clone());
            std::thread::Builder::new()
                .name("serializer".into())
                .spawn(move || serializer.run(reader, u_writer, r_writer))
                .map_err(|_| crate::Error::Internal("spawn failed"))?
        };

        // Subscriber listeners.
        let update_clients = ClientTable::new();
        let rib_clients = ClientTable::new();
        let mut listener_handles = Vec::new();
        for (listener_cfg, queue, table) in [
            (
                config.update_listener.clone(),
                xml_update_queue.clone(),
                update_clients.clone(),
            ),
            (
                config.rib_listener.clone(),
                xml_rib_queue.clone(),
                rib_clients.clone(),
            ),
        ] {
            let acl = config.listener_acl(&listener_cfg);
            let listener =
                ClientListener::new(listener_cfg, queue, acl, table, shutdown.clone());
            let handle = std::thread::Builder::new()
                .name("listener".into())
                .spawn(move || {
                    if let Err(err) = listener.run() {
                        warn!("listener exited: {err}");
                    }
                })
                .map_err(|_| crate::Error::Internal("spawn failed"))?;
            listener_handles.push(handle);
        }

        // Chains: two stream threads each, sharing one flag block.
        let mut chain_handles = Vec::new();
        for (idx, chain_cfg) in config.chains.iter().enumerate() {
            let chain_id = (idx + 1) as u32;
            let flags = SessionFlags::new(chain_cfg.enabled, shutdown.clone());
            for (kind, queue) in [
                (StreamKind::Update, &xml_update_queue),
                (StreamKind::Rib, &xml_rib_queue),
            ] {
                let stream = ChainStream::new(
                    chain_id,
                    chain_cfg.clone(),
                    kind,
                    queue.add_writer()?,
                    cache.clone(),
                    flags.clone(),
                    Arc::new(StreamStats::default()),
                );
                let handle = std::thread::Builder::new()
                    .name(format!("chain-{chain_id}-{}", kind.as_str()))
                    .spawn(move || stream.run())
                    .map_err(|_| crate::Error::Internal("spawn failed"))?;
                chain_handles.push(handle);
            }
        }

        // Peer sessions, one writer into the peer queue each.
        let mut session_flags = Vec::new();
        let mut session_handles = Vec::new();
        for peer_cfg in &config.peers {
            let session_id = registry.register(peer_cfg);
            let flags = SessionFlags::new(peer_cfg.enabled, shutdown.clone());
            let writer = peer_queue.add_writer()?;
            let session = PeerSession::new(
                peer_cfg.clone(),
                session_id,
                registry.clone(),
                writer,
                flags.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("peer-{session_id}"))
                .spawn(move || session.run())
                .map_err(|_| crate::Error::Internal("spawn failed"))?;
            session_flags.push(flags);
            session_handles.push(handle);
        }

        // Periodic work: cache expiry plus a status report per session.
        let periodic_handle = {
            let cache = cache.clone();
            let registry = registry.clone();
            let writer = peer_queue.add_writer()?;
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("periodic".into())
                .spawn(move || periodic_task(cache, registry, writer, shutdown))
                .map_err(|_| crate::Error::Internal("spawn failed"))?
        };

        info!(
            "pipeline started: monitor id {}, {} peers, {} chains",
            config.monitor_id,
            config.peers.len(),
            config.chains.len()
        );

        Ok(Pipeline {
            shutdown,
            registry,
            cache,
            update_clients,
            rib_clients,
            peer_queue,
            label_queue,
            xml_update_queue,
            xml_rib_queue,
            session_flags,
            session_handles,
            chain_handles,
            labeler_handle: Some(labeler_handle),
            serializer_handle: Some(serializer_handle),
            listener_handles,
            periodic_handle: Some(periodic_handle),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ChainOwnerCache> {
        &self.cache
    }

    pub fn client_tables(&self) -> (&Arc<ClientTable>, &Arc<ClientTable>) {
        (&self.update_clients, &self.rib_clients)
    }

    /// Queue counter snapshots, in pipeline order.
    pub fn queue_stats(&self) -> Vec<(String, crate::queue::QueueStats)> {
        let mut out = Vec::new();
        for name_stats in [
            (self.peer_queue.name(), self.peer_queue.stats()),
            (self.label_queue.name(), self.label_queue.stats()),
            (self.xml_update_queue.name(), self.xml_update_queue.stats()),
            (self.xml_rib_queue.name(), self.xml_rib_queue.stats()),
        ] {
            if let (name, Ok(stats)) = name_stats {
                out.push((name.to_string(), stats));
            }
        }
        out
    }

    /// Block until the shutdown flag is raised, then tear down in order.
    pub fn run_until_shutdown(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
        self.teardown();
    }

    /// Ingest-to-egress teardown: stop producers, close each queue once
    /// its writers are gone, join its consumer, repeat downstream.
    pub fn teardown(mut self) {
        info!("pipeline shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        for flags in &self.session_flags {
            flags.enabled.store(false, Ordering::SeqCst);
        }

        for handle in self.session_handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.periodic_handle.take() {
            let _ = handle.join();
        }
        self.peer_queue.close();
        if let Some(handle) = self.labeler_handle.take() {
            let _ = handle.join();
        }
        self.label_queue.close();
        if let Some(handle) = self.serializer_handle.take() {
            let _ = handle.join();
        }
        for handle in self.chain_handles.drain(..) {
            let _ = handle.join();
        }
        self.xml_update_queue.close();
        self.xml_rib_queue.close();
        for handle in self.listener_handles.drain(..) {
            let _ = handle.join();
        }
        info!("pipeline stopped");
    }
}

/// Cache expiry sweeps plus one status report per session each interval.
fn periodic_task(
    cache: Arc<ChainOwnerCache>,
    registry: Arc<SessionRegistry>,
    writer: QueueWriter<Message>,
    shutdown: Arc<AtomicBool>,
) {
    let interval = Duration::from_secs(CACHE_EXPIRATION_INTERVAL);
    let mut elapsed = Duration::ZERO;
    let step = Duration::from_millis(200);
    let mut seq: u32 = 0;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(step);
        elapsed += step;
        if elapsed < interval {
            continue;
        }
        elapsed = Duration::ZERO;

        cache.expire();
        for session in registry.snapshot() {
            if session.state != SessionState::Established {
                continue;
            }
            seq = seq.wrapping_add(1);
            let msg = Message::now(
                session.session_id,
                seq,
                MessageKind::Status {
                    prefixes: session.prefix_count,
                    messages: session.msg_count,
                },
            );
            if writer.write(msg).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.monitor_id = 7;
        // Ephemeral ports so tests never collide.
        config.update_listener =
            crate::client::ListenerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        config.rib_listener =
            crate::client::ListenerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        config
    }

    #[test]
    fn pipeline_starts_and_stops_cleanly() {
        let pipeline = Pipeline::start(local_config()).unwrap();
        assert_eq!(pipeline.queue_stats().len(), 4);
        let flag = pipeline.shutdown_flag();
        flag.store(true, Ordering::SeqCst);
        pipeline.run_until_shutdown();
    }

    #[test]
    fn queue_stats_report_names() {
        let pipeline = Pipeline::start(local_config()).unwrap();
        let names: Vec<String> = pipeline
            .queue_stats()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec!["PeerQueue", "LabelQueue", "XMLUQueue", "XMLRQueue"]
        );
        pipeline.teardown();
    }
}
