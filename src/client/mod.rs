//! Client fanout: accepts subscribers and drains an XML queue to each.
//!
//! One acceptor thread per configured listener. Each admitted connection
//! gets its own queue reader and worker thread looping read -> send. A
//! slow client is never disconnected for slowness; its reader simply
//! lags and the queue's pacing policy drops messages for it.

use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::acl::Acl;
use crate::defaults::MAX_CLIENT_IDS;
use crate::queue::Queue;
use crate::Result;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: IpAddr,
    pub port: u16,
    pub max_clients: usize,
    pub acl_name: Option<String>,
}

impl ListenerConfig {
    pub fn new(addr: IpAddr, port: u16) -> ListenerConfig {
        ListenerConfig {
            addr,
            port,
            max_clients: MAX_CLIENT_IDS,
            acl_name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: u64,
    pub addr: SocketAddr,
    pub connected_at: u64,
}

/// Bounded table of connected subscribers, shared between the acceptor
/// and the status surface.
pub struct ClientTable {
    next_id: AtomicU64,
    inner: Mutex<HashMap<u64, ClientInfo>>,
}

impl ClientTable {
    pub fn new() -> Arc<ClientTable> {
        Arc::new(ClientTable {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(HashMap::new()),
        })
    }

    fn add(&self, addr: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = ClientInfo {
            client_id: id,
            addr,
            connected_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        self.inner.lock().expect("client table lock").insert(id, info);
        id
    }

    fn remove(&self, id: u64) {
        self.inner.lock().expect("client table lock").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("client table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ClientInfo> {
        let mut all: Vec<ClientInfo> = self
            .inner
            .lock()
            .expect("client table lock")
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|c| c.client_id);
        all
    }
}

/// Acceptor for one listener. `run` owns the thread until shutdown.
pub struct ClientListener {
    config: ListenerConfig,
    queue: Arc<Queue<Vec<u8>>>,
    acl: Acl,
    table: Arc<ClientTable>,
    shutdown: Arc<AtomicBool>,
    tick: Duration,
}

impl ClientListener {
    pub fn new(
        config: ListenerConfig,
        queue: Arc<Queue<Vec<u8>>>,
        acl: Acl,
        table: Arc<ClientTable>,
        shutdown: Arc<AtomicBool>,
    ) -> ClientListener {
        ClientListener {
            config,
            queue,
            acl,
            table,
            shutdown,
            tick: Duration::from_millis(200),
        }
    }

    /// Bind and accept until shutdown. Denied or over-limit connections
    /// are accepted, logged, and closed immediately.
    pub fn run(self) -> Result<()> {
        let bind = SocketAddr::new(self.config.addr, self.config.port);
        let listener = TcpListener::bind(bind)?;
        self.serve(listener)
    }

    /// Accept loop over an already-bound socket.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let bind = listener.local_addr()?;
        info!(
            "listener on {bind} serving queue {} (acl {})",
            self.queue.name(),
            self.acl.name
        );

        let mut workers = Vec::new();
        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(handle) = self.admit(stream, peer) {
                        workers.push(handle);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(self.tick);
                }
                Err(err) => {
                    warn!("listener {bind}: accept failed: {err}");
                    std::thread::sleep(self.tick);
                }
            }
            workers.retain(|h: &std::thread::JoinHandle<()>| !h.is_finished());
        }
        for handle in workers {
            let _ = handle.join();
        }
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Option<std::thread::JoinHandle<()>> {
        let action = self.acl.evaluate(peer.ip());
        if !action.permits() {
            info!("client {peer}: denied by acl {}", self.acl.name);
            return None;
        }
        if self.table.len() >= self.config.max_clients {
            info!(
                "client {peer}: over listener limit of {}, closing",
                self.config.max_clients
            );
            return None;
        }

        let reader = match self.queue.add_reader() {
            Ok(reader) => reader,
            Err(err) => {
                warn!("client {peer}: no reader slot: {err}");
                return None;
            }
        };
        let id = self.table.add(peer);
        info!("client {peer}: subscribed to {} as {id}", self.queue.name());

        let table = Arc::clone(&self.table);
        let shutdown = Arc::clone(&self.shutdown);
        Some(std::thread::spawn(move || {
            serve_client(id, stream, reader, shutdown);
            table.remove(id);
        }))
    }
}

/// Per-client worker: drain the queue into the socket until either side
/// goes away. Dropping the reader releases every slot it pinned.
fn serve_client(
    id: u64,
    mut stream: TcpStream,
    mut reader: crate::queue::QueueReader<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
) {
    reader.set_tick(Duration::from_millis(200));
    loop {
        if shutdown.load(Ordering::SeqCst) {
            debug!("client {id}: shutdown");
            return;
        }
        let batch = match reader.read() {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                debug!("client {id}: stream ended");
                return;
            }
            Err(err) => {
                warn!("client {id}: queue read failed: {err}");
                return;
            }
        };
        for record in batch.into_iter().flatten() {
            if let Err(err) = stream.write_all(&record) {
                info!("client {id}: write failed ({err}), disconnecting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn client_table_add_remove() {
        let table = ClientTable::new();
        let addr: SocketAddr = (Ipv4Addr::LOCALHOST, 4321).into();
        let a = table.add(addr);
        let b = table.add(addr);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        table.remove(a);
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].client_id, b);
    }
}
