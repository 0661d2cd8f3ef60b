//! Loop suppression for a mesh of chained monitor instances.
//!
//! Every XML record carries the monitor id of the instance that
//! originated it. The first chain to deliver a given monitor id becomes
//! that id's owner; copies of the same monitor's records arriving over
//! other chains are dropped. Entries idle past their lifetime are swept
//! out so ownership can move after a topology change.

use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::defaults::CACHE_ENTRY_LIFETIME;
use crate::queue::Clock;

#[derive(Debug, Clone)]
struct CacheEntry {
    monitor_id: u32,
    owner_chain: u32,
    seq: u32,
    timestamp: u64,
}

/// Forwarding decision for one received record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Forward,
    Drop,
}

pub struct ChainOwnerCache {
    clock: Arc<dyn Clock>,
    lifetime_secs: u64,
    entries: Mutex<Vec<CacheEntry>>,
}

impl ChainOwnerCache {
    pub fn new(clock: Arc<dyn Clock>) -> ChainOwnerCache {
        Self::with_lifetime(clock, CACHE_ENTRY_LIFETIME)
    }

    pub fn with_lifetime(clock: Arc<dyn Clock>, lifetime_secs: u64) -> ChainOwnerCache {
        ChainOwnerCache {
            clock,
            lifetime_secs,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Apply the ownership policy for a record with `monitor_id`/`seq`
    /// received over `chain_id`, creating or refreshing the entry as a
    /// side effect.
    pub fn decide(&self, monitor_id: u32, seq: u32, chain_id: u32) -> CacheDecision {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.iter_mut().find(|e| e.monitor_id == monitor_id) {
            None => {
                debug!("chain {chain_id}: taking ownership of monitor {monitor_id}");
                entries.push(CacheEntry {
                    monitor_id,
                    owner_chain: chain_id,
                    seq,
                    timestamp: now,
                });
                CacheDecision::Forward
            }
            Some(entry) if entry.owner_chain == chain_id => {
                entry.timestamp = now;
                entry.seq = seq;
                CacheDecision::Forward
            }
            Some(_) => CacheDecision::Drop,
        }
    }

    /// Current owner of a monitor id, if any.
    pub fn owner(&self, monitor_id: u32) -> Option<u32> {
        self.entries
            .lock()
            .expect("cache lock")
            .iter()
            .find(|e| e.monitor_id == monitor_id)
            .map(|e| e.owner_chain)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep out entries idle longer than the configured lifetime.
    /// Returns the number removed.
    pub fn expire(&self) -> usize {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().expect("cache lock");
        let before = entries.len();
        entries.retain(|e| now.saturating_sub(e.timestamp) <= self.lifetime_secs);
        let removed = before - entries.len();
        if removed > 0 {
            info!("chain owner cache: expired {removed} entries");
        }
        removed
    }
}
