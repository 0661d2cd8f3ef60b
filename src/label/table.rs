//! Per-session prefix and attribute tables.
//!
//! Both are chained-bucket hash tables keyed on raw bytes: the prefix
//! table on the packed prefix key, the attribute table on the canonical
//! path-attribute encoding. Attribute entries are reference counted; the
//! count equals the number of prefix-table entries pointing at the entry,
//! and the entry is evicted when it reaches zero.

use log::debug;

use crate::bgp::{PathAttributes, Prefix};
use crate::defaults::{ATTRIBUTE_TABLE_SIZE, MAX_HASH_COLLISION, PREFIX_TABLE_SIZE};

/// One-shot byte mixer used by both tables.
fn mix_hash(key: &[u8]) -> u64 {
    let mut h: u64 = 0;
    for &b in key {
        h = h.wrapping_add(b as u64);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

struct PrefixEntry {
    key: Vec<u8>,
    prefix: Prefix,
    attr_id: u64,
}

/// Mapping (address family, prefix, length) -> attribute reference.
/// A prefix appears at most once.
pub struct PrefixTable {
    buckets: Vec<Vec<PrefixEntry>>,
    len: usize,
}

impl PrefixTable {
    pub fn new() -> PrefixTable {
        Self::with_buckets(PREFIX_TABLE_SIZE.next_power_of_two())
    }

    fn with_buckets(n: usize) -> PrefixTable {
        let mut buckets = Vec::with_capacity(n);
        buckets.resize_with(n, Vec::new);
        PrefixTable { buckets, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket(&self, key: &[u8]) -> usize {
        (mix_hash(key) % self.buckets.len() as u64) as usize
    }

    pub fn get(&self, prefix: &Prefix) -> Option<u64> {
        let key = prefix.key_bytes();
        let b = self.bucket(&key);
        self.buckets[b]
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.attr_id)
    }

    /// Insert or overwrite the attribute reference for `prefix`. Returns
    /// the previous reference if the prefix was present.
    pub fn insert(&mut self, prefix: &Prefix, attr_id: u64) -> Option<u64> {
        let key = prefix.key_bytes();
        let b = self.bucket(&key);
        if let Some(entry) = self.buckets[b].iter_mut().find(|e| e.key == key) {
            return Some(std::mem::replace(&mut entry.attr_id, attr_id));
        }
        self.buckets[b].push(PrefixEntry {
            key,
            prefix: prefix.clone(),
            attr_id,
        });
        self.len += 1;
        if self.buckets[b].len() > MAX_HASH_COLLISION {
            self.resize();
        }
        None
    }

    /// Remove `prefix`, returning the attribute reference it held.
    pub fn remove(&mut self, prefix: &Prefix) -> Option<u64> {
        let key = prefix.key_bytes();
        let b = self.bucket(&key);
        let pos = self.buckets[b].iter().position(|e| e.key == key)?;
        let entry = self.buckets[b].swap_remove(pos);
        self.len -= 1;
        Some(entry.attr_id)
    }

    /// Drop every entry, handing each held attribute reference to `f` so
    /// the caller can release the attribute table in lockstep.
    pub fn flush(&mut self, mut f: impl FnMut(u64)) {
        for bucket in &mut self.buckets {
            for entry in bucket.drain(..) {
                f(entry.attr_id);
            }
        }
        self.len = 0;
    }

    /// Snapshot of (prefix, attribute reference) pairs, for the status
    /// surface and tests.
    pub fn entries(&self) -> Vec<(Prefix, u64)> {
        self.buckets
            .iter()
            .flatten()
            .map(|e| (e.prefix.clone(), e.attr_id))
            .collect()
    }

    fn resize(&mut self) {
        let next = PrefixTable::with_buckets(self.buckets.len() * 2);
        debug!(
            "prefix table resize: {} -> {} buckets, {} entries",
            self.buckets.len(),
            next.buckets.len(),
            self.len
        );
        let old = std::mem::replace(self, next);
        for bucket in old.buckets {
            for entry in bucket {
                let b = self.bucket(&entry.key);
                self.buckets[b].push(entry);
                self.len += 1;
            }
        }
    }
}

impl Default for PrefixTable {
    fn default() -> Self {
        Self::new()
    }
}

struct AttrEntry {
    canonical: Vec<u8>,
    attrs: PathAttributes,
    refcount: u32,
}

/// Interning table mapping a canonical attribute byte encoding to one
/// reference-counted entry shared by every prefix carrying the same
/// attributes.
pub struct AttrTable {
    buckets: Vec<Vec<u64>>,
    arena: Vec<Option<AttrEntry>>,
    free: Vec<u64>,
    len: usize,
}

impl AttrTable {
    pub fn new() -> AttrTable {
        Self::with_buckets(ATTRIBUTE_TABLE_SIZE.next_power_of_two())
    }

    fn with_buckets(n: usize) -> AttrTable {
        let mut buckets = Vec::with_capacity(n);
        buckets.resize_with(n, Vec::new);
        AttrTable {
            buckets,
            arena: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket(&self, key: &[u8]) -> usize {
        (mix_hash(key) % self.buckets.len() as u64) as usize
    }

    fn entry(&self, id: u64) -> Option<&AttrEntry> {
        self.arena.get(id as usize).and_then(|e| e.as_ref())
    }

    pub fn attrs(&self, id: u64) -> Option<&PathAttributes> {
        self.entry(id).map(|e| &e.attrs)
    }

    pub fn refcount(&self, id: u64) -> u32 {
        self.entry(id).map(|e| e.refcount).unwrap_or(0)
    }

    /// Whether `id` currently holds exactly the canonical bytes `key`.
    pub fn matches(&self, id: u64, key: &[u8]) -> bool {
        self.entry(id).map(|e| e.canonical == key).unwrap_or(false)
    }

    /// Take one reference on the entry for `attrs`, creating it if absent.
    pub fn intern(&mut self, attrs: &PathAttributes) -> u64 {
        let key = attrs.canonical_bytes();
        let b = self.bucket(key);
        if let Some(&id) = self.buckets[b]
            .iter()
            .find(|&&id| self.matches(id, key))
        {
            let entry = self.arena[id as usize].as_mut().expect("live attr entry");
            entry.refcount += 1;
            return id;
        }

        let entry = AttrEntry {
            canonical: key.to_vec(),
            attrs: attrs.clone(),
            refcount: 1,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id as usize] = Some(entry);
                id
            }
            None => {
                self.arena.push(Some(entry));
                (self.arena.len() - 1) as u64
            }
        };
        self.buckets[b].push(id);
        self.len += 1;
        if self.buckets[b].len() > MAX_HASH_COLLISION {
            self.resize();
        }
        id
    }

    /// Drop one reference; the entry is evicted when the count reaches
    /// zero. Returns true on eviction.
    pub fn release(&mut self, id: u64) -> bool {
        let Some(entry) = self.arena.get_mut(id as usize).and_then(|e| e.as_mut()) else {
            return false;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return false;
        }
        let key = std::mem::take(&mut entry.canonical);
        let b = self.bucket(&key);
        self.buckets[b].retain(|&i| i != id);
        self.arena[id as usize] = None;
        self.free.push(id);
        self.len -= 1;
        true
    }

    fn resize(&mut self) {
        let n = self.buckets.len() * 2;
        debug!("attribute table resize: {} -> {n} buckets", self.buckets.len());
        let mut buckets = Vec::with_capacity(n);
        buckets.resize_with(n, Vec::new);
        let old = std::mem::replace(&mut self.buckets, buckets);
        for id in old.into_iter().flatten() {
            let key_bucket = {
                let entry = self.arena[id as usize].as_ref().expect("live attr entry");
                (mix_hash(&entry.canonical) % n as u64) as usize
            };
            self.buckets[key_bucket].push(id);
        }
    }
}

impl Default for AttrTable {
    fn default() -> Self {
        Self::new()
    }
}
