//! Shared publish/subscribe queues.
//!
//! An item is published once yet read by several independent consumers: a
//! one-to-many queue rather than several separate queues. Each reader sees
//! every item published after it subscribed; an item leaves the ring when
//! the last remaining reader consumes it. Every reader except the last
//! receives a deep copy of the item; the last receives the original.
//!
//! Readers may subscribe to several queues as one atomic group. The group
//! shares a single condition variable, so a reader blocks on the union of
//! its queues and wakes when any of them receives data.

mod pacing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::defaults::{
    MAX_QUEUE_READERS, MAX_QUEUE_WRITERS, QUEUE_ALPHA, QUEUE_LOG_INTERVAL, QUEUE_MAX_ITEMS,
    QUEUE_MIN_WRITES_LIMIT, QUEUE_PACING_INTERVAL, QUEUE_PACING_OFF_THRESHOLD,
    QUEUE_PACING_ON_THRESHOLD, THREAD_CHECK_INTERVAL,
};
use crate::{Error, Result};

/// Values that can live in a queue. `Clone` must produce a deep copy;
/// `size_bytes` feeds the usage counters.
pub trait QueueItem: Clone + Send + 'static {
    fn size_bytes(&self) -> usize;
}

impl QueueItem for Vec<u8> {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

/// Wall-clock seconds source, injected so pacing intervals are testable.
pub trait Clock: Send + Sync + 'static {
    fn now_secs(&self) -> u64;
}

/// The production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock advanced by hand from tests.
pub struct ManualClock(pub AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        ManualClock(AtomicU64::new(start))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Backpressure policy applied when a queue runs hot. A small fixed set;
/// dispatch is a `match`, not a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingPolicy {
    /// Rate-limit writers per interval; on a full queue the slowest reader
    /// jumps to the tail, releasing everything in between.
    FfJump,
    /// Track the position an ideal reader would hold given the write-rate
    /// EWMA; readers stuck at head are advanced to it while over
    /// threshold.
    IdealReader,
    /// Within one slot of capacity, readers stuck at head advance one slot
    /// per write until the backlog drains.
    Backlog,
}

/// Tunables shared by every policy. Defaults come from `defaults`; the
/// configuration document may override them at start-up.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub on_thresh: f64,
    pub off_thresh: f64,
    pub alpha: f64,
    pub min_writes_limit: u64,
    pub interval_secs: u64,
    pub log_interval_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            on_thresh: QUEUE_PACING_ON_THRESHOLD,
            off_thresh: QUEUE_PACING_OFF_THRESHOLD,
            alpha: QUEUE_ALPHA,
            min_writes_limit: QUEUE_MIN_WRITES_LIMIT,
            interval_secs: QUEUE_PACING_INTERVAL,
            log_interval_secs: QUEUE_LOG_INTERVAL,
        }
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// Stored, but the queue was full and one or more laggard readers were
    /// advanced to make room.
    StoredFull,
}

/// One condition variable + mutex shared by every queue in a group. The
/// wait predicate is "at least one queue in the group has unread data for
/// this reader".
pub struct WaitGroup {
    guard: Mutex<()>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(WaitGroup {
            guard: Mutex::new(()),
            cond: Condvar::new(),
        })
    }
}

struct Slot<T> {
    /// Number of distinct readers that have not yet consumed this slot.
    count: u32,
    item: Option<T>,
}

struct ReaderSlot {
    /// Index of the next item this reader will consume; `None` marks a
    /// free or detached slot.
    next_item: Option<u64>,
    items_read: u64,
}

struct QueueState<T> {
    head: u64,
    tail: u64,
    slots: Vec<Slot<T>>,
    closed: bool,

    readers: Vec<ReaderSlot>,
    reader_count: usize,
    writer_used: Vec<bool>,
    writer_count: usize,

    // Pacing bookkeeping, shared across policies.
    pacing_on: bool,
    tick: u64,
    read_count: u64,
    write_counts: Vec<u64>,
    writes_limit: u64,
    writes_ewma: u64,
    write_count: u64,
    ideal_reader_pos: u64,

    // Counters surfaced by the stats accessors and the periodic log line.
    bytes_used: u64,
    peak_items: u64,
    peak_readers: usize,
    peak_writers: usize,
    pacing_on_count: u64,
    last_log: u64,
}

/// A bounded multi-producer/multi-consumer ring. Created once per pipeline
/// stage boundary and shared behind `Arc`.
pub struct Queue<T: QueueItem> {
    name: String,
    capacity: usize,
    policy: PacingPolicy,
    pacing: PacingConfig,
    clock: Arc<dyn Clock>,
    group: Arc<WaitGroup>,
    state: Mutex<QueueState<T>>,
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub items: u64,
    pub bytes: u64,
    pub capacity: usize,
    pub peak_items: u64,
    pub readers: usize,
    pub peak_readers: usize,
    pub writers: usize,
    pub peak_writers: usize,
    pub pacing_on: bool,
    pub pacing_on_count: u64,
    pub writes_limit: u64,
}

impl<T: QueueItem> Queue<T> {
    pub fn new(
        name: &str,
        policy: PacingPolicy,
        pacing: PacingConfig,
        clock: Arc<dyn Clock>,
        group: Arc<WaitGroup>,
    ) -> Arc<Self> {
        Self::with_capacity(name, QUEUE_MAX_ITEMS, policy, pacing, clock, group)
    }

    pub fn with_capacity(
        name: &str,
        capacity: usize,
        policy: PacingPolicy,
        pacing: PacingConfig,
        clock: Arc<dyn Clock>,
        group: Arc<WaitGroup>,
    ) -> Arc<Self> {
        let now = clock.now_secs();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            count: 0,
            item: None,
        });
        info!("queue {name}: created, capacity {capacity}, policy {policy:?}");
        Arc::new(Queue {
            name: name.to_string(),
            capacity,
            policy,
            pacing,
            clock,
            group,
            state: Mutex::new(QueueState {
                head: 0,
                tail: 0,
                slots,
                closed: false,
                readers: Vec::new(),
                reader_count: 0,
                writer_used: Vec::new(),
                writer_count: 0,
                pacing_on: false,
                tick: now,
                read_count: 0,
                write_counts: Vec::new(),
                writes_limit: QUEUE_MIN_WRITES_LIMIT,
                writes_ewma: 0,
                write_count: 0,
                ideal_reader_pos: 0,
                bytes_used: 0,
                peak_items: 0,
                peak_readers: 0,
                peak_writers: 0,
                pacing_on_count: 0,
                last_log: now,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn group(&self) -> &Arc<WaitGroup> {
        &self.group
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState<T>>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("queue lock poisoned"))
    }

    /// Attach a writer. Fails once `MAX_QUEUE_WRITERS` slots are taken.
    pub fn add_writer(self: &Arc<Self>) -> Result<QueueWriter<T>> {
        let mut st = self.lock()?;
        if st.writer_count >= MAX_QUEUE_WRITERS {
            warn!("queue {}: no room for another writer", self.name);
            return Err(Error::ResourceExhausted("queue writer slots"));
        }
        let index = match st.writer_used.iter().position(|used| !used) {
            Some(i) => {
                st.writer_used[i] = true;
                st.write_counts[i] = 0;
                i
            }
            None => {
                st.writer_used.push(true);
                st.write_counts.push(0);
                st.writer_used.len() - 1
            }
        };
        st.writer_count += 1;
        if st.writer_count > st.peak_writers {
            st.peak_writers = st.writer_count;
        }
        Ok(QueueWriter {
            queue: Arc::clone(self),
            index,
        })
    }

    /// Subscribe a reader to this queue alone. For a multi-queue group
    /// subscription use [`QueueReader::subscribe`].
    pub fn add_reader(self: &Arc<Self>) -> Result<QueueReader<T>> {
        QueueReader::subscribe(&[Arc::clone(self)])
    }

    /// Refuse further writes. Blocked readers drain what remains and then
    /// observe end-of-stream.
    pub fn close(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.closed = true;
        }
        let _g = self.group.guard.lock();
        self.group.cond.notify_all();
    }

    pub fn is_empty(&self) -> Result<bool> {
        let st = self.lock()?;
        Ok(st.head == st.tail)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let st = self.lock()?;
        Ok(QueueStats {
            items: st.tail - st.head,
            bytes: st.bytes_used,
            capacity: self.capacity,
            peak_items: st.peak_items,
            readers: st.reader_count,
            peak_readers: st.peak_readers,
            writers: st.writer_count,
            peak_writers: st.peak_writers,
            pacing_on: st.pacing_on,
            pacing_on_count: st.pacing_on_count,
            writes_limit: st.writes_limit,
        })
    }

    /// Position of reader `index`, for the status surface.
    pub fn reader_position(&self, index: usize) -> Result<Option<u64>> {
        let st = self.lock()?;
        Ok(st.readers.get(index).and_then(|r| r.next_item))
    }

    pub fn reader_items_read(&self, index: usize) -> Result<u64> {
        let st = self.lock()?;
        Ok(st.readers.get(index).map(|r| r.items_read).unwrap_or(0))
    }

    /// Items reader `index` has yet to consume.
    pub fn reader_unread(&self, index: usize) -> Result<u64> {
        let st = self.lock()?;
        match st.readers.get(index).and_then(|r| r.next_item) {
            Some(pos) => Ok(st.tail - pos),
            None => Ok(0),
        }
    }
}

impl<T: QueueItem> QueueState<T> {
    fn occupancy(&self) -> u64 {
        self.tail - self.head
    }

    /// Drop one reference from the slot at absolute position `pos`,
    /// freeing the item and advancing head when it was the last.
    fn release_slot(&mut self, pos: u64, capacity: usize) {
        let idx = (pos % capacity as u64) as usize;
        let slot = &mut self.slots[idx];
        slot.count -= 1;
        if slot.count == 0 {
            if let Some(item) = slot.item.take() {
                self.bytes_used = self.bytes_used.saturating_sub(item.size_bytes() as u64);
            }
            self.head += 1;
        }
    }

    /// Advance reader `index` from its position up to `dest`, releasing
    /// every slot passed over.
    fn advance_reader(&mut self, index: usize, dest: u64, capacity: usize, name: &str) {
        let Some(pos) = self.readers[index].next_item else {
            return;
        };
        if dest <= pos {
            return;
        }
        for p in pos..dest {
            self.release_slot(p, capacity);
        }
        self.readers[index].next_item = Some(dest);
        info!(
            "queue {name}: skipped {} messages for reader {index}",
            dest - pos
        );
    }
}

/// Handle for publishing into one queue. Dropping it releases the writer
/// slot.
pub struct QueueWriter<T: QueueItem> {
    queue: Arc<Queue<T>>,
    index: usize,
}

impl<T: QueueItem> QueueWriter<T> {
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Publish one item. With no subscribed readers the item is dropped on
    /// the floor, matching the publish/subscribe contract: nobody was
    /// listening.
    pub fn write(&self, item: T) -> Result<WriteOutcome> {
        let q = &self.queue;
        let now = q.clock.now_secs();
        let mut st = q.lock()?;
        if st.closed {
            return Err(Error::ResourceExhausted("queue is shut down"));
        }

        let was_full = pacing::write_post_lock(&mut *st, q.policy, &q.pacing, q.capacity, now)?;

        st.write_count += 1;
        if st.reader_count > 0 {
            st.write_counts[self.index] += 1;
            let idx = (st.tail % q.capacity as u64) as usize;
            st.bytes_used += item.size_bytes() as u64;
            st.slots[idx].count = st.reader_count as u32;
            st.slots[idx].item = Some(item);
            st.tail += 1;
            if st.occupancy() > st.peak_items {
                st.peak_items = st.occupancy();
            }
        }

        let pause = pacing::write_post_write(&mut *st, q.policy, &q.pacing, self.index, now);

        let log_due = now > st.last_log + q.pacing.log_interval_secs;
        if log_due {
            st.last_log = now;
            info!(
                "queue {} status: items={}/{} peak={} readers={} writers={} pacing={}",
                q.name,
                st.occupancy(),
                q.capacity,
                st.peak_items,
                st.reader_count,
                st.writer_count,
                st.pacing_on
            );
        }
        let had_readers = st.reader_count > 0;
        drop(st);

        if had_readers {
            let _g = q
                .group
                .guard
                .lock()
                .map_err(|_| Error::Internal("group lock poisoned"))?;
            q.group.cond.notify_all();
        }

        // A paced writer sits out the rest of the interval with no lock
        // held.
        if let Some(wait) = pause {
            std::thread::sleep(wait);
        }

        if was_full {
            Ok(WriteOutcome::StoredFull)
        } else {
            Ok(WriteOutcome::Stored)
        }
    }
}

impl<T: QueueItem> Drop for QueueWriter<T> {
    fn drop(&mut self) {
        if let Ok(mut st) = self.queue.state.lock() {
            st.writer_count -= 1;
            st.writer_used[self.index] = false;
            st.write_counts[self.index] = 0;
        }
    }
}

/// Handle for consuming from one or more queues as an atomic group.
/// Dropping it releases every slot the reader still pins.
pub struct QueueReader<T: QueueItem> {
    queues: Vec<Arc<Queue<T>>>,
    indexes: Vec<usize>,
    tick: Duration,
}

impl<T: QueueItem> QueueReader<T> {
    /// Subscribe to `queues` as one group. All queues must share a wait
    /// group. A new reader starts at the average position of the existing
    /// readers; the first reader starts at the tail.
    pub fn subscribe(queues: &[Arc<Queue<T>>]) -> Result<Self> {
        if queues.is_empty() {
            return Err(Error::Internal("reader subscribed to no queues"));
        }
        for q in &queues[1..] {
            if !Arc::ptr_eq(q.group(), queues[0].group()) {
                return Err(Error::Internal("reader group spans wait groups"));
            }
        }

        let mut indexes = Vec::with_capacity(queues.len());
        for q in queues {
            let mut st = q.lock()?;
            if st.reader_count >= MAX_QUEUE_READERS {
                warn!("queue {}: no room for another reader", q.name);
                return Err(Error::ResourceExhausted("queue reader slots"));
            }

            let start = if st.reader_count == 0 {
                st.tail
            } else {
                let sum: u64 = st.readers.iter().filter_map(|r| r.next_item).sum();
                sum / st.reader_count as u64
            };
            // Pin every slot from the start position to the tail.
            for pos in start..st.tail {
                let idx = (pos % q.capacity as u64) as usize;
                st.slots[idx].count += 1;
            }

            let slot = ReaderSlot {
                next_item: Some(start),
                items_read: 0,
            };
            let index = match st.readers.iter().position(|r| r.next_item.is_none()) {
                Some(i) => {
                    st.readers[i] = slot;
                    i
                }
                None => {
                    st.readers.push(slot);
                    st.readers.len() - 1
                }
            };
            st.reader_count += 1;
            if st.reader_count > st.peak_readers {
                st.peak_readers = st.reader_count;
            }
            indexes.push(index);
        }

        Ok(QueueReader {
            queues: queues.to_vec(),
            indexes,
            tick: THREAD_CHECK_INTERVAL,
        })
    }

    /// Shorten the periodic wake-up used while blocked; tests and
    /// shutdown-sensitive readers use a small tick.
    pub fn set_tick(&mut self, tick: Duration) {
        self.tick = tick;
    }

    /// Index of this reader in queue `i`'s reader table, for the status
    /// surface.
    pub fn slot_index(&self, i: usize) -> usize {
        self.indexes[i]
    }

    fn any_ready(&self) -> Result<bool> {
        for (q, &s) in self.queues.iter().zip(&self.indexes) {
            let st = q.lock()?;
            if let Some(pos) = st.readers[s].next_item {
                if pos < st.tail {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn all_finished(&self) -> Result<bool> {
        for (q, &s) in self.queues.iter().zip(&self.indexes) {
            let st = q.lock()?;
            match st.readers[s].next_item {
                Some(pos) => {
                    if !st.closed || pos < st.tail {
                        return Ok(false);
                    }
                }
                None => {}
            }
        }
        Ok(true)
    }

    /// Block until at least one subscribed queue has an item, then consume
    /// one item from each queue that has one. Returns `None` once every
    /// subscribed queue is closed and drained.
    pub fn read(&mut self) -> Result<Option<Vec<Option<T>>>> {
        {
            let mut guard = self
                .queues[0]
                .group()
                .guard
                .lock()
                .map_err(|_| Error::Internal("group lock poisoned"))?;
            loop {
                if self.any_ready()? {
                    break;
                }
                if self.all_finished()? {
                    return Ok(None);
                }
                let (g, _timeout) = self.queues[0]
                    .group()
                    .cond
                    .wait_timeout(guard, self.tick)
                    .map_err(|_| Error::Internal("group wait poisoned"))?;
                guard = g;
            }
        }

        let mut out = Vec::with_capacity(self.queues.len());
        for (q, &s) in self.queues.iter().zip(&self.indexes) {
            let now = q.clock.now_secs();
            let mut st = q.lock()?;

            let Some(pos) = st.readers[s].next_item else {
                out.push(None);
                continue;
            };
            if pos >= st.tail {
                out.push(None);
                continue;
            }

            pacing::read_post_lock(&mut *st, q.policy);

            let idx = (pos % q.capacity as u64) as usize;
            let item = if st.slots[idx].count == 1 {
                // Last reference: hand over the original.
                let item = st.slots[idx].item.take();
                st.slots[idx].count = 0;
                if let Some(ref it) = item {
                    st.bytes_used = st.bytes_used.saturating_sub(it.size_bytes() as u64);
                }
                st.head += 1;
                item
            } else {
                st.slots[idx].count -= 1;
                st.slots[idx].item.clone()
            };
            st.readers[s].next_item = Some(pos + 1);
            st.readers[s].items_read += 1;

            pacing::read_post_read(&mut *st, q.policy, &q.pacing, q.capacity, now);
            out.push(item);
        }
        Ok(Some(out))
    }
}

impl<T: QueueItem> Drop for QueueReader<T> {
    fn drop(&mut self) {
        for (q, &s) in self.queues.iter().zip(&self.indexes) {
            let Ok(mut st) = q.state.lock() else {
                continue;
            };
            if let Some(pos) = st.readers[s].next_item {
                for p in pos..st.tail {
                    st.release_slot(p, q.capacity);
                }
            }
            st.readers[s].next_item = None;
            st.readers[s].items_read = 0;
            st.reader_count -= 1;
            info!("queue {}: reader {s} detached", q.name);
        }
        // Wake any group peers re-evaluating their predicates.
        if let Ok(_g) = self.queues[0].group().guard.lock() {
            self.queues[0].group().cond.notify_all();
        }
    }
}

#[cfg(test)]
impl<T: QueueItem> Queue<T> {
    /// Writes by writer `index` in the current pacing interval.
    pub(crate) fn writer_interval_count(&self, index: usize) -> u64 {
        self.state.lock().unwrap().write_counts[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Thresholds above 1.0 keep writer pacing out of the way; the
    // full-queue reader adjustments under test do not depend on it.
    fn no_pacing() -> PacingConfig {
        PacingConfig {
            on_thresh: 2.0,
            off_thresh: 1.0,
            ..PacingConfig::default()
        }
    }

    fn test_queue(capacity: usize, policy: PacingPolicy) -> Arc<Queue<Vec<u8>>> {
        let clock = Arc::new(ManualClock::new(1000));
        Queue::with_capacity("test", capacity, policy, no_pacing(), clock, WaitGroup::new())
    }

    fn refcount_sum(q: &Queue<Vec<u8>>) -> u64 {
        let st = q.state.lock().unwrap();
        (st.head..st.tail)
            .map(|p| st.slots[(p % q.capacity as u64) as usize].count as u64)
            .sum()
    }

    fn reader_lag_sum(q: &Queue<Vec<u8>>) -> u64 {
        let st = q.state.lock().unwrap();
        st.readers
            .iter()
            .filter_map(|r| r.next_item)
            .map(|pos| st.tail - pos)
            .sum()
    }

    #[test]
    fn write_read_single_reader() {
        let q = test_queue(8, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        let mut r = q.add_reader().unwrap();
        r.set_tick(Duration::from_millis(10));

        w.write(b"one".to_vec()).unwrap();
        w.write(b"two".to_vec()).unwrap();

        let batch = r.read().unwrap().unwrap();
        assert_eq!(batch[0].as_deref(), Some(&b"one"[..]));
        let batch = r.read().unwrap().unwrap();
        assert_eq!(batch[0].as_deref(), Some(&b"two"[..]));
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn items_written_before_subscription_are_invisible() {
        let q = test_queue(8, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        // No readers yet: the item is dropped.
        w.write(b"lost".to_vec()).unwrap();
        assert!(q.is_empty().unwrap());

        let _r = q.add_reader().unwrap();
        w.write(b"kept".to_vec()).unwrap();
        assert_eq!(q.stats().unwrap().items, 1);
    }

    #[test]
    fn last_reader_takes_original_others_copies() {
        let q = test_queue(8, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        let mut r1 = q.add_reader().unwrap();
        let mut r2 = q.add_reader().unwrap();
        r1.set_tick(Duration::from_millis(10));
        r2.set_tick(Duration::from_millis(10));

        w.write(b"shared".to_vec()).unwrap();

        let a = r1.read().unwrap().unwrap();
        assert_eq!(a[0].as_deref(), Some(&b"shared"[..]));
        // Item still pinned for r2.
        assert_eq!(q.stats().unwrap().items, 1);

        let b = r2.read().unwrap().unwrap();
        assert_eq!(b[0].as_deref(), Some(&b"shared"[..]));
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn refcount_invariant_holds_across_operations() {
        let q = test_queue(16, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        let mut r1 = q.add_reader().unwrap();
        r1.set_tick(Duration::from_millis(10));

        for i in 0..10u8 {
            w.write(vec![i]).unwrap();
        }
        assert_eq!(refcount_sum(&q), reader_lag_sum(&q));

        let _r2 = q.add_reader().unwrap();
        assert_eq!(refcount_sum(&q), reader_lag_sum(&q));

        for _ in 0..4 {
            r1.read().unwrap();
        }
        assert_eq!(refcount_sum(&q), reader_lag_sum(&q));
    }

    #[test]
    fn destroying_reader_releases_pinned_slots() {
        let q = test_queue(32, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        let r1 = q.add_reader().unwrap();
        let mut r2 = q.add_reader().unwrap();
        r2.set_tick(Duration::from_millis(10));

        for i in 0..10u8 {
            w.write(vec![i]).unwrap();
        }
        // r2 consumes 3, r1 none.
        for _ in 0..3 {
            r2.read().unwrap();
        }
        let before = refcount_sum(&q);
        let r1_lag = {
            let st = q.state.lock().unwrap();
            st.tail - st.readers[0].next_item.unwrap()
        };
        drop(r1);
        assert_eq!(refcount_sum(&q), before - r1_lag);
        assert_eq!(refcount_sum(&q), reader_lag_sum(&q));
    }

    #[test]
    fn group_read_consumes_from_both_queues() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1000));
        let group = WaitGroup::new();
        let q1: Arc<Queue<Vec<u8>>> = Queue::with_capacity(
            "q1",
            8,
            PacingPolicy::FfJump,
            PacingConfig::default(),
            Arc::clone(&clock),
            Arc::clone(&group),
        );
        let q2: Arc<Queue<Vec<u8>>> = Queue::with_capacity(
            "q2",
            8,
            PacingPolicy::FfJump,
            PacingConfig::default(),
            Arc::clone(&clock),
            group,
        );
        let w1 = q1.add_writer().unwrap();
        let w2 = q2.add_writer().unwrap();
        let mut r = QueueReader::subscribe(&[Arc::clone(&q1), Arc::clone(&q2)]).unwrap();
        r.set_tick(Duration::from_millis(10));

        w1.write(b"a".to_vec()).unwrap();
        w2.write(b"b".to_vec()).unwrap();

        let batch = r.read().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].as_deref(), Some(&b"a"[..]));
        assert_eq!(batch[1].as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn group_read_returns_only_ready_queue() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1000));
        let group = WaitGroup::new();
        let q1: Arc<Queue<Vec<u8>>> = Queue::with_capacity(
            "q1",
            8,
            PacingPolicy::FfJump,
            PacingConfig::default(),
            Arc::clone(&clock),
            Arc::clone(&group),
        );
        let q2: Arc<Queue<Vec<u8>>> = Queue::with_capacity(
            "q2",
            8,
            PacingPolicy::FfJump,
            PacingConfig::default(),
            Arc::clone(&clock),
            group,
        );
        let w2 = q2.add_writer().unwrap();
        let mut r = QueueReader::subscribe(&[q1, q2]).unwrap();
        r.set_tick(Duration::from_millis(10));

        w2.write(b"only".to_vec()).unwrap();
        let batch = r.read().unwrap().unwrap();
        assert_eq!(batch[0], None);
        assert_eq!(batch[1].as_deref(), Some(&b"only"[..]));
    }

    #[test]
    fn closed_and_drained_reports_end_of_stream() {
        let q = test_queue(8, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        let mut r = q.add_reader().unwrap();
        r.set_tick(Duration::from_millis(10));

        w.write(b"last".to_vec()).unwrap();
        q.close();

        assert!(w.write(b"after".to_vec()).is_err());
        assert!(r.read().unwrap().is_some());
        assert!(r.read().unwrap().is_none());
    }

    #[test]
    fn full_queue_ff_jump_advances_slowest_to_tail() {
        let q = test_queue(4, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        let _r = q.add_reader().unwrap();

        for i in 0..4u8 {
            assert_eq!(w.write(vec![i]).unwrap(), WriteOutcome::Stored);
        }
        // Fifth write lands on a full ring: the stuck reader jumps to
        // tail, releasing all four.
        assert_eq!(w.write(vec![4]).unwrap(), WriteOutcome::StoredFull);
        let stats = q.stats().unwrap();
        assert_eq!(stats.items, 1);
        assert_eq!(refcount_sum(&q), reader_lag_sum(&q));
    }

    #[test]
    fn full_queue_backlog_advances_one_slot_per_write() {
        let q = test_queue(4, PacingPolicy::Backlog);
        let w = q.add_writer().unwrap();
        let _r = q.add_reader().unwrap();

        for i in 0..3u8 {
            w.write(vec![i]).unwrap();
        }
        // One below capacity: backlog mode reports full early but only
        // starts skipping once the ring is actually exhausted.
        assert_eq!(w.write(vec![3]).unwrap(), WriteOutcome::StoredFull);
        assert_eq!(q.stats().unwrap().items, 4);

        // At capacity: the head reader is stepped forward exactly one
        // slot per write until the backlog drains.
        assert_eq!(w.write(vec![4]).unwrap(), WriteOutcome::StoredFull);
        assert_eq!(q.stats().unwrap().items, 4);
        assert_eq!(refcount_sum(&q), reader_lag_sum(&q));
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let q = test_queue(8, PacingPolicy::FfJump);
        let w = q.add_writer().unwrap();
        let mut r = q.add_reader().unwrap();
        r.set_tick(Duration::from_secs(5));

        let handle = std::thread::spawn(move || r.read().unwrap().unwrap());
        std::thread::sleep(Duration::from_millis(50));
        w.write(b"wake".to_vec()).unwrap();
        let batch = handle.join().unwrap();
        assert_eq!(batch[0].as_deref(), Some(&b"wake"[..]));
    }
}
