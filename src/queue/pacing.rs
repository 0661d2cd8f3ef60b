//! Pacing policy hooks.
//!
//! Each policy is invoked at four fixed points in the queue's read/write
//! paths: after the write lock is taken, after the item is stored, after
//! the read lock is taken, and after an item is consumed. The queue lock
//! is held at every hook; the only thing a hook may hand back across the
//! lock boundary is a sleep for the calling writer.

use std::time::Duration;

use crate::{Error, Result};

use super::{PacingConfig, PacingPolicy, QueueItem, QueueState};

/// Full-queue handling plus per-policy threshold work. Returns whether the
/// write found the queue full (the caller reports `StoredFull`).
pub(super) fn write_post_lock<T: QueueItem>(
    st: &mut QueueState<T>,
    policy: PacingPolicy,
    cfg: &PacingConfig,
    capacity: usize,
    now: u64,
) -> Result<bool> {
    let mut queue_full = false;

    // Backlog calls the queue full one slot early so the drain starts
    // before the ring is actually exhausted.
    if policy == PacingPolicy::Backlog && st.occupancy() >= capacity as u64 - 1 {
        queue_full = true;
    }

    if st.occupancy() >= capacity as u64 {
        queue_full = true;
        for i in 0..st.readers.len() {
            let Some(pos) = st.readers[i].next_item else {
                continue;
            };
            if pos != st.head {
                continue;
            }
            match policy {
                PacingPolicy::FfJump => {
                    let dest = st.tail;
                    st.advance_reader(i, dest, capacity, "pacing");
                }
                PacingPolicy::IdealReader | PacingPolicy::Backlog => {
                    // Step the slowest reader forward one slot.
                    st.release_slot(pos, capacity);
                    st.readers[i].next_item = Some(pos + 1);
                }
            }
        }
        if st.occupancy() >= capacity as u64 {
            return Err(Error::Internal("queue still full after adjusting readers"));
        }
    }

    update_interval(st, policy, cfg, capacity, now);

    if policy == PacingPolicy::IdealReader && utilization(st, capacity) >= cfg.on_thresh {
        for i in 0..st.readers.len() {
            if st.readers[i].next_item == Some(st.head) {
                let dest = st.ideal_reader_pos;
                st.advance_reader(i, dest, capacity, "pacing");
            }
        }
    }

    if policy == PacingPolicy::FfJump && utilization(st, capacity) < cfg.off_thresh {
        st.pacing_on = false;
    }

    Ok(queue_full)
}

/// Writer-side budget enforcement. A writer over its per-interval limit is
/// told to sit out the remainder of the interval; the queue lock is
/// released before the sleep happens.
pub(super) fn write_post_write<T: QueueItem>(
    st: &mut QueueState<T>,
    policy: PacingPolicy,
    cfg: &PacingConfig,
    writer: usize,
    now: u64,
) -> Option<Duration> {
    if policy != PacingPolicy::FfJump {
        return None;
    }

    let capacity = st.slots.len();
    if utilization(st, capacity) >= cfg.on_thresh {
        if !st.pacing_on {
            st.pacing_on_count += 1;
        }
        st.pacing_on = true;
    }
    if !st.pacing_on {
        return None;
    }

    if st.write_counts[writer] > st.writes_limit {
        let interval_end = st.tick + cfg.interval_secs;
        let wait = interval_end.saturating_sub(now);
        if wait > 0 {
            return Some(Duration::from_secs(wait));
        }
    }
    None
}

pub(super) fn read_post_lock<T: QueueItem>(_st: &mut QueueState<T>, _policy: PacingPolicy) {}

pub(super) fn read_post_read<T: QueueItem>(
    st: &mut QueueState<T>,
    policy: PacingPolicy,
    cfg: &PacingConfig,
    capacity: usize,
    now: u64,
) {
    update_interval(st, policy, cfg, capacity, now);
    st.read_count += 1;

    if policy == PacingPolicy::FfJump && utilization(st, capacity) < cfg.off_thresh {
        st.pacing_on = false;
    }
}

fn utilization<T: QueueItem>(st: &QueueState<T>, capacity: usize) -> f64 {
    st.occupancy() as f64 / capacity as f64
}

/// Roll the pacing interval forward, recomputing the per-writer limit
/// (ff_jump) or the ideal reader position (ideal_reader) once per elapsed
/// interval.
fn update_interval<T: QueueItem>(
    st: &mut QueueState<T>,
    policy: PacingPolicy,
    cfg: &PacingConfig,
    capacity: usize,
    now: u64,
) {
    if now < st.tick + cfg.interval_secs {
        return;
    }
    while now >= st.tick + cfg.interval_secs {
        st.tick += cfg.interval_secs;
        match policy {
            PacingPolicy::FfJump => {
                calculate_writes_limit(st, cfg, capacity);
                st.read_count = 0;
                for c in st.write_counts.iter_mut() {
                    *c = 0;
                }
            }
            PacingPolicy::IdealReader => {
                st.ideal_reader_pos = (st.ideal_reader_pos + st.writes_ewma).min(st.tail);
                if st.writes_ewma == 0 {
                    st.writes_ewma = st.write_count;
                } else {
                    st.writes_ewma = ((1.0 - cfg.alpha) * st.writes_ewma as f64
                        + cfg.alpha * st.write_count as f64)
                        as u64;
                }
                st.write_count = 0;
            }
            PacingPolicy::Backlog => {}
        }
    }
}

/// The objective is a write pace matching the average reader: each writer
/// gets an EWMA-smoothed share of what readers consumed last interval,
/// floored at the configured minimum and capped at half the remaining
/// queue space.
fn calculate_writes_limit<T: QueueItem>(
    st: &mut QueueState<T>,
    cfg: &PacingConfig,
    capacity: usize,
) {
    if st.reader_count == 0 || st.writer_count == 0 {
        // The queue will drain and pacing will turn off; the limit is not
        // used in the meantime.
        return;
    }

    let average_reads = st.read_count / st.reader_count as u64;
    let instant_limit = average_reads / st.writer_count as u64;

    st.writes_limit =
        ((1.0 - cfg.alpha) * st.writes_limit as f64 + cfg.alpha * instant_limit as f64) as u64;

    let available = capacity as u64 - st.occupancy();
    let upbound = available / 2;
    if st.writes_limit > upbound {
        st.writes_limit = upbound;
    }
    if st.writes_limit < cfg.min_writes_limit {
        st.writes_limit = cfg.min_writes_limit;
    }
}
