//! Compile-time defaults. Anything listed in the configuration document
//! overrides the value here at start-up; the rest are fixed operating
//! parameters.

use std::time::Duration;

/// Slots per queue. Pre-allocated, so large values cost memory up front.
pub const QUEUE_MAX_ITEMS: usize = 5000;

/// Queue utilization fraction at which pacing turns on.
pub const QUEUE_PACING_ON_THRESHOLD: f64 = 0.50;

/// Queue utilization fraction at which pacing turns back off.
pub const QUEUE_PACING_OFF_THRESHOLD: f64 = 0.25;

/// EWMA weight for the per-interval writes limit. 0 recomputes from
/// scratch each interval, 1 never changes the limit.
pub const QUEUE_ALPHA: f64 = 0.25;

/// A paced writer may always write at least this many items per interval.
pub const QUEUE_MIN_WRITES_LIMIT: u64 = 1;

/// Pacing interval in seconds.
pub const QUEUE_PACING_INTERVAL: u64 = 1;

/// How often queue status lines go to the log.
pub const QUEUE_LOG_INTERVAL: u64 = 1800;

/// Most readers a single queue will accept. The XML queues carry one
/// reader per subscribed client.
pub const MAX_QUEUE_READERS: usize = 10000;

/// Most writers a single queue will accept. The peer queue carries one
/// writer per peer; the XML queues one per chain plus the serializer.
pub const MAX_QUEUE_WRITERS: usize = 1001;

pub const PEER_QUEUE_NAME: &str = "PeerQueue";
pub const LABEL_QUEUE_NAME: &str = "LabelQueue";
pub const XML_U_QUEUE_NAME: &str = "XMLUQueue";
pub const XML_R_QUEUE_NAME: &str = "XMLRQueue";

/// Initial bucket counts for the per-session tables. Rounded up to a
/// power of two at construction.
pub const PREFIX_TABLE_SIZE: usize = 40000;
pub const ATTRIBUTE_TABLE_SIZE: usize = 40000;

/// Longest tolerated bucket chain before a table resizes to 2x.
pub const MAX_HASH_COLLISION: usize = 400;

/// Seconds between sweeps of the chain-owner cache.
pub const CACHE_EXPIRATION_INTERVAL: u64 = 1200;

/// Seconds an owner-cache entry may idle before the sweep removes it.
pub const CACHE_ENTRY_LIFETIME: u64 = 7200;

/// Periodic wake-up applied to every blocking operation so shutdown and
/// reconfiguration flags are observed.
pub const THREAD_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default seconds between reconnect attempts for peers and chains.
pub const CONNECT_RETRY_INTERVAL: u64 = 60;

/// Default BGP hold time offered in our OPEN.
pub const DEFAULT_HOLD_TIME: u16 = 180;

/// Most simultaneously connected subscriber clients per listener.
pub const MAX_CLIENT_IDS: usize = 10000;
