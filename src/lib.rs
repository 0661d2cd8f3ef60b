//! BGP route-monitoring daemon.
//!
//! Accepts BGP sessions from routers and chains to upstream monitor
//! instances, labels each update against per-peer RIB state, serializes
//! results as length-prefixed XML records, and fans them out to
//! subscribing clients through shared multi-reader queues.

pub mod acl;
pub mod bgp;
pub mod chain;
pub mod client;
pub mod config;
pub mod defaults;
pub mod error;
pub mod label;
pub mod message;
pub mod peer;
pub mod pipeline;
pub mod queue;
pub mod xml;

pub use error::{Error, Result};
pub use message::{Message, MessageKind};
pub use pipeline::Pipeline;
pub use queue::{PacingPolicy, Queue, QueueReader, QueueWriter};
