//! Broker core: topics, channels, in-flight tracking, spill queues
//!
//! A [`Registry`] owns the set of named [`Topic`]s. Producers publish to a
//! topic; the topic duplicates every message to each named [`Channel`]
//! subscribed to it. Consumers pull from a channel, and every delivered
//! message stays in the channel's in-flight map until it is finished,
//! requeued, or its ack timer fires.
//!
//! ## Delivery semantics
//!
//! - At-least-once per channel. A message handed to a consumer is redelivered
//!   if the consumer neither finishes nor requeues it before the ack timeout.
//! - FIFO between a channel's buffer and its delivery path. No ordering
//!   across requeues, across channels, or across consumers.
//!
//! ## Backpressure: drop on full
//!
//! Every topic and channel buffer is bounded (`mem_queue_size`). A write into
//! a full buffer never blocks the producer side; the message is dropped and
//! logged instead. This trades completeness for latency under sustained
//! overload. Workloads that cannot tolerate drops enable the per-channel disk
//! spill queue, which takes the overflow instead.
//!
//! ## Concurrency model
//!
//! Every long-lived structure here (registry, topic, channel, in-flight
//! tracker, disk queue) is a dedicated task that owns its mutable state and
//! serves requests over `mpsc` channels, replying on `oneshot` channels
//! embedded in the request. Nothing in this module shares state behind a
//! lock.

use std::path::PathBuf;
use std::time::Duration;

mod channel;
mod error;
mod message;
mod registry;
mod spill;
mod topic;

pub use channel::{Channel, Consumer};
pub use error::BrokerError;
pub use message::{ID_LEN, Message};
pub use registry::Registry;
pub use spill::{DiskQueue, OverflowSink};
pub use topic::Topic;

/// Default bound for topic and channel in-memory buffers
pub const DEFAULT_MEM_QUEUE_SIZE: usize = 10_000;

/// Default window before an unacknowledged delivery is requeued
pub const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning knobs shared by every topic and channel the registry creates
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Bound for every topic and channel in-memory buffer
    pub mem_queue_size: usize,
    /// How long a delivered message may stay unacknowledged before requeue
    pub msg_timeout: Duration,
    /// Directory for per-channel disk spill queues; `None` keeps the
    /// drop-on-full policy
    pub spill_dir: Option<PathBuf>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            mem_queue_size: DEFAULT_MEM_QUEUE_SIZE,
            msg_timeout: DEFAULT_MSG_TIMEOUT,
            spill_dir: None,
        }
    }
}
