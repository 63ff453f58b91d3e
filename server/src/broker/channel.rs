//! Named subscription channel: consumers, buffering, delivery, in-flight
//! tracking
//!
//! A channel is served by four tasks:
//!
//! - the **event loop**, which owns the consumer set and routes producer
//!   messages into the bounded buffer (dropping or spilling on overflow),
//! - the **pump**, which moves one message at a time from the buffer to a
//!   pulling consumer, registering it with the in-flight tracker first,
//! - the **in-flight tracker**, which owns the id → message map and spawns a
//!   requeue watchdog per delivery,
//! - the optional **spill drain**, which feeds spilled messages back into the
//!   buffer when there is room.
//!
//! The pump's handoff to a consumer is a rendez-vous: it waits for a pull
//! request before releasing the message. While no consumer is pulling the
//! pump stalls, which is what backpressures the buffer and, eventually, the
//! topic's fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use super::error::BrokerError;
use super::message::Message;
use super::spill::{DiskQueue, OverflowSink};
use super::BrokerOptions;

/// Capacity of the producer-facing incoming channel
const INCOMING_BUFFER: usize = 1;

/// A subscriber bound to a channel.
///
/// The channel only needs a stable name to deregister the consumer and a way
/// to tell it the channel is going away.
pub trait Consumer: Send {
    fn name(&self) -> &str;
    fn close(&self);
}

enum ControlRequest {
    AddConsumer {
        consumer: Box<dyn Consumer>,
        reply: oneshot::Sender<()>,
    },
    RemoveConsumer {
        name: String,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct PullRequest {
    reply: oneshot::Sender<Message>,
}

enum TrackerRequest {
    Track(Message),
    Finish {
        id: String,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    /// `reply` is `None` when the requeue comes from a watchdog
    Requeue {
        id: String,
        reply: Option<oneshot::Sender<Result<(), BrokerError>>>,
    },
}

/// Handle to a named subscription channel. Cheap to clone; all operations are
/// served by the channel's owning tasks.
#[derive(Clone, Debug)]
pub struct Channel {
    name: Arc<str>,
    topic: Arc<str>,
    incoming_tx: mpsc::Sender<Message>,
    control_tx: mpsc::Sender<ControlRequest>,
    pull_tx: mpsc::Sender<PullRequest>,
    tracker_tx: mpsc::Sender<TrackerRequest>,
}

impl Channel {
    pub(crate) async fn new(topic: &str, name: &str, options: &BrokerOptions) -> Self {
        let name: Arc<str> = name.into();
        let topic: Arc<str> = topic.into();

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (pull_tx, pull_rx) = mpsc::channel::<PullRequest>(1);
        let (tracker_tx, tracker_rx) = mpsc::channel(1);
        let (buf_tx, buf_rx) = mpsc::channel(options.mem_queue_size);
        let (close_tx, close_rx) = watch::channel(false);

        let spill: Option<Arc<dyn OverflowSink>> = match &options.spill_dir {
            Some(dir) => {
                let queue_name = format!("{}.{}", topic, name);
                match DiskQueue::open(dir, &queue_name).await {
                    Ok(queue) => Some(Arc::new(queue)),
                    Err(e) => {
                        tracing::error!(
                            topic = %topic,
                            channel = %name,
                            error = %e,
                            "failed to open spill queue, falling back to drop-on-full"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        tokio::spawn(event_loop(
            topic.clone(),
            name.clone(),
            control_rx,
            incoming_rx,
            buf_tx.clone(),
            spill.clone(),
            close_tx,
        ));
        tokio::spawn(pump(
            buf_rx,
            pull_rx,
            tracker_tx.clone(),
            close_rx.clone(),
        ));
        tokio::spawn(tracker(
            topic.clone(),
            name.clone(),
            tracker_rx,
            tracker_tx.clone(),
            incoming_tx.clone(),
            options.msg_timeout,
            close_rx.clone(),
        ));
        if let Some(spill) = spill {
            tokio::spawn(spill_drain(spill, buf_tx, close_rx));
        }

        Self {
            name,
            topic,
            incoming_tx,
            control_tx,
            pull_tx,
            tracker_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the topic this channel is subscribed to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register a consumer so the channel can kick it on close. Synchronous:
    /// returns once the event loop has recorded the consumer.
    pub async fn add_consumer(&self, consumer: Box<dyn Consumer>) {
        let (reply, done) = oneshot::channel();
        if self
            .control_tx
            .send(ControlRequest::AddConsumer { consumer, reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Deregister a consumer by name. A missing consumer is logged, not an
    /// error.
    pub async fn remove_consumer(&self, name: &str) {
        let (reply, done) = oneshot::channel();
        if self
            .control_tx
            .send(ControlRequest::RemoveConsumer {
                name: name.to_string(),
                reply,
            })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Enqueue a message. Never blocks on a full buffer: overflow is spilled
    /// to disk when a spill queue is configured and dropped otherwise.
    pub async fn put(&self, msg: Message) {
        let _ = self.incoming_tx.send(msg).await;
    }

    /// Pull the next deliverable message. Blocks until one is available;
    /// returns `None` once the channel is closed.
    pub async fn pull(&self) -> Option<Message> {
        let (reply, delivery) = oneshot::channel();
        self.pull_tx.send(PullRequest { reply }).await.ok()?;
        delivery.await.ok()
    }

    /// Acknowledge a delivered message by its canonical id.
    pub async fn finish(&self, id: &str) -> Result<(), BrokerError> {
        let (reply, done) = oneshot::channel();
        self.tracker_tx
            .send(TrackerRequest::Finish {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| BrokerError::Closed("channel"))?;
        done.await.map_err(|_| BrokerError::Closed("channel"))?
    }

    /// Push a delivered message back to the channel's input by its canonical
    /// id.
    pub async fn requeue(&self, id: &str) -> Result<(), BrokerError> {
        let (reply, done) = oneshot::channel();
        self.tracker_tx
            .send(TrackerRequest::Requeue {
                id: id.to_string(),
                reply: Some(reply),
            })
            .await
            .map_err(|_| BrokerError::Closed("channel"))?;
        done.await.map_err(|_| BrokerError::Closed("channel"))?
    }

    /// Close the channel: kick every consumer, stop the pump and tracker,
    /// and close the spill queue. Synchronous.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .control_tx
            .send(ControlRequest::Close { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

/// Owns the consumer set and the producer side of the buffer.
async fn event_loop(
    topic: Arc<str>,
    name: Arc<str>,
    mut control_rx: mpsc::Receiver<ControlRequest>,
    mut incoming_rx: mpsc::Receiver<Message>,
    buf_tx: mpsc::Sender<Message>,
    spill: Option<Arc<dyn OverflowSink>>,
    close_tx: watch::Sender<bool>,
) {
    let mut consumers: Vec<Box<dyn Consumer>> = Vec::new();

    loop {
        tokio::select! {
            req = control_rx.recv() => match req {
                Some(ControlRequest::AddConsumer { consumer, reply }) => {
                    tracing::debug!(
                        topic = %topic,
                        channel = %name,
                        consumer = consumer.name(),
                        "added consumer"
                    );
                    consumers.push(consumer);
                    let _ = reply.send(());
                }
                Some(ControlRequest::RemoveConsumer { name: consumer, reply }) => {
                    match consumers.iter().position(|c| c.name() == consumer) {
                        Some(index) => {
                            consumers.remove(index);
                            tracing::debug!(
                                topic = %topic,
                                channel = %name,
                                consumer = %consumer,
                                "removed consumer"
                            );
                        }
                        None => tracing::error!(
                            topic = %topic,
                            channel = %name,
                            consumer = %consumer,
                            "could not find consumer to remove"
                        ),
                    }
                    let _ = reply.send(());
                }
                Some(ControlRequest::Close { reply }) => {
                    tracing::info!(topic = %topic, channel = %name, "channel closing");
                    let _ = close_tx.send(true);
                    for consumer in consumers.drain(..) {
                        consumer.close();
                    }
                    if let Some(spill) = &spill {
                        spill.close().await;
                    }
                    let _ = reply.send(());
                    break;
                }
                None => break,
            },
            msg = incoming_rx.recv() => match msg {
                Some(msg) => enqueue(&topic, &name, msg, &buf_tx, spill.as_deref()).await,
                None => break,
            },
        }
    }
}

/// Push a producer message into the bounded buffer; spill or drop on
/// overflow. Never blocks the producer side.
async fn enqueue(
    topic: &str,
    name: &str,
    msg: Message,
    buf_tx: &mpsc::Sender<Message>,
    spill: Option<&dyn OverflowSink>,
) {
    match buf_tx.try_send(msg) {
        Ok(()) => {
            tracing::trace!(topic = %topic, channel = %name, "buffered message");
        }
        Err(TrySendError::Full(msg)) => match spill {
            Some(spill) => match spill.put(msg.bytes()).await {
                Ok(()) => tracing::debug!(
                    topic = %topic,
                    channel = %name,
                    id = %msg.id_str(),
                    "buffer full, spilled message to disk"
                ),
                Err(e) => tracing::warn!(
                    topic = %topic,
                    channel = %name,
                    id = %msg.id_str(),
                    error = %e,
                    "spill failed, dropping message"
                ),
            },
            None => tracing::warn!(
                topic = %topic,
                channel = %name,
                id = %msg.id_str(),
                "buffer full, dropping message"
            ),
        },
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Moves messages from the buffer to pulling consumers, one rendez-vous at a
/// time. The message is registered with the tracker *before* the handoff so
/// a consumer can never finish a message the tracker has not seen.
async fn pump(
    mut buf_rx: mpsc::Receiver<Message>,
    mut pull_rx: mpsc::Receiver<PullRequest>,
    tracker_tx: mpsc::Sender<TrackerRequest>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            msg = buf_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = close_rx.changed() => break,
        };

        if tracker_tx
            .send(TrackerRequest::Track(msg.clone()))
            .await
            .is_err()
        {
            break;
        }

        tokio::select! {
            req = pull_rx.recv() => match req {
                // A puller that vanished before the reply landed is fine:
                // the watchdog redelivers.
                Some(PullRequest { reply }) => {
                    let _ = reply.send(msg);
                }
                None => break,
            },
            _ = close_rx.changed() => break,
        }
    }
}

/// Owns the in-flight map. Every tracked delivery gets a watchdog that
/// requeues the message when the ack timeout fires before the ack capability
/// does.
async fn tracker(
    topic: Arc<str>,
    name: Arc<str>,
    mut tracker_rx: mpsc::Receiver<TrackerRequest>,
    tracker_tx: mpsc::Sender<TrackerRequest>,
    incoming_tx: mpsc::Sender<Message>,
    msg_timeout: Duration,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut in_flight: HashMap<String, Message> = HashMap::new();

    loop {
        let req = tokio::select! {
            req = tracker_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = close_rx.changed() => break,
        };

        match req {
            TrackerRequest::Track(msg) => {
                let id = msg.id_str();
                spawn_watchdog(
                    id.clone(),
                    msg.ack_signal(),
                    msg_timeout,
                    tracker_tx.clone(),
                    close_rx.clone(),
                );
                tracing::trace!(
                    topic = %topic,
                    channel = %name,
                    id = %id,
                    "message in flight"
                );
                in_flight.insert(id, msg);
            }
            TrackerRequest::Finish { id, reply } => {
                let result = match in_flight.remove(&id) {
                    Some(msg) => {
                        msg.notify_ack();
                        tracing::debug!(
                            topic = %topic,
                            channel = %name,
                            id = %id,
                            "finished message"
                        );
                        Ok(())
                    }
                    None => Err(BrokerError::UnknownMessage { id }),
                };
                let _ = reply.send(result);
            }
            TrackerRequest::Requeue { id, reply } => match in_flight.remove(&id) {
                Some(mut msg) => {
                    // Cancel any pending watchdog, then arm a fresh
                    // capability so its permit cannot satisfy the next
                    // delivery's watchdog.
                    msg.notify_ack();
                    msg.rearm();
                    if reply.is_none() {
                        tracing::debug!(
                            topic = %topic,
                            channel = %name,
                            id = %id,
                            "ack timeout, requeueing message"
                        );
                    }
                    let incoming = incoming_tx.clone();
                    tokio::spawn(async move {
                        let _ = incoming.send(msg).await;
                    });
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                None => match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(BrokerError::UnknownMessage { id }));
                    }
                    // A watchdog racing a just-processed FIN lands here.
                    None => tracing::trace!(
                        topic = %topic,
                        channel = %name,
                        id = %id,
                        "watchdog fired for settled message"
                    ),
                },
            },
        }
    }
}

fn spawn_watchdog(
    id: String,
    ack: Arc<tokio::sync::Notify>,
    msg_timeout: Duration,
    tracker_tx: mpsc::Sender<TrackerRequest>,
    mut close_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = ack.notified() => {}
            _ = close_rx.changed() => {}
            _ = tokio::time::sleep(msg_timeout) => {
                let _ = tracker_tx
                    .send(TrackerRequest::Requeue { id, reply: None })
                    .await;
            }
        }
    });
}

/// Feeds spilled messages back into the buffer when it has room. The
/// blocking `send` is the backpressure: the drain only makes progress while
/// the buffer is below its bound.
async fn spill_drain(
    spill: Arc<dyn OverflowSink>,
    buf_tx: mpsc::Sender<Message>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = spill.ready_for_read() => {
                let bytes = match spill.get().await {
                    Ok(bytes) => bytes,
                    Err(_) => break,
                };
                match Message::from_bytes(bytes) {
                    Ok(msg) => {
                        if buf_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding malformed spilled message");
                    }
                }
            }
            _ = close_rx.changed() => break,
        }
    }
}
