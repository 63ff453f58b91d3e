//! Named fan-out point for producers
//!
//! A topic accepts one stream of messages from any number of producers and
//! duplicates each message to every channel subscribed to it. The event loop
//! owns the channel map; the fan-out pump never touches it. Instead the pump
//! hands each dequeued message back to the event loop as a `FanOut` request
//! and waits for the answer, so the set of channels that receive a message is
//! exactly the set the event loop sees when it dequeues that request.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use super::channel::Channel;
use super::error::BrokerError;
use super::message::Message;
use super::BrokerOptions;

enum TopicRequest {
    GetOrCreateChannel {
        name: String,
        reply: oneshot::Sender<Channel>,
    },
    FanOut {
        msg: Message,
        done: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a named topic. Cheap to clone; all operations are served by the
/// topic's event loop task.
#[derive(Clone)]
pub struct Topic {
    name: Arc<str>,
    incoming_tx: mpsc::Sender<Message>,
    control_tx: mpsc::Sender<TopicRequest>,
}

impl Topic {
    pub(crate) fn new(name: &str, options: BrokerOptions) -> Self {
        let name: Arc<str> = name.into();
        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::channel(1);

        tokio::spawn(event_loop(
            name.clone(),
            options,
            control_rx,
            control_tx.clone(),
            incoming_rx,
        ));

        Self {
            name,
            incoming_tx,
            control_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up or create the channel with the given name. Synchronous,
    /// serialized through the topic's event loop. The first channel starts
    /// the fan-out pump.
    pub async fn get_or_create_channel(&self, name: &str) -> Result<Channel, BrokerError> {
        let (reply, created) = oneshot::channel();
        self.control_tx
            .send(TopicRequest::GetOrCreateChannel {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| BrokerError::Closed("topic"))?;
        created.await.map_err(|_| BrokerError::Closed("topic"))
    }

    /// Publish a message to the topic. Blocks until the event loop accepts
    /// it; the event loop itself never blocks on the bounded buffer (it
    /// drops on overflow instead).
    pub async fn put(&self, msg: Message) {
        let _ = self.incoming_tx.send(msg).await;
    }

    /// Close the topic and every channel subscribed to it. Synchronous.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .control_tx
            .send(TopicRequest::Close { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

/// Owns the channel map and the producer side of the fan-out buffer.
async fn event_loop(
    name: Arc<str>,
    options: BrokerOptions,
    mut control_rx: mpsc::Receiver<TopicRequest>,
    control_tx: mpsc::Sender<TopicRequest>,
    mut incoming_rx: mpsc::Receiver<Message>,
) {
    let mut channels: HashMap<String, Channel> = HashMap::new();
    let (buf_tx, buf_rx) = mpsc::channel::<Message>(options.mem_queue_size);
    let mut buf_rx = Some(buf_rx);
    let (close_tx, _) = watch::channel(false);

    loop {
        tokio::select! {
            req = control_rx.recv() => match req {
                Some(TopicRequest::GetOrCreateChannel { name: channel_name, reply }) => {
                    let channel = match channels.get(&channel_name) {
                        Some(channel) => channel.clone(),
                        None => {
                            let channel =
                                Channel::new(&name, &channel_name, &options).await;
                            tracing::info!(
                                topic = %name,
                                channel = %channel_name,
                                "created channel"
                            );
                            channels.insert(channel_name, channel.clone());
                            channel
                        }
                    };
                    // The pump only makes sense once there is somewhere to
                    // fan out to.
                    if let Some(buf_rx) = buf_rx.take() {
                        tokio::spawn(pump(
                            buf_rx,
                            control_tx.clone(),
                            close_tx.subscribe(),
                        ));
                    }
                    let _ = reply.send(channel);
                }
                Some(TopicRequest::FanOut { msg, done }) => {
                    for channel in channels.values() {
                        let channel = channel.clone();
                        let msg = msg.fork();
                        tokio::spawn(async move {
                            channel.put(msg).await;
                        });
                    }
                    let _ = done.send(());
                }
                Some(TopicRequest::Close { reply }) => {
                    tracing::info!(topic = %name, "topic closing");
                    for channel in channels.values() {
                        channel.close().await;
                    }
                    let _ = close_tx.send(true);
                    let _ = reply.send(());
                    break;
                }
                None => break,
            },
            msg = incoming_rx.recv() => match msg {
                Some(msg) => match buf_tx.try_send(msg) {
                    Ok(()) => {
                        tracing::trace!(topic = %name, "buffered message");
                    }
                    Err(TrySendError::Full(msg)) => tracing::warn!(
                        topic = %name,
                        id = %msg.id_str(),
                        "buffer full, dropping message"
                    ),
                    Err(TrySendError::Closed(_)) => {}
                },
                None => break,
            },
        }
    }
}

/// Dequeues one message at a time and hands it back to the event loop for
/// duplication. Waiting for `done` keeps the pump from running ahead of the
/// channel set the event loop answered with.
async fn pump(
    mut buf_rx: mpsc::Receiver<Message>,
    control_tx: mpsc::Sender<TopicRequest>,
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

        let (done, fanned_out) = oneshot::channel();
        if control_tx
            .send(TopicRequest::FanOut { msg, done })
            .await
            .is_err()
        {
            break;
        }
        if fanned_out.await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn options(mem_queue_size: usize) -> BrokerOptions {
        BrokerOptions {
            mem_queue_size,
            ..BrokerOptions::default()
        }
    }

    async fn pull_with_timeout(channel: &Channel) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(1), channel.pull())
            .await
            .expect("pull should not block")
    }

    #[tokio::test]
    async fn test_get_or_create_channel_is_idempotent() {
        let topic = Topic::new("scores", options(16));
        let a = topic.get_or_create_channel("default").await.unwrap();
        let b = topic.get_or_create_channel("default").await.unwrap();

        // same underlying channel: a message put once is pulled once
        a.put(Message::new(b"one")).await;
        assert!(pull_with_timeout(&b).await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_millis(200), a.pull())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_channel() {
        let topic = Topic::new("scores", options(16));
        let a = topic.get_or_create_channel("a").await.unwrap();
        let b = topic.get_or_create_channel("b").await.unwrap();

        let msg = Message::new(b"m1");
        let id = msg.id_str();
        topic.put(msg).await;

        let got_a = pull_with_timeout(&a).await.unwrap();
        let got_b = pull_with_timeout(&b).await.unwrap();
        assert_eq!(got_a.id_str(), id);
        assert_eq!(got_b.id_str(), id);

        // each channel acks independently
        a.finish(&id).await.unwrap();
        b.finish(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_buffered_before_first_channel_are_delivered() {
        let topic = Topic::new("scores", options(16));
        topic.put(Message::new(b"early")).await;

        let channel = topic.get_or_create_channel("late").await.unwrap();
        let msg = pull_with_timeout(&channel).await.unwrap();
        assert_eq!(msg.body(), b"early");
    }

    #[tokio::test]
    async fn test_overflow_drops_when_no_channel_drains() {
        let topic = Topic::new("scores", options(2));
        for i in 0..5u8 {
            topic.put(Message::new(&[i])).await;
        }

        // only the buffered bound survives to the late subscriber
        let channel = topic.get_or_create_channel("late").await.unwrap();
        let mut delivered = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(200), channel.pull()).await
        {
            delivered += 1;
        }
        assert!(delivered <= 2, "expected at most the buffer bound, got {delivered}");
        assert!(delivered >= 1);
    }

    #[tokio::test]
    async fn test_slow_channel_does_not_starve_the_other() {
        let topic = Topic::new("scores", options(32));
        let fast = topic.get_or_create_channel("fast").await.unwrap();
        let _slow = topic.get_or_create_channel("slow").await.unwrap();

        for i in 0..10u8 {
            topic.put(Message::new(&[i])).await;
        }

        // nobody pulls from `slow`, yet `fast` sees all ten
        for _ in 0..10 {
            let msg = tokio::time::timeout(Duration::from_secs(2), fast.pull())
                .await
                .expect("fast channel should not be starved")
                .unwrap();
            fast.finish(&msg.id_str()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_cascades_to_channels() {
        let topic = Topic::new("scores", options(8));
        let channel = topic.get_or_create_channel("default").await.unwrap();

        topic.close().await;

        let err = channel
            .finish("00000000-0000-0000-0000-000000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Closed(_)));
    }
}
