//! Serialized topic factory
//!
//! The registry owns the process-wide name → topic map. Lookups and creation
//! go through one owning task, so the map needs no lock and topic creation
//! cannot race. Callers hold a cloneable handle; the handle is what the
//! transports and the protocol engine get, there is no global state.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use super::error::BrokerError;
use super::topic::Topic;
use super::BrokerOptions;

enum RegistryRequest {
    GetOrCreate {
        name: String,
        reply: oneshot::Sender<Topic>,
    },
    Topics {
        reply: oneshot::Sender<Vec<String>>,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the topic registry. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    tx: mpsc::Sender<RegistryRequest>,
}

impl Registry {
    /// Spawn the owning task and return a handle to it.
    pub fn start(options: BrokerOptions) -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(serve(options, rx));
        Self { tx }
    }

    /// Look up or create a topic. Synchronous from the caller's viewpoint.
    ///
    /// Empty names are the caller's problem: the protocol engine rejects
    /// them before they get here.
    pub async fn get_or_create(&self, name: &str) -> Result<Topic, BrokerError> {
        let (reply, created) = oneshot::channel();
        self.tx
            .send(RegistryRequest::GetOrCreate {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| BrokerError::Closed("registry"))?;
        created.await.map_err(|_| BrokerError::Closed("registry"))
    }

    /// Names of every topic created so far, sorted.
    pub async fn topics(&self) -> Result<Vec<String>, BrokerError> {
        let (reply, names) = oneshot::channel();
        self.tx
            .send(RegistryRequest::Topics { reply })
            .await
            .map_err(|_| BrokerError::Closed("registry"))?;
        names.await.map_err(|_| BrokerError::Closed("registry"))
    }

    /// Close every topic, cascading to channels and their consumers.
    pub async fn close_all(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(RegistryRequest::CloseAll { reply }).await.is_ok() {
            let _ = done.await;
        }
    }
}

async fn serve(options: BrokerOptions, mut rx: mpsc::Receiver<RegistryRequest>) {
    let mut topics: HashMap<String, Topic> = HashMap::new();

    while let Some(req) = rx.recv().await {
        match req {
            RegistryRequest::GetOrCreate { name, reply } => {
                let topic = match topics.get(&name) {
                    Some(topic) => topic.clone(),
                    None => {
                        let topic = Topic::new(&name, options.clone());
                        tracing::info!(topic = %name, "created topic");
                        topics.insert(name, topic.clone());
                        topic
                    }
                };
                let _ = reply.send(topic);
            }
            RegistryRequest::Topics { reply } => {
                let mut names: Vec<String> = topics.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
            RegistryRequest::CloseAll { reply } => {
                for topic in topics.values() {
                    topic.close().await;
                }
                topics.clear();
                let _ = reply.send(());
            }
        }
    }
}
