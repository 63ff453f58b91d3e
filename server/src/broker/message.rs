//! Message payload and identity

use std::fmt;
use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use super::error::BrokerError;

/// Length of the identifier prefix carried by every message
pub const ID_LEN: usize = 16;

/// An immutable broker message.
///
/// The payload is a 16-byte identifier followed by the body; it is never
/// mutated after construction and is shared between clones. The message also
/// carries a single-shot ack capability: a non-blocking signal the in-flight
/// watchdog waits on so an acknowledgement can cancel the requeue timer. A
/// sender never blocks on it and a listener may not exist.
///
/// Channels track in-flight state independently, so topic fan-out hands each
/// channel a [`fork`](Message::fork) of the message: same payload bytes,
/// fresh ack capability.
#[derive(Clone)]
pub struct Message {
    data: Arc<[u8]>,
    ack: Arc<Notify>,
}

impl Message {
    /// Create a message with a freshly generated identifier.
    ///
    /// The identifier is the 16 bytes of a v4 UUID, so it comes from a
    /// cryptographic random source and renders in the canonical five-group
    /// wire form.
    pub fn new(body: &[u8]) -> Self {
        let id = Uuid::new_v4();
        let mut data = Vec::with_capacity(ID_LEN + body.len());
        data.extend_from_slice(id.as_bytes());
        data.extend_from_slice(body);
        Self {
            data: data.into(),
            ack: Arc::new(Notify::new()),
        }
    }

    /// Reconstruct a message from raw payload bytes (id prefix included),
    /// e.g. when draining a spill queue.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, BrokerError> {
        if data.len() < ID_LEN {
            return Err(BrokerError::ShortPayload { len: data.len() });
        }
        Ok(Self {
            data: data.into(),
            ack: Arc::new(Notify::new()),
        })
    }

    /// The 16-byte identifier prefix
    pub fn id(&self) -> &[u8] {
        &self.data[..ID_LEN]
    }

    /// The identifier in its canonical wire form
    /// (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`)
    pub fn id_str(&self) -> String {
        let id: [u8; ID_LEN] = self.id().try_into().unwrap_or_default();
        Uuid::from_bytes(id).hyphenated().to_string()
    }

    /// The body bytes (everything after the identifier)
    pub fn body(&self) -> &[u8] {
        &self.data[ID_LEN..]
    }

    /// The full payload as written to the wire: identifier then body
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Signal the ack capability. Never blocks; a missing listener is fine.
    pub fn notify_ack(&self) {
        self.ack.notify_one();
    }

    /// Handle the in-flight watchdog waits on
    pub fn ack_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.ack)
    }

    /// Same payload, fresh ack capability. Used by topic fan-out so each
    /// channel's in-flight tracking is independent.
    pub fn fork(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            ack: Arc::new(Notify::new()),
        }
    }

    /// Replace the ack capability before a requeue so a stale permit from a
    /// cancelled watchdog cannot leak into the next delivery.
    pub fn rearm(&mut self) {
        self.ack = Arc::new(Notify::new());
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id_str())
            .field("body_len", &self.body().len())
            .finish()
    }
}
