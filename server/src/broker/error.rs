//! Error type for broker operations

use thiserror::Error;

/// Error type for operations on registries, topics, channels, and spill
/// queues.
///
/// In-flight errors (`UnknownMessage`) travel back to the protocol engine
/// over the request's reply channel and are written to the client verbatim.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The owning task has shut down and no longer serves requests
    #[error("{0} is closed")]
    Closed(&'static str),

    /// `FIN`/`REQ` named an id the in-flight tracker does not know
    #[error("message ({id}) is not in flight")]
    UnknownMessage { id: String },

    /// Payload shorter than the 16-byte identifier prefix
    #[error("malformed message payload ({len} bytes)")]
    ShortPayload { len: usize },

    /// Spill queue I/O failure
    #[error("spill queue error: {0}")]
    Spill(#[from] std::io::Error),
}
