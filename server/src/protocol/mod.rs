//! Line-oriented command protocol
//!
//! Translates a line-oriented command stream (`SUB`, `GET`, `FIN`, `REQ`,
//! `PUB`) into operations on topics and channels, and drives the
//! per-connection state machine:
//!
//! ```text
//! Init --SUB--> WaitGet --GET--> WaitResponse --FIN/REQ--> WaitGet
//! ```
//!
//! `PUB` is the producer entry point; it is accepted in `Init` and never
//! transitions, so a producer connection stays a producer. Commands arriving
//! in the wrong state are answered with `E_INVALID` and do not transition.
//!
//! Responses (message payloads, `ok`, and error strings) are framed with a
//! 4-byte big-endian length prefix.

use thiserror::Error;

use crate::broker::BrokerError;

mod command;
mod session;

pub use command::Command;
pub use session::{Session, publish};

/// Per-connection protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Just connected; may subscribe or publish
    Init,
    /// Subscribed; expecting `GET`
    WaitGet,
    /// A message has been handed out; expecting `FIN` or `REQ`
    WaitResponse,
}

/// Errors reported to clients as wire code strings
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    /// Malformed command, wrong state, or unknown verb
    #[error("E_INVALID")]
    Invalid,
    /// Empty topic name
    #[error("E_BAD_TOPIC")]
    BadTopic,
    /// Empty channel name
    #[error("E_BAD_CHANNEL")]
    BadChannel,
    /// Pull came back empty (only possible during shutdown)
    #[error("E_BAD_MESSAGE")]
    BadMessage,
}

/// Anything a command can fail with. The `Display` form is what goes on the
/// wire.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
