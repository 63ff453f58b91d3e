//! Command parsing
//!
//! One line, space-separated tokens, verb first. The parser is the explicit
//! half of the dispatch table; [`Session::execute`](super::Session) is the
//! other half, so the state/command matrix is closed at compile time.

use super::ClientError;

/// A parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `SUB <topic> <channel>` — bind this connection to a channel
    Sub { topic: String, channel: String },
    /// `GET` — pull one message
    Get,
    /// `FIN <id>` — acknowledge a delivered message
    Fin { id: String },
    /// `REQ <id>` — push a delivered message back to the channel
    Req { id: String },
    /// `PUB <topic> <body>` — publish; the body is the remainder of the line
    Pub { topic: String, body: Vec<u8> },
}

impl Command {
    /// Parse one line (terminator already stripped).
    pub fn parse(line: &str) -> Result<Self, ClientError> {
        let verb = line.split(' ').next().unwrap_or("");
        match verb {
            "SUB" => {
                let params: Vec<&str> = line.split(' ').collect();
                if params.len() < 3 {
                    return Err(ClientError::Invalid);
                }
                if params[1].is_empty() {
                    return Err(ClientError::BadTopic);
                }
                if params[2].is_empty() {
                    return Err(ClientError::BadChannel);
                }
                Ok(Command::Sub {
                    topic: params[1].to_string(),
                    channel: params[2].to_string(),
                })
            }
            "GET" => Ok(Command::Get),
            "FIN" | "REQ" => {
                let params: Vec<&str> = line.split(' ').collect();
                if params.len() < 2 {
                    return Err(ClientError::Invalid);
                }
                let id = params[1].to_string();
                if verb == "FIN" {
                    Ok(Command::Fin { id })
                } else {
                    Ok(Command::Req { id })
                }
            }
            "PUB" => {
                let mut params = line.splitn(3, ' ');
                params.next();
                let topic = params.next().ok_or(ClientError::Invalid)?;
                let body = params.next().ok_or(ClientError::Invalid)?;
                if topic.is_empty() {
                    return Err(ClientError::BadTopic);
                }
                Ok(Command::Pub {
                    topic: topic.to_string(),
                    body: body.as_bytes().to_vec(),
                })
            }
            _ => Err(ClientError::Invalid),
        }
    }
}
