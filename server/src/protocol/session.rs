//! Per-connection protocol session
//!
//! A session owns its connection's protocol state; nothing else reads or
//! writes it. The IO loop reads one command line at a time, executes it, and
//! writes the length-prefixed response. A read EOF ends the loop quietly, a
//! write error ends it with a log line, and a channel close kicks the
//! session via its cancellation token.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::{Channel, Consumer, Message, Registry};

use super::command::Command;
use super::{ClientError, ClientState, ProtocolError};

/// Publish one message to a topic. This is the producer entry point shared
/// by TCP `PUB` and HTTP `/put`.
pub async fn publish(
    registry: &Registry,
    topic: &str,
    body: &[u8],
) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ClientError::BadTopic.into());
    }
    if body.is_empty() {
        return Err(ClientError::Invalid.into());
    }
    let topic = registry.get_or_create(topic).await?;
    topic.put(Message::new(body)).await;
    Ok(())
}

/// Consumer handle a session registers with its channel on `SUB`. Closing
/// the channel cancels the token, which ends the session's IO loop.
struct SessionConsumer {
    name: String,
    kick: CancellationToken,
}

impl Consumer for SessionConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.kick.cancel();
    }
}

/// One connection's protocol state machine
pub struct Session {
    name: String,
    state: ClientState,
    registry: Registry,
    channel: Option<Channel>,
    kick: CancellationToken,
}

impl Session {
    pub fn new(name: String, registry: Registry) -> Self {
        Self {
            name,
            state: ClientState::Init,
            registry,
            channel: None,
            kick: CancellationToken::new(),
        }
    }

    /// Drive the connection until EOF, a write error, shutdown, or a kick
    /// from the bound channel. Deregisters the consumer on the way out.
    pub async fn run<S>(mut self, stream: S, mut shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                read = reader.read_line(&mut line) => read,
                _ = self.kick.cancelled() => break,
                _ = shutdown.changed() => break,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(client = %self.name, error = %e, "read failed");
                    break;
                }
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            tracing::trace!(client = %self.name, command = %trimmed, "received command");

            let result = match Command::parse(trimmed) {
                Ok(command) => self.execute(command).await,
                Err(e) => Err(e.into()),
            };
            let written = match result {
                Ok(Some(response)) => write_frame(&mut write_half, &response).await,
                Ok(None) => Ok(()),
                Err(e) => {
                    tracing::debug!(client = %self.name, error = %e, "command failed");
                    write_frame(&mut write_half, e.to_string().as_bytes()).await
                }
            };
            if let Err(e) = written {
                tracing::debug!(client = %self.name, error = %e, "write failed");
                break;
            }
        }

        if let Some(channel) = &self.channel {
            channel.remove_consumer(&self.name).await;
        }
    }

    /// Apply one command to the state machine. A command in the wrong state
    /// is `E_INVALID` and does not transition.
    async fn execute(&mut self, command: Command) -> Result<Option<Vec<u8>>, ProtocolError> {
        match command {
            Command::Sub { topic, channel } => {
                if self.state != ClientState::Init {
                    return Err(ClientError::Invalid.into());
                }
                let topic = self.registry.get_or_create(&topic).await?;
                let channel = topic.get_or_create_channel(&channel).await?;
                channel
                    .add_consumer(Box::new(SessionConsumer {
                        name: self.name.clone(),
                        kick: self.kick.clone(),
                    }))
                    .await;
                self.channel = Some(channel);
                self.state = ClientState::WaitGet;
                Ok(None)
            }
            Command::Get => {
                if self.state != ClientState::WaitGet {
                    return Err(ClientError::Invalid.into());
                }
                let channel = self.channel.as_ref().ok_or(ClientError::Invalid)?;
                let msg = channel.pull().await.ok_or(ClientError::BadMessage)?;
                tracing::debug!(
                    client = %self.name,
                    id = %msg.id_str(),
                    "handing message to client"
                );
                self.state = ClientState::WaitResponse;
                Ok(Some(msg.bytes().to_vec()))
            }
            Command::Fin { id } => {
                if self.state != ClientState::WaitResponse {
                    return Err(ClientError::Invalid.into());
                }
                let channel = self.channel.as_ref().ok_or(ClientError::Invalid)?;
                self.state = ClientState::WaitGet;
                channel.finish(&id).await?;
                Ok(None)
            }
            Command::Req { id } => {
                if self.state != ClientState::WaitResponse {
                    return Err(ClientError::Invalid.into());
                }
                let channel = self.channel.as_ref().ok_or(ClientError::Invalid)?;
                self.state = ClientState::WaitGet;
                channel.requeue(&id).await?;
                Ok(None)
            }
            Command::Pub { topic, body } => {
                if self.state != ClientState::Init {
                    return Err(ClientError::Invalid.into());
                }
                publish(&self.registry, &topic, &body).await?;
                Ok(Some(b"ok".to_vec()))
            }
        }
    }
}

async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}
