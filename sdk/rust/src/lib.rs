//! # Carrier
//!
//! Client SDK for the **Carrier** message broker — publish to topics and
//! consume from named channels over the broker's line protocol.
//!
//! Responses from the broker are framed with a 4-byte big-endian length
//! prefix; commands are single lines, so message bodies must not contain
//! newlines.
//!
//! ## Producing
//!
//! ```no_run
//! # async fn demo() -> Result<(), carrier::ClientError> {
//! let mut producer = carrier::Producer::connect("127.0.0.1:5150").await?;
//! producer.publish("scores", b"hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Consuming
//!
//! ```no_run
//! # async fn demo() -> Result<(), carrier::ClientError> {
//! let mut consumer =
//!     carrier::Consumer::subscribe("127.0.0.1:5150", "scores", "default").await?;
//! loop {
//!     let delivery = consumer.next().await?;
//!     println!("{}: {:?}", delivery.id, delivery.body);
//!     consumer.finish(&delivery.id).await?;
//! }
//! # }
//! ```

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use uuid::Uuid;

/// Length of the identifier prefix on every delivered message
const ID_LEN: usize = 16;

/// Errors surfaced by the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker answered with an error line (e.g. `E_BAD_TOPIC`, or an
    /// in-flight tracker message)
    #[error("broker replied: {0}")]
    Broker(String),

    /// Empty topic or channel name, caught before hitting the wire
    #[error("topic and channel names cannot be empty")]
    EmptyName,

    /// Commands are single lines; bodies with newlines cannot be framed
    #[error("message bodies cannot contain newlines")]
    NewlineInBody,
}

/// One message pulled from a channel
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Canonical id, used for [`Consumer::finish`] / [`Consumer::requeue`]
    pub id: String,
    /// Message body
    pub body: Vec<u8>,
}

async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Vec<u8>, ClientError> {
    let len = reader.read_u32().await?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &[u8]) -> Result<(), ClientError> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Producer connection. Each [`publish`](Producer::publish) is confirmed by
/// the broker before the call returns.
pub struct Producer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Producer {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Publish one message to a topic.
    pub async fn publish(&mut self, topic: &str, body: &[u8]) -> Result<(), ClientError> {
        if topic.is_empty() {
            return Err(ClientError::EmptyName);
        }
        if body.contains(&b'\n') {
            return Err(ClientError::NewlineInBody);
        }

        let mut line = format!("PUB {topic} ").into_bytes();
        line.extend_from_slice(body);
        write_line(&mut self.writer, &line).await?;

        let reply = read_frame(&mut self.reader).await?;
        if reply == b"ok" {
            Ok(())
        } else {
            Err(ClientError::Broker(
                String::from_utf8_lossy(&reply).into_owned(),
            ))
        }
    }
}

/// Consumer connection bound to one topic/channel pair.
///
/// `FIN`/`REQ` get no reply on success, so [`finish`](Consumer::finish) and
/// [`requeue`](Consumer::requeue) return once the command is written; a
/// rejection arrives as an error on the next [`next`](Consumer::next) call.
#[derive(Debug)]
pub struct Consumer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Consumer {
    /// Connect and bind to `channel` on `topic`.
    pub async fn subscribe(
        addr: impl ToSocketAddrs,
        topic: &str,
        channel: &str,
    ) -> Result<Self, ClientError> {
        if topic.is_empty() || channel.is_empty() {
            return Err(ClientError::EmptyName);
        }

        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut writer) = stream.into_split();
        write_line(&mut writer, format!("SUB {topic} {channel}").as_bytes()).await?;

        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Pull the next message. Blocks until the broker has one.
    pub async fn next(&mut self) -> Result<Delivery, ClientError> {
        write_line(&mut self.writer, b"GET").await?;

        let payload = read_frame(&mut self.reader).await?;
        if payload.len() < ID_LEN {
            // too short to be a delivery: an error line from this GET or a
            // preceding FIN/REQ
            return Err(ClientError::Broker(
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }

        let id: [u8; ID_LEN] = payload[..ID_LEN]
            .try_into()
            .unwrap_or_default();
        Ok(Delivery {
            id: Uuid::from_bytes(id).hyphenated().to_string(),
            body: payload[ID_LEN..].to_vec(),
        })
    }

    /// Acknowledge a delivery.
    pub async fn finish(&mut self, id: &str) -> Result<(), ClientError> {
        tracing::trace!(id = %id, "finishing message");
        write_line(&mut self.writer, format!("FIN {id}").as_bytes()).await
    }

    /// Push a delivery back to the channel for redelivery.
    pub async fn requeue(&mut self, id: &str) -> Result<(), ClientError> {
        tracing::trace!(id = %id, "requeueing message");
        write_line(&mut self.writer, format!("REQ {id}").as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_u32(payload.len() as u32).await.unwrap();
        stream.write_all(payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "PUB scores hello\n");
            write_half.write_u32(2).await.unwrap();
            write_half.write_all(b"ok").await.unwrap();
        });

        let mut producer = Producer::connect(addr).await.unwrap();
        producer.publish("scores", b"hello").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_surfaces_broker_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut scratch = vec![0u8; 64];
            let _ = stream.read(&mut scratch).await.unwrap();
            write_frame(&mut stream, b"E_BAD_TOPIC").await;
        });

        let mut producer = Producer::connect(addr).await.unwrap();
        let err = producer.publish("scores", b"hello").await.unwrap_err();
        assert!(matches!(err, ClientError::Broker(code) if code == "E_BAD_TOPIC"));
    }

    #[tokio::test]
    async fn test_publish_rejects_newline_body() {
        // never touches the wire, so a dead listener is fine
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut producer = Producer::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let err = producer.publish("scores", b"two\nlines").await.unwrap_err();
        assert!(matches!(err, ClientError::NewlineInBody));
    }

    #[tokio::test]
    async fn test_next_parses_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let id = Uuid::new_v4();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "SUB scores default\n");
            line.clear();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "GET\n");

            let mut payload = id.as_bytes().to_vec();
            payload.extend_from_slice(b"hello");
            write_half
                .write_u32(payload.len() as u32)
                .await
                .unwrap();
            write_half.write_all(&payload).await.unwrap();
        });

        let mut consumer = Consumer::subscribe(addr, "scores", "default").await.unwrap();
        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.id, id.hyphenated().to_string());
        assert_eq!(delivery.body, b"hello");
    }

    #[tokio::test]
    async fn test_next_surfaces_error_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            line.clear();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "GET\n");
            write_half.write_u32(13).await.unwrap();
            write_half.write_all(b"E_BAD_MESSAGE").await.unwrap();
        });

        let mut consumer = Consumer::subscribe(addr, "scores", "default").await.unwrap();
        let err = consumer.next().await.unwrap_err();
        assert!(matches!(err, ClientError::Broker(code) if code == "E_BAD_MESSAGE"));
    }

    #[tokio::test]
    async fn test_finish_and_requeue_write_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, _write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half);
            let mut seen = Vec::new();
            for _ in 0..3 {
                let mut line = String::new();
                lines.read_line(&mut line).await.unwrap();
                seen.push(line);
            }
            seen
        });

        let mut consumer = Consumer::subscribe(addr, "scores", "default").await.unwrap();
        consumer
            .finish("27b80249-2f05-42e9-a382-f27d00e72b3e")
            .await
            .unwrap();
        consumer
            .requeue("27b80249-2f05-42e9-a382-f27d00e72b3e")
            .await
            .unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[0], "SUB scores default\n");
        assert_eq!(seen[1], "FIN 27b80249-2f05-42e9-a382-f27d00e72b3e\n");
        assert_eq!(seen[2], "REQ 27b80249-2f05-42e9-a382-f27d00e72b3e\n");
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_names() {
        let err = Consumer::subscribe("127.0.0.1:1", "", "default")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyName));
    }
}
