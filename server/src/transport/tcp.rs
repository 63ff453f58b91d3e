//! TCP transport
//!
//! Accepts connections and runs one protocol session task per connection.
//! The session owns the connection; when it exits (EOF, write error, kick,
//! shutdown) the connection drops and the consumer is deregistered from its
//! channel by the session itself.

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::broker::Registry;
use crate::protocol::Session;

/// Run the accept loop until shutdown.
pub async fn serve(
    listener: TcpListener,
    registry: Registry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "listening for clients");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let session = Session::new(peer.to_string(), registry.clone());
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tracing::debug!(client = %peer, "client connected");
                        session.run(stream, shutdown).await;
                        tracing::debug!(client = %peer, "client disconnected");
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }

    tracing::debug!("tcp listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::broker::BrokerOptions;

    use super::*;

    #[tokio::test]
    async fn test_serves_sessions_until_shutdown() {
        let registry = Registry::start(BrokerOptions::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, registry, shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"BOGUS\n").await.unwrap();
        let len = client.read_u32().await.unwrap();
        let mut payload = vec![0u8; len as usize];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, b"E_INVALID");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("accept loop should stop on shutdown")
            .unwrap()
            .unwrap();
    }
}
