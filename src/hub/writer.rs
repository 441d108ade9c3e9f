//! Client writer task
//!
//! Drains a client's outbox onto its connection in FIFO order. The socket
//! itself is abstracted behind [`MessageSink`] so the transport (WebSocket,
//! SSE, a test channel) stays outside this crate.

use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::client::{Client, Outbox};

/// Destination for encoded frames of one connection
pub trait MessageSink: Send {
    /// Write one frame
    fn send(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush and close the connection after the last frame
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        async { Ok(()) }
    }
}

impl MessageSink for mpsc::Sender<Bytes> {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))
    }
}

/// Drain `outbox` into `sink` until the client closes or the sink fails
///
/// Messages are encoded here, one client at a time, so an encoding failure
/// only affects the message and connection it belongs to.
pub async fn run_writer<S: MessageSink>(client: Arc<Client>, mut outbox: Outbox, mut sink: S) {
    let mut frames = 0u64;

    while let Some(message) = outbox.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    client_id = client.id(),
                    kind = message.kind(),
                    error = %e,
                    "Failed to encode message, skipping"
                );
                continue;
            }
        };

        if let Err(e) = sink.send(frame).await {
            tracing::debug!(client_id = client.id(), error = %e, "Connection write failed");
            let _ = client.close();
            break;
        }
        frames += 1;
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(client_id = client.id(), error = %e, "Connection close failed");
    }

    tracing::debug!(
        client_id = client.id(),
        user = %client.user_id(),
        frames = frames,
        "Client writer stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::message::OutboundMessage;

    #[tokio::test]
    async fn test_writer_drains_in_order_then_stops() {
        let (client, outbox) = Client::new("u1", "alice", "r1", 8);
        let (sink, mut frames) = mpsc::channel::<Bytes>(8);
        let writer = tokio::spawn(run_writer(Arc::clone(&client), outbox, sink));

        client.send(OutboundMessage::ViewerCount { count: 1 }).await.unwrap();
        client.send(OutboundMessage::Expired).await.unwrap();
        client.close().unwrap();

        assert_eq!(&frames.recv().await.unwrap()[..], br#"{"type":"viewer_count","count":1}"#);
        assert_eq!(&frames.recv().await.unwrap()[..], br#"{"type":"expired"}"#);

        writer.await.unwrap();
        assert!(frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_closes_client_on_sink_failure() {
        let (client, outbox) = Client::new("u1", "alice", "r1", 8);
        let (sink, frames) = mpsc::channel::<Bytes>(1);
        drop(frames);

        let writer = tokio::spawn(run_writer(Arc::clone(&client), outbox, sink));
        client.send(OutboundMessage::Expired).await.unwrap();
        writer.await.unwrap();

        assert!(client.is_closed());
    }
}
