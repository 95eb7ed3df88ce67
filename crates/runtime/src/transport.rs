//! Message transport to the browser process.
//!
//! A transport is a pair of JSON message streams: outbound requests and
//! inbound responses/events. Real browsers are reached over a WebSocket;
//! tests use an in-memory loopback pair that lets the test act as the
//! browser side of the wire.

use crate::error::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// A connected message transport.
///
/// The writer half is cloneable; the reader half is taken exactly once by
/// the connection's dispatch loop.
pub struct Transport {
    outgoing: mpsc::UnboundedSender<Value>,
    incoming: Option<mpsc::UnboundedReceiver<Value>>,
}

impl Transport {
    /// Connects to a browser's remote-debugging WebSocket endpoint.
    ///
    /// Spawns a reader and a writer task; dropping all senders or the remote
    /// closing the socket ends both, which the connection observes as the
    /// incoming stream closing.
    pub async fn websocket(url: &str) -> Result<Transport> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Value>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let text = message.to_string();
                tracing::trace!(target: "drover::wire", "SEND ► {text}");
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::error!("transport write error: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target: "drover::wire", "◀ RECV {text}");
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => {
                                if incoming_tx.send(value).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::error!("failed to parse message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // incoming_tx drops here; the dispatch loop sees end-of-stream.
        });

        Ok(Transport {
            outgoing,
            incoming: Some(incoming),
        })
    }

    /// Creates an in-memory transport plus a harness representing the
    /// browser side. Messages sent through the transport appear on the
    /// harness, and vice versa.
    pub fn loopback() -> (Transport, TransportHarness) {
        let (outgoing, sent) = mpsc::unbounded_channel();
        let (inject, incoming) = mpsc::unbounded_channel();
        (
            Transport {
                outgoing,
                incoming: Some(incoming),
            },
            TransportHarness { sent, inject },
        )
    }

    /// Queues a message for the browser. Fails once the writer is gone.
    pub fn send(&self, message: Value) -> Result<()> {
        self.outgoing.send(message).map_err(|_| Error::ChannelClosed)
    }

    /// Takes the inbound stream. Panics if called twice.
    pub(crate) fn take_incoming(&mut self) -> mpsc::UnboundedReceiver<Value> {
        self.incoming
            .take()
            .expect("transport incoming stream already taken")
    }
}

/// The browser side of a loopback transport, for tests.
pub struct TransportHarness {
    /// Messages the client sent.
    pub sent: mpsc::UnboundedReceiver<Value>,
    inject: mpsc::UnboundedSender<Value>,
}

impl TransportHarness {
    /// Delivers a message to the client as if the browser sent it.
    pub fn deliver(&self, message: Value) {
        let _ = self.inject.send(message);
    }

    /// A cloneable handle for delivering messages; lets a test keep
    /// injecting events after the harness moved into a responder task.
    pub fn injector(&self) -> mpsc::UnboundedSender<Value> {
        self.inject.clone()
    }

    /// Waits for the next message the client sent.
    pub async fn next_sent(&mut self) -> Option<Value> {
        self.sent.recv().await
    }

    /// Simulates the browser closing the connection.
    pub fn close(self) {
        drop(self.inject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn loopback_round_trip() {
        let (mut transport, mut harness) = Transport::loopback();

        transport.send(json!({"id": 1, "method": "Page.enable"})).unwrap();
        let sent = harness.next_sent().await.unwrap();
        assert_eq!(sent["method"], "Page.enable");

        harness.deliver(json!({"id": 1, "result": {}}));
        let mut incoming = transport.take_incoming();
        let received = incoming.recv().await.unwrap();
        assert_eq!(received["id"], 1);
    }

    #[tokio::test]
    async fn harness_close_ends_incoming_stream() {
        let (mut transport, harness) = Transport::loopback();
        let mut incoming = transport.take_incoming();
        harness.close();
        assert!(incoming.recv().await.is_none());
    }
}
