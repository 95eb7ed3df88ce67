//! Connection — per-browser transport multiplexer.
//!
//! One connection owns one transport and routes every incoming message to
//! the session it belongs to: by `sessionId` (Chromium child targets), by
//! `pageProxyId` (WebKit page proxies), or to the root session when no
//! routing key is present (browser-wide traffic, BiDi's single stream).
//!
//! Teardown is fan-out: when the transport closes — or [`Connection::close`]
//! is called — every registered session is disposed, which rejects all of
//! its pending calls with the connection's close reason.

use crate::session::{RawSend, Session, SessionRoute};
use crate::transport::Transport;
use drover_protocol::WireMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub struct Connection {
    root: Arc<Session>,
    sessions: Mutex<HashMap<Arc<str>, Arc<Session>>>,
    last_id: Arc<AtomicU32>,
    raw_send: RawSend,
    closed: AtomicBool,
    close_reason: String,
}

impl Connection {
    /// Wraps a connected transport and starts the dispatch loop.
    ///
    /// `close_reason` is the error text reported to pending calls when the
    /// connection goes away, e.g. `"Browser has been closed."`.
    pub fn new(mut transport: Transport, close_reason: impl Into<String>) -> Arc<Connection> {
        let close_reason = close_reason.into();
        let mut incoming = transport.take_incoming();
        let transport = Arc::new(transport);
        let raw_send: RawSend = Arc::new({
            let transport = Arc::clone(&transport);
            move |request| {
                let value = serde_json::to_value(&request)?;
                transport.send(value)
            }
        });
        let last_id = Arc::new(AtomicU32::new(0));
        let root = Session::new(
            SessionRoute::Root,
            Arc::clone(&last_id),
            Arc::clone(&raw_send),
            close_reason.clone(),
        );

        let connection = Arc::new(Connection {
            root,
            sessions: Mutex::new(HashMap::new()),
            last_id,
            raw_send,
            closed: AtomicBool::new(false),
            close_reason,
        });

        tokio::spawn({
            let connection = Arc::clone(&connection);
            async move {
                while let Some(message) = incoming.recv().await {
                    match serde_json::from_value::<WireMessage>(message) {
                        Ok(message) => connection.dispatch(message).await,
                        Err(e) => tracing::error!("failed to parse wire message: {e}"),
                    }
                }
                connection.close();
            }
        });

        connection
    }

    /// The browser-wide session.
    pub fn root_session(&self) -> Arc<Session> {
        Arc::clone(&self.root)
    }

    /// Shared request-id counter; message ids are unique per connection, not
    /// per session.
    pub fn id_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.last_id)
    }

    /// Raw request sink writing straight to the transport.
    pub fn raw_send(&self) -> RawSend {
        Arc::clone(&self.raw_send)
    }

    /// Registers a child session routed by the given key.
    ///
    /// The key is the `sessionId` or `pageProxyId` value the browser tags
    /// messages with; which of the two is used on outgoing requests is
    /// determined by `route`.
    pub fn create_session(&self, key: &str, route: SessionRoute) -> Arc<Session> {
        let session = Session::new(
            route,
            Arc::clone(&self.last_id),
            Arc::clone(&self.raw_send),
            "Target closed",
        );
        self.sessions.lock().insert(Arc::from(key), Arc::clone(&session));
        session
    }

    /// Looks up a registered child session.
    pub fn session(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(key).cloned()
    }

    /// Disposes and unregisters a child session.
    pub fn remove_session(&self, key: &str) {
        let session = self.sessions.lock().remove(key);
        if let Some(session) = session {
            session.dispose();
        }
    }

    async fn dispatch(&self, message: WireMessage) {
        let session = match message.route_key() {
            Some(key) => match self.session(key) {
                Some(session) => session,
                None => {
                    // Events can race child-session teardown.
                    tracing::debug!(key, "message for unknown session (ignored)");
                    return;
                }
            },
            None => self.root_session(),
        };
        match message {
            WireMessage::Response(response) => session.handle_response(response),
            WireMessage::Event(event) => session.handle_event(event.method, event.params).await,
            WireMessage::Unknown(value) => {
                tracing::debug!("unknown message shape (ignored): {value}");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the connection down: disposes every session, rejecting all
    /// pending calls with the close reason. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(reason = %self.close_reason, "closing connection");
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.dispose();
        }
        self.root.dispose();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn routes_by_session_id_and_falls_back_to_root() {
        let (transport, harness) = Transport::loopback();
        let connection = Connection::new(transport, "Browser has been closed.");
        let child = connection.create_session("S1", SessionRoute::SessionId("S1".into()));

        let mut root_events = connection.root_session().subscribe();
        let mut child_events = child.subscribe();

        harness.deliver(json!({"method": "Target.targetCreated", "params": {}}));
        harness.deliver(json!({"method": "Page.frameAttached", "params": {}, "sessionId": "S1"}));

        assert_eq!(root_events.recv().await.unwrap().method, "Target.targetCreated");
        assert_eq!(child_events.recv().await.unwrap().method, "Page.frameAttached");
    }

    #[tokio::test]
    async fn transport_close_rejects_pending_calls_on_all_sessions() {
        let (transport, mut harness) = Transport::loopback();
        let connection = Connection::new(transport, "Browser has been closed.");
        let child = connection.create_session("S1", SessionRoute::SessionId("S1".into()));

        let root_call = tokio::spawn({
            let session = connection.root_session();
            async move { session.send("Browser.getVersion", serde_json::Value::Null).await }
        });
        let child_call = tokio::spawn({
            let session = Arc::clone(&child);
            async move { session.send("Runtime.evaluate", serde_json::Value::Null).await }
        });
        harness.next_sent().await.unwrap();
        harness.next_sent().await.unwrap();

        harness.close();

        let root_err = root_call.await.unwrap().unwrap_err();
        let child_err = child_call.await.unwrap().unwrap_err();
        assert!(root_err.is_target_closed());
        assert!(child_err.is_target_closed());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_ignored() {
        let (transport, harness) = Transport::loopback();
        let connection = Connection::new(transport, "Browser has been closed.");
        let mut root_events = connection.root_session().subscribe();

        harness.deliver(json!({"method": "Page.loadEventFired", "params": {}, "sessionId": "GONE"}));
        harness.deliver(json!({"method": "Target.targetInfoChanged", "params": {}}));

        // Only the root-routed event arrives.
        assert_eq!(
            root_events.recv().await.unwrap().method,
            "Target.targetInfoChanged"
        );
    }

    #[tokio::test]
    async fn remove_session_disposes_it() {
        let (transport, _harness) = Transport::loopback();
        let connection = Connection::new(transport, "Browser has been closed.");
        let child = connection.create_session("S1", SessionRoute::SessionId("S1".into()));
        connection.remove_session("S1");
        assert!(child.is_disposed());
        assert!(connection.session("S1").is_none());
    }
}
