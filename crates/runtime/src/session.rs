//! Session — request/response correlation scope on one connection.
//!
//! A session is the unit of protocol addressing: browser-wide, or scoped to
//! one target/browsing context. It assigns request ids from the connection's
//! shared counter, parks each caller on a oneshot slot until the matching
//! response arrives, and fans unsolicited events out to subscribers over
//! bounded channels.
//!
//! # Ordering
//!
//! Events and responses for one session are handled strictly in arrival
//! order by the connection's dispatch loop. Handlers must never assume an
//! event lands in the same tick as the command that triggered it; delivery
//! is always through a queue.
//!
//! # Disposal
//!
//! Disposal is idempotent and safe to invoke from an event handler. Every
//! still-pending call is rejected with an error naming the original method,
//! and subscribers see their stream end.

use crate::error::{Error, Result};
use drover_protocol::{WireRequest, WireResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{mpsc, oneshot};

/// How requests sent through a session are tagged on the wire.
#[derive(Debug, Clone)]
pub enum SessionRoute {
    /// No routing tag: the root (browser-wide) scope, or a protocol with a
    /// single stream per page.
    Root,
    /// Chromium-style flat child session, tagged with `sessionId`.
    SessionId(String),
    /// WebKit-style page proxy, tagged with `pageProxyId`.
    PageProxyId(String),
}

/// One unsolicited protocol event.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub method: String,
    pub params: Value,
}

struct PendingCall {
    tx: oneshot::Sender<Result<Value>>,
    method: String,
}

type Callbacks = Arc<Mutex<HashMap<u32, PendingCall>>>;

/// Raw message sink a session writes requests into. The connection supplies
/// one that goes straight to the transport; nested sessions (WebKit targets)
/// supply one that wraps the request into an envelope command.
pub type RawSend = Arc<dyn Fn(WireRequest) -> Result<()> + Send + Sync>;

/// Number of events a subscriber may lag behind before the dispatch loop
/// applies backpressure.
const EVENT_QUEUE_DEPTH: usize = 256;

pub struct Session {
    route: SessionRoute,
    last_id: Arc<AtomicU32>,
    raw_send: RawSend,
    callbacks: Callbacks,
    subscribers: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    disposed: AtomicBool,
    crashed: AtomicBool,
    /// Reason reported to callers once the session is gone.
    error_text: String,
}

impl Session {
    pub fn new(
        route: SessionRoute,
        last_id: Arc<AtomicU32>,
        raw_send: RawSend,
        error_text: impl Into<String>,
    ) -> Arc<Session> {
        Arc::new(Session {
            route,
            last_id,
            raw_send,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            error_text: error_text.into(),
        })
    }

    /// Sends a protocol call and awaits its response.
    ///
    /// The pending slot is removed if the returned future is dropped, so a
    /// caller-side timeout never leaks the slot.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(Error::TargetCrashed);
        }
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::TargetClosed {
                method: method.to_string(),
                reason: self.error_text.clone(),
            });
        }

        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().insert(
            id,
            PendingCall {
                tx,
                method: method.to_string(),
            },
        );
        let mut guard = CallGuard {
            id,
            callbacks: Arc::clone(&self.callbacks),
            completed: false,
        };

        let mut request = WireRequest {
            id,
            method: method.to_string(),
            params,
            session_id: None,
            page_proxy_id: None,
        };
        match &self.route {
            SessionRoute::Root => {}
            SessionRoute::SessionId(sid) => request.session_id = Some(sid.clone()),
            SessionRoute::PageProxyId(pid) => request.page_proxy_id = Some(pid.clone()),
        }

        tracing::debug!(id, method, "sending protocol call");
        if let Err(e) = (self.raw_send)(request) {
            // Slot cleanup happens via the guard.
            return Err(e);
        }

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ChannelClosed),
        };
        guard.completed = true;
        result
    }

    /// Like [`send`](Self::send), but degrades failures attributable to the
    /// target going away into a void success. Used for calls that race
    /// target closure (releasing handles, best-effort world provisioning).
    /// Other protocol errors still propagate.
    pub async fn send_may_fail(&self, method: &str, params: Value) -> Result<Value> {
        match self.send(method, params).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_target_closed() || is_closure_message(&e) => {
                tracing::debug!(method, error = %e, "ignoring failure against closing target");
                Ok(Value::Null)
            }
            Err(e) => Err(e),
        }
    }

    /// Subscribes to this session's event stream.
    ///
    /// Events are delivered in arrival order. The stream ends when the
    /// session is disposed.
    pub fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Routes an incoming response to the caller that sent the request.
    ///
    /// A response for an unknown id is only expected after disposal (the
    /// browser may answer a call we already rejected); anything else is
    /// logged and dropped.
    pub fn handle_response(&self, response: WireResponse) {
        let pending = self.callbacks.lock().remove(&response.id);
        let Some(pending) = pending else {
            if !self.disposed.load(Ordering::SeqCst) {
                tracing::debug!(id = response.id, "response for unknown call id");
            }
            return;
        };
        let result = match response.error_message() {
            Some(message) => Err(Error::from_protocol(&pending.method, message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = pending.tx.send(result);
    }

    /// Fans an event out to subscribers, applying backpressure when a
    /// subscriber's queue is full. Dead subscribers are pruned.
    pub async fn handle_event(&self, method: String, params: Value) {
        let subscribers: Vec<_> = self.subscribers.lock().clone();
        let mut dead = false;
        for tx in &subscribers {
            if tx
                .send(SessionEvent {
                    method: method.clone(),
                    params: params.clone(),
                })
                .await
                .is_err()
            {
                dead = true;
            }
        }
        if dead {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
    }

    /// Marks the target as crashed; every subsequent send fails fast.
    pub fn mark_crashed(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Rejects every pending call and ends subscriber streams. Idempotent,
    /// and safe to call from within an event handler.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<PendingCall> = {
            let mut callbacks = self.callbacks.lock();
            callbacks.drain().map(|(_, call)| call).collect()
        };
        for call in pending {
            let method = call.method;
            let _ = call.tx.send(Err(Error::TargetClosed {
                method,
                reason: self.error_text.clone(),
            }));
        }
        self.subscribers.lock().clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("route", &self.route)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Removes the pending slot if the caller's future is dropped before the
/// response arrives (timeout or cancellation).
struct CallGuard {
    id: u32,
    callbacks: Callbacks,
    completed: bool,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.callbacks.lock().remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "removed orphaned pending call");
        }
    }
}

/// Protocol error messages that mean the target went away mid-call.
fn is_closure_message(error: &Error) -> bool {
    let Error::Protocol { message, .. } = error else {
        return false;
    };
    let lower = message.to_ascii_lowercase();
    lower.contains("target closed")
        || lower.contains("session closed")
        || lower.contains("session with given id not found")
        || lower.contains("no such browsing context")
        || lower.contains("target was swapped out")
}
