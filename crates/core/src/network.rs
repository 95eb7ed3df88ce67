// Copyright 2024 Paul Adamson
// Licensed under the Apache License, Version 2.0

//! Network request correlation shared by all backends.
//!
//! The tracker keeps an index of active requests keyed by protocol request
//! id and links HTTP redirects into a chain. The index invariant: exactly
//! one request per chain is active at any time. A redirect completion keeps
//! its request indexed (the continuation will claim it as predecessor);
//! only a terminal, non-redirect completion or a fetch error removes the
//! entry. Superseded hops stay reachable through the chain pointers.
//!
//! Response bodies are never buffered eagerly — some backends cannot
//! provide a body for redirected or aborted requests at all, so retrieval
//! is a deferred accessor that fails descriptively instead of returning an
//! empty buffer.

use drover_protocol::{DocumentId, FrameId, Header, RequestId, ResourceTiming};
use drover_runtime::Result;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Deferred body accessor attached to a response.
pub type BodyFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// Backend-normalized description of a request the browser is sending.
pub struct RequestPayload {
    pub id: RequestId,
    /// Frame named by the event; ignored for redirect continuations, which
    /// inherit the chain's frame.
    pub frame: Option<FrameId>,
    pub url: String,
    pub method: String,
    /// Document generation when this request is a navigation.
    pub document: Option<DocumentId>,
    /// True when this request continues a redirect chain.
    pub is_redirect_continuation: bool,
    pub headers: Vec<Header>,
    pub post_data: Option<Vec<u8>>,
    /// Wall-clock start, seconds since the unix epoch.
    pub start_time: f64,
}

/// Failure marker of a request that did not complete.
#[derive(Debug, Clone)]
pub struct RequestFailure {
    pub error_text: String,
    /// True when the client aborted the request, as opposed to a network
    /// failure; callers branch on this for retry logic.
    pub canceled: bool,
}

/// A response attached to a tracked request.
pub struct TrackedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<Header>,
    pub timing: ResourceTiming,
    body: BodyFetcher,
    transfer_size: Mutex<Option<f64>>,
    /// Seconds relative to request start; `-1` when the request failed.
    response_end: Mutex<Option<f64>>,
}

impl TrackedResponse {
    pub fn new(
        status: u16,
        status_text: String,
        headers: Vec<Header>,
        timing: ResourceTiming,
        body: BodyFetcher,
    ) -> TrackedResponse {
        TrackedResponse {
            status,
            status_text,
            headers,
            timing,
            body,
            transfer_size: Mutex::new(None),
            response_end: Mutex::new(None),
        }
    }

    pub fn is_redirect(&self) -> bool {
        (300..=399).contains(&self.status)
    }

    /// Retrieves the response body from the browser.
    pub async fn body(&self) -> Result<Vec<u8>> {
        (self.body)().await
    }

    pub fn set_transfer_size(&self, size: Option<f64>) {
        *self.transfer_size.lock() = size;
    }

    pub fn transfer_size(&self) -> Option<f64> {
        *self.transfer_size.lock()
    }

    pub fn finish(&self, response_end: f64) {
        *self.response_end.lock() = Some(response_end);
    }

    pub fn response_end(&self) -> Option<f64> {
        *self.response_end.lock()
    }
}

impl std::fmt::Debug for TrackedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// One HTTP(S) exchange, possibly a hop in a redirect chain.
#[derive(Debug)]
pub struct TrackedRequest {
    pub id: RequestId,
    pub frame: FrameId,
    pub url: String,
    pub method: String,
    pub document: Option<DocumentId>,
    pub headers: Vec<Header>,
    pub post_data: Option<Vec<u8>>,
    pub start_time: f64,
    redirected_from: Option<Arc<TrackedRequest>>,
    response: Mutex<Option<Arc<TrackedResponse>>>,
    failure: Mutex<Option<RequestFailure>>,
}

impl TrackedRequest {
    /// The hop this request was redirected from, if any.
    pub fn redirected_from(&self) -> Option<Arc<TrackedRequest>> {
        self.redirected_from.clone()
    }

    /// Number of redirect hops before this request.
    pub fn redirect_chain_len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.redirected_from();
        while let Some(prev) = cursor {
            n += 1;
            cursor = prev.redirected_from();
        }
        n
    }

    pub fn response(&self) -> Option<Arc<TrackedResponse>> {
        self.response.lock().clone()
    }

    pub fn failure(&self) -> Option<RequestFailure> {
        self.failure.lock().clone()
    }
}

/// Active-request index plus redirect-chain linking.
#[derive(Default)]
pub struct NetworkTracker {
    active: Mutex<HashMap<RequestId, Arc<TrackedRequest>>>,
}

impl NetworkTracker {
    pub fn new() -> NetworkTracker {
        NetworkTracker::default()
    }

    /// Registers a request the browser is about to send.
    ///
    /// For a redirect continuation the predecessor is unlinked from the
    /// active index (it stays reachable through the chain) and its frame is
    /// inherited. Returns `None` when no owning frame can be resolved —
    /// the event then concerns a target this page does not track.
    pub fn request_will_be_sent(&self, payload: RequestPayload) -> Option<Arc<TrackedRequest>> {
        let mut active = self.active.lock();
        let redirected_from = if payload.is_redirect_continuation {
            active.remove(&payload.id)
        } else {
            None
        };
        let frame = match &redirected_from {
            Some(prev) => prev.frame.clone(),
            None => payload.frame?,
        };
        let request = Arc::new(TrackedRequest {
            id: payload.id.clone(),
            frame,
            url: payload.url,
            method: payload.method,
            document: payload
                .document
                .or_else(|| redirected_from.as_ref().and_then(|r| r.document.clone())),
            headers: payload.headers,
            post_data: payload.post_data,
            start_time: payload.start_time,
            redirected_from,
            response: Mutex::new(None),
            failure: Mutex::new(None),
        });
        active.insert(payload.id, Arc::clone(&request));
        Some(request)
    }

    /// Attaches a response to its request. Races with request finalization
    /// are expected; an unknown id returns `None` and is dropped silently.
    pub fn response_received(
        &self,
        id: &RequestId,
        response: TrackedResponse,
    ) -> Option<(Arc<TrackedRequest>, Arc<TrackedResponse>)> {
        let request = self.active.lock().get(id).cloned()?;
        let response = Arc::new(response);
        *request.response.lock() = Some(Arc::clone(&response));
        Some((request, response))
    }

    /// Finalizes a completed transfer. A redirect completion keeps the
    /// request in the active index for its continuation; a terminal
    /// completion removes it.
    pub fn request_finished(
        &self,
        id: &RequestId,
        response_end: f64,
        transfer_size: Option<f64>,
    ) -> Option<Arc<TrackedRequest>> {
        let mut active = self.active.lock();
        let request = active.get(id).cloned()?;
        let is_redirect = request
            .response()
            .is_some_and(|response| response.is_redirect());
        if !is_redirect {
            active.remove(id);
        }
        drop(active);
        if let Some(response) = request.response() {
            response.set_transfer_size(transfer_size);
            response.finish(response_end);
        }
        Some(request)
    }

    /// Finalizes a failed request and removes it from the active index.
    pub fn request_failed(
        &self,
        id: &RequestId,
        error_text: String,
        canceled: bool,
    ) -> Option<Arc<TrackedRequest>> {
        let request = self.active.lock().remove(id)?;
        if let Some(response) = request.response() {
            response.set_transfer_size(None);
            response.finish(-1.0);
        }
        *request.failure.lock() = Some(RequestFailure {
            error_text,
            canceled,
        });
        Some(request)
    }

    pub fn get(&self, id: &RequestId) -> Option<Arc<TrackedRequest>> {
        self.active.lock().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_runtime::Error;

    fn unavailable_body() -> BodyFetcher {
        Arc::new(|| {
            Box::pin(async {
                Err(Error::Protocol {
                    method: "Network.getResponseBody".to_string(),
                    message: "No resource with given identifier".to_string(),
                })
            })
        })
    }

    fn payload(id: &str, frame: Option<&str>, redirect: bool) -> RequestPayload {
        RequestPayload {
            id: Arc::from(id),
            frame: frame.map(Arc::from),
            url: format!("http://x/{id}"),
            method: "GET".to_string(),
            document: None,
            is_redirect_continuation: redirect,
            headers: Vec::new(),
            post_data: None,
            start_time: 1000.0,
        }
    }

    fn redirect_response(status: u16) -> TrackedResponse {
        TrackedResponse::new(
            status,
            "".to_string(),
            Vec::new(),
            ResourceTiming::unavailable(1000.0),
            unavailable_body(),
        )
    }

    #[test]
    fn redirect_chain_keeps_one_active_entry() {
        let tracker = NetworkTracker::new();

        // Hop 1: original request, gets a 302.
        tracker
            .request_will_be_sent(payload("r1", Some("F"), false))
            .unwrap();
        tracker.response_received(&Arc::from("r1"), redirect_response(302));
        tracker.request_finished(&Arc::from("r1"), 0.05, Some(120.0));
        assert_eq!(tracker.active_count(), 1);

        // Hop 2: continuation under the same protocol id.
        let hop2 = tracker
            .request_will_be_sent(payload("r1", None, true))
            .unwrap();
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(hop2.redirect_chain_len(), 1);
        assert_eq!(hop2.frame.as_ref(), "F");

        // Hop 3.
        tracker.response_received(&Arc::from("r1"), redirect_response(301));
        tracker.request_finished(&Arc::from("r1"), 0.04, None);
        let hop3 = tracker
            .request_will_be_sent(payload("r1", None, true))
            .unwrap();
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(hop3.redirect_chain_len(), 2);

        // Walking the chain from the terminal request reaches the original.
        let first = hop3.redirected_from().unwrap().redirected_from().unwrap();
        assert!(first.redirected_from().is_none());

        // Terminal completion empties the index.
        tracker.response_received(&Arc::from("r1"), redirect_response(200));
        tracker.request_finished(&Arc::from("r1"), 0.2, Some(4096.0));
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn events_for_unknown_requests_are_dropped() {
        let tracker = NetworkTracker::new();
        assert!(
            tracker
                .response_received(&Arc::from("ghost"), redirect_response(200))
                .is_none()
        );
        assert!(tracker.request_finished(&Arc::from("ghost"), 0.0, None).is_none());
        assert!(
            tracker
                .request_failed(&Arc::from("ghost"), "net::ERR_FAILED".into(), false)
                .is_none()
        );
    }

    #[test]
    fn request_without_frame_is_ignored() {
        let tracker = NetworkTracker::new();
        assert!(tracker.request_will_be_sent(payload("r9", None, false)).is_none());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn failure_distinguishes_cancellation() {
        let tracker = NetworkTracker::new();
        tracker
            .request_will_be_sent(payload("r1", Some("F"), false))
            .unwrap();
        let request = tracker
            .request_failed(&Arc::from("r1"), "Load cancelled".into(), true)
            .unwrap();
        assert!(request.failure().unwrap().canceled);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn body_accessor_fails_descriptively() {
        let response = redirect_response(302);
        let err = response.body().await.unwrap_err();
        assert!(err.to_string().contains("No resource with given identifier"));
    }
}
