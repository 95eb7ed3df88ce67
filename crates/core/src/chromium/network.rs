//! Network correlation for the Chromium backend.
//!
//! DevTools reuses one request id across a redirect chain: the continuation
//! arrives as another `requestWillBeSent` carrying `redirectResponse`, so
//! the predecessor's response and completion are synthesized right before
//! the new hop is linked in. Timing phases arrive as milliseconds relative
//! to a monotonic `requestTime`; unavailable phases are already `-1` and
//! stay `-1` through normalization.

use super::PageShared;
use crate::delegate::PageEvent;
use crate::json::{f64_field, opt_arc, opt_str};
use crate::network::{BodyFetcher, NetworkTracker, RequestPayload, TrackedResponse};
use base64::Engine;
use drover_protocol::{RequestId, ResourceTiming, headers_object_to_array};
use drover_runtime::{Error, Result, Session};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct ChromiumNetwork {
    tracker: NetworkTracker,
    /// Monotonic send timestamp per active request, for relative end times.
    request_time: Mutex<HashMap<RequestId, f64>>,
}

impl ChromiumNetwork {
    pub(crate) fn new() -> ChromiumNetwork {
        ChromiumNetwork {
            tracker: NetworkTracker::new(),
            request_time: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn handle_event(
        &self,
        page: &Arc<PageShared>,
        session: &Arc<Session>,
        method: &str,
        params: &Value,
    ) -> Result<()> {
        match method {
            "Network.requestWillBeSent" => self.on_request_will_be_sent(page, session, params).await,
            "Network.responseReceived" => self.on_response_received(page, session, params).await,
            "Network.loadingFinished" => self.on_loading_finished(page, params).await,
            "Network.loadingFailed" => self.on_loading_failed(page, params).await,
            _ => Ok(()),
        }
    }

    async fn on_request_will_be_sent(
        &self,
        page: &Arc<PageShared>,
        session: &Arc<Session>,
        params: &Value,
    ) -> Result<()> {
        let Some(id) = opt_arc(params, "requestId") else {
            return Ok(());
        };
        let is_redirect = !params["redirectResponse"].is_null();
        if is_redirect {
            // Finish the superseded hop before linking the continuation.
            self.attach_response(page, session, &id, &params["redirectResponse"])
                .await;
            let response_end = self.relative_end(&id, f64_field(params, "timestamp"));
            if let Some(request) = self.tracker.request_finished(&id, response_end, None) {
                page.sink.emit(PageEvent::RequestFinished { request }).await;
            }
        }

        let request = &params["request"];
        let frame = opt_arc(params, "frameId").filter(|f| page.frames.contains(f));
        let document = (opt_str(params, "type") == Some("Document"))
            .then(|| opt_arc(params, "loaderId"))
            .flatten();
        let payload = RequestPayload {
            id: id.clone(),
            frame,
            url: opt_str(request, "url").unwrap_or_default().to_string(),
            method: opt_str(request, "method").unwrap_or("GET").to_string(),
            document,
            is_redirect_continuation: is_redirect,
            headers: headers_object_to_array(&request["headers"]),
            post_data: opt_str(request, "postData").map(|data| data.as_bytes().to_vec()),
            start_time: f64_field(params, "wallTime"),
        };
        self.request_time
            .lock()
            .insert(id.clone(), f64_field(params, "timestamp"));
        if let Some(request) = self.tracker.request_will_be_sent(payload) {
            page.sink.emit(PageEvent::RequestStarted { request }).await;
        }
        Ok(())
    }

    async fn on_response_received(
        &self,
        page: &Arc<PageShared>,
        session: &Arc<Session>,
        params: &Value,
    ) -> Result<()> {
        let Some(id) = opt_arc(params, "requestId") else {
            return Ok(());
        };
        self.attach_response(page, session, &id, &params["response"])
            .await;
        Ok(())
    }

    async fn attach_response(
        &self,
        page: &Arc<PageShared>,
        session: &Arc<Session>,
        id: &RequestId,
        response: &Value,
    ) {
        let Some(request) = self.tracker.get(id) else {
            return;
        };
        let timing = normalize_timing(&response["timing"], request.start_time);
        let tracked = TrackedResponse::new(
            response["status"].as_u64().unwrap_or(0) as u16,
            opt_str(response, "statusText").unwrap_or_default().to_string(),
            headers_object_to_array(&response["headers"]),
            timing,
            body_fetcher(session, id),
        );
        if let Some((request, _)) = self.tracker.response_received(id, tracked) {
            page.sink.emit(PageEvent::ResponseReceived { request }).await;
        }
    }

    async fn on_loading_finished(&self, page: &Arc<PageShared>, params: &Value) -> Result<()> {
        let Some(id) = opt_arc(params, "requestId") else {
            return Ok(());
        };
        let response_end = self.relative_end(&id, f64_field(params, "timestamp"));
        let transfer_size = params["encodedDataLength"].as_f64();
        if let Some(request) = self.tracker.request_finished(&id, response_end, transfer_size) {
            self.request_time.lock().remove(&id);
            page.sink.emit(PageEvent::RequestFinished { request }).await;
        }
        Ok(())
    }

    async fn on_loading_failed(&self, page: &Arc<PageShared>, params: &Value) -> Result<()> {
        let Some(id) = opt_arc(params, "requestId") else {
            return Ok(());
        };
        self.request_time.lock().remove(&id);
        let error_text = opt_str(params, "errorText").unwrap_or("Loading failed").to_string();
        let canceled = params["canceled"].as_bool() == Some(true);
        if let Some(request) = self.tracker.request_failed(&id, error_text, canceled) {
            page.sink
                .emit(PageEvent::RequestFailed { request, canceled })
                .await;
        }
        Ok(())
    }

    /// Seconds from request start to a monotonic event timestamp.
    fn relative_end(&self, id: &RequestId, timestamp: f64) -> f64 {
        match self.request_time.lock().get(id) {
            Some(start) if timestamp > 0.0 => timestamp - start,
            _ => -1.0,
        }
    }
}

/// DevTools reports phases as milliseconds relative to `requestTime`, with
/// `-1` for unavailable. Normalized to seconds, keeping `-1` intact.
fn normalize_timing(timing: &Value, start_time: f64) -> ResourceTiming {
    if timing.is_null() {
        return ResourceTiming::unavailable(start_time);
    }
    let phase = |key: &str| -> f64 {
        match timing[key].as_f64() {
            Some(ms) if ms >= 0.0 => ms / 1000.0,
            _ => -1.0,
        }
    };
    ResourceTiming {
        start_time,
        domain_lookup_start: phase("dnsStart"),
        domain_lookup_end: phase("dnsEnd"),
        connect_start: phase("connectStart"),
        secure_connection_start: phase("sslStart"),
        connect_end: phase("connectEnd"),
        request_start: phase("sendStart"),
        response_start: phase("receiveHeadersEnd"),
    }
}

fn body_fetcher(session: &Arc<Session>, id: &RequestId) -> BodyFetcher {
    let session = Arc::clone(session);
    let id = id.clone();
    Arc::new(move || {
        let session = Arc::clone(&session);
        let id = id.clone();
        Box::pin(async move {
            let result = session
                .send("Network.getResponseBody", json!({ "requestId": id.as_ref() }))
                .await?;
            let body = result["body"].as_str().unwrap_or_default();
            if result["base64Encoded"].as_bool() == Some(true) {
                base64::engine::general_purpose::STANDARD
                    .decode(body)
                    .map_err(|e| Error::Protocol {
                        method: "Network.getResponseBody".to_string(),
                        message: format!("invalid body payload: {e}"),
                    })
            } else {
                Ok(body.as_bytes().to_vec())
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_phase_normalizes_to_minus_one() {
        let timing = normalize_timing(
            &json!({ "dnsStart": -1, "dnsEnd": 12.5, "sendStart": 0.0, "receiveHeadersEnd": 48.0 }),
            1000.0,
        );
        assert_eq!(timing.domain_lookup_start, -1.0);
        assert_eq!(timing.domain_lookup_end, 0.0125);
        assert_eq!(timing.request_start, 0.0);
        assert_eq!(timing.response_start, 0.048);
        // Missing keys are unavailable, not zero-cost.
        assert_eq!(timing.connect_start, -1.0);
    }

    #[test]
    fn absent_timing_block_is_fully_unavailable() {
        let timing = normalize_timing(&Value::Null, 7.0);
        assert_eq!(timing.start_time, 7.0);
        assert_eq!(timing.response_start, -1.0);
    }
}
