//! Network correlation for the WebKit backend.
//!
//! WebKit reports resource timing phases in milliseconds with `-1000` as
//! its unavailable sentinel (the value is already scaled to be "in ms"),
//! and a phase can land at or below zero on the macOS network stack when
//! DNS starts before the request does. Both normalize to `-1`.

use super::WkShared;
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

pub(crate) struct WebKitNetwork {
    tracker: NetworkTracker,
    /// Monotonic send timestamp per active request.
    request_time: Mutex<HashMap<RequestId, f64>>,
}

impl WebKitNetwork {
    pub(crate) fn new() -> WebKitNetwork {
        WebKitNetwork {
            tracker: NetworkTracker::new(),
            request_time: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn handle_event(
        &self,
        page: &Arc<WkShared>,
        session: &Arc<Session>,
        method: &str,
        params: &Value,
    ) -> Result<()> {
        match method {
            "Network.requestWillBeSent" => {
                self.on_request_will_be_sent(page, session, params).await
            }
            "Network.responseReceived" => {
                let Some(id) = opt_arc(params, "requestId") else {
                    return Ok(());
                };
                self.attach_response(page, session, &id, &params["response"])
                    .await;
                Ok(())
            }
            "Network.loadingFinished" => self.on_loading_finished(page, params).await,
            "Network.loadingFailed" => self.on_loading_failed(page, params).await,
            _ => Ok(()),
        }
    }

    async fn on_request_will_be_sent(
        &self,
        page: &Arc<WkShared>,
        session: &Arc<Session>,
        params: &Value,
    ) -> Result<()> {
        let Some(id) = opt_arc(params, "requestId") else {
            return Ok(());
        };
        let is_redirect = !params["redirectResponse"].is_null();
        if is_redirect {
            self.attach_response(page, session, &id, &params["redirectResponse"])
                .await;
            let response_end = self.relative_end(&id, f64_field(params, "timestamp"));
            if let Some(request) = self.tracker.request_finished(&id, response_end, None) {
                page.sink.emit(PageEvent::RequestFinished { request }).await;
            }
        }

        let request = &params["request"];
        let frame = opt_arc(params, "frameId").filter(|frame| page.frames.contains(frame));
        let document = (opt_str(params, "type") == Some("Document"))
            .then(|| opt_arc(params, "loaderId"))
            .flatten();
        let post_data = opt_str(request, "postData").and_then(|data| {
            base64::engine::general_purpose::STANDARD.decode(data).ok()
        });
        let payload = RequestPayload {
            id: id.clone(),
            frame,
            url: opt_str(request, "url").unwrap_or_default().to_string(),
            method: opt_str(request, "method").unwrap_or("GET").to_string(),
            document,
            is_redirect_continuation: is_redirect,
            headers: headers_object_to_array(&request["headers"]),
            post_data,
            start_time: f64_field(params, "walltime"),
        };
        self.request_time
            .lock()
            .insert(id.clone(), f64_field(params, "timestamp"));
        if let Some(request) = self.tracker.request_will_be_sent(payload) {
            page.sink.emit(PageEvent::RequestStarted { request }).await;
        }
        Ok(())
    }

    async fn attach_response(
        &self,
        page: &Arc<WkShared>,
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

    async fn on_loading_finished(&self, page: &Arc<WkShared>, params: &Value) -> Result<()> {
        let Some(id) = opt_arc(params, "requestId") else {
            return Ok(());
        };
        let response_end = self.relative_end(&id, f64_field(params, "timestamp"));
        let transfer_size = params["metrics"]["responseBodyBytesReceived"].as_f64();
        if let Some(request) = self.tracker.request_finished(&id, response_end, transfer_size) {
            self.request_time.lock().remove(&id);
            page.sink.emit(PageEvent::RequestFinished { request }).await;
        }
        Ok(())
    }

    async fn on_loading_failed(&self, page: &Arc<WkShared>, params: &Value) -> Result<()> {
        let Some(id) = opt_arc(params, "requestId") else {
            return Ok(());
        };
        self.request_time.lock().remove(&id);
        let error_text = opt_str(params, "errorText").unwrap_or("Loading failed").to_string();
        let canceled = params["canceled"].as_bool() == Some(true)
            || error_text.to_ascii_lowercase().contains("cancel");
        if let Some(request) = self.tracker.request_failed(&id, error_text, canceled) {
            page.sink
                .emit(PageEvent::RequestFailed { request, canceled })
                .await;
        }
        Ok(())
    }

    fn relative_end(&self, id: &RequestId, timestamp: f64) -> f64 {
        match self.request_time.lock().get(id) {
            Some(start) if timestamp > 0.0 => timestamp - start,
            _ => -1.0,
        }
    }
}

/// WebKit marks unavailable phases with `-1000`; non-positive values also
/// occur (DNS can start before the request on the macOS network stack) and
/// normalize to `-1` rather than implying a zero-cost phase.
fn wk_millis_to_seconds(value: f64) -> f64 {
    if value == -1000.0 || value <= 0.0 {
        return -1.0;
    }
    // Keep microsecond precision; the raw value is milliseconds.
    ((value * 1000.0) as i64) as f64 / 1_000_000.0
}

fn normalize_timing(timing: &Value, start_time: f64) -> ResourceTiming {
    if timing.is_null() {
        return ResourceTiming::unavailable(start_time);
    }
    let phase = |key: &str| -> f64 {
        match timing[key].as_f64() {
            Some(value) => wk_millis_to_seconds(value),
            None => -1.0,
        }
    };
    ResourceTiming {
        start_time,
        domain_lookup_start: phase("domainLookupStart"),
        domain_lookup_end: phase("domainLookupEnd"),
        connect_start: phase("connectStart"),
        secure_connection_start: phase("secureConnectionStart"),
        connect_end: phase("connectEnd"),
        request_start: phase("requestStart"),
        response_start: phase("responseStart"),
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
