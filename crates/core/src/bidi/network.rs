//! Network correlation for the BiDi backend.
//!
//! BiDi reuses one request id across a redirect chain and reports the hop
//! count in `redirectCount`. A redirect's `responseCompleted` keeps the
//! request indexed so the continuation can claim it as predecessor. When a
//! `responseStarted` carries a navigation id it doubles as the commit
//! signal for that navigation.
//!
//! Response bodies are not retrievable on this backend; the body accessor
//! fails descriptively instead of producing an empty buffer.

use super::BidiShared;
use crate::delegate::PageEvent;
use crate::json::{f64_field, opt_arc, opt_str};
use crate::network::{BodyFetcher, NetworkTracker, RequestPayload, TrackedResponse};
use drover_protocol::{Header, ResourceTiming};
use drover_runtime::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

pub(crate) struct BidiNetwork {
    tracker: NetworkTracker,
}

impl BidiNetwork {
    pub(crate) fn new() -> BidiNetwork {
        BidiNetwork {
            tracker: NetworkTracker::new(),
        }
    }

    pub(crate) async fn handle_event(
        &self,
        page: &BidiShared,
        method: &str,
        params: &Value,
    ) -> Result<()> {
        match method {
            "network.beforeRequestSent" => self.on_before_request_sent(page, params).await,
            "network.responseStarted" => self.on_response_started(page, params).await,
            "network.responseCompleted" => self.on_response_completed(page, params).await,
            "network.fetchError" => self.on_fetch_error(page, params).await,
            _ => Ok(()),
        }
    }

    async fn on_before_request_sent(&self, page: &BidiShared, params: &Value) -> Result<()> {
        let request = &params["request"];
        let url = opt_str(request, "url").unwrap_or_default();
        if url.starts_with("data:") {
            return Ok(());
        }
        let Some(id) = opt_arc(request, "request") else {
            return Ok(());
        };
        let is_redirect = params["redirectCount"].as_u64().unwrap_or(0) > 0;
        let frame = opt_arc(params, "context").filter(|frame| page.owns(frame));
        if !is_redirect && frame.is_none() {
            return Ok(());
        }
        let payload = RequestPayload {
            id,
            frame,
            url: url.to_string(),
            method: opt_str(request, "method").unwrap_or("GET").to_string(),
            document: opt_arc(params, "navigation"),
            is_redirect_continuation: is_redirect,
            headers: headers_array(&request["headers"]),
            post_data: None,
            start_time: f64_field(params, "timestamp") / 1000.0,
        };
        if let Some(request) = self.tracker.request_will_be_sent(payload) {
            page.sink.emit(PageEvent::RequestStarted { request }).await;
        }
        Ok(())
    }

    async fn on_response_started(&self, page: &BidiShared, params: &Value) -> Result<()> {
        let Some(id) = opt_arc(&params["request"], "request") else {
            return Ok(());
        };
        if self.tracker.get(&id).is_none() {
            return Ok(());
        }
        let response = &params["response"];
        let timing = normalize_timing(&params["request"]["timings"]);
        let tracked = TrackedResponse::new(
            response["status"].as_u64().unwrap_or(0) as u16,
            opt_str(response, "statusText").unwrap_or_default().to_string(),
            headers_array(&response["headers"]),
            timing,
            unavailable_body(),
        );
        if let Some((request, _)) = self.tracker.response_received(&id, tracked) {
            page.sink.emit(PageEvent::ResponseReceived { request }).await;
        }
        // No dedicated commit event exists; the navigation's first response
        // is the commit signal.
        if let Some(navigation) = opt_arc(params, "navigation") {
            if let Some(frame) = opt_arc(params, "context").filter(|frame| page.owns(frame)) {
                let url = opt_str(&params["request"], "url")
                    .or_else(|| opt_str(response, "url"))
                    .unwrap_or_default();
                page.commit_navigation(&frame, url, &navigation).await;
            }
        }
        Ok(())
    }

    async fn on_response_completed(&self, page: &BidiShared, params: &Value) -> Result<()> {
        let Some(id) = opt_arc(&params["request"], "request") else {
            return Ok(());
        };
        let Some(request) = self.tracker.get(&id) else {
            return Ok(());
        };
        let timings = &params["request"]["timings"];
        let response_end = match timings["responseEnd"].as_f64() {
            Some(end) if end > 0.0 => end / 1000.0 - request.start_time,
            _ => -1.0,
        };
        let transfer_size = params["response"]["bodySize"].as_f64();
        if let Some(request) = self.tracker.request_finished(&id, response_end, transfer_size) {
            page.sink.emit(PageEvent::RequestFinished { request }).await;
        }
        Ok(())
    }

    async fn on_fetch_error(&self, page: &BidiShared, params: &Value) -> Result<()> {
        let Some(id) = opt_arc(&params["request"], "request") else {
            return Ok(());
        };
        let error_text = opt_str(params, "errorText").unwrap_or("Fetch error").to_string();
        let canceled =
            error_text == "NS_BINDING_ABORTED" || error_text.to_ascii_lowercase().contains("abort");
        if let Some(request) = self.tracker.request_failed(&id, error_text, canceled) {
            page.sink
                .emit(PageEvent::RequestFailed { request, canceled })
                .await;
        }
        Ok(())
    }
}

/// BiDi reports absolute millisecond timestamps; a phase of `0` means the
/// backend never measured it and normalizes to `-1`, never `0`.
fn normalize_timing(timings: &Value) -> ResourceTiming {
    let request_time = timings["requestTime"].as_f64().unwrap_or(0.0);
    let relative = |key: &str| -> f64 {
        match timings[key].as_f64() {
            Some(time) if time > 0.0 => (time - request_time) / 1000.0,
            _ => -1.0,
        }
    };
    ResourceTiming {
        start_time: request_time / 1000.0,
        domain_lookup_start: relative("dnsStart"),
        domain_lookup_end: relative("dnsEnd"),
        connect_start: relative("connectStart"),
        secure_connection_start: relative("tlsStart"),
        connect_end: relative("connectEnd"),
        request_start: relative("requestStart"),
        response_start: relative("responseStart"),
    }
}

fn headers_array(headers: &Value) -> Vec<Header> {
    let Some(list) = headers.as_array() else {
        return Vec::new();
    };
    list.iter()
        .map(|header| Header {
            name: header["name"].as_str().unwrap_or_default().to_string(),
            value: match header["value"]["type"].as_str() {
                Some("string") => header["value"]["value"].as_str().unwrap_or_default().to_string(),
                _ => String::new(),
            },
        })
        .collect()
}

fn unavailable_body() -> BodyFetcher {
    Arc::new(|| {
        Box::pin(async {
            Err(Error::Protocol {
                method: "network.getResponseBody".to_string(),
                message: "Response body is not available for requests over BiDi".to_string(),
            })
        })
    })
}
