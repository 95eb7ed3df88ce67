//! Wire message envelope shared by every backend.
//!
//! All three protocols frame their traffic the same way: a request carries
//! `{id, method, params}`, a response carries `{id, result|error}` and an
//! event carries `{method, params}` with no `id`. Routing keys differ per
//! backend (Chromium tags messages with `sessionId`, WebKit with
//! `pageProxyId`, BiDi uses a single stream); both keys are optional fields
//! of the envelope so the multiplexer can stay backend-agnostic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol request sent to the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    /// Unique request id for correlating the response.
    pub id: u32,
    /// Method name, e.g. `Page.navigate` or `browsingContext.navigate`.
    pub method: String,
    /// Method parameters as a JSON object.
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub params: Value,
    /// Chromium-style child-session routing key.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    /// WebKit-style page-proxy routing key.
    #[serde(
        rename = "pageProxyId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub page_proxy_id: Option<String>,
}

/// Protocol response from the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    /// Request id this response correlates to.
    pub id: u32,
    /// Success result (mutually exclusive with `error`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    /// Error result (mutually exclusive with `result`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<WireErrorValue>,
    /// BiDi puts the human-readable message next to its string error code
    /// rather than inside it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(
        rename = "pageProxyId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub page_proxy_id: Option<String>,
}

impl WireResponse {
    /// Human-readable failure message, normalized across backends, or
    /// `None` for a success.
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            Some(WireErrorValue::Detail(detail)) => Some(detail.message.clone()),
            Some(WireErrorValue::Code(code)) => {
                Some(self.message.clone().unwrap_or_else(|| code.clone()))
            }
            None => None,
        }
    }
}

/// The two spellings of a failed call on the wire: Chromium and WebKit
/// report an object `{code, message, data?}`, BiDi a bare error-code
/// string with the message as a sibling field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireErrorValue {
    Detail(WireError),
    Code(String),
}

/// Structured error payload (Chromium/WebKit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Numeric error code.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<i64>,
    /// Human-readable error message.
    pub message: String,
    /// Additional error data, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

/// Unsolicited protocol event from the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    /// Event method, e.g. `Page.frameAttached`.
    pub method: String,
    /// Event parameters as a JSON object.
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(
        rename = "pageProxyId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub page_proxy_id: Option<String>,
}

/// Discriminated union of incoming wire messages.
///
/// Responses carry an `id`; events do not. Serde tries variants in order, so
/// `Response` must come first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    /// Response to an earlier request.
    Response(WireResponse),
    /// Unsolicited event.
    Event(WireEvent),
    /// Forward-compatible catch-all for unknown shapes.
    Unknown(Value),
}

impl WireMessage {
    /// Returns the routing key of this message: the Chromium `sessionId` if
    /// present, otherwise the WebKit `pageProxyId`.
    pub fn route_key(&self) -> Option<&str> {
        match self {
            WireMessage::Response(r) => {
                r.session_id.as_deref().or(r.page_proxy_id.as_deref())
            }
            WireMessage::Event(e) => e.session_id.as_deref().or(e.page_proxy_id.as_deref()),
            WireMessage::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_empty_fields() {
        let request = WireRequest {
            id: 7,
            method: "Page.enable".to_string(),
            params: Value::Null,
            session_id: None,
            page_proxy_id: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("params"));
        assert!(!json.contains("sessionId"));
        assert!(!json.contains("pageProxyId"));
    }

    #[test]
    fn response_parses_before_event() {
        let json = r#"{"id": 3, "result": {"frameId": "A"}}"#;
        match serde_json::from_str::<WireMessage>(json).unwrap() {
            WireMessage::Response(response) => {
                assert_eq!(response.id, 3);
                assert!(response.error.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn event_routes_by_session_then_page_proxy() {
        let json = r#"{"method": "Page.frameAttached", "params": {}, "sessionId": "S1"}"#;
        let message: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.route_key(), Some("S1"));

        let json = r#"{"method": "Page.frameAttached", "params": {}, "pageProxyId": "P1"}"#;
        let message: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.route_key(), Some("P1"));
    }

    #[test]
    fn structured_error_shape_parses() {
        let json = r#"{"id": 1, "error": {"code": -32000, "message": "no such frame"}}"#;
        match serde_json::from_str::<WireMessage>(json).unwrap() {
            WireMessage::Response(response) => {
                assert_eq!(response.error_message().as_deref(), Some("no such frame"));
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn string_code_error_shape_parses() {
        let json = r#"{"id": 2, "type": "error", "error": "no such node",
                       "message": "Cannot find node with given id"}"#;
        match serde_json::from_str::<WireMessage>(json).unwrap() {
            WireMessage::Response(response) => {
                assert_eq!(
                    response.error_message().as_deref(),
                    Some("Cannot find node with given id")
                );
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }
}
