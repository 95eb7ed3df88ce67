//! Helpers for picking fields out of protocol event payloads.

use drover_runtime::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

/// Required string field; missing fields are protocol violations.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value[key].as_str().ok_or_else(|| Error::Protocol {
        method: String::new(),
        message: format!("event payload missing '{key}'"),
    })
}

pub(crate) fn arc_field(value: &Value, key: &str) -> Result<Arc<str>> {
    str_field(value, key).map(Arc::from)
}

pub(crate) fn opt_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value[key].as_str()
}

pub(crate) fn opt_arc(value: &Value, key: &str) -> Option<Arc<str>> {
    value[key].as_str().map(Arc::from)
}

pub(crate) fn f64_field(value: &Value, key: &str) -> f64 {
    value[key].as_f64().unwrap_or(0.0)
}
