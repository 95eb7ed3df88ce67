// Copyright 2024 Paul Adamson
// Licensed under the Apache License, Version 2.0

//! Canonical in-memory model of JavaScript values.
//!
//! Each backend serializes evaluation results with its own encoding; every
//! codec converts to and from this one model so the layer above never sees a
//! backend-native shape. Numbers preserve the special forms JSON cannot
//! (`NaN`, `-0`, `±Infinity`), which is why equality goes through
//! [`JsValue::value_eq`] rather than `PartialEq` on `f64`.

use std::fmt;

/// A JavaScript value deserialized from a remote realm.
#[derive(Debug, Clone)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    /// Any JS number, including `NaN`, `-0` and the infinities.
    Number(f64),
    String(String),
    /// Arbitrary-precision integer, kept as its decimal string form.
    BigInt(String),
    Array(Vec<JsValue>),
    /// Plain object; insertion order preserved.
    Object(Vec<(String, JsValue)>),
    /// `Map` entries in iteration order.
    Map(Vec<(JsValue, JsValue)>),
    /// `Set` members in iteration order.
    Set(Vec<JsValue>),
    /// `Date`, as an ISO 8601 string.
    Date(String),
    Regexp { pattern: String, flags: String },
}

impl JsValue {
    /// Structural equality with `Object.is` semantics for numbers:
    /// `NaN` equals `NaN`, and `-0` does not equal `0`.
    pub fn value_eq(&self, other: &JsValue) -> bool {
        use JsValue::*;
        match (self, other) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (BigInt(a), BigInt(b)) => a == b,
            (Array(a), Array(b)) | (Set(a), Set(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.value_eq(y))
            }
            (Object(a), Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.value_eq(vb))
            }
            (Map(a), Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka.value_eq(kb) && va.value_eq(vb))
            }
            (Date(a), Date(b)) => a == b,
            (
                Regexp { pattern: pa, flags: fa },
                Regexp { pattern: pb, flags: fb },
            ) => pa == pb && fa == fb,
            _ => false,
        }
    }

    /// True for `undefined` and `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Renders the special number forms the way the wire protocols spell
    /// them, or `None` for ordinary numbers.
    pub fn special_number_tag(n: f64) -> Option<&'static str> {
        if n.is_nan() {
            Some("NaN")
        } else if n == f64::INFINITY {
            Some("Infinity")
        } else if n == f64::NEG_INFINITY {
            Some("-Infinity")
        } else if n == 0.0 && n.is_sign_negative() {
            Some("-0")
        } else {
            None
        }
    }

    /// Parses a special number tag back into its `f64` form.
    pub fn parse_special_number(tag: &str) -> Option<f64> {
        match tag {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            "-0" => Some(-0.0),
            _ => None,
        }
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::Undefined => write!(f, "undefined"),
            JsValue::Null => write!(f, "null"),
            JsValue::Bool(b) => write!(f, "{b}"),
            JsValue::Number(n) => write!(f, "{n}"),
            JsValue::String(s) => write!(f, "{s:?}"),
            JsValue::BigInt(s) => write!(f, "{s}n"),
            JsValue::Array(items) => write!(f, "Array({})", items.len()),
            JsValue::Object(entries) => write!(f, "Object({})", entries.len()),
            JsValue::Map(entries) => write!(f, "Map({})", entries.len()),
            JsValue::Set(items) => write!(f, "Set({})", items.len()),
            JsValue::Date(iso) => write!(f, "Date({iso})"),
            JsValue::Regexp { pattern, flags } => write!(f, "/{pattern}/{flags}"),
        }
    }
}

impl From<serde_json::Value> for JsValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => JsValue::Null,
            serde_json::Value::Bool(b) => JsValue::Bool(b),
            serde_json::Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => JsValue::String(s),
            serde_json::Value::Array(items) => {
                JsValue::Array(items.into_iter().map(JsValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                JsValue::Object(map.into_iter().map(|(k, v)| (k, JsValue::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_equals_nan() {
        assert!(JsValue::Number(f64::NAN).value_eq(&JsValue::Number(f64::NAN)));
    }

    #[test]
    fn negative_zero_is_not_zero() {
        assert!(!JsValue::Number(-0.0).value_eq(&JsValue::Number(0.0)));
        assert!(JsValue::Number(-0.0).value_eq(&JsValue::Number(-0.0)));
    }

    #[test]
    fn special_number_tags_round_trip() {
        for tag in ["NaN", "Infinity", "-Infinity", "-0"] {
            let n = JsValue::parse_special_number(tag).unwrap();
            assert_eq!(JsValue::special_number_tag(n), Some(tag));
        }
        assert_eq!(JsValue::special_number_tag(42.0), None);
    }

    #[test]
    fn nested_structures_compare_structurally() {
        let a = JsValue::Object(vec![(
            "inner".to_string(),
            JsValue::Array(vec![JsValue::Number(1.0), JsValue::String("x".into())]),
        )]);
        let b = JsValue::Object(vec![(
            "inner".to_string(),
            JsValue::Array(vec![JsValue::Number(1.0), JsValue::String("x".into())]),
        )]);
        assert!(a.value_eq(&b));
    }
}
