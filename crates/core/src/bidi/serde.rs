// Copyright 2024 Paul Adamson
// Licensed under the Apache License, Version 2.0

//! WebDriver BiDi value encoding.
//!
//! Outgoing arguments are `LocalValue`s, incoming results `RemoteValue`s.
//! Both are tagged unions; special numbers travel as the strings `"NaN"`,
//! `"-0"`, `"Infinity"` and `"-Infinity"`. Values with no local form
//! (functions, symbols) fail fast rather than serialize partially.

use drover_protocol::JsValue;
use drover_runtime::{Error, Result};
use serde_json::{Value, json};

/// Serializes a canonical value into a BiDi `LocalValue`.
pub(crate) fn js_to_local(value: &JsValue) -> Result<Value> {
    Ok(match value {
        JsValue::Undefined => json!({ "type": "undefined" }),
        JsValue::Null => json!({ "type": "null" }),
        JsValue::Bool(b) => json!({ "type": "boolean", "value": b }),
        JsValue::Number(n) => match JsValue::special_number_tag(*n) {
            Some(tag) => json!({ "type": "number", "value": tag }),
            None => json!({ "type": "number", "value": n }),
        },
        JsValue::String(s) => json!({ "type": "string", "value": s }),
        JsValue::BigInt(digits) => json!({ "type": "bigint", "value": digits }),
        JsValue::Array(items) => json!({ "type": "array", "value": local_list(items)? }),
        JsValue::Set(items) => json!({ "type": "set", "value": local_list(items)? }),
        JsValue::Object(entries) => {
            let mut pairs = Vec::new();
            for (key, value) in entries {
                pairs.push(json!([
                    js_to_local(&JsValue::String(key.clone()))?,
                    js_to_local(value)?,
                ]));
            }
            json!({ "type": "object", "value": pairs })
        }
        JsValue::Map(entries) => {
            let mut pairs = Vec::new();
            for (key, value) in entries {
                pairs.push(json!([js_to_local(key)?, js_to_local(value)?]));
            }
            json!({ "type": "map", "value": pairs })
        }
        JsValue::Date(iso) => json!({ "type": "date", "value": iso }),
        JsValue::Regexp { pattern, flags } => json!({
            "type": "regexp",
            "value": { "pattern": pattern, "flags": flags },
        }),
    })
}

fn local_list(items: &[JsValue]) -> Result<Vec<Value>> {
    items.iter().map(js_to_local).collect()
}

/// Deserializes a BiDi `RemoteValue` into the canonical model.
pub(crate) fn remote_to_js(value: &Value) -> Result<JsValue> {
    let Some(kind) = value["type"].as_str() else {
        return Err(Error::Unserializable("remote value carried no type".to_string()));
    };
    let payload = &value["value"];
    Ok(match kind {
        "undefined" => JsValue::Undefined,
        "null" => JsValue::Null,
        "boolean" => JsValue::Bool(payload.as_bool().unwrap_or_default()),
        "string" => JsValue::String(payload.as_str().unwrap_or_default().to_string()),
        "number" => match payload {
            Value::String(tag) => JsValue::Number(
                JsValue::parse_special_number(tag)
                    .ok_or_else(|| Error::Unserializable(format!("bad number form: {tag}")))?,
            ),
            other => JsValue::Number(other.as_f64().unwrap_or(f64::NAN)),
        },
        "bigint" => JsValue::BigInt(payload.as_str().unwrap_or_default().to_string()),
        "array" => JsValue::Array(remote_list(payload)?),
        "set" => JsValue::Set(remote_list(payload)?),
        "object" => {
            let mut entries = Vec::new();
            for tuple in payload.as_array().map(Vec::as_slice).unwrap_or_default() {
                let (key, value) = remote_entry(tuple)?;
                let key = match key {
                    JsValue::String(s) => s,
                    other => other.to_string(),
                };
                entries.push((key, value));
            }
            JsValue::Object(entries)
        }
        "map" => {
            let mut entries = Vec::new();
            for tuple in payload.as_array().map(Vec::as_slice).unwrap_or_default() {
                entries.push(remote_entry(tuple)?);
            }
            JsValue::Map(entries)
        }
        "date" => JsValue::Date(payload.as_str().unwrap_or_default().to_string()),
        "regexp" => JsValue::Regexp {
            pattern: payload["pattern"].as_str().unwrap_or_default().to_string(),
            flags: payload["flags"].as_str().unwrap_or_default().to_string(),
        },
        "promise" => JsValue::Object(Vec::new()),
        other => {
            return Err(Error::Unserializable(format!(
                "remote value of type {other} cannot be returned by value"
            )));
        }
    })
}

fn remote_list(payload: &Value) -> Result<Vec<JsValue>> {
    payload
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(remote_to_js)
        .collect()
}

fn remote_entry(tuple: &Value) -> Result<(JsValue, JsValue)> {
    let pair = tuple.as_array().filter(|pair| pair.len() == 2).ok_or_else(|| {
        Error::Unserializable("malformed entry in remote value".to_string())
    })?;
    // Keys arrive either as bare strings or as full remote values.
    let key = match &pair[0] {
        Value::String(s) => JsValue::String(s.clone()),
        other => remote_to_js(other)?,
    };
    Ok((key, remote_to_js(&pair[1])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: JsValue) {
        let local = js_to_local(&value).unwrap();
        let back = remote_to_js(&local).unwrap();
        assert!(
            back.value_eq(&value),
            "round trip changed value: {value:?} -> {back:?}"
        );
    }

    #[test]
    fn primitives_round_trip() {
        round_trip(JsValue::Undefined);
        round_trip(JsValue::Null);
        round_trip(JsValue::Bool(true));
        round_trip(JsValue::Number(17.0));
        round_trip(JsValue::Number(3.25));
        round_trip(JsValue::String("with \"quotes\" inside".to_string()));
        round_trip(JsValue::BigInt("900719925474099123".to_string()));
    }

    #[test]
    fn special_numbers_round_trip() {
        round_trip(JsValue::Number(f64::NAN));
        round_trip(JsValue::Number(-0.0));
        round_trip(JsValue::Number(f64::INFINITY));
        round_trip(JsValue::Number(f64::NEG_INFINITY));
    }

    #[test]
    fn containers_round_trip() {
        round_trip(JsValue::Array(vec![
            JsValue::Number(1.0),
            JsValue::Array(vec![JsValue::String("nested".into())]),
        ]));
        round_trip(JsValue::Object(vec![(
            "outer".to_string(),
            JsValue::Object(vec![("inner".to_string(), JsValue::Null)]),
        )]));
        round_trip(JsValue::Map(vec![(
            JsValue::Number(1.0),
            JsValue::String("one".into()),
        )]));
        round_trip(JsValue::Set(vec![JsValue::Bool(false)]));
    }

    #[test]
    fn date_and_regexp_round_trip() {
        round_trip(JsValue::Date("2021-07-04T12:30:00.000Z".to_string()));
        round_trip(JsValue::Regexp {
            pattern: "a+b".to_string(),
            flags: "gi".to_string(),
        });
    }

    #[test]
    fn nan_and_negative_zero_survive_in_objects() {
        let value = JsValue::Object(vec![
            ("x".to_string(), JsValue::Number(f64::NAN)),
            ("y".to_string(), JsValue::Number(-0.0)),
        ]);
        let back = remote_to_js(&js_to_local(&value).unwrap()).unwrap();
        match back {
            JsValue::Object(entries) => {
                assert!(matches!(entries[0].1, JsValue::Number(n) if n.is_nan()));
                assert!(
                    matches!(entries[1].1, JsValue::Number(n) if n == 0.0 && n.is_sign_negative())
                );
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn unknown_remote_type_is_unserializable() {
        let err = remote_to_js(&json!({ "type": "symbol" })).unwrap_err();
        assert!(matches!(err, Error::Unserializable(_)));
    }
}
