//! Evaluation and value encoding for the Chromium backend.
//!
//! Results come back as deep-serialized values: a tagged union mirroring
//! the WebDriver serialization rules, with special numbers spelled as
//! strings (`"NaN"`, `"-0"`, `"Infinity"`, `"-Infinity"`). Call arguments
//! go out as DevTools `CallArgument`s — primitives inline, special forms
//! via `unserializableValue`, live objects by `objectId`. Values with no
//! faithful wire form fail fast instead of serializing partially.

use crate::delegate::{CallArgument, RemoteObjectId};
use drover_protocol::JsValue;
use drover_runtime::{Error, Result, Session};
use serde_json::{Value, json};

pub(crate) enum CallOutcome {
    Value(JsValue),
    Handle(RemoteObjectId),
}

pub(crate) async fn evaluate(
    session: &Session,
    context_id: i64,
    expression: &str,
) -> Result<JsValue> {
    let result = session
        .send(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "contextId": context_id,
                "awaitPromise": true,
                "serializationOptions": { "serialization": "deep" },
            }),
        )
        .await?;
    throw_if_exception(&result)?;
    deep_to_js(&result["result"]["deepSerializedValue"])
}

pub(crate) async fn evaluate_handle(
    session: &Session,
    context_id: i64,
    expression: &str,
) -> Result<RemoteObjectId> {
    let result = session
        .send(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "contextId": context_id,
                "awaitPromise": true,
            }),
        )
        .await?;
    throw_if_exception(&result)?;
    result["result"]["objectId"]
        .as_str()
        .map(Into::into)
        .ok_or_else(|| {
            Error::JavaScript("Result of the evaluation has no object identity".to_string())
        })
}

pub(crate) async fn call_function(
    session: &Session,
    context_id: i64,
    declaration: &str,
    this: Option<RemoteObjectId>,
    arguments: Vec<CallArgument>,
    return_by_value: bool,
) -> Result<CallOutcome> {
    let wire_args = arguments
        .into_iter()
        .map(call_argument)
        .collect::<Result<Vec<Value>>>()?;
    let mut params = json!({
        "functionDeclaration": declaration,
        "arguments": wire_args,
        "awaitPromise": true,
    });
    match this {
        Some(object_id) => params["objectId"] = json!(object_id.as_ref()),
        None => params["executionContextId"] = json!(context_id),
    }
    if return_by_value {
        params["serializationOptions"] = json!({ "serialization": "deep" });
    }
    let result = session.send("Runtime.callFunctionOn", params).await?;
    throw_if_exception(&result)?;
    if return_by_value {
        return Ok(CallOutcome::Value(deep_to_js(
            &result["result"]["deepSerializedValue"],
        )?));
    }
    result["result"]["objectId"]
        .as_str()
        .map(|id| CallOutcome::Handle(id.into()))
        .ok_or_else(|| Error::JavaScript("Result has no object identity".to_string()))
}

/// Releases a remote object. Failures are expected when the realm or target
/// is already gone and are logged, not surfaced.
pub(crate) async fn release_object(session: &Session, object_id: &RemoteObjectId) {
    let result = session
        .send(
            "Runtime.releaseObject",
            json!({ "objectId": object_id.as_ref() }),
        )
        .await;
    if let Err(e) = result {
        tracing::debug!(error = %e, "releaseObject failed");
    }
}

fn throw_if_exception(result: &Value) -> Result<()> {
    let details = &result["exceptionDetails"];
    if details.is_null() {
        return Ok(());
    }
    let text = details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or("Evaluation threw an exception");
    Err(Error::JavaScript(text.to_string()))
}

/// Deserializes a deep-serialized value into the canonical model.
pub(crate) fn deep_to_js(value: &Value) -> Result<JsValue> {
    let Some(kind) = value["type"].as_str() else {
        return Err(Error::Unserializable(
            "result carried no deep-serialized value".to_string(),
        ));
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
        "array" => JsValue::Array(deep_list(payload)?),
        "set" => JsValue::Set(deep_list(payload)?),
        "object" => {
            let mut entries = Vec::new();
            for tuple in payload.as_array().map(Vec::as_slice).unwrap_or_default() {
                let (key, value) = deep_entry(tuple)?;
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
                entries.push(deep_entry(tuple)?);
            }
            JsValue::Map(entries)
        }
        "date" => JsValue::Date(payload.as_str().unwrap_or_default().to_string()),
        "regexp" => JsValue::Regexp {
            pattern: payload["pattern"].as_str().unwrap_or_default().to_string(),
            flags: payload["flags"].as_str().unwrap_or_default().to_string(),
        },
        // A resolved promise deep-serializes to an empty shell.
        "promise" => JsValue::Object(Vec::new()),
        other => {
            return Err(Error::Unserializable(format!(
                "remote value of type {other} cannot be returned by value"
            )));
        }
    })
}

fn deep_list(payload: &Value) -> Result<Vec<JsValue>> {
    payload
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(deep_to_js)
        .collect()
}

fn deep_entry(tuple: &Value) -> Result<(JsValue, JsValue)> {
    let pair = tuple.as_array().filter(|pair| pair.len() == 2).ok_or_else(|| {
        Error::Unserializable("malformed entry in deep-serialized value".to_string())
    })?;
    let key = match &pair[0] {
        Value::String(s) => JsValue::String(s.clone()),
        other => deep_to_js(other)?,
    };
    Ok((key, deep_to_js(&pair[1])?))
}

/// Encodes one call argument as a DevTools `CallArgument`.
fn call_argument(argument: CallArgument) -> Result<Value> {
    match argument {
        CallArgument::Handle(handle) => Ok(json!({ "objectId": handle.object_id.as_ref() })),
        CallArgument::Value(value) => {
            if let JsValue::Number(n) = &value {
                if let Some(tag) = JsValue::special_number_tag(*n) {
                    return Ok(json!({ "unserializableValue": tag }));
                }
            }
            match &value {
                JsValue::Undefined => Ok(json!({})),
                JsValue::BigInt(digits) => {
                    Ok(json!({ "unserializableValue": format!("{digits}n") }))
                }
                _ => Ok(json!({ "value": plain_json(&value)? })),
            }
        }
    }
}

/// Plain JSON form for inline arguments. Special forms and identity-bearing
/// values have no faithful JSON spelling and fail fast.
fn plain_json(value: &JsValue) -> Result<Value> {
    Ok(match value {
        JsValue::Null => Value::Null,
        JsValue::Bool(b) => json!(b),
        JsValue::Number(n) => match JsValue::special_number_tag(*n) {
            Some(tag) => {
                return Err(Error::Unserializable(format!(
                    "{tag} cannot be nested in a plain argument"
                )));
            }
            None => json!(n),
        },
        JsValue::String(s) => json!(s),
        JsValue::Array(items) => Value::Array(
            items.iter().map(plain_json).collect::<Result<Vec<Value>>>()?,
        ),
        JsValue::Object(entries) => {
            let mut map = serde_json::Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), plain_json(value)?);
            }
            Value::Object(map)
        }
        other => {
            return Err(Error::Unserializable(format!(
                "{other} cannot be passed as a plain argument"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_round_trip_special_numbers() {
        let value = deep_to_js(&json!({ "type": "number", "value": "NaN" })).unwrap();
        assert!(matches!(value, JsValue::Number(n) if n.is_nan()));

        let value = deep_to_js(&json!({ "type": "number", "value": "-0" })).unwrap();
        assert!(value.value_eq(&JsValue::Number(-0.0)));
        assert!(!value.value_eq(&JsValue::Number(0.0)));
    }

    #[test]
    fn deep_nested_object_with_map_and_date() {
        let value = deep_to_js(&json!({
            "type": "object",
            "value": [
                ["when", { "type": "date", "value": "2024-03-01T00:00:00.000Z" }],
                ["pairs", { "type": "map", "value": [
                    [{ "type": "number", "value": 1 }, { "type": "string", "value": "one" }],
                ]}],
            ],
        }))
        .unwrap();
        match value {
            JsValue::Object(entries) => {
                assert_eq!(entries[0].0, "when");
                assert!(matches!(&entries[0].1, JsValue::Date(iso) if iso.starts_with("2024")));
                assert!(matches!(&entries[1].1, JsValue::Map(pairs) if pairs.len() == 1));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn functions_are_unserializable() {
        let err = deep_to_js(&json!({ "type": "function" })).unwrap_err();
        assert!(matches!(err, Error::Unserializable(_)));
    }

    #[test]
    fn special_numbers_become_unserializable_arguments() {
        let arg = call_argument(CallArgument::Value(JsValue::Number(f64::NEG_INFINITY))).unwrap();
        assert_eq!(arg["unserializableValue"], "-Infinity");

        let arg = call_argument(CallArgument::Value(JsValue::BigInt("17".into()))).unwrap();
        assert_eq!(arg["unserializableValue"], "17n");
    }

    #[test]
    fn nested_special_number_fails_fast() {
        let err = call_argument(CallArgument::Value(JsValue::Array(vec![JsValue::Number(
            f64::NAN,
        )])))
        .unwrap_err();
        assert!(matches!(err, Error::Unserializable(_)));
    }

    #[test]
    fn map_arguments_fail_fast() {
        let err =
            call_argument(CallArgument::Value(JsValue::Map(Vec::new()))).unwrap_err();
        assert!(matches!(err, Error::Unserializable(_)));
    }
}
