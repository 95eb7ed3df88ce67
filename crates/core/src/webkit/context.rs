//! Evaluation and value encoding for the WebKit backend.
//!
//! WebKit's Inspector returns plain `RemoteObject`s: primitives inline,
//! special numbers described rather than valued (`{type: "number",
//! description: "NaN"}`), structures as JSON when returned by value.
//! `Runtime.callFunctionOn` always needs a `this` object, so calls without
//! one borrow a transient handle to the realm's global object.

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
                "returnByValue": true,
                "emulateUserGesture": true,
            }),
        )
        .await?;
    throw_if_thrown(&result)?;
    remote_object_to_js(&result["result"])
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
                "returnByValue": false,
                "emulateUserGesture": true,
            }),
        )
        .await?;
    throw_if_thrown(&result)?;
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

    // callFunctionOn is object-addressed; without an explicit receiver,
    // borrow the realm's global object for the duration of the call.
    let (this_id, borrowed_global) = match this {
        Some(id) => (id, None),
        None => {
            let global = evaluate_handle(session, context_id, "this").await?;
            (global.clone(), Some(global))
        }
    };

    let result = session
        .send(
            "Runtime.callFunctionOn",
            json!({
                "objectId": this_id.as_ref(),
                "functionDeclaration": declaration,
                "arguments": wire_args,
                "returnByValue": return_by_value,
                "emulateUserGesture": true,
            }),
        )
        .await;

    if let Some(global) = borrowed_global {
        release_object(session, &global).await;
    }

    let result = result?;
    throw_if_thrown(&result)?;
    if return_by_value {
        return Ok(CallOutcome::Value(remote_object_to_js(&result["result"])?));
    }
    result["result"]["objectId"]
        .as_str()
        .map(|id| CallOutcome::Handle(id.into()))
        .ok_or_else(|| Error::JavaScript("Result has no object identity".to_string()))
}

/// Releases a remote object, tolerating a realm or target that is already
/// gone.
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

fn throw_if_thrown(result: &Value) -> Result<()> {
    if result["wasThrown"].as_bool() == Some(true) {
        let text = result["result"]["description"]
            .as_str()
            .unwrap_or("Evaluation threw an exception");
        return Err(Error::JavaScript(text.to_string()));
    }
    Ok(())
}

/// Deserializes a WebKit `RemoteObject` returned by value.
pub(crate) fn remote_object_to_js(object: &Value) -> Result<JsValue> {
    match object["type"].as_str() {
        Some("undefined") => Ok(JsValue::Undefined),
        Some("number") => {
            if let Some(n) = object["value"].as_f64() {
                return Ok(JsValue::Number(n));
            }
            // Special forms have no value, only a description.
            let description = object["description"].as_str().unwrap_or_default();
            JsValue::parse_special_number(description)
                .map(JsValue::Number)
                .ok_or_else(|| {
                    Error::Unserializable(format!("bad number form: {description}"))
                })
        }
        Some("bigint") => {
            let description = object["description"].as_str().unwrap_or_default();
            Ok(JsValue::BigInt(
                description.trim_end_matches('n').to_string(),
            ))
        }
        Some("string") | Some("boolean") | Some("object") | Some("array") => {
            if object["subtype"].as_str() == Some("null") {
                return Ok(JsValue::Null);
            }
            Ok(JsValue::from(object["value"].clone()))
        }
        Some(other) => Err(Error::Unserializable(format!(
            "remote object of type {other} cannot be returned by value"
        ))),
        None => Err(Error::Unserializable(
            "result carried no remote object".to_string(),
        )),
    }
}

/// Encodes one call argument as an Inspector `CallArgument`. WebKit has no
/// out-of-band spelling for special numbers in arguments, so those fail
/// fast instead of arriving as a different value.
fn call_argument(argument: CallArgument) -> Result<Value> {
    match argument {
        CallArgument::Handle(handle) => Ok(json!({ "objectId": handle.object_id.as_ref() })),
        CallArgument::Value(value) => Ok(json!({ "value": plain_json(&value)? })),
    }
}

fn plain_json(value: &JsValue) -> Result<Value> {
    Ok(match value {
        JsValue::Undefined | JsValue::Null => Value::Null,
        JsValue::Bool(b) => json!(b),
        JsValue::Number(n) => match JsValue::special_number_tag(*n) {
            Some(tag) => {
                return Err(Error::Unserializable(format!(
                    "{tag} cannot be passed as a plain argument on this backend"
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
