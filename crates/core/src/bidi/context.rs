//! Evaluation for the BiDi backend.
//!
//! Realms are addressed by opaque handle; ownership of results is requested
//! with `resultOwnership: "root"` when the caller wants a handle back.

use super::serde::{js_to_local, remote_to_js};
use crate::delegate::{CallArgument, RemoteObjectId};
use drover_protocol::JsValue;
use drover_runtime::{Error, Result, Session};
use serde_json::{Value, json};

/// Serialization depth limits applied to by-value results, bounding the
/// payload a runaway structure can produce.
fn serialization_options() -> Value {
    json!({ "maxObjectDepth": 10, "maxDomDepth": 10 })
}

pub(crate) enum CallOutcome {
    Value(JsValue),
    Handle(RemoteObjectId),
}

pub(crate) async fn evaluate(session: &Session, realm: &str, expression: &str) -> Result<JsValue> {
    let result = session
        .send(
            "script.evaluate",
            json!({
                "expression": expression,
                "target": { "realm": realm },
                "serializationOptions": serialization_options(),
                "awaitPromise": true,
                "userActivation": true,
            }),
        )
        .await?;
    remote_to_js(success_result(&result)?)
}

pub(crate) async fn evaluate_handle(
    session: &Session,
    realm: &str,
    expression: &str,
) -> Result<RemoteObjectId> {
    let result = session
        .send(
            "script.evaluate",
            json!({
                "expression": expression,
                "target": { "realm": realm },
                "resultOwnership": "root",
                "awaitPromise": true,
                "userActivation": true,
            }),
        )
        .await?;
    let value = success_result(&result)?;
    value["handle"]
        .as_str()
        .map(Into::into)
        .ok_or_else(|| Error::JavaScript(format!("Cannot get handle: {value}")))
}

pub(crate) async fn call_function(
    session: &Session,
    realm: &str,
    declaration: &str,
    this: Option<RemoteObjectId>,
    arguments: Vec<CallArgument>,
    return_by_value: bool,
) -> Result<CallOutcome> {
    let wire_args = arguments
        .iter()
        .map(|argument| match argument {
            CallArgument::Handle(handle) => Ok(json!({ "handle": handle.object_id.as_ref() })),
            CallArgument::Value(value) => js_to_local(value),
        })
        .collect::<Result<Vec<Value>>>()?;
    let mut params = json!({
        "functionDeclaration": declaration,
        "arguments": wire_args,
        "target": { "realm": realm },
        "awaitPromise": true,
        "userActivation": true,
    });
    if let Some(this) = this {
        params["this"] = json!({ "handle": this.as_ref() });
    }
    if return_by_value {
        params["serializationOptions"] = serialization_options();
    } else {
        params["resultOwnership"] = json!("root");
    }
    let result = session.send("script.callFunction", params).await?;
    let value = success_result(&result)?;
    if return_by_value {
        return Ok(CallOutcome::Value(remote_to_js(value)?));
    }
    value["handle"]
        .as_str()
        .map(|handle| CallOutcome::Handle(handle.into()))
        .ok_or_else(|| Error::JavaScript(format!("Cannot get handle: {value}")))
}

/// Disowns a handle. Tolerates the realm being gone.
pub(crate) async fn disown(session: &Session, realm: &str, handle: &RemoteObjectId) {
    let result = session
        .send(
            "script.disown",
            json!({ "target": { "realm": realm }, "handles": [handle.as_ref()] }),
        )
        .await;
    if let Err(e) = result {
        tracing::debug!(error = %e, "script.disown failed");
    }
}

fn success_result(result: &Value) -> Result<&Value> {
    match result["type"].as_str() {
        Some("success") => Ok(&result["result"]),
        Some("exception") => {
            let details = &result["exceptionDetails"];
            let text = details["text"].as_str().unwrap_or("Evaluation threw an exception");
            Err(Error::JavaScript(text.to_string()))
        }
        _ => Err(Error::JavaScript(format!("Unexpected response type: {result}"))),
    }
}
