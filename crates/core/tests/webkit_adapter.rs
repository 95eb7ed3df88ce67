//! End-to-end tests for the WebKit backend, exercising the page-proxy
//! envelope topology.

mod support;

use drover::delegate::{PageDelegate, PageEvent};
use drover::webkit::WebKitPage;
use drover_protocol::{JsValue, LifecycleEvent, World};
use drover_runtime::{Connection, Transport};
use serde_json::{Value, json};
use std::sync::Arc;
use support::{expect_quiet, next_event, spawn_browser};
use tokio::sync::mpsc;

const PAGE_PROXY: &str = "PP-1";
const TARGET: &str = "TARGET-1";
const MAIN_FRAME: &str = "F-MAIN";

/// Answers a request that arrived wrapped in the target envelope and
/// pushes the reply back as a `dispatchMessageFromTarget` event.
fn answer_envelope(
    request: &Value,
    inject: &mpsc::UnboundedSender<Value>,
    respond_inner: &dyn Fn(&Value) -> Option<Value>,
) {
    let inner: Value =
        serde_json::from_str(request["params"]["message"].as_str().unwrap()).unwrap();
    let Some(result) = respond_inner(&inner) else {
        return;
    };
    let reply = json!({ "id": inner["id"], "result": result }).to_string();
    let _ = inject.send(json!({
        "method": "Target.dispatchMessageFromTarget",
        "params": { "targetId": TARGET, "message": reply },
        "pageProxyId": PAGE_PROXY,
    }));
}

fn default_inner(inner: &Value) -> Option<Value> {
    match inner["method"].as_str() {
        Some("Page.getResourceTree") => Some(json!({
            "frameTree": {
                "frame": { "id": MAIN_FRAME, "url": "about:blank", "loaderId": "L0" },
            },
        })),
        _ => Some(json!({})),
    }
}

fn proxy_event(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params, "pageProxyId": PAGE_PROXY })
}

/// Wraps an inner target event into the envelope the proxy session sees.
fn target_event(method: &str, params: Value) -> Value {
    proxy_event(
        "Target.dispatchMessageFromTarget",
        json!({
            "targetId": TARGET,
            "message": json!({ "method": method, "params": params }).to_string(),
        }),
    )
}

async fn attach_page(
    respond_inner: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
) -> (
    Arc<Connection>,
    WebKitPage,
    mpsc::Receiver<PageEvent>,
    mpsc::UnboundedSender<Value>,
) {
    support::init_tracing();
    let (transport, harness) = Transport::loopback();
    let connection = Connection::new(transport, "Browser has been closed.");
    let inject = spawn_browser(harness, move |request, inject| {
        if request["method"].as_str() == Some("Target.sendMessageToTarget") {
            answer_envelope(request, inject, &respond_inner);
        }
        Some(json!({}))
    });
    let (page, mut events) = WebKitPage::attach(&connection, PAGE_PROXY);

    // The page target announces itself and initialization walks the tree.
    inject
        .send(proxy_event(
            "Target.targetCreated",
            json!({ "targetInfo": { "targetId": TARGET, "type": "page" } }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::FrameAttached { frame, .. } if frame.as_ref() == MAIN_FRAME
    ));
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::CommittedNewDocument { document, .. } if document.as_ref() == "L0"
    ));
    (connection, page, events, inject)
}

#[tokio::test]
async fn lifecycle_respects_generation_tokens() {
    let (_connection, _page, mut events, inject) = attach_page(default_inner).await;

    inject
        .send(target_event(
            "Page.frameNavigated",
            json!({ "frame": { "id": MAIN_FRAME, "url": "http://x/", "loaderId": "L1" } }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::CommittedNewDocument { document, .. } if document.as_ref() == "L1"
    ));

    // A load event for the replaced document is dropped.
    inject
        .send(target_event(
            "Page.loadEventFired",
            json!({ "frameId": MAIN_FRAME, "loaderId": "L0" }),
        ))
        .unwrap();
    expect_quiet(&mut events).await;

    inject
        .send(target_event(
            "Page.loadEventFired",
            json!({ "frameId": MAIN_FRAME, "loaderId": "L1" }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::Lifecycle { event: LifecycleEvent::Load, .. }
    ));
}

#[tokio::test]
async fn evaluate_travels_through_the_envelope() {
    let (_connection, page, mut events, inject) = attach_page(|inner| {
        match inner["method"].as_str() {
            Some("Runtime.evaluate") => Some(json!({
                "result": { "type": "number", "description": "NaN" },
            })),
            _ => default_inner(inner),
        }
    })
    .await;

    inject
        .send(target_event(
            "Runtime.executionContextCreated",
            json!({ "context": { "id": 3, "frameId": MAIN_FRAME, "isPageContext": true } }),
        ))
        .unwrap();
    let realm = match next_event(&mut events).await {
        PageEvent::ContextCreated { realm, world, .. } => {
            assert_eq!(world, World::Main);
            realm
        }
        other => panic!("expected ContextCreated, got {other:?}"),
    };

    let value = page.evaluate(&realm, "0/0").await.unwrap();
    assert!(matches!(value, JsValue::Number(n) if n.is_nan()));
}

#[tokio::test]
async fn process_swap_tears_down_old_realms() {
    let (_connection, page, mut events, inject) = attach_page(default_inner).await;

    inject
        .send(target_event(
            "Runtime.executionContextCreated",
            json!({ "context": { "id": 3, "frameId": MAIN_FRAME, "isPageContext": true } }),
        ))
        .unwrap();
    let realm = match next_event(&mut events).await {
        PageEvent::ContextCreated { realm, .. } => realm,
        other => panic!("expected ContextCreated, got {other:?}"),
    };

    // A navigation moved the page to a new process: a fresh target
    // replaces the old one wholesale.
    inject
        .send(proxy_event(
            "Target.targetCreated",
            json!({ "targetInfo": { "targetId": "TARGET-2", "type": "page" } }),
        ))
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::ContextDestroyed { realm: gone } if gone == realm
    ));

    // The old realm is unusable afterwards.
    let err = page.evaluate(&realm, "1").await.unwrap_err();
    assert!(err.is_stale_reference());
}

#[tokio::test]
async fn target_crash_fails_fast() {
    let (_connection, page, mut events, inject) = attach_page(default_inner).await;

    inject
        .send(target_event(
            "Runtime.executionContextCreated",
            json!({ "context": { "id": 3, "frameId": MAIN_FRAME, "isPageContext": true } }),
        ))
        .unwrap();
    let realm = match next_event(&mut events).await {
        PageEvent::ContextCreated { realm, .. } => realm,
        other => panic!("expected ContextCreated, got {other:?}"),
    };

    inject
        .send(proxy_event("Target.crashed", json!({ "targetId": TARGET })))
        .unwrap();
    assert!(matches!(next_event(&mut events).await, PageEvent::Crashed));

    let err = page.evaluate(&realm, "1").await.unwrap_err();
    assert!(matches!(err, drover_runtime::Error::TargetCrashed));
}
