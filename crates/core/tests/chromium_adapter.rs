//! End-to-end tests for the Chromium backend over a scripted connection.

mod support;

use drover::chromium::ChromiumPage;
use drover::delegate::{PageDelegate, PageEvent};
use drover_protocol::{JsValue, LifecycleEvent, World};
use drover_runtime::{Connection, SessionRoute, Transport};
use serde_json::{Value, json};
use std::sync::Arc;
use support::{expect_quiet, next_event, spawn_browser, wait_for};
use tokio::sync::mpsc;

const SESSION: &str = "SESSION-1";
const MAIN_FRAME: &str = "FRAME-MAIN";

/// Browser script for a page whose tree holds one committed main frame.
fn default_responder(request: &Value, _inject: &mpsc::UnboundedSender<Value>) -> Option<Value> {
    match request["method"].as_str() {
        Some("Page.getFrameTree") => Some(json!({
            "frameTree": {
                "frame": { "id": MAIN_FRAME, "url": "about:blank", "loaderId": "L0" },
            },
        })),
        Some("Page.navigate") => Some(json!({ "loaderId": "L-NAV" })),
        _ => Some(json!({})),
    }
}

async fn attach_page(
    respond: impl Fn(&Value, &mpsc::UnboundedSender<Value>) -> Option<Value> + Send + 'static,
) -> (
    Arc<Connection>,
    ChromiumPage,
    mpsc::Receiver<PageEvent>,
    mpsc::UnboundedSender<Value>,
) {
    support::init_tracing();
    let (transport, harness) = Transport::loopback();
    let connection = Connection::new(transport, "Browser has been closed.");
    let inject = spawn_browser(harness, respond);
    let session =
        connection.create_session(SESSION, SessionRoute::SessionId(SESSION.to_string()));
    let (page, events) = ChromiumPage::attach(
        Arc::clone(&connection),
        session,
        Arc::from(MAIN_FRAME),
    )
    .await
    .expect("attach failed");
    (connection, page, events, inject)
}

fn session_event(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params, "sessionId": SESSION })
}

#[tokio::test]
async fn initialization_announces_existing_frames() {
    let (_connection, _page, mut events, _inject) = attach_page(default_responder).await;

    match next_event(&mut events).await {
        PageEvent::FrameAttached { frame, parent } => {
            assert_eq!(frame.as_ref(), MAIN_FRAME);
            assert!(parent.is_none());
        }
        other => panic!("expected FrameAttached, got {other:?}"),
    }
    match next_event(&mut events).await {
        PageEvent::CommittedNewDocument { frame, url, document } => {
            assert_eq!(frame.as_ref(), MAIN_FRAME);
            assert_eq!(url, "about:blank");
            assert_eq!(document.as_ref(), "L0");
        }
        other => panic!("expected CommittedNewDocument, got {other:?}"),
    }
}

#[tokio::test]
async fn realms_die_before_their_frame_detaches() {
    let (_connection, _page, mut events, inject) = attach_page(default_responder).await;
    // Drain the initial tree announcements.
    next_event(&mut events).await;
    next_event(&mut events).await;

    inject
        .send(session_event(
            "Page.frameAttached",
            json!({ "frameId": "FRAME-CHILD", "parentFrameId": MAIN_FRAME }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::FrameAttached { frame, .. } if frame.as_ref() == "FRAME-CHILD"
    ));

    inject
        .send(session_event(
            "Runtime.executionContextCreated",
            json!({ "context": {
                "id": 9,
                "auxData": { "frameId": "FRAME-CHILD", "isDefault": true },
            }}),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::ContextCreated { world: World::Main, .. }
    ));

    inject
        .send(session_event(
            "Page.frameDetached",
            json!({ "frameId": "FRAME-CHILD" }),
        ))
        .unwrap();

    // Destruction cascades realm-first, so no caller can observe a live
    // realm on a detached frame.
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::ContextDestroyed { realm } if realm.as_ref() == "9"
    ));
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::FrameDetached { frame } if frame.as_ref() == "FRAME-CHILD"
    ));
}

#[tokio::test]
async fn superseded_navigation_lifecycle_is_dropped() {
    let (_connection, page, mut events, inject) = attach_page(default_responder).await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    // Navigation to /a starts but /b commits first.
    let goto = page
        .navigate_frame(&Arc::from(MAIN_FRAME), "http://x/a", None)
        .await
        .unwrap();
    assert_eq!(goto.new_document.as_deref(), Some("L-NAV"));

    inject
        .send(session_event(
            "Page.frameNavigated",
            json!({ "frame": { "id": MAIN_FRAME, "url": "http://x/b", "loaderId": "L-B" } }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::CommittedNewDocument { url, .. } if url == "http://x/b"
    ));

    // Lifecycle tagged with the superseded generation: silently dropped.
    inject
        .send(session_event(
            "Page.lifecycleEvent",
            json!({ "frameId": MAIN_FRAME, "loaderId": "L-NAV", "name": "load" }),
        ))
        .unwrap();
    expect_quiet(&mut events).await;

    // The committed generation's lifecycle applies.
    inject
        .send(session_event(
            "Page.lifecycleEvent",
            json!({ "frameId": MAIN_FRAME, "loaderId": "L-B", "name": "load" }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::Lifecycle { event: LifecycleEvent::Load, .. }
    ));
}

#[tokio::test]
async fn evaluate_preserves_nan_and_negative_zero() {
    let (_connection, page, mut events, inject) = attach_page(|request, inject| {
        if request["method"].as_str() == Some("Runtime.evaluate") {
            return Some(json!({
                "result": { "deepSerializedValue": {
                    "type": "object",
                    "value": [
                        ["x", { "type": "number", "value": "NaN" }],
                        ["y", { "type": "number", "value": "-0" }],
                    ],
                }},
            }));
        }
        default_responder(request, inject)
    })
    .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    inject
        .send(session_event(
            "Runtime.executionContextCreated",
            json!({ "context": {
                "id": 5,
                "auxData": { "frameId": MAIN_FRAME, "isDefault": true },
            }}),
        ))
        .unwrap();
    let realm = match next_event(&mut events).await {
        PageEvent::ContextCreated { realm, .. } => realm,
        other => panic!("expected ContextCreated, got {other:?}"),
    };

    let value = page.evaluate(&realm, "({x: NaN, y: -0})").await.unwrap();
    match value {
        JsValue::Object(entries) => {
            assert!(matches!(entries[0].1, JsValue::Number(n) if n.is_nan()));
            assert!(
                matches!(entries[1].1, JsValue::Number(n) if n == 0.0 && n.is_sign_negative())
            );
        }
        other => panic!("expected object, got {other:?}"),
    }
}

#[tokio::test]
async fn target_closure_resolves_all_inflight_evaluates() {
    // Never answer evaluates; they must still resolve on closure.
    let (connection, page, mut events, inject) = attach_page(|request, inject| {
        if request["method"].as_str() == Some("Runtime.evaluate") {
            return None;
        }
        default_responder(request, inject)
    })
    .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    for (id, aux) in [
        (5, json!({ "frameId": MAIN_FRAME, "isDefault": true })),
        (6, json!({ "frameId": MAIN_FRAME, "isDefault": false })),
        (7, json!({ "frameId": MAIN_FRAME, "isDefault": false })),
    ] {
        inject
            .send(session_event(
                "Runtime.executionContextCreated",
                json!({ "context": { "id": id, "auxData": aux, "name": "sandbox" } }),
            ))
            .unwrap();
    }
    // Only the main-world realm announces itself; the others are tracked
    // silently.
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::ContextCreated { world: World::Main, .. }
    ));

    let page = Arc::new(page);
    let mut calls = Vec::new();
    for realm in ["5", "6", "7"] {
        let page = Arc::clone(&page);
        calls.push(tokio::spawn(async move {
            page.evaluate(&Arc::from(realm), "1 + 1").await
        }));
    }
    // Let the calls reach the wire before tearing the target down.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    connection.remove_session(SESSION);

    for call in calls {
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), call)
            .await
            .expect("evaluate hung after target closure")
            .unwrap();
        assert!(result.unwrap_err().is_target_closed());
    }
}

#[tokio::test]
async fn navigation_error_text_rejects_goto() {
    let (_connection, page, mut events, _inject) = attach_page(|request, inject| {
        if request["method"].as_str() == Some("Page.navigate") {
            return Some(json!({ "errorText": "net::ERR_NAME_NOT_RESOLVED" }));
        }
        default_responder(request, inject)
    })
    .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    let err = page
        .navigate_frame(&Arc::from(MAIN_FRAME), "http://nope.invalid/", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("net::ERR_NAME_NOT_RESOLVED"));
}

#[tokio::test]
async fn console_messages_from_cleared_contexts_are_ignored() {
    let (_connection, _page, mut events, inject) = attach_page(default_responder).await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    inject
        .send(session_event(
            "Runtime.consoleAPICalled",
            json!({ "type": "log", "executionContextId": 0, "args": [{ "value": "stale" }] }),
        ))
        .unwrap();
    expect_quiet(&mut events).await;

    inject
        .send(session_event(
            "Runtime.consoleAPICalled",
            json!({ "type": "warning", "executionContextId": 3, "args": [{ "value": "live" }] }),
        ))
        .unwrap();
    let event = wait_for(&mut events, |event| {
        matches!(event, PageEvent::Console { .. })
    })
    .await;
    match event {
        PageEvent::Console { level, text } => {
            assert_eq!(level, "warning");
            assert_eq!(text, "live");
        }
        other => panic!("expected Console, got {other:?}"),
    }
}

#[tokio::test]
async fn registry_resolves_pages_by_stable_id() {
    let (_connection, page, mut events, _inject) = attach_page(default_responder).await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    let registry = drover::PageRegistry::new();
    let id = registry.register(Arc::new(page));

    // Sessions hold the id, not the page; resolution goes through the
    // registry.
    let delegate = registry.resolve(id).expect("page should be registered");
    let goto = delegate
        .navigate_frame(&Arc::from(MAIN_FRAME), "http://x/", None)
        .await
        .unwrap();
    assert_eq!(goto.new_document.as_deref(), Some("L-NAV"));

    registry.unregister(id);
    assert!(registry.resolve(id).is_none());
    assert!(registry.is_empty());
}
