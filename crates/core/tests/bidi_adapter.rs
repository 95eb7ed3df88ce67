//! End-to-end tests for the BiDi backend, exercising its inferred commit
//! policy and shared-stream event filtering.

mod support;

use drover::bidi::BidiPage;
use drover::delegate::{PageDelegate, PageEvent};
use drover_protocol::{JsValue, LifecycleEvent, World};
use drover_runtime::{Connection, Transport};
use serde_json::{Value, json};
use std::sync::Arc;
use support::{expect_quiet, next_event, spawn_browser};
use tokio::sync::mpsc;

const CONTEXT: &str = "CTX-TOP";

fn default_responder(request: &Value, _inject: &mpsc::UnboundedSender<Value>) -> Option<Value> {
    match request["method"].as_str() {
        Some("browsingContext.getTree") => Some(json!({
            "contexts": [{ "context": CONTEXT, "parent": null, "children": [] }],
        })),
        Some("browsingContext.navigate") => Some(json!({ "navigation": "NAV-GOTO" })),
        _ => Some(json!({})),
    }
}

async fn attach_page(
    respond: impl Fn(&Value, &mpsc::UnboundedSender<Value>) -> Option<Value> + Send + 'static,
) -> (
    Arc<Connection>,
    BidiPage,
    mpsc::Receiver<PageEvent>,
    mpsc::UnboundedSender<Value>,
) {
    support::init_tracing();
    let (transport, harness) = Transport::loopback();
    let connection = Connection::new(transport, "Browser has been closed.");
    let inject = spawn_browser(harness, respond);
    let (page, mut events) = BidiPage::attach(connection.root_session(), Arc::from(CONTEXT))
        .await
        .expect("attach failed");
    // The tree walk announces the top-level context.
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::FrameAttached { frame, .. } if frame.as_ref() == CONTEXT
    ));
    (connection, page, events, inject)
}

fn event(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params })
}

#[tokio::test]
async fn schemeless_navigation_commits_synchronously() {
    let (_connection, _page, mut events, inject) = attach_page(default_responder).await;

    // No network traffic will follow an about: navigation; the started
    // event itself is the commit signal.
    inject
        .send(event(
            "browsingContext.navigationStarted",
            json!({ "context": CONTEXT, "navigation": "NAV-1", "url": "about:blank" }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::CommittedNewDocument { url, document, .. }
            if url == "about:blank" && document.as_ref() == "NAV-1"
    ));
}

#[tokio::test]
async fn network_response_commits_http_navigation() {
    let (_connection, _page, mut events, inject) = attach_page(default_responder).await;

    inject
        .send(event(
            "browsingContext.navigationStarted",
            json!({ "context": CONTEXT, "navigation": "NAV-2", "url": "http://x/a" }),
        ))
        .unwrap();
    expect_quiet(&mut events).await;

    inject
        .send(event(
            "network.beforeRequestSent",
            json!({
                "context": CONTEXT,
                "navigation": "NAV-2",
                "redirectCount": 0,
                "request": { "request": "REQ-1", "url": "http://x/a", "method": "GET", "headers": [] },
                "timestamp": 1_700_000_000_000u64,
            }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::RequestStarted { .. }
    ));

    inject
        .send(event(
            "network.responseStarted",
            json!({
                "context": CONTEXT,
                "navigation": "NAV-2",
                "request": {
                    "request": "REQ-1",
                    "url": "http://x/a",
                    "timings": { "requestTime": 1_700_000_000_000u64, "responseStart": 1_700_000_000_080u64 },
                },
                "response": { "status": 200, "statusText": "OK", "headers": [] },
            }),
        ))
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::ResponseReceived { .. }
    ));
    // Commit inferred from the navigation-tagged response.
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::CommittedNewDocument { url, document, .. }
            if url == "http://x/a" && document.as_ref() == "NAV-2"
    ));

    // Lifecycle for the committed generation applies; a stale one is
    // dropped.
    inject
        .send(event(
            "browsingContext.domContentLoaded",
            json!({ "context": CONTEXT, "navigation": "NAV-2", "url": "http://x/a" }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::Lifecycle { event: LifecycleEvent::DomContentLoaded, .. }
    ));
    inject
        .send(event(
            "browsingContext.load",
            json!({ "context": CONTEXT, "navigation": "NAV-OLD" }),
        ))
        .unwrap();
    expect_quiet(&mut events).await;
}

#[tokio::test]
async fn redirect_chain_stays_linked_and_singly_active() {
    let (_connection, _page, mut events, inject) = attach_page(default_responder).await;

    let hop = |redirect_count: u64, url: &str| {
        event(
            "network.beforeRequestSent",
            json!({
                "context": CONTEXT,
                "redirectCount": redirect_count,
                "request": { "request": "REQ-9", "url": url, "method": "GET", "headers": [] },
                "timestamp": 1_700_000_000_000u64,
            }),
        )
    };
    let response = |status: u16| {
        event(
            "network.responseStarted",
            json!({
                "context": CONTEXT,
                "request": { "request": "REQ-9", "url": "http://x/hop",
                             "timings": { "requestTime": 1_700_000_000_000u64 } },
                "response": { "status": status, "statusText": "", "headers": [] },
            }),
        )
    };
    let completed = event(
        "network.responseCompleted",
        json!({
            "context": CONTEXT,
            "request": { "request": "REQ-9",
                         "timings": { "requestTime": 1_700_000_000_000u64,
                                      "responseEnd": 1_700_000_000_120u64 } },
            "response": { "status": 302, "bodySize": 0 },
        }),
    );

    inject.send(hop(0, "http://x/start")).unwrap();
    let first = match next_event(&mut events).await {
        PageEvent::RequestStarted { request } => request,
        other => panic!("expected RequestStarted, got {other:?}"),
    };
    assert!(first.redirected_from().is_none());

    inject.send(response(302)).unwrap();
    next_event(&mut events).await; // ResponseReceived
    inject.send(completed).unwrap();
    next_event(&mut events).await; // RequestFinished (redirect hop)

    inject.send(hop(1, "http://x/end")).unwrap();
    let second = match next_event(&mut events).await {
        PageEvent::RequestStarted { request } => request,
        other => panic!("expected RequestStarted, got {other:?}"),
    };
    assert_eq!(second.url, "http://x/end");
    assert_eq!(second.redirect_chain_len(), 1);
    assert_eq!(
        second.redirected_from().unwrap().url,
        "http://x/start"
    );
    // The continuation inherited the chain's frame.
    assert_eq!(second.frame.as_ref(), CONTEXT);
}

#[tokio::test]
async fn realms_track_worlds_and_touch_utility() {
    let sandbox_probes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let probes = Arc::clone(&sandbox_probes);
    let (_connection, page, mut events, inject) = attach_page(move |request, inject| {
        if request["method"].as_str() == Some("script.evaluate") {
            if request["params"]["target"]["sandbox"].is_string() {
                probes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                return Some(json!({ "type": "success", "result": { "type": "number", "value": 2 } }));
            }
            return Some(json!({
                "type": "success",
                "result": { "type": "number", "value": "-0" },
            }));
        }
        default_responder(request, inject)
    })
    .await;

    inject
        .send(event(
            "script.realmCreated",
            json!({ "realm": "R-MAIN", "type": "window", "context": CONTEXT }),
        ))
        .unwrap();
    let realm = match next_event(&mut events).await {
        PageEvent::ContextCreated { realm, world, .. } => {
            assert_eq!(world, World::Main);
            realm
        }
        other => panic!("expected ContextCreated, got {other:?}"),
    };

    inject
        .send(event(
            "script.realmCreated",
            json!({
                "realm": "R-UTIL",
                "type": "window",
                "context": CONTEXT,
                "sandbox": "__drover_utility_world__",
            }),
        ))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::ContextCreated { world: World::Utility, .. }
    ));

    // The main realm stays usable regardless of the probe's outcome.
    let value = page.evaluate(&realm, "-0").await.unwrap();
    assert!(value.value_eq(&JsValue::Number(-0.0)));
    assert!(sandbox_probes.load(std::sync::atomic::Ordering::SeqCst) >= 1);

    // Realm destruction reaches the page, and stale evaluates fail fast.
    inject
        .send(event("script.realmDestroyed", json!({ "realm": "R-MAIN" })))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PageEvent::ContextDestroyed { realm } if realm.as_ref() == "R-MAIN"
    ));
    let err = page.evaluate(&realm, "1").await.unwrap_err();
    assert!(err.is_stale_reference());
}

#[tokio::test]
async fn events_for_foreign_contexts_are_ignored() {
    let (_connection, _page, mut events, inject) = attach_page(default_responder).await;

    inject
        .send(event(
            "browsingContext.navigationStarted",
            json!({ "context": "CTX-OTHER", "navigation": "NAV-X", "url": "about:blank" }),
        ))
        .unwrap();
    inject
        .send(event(
            "script.realmCreated",
            json!({ "realm": "R-X", "type": "window", "context": "CTX-OTHER" }),
        ))
        .unwrap();
    expect_quiet(&mut events).await;
}

#[tokio::test]
async fn navigation_failure_reports_pending_generation() {
    let (_connection, _page, mut events, inject) = attach_page(default_responder).await;

    inject
        .send(event(
            "browsingContext.navigationStarted",
            json!({ "context": CONTEXT, "navigation": "NAV-F", "url": "http://x/f" }),
        ))
        .unwrap();
    inject
        .send(event(
            "browsingContext.navigationFailed",
            json!({ "context": CONTEXT, "navigation": "NAV-F", "url": "http://x/f" }),
        ))
        .unwrap();
    match next_event(&mut events).await {
        PageEvent::NavigationFailed { document, error, .. } => {
            assert_eq!(document.as_deref(), Some("NAV-F"));
            assert_eq!(error, "Navigation failed");
        }
        other => panic!("expected NavigationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn click_gesture_is_one_batched_action_call() {
    let batches: Arc<std::sync::Mutex<Vec<Value>>> = Arc::default();
    let seen = Arc::clone(&batches);
    let (_connection, page, _events, _inject) = attach_page(move |request, inject| {
        if request["method"].as_str() == Some("input.performActions") {
            seen.lock().unwrap().push(request["params"].clone());
        }
        default_responder(request, inject)
    })
    .await;

    page.raw_mouse()
        .click(
            10.0,
            20.0,
            drover::input::ClickOptions {
                delay: Some(50),
                button: None,
                click_count: Some(2),
            },
        )
        .await
        .unwrap();

    // One protocol call carries the whole gesture, pauses included, so its
    // timing is atomic relative to the page's event loop.
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let actions = batches[0]["actions"][0]["actions"].as_array().unwrap();
    assert_eq!(actions[0]["type"], "pointerMove");
    let pauses = actions.iter().filter(|a| a["type"] == "pause").count();
    assert_eq!(pauses, 3);
    let downs = actions.iter().filter(|a| a["type"] == "pointerDown").count();
    assert_eq!(downs, 2);
}
