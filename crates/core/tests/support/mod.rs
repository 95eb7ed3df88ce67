//! Shared scaffolding for adapter tests: a scripted browser on the other
//! end of a loopback transport.
#![allow(dead_code)] // not every test binary uses every helper

use drover::PageEvent;
use drover_runtime::TransportHarness;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Installs a test-wide log subscriber; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Spawns a task playing the browser side of the wire. `respond` receives
/// each request and returns its result, or `None` to leave the call
/// pending forever. Routing keys (`sessionId`, `pageProxyId`) are echoed
/// onto responses the way real browsers do. The returned sender injects
/// unsolicited events.
pub fn spawn_browser<F>(mut harness: TransportHarness, respond: F) -> mpsc::UnboundedSender<Value>
where
    F: Fn(&Value, &mpsc::UnboundedSender<Value>) -> Option<Value> + Send + 'static,
{
    let injector = harness.injector();
    let inject = harness.injector();
    tokio::spawn(async move {
        while let Some(request) = harness.next_sent().await {
            let Some(id) = request["id"].as_u64() else {
                continue;
            };
            let Some(result) = respond(&request, &inject) else {
                continue;
            };
            let mut response = serde_json::json!({ "id": id, "result": result });
            for key in ["sessionId", "pageProxyId"] {
                if let Some(value) = request.get(key) {
                    response[key] = value.clone();
                }
            }
            harness.deliver(response);
        }
    });
    injector
}

/// Next page event, failing the test if none arrives in time.
pub async fn next_event(events: &mut mpsc::Receiver<PageEvent>) -> PageEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for page event")
        .expect("page event stream ended")
}

/// Asserts that no page event arrives within a short window.
pub async fn expect_quiet(events: &mut mpsc::Receiver<PageEvent>) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    if let Ok(Some(event)) = outcome {
        panic!("expected no event, got {event:?}");
    }
}

/// Drains events until one matches, failing after a bounded number of
/// non-matching events.
pub async fn wait_for<F>(events: &mut mpsc::Receiver<PageEvent>, mut matches: F) -> PageEvent
where
    F: FnMut(&PageEvent) -> bool,
{
    for _ in 0..32 {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
    panic!("matching page event never arrived");
}
