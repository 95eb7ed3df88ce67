//! WebKit backend, speaking the WebKit Inspector Protocol.
//!
//! WebKit's session topology is nested: the browser connection carries
//! page-proxy-scoped traffic routed by `pageProxyId`, and the actual page
//! target lives behind an envelope — commands go out wrapped in
//! `Target.sendMessageToTarget`, replies and events come back inside
//! `Target.dispatchMessageFromTarget`, with their own id space per target.
//! Process swaps replace the target wholesale: the new target re-announces
//! the frame tree and the old target's realms are torn down.

mod context;
mod input;
mod network;

use crate::delegate::{
    CallArgument, CallResult, GotoResult, PageEvent, PageEventSink, RemoteHandle,
};
use crate::input::{RawKeyboard, RawMouse, RawTouchscreen};
use crate::json::{arc_field, opt_arc, opt_str, str_field};
use crate::lifecycle::{CommitOutcome, FrameTracker};
use crate::realms::{RealmAddress, RealmEntry, RealmTable};
use async_trait::async_trait;
use base64::Engine;
use drover_protocol::{
    FrameId, JsValue, LifecycleEvent, Quad, RealmId, Rect, ScreenshotFormat, WireMessage, World,
};
use drover_runtime::{Connection, Error, Result, Session, SessionEvent, SessionRoute};
use network::WebKitNetwork;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Name of the isolated world provisioned for internal helpers.
pub const UTILITY_WORLD_NAME: &str = "__drover_utility_world__";

/// A page driven over the WebKit Inspector Protocol.
pub struct WebKitPage {
    shared: Arc<WkShared>,
    mouse: input::WebKitMouse,
    keyboard: input::WebKitKeyboard,
    touchscreen: input::WebKitTouchscreen,
}

pub(crate) struct WkShared {
    proxy_session: Arc<Session>,
    page_proxy_id: String,
    sink: PageEventSink,
    frames: FrameTracker,
    target: Mutex<Option<Arc<WkTarget>>>,
}

/// The current page target behind the proxy envelope.
pub(crate) struct WkTarget {
    pub(crate) target_id: Arc<str>,
    pub(crate) session: Arc<Session>,
    realms: RealmTable,
    network: WebKitNetwork,
    page: Weak<WkShared>,
}

impl WebKitPage {
    /// Binds a page proxy and starts consuming its event stream. The page
    /// target announces itself with `Target.targetCreated` shortly after.
    pub fn attach(
        connection: &Connection,
        page_proxy_id: &str,
    ) -> (WebKitPage, mpsc::Receiver<PageEvent>) {
        let proxy_session = connection.create_session(
            page_proxy_id,
            SessionRoute::PageProxyId(page_proxy_id.to_string()),
        );
        let (sink, events) = PageEventSink::channel();
        let shared = Arc::new(WkShared {
            proxy_session: Arc::clone(&proxy_session),
            page_proxy_id: page_proxy_id.to_string(),
            sink,
            frames: FrameTracker::new(),
            target: Mutex::new(None),
        });

        let mut stream = proxy_session.subscribe();
        tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                while let Some(event) = stream.recv().await {
                    if let Err(e) = WkShared::handle_proxy_event(&shared, event).await {
                        shared.sink.report_error(&e).await;
                    }
                }
            }
        });

        let page = WebKitPage {
            mouse: input::WebKitMouse::new(Arc::clone(&shared)),
            keyboard: input::WebKitKeyboard::new(Arc::clone(&shared)),
            touchscreen: input::WebKitTouchscreen::new(Arc::clone(&shared)),
            shared,
        };
        (page, events)
    }

    fn target_for_realm(&self, realm: &RealmId) -> Result<(Arc<WkTarget>, RealmEntry)> {
        let target = self.shared.current_target()?;
        let entry = target.realms.get(realm).ok_or(Error::ContextDestroyed)?;
        Ok((target, entry))
    }

    fn context_id(entry: &RealmEntry) -> Result<i64> {
        match entry.address {
            RealmAddress::ContextId(id) => Ok(id),
            _ => Err(Error::ContextDestroyed),
        }
    }
}

impl WkShared {
    pub(crate) fn current_target(&self) -> Result<Arc<WkTarget>> {
        self.target.lock().clone().ok_or_else(|| Error::TargetClosed {
            method: "Target.sendMessageToTarget".to_string(),
            reason: "No page target attached".to_string(),
        })
    }

    async fn handle_proxy_event(shared: &Arc<WkShared>, event: SessionEvent) -> Result<()> {
        let params = &event.params;
        match event.method.as_str() {
            "Target.targetCreated" => {
                let info = &params["targetInfo"];
                if opt_str(info, "type") != Some("page") {
                    return Ok(());
                }
                let target_id = arc_field(info, "targetId")?;
                WkShared::install_target(shared, target_id).await?;
            }
            "Target.targetDestroyed" => {
                let target_id = arc_field(params, "targetId")?;
                let current = shared.target.lock().clone();
                if let Some(target) = current {
                    if target.target_id == target_id {
                        shared.teardown_target(&target).await;
                        *shared.target.lock() = None;
                    }
                }
            }
            "Target.dispatchMessageFromTarget" => {
                let target_id = arc_field(params, "targetId")?;
                let message = str_field(params, "message")?;
                let Some(target) = shared.target.lock().clone() else {
                    return Ok(());
                };
                if target.target_id != target_id {
                    return Ok(());
                }
                match serde_json::from_str::<WireMessage>(message)? {
                    WireMessage::Response(response) => target.session.handle_response(response),
                    WireMessage::Event(event) => {
                        target.session.handle_event(event.method, event.params).await;
                    }
                    WireMessage::Unknown(value) => {
                        tracing::debug!("unknown target message (ignored): {value}");
                    }
                }
            }
            "Target.crashed" => {
                if let Some(target) = shared.target.lock().clone() {
                    target.session.mark_crashed();
                }
                shared.sink.emit(PageEvent::Crashed).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Swaps in a new page target; a previous target means the page moved
    /// to a new process and everything scoped to the old one is gone.
    ///
    /// Initialization runs concurrently: its round trips come back through
    /// the proxy event stream, which must keep draining meanwhile.
    async fn install_target(shared: &Arc<WkShared>, target_id: Arc<str>) -> Result<()> {
        let previous = shared.target.lock().clone();
        if let Some(previous) = previous {
            shared.teardown_target(&previous).await;
        }

        let session = shared.wrapped_session(&target_id);
        let mut stream = session.subscribe();
        let target = Arc::new(WkTarget {
            target_id,
            session,
            realms: RealmTable::new(),
            network: WebKitNetwork::new(),
            page: Arc::downgrade(shared),
        });
        *shared.target.lock() = Some(Arc::clone(&target));

        tokio::spawn({
            let target = Arc::clone(&target);
            async move {
                while let Some(event) = stream.recv().await {
                    let Some(page) = target.page.upgrade() else {
                        break;
                    };
                    if let Err(e) = target.handle_event(&page, event).await {
                        page.sink.report_error(&e).await;
                    }
                }
            }
        });

        tokio::spawn({
            let shared = Arc::clone(shared);
            async move {
                if let Err(e) = target.initialize(&shared).await {
                    // The target can close before initialization finishes.
                    tracing::debug!(error = %e, "target initialization failed");
                    shared.sink.report_error(&e).await;
                }
            }
        });
        Ok(())
    }

    async fn teardown_target(&self, target: &Arc<WkTarget>) {
        for entry in target.realms.clear() {
            if entry.world.is_some() {
                self.sink
                    .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                    .await;
            }
        }
        target.session.dispose();
    }

    /// A session whose requests travel wrapped inside
    /// `Target.sendMessageToTarget`, with an id space of its own.
    fn wrapped_session(&self, target_id: &Arc<str>) -> Arc<Session> {
        let proxy = Arc::clone(&self.proxy_session);
        let target_id = Arc::clone(target_id);
        Session::new(
            SessionRoute::Root,
            Arc::new(AtomicU32::new(0)),
            Arc::new(move |request| {
                let message = serde_json::to_string(&request)?;
                let proxy = Arc::clone(&proxy);
                let target_id = Arc::clone(&target_id);
                // The envelope send races target closure by design.
                tokio::spawn(async move {
                    let result = proxy
                        .send_may_fail(
                            "Target.sendMessageToTarget",
                            json!({ "targetId": target_id.as_ref(), "message": message }),
                        )
                        .await;
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "envelope send failed");
                    }
                });
                Ok(())
            }),
            "Target closed",
        )
    }
}

impl WkTarget {
    async fn initialize(&self, page: &Arc<WkShared>) -> Result<()> {
        self.session.send("Page.enable", Value::Null).await?;
        let tree = self.session.send("Page.getResourceTree", Value::Null).await?;
        self.handle_frame_tree(page, &tree["frameTree"]).await?;
        self.session.send("Runtime.enable", Value::Null).await?;
        self.session.send("Console.enable", Value::Null).await?;
        self.session.send("Network.enable", Value::Null).await?;
        for frame in page.frames.frame_ids() {
            self.session
                .send_may_fail(
                    "Page.createIsolatedWorld",
                    json!({ "frameId": frame.as_ref(), "worldName": UTILITY_WORLD_NAME }),
                )
                .await?;
        }
        page.proxy_session
            .send_may_fail(
                "Target.resume",
                json!({ "targetId": self.target_id.as_ref() }),
            )
            .await?;
        Ok(())
    }

    async fn handle_frame_tree(&self, page: &Arc<WkShared>, tree: &Value) -> Result<()> {
        let mut stack = vec![(tree.clone(), None::<Arc<str>>)];
        while let Some((node, parent)) = stack.pop() {
            let frame = &node["frame"];
            let frame_id = arc_field(frame, "id")?;
            self.on_frame_attached(page, frame_id.clone(), parent).await;
            if let Some(loader) = opt_arc(frame, "loaderId") {
                let url = opt_str(frame, "url").unwrap_or_default();
                if page.frames.commit_new_document(&frame_id, url, &loader)
                    == CommitOutcome::Committed
                {
                    page.sink
                        .emit(PageEvent::CommittedNewDocument {
                            frame: frame_id.clone(),
                            url: url.to_string(),
                            document: loader,
                        })
                        .await;
                }
            }
            if let Some(children) = node["childFrames"].as_array() {
                for child in children {
                    stack.push((child.clone(), Some(frame_id.clone())));
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&self, page: &Arc<WkShared>, event: SessionEvent) -> Result<()> {
        let params = &event.params;
        match event.method.as_str() {
            "Page.frameAttached" => {
                let frame = arc_field(params, "frameId")?;
                let parent = opt_arc(params, "parentFrameId");
                self.on_frame_attached(page, frame, parent).await;
            }
            "Page.frameDetached" => {
                let frame = arc_field(params, "frameId")?;
                for removed in page.frames.detach(&frame) {
                    for entry in self.realms.remove_frame(&removed) {
                        if entry.world.is_some() {
                            page.sink
                                .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                                .await;
                        }
                    }
                    page.sink
                        .emit(PageEvent::FrameDetached { frame: removed })
                        .await;
                }
            }
            "Page.frameNavigated" => {
                let frame = &params["frame"];
                let frame_id = arc_field(frame, "id")?;
                let loader = arc_field(frame, "loaderId")?;
                let url = str_field(frame, "url")?;
                if page.frames.commit_new_document(&frame_id, url, &loader)
                    == CommitOutcome::Committed
                {
                    page.sink
                        .emit(PageEvent::CommittedNewDocument {
                            frame: frame_id,
                            url: url.to_string(),
                            document: loader,
                        })
                        .await;
                }
            }
            "Page.navigatedWithinDocument" => {
                let frame = arc_field(params, "frameId")?;
                let url = str_field(params, "url")?;
                if page.frames.commit_same_document(&frame, url) {
                    page.sink
                        .emit(PageEvent::CommittedSameDocument {
                            frame,
                            url: url.to_string(),
                        })
                        .await;
                }
            }
            "Page.domContentEventFired" => {
                self.on_lifecycle(page, params, LifecycleEvent::DomContentLoaded)
                    .await;
            }
            "Page.loadEventFired" => {
                self.on_lifecycle(page, params, LifecycleEvent::Load).await;
            }
            "Runtime.executionContextCreated" => {
                self.on_execution_context_created(page, &params["context"])
                    .await;
            }
            "Console.messageAdded" => {
                let message = &params["message"];
                page.sink
                    .emit(PageEvent::Console {
                        level: opt_str(message, "level").unwrap_or("log").to_string(),
                        text: opt_str(message, "text").unwrap_or_default().to_string(),
                    })
                    .await;
            }
            method if method.starts_with("Network.") => {
                self.network
                    .handle_event(page, &self.session, method, params)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_frame_attached(
        &self,
        page: &Arc<WkShared>,
        frame: Arc<str>,
        parent: Option<Arc<str>>,
    ) {
        if page.frames.attach(&frame, parent.as_ref()) {
            page.sink
                .emit(PageEvent::FrameAttached { frame, parent })
                .await;
        }
    }

    async fn on_lifecycle(&self, page: &Arc<WkShared>, params: &Value, event: LifecycleEvent) {
        let Some(frame) = opt_arc(params, "frameId") else {
            return;
        };
        let loader = opt_arc(params, "loaderId");
        if page.frames.lifecycle_event(&frame, loader.as_ref(), event) {
            page.sink.emit(PageEvent::Lifecycle { frame, event }).await;
        }
    }

    async fn on_execution_context_created(&self, page: &Arc<WkShared>, context: &Value) {
        let Some(frame) = opt_arc(context, "frameId") else {
            return;
        };
        if !page.frames.contains(&frame) {
            return;
        }
        let Some(id) = context["id"].as_i64() else {
            return;
        };
        let world = if context["isPageContext"].as_bool() == Some(true) {
            self.touch_utility_world(&frame);
            Some(World::Main)
        } else if opt_str(context, "name") == Some(UTILITY_WORLD_NAME) {
            Some(World::Utility)
        } else {
            None
        };
        let realm: Arc<str> = Arc::from(id.to_string());
        let created = self.realms.created(RealmEntry {
            realm: realm.clone(),
            frame: frame.clone(),
            world,
            address: RealmAddress::ContextId(id),
        });
        if created {
            if let Some(world) = world {
                page.sink
                    .emit(PageEvent::ContextCreated {
                        frame,
                        world,
                        realm,
                    })
                    .await;
            }
        }
    }

    fn touch_utility_world(&self, frame: &FrameId) {
        let session = Arc::clone(&self.session);
        let frame = frame.clone();
        tokio::spawn(async move {
            let result = session
                .send_may_fail(
                    "Page.createIsolatedWorld",
                    json!({ "frameId": frame.as_ref(), "worldName": UTILITY_WORLD_NAME }),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(frame = frame.as_ref(), error = %e, "utility world provisioning failed");
            }
        });
    }
}

#[async_trait]
impl crate::delegate::PageDelegate for WebKitPage {
    async fn navigate_frame(
        &self,
        frame: &FrameId,
        url: &str,
        referrer: Option<&str>,
    ) -> Result<GotoResult> {
        let target = self.shared.current_target()?;
        let mut params = json!({ "url": url, "frameId": frame.as_ref() });
        if let Some(referrer) = referrer {
            params["referrer"] = json!(referrer);
        }
        let result = target.session.send("Page.navigate", params).await?;
        Ok(GotoResult {
            new_document: opt_arc(&result, "loaderId"),
        })
    }

    async fn evaluate(&self, realm: &RealmId, expression: &str) -> Result<JsValue> {
        let (target, entry) = self.target_for_realm(realm)?;
        context::evaluate(&target.session, Self::context_id(&entry)?, expression).await
    }

    async fn evaluate_handle(&self, realm: &RealmId, expression: &str) -> Result<RemoteHandle> {
        let (target, entry) = self.target_for_realm(realm)?;
        let object_id =
            context::evaluate_handle(&target.session, Self::context_id(&entry)?, expression)
                .await?;
        Ok(RemoteHandle {
            realm: realm.clone(),
            object_id,
        })
    }

    async fn call_function(
        &self,
        realm: &RealmId,
        declaration: &str,
        this: Option<&RemoteHandle>,
        arguments: Vec<CallArgument>,
        return_by_value: bool,
    ) -> Result<CallResult> {
        let (target, entry) = self.target_for_realm(realm)?;
        let outcome = context::call_function(
            &target.session,
            Self::context_id(&entry)?,
            declaration,
            this.map(|handle| handle.object_id.clone()),
            arguments,
            return_by_value,
        )
        .await?;
        Ok(match outcome {
            context::CallOutcome::Value(value) => CallResult::Value(value),
            context::CallOutcome::Handle(object_id) => CallResult::Handle(RemoteHandle {
                realm: realm.clone(),
                object_id,
            }),
        })
    }

    async fn release_handle(&self, handle: &RemoteHandle) -> Result<()> {
        let Ok((target, _)) = self.target_for_realm(&handle.realm) else {
            return Ok(());
        };
        context::release_object(&target.session, &handle.object_id).await;
        Ok(())
    }

    async fn get_bounding_box(&self, handle: &RemoteHandle) -> Result<Option<Rect>> {
        // Geometry goes through script on this backend.
        let result = self
            .call_function(
                &handle.realm,
                "function() { const rects = this.getClientRects(); if (!rects.length) return null; \
                 const r = this.getBoundingClientRect(); \
                 return JSON.stringify({ x: r.x, y: r.y, width: r.width, height: r.height }); }",
                Some(handle),
                Vec::new(),
                true,
            )
            .await?;
        let CallResult::Value(JsValue::String(encoded)) = result else {
            return Ok(None);
        };
        let parsed: Value = serde_json::from_str(&encoded)?;
        Ok(Some(Rect {
            x: parsed["x"].as_f64().unwrap_or(0.0),
            y: parsed["y"].as_f64().unwrap_or(0.0),
            width: parsed["width"].as_f64().unwrap_or(0.0),
            height: parsed["height"].as_f64().unwrap_or(0.0),
        }))
    }

    async fn get_content_quads(&self, handle: &RemoteHandle) -> Result<Option<Vec<Quad>>> {
        let result = self
            .call_function(
                &handle.realm,
                "function() { return JSON.stringify([...this.getClientRects()].map(rect => \
                 [rect.left, rect.top, rect.right, rect.top, \
                  rect.right, rect.bottom, rect.left, rect.bottom])); }",
                Some(handle),
                Vec::new(),
                true,
            )
            .await?;
        let CallResult::Value(JsValue::String(encoded)) = result else {
            return Ok(None);
        };
        let parsed: Value = serde_json::from_str(&encoded)?;
        let Some(rects) = parsed.as_array() else {
            return Ok(None);
        };
        let quads = rects
            .iter()
            .filter_map(|rect| {
                let c: Vec<f64> = rect.as_array()?.iter().filter_map(Value::as_f64).collect();
                (c.len() == 8).then(|| {
                    [
                        drover_protocol::Point { x: c[0], y: c[1] },
                        drover_protocol::Point { x: c[2], y: c[3] },
                        drover_protocol::Point { x: c[4], y: c[5] },
                        drover_protocol::Point { x: c[6], y: c[7] },
                    ]
                })
            })
            .collect();
        Ok(Some(quads))
    }

    async fn set_input_files(&self, handle: &RemoteHandle, paths: &[String]) -> Result<()> {
        let (target, _) = self.target_for_realm(&handle.realm)?;
        target
            .session
            .send(
                "DOM.setInputFiles",
                json!({ "objectId": handle.object_id.as_ref(), "paths": paths }),
            )
            .await?;
        Ok(())
    }

    async fn take_screenshot(
        &self,
        _format: ScreenshotFormat,
        clip: Option<Rect>,
        _quality: Option<u8>,
    ) -> Result<Vec<u8>> {
        let target = self.shared.current_target()?;
        let rect = clip.unwrap_or(Rect {
            x: 0.0,
            y: 0.0,
            width: 1280.0,
            height: 720.0,
        });
        let result = target
            .session
            .send(
                "Page.snapshotRect",
                json!({
                    "x": rect.x, "y": rect.y,
                    "width": rect.width, "height": rect.height,
                    "coordinateSystem": "Viewport",
                }),
            )
            .await?;
        let data_url = str_field(&result, "dataURL")?;
        let encoded = data_url.split(',').nth(1).ok_or_else(|| Error::Protocol {
            method: "Page.snapshotRect".to_string(),
            message: "malformed data URL".to_string(),
        })?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Protocol {
                method: "Page.snapshotRect".to_string(),
                message: format!("invalid image payload: {e}"),
            })
    }

    async fn reload(&self) -> Result<()> {
        self.shared
            .current_target()?
            .session
            .send("Page.reload", Value::Null)
            .await?;
        Ok(())
    }

    async fn go_back(&self) -> Result<bool> {
        let target = self.shared.current_target()?;
        match target.session.send("Page.goBack", Value::Null).await {
            Ok(_) => Ok(true),
            Err(Error::Protocol { message, .. })
                if message.to_ascii_lowercase().contains("history") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn go_forward(&self) -> Result<bool> {
        let target = self.shared.current_target()?;
        match target.session.send("Page.goForward", Value::Null).await {
            Ok(_) => Ok(true),
            Err(Error::Protocol { message, .. })
                if message.to_ascii_lowercase().contains("history") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn close_page(&self, run_before_unload: bool) -> Result<()> {
        if run_before_unload {
            self.shared
                .current_target()?
                .session
                .send("Page.close", Value::Null)
                .await?;
        } else {
            self.shared
                .proxy_session
                .send_may_fail(
                    "Target.close",
                    json!({ "targetId": self.shared.page_proxy_id }),
                )
                .await?;
        }
        Ok(())
    }

    fn raw_mouse(&self) -> &dyn RawMouse {
        &self.mouse
    }

    fn raw_keyboard(&self) -> &dyn RawKeyboard {
        &self.keyboard
    }

    fn raw_touchscreen(&self) -> &dyn RawTouchscreen {
        &self.touchscreen
    }
}
