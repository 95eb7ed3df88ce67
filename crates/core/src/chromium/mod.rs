//! Chromium backend, speaking the DevTools Protocol.
//!
//! Chromium's session topology is flat: the browser connection carries one
//! child session per target, routed by `sessionId`. A page starts with one
//! target session for its main frame; out-of-process iframes arrive as
//! additional targets via `Target.attachedToTarget` and get their own
//! [`TargetSession`], each owning the realm table and network index for the
//! frames it hosts.
//!
//! Commit detection is explicit on this backend: `Page.frameNavigated`
//! carries the committed document's loader id.

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
    FrameId, JsValue, LifecycleEvent, Point, Quad, RealmId, Rect, ScreenshotFormat, World,
};
use drover_runtime::{Connection, Error, Result, Session, SessionEvent, SessionRoute};
use network::ChromiumNetwork;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Name of the isolated world provisioned for internal helpers.
pub const UTILITY_WORLD_NAME: &str = "__drover_utility_world__";

/// A page driven over the Chromium DevTools Protocol.
pub struct ChromiumPage {
    shared: Arc<PageShared>,
    mouse: input::ChromiumMouse,
    keyboard: input::ChromiumKeyboard,
    touchscreen: input::ChromiumTouchscreen,
}

struct PageShared {
    connection: Arc<Connection>,
    target_id: FrameId,
    sink: PageEventSink,
    frames: FrameTracker,
    targets: Mutex<HashMap<Arc<str>, Arc<TargetSession>>>,
}

/// Per-target binder: one protocol session bound to a subtree of the frame
/// tree, owning that subtree's realms and network correlation.
struct TargetSession {
    target_id: Arc<str>,
    /// Connection registry key; empty for the main target whose session was
    /// handed to us already attached.
    session_key: Option<String>,
    session: Arc<Session>,
    realms: RealmTable,
    network: ChromiumNetwork,
    page: Weak<PageShared>,
}

impl ChromiumPage {
    /// Binds an attached page target and starts its event loop. Returns the
    /// page and the receiving end of its event channel.
    pub async fn attach(
        connection: Arc<Connection>,
        session: Arc<Session>,
        target_id: FrameId,
    ) -> Result<(ChromiumPage, mpsc::Receiver<PageEvent>)> {
        let (sink, events) = PageEventSink::channel();
        let shared = Arc::new(PageShared {
            connection,
            target_id: target_id.clone(),
            sink,
            frames: FrameTracker::new(),
            targets: Mutex::new(HashMap::new()),
        });

        let target = TargetSession::spawn(&shared, target_id, None, Arc::clone(&session));
        target.initialize().await?;

        let page = ChromiumPage {
            mouse: input::ChromiumMouse::new(Arc::clone(&session)),
            keyboard: input::ChromiumKeyboard::new(Arc::clone(&session)),
            touchscreen: input::ChromiumTouchscreen::new(session),
            shared,
        };
        Ok((page, events))
    }

    fn main_target(&self) -> Result<Arc<TargetSession>> {
        self.shared.target(&self.shared.target_id)
    }

    /// The target session hosting a frame: the closest ancestor that is a
    /// target root. Frame ids equal target ids for target roots.
    fn session_for_frame(&self, frame: &FrameId) -> Result<Arc<TargetSession>> {
        let mut cursor = frame.clone();
        loop {
            if let Some(target) = self.shared.targets.lock().get(&cursor).cloned() {
                return Ok(target);
            }
            match self.shared.frames.parent(&cursor) {
                Some(parent) => cursor = parent,
                None => return Err(Error::FrameDetached),
            }
        }
    }

    fn target_for_realm(&self, realm: &RealmId) -> Result<(Arc<TargetSession>, RealmEntry)> {
        let targets: Vec<Arc<TargetSession>> =
            self.shared.targets.lock().values().cloned().collect();
        for target in targets {
            if let Some(entry) = target.realms.get(realm) {
                return Ok((target, entry));
            }
        }
        Err(Error::ContextDestroyed)
    }

    fn context_id(entry: &RealmEntry) -> Result<i64> {
        match entry.address {
            RealmAddress::ContextId(id) => Ok(id),
            _ => Err(Error::ContextDestroyed),
        }
    }
}

#[async_trait]
impl crate::delegate::PageDelegate for ChromiumPage {
    async fn navigate_frame(
        &self,
        frame: &FrameId,
        url: &str,
        referrer: Option<&str>,
    ) -> Result<GotoResult> {
        let target = self.session_for_frame(frame)?;
        let mut params = json!({ "url": url, "frameId": frame.as_ref() });
        if let Some(referrer) = referrer {
            params["referrer"] = json!(referrer);
        }
        let result = target.session.send("Page.navigate", params).await?;
        if let Some(error_text) = opt_str(&result, "errorText") {
            return Err(Error::Protocol {
                method: "Page.navigate".to_string(),
                message: format!("{error_text} at {url}"),
            });
        }
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
        let result = context::call_function(
            &target.session,
            Self::context_id(&entry)?,
            declaration,
            this.map(|handle| handle.object_id.clone()),
            arguments,
            return_by_value,
        )
        .await?;
        Ok(match result {
            context::CallOutcome::Value(value) => CallResult::Value(value),
            context::CallOutcome::Handle(object_id) => CallResult::Handle(RemoteHandle {
                realm: realm.clone(),
                object_id,
            }),
        })
    }

    async fn release_handle(&self, handle: &RemoteHandle) -> Result<()> {
        // Realm already gone means the remote side released everything.
        let Ok((target, _)) = self.target_for_realm(&handle.realm) else {
            return Ok(());
        };
        context::release_object(&target.session, &handle.object_id).await;
        Ok(())
    }

    async fn get_bounding_box(&self, handle: &RemoteHandle) -> Result<Option<Rect>> {
        let (target, _) = self.target_for_realm(&handle.realm)?;
        let result = target
            .session
            .send("DOM.getBoxModel", json!({ "objectId": handle.object_id.as_ref() }))
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) if e.is_stale_reference() => return Err(e),
            Err(_) => return Ok(None),
        };
        let Some(border) = result["model"]["border"].as_array() else {
            return Ok(None);
        };
        let coords: Vec<f64> = border.iter().filter_map(Value::as_f64).collect();
        if coords.len() != 8 {
            return Ok(None);
        }
        let xs = [coords[0], coords[2], coords[4], coords[6]];
        let ys = [coords[1], coords[3], coords[5], coords[7]];
        let x = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let y = ys.iter().copied().fold(f64::INFINITY, f64::min);
        Ok(Some(Rect {
            x,
            y,
            width: xs.iter().copied().fold(f64::NEG_INFINITY, f64::max) - x,
            height: ys.iter().copied().fold(f64::NEG_INFINITY, f64::max) - y,
        }))
    }

    async fn get_content_quads(&self, handle: &RemoteHandle) -> Result<Option<Vec<Quad>>> {
        let (target, _) = self.target_for_realm(&handle.realm)?;
        let result = target
            .session
            .send(
                "DOM.getContentQuads",
                json!({ "objectId": handle.object_id.as_ref() }),
            )
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) if e.is_stale_reference() => return Err(e),
            Err(_) => return Ok(None),
        };
        let Some(quads) = result["quads"].as_array() else {
            return Ok(None);
        };
        let quads = quads
            .iter()
            .filter_map(|quad| {
                let q: Vec<f64> = quad.as_array()?.iter().filter_map(Value::as_f64).collect();
                (q.len() == 8).then(|| {
                    [
                        Point { x: q[0], y: q[1] },
                        Point { x: q[2], y: q[3] },
                        Point { x: q[4], y: q[5] },
                        Point { x: q[6], y: q[7] },
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
                "DOM.setFileInputFiles",
                json!({ "objectId": handle.object_id.as_ref(), "files": paths }),
            )
            .await?;
        Ok(())
    }

    async fn take_screenshot(
        &self,
        format: ScreenshotFormat,
        clip: Option<Rect>,
        quality: Option<u8>,
    ) -> Result<Vec<u8>> {
        let main = self.main_target()?;
        let mut params = json!({
            "format": match format {
                ScreenshotFormat::Png => "png",
                ScreenshotFormat::Jpeg => "jpeg",
            },
        });
        if let Some(quality) = quality {
            params["quality"] = json!(quality);
        }
        if let Some(clip) = clip {
            params["clip"] = json!({
                "x": clip.x, "y": clip.y,
                "width": clip.width, "height": clip.height,
                "scale": 1,
            });
        }
        let result = main.session.send("Page.captureScreenshot", params).await?;
        let data = str_field(&result, "data")?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::Protocol {
                method: "Page.captureScreenshot".to_string(),
                message: format!("invalid image payload: {e}"),
            })
    }

    async fn reload(&self) -> Result<()> {
        self.main_target()?
            .session
            .send("Page.reload", Value::Null)
            .await?;
        Ok(())
    }

    async fn go_back(&self) -> Result<bool> {
        self.traverse_history(-1).await
    }

    async fn go_forward(&self) -> Result<bool> {
        self.traverse_history(1).await
    }

    async fn close_page(&self, run_before_unload: bool) -> Result<()> {
        if run_before_unload {
            self.main_target()?
                .session
                .send("Page.close", Value::Null)
                .await?;
        } else {
            self.shared
                .connection
                .root_session()
                .send(
                    "Target.closeTarget",
                    json!({ "targetId": self.shared.target_id.as_ref() }),
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

impl ChromiumPage {
    async fn traverse_history(&self, delta: i64) -> Result<bool> {
        let main = self.main_target()?;
        let history = main
            .session
            .send("Page.getNavigationHistory", Value::Null)
            .await?;
        let current = history["currentIndex"].as_i64().unwrap_or(0);
        let Some(entries) = history["entries"].as_array() else {
            return Ok(false);
        };
        let index = current + delta;
        let Some(entry) = usize::try_from(index).ok().and_then(|i| entries.get(i)) else {
            return Ok(false);
        };
        let entry_id = entry["id"].as_i64().ok_or_else(|| Error::Protocol {
            method: "Page.getNavigationHistory".to_string(),
            message: "entry missing id".to_string(),
        })?;
        main.session
            .send("Page.navigateToHistoryEntry", json!({ "entryId": entry_id }))
            .await?;
        Ok(true)
    }
}

impl PageShared {
    fn target(&self, target_id: &Arc<str>) -> Result<Arc<TargetSession>> {
        self.targets
            .lock()
            .get(target_id)
            .cloned()
            .ok_or(Error::FrameDetached)
    }
}

impl TargetSession {
    /// Registers the target and starts consuming its event stream.
    fn spawn(
        shared: &Arc<PageShared>,
        target_id: Arc<str>,
        session_key: Option<String>,
        session: Arc<Session>,
    ) -> Arc<TargetSession> {
        let mut events = session.subscribe();
        let target = Arc::new(TargetSession {
            target_id: target_id.clone(),
            session_key,
            session,
            realms: RealmTable::new(),
            network: ChromiumNetwork::new(),
            page: Arc::downgrade(shared),
        });
        shared.targets.lock().insert(target_id, Arc::clone(&target));

        tokio::spawn({
            let target = Arc::clone(&target);
            async move {
                while let Some(event) = events.recv().await {
                    let Some(page) = target.page.upgrade() else {
                        break;
                    };
                    if let Err(e) = target.handle_event(&page, event).await {
                        page.sink.report_error(&e).await;
                    }
                }
            }
        });
        target
    }

    /// Session-initialization sequence for one target.
    async fn initialize(&self) -> Result<()> {
        let page = self.page.upgrade().ok_or(Error::ChannelClosed)?;
        self.session.send("Page.enable", Value::Null).await?;

        let tree = self.session.send("Page.getFrameTree", Value::Null).await?;
        self.handle_frame_tree(&page, &tree["frameTree"]).await?;

        self.session
            .send("Page.setLifecycleEventsEnabled", json!({ "enabled": true }))
            .await?;
        self.session.send("Runtime.enable", Value::Null).await?;
        self.session
            .send(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": "", "worldName": UTILITY_WORLD_NAME }),
            )
            .await?;
        // Frames might detach before these land.
        for frame in page.frames.frame_ids() {
            self.session
                .send_may_fail(
                    "Page.createIsolatedWorld",
                    json!({
                        "frameId": frame.as_ref(),
                        "worldName": UTILITY_WORLD_NAME,
                        "grantUniveralAccess": true,
                    }),
                )
                .await?;
        }
        self.session.send("Network.enable", Value::Null).await?;
        self.session
            .send(
                "Target.setAutoAttach",
                json!({ "autoAttach": true, "waitForDebuggerOnStart": true, "flatten": true }),
            )
            .await?;
        self.session
            .send_may_fail("Runtime.runIfWaitingForDebugger", Value::Null)
            .await?;
        Ok(())
    }

    /// Synthesizes attach/commit notifications for frames that existed
    /// before we attached.
    async fn handle_frame_tree(
        &self,
        page: &Arc<PageShared>,
        tree: &Value,
    ) -> Result<()> {
        let mut stack = vec![(tree.clone(), None::<Arc<str>>)];
        while let Some((node, parent)) = stack.pop() {
            let frame = &node["frame"];
            let frame_id = arc_field(frame, "id")?;
            self.on_frame_attached(page, frame_id.clone(), parent).await;
            self.on_frame_navigated(page, frame).await?;
            if let Some(children) = node["childFrames"].as_array() {
                for child in children {
                    stack.push((child.clone(), Some(frame_id.clone())));
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&self, page: &Arc<PageShared>, event: SessionEvent) -> Result<()> {
        let params = &event.params;
        match event.method.as_str() {
            "Page.frameAttached" => {
                let frame = arc_field(params, "frameId")?;
                let parent = opt_arc(params, "parentFrameId");
                if page.targets.lock().contains_key(&frame) && frame != self.target_id {
                    // Remote frame became local again; its subtree will be
                    // re-announced by this session.
                    self.remove_child_frames(page, &frame).await;
                    return Ok(());
                }
                self.on_frame_attached(page, frame, parent).await;
            }
            "Page.frameDetached" => {
                let frame = arc_field(params, "frameId")?;
                if page.targets.lock().contains_key(&frame) {
                    // Local frame went remote; the new target re-announces.
                    return Ok(());
                }
                self.on_frame_detached(page, &frame).await;
            }
            "Page.frameNavigated" => {
                self.on_frame_navigated(page, &params["frame"]).await?;
            }
            "Page.frameRequestedNavigation" => {
                if opt_str(params, "disposition") == Some("currentTab") {
                    let frame = arc_field(params, "frameId")?;
                    page.frames.navigation_requested(&frame, None);
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
            "Page.lifecycleEvent" => {
                let Some(lifecycle) = (match opt_str(params, "name") {
                    Some("load") => Some(LifecycleEvent::Load),
                    Some("DOMContentLoaded") => Some(LifecycleEvent::DomContentLoaded),
                    _ => None,
                }) else {
                    return Ok(());
                };
                let frame = arc_field(params, "frameId")?;
                let loader = opt_arc(params, "loaderId");
                if page
                    .frames
                    .lifecycle_event(&frame, loader.as_ref(), lifecycle)
                {
                    page.sink
                        .emit(PageEvent::Lifecycle {
                            frame,
                            event: lifecycle,
                        })
                        .await;
                }
            }
            "Runtime.executionContextCreated" => {
                self.on_execution_context_created(page, &params["context"])
                    .await?;
            }
            "Runtime.executionContextDestroyed" => {
                let Some(id) = params["executionContextId"].as_i64() else {
                    return Ok(());
                };
                let realm: Arc<str> = Arc::from(id.to_string());
                if let Some(entry) = self.realms.destroyed(&realm) {
                    if entry.world.is_some() {
                        page.sink
                            .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                            .await;
                    }
                }
            }
            "Runtime.executionContextsCleared" => {
                for entry in self.realms.clear() {
                    if entry.world.is_some() {
                        page.sink
                            .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                            .await;
                    }
                }
            }
            "Runtime.consoleAPICalled" => {
                // Messages from cleared contexts are replayed with context
                // id 0 on Runtime.enable; there is no realm to act on them.
                if params["executionContextId"].as_i64() == Some(0) {
                    return Ok(());
                }
                let level = opt_str(params, "type").unwrap_or("log").to_string();
                let text = console_preview(&params["args"]);
                page.sink.emit(PageEvent::Console { level, text }).await;
            }
            "Runtime.exceptionThrown" => {
                let text = params["exceptionDetails"]["text"]
                    .as_str()
                    .unwrap_or("Uncaught exception")
                    .to_string();
                page.sink.emit(PageEvent::Error { message: text }).await;
            }
            "Log.entryAdded" => {
                let entry = &params["entry"];
                if opt_str(entry, "source") == Some("worker") {
                    return Ok(());
                }
                page.sink
                    .emit(PageEvent::Console {
                        level: opt_str(entry, "level").unwrap_or("info").to_string(),
                        text: opt_str(entry, "text").unwrap_or_default().to_string(),
                    })
                    .await;
            }
            "Inspector.targetCrashed" => {
                self.session.mark_crashed();
                page.sink.emit(PageEvent::Crashed).await;
            }
            "Target.attachedToTarget" => {
                self.on_attached_to_target(page, params).await?;
            }
            "Target.detachedFromTarget" => {
                if let Some(target_id) = opt_arc(params, "targetId") {
                    self.on_target_removed(page, &target_id).await;
                }
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
        page: &Arc<PageShared>,
        frame: Arc<str>,
        parent: Option<Arc<str>>,
    ) {
        if page.frames.attach(&frame, parent.as_ref()) {
            page.sink
                .emit(PageEvent::FrameAttached { frame, parent })
                .await;
        }
    }

    async fn on_frame_detached(&self, page: &Arc<PageShared>, frame: &FrameId) {
        for removed in page.frames.detach(frame) {
            self.destroy_frame_realms(page, &removed).await;
            page.sink
                .emit(PageEvent::FrameDetached { frame: removed })
                .await;
        }
    }

    async fn remove_child_frames(&self, page: &Arc<PageShared>, frame: &FrameId) {
        for removed in page.frames.remove_children(frame) {
            self.destroy_frame_realms(page, &removed).await;
            page.sink
                .emit(PageEvent::FrameDetached { frame: removed })
                .await;
        }
    }

    /// Realms die with their frame, before the detach is reported, in every
    /// target session that tracked them.
    async fn destroy_frame_realms(&self, page: &Arc<PageShared>, frame: &FrameId) {
        let targets: Vec<Arc<TargetSession>> = page.targets.lock().values().cloned().collect();
        for target in targets {
            for entry in target.realms.remove_frame(frame) {
                if entry.world.is_some() {
                    page.sink
                        .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                        .await;
                }
            }
        }
    }

    async fn on_frame_navigated(&self, page: &Arc<PageShared>, frame: &Value) -> Result<()> {
        let frame_id = arc_field(frame, "id")?;
        let loader = arc_field(frame, "loaderId")?;
        let mut url = str_field(frame, "url")?.to_string();
        if let Some(fragment) = opt_str(frame, "urlFragment") {
            url.push_str(fragment);
        }
        if page.frames.commit_new_document(&frame_id, &url, &loader) == CommitOutcome::Committed {
            page.sink
                .emit(PageEvent::CommittedNewDocument {
                    frame: frame_id,
                    url,
                    document: loader,
                })
                .await;
        }
        Ok(())
    }

    async fn on_execution_context_created(
        &self,
        page: &Arc<PageShared>,
        context: &Value,
    ) -> Result<()> {
        let Some(frame_id) = context["auxData"]["frameId"].as_str().map(Arc::from) else {
            return Ok(());
        };
        if !page.frames.contains(&frame_id) {
            return Ok(());
        }
        let Some(id) = context["id"].as_i64() else {
            return Ok(());
        };
        let world = if context["auxData"]["isDefault"].as_bool() == Some(true) {
            // The utility world is not recreated automatically on every
            // navigation; touch it whenever a main world appears.
            self.touch_utility_world(&frame_id);
            Some(World::Main)
        } else if opt_str(context, "name") == Some(UTILITY_WORLD_NAME) {
            Some(World::Utility)
        } else {
            None
        };
        let realm: Arc<str> = Arc::from(id.to_string());
        let created = self.realms.created(RealmEntry {
            realm: realm.clone(),
            frame: frame_id.clone(),
            world,
            address: RealmAddress::ContextId(id),
        });
        if created {
            if let Some(world) = world {
                page.sink
                    .emit(PageEvent::ContextCreated {
                        frame: frame_id,
                        world,
                        realm,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Best-effort: the target may be mid-navigation or already closing.
    fn touch_utility_world(&self, frame: &FrameId) {
        let session = Arc::clone(&self.session);
        let frame = frame.clone();
        tokio::spawn(async move {
            let result = session
                .send_may_fail(
                    "Page.createIsolatedWorld",
                    json!({
                        "frameId": frame.as_ref(),
                        "worldName": UTILITY_WORLD_NAME,
                        "grantUniveralAccess": true,
                    }),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(frame = frame.as_ref(), error = %e, "utility world provisioning failed");
            }
        });
    }

    async fn on_attached_to_target(&self, page: &Arc<PageShared>, params: &Value) -> Result<()> {
        let info = &params["targetInfo"];
        let session_id = str_field(params, "sessionId")?.to_string();
        let target_id = arc_field(info, "targetId")?;

        if opt_str(info, "type") != Some("iframe") {
            // Not ours to drive; resume it (auto-attach paused it), then
            // detach. Detaching alone does not reliably resume the target.
            let child = page
                .connection
                .create_session(&session_id, SessionRoute::SessionId(session_id.clone()));
            let parent = Arc::clone(&self.session);
            let connection = Arc::clone(&page.connection);
            tokio::spawn(async move {
                let _ = child
                    .send_may_fail("Runtime.runIfWaitingForDebugger", Value::Null)
                    .await;
                let _ = parent
                    .send_may_fail(
                        "Target.detachFromTarget",
                        json!({ "sessionId": session_id }),
                    )
                    .await;
                connection.remove_session(&session_id);
            });
            return Ok(());
        }

        // An out-of-process iframe: its subtree moves to the new session.
        self.remove_child_frames(page, &target_id).await;
        let session = page
            .connection
            .create_session(&session_id, SessionRoute::SessionId(session_id.clone()));
        let Some(shared) = self.page.upgrade() else {
            return Ok(());
        };
        let child = TargetSession::spawn(&shared, target_id, Some(session_id), session);
        // Not awaited: initialization must not stall this session's event
        // loop, and the frame may be gone before it completes.
        tokio::spawn(async move {
            if let Err(e) = child.initialize().await {
                tracing::debug!(error = %e, "child target initialization failed");
            }
        });
        Ok(())
    }

    async fn on_target_removed(&self, page: &Arc<PageShared>, target_id: &Arc<str>) {
        let Some(target) = page.targets.lock().remove(target_id) else {
            return;
        };
        self.remove_child_frames(page, target_id).await;
        for entry in target.realms.clear() {
            if entry.world.is_some() {
                page.sink
                    .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                    .await;
            }
        }
        if let Some(key) = &target.session_key {
            page.connection.remove_session(key);
        } else {
            target.session.dispose();
        }
    }
}

/// Short human-readable preview of console call arguments.
fn console_preview(args: &Value) -> String {
    let Some(args) = args.as_array() else {
        return String::new();
    };
    args.iter()
        .map(|arg| {
            arg["value"]
                .as_str()
                .map(str::to_string)
                .or_else(|| arg["description"].as_str().map(str::to_string))
                .unwrap_or_else(|| arg["value"].to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}
