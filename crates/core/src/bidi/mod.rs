//! WebDriver BiDi backend.
//!
//! BiDi has no child sessions: one ordered stream carries traffic for every
//! browsing context, and commands address contexts in their parameters. A
//! page tracks the subtree rooted at its top-level browsing context and
//! ignores events for contexts it does not own.
//!
//! Commit detection is inferred on this backend — there is no dedicated
//! "committed" signal. A navigation commits on the first network
//! `responseStarted` carrying its navigation id; navigations to schemes
//! that never touch the network (`about:`, `data:`, `file:`, `blob:`)
//! commit synchronously on `navigationStarted`. `domContentLoaded` also
//! commits, idempotently, which covers cached documents whose response
//! event lost the race.

mod context;
mod input;
mod network;
mod serde;

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
use drover_runtime::{Error, Result, Session, SessionEvent};
use network::BidiNetwork;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sandbox name of the isolated world provisioned for internal helpers.
pub const UTILITY_WORLD_NAME: &str = "__drover_utility_world__";

/// A page driven over WebDriver BiDi.
pub struct BidiPage {
    shared: Arc<BidiShared>,
    mouse: input::BidiMouse,
    keyboard: input::BidiKeyboard,
    touchscreen: input::BidiTouchscreen,
}

struct BidiShared {
    session: Arc<Session>,
    /// Top-level browsing context this page drives.
    context: FrameId,
    sink: PageEventSink,
    frames: FrameTracker,
    realms: RealmTable,
    network: BidiNetwork,
}

impl BidiPage {
    /// Binds a browsing context and starts the event loop.
    pub async fn attach(
        session: Arc<Session>,
        context: FrameId,
    ) -> Result<(BidiPage, mpsc::Receiver<PageEvent>)> {
        let (sink, events) = PageEventSink::channel();
        let shared = Arc::new(BidiShared {
            session: Arc::clone(&session),
            context: context.clone(),
            sink,
            frames: FrameTracker::new(),
            realms: RealmTable::new(),
            network: BidiNetwork::new(),
        });

        let mut stream = session.subscribe();
        tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                while let Some(event) = stream.recv().await {
                    if let Err(e) = shared.handle_event(event).await {
                        shared.sink.report_error(&e).await;
                    }
                }
            }
        });

        shared.initialize().await?;

        let page = BidiPage {
            mouse: input::BidiMouse::new(Arc::clone(&session), context.clone()),
            keyboard: input::BidiKeyboard::new(Arc::clone(&session), context.clone()),
            touchscreen: input::BidiTouchscreen::new(session, context),
            shared,
        };
        Ok((page, events))
    }

    fn realm_entry(&self, realm: &RealmId) -> Result<RealmEntry> {
        self.shared.realms.get(realm).ok_or(Error::ContextDestroyed)
    }
}

impl BidiShared {
    async fn initialize(&self) -> Result<()> {
        self.session
            .send(
                "session.subscribe",
                json!({ "events": ["browsingContext", "network", "log", "script"] }),
            )
            .await?;
        let tree = self
            .session
            .send(
                "browsingContext.getTree",
                json!({ "root": self.context.as_ref() }),
            )
            .await?;
        if let Some(contexts) = tree["contexts"].as_array() {
            for root in contexts {
                self.handle_context_tree(root, None).await?;
            }
        }
        Ok(())
    }

    /// Walks an existing context tree, announcing each frame.
    async fn handle_context_tree(
        &self,
        node: &Value,
        parent: Option<FrameId>,
    ) -> Result<()> {
        let frame = arc_field(node, "context")?;
        let parent = parent.or_else(|| opt_arc(node, "parent"));
        self.attach_frame(frame.clone(), parent).await;
        if let Some(children) = node["children"].as_array() {
            for child in children {
                Box::pin(self.handle_context_tree(child, Some(frame.clone()))).await?;
            }
        }
        Ok(())
    }

    async fn attach_frame(&self, frame: FrameId, parent: Option<FrameId>) {
        if self.frames.attach(&frame, parent.as_ref()) {
            self.sink
                .emit(PageEvent::FrameAttached { frame, parent })
                .await;
        }
    }

    /// True when this page owns the browsing context.
    fn owns(&self, context: &FrameId) -> bool {
        self.frames.contains(context) || *context == self.context
    }

    async fn handle_event(&self, event: SessionEvent) -> Result<()> {
        let params = &event.params;
        match event.method.as_str() {
            "browsingContext.contextCreated" => {
                let frame = arc_field(params, "context")?;
                let parent = opt_arc(params, "parent");
                let ours = frame == self.context
                    || parent.as_ref().is_some_and(|parent| self.frames.contains(parent));
                if ours {
                    self.attach_frame(frame, parent).await;
                }
            }
            "browsingContext.contextDestroyed" => {
                let frame = arc_field(params, "context")?;
                if self.owns(&frame) {
                    self.detach_frame(&frame).await;
                }
            }
            "browsingContext.navigationStarted" => {
                let frame = arc_field(params, "context")?;
                if !self.owns(&frame) {
                    return Ok(());
                }
                let navigation = opt_arc(params, "navigation");
                let url = str_field(params, "url")?;
                self.frames.navigation_requested(&frame, navigation.as_ref());
                // No network traffic will ever commit these; do it now.
                if let Some(navigation) = navigation {
                    if has_no_network_scheme(url) {
                        self.commit_navigation(&frame, url, &navigation).await;
                    }
                }
            }
            "browsingContext.fragmentNavigated" => {
                let frame = arc_field(params, "context")?;
                let url = str_field(params, "url")?;
                if self.owns(&frame) && self.frames.commit_same_document(&frame, url) {
                    self.sink
                        .emit(PageEvent::CommittedSameDocument {
                            frame,
                            url: url.to_string(),
                        })
                        .await;
                }
            }
            "browsingContext.domContentLoaded" => {
                let frame = arc_field(params, "context")?;
                if !self.owns(&frame) {
                    return Ok(());
                }
                let navigation = opt_arc(params, "navigation");
                let url = str_field(params, "url")?;
                if let Some(navigation) = &navigation {
                    self.commit_navigation(&frame, url, navigation).await;
                }
                if self
                    .frames
                    .lifecycle_event(&frame, navigation.as_ref(), LifecycleEvent::DomContentLoaded)
                {
                    self.sink
                        .emit(PageEvent::Lifecycle {
                            frame,
                            event: LifecycleEvent::DomContentLoaded,
                        })
                        .await;
                }
            }
            "browsingContext.load" => {
                let frame = arc_field(params, "context")?;
                let navigation = opt_arc(params, "navigation");
                if self.owns(&frame)
                    && self
                        .frames
                        .lifecycle_event(&frame, navigation.as_ref(), LifecycleEvent::Load)
                {
                    self.sink
                        .emit(PageEvent::Lifecycle {
                            frame,
                            event: LifecycleEvent::Load,
                        })
                        .await;
                }
            }
            "browsingContext.navigationAborted" | "browsingContext.navigationFailed" => {
                let frame = arc_field(params, "context")?;
                if !self.owns(&frame) {
                    return Ok(());
                }
                let navigation = opt_arc(params, "navigation");
                if self.frames.navigation_aborted(&frame, navigation.as_ref()) {
                    let error = if event.method.ends_with("Aborted") {
                        "Navigation aborted"
                    } else {
                        "Navigation failed"
                    };
                    self.sink
                        .emit(PageEvent::NavigationFailed {
                            frame,
                            document: navigation,
                            error: error.to_string(),
                        })
                        .await;
                }
            }
            "script.realmCreated" => self.on_realm_created(params).await?,
            "script.realmDestroyed" => {
                let realm = arc_field(params, "realm")?;
                if let Some(entry) = self.realms.destroyed(&realm) {
                    if entry.world.is_some() {
                        self.sink
                            .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                            .await;
                    }
                }
            }
            "log.entryAdded" => {
                let context = params["source"]["context"].as_str().map(Arc::from);
                if context.is_none_or(|context: Arc<str>| self.owns(&context)) {
                    self.sink
                        .emit(PageEvent::Console {
                            level: opt_str(params, "level").unwrap_or("info").to_string(),
                            text: opt_str(params, "text").unwrap_or_default().to_string(),
                        })
                        .await;
                }
            }
            method if method.starts_with("network.") => {
                self.network.handle_event(self, method, params).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_realm_created(&self, params: &Value) -> Result<()> {
        if opt_str(params, "type") != Some("window") {
            return Ok(());
        }
        let realm = arc_field(params, "realm")?;
        let frame = arc_field(params, "context")?;
        if !self.owns(&frame) {
            return Ok(());
        }
        let sandbox = opt_arc(params, "sandbox");
        let world = match sandbox.as_deref() {
            None => {
                // The utility world is not recreated automatically when the
                // main world reappears after a navigation; touch it.
                self.touch_utility_world(&frame);
                Some(World::Main)
            }
            Some(UTILITY_WORLD_NAME) => Some(World::Utility),
            Some(_) => None,
        };
        let created = self.realms.created(RealmEntry {
            realm: realm.clone(),
            frame: frame.clone(),
            world,
            address: RealmAddress::Handle(realm.clone()),
        });
        if created {
            if let Some(world) = world {
                self.sink
                    .emit(PageEvent::ContextCreated {
                        frame,
                        world,
                        realm,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Best-effort sandbox provisioning over a frame that may be navigating
    /// away; failure must not impair the main realm.
    fn touch_utility_world(&self, frame: &FrameId) {
        let session = Arc::clone(&self.session);
        let frame = frame.clone();
        tokio::spawn(async move {
            let result = session
                .send_may_fail(
                    "script.evaluate",
                    json!({
                        "expression": "1 + 1",
                        "target": { "context": frame.as_ref(), "sandbox": UTILITY_WORLD_NAME },
                        "serializationOptions": { "maxObjectDepth": 10, "maxDomDepth": 10 },
                        "awaitPromise": true,
                        "userActivation": true,
                    }),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(frame = frame.as_ref(), error = %e, "utility world provisioning failed");
            }
        });
    }

    async fn detach_frame(&self, frame: &FrameId) {
        for removed in self.frames.detach(frame) {
            for entry in self.realms.remove_frame(&removed) {
                if entry.world.is_some() {
                    self.sink
                        .emit(PageEvent::ContextDestroyed { realm: entry.realm })
                        .await;
                }
            }
            self.sink
                .emit(PageEvent::FrameDetached { frame: removed })
                .await;
        }
    }

    /// Idempotent commit shared by the three inference paths.
    pub(crate) async fn commit_navigation(
        &self,
        frame: &FrameId,
        url: &str,
        navigation: &Arc<str>,
    ) {
        if self.frames.commit_new_document(frame, url, navigation) == CommitOutcome::Committed {
            self.sink
                .emit(PageEvent::CommittedNewDocument {
                    frame: frame.clone(),
                    url: url.to_string(),
                    document: navigation.clone(),
                })
                .await;
        }
    }
}

/// Schemes that never produce network events and must commit synchronously.
fn has_no_network_scheme(url: &str) -> bool {
    ["about:", "data:", "file:", "blob:"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

#[async_trait]
impl crate::delegate::PageDelegate for BidiPage {
    async fn navigate_frame(
        &self,
        frame: &FrameId,
        url: &str,
        _referrer: Option<&str>,
    ) -> Result<GotoResult> {
        let result = self
            .shared
            .session
            .send(
                "browsingContext.navigate",
                json!({ "context": frame.as_ref(), "url": url }),
            )
            .await?;
        Ok(GotoResult {
            new_document: opt_arc(&result, "navigation"),
        })
    }

    async fn evaluate(&self, realm: &RealmId, expression: &str) -> Result<JsValue> {
        self.realm_entry(realm)?;
        context::evaluate(&self.shared.session, realm, expression).await
    }

    async fn evaluate_handle(&self, realm: &RealmId, expression: &str) -> Result<RemoteHandle> {
        self.realm_entry(realm)?;
        let object_id = context::evaluate_handle(&self.shared.session, realm, expression).await?;
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
        self.realm_entry(realm)?;
        let outcome = context::call_function(
            &self.shared.session,
            realm,
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
        if self.shared.realms.get(&handle.realm).is_none() {
            return Ok(());
        }
        context::disown(&self.shared.session, &handle.realm, &handle.object_id).await;
        Ok(())
    }

    async fn get_bounding_box(&self, handle: &RemoteHandle) -> Result<Option<Rect>> {
        let result = self
            .call_function(
                &handle.realm,
                "node => { const rects = node.getClientRects(); if (!rects.length) return null; \
                 const r = node.getBoundingClientRect(); \
                 return { x: r.x, y: r.y, width: r.width, height: r.height }; }",
                Some(handle),
                Vec::new(),
                true,
            )
            .await?;
        let CallResult::Value(value) = result else {
            return Ok(None);
        };
        match value {
            JsValue::Object(entries) => {
                let field = |name: &str| -> f64 {
                    entries
                        .iter()
                        .find(|(key, _)| key == name)
                        .and_then(|(_, value)| value.as_f64())
                        .unwrap_or(0.0)
                };
                Ok(Some(Rect {
                    x: field("x"),
                    y: field("y"),
                    width: field("width"),
                    height: field("height"),
                }))
            }
            _ => Ok(None),
        }
    }

    async fn get_content_quads(&self, handle: &RemoteHandle) -> Result<Option<Vec<Quad>>> {
        let result = self
            .call_function(
                &handle.realm,
                "node => [...node.getClientRects()].map(rect => \
                 [rect.left, rect.top, rect.right, rect.top, \
                  rect.right, rect.bottom, rect.left, rect.bottom])",
                Some(handle),
                Vec::new(),
                true,
            )
            .await?;
        let CallResult::Value(JsValue::Array(rects)) = result else {
            return Ok(None);
        };
        let quads = rects
            .into_iter()
            .filter_map(|rect| match rect {
                JsValue::Array(coords) if coords.len() == 8 => {
                    let c: Vec<f64> = coords.iter().filter_map(JsValue::as_f64).collect();
                    (c.len() == 8).then(|| {
                        [
                            Point { x: c[0], y: c[1] },
                            Point { x: c[2], y: c[3] },
                            Point { x: c[4], y: c[5] },
                            Point { x: c[6], y: c[7] },
                        ]
                    })
                }
                _ => None,
            })
            .collect();
        Ok(Some(quads))
    }

    async fn set_input_files(&self, handle: &RemoteHandle, paths: &[String]) -> Result<()> {
        let entry = self.realm_entry(&handle.realm)?;
        self.shared
            .session
            .send(
                "input.setFiles",
                json!({
                    "context": entry.frame.as_ref(),
                    "element": { "sharedId": handle.object_id.as_ref() },
                    "files": paths,
                }),
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
        let mut image_format = json!({
            "type": match format {
                ScreenshotFormat::Png => "image/png",
                ScreenshotFormat::Jpeg => "image/jpeg",
            },
        });
        if let Some(quality) = quality {
            // BiDi quality is 0..1.
            image_format["quality"] = json!(f64::from(quality) / 100.0);
        }
        let mut params = json!({
            "context": self.shared.context.as_ref(),
            "origin": "viewport",
            "format": image_format,
        });
        if let Some(clip) = clip {
            params["clip"] = json!({
                "type": "box",
                "x": clip.x, "y": clip.y,
                "width": clip.width, "height": clip.height,
            });
        }
        let result = self
            .shared
            .session
            .send("browsingContext.captureScreenshot", params)
            .await?;
        let data = str_field(&result, "data")?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::Protocol {
                method: "browsingContext.captureScreenshot".to_string(),
                message: format!("invalid image payload: {e}"),
            })
    }

    async fn reload(&self) -> Result<()> {
        self.shared
            .session
            .send(
                "browsingContext.reload",
                json!({ "context": self.shared.context.as_ref() }),
            )
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
        self.shared
            .session
            .send(
                "browsingContext.close",
                json!({
                    "context": self.shared.context.as_ref(),
                    "promptUnload": run_before_unload,
                }),
            )
            .await?;
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

impl BidiPage {
    async fn traverse_history(&self, delta: i64) -> Result<bool> {
        let result = self
            .shared
            .session
            .send(
                "browsingContext.traverseHistory",
                json!({ "context": self.shared.context.as_ref(), "delta": delta }),
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(Error::Protocol { message, .. })
                if message.to_ascii_lowercase().contains("history") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
