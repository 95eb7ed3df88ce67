//! The upward contract between backends and the page model.
//!
//! [`PageDelegate`] is the set of operations the protocol-agnostic page
//! layer invokes on whichever backend drives the page; [`PageEvent`] is the
//! stream of notifications a backend produces in return. Events travel over
//! a bounded channel with a single consumer, so backpressure and shutdown
//! ordering are explicit rather than hidden in a listener list.

use crate::input::{RawKeyboard, RawMouse, RawTouchscreen};
use crate::network::TrackedRequest;
use async_trait::async_trait;
use drover_protocol::{
    DocumentId, FrameId, JsValue, LifecycleEvent, Quad, RealmId, Rect, ScreenshotFormat, World,
};
use drover_runtime::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Backend-native identifier of a live remote object.
pub type RemoteObjectId = Arc<str>;

/// An owned reference to a live value in a remote realm.
///
/// Carries enough metadata to release it later; releasing twice, or after
/// the owning realm is destroyed, is a no-op.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    pub realm: RealmId,
    pub object_id: RemoteObjectId,
}

/// One argument to [`PageDelegate::call_function`]: a plain value to
/// serialize, or a handle passed by reference.
#[derive(Debug, Clone)]
pub enum CallArgument {
    Value(JsValue),
    Handle(RemoteHandle),
}

/// Result of [`PageDelegate::call_function`].
#[derive(Debug)]
pub enum CallResult {
    Value(JsValue),
    Handle(RemoteHandle),
}

/// Result of starting a navigation.
#[derive(Debug, Clone)]
pub struct GotoResult {
    /// Generation token of the document the navigation will commit, when
    /// the backend reports one. Same-document navigations have none.
    pub new_document: Option<DocumentId>,
}

/// Notifications a backend sends to the page layer, in the order the
/// underlying protocol reported them.
#[derive(Debug, Clone)]
pub enum PageEvent {
    FrameAttached {
        frame: FrameId,
        parent: Option<FrameId>,
    },
    FrameDetached {
        frame: FrameId,
    },
    /// A new document committed in the frame.
    CommittedNewDocument {
        frame: FrameId,
        url: String,
        document: DocumentId,
    },
    /// Fragment or history-API navigation; the document generation is
    /// unchanged.
    CommittedSameDocument {
        frame: FrameId,
        url: String,
    },
    Lifecycle {
        frame: FrameId,
        event: LifecycleEvent,
    },
    NavigationFailed {
        frame: FrameId,
        document: Option<DocumentId>,
        error: String,
    },
    ContextCreated {
        frame: FrameId,
        world: World,
        realm: RealmId,
    },
    ContextDestroyed {
        realm: RealmId,
    },
    RequestStarted {
        request: Arc<TrackedRequest>,
    },
    ResponseReceived {
        request: Arc<TrackedRequest>,
    },
    RequestFinished {
        request: Arc<TrackedRequest>,
    },
    RequestFailed {
        request: Arc<TrackedRequest>,
        canceled: bool,
    },
    Console {
        level: String,
        text: String,
    },
    Crashed,
    /// A failure inside an event handler, routed here instead of unwinding.
    Error {
        message: String,
    },
}

/// Depth of the per-page event queue before the backend's dispatch loop
/// blocks.
const PAGE_EVENT_QUEUE_DEPTH: usize = 1024;

/// Sending half of a page's event channel.
#[derive(Clone)]
pub struct PageEventSink {
    tx: mpsc::Sender<PageEvent>,
}

impl PageEventSink {
    /// Creates the channel pair for one page.
    pub fn channel() -> (PageEventSink, mpsc::Receiver<PageEvent>) {
        let (tx, rx) = mpsc::channel(PAGE_EVENT_QUEUE_DEPTH);
        (PageEventSink { tx }, rx)
    }

    /// Delivers an event to the page layer. If the consumer is gone the
    /// event is dropped; the page is being torn down.
    pub async fn emit(&self, event: PageEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("page event dropped: consumer gone");
        }
    }

    /// Routes an event-handler failure to the page's error channel.
    pub async fn report_error(&self, error: &drover_runtime::Error) {
        self.emit(PageEvent::Error {
            message: error.to_string(),
        })
        .await;
    }
}

/// The contract every backend implements so the page model can drive any
/// engine uniformly.
///
/// All geometry returned is CSS pixels relative to the top-level document.
/// Realm-addressed operations resolve the realm through the owning target's
/// realm table; calling into a destroyed realm fails with a stale-reference
/// error rather than hanging.
#[async_trait]
pub trait PageDelegate: Send + Sync {
    /// Starts a navigation and returns the committed-document token the
    /// backend assigned, without waiting for the load to finish.
    async fn navigate_frame(
        &self,
        frame: &FrameId,
        url: &str,
        referrer: Option<&str>,
    ) -> Result<GotoResult>;

    /// Evaluates an expression and deserializes the result into the
    /// canonical value model.
    async fn evaluate(&self, realm: &RealmId, expression: &str) -> Result<JsValue>;

    /// Evaluates an expression and takes ownership of the live result.
    async fn evaluate_handle(&self, realm: &RealmId, expression: &str) -> Result<RemoteHandle>;

    /// Calls a function declaration with a mix of plain values and handles.
    /// With `return_by_value` false the result is always a handle, even if
    /// it would serialize cleanly.
    async fn call_function(
        &self,
        realm: &RealmId,
        declaration: &str,
        this: Option<&RemoteHandle>,
        arguments: Vec<CallArgument>,
        return_by_value: bool,
    ) -> Result<CallResult>;

    /// Releases a handle. A no-op if the handle or its realm is already
    /// gone.
    async fn release_handle(&self, handle: &RemoteHandle) -> Result<()>;

    async fn get_bounding_box(&self, handle: &RemoteHandle) -> Result<Option<Rect>>;

    async fn get_content_quads(&self, handle: &RemoteHandle) -> Result<Option<Vec<Quad>>>;

    /// Sets the files of an `<input type=file>` element by path.
    async fn set_input_files(&self, handle: &RemoteHandle, paths: &[String]) -> Result<()>;

    async fn take_screenshot(
        &self,
        format: ScreenshotFormat,
        clip: Option<Rect>,
        quality: Option<u8>,
    ) -> Result<Vec<u8>>;

    async fn reload(&self) -> Result<()>;

    /// Returns false when there is no entry to go back to.
    async fn go_back(&self) -> Result<bool>;

    /// Returns false when there is no entry to go forward to.
    async fn go_forward(&self) -> Result<bool>;

    async fn close_page(&self, run_before_unload: bool) -> Result<()>;

    fn raw_mouse(&self) -> &dyn RawMouse;

    fn raw_keyboard(&self) -> &dyn RawKeyboard;

    fn raw_touchscreen(&self) -> &dyn RawTouchscreen;
}
